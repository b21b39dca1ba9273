// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Block layout mode.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the block set is managed.
///
/// - `Static`: blocks are defined by the operator; blocks that vanish from the
///   hardware inventory are left for an explicit decision.
/// - `Overlap`: like `Static`, but operator-defined blocks may overlap.
/// - `Dynamic`: blocks are created and destroyed on demand; blocks that vanish
///   from the hardware inventory are dropped immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LayoutMode {
    Static,
    Overlap,
    #[default]
    Dynamic,
}

impl fmt::Display for LayoutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static => write!(f, "static"),
            Self::Overlap => write!(f, "overlap"),
            Self::Dynamic => write!(f, "dynamic"),
        }
    }
}

impl FromStr for LayoutMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "overlap" => Ok(Self::Overlap),
            "dynamic" => Ok(Self::Dynamic),
            _ => Err(anyhow::anyhow!(
                "Invalid layout mode: '{}'. Valid options are: 'static', 'overlap', 'dynamic'",
                s
            )),
        }
    }
}

impl LayoutMode {
    /// Check if this mode is dynamic
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Dynamic)
    }
}
