// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control-system bridge configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Settings handed to the control-system bridge.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
pub struct BridgeConfig {
    /// Properties file passed to the bridge at initialization.
    /// None = bridge default.
    pub properties_file: Option<PathBuf>,

    /// File the bridge API log is written to.
    /// None = bridge API logging stays on the main log.
    pub api_log_file: Option<PathBuf>,

    /// Verbosity of the bridge API log.
    /// 0 off, 1 fatal, 2 error, 3 warn, 4 info, 5 debug, 6 trace, 7 all.
    #[validate(range(max = 7))]
    #[serde(default)]
    pub api_log_level: u8,
}
