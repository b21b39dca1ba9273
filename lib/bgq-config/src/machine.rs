// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Physical machine configuration.
//!
//! Describes how a midplane is subdivided into nodeboards, I/O nodes and
//! compute nodes. The torus extents themselves come from the control system.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Upper bound on I/O nodes per midplane (one bit each in the occupancy map).
pub const MAX_IONODES_PER_MIDPLANE: u16 = 64;

/// Per-midplane hardware geometry.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MachineConfig {
    /// Nodeboards (nodecards) per midplane.
    #[validate(range(min = 1, max = 64))]
    pub nodecards_per_midplane: u16,

    /// I/O nodes per midplane.
    /// Must divide, or be divisible by, `nodecards_per_midplane`.
    #[validate(range(min = 1, max = 64))]
    pub ionodes_per_midplane: u16,

    /// Compute nodes on a single nodeboard.
    #[validate(range(min = 1))]
    pub cnodes_per_nodecard: u32,

    /// CPUs reported per compute node.
    #[validate(range(min = 1))]
    pub cpus_per_cnode: u32,

    /// Prefix of the scheduler node names (`bgq0000`, `bgq[0000x0011]`).
    #[validate(length(min = 1))]
    pub node_prefix: String,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            nodecards_per_midplane: 16,
            ionodes_per_midplane: 4,
            cnodes_per_nodecard: 32,
            cpus_per_cnode: 16,
            node_prefix: "bgq".to_string(),
        }
    }
}

impl MachineConfig {
    /// Compute nodes in one full midplane.
    pub fn cnodes_per_midplane(&self) -> u32 {
        self.nodecards_per_midplane as u32 * self.cnodes_per_nodecard
    }

    /// Check the nodecard/I/O-node ratio.
    ///
    /// Small blocks are carved out of the I/O-node index space, so one of the
    /// two counts has to be a whole multiple of the other.
    pub fn check_ratios(&self) -> anyhow::Result<()> {
        let nc = self.nodecards_per_midplane;
        let io = self.ionodes_per_midplane;
        if io > MAX_IONODES_PER_MIDPLANE {
            anyhow::bail!(
                "ionodes_per_midplane ({io}) exceeds the supported maximum of {MAX_IONODES_PER_MIDPLANE}"
            );
        }
        if nc % io != 0 && io % nc != 0 {
            anyhow::bail!(
                "nodecards_per_midplane ({nc}) and ionodes_per_midplane ({io}) must divide one another"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_machine() {
        let config = MachineConfig::default();
        assert_eq!(config.cnodes_per_midplane(), 512);
        assert!(config.validate().is_ok());
        assert!(config.check_ratios().is_ok());
    }

    #[rstest]
    #[case(16, 4, true)]
    #[case(16, 16, true)]
    #[case(16, 32, true)]
    #[case(16, 1, true)]
    #[case(16, 5, false)]
    #[case(12, 8, false)]
    fn test_ratio_check(#[case] nodecards: u16, #[case] ionodes: u16, #[case] ok: bool) {
        let config = MachineConfig {
            nodecards_per_midplane: nodecards,
            ionodes_per_midplane: ionodes,
            ..Default::default()
        };
        assert_eq!(config.check_ratios().is_ok(), ok);
    }

    #[test]
    fn test_zero_nodecards_rejected() {
        let config = MachineConfig {
            nodecards_per_midplane: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
