// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Polling intervals for job draining and inventory reconciliation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PollConfig {
    /// Interval between `list_jobs_on_block` polls while waiting for
    /// hardware jobs to drain after a scheduler job ends.
    #[validate(range(min = 1))]
    pub job_poll_interval_ms: u64,

    /// Give up waiting for hardware jobs after this long and drain the
    /// block's nodes instead. None = wait forever.
    #[validate(range(min = 1))]
    pub job_drain_timeout_secs: Option<u64>,

    /// Interval between inventory reconciliations.
    #[validate(range(min = 1))]
    pub reconcile_interval_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            job_poll_interval_ms: 3000,
            job_drain_timeout_secs: Some(600),
            reconcile_interval_secs: 5,
        }
    }
}

impl PollConfig {
    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms)
    }

    pub fn job_drain_timeout(&self) -> Option<Duration> {
        self.job_drain_timeout_secs.map(Duration::from_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_durations() {
        let config = PollConfig::default();
        assert_eq!(config.job_poll_interval(), Duration::from_secs(3));
        assert_eq!(config.job_drain_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.reconcile_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = PollConfig {
            job_poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
