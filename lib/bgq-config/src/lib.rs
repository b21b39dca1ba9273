// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Blue Gene/Q block allocator configuration.
//!
//! Provides centralized configuration for the machine geometry, the block
//! layout policy, polling intervals and the control-system bridge.

mod bridge;
mod layout;
mod machine;
mod poll;

pub use bridge::BridgeConfig;
pub use layout::LayoutMode;
pub use machine::{MachineConfig, MAX_IONODES_PER_MIDPLANE};
pub use poll::PollConfig;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    value::{Dict, Map},
    Figment, Metadata, Profile, Provider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

/// Top-level keys that can be set directly through `BGQ_<KEY>`.
const TOP_LEVEL_ENV_KEYS: &[&str] = &[
    "layout",
    "sub_midplane_system",
    "block_prefix",
    "scheduler_user",
    "boot_image",
    "recover",
];

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Configuration error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BgqConfig {
    #[validate(nested)]
    #[serde(default)]
    pub machine: MachineConfig,

    #[serde(default)]
    pub layout: LayoutMode,

    #[validate(nested)]
    #[serde(default)]
    pub poll: PollConfig,

    #[validate(nested)]
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// The machine is a partial (sub-midplane) system where some hardware is
    /// legitimately absent. Block creation failures are then tolerated.
    #[serde(default)]
    pub sub_midplane_system: bool,

    /// Name prefix of the blocks this scheduler manages.
    #[validate(length(min = 1))]
    pub block_prefix: String,

    /// Scheduler service account. Never added to or removed from a block.
    #[validate(length(min = 1))]
    pub scheduler_user: String,

    /// Default micro-loader boot image for new blocks.
    #[serde(default)]
    pub boot_image: Option<String>,

    /// Recover full block details from the hardware inventory on startup.
    pub recover: bool,
}

impl Default for BgqConfig {
    fn default() -> Self {
        Self {
            machine: MachineConfig::default(),
            layout: LayoutMode::default(),
            poll: PollConfig::default(),
            bridge: BridgeConfig::default(),
            sub_midplane_system: false,
            block_prefix: "RMP".to_string(),
            scheduler_user: "slurm".to_string(),
            boot_image: None,
            recover: true,
        }
    }
}

impl BgqConfig {
    /// Create a Figment configuration with all sources merged.
    ///
    /// Configuration sources in priority order (lowest to highest):
    /// 1. Code defaults
    /// 2. System config file at /etc/slurm/bgq.toml
    /// 3. TOML file from BGQ_CONFIG_PATH environment variable
    /// 4. Environment variables (BGQ_* prefixed)
    pub fn figment() -> Figment {
        let config_path = std::env::var("BGQ_CONFIG_PATH").unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(BgqConfig::default()))
            .merge(Toml::file("/etc/slurm/bgq.toml"))
            .merge(Toml::file(&config_path))
            // Machine config: BGQ_MACHINE_IONODES_PER_MIDPLANE, BGQ_MACHINE_NODE_PREFIX, etc.
            .merge(
                Env::prefixed("BGQ_MACHINE_")
                    .map(|k| format!("machine.{}", k.as_str().to_lowercase()).into()),
            )
            // Poll config: BGQ_POLL_JOB_POLL_INTERVAL_MS, BGQ_POLL_RECONCILE_INTERVAL_SECS, etc.
            .merge(
                Env::prefixed("BGQ_POLL_")
                    .map(|k| format!("poll.{}", k.as_str().to_lowercase()).into()),
            )
            // Bridge config: BGQ_BRIDGE_PROPERTIES_FILE, BGQ_BRIDGE_API_LOG_LEVEL, etc.
            .merge(
                Env::prefixed("BGQ_BRIDGE_")
                    .map(|k| format!("bridge.{}", k.as_str().to_lowercase()).into()),
            )
            // Top-level: BGQ_LAYOUT, BGQ_SUB_MIDPLANE_SYSTEM, BGQ_BLOCK_PREFIX, etc.
            .merge(Env::prefixed("BGQ_").only(TOP_LEVEL_ENV_KEYS))
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract configuration from any provider and validate it.
    ///
    /// # Example
    /// ```rust,ignore
    /// let config = BgqConfig::extract_from(
    ///     BgqConfig::figment()
    ///         .merge(("layout", "static"))
    ///         .merge(("machine.ionodes_per_midplane", 8u16))
    /// )?;
    /// ```
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        config.machine.check_ratios()?;
        Ok(config)
    }

    /// Build a figment from defaults, then merge a custom provider.
    pub fn figment_with<T: Provider>(extra: T) -> Figment {
        Self::figment().merge(extra)
    }

    /// Load configuration merging JSON overrides with the highest priority.
    pub fn from_figment_with_json(json: &str) -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment().merge(Json::string(json)))
    }
}

/// Lets the config itself act as a provider so dependent components can
/// extract their own view from the same Figment.
impl Provider for BgqConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("BgqConfig")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENV_VARS: &[&str] = &[
        "BGQ_CONFIG_PATH",
        "BGQ_LAYOUT",
        "BGQ_SUB_MIDPLANE_SYSTEM",
        "BGQ_MACHINE_IONODES_PER_MIDPLANE",
        "BGQ_POLL_JOB_POLL_INTERVAL_MS",
    ];

    #[test]
    fn test_default_config() {
        let config = BgqConfig::default();
        assert_eq!(config.layout, LayoutMode::Dynamic);
        assert_eq!(config.block_prefix, "RMP");
        assert_eq!(config.scheduler_user, "slurm");
        assert!(!config.sub_midplane_system);
        assert!(config.recover);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_figment_defaults() {
        temp_env::with_vars_unset(ENV_VARS.to_vec(), || {
            let config = BgqConfig::from_env().unwrap();
            assert_eq!(config.machine.nodecards_per_midplane, 16);
            assert_eq!(config.poll.job_poll_interval_ms, 3000);
        });
    }

    #[test]
    fn test_env_override_sections() {
        temp_env::with_vars(
            vec![
                ("BGQ_MACHINE_IONODES_PER_MIDPLANE", Some("8")),
                ("BGQ_POLL_JOB_POLL_INTERVAL_MS", Some("250")),
                ("BGQ_LAYOUT", Some("static")),
                ("BGQ_SUB_MIDPLANE_SYSTEM", Some("true")),
            ],
            || {
                let config = BgqConfig::from_env().unwrap();
                assert_eq!(config.machine.ionodes_per_midplane, 8);
                assert_eq!(config.poll.job_poll_interval_ms, 250);
                assert_eq!(config.layout, LayoutMode::Static);
                assert!(config.sub_midplane_system);
            },
        );
    }

    #[test]
    fn test_extract_from_with_tuple_override() {
        temp_env::with_vars_unset(ENV_VARS.to_vec(), || {
            let figment = BgqConfig::figment_with(("block_prefix", "BLK"));
            let config = BgqConfig::extract_from(figment).unwrap();
            assert_eq!(config.block_prefix, "BLK");
        });
    }

    #[test]
    fn test_from_figment_with_json() {
        temp_env::with_vars_unset(ENV_VARS.to_vec(), || {
            let json = r#"{"layout": "overlap", "machine": {"cpus_per_cnode": 64}}"#;
            let config = BgqConfig::from_figment_with_json(json).unwrap();
            assert_eq!(config.layout, LayoutMode::Overlap);
            assert_eq!(config.machine.cpus_per_cnode, 64);
        });
    }

    #[test]
    fn test_json_overrides_env() {
        temp_env::with_vars(vec![("BGQ_LAYOUT", Some("static"))], || {
            let config = BgqConfig::from_figment_with_json(r#"{"layout": "dynamic"}"#).unwrap();
            assert_eq!(config.layout, LayoutMode::Dynamic);
        });
    }

    #[test]
    fn test_bad_ratio_is_rejected() {
        temp_env::with_vars_unset(ENV_VARS.to_vec(), || {
            let json = r#"{"machine": {"ionodes_per_midplane": 5}}"#;
            let err = BgqConfig::from_figment_with_json(json).unwrap_err();
            assert!(matches!(err, ConfigError::Other(_)));
        });
    }

    #[test]
    fn test_validation_failure() {
        temp_env::with_vars_unset(ENV_VARS.to_vec(), || {
            let json = r#"{"bridge": {"api_log_level": 12}}"#;
            let err = BgqConfig::from_figment_with_json(json).unwrap_err();
            assert!(matches!(err, ConfigError::Validation(_)));
        });
    }

    #[test]
    fn test_config_as_provider() {
        let original = BgqConfig {
            layout: LayoutMode::Static,
            block_prefix: "TST".to_string(),
            ..Default::default()
        };

        let figment = Figment::from(&original);
        let extracted: BgqConfig = figment.extract().unwrap();

        assert_eq!(extracted.layout, LayoutMode::Static);
        assert_eq!(extracted.block_prefix, "TST");
    }
}
