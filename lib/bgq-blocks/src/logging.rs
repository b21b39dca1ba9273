// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! - Configuration loaded from:
//!   1. Environment variables (highest priority).
//!   2. Optional TOML file pointed to by the `BGQ_LOGGING_CONFIG_PATH` environment variable.
//!   3. `/etc/slurm/bgq-logging.toml`.
//!
//! Output is either readable (compact) or JSONL, selected by setting
//! `BGQ_LOGGING_JSONL` to `1`. Timestamps are UTC unless `BGQ_LOG_USE_LOCAL_TZ`
//! is set.
//!
//! Filters come from the `BGQ_LOG` environment variable or the `log_filters`
//! table of the configuration file. The default level is `info`.
//!
//! ```toml
//! log_level = "warn"
//!
//! [log_filters]
//! "bgq_blocks::reconcile" = "debug"
//! ```
//!
//! Control-system calls log under [`FACADE_TARGET`]. The bridge's
//! `api_log_level` (0 off, 7 everything) sets the level of that target, either
//! in the main output or, when `api_log_file` is set, in a separate file.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::sync::{Arc, Once};

use bgq_config::BridgeConfig;
use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::{Directive, Targets};
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::facade::FACADE_TARGET;

/// ENV used to set the log level
const FILTER_ENV: &str = "BGQ_LOG";

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// ENV used to set the path to the logging configuration file
const CONFIG_PATH_ENV: &str = "BGQ_LOGGING_CONFIG_PATH";

const SYSTEM_CONFIG_PATH: &str = "/etc/slurm/bgq-logging.toml";

const JSONL_ENV: &str = "BGQ_LOGGING_JSONL";

const LOCAL_TZ_ENV: &str = "BGQ_LOG_USE_LOCAL_TZ";

const DISABLE_ANSI_ENV: &str = "BGQ_LOG_DISABLE_ANSI";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::from([("figment".to_string(), "warn".to_string())]),
        }
    }
}

/// Initialize the logger
pub fn init() {
    INIT.call_once(|| setup_logging(None));
}

/// Initialize the logger with control-system call logging configured from
/// `bridge`.
pub fn init_with(bridge: &BridgeConfig) {
    INIT.call_once(|| setup_logging(Some(bridge)));
}

/// Level of the control-system target for an `api_log_level` value.
pub fn api_level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::OFF,
        1 | 2 => LevelFilter::ERROR,
        3 => LevelFilter::WARN,
        4 => LevelFilter::INFO,
        5 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn env_is_truthy(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref().map(str::to_ascii_lowercase).as_deref(),
        Ok("1" | "true" | "on" | "yes")
    )
}

fn setup_logging(bridge: Option<&BridgeConfig>) {
    let filter_layer = filters(load_config(), bridge);
    let result = if env_is_truthy(JSONL_ENV) {
        let l = fmt::layer()
            .json()
            .with_ansi(false)
            .with_timer(TimeFormatter::new())
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry()
            .with(bridge.and_then(api_log_layer::<Registry>))
            .with(l)
            .try_init()
    } else {
        let l = fmt::layer()
            .with_ansi(!env_is_truthy(DISABLE_ANSI_ENV))
            .event_format(fmt::format().compact().with_timer(TimeFormatter::new()))
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry()
            .with(bridge.and_then(api_log_layer::<Registry>))
            .with(l)
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("Failed installing the tracing subscriber: {e}");
    }
}

fn filters(config: LoggingConfig, bridge: Option<&BridgeConfig>) -> EnvFilter {
    let default_level = config
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or_else(|e| {
            eprintln!("Invalid log level '{}': {e}", config.log_level);
            LevelFilter::INFO
        });
    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    // apply the log_filters from the config files
    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }

    // without a separate file, control-system calls go to the main output
    if let Some(bridge) = bridge.filter(|b| b.api_log_file.is_none() && b.api_log_level > 0) {
        let level = api_level_filter(bridge.api_log_level);
        match format!("{FACADE_TARGET}={level}").parse::<Directive>() {
            Ok(d) => filter_layer = filter_layer.add_directive(d),
            Err(e) => eprintln!("Failed parsing API log level {}: {e}", bridge.api_log_level),
        }
    }
    filter_layer
}

fn api_log_layer<S>(bridge: &BridgeConfig) -> Option<impl Layer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let path = bridge.api_log_file.as_ref()?;
    let level = api_level_filter(bridge.api_log_level);
    if level == LevelFilter::OFF {
        return None;
    }
    let file = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Failed opening API log file {}: {e}", path.display());
            return None;
        }
    };
    Some(
        fmt::layer()
            .with_ansi(false)
            .with_timer(TimeFormatter::new())
            .with_writer(Arc::new(file))
            .with_filter(Targets::new().with_target(FACADE_TARGET, level)),
    )
}

fn load_config() -> LoggingConfig {
    let mut figment = Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file(SYSTEM_CONFIG_PATH));
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        figment = figment.merge(Toml::file(path));
    }

    figment.extract().unwrap_or_else(|e| {
        eprintln!("Invalid logging configuration, using defaults: {e}");
        LoggingConfig::default()
    })
}

struct TimeFormatter {
    use_local_tz: bool,
}

impl TimeFormatter {
    fn new() -> Self {
        Self {
            use_local_tz: env_is_truthy(LOCAL_TZ_ENV),
        }
    }

    fn format_now(&self) -> String {
        if self.use_local_tz {
            chrono::Local::now()
                .format("%Y-%m-%dT%H:%M:%S%.3f%:z")
                .to_string()
        } else {
            chrono::Utc::now()
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string()
        }
    }
}

impl FormatTime for TimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", self.format_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    #[rstest]
    #[case(0, LevelFilter::OFF)]
    #[case(1, LevelFilter::ERROR)]
    #[case(2, LevelFilter::ERROR)]
    #[case(3, LevelFilter::WARN)]
    #[case(4, LevelFilter::INFO)]
    #[case(5, LevelFilter::DEBUG)]
    #[case(6, LevelFilter::TRACE)]
    #[case(7, LevelFilter::TRACE)]
    fn test_api_level_filter(#[case] level: u8, #[case] expected: LevelFilter) {
        assert_eq!(api_level_filter(level), expected);
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "log_level = \"warn\"\n\n[log_filters]\n\"bgq_blocks::reconcile\" = \"debug\""
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = temp_env::with_var(CONFIG_PATH_ENV, Some(path), load_config);
        assert_eq!(config.log_level, "warn");
        assert_eq!(
            config.log_filters.get("bgq_blocks::reconcile").map(String::as_str),
            Some("debug")
        );
        // defaults are merged, not replaced
        assert!(config.log_filters.contains_key("figment"));
    }

    #[test]
    fn test_facade_directive_without_file() {
        let bridge = BridgeConfig {
            api_log_level: 5,
            ..Default::default()
        };
        let filter = temp_env::with_var_unset(FILTER_ENV, || {
            filters(LoggingConfig::default(), Some(&bridge))
        });
        assert!(filter.to_string().contains("bgq_blocks::facade=debug"));
    }

    #[test]
    fn test_no_facade_directive_with_file_or_level_zero() {
        let silent = BridgeConfig::default();
        let to_file = BridgeConfig {
            api_log_level: 7,
            api_log_file: Some("/tmp/bgq-api.log".into()),
            ..Default::default()
        };
        for bridge in [silent, to_file] {
            let filter = temp_env::with_var_unset(FILTER_ENV, || {
                filters(LoggingConfig::default(), Some(&bridge))
            });
            assert!(!filter.to_string().contains(FACADE_TARGET));
        }
    }

    #[test]
    fn test_invalid_level_falls_back() {
        let config = LoggingConfig {
            log_level: "loud".to_string(),
            log_filters: HashMap::new(),
        };
        let filter = temp_env::with_var_unset(FILTER_ENV, || filters(config, None));
        let rendered = filter.to_string();
        assert!(rendered.contains("info"));
        assert!(!rendered.contains("loud"));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn test_level_sets_default() {
        let config = LoggingConfig {
            log_level: "debug".to_string(),
            log_filters: HashMap::new(),
        };
        let filter = temp_env::with_var_unset(FILTER_ENV, || filters(config, None));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }
}
