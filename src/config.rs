//! Engine-wide configuration and the `"100ms"`/`"30s"`/`"5m"`-style
//! duration parser every spec/policy field uses.
//!
//! Grounded on the teacher's `config.rs`: the same `config` crate layered
//! load order (defaults -> file -> env), trimmed from its per-subcommand
//! `RunConfig`/`ValidateConfig`/`VisualizeConfig` split down to the
//! engine-wide defaults this spec names (task timeout, sub-workflow depth,
//! retry/circuit-breaker/cache defaults).

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default task timeout when a task spec names none.
    #[serde(default = "default_task_timeout")]
    pub default_task_timeout: String,

    /// Maximum sub-workflow call-stack depth before `DepthExceeded`.
    #[serde(default = "default_max_depth")]
    pub max_subworkflow_depth: u32,

    /// Default bound on `forEach` fan-out concurrency when a step doesn't
    /// set `max_concurrency`.
    #[serde(default = "default_for_each_concurrency")]
    pub default_for_each_concurrency: usize,

    #[serde(default)]
    pub verbose: bool,
}

fn default_task_timeout() -> String {
    "30s".to_string()
}
fn default_max_depth() -> u32 {
    10
}
fn default_for_each_concurrency() -> usize {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_task_timeout: default_task_timeout(),
            max_subworkflow_depth: default_max_depth(),
            default_for_each_concurrency: default_for_each_concurrency(),
            verbose: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration with precedence: env (`FLOWGRAPH__*`) > config
    /// file (`flowgraph.yaml`) > defaults.
    ///
    /// # Errors
    /// Returns a `config::ConfigError` if the file or environment
    /// overrides don't deserialize into [`EngineConfig`].
    pub fn load() -> std::result::Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default())?)
            .add_source(config::File::with_name("flowgraph").format(config::FileFormat::Yaml).required(false))
            .add_source(config::Environment::with_prefix("FLOWGRAPH").separator("__").try_parsing(true));

        builder.build()?.try_deserialize()
    }
}

/// Parse a `"100ms"`/`"30s"`/`"5m"`/`"1h"`-style duration string.
///
/// # Errors
/// Returns an error message when the string has no recognized unit
/// suffix or the numeric portion doesn't parse.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let (num_part, unit) = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .map(|i| s.split_at(i))
        .ok_or_else(|| format!("duration '{s}' has no unit suffix"))?;

    let num: f64 = num_part.parse().map_err(|_| format!("invalid duration number in '{s}'"))?;

    let millis = match unit {
        "ms" => num,
        "s" => num * 1_000.0,
        "m" => num * 60_000.0,
        "h" => num * 3_600_000.0,
        other => return Err(format!("unknown duration unit '{other}' in '{s}'")),
    };

    Ok(Duration::from_millis(millis as u64))
}
