//! Server configuration. CLI flags and the `FAKTORY_PASSWORD` environment
//! variable are the whole configuration surface -- TOML config-file parsing
//! is an explicit non-goal (spec.md §1), handled by an external tool if one
//! is ever built on top of this crate.

use crate::manager::{DEFAULT_DEAD_MAX_AGE_DAYS, DEFAULT_DEAD_MAX_SIZE};

pub const DEFAULT_BIND: &str = "localhost:7419";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub password: Option<String>,
    pub dead_set_max_size: u64,
    pub dead_set_max_age_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            password: None,
            dead_set_max_size: DEFAULT_DEAD_MAX_SIZE,
            dead_set_max_age_days: DEFAULT_DEAD_MAX_AGE_DAYS,
        }
    }
}
