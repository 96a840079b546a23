//! `ExecutorConfig` (§6 ADD): the programmatic builder is primary, with an
//! `from_env()` convenience constructor mirroring the teacher's
//! `SEQ_WATCHDOG_*`/`SEQ_STACK_SIZE` env-driven knobs (`scheduler.rs`,
//! `watchdog.rs`).

use std::time::Duration;

/// Controls template and macro-body caching (§6, §4.4 "Template caching").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizationLevel {
    #[default]
    None,
    Basic,
}

impl OptimizationLevel {
    fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "basic" => OptimizationLevel::Basic,
            _ => OptimizationLevel::None,
        }
    }
}

/// What to do when the watchdog finds a fiber stuck past its threshold
/// (teacher's `WatchdogAction`, retargeted from "strand" to "fiber").
#[derive(Clone)]
pub enum WatchdogAction {
    Warn,
    Callback(std::sync::Arc<dyn Fn(u64, u64) + Send + Sync>),
}

impl std::fmt::Debug for WatchdogAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchdogAction::Warn => write!(f, "WatchdogAction::Warn"),
            WatchdogAction::Callback(_) => write!(f, "WatchdogAction::Callback(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub threshold: Duration,
    pub check_interval: Duration,
    pub action: WatchdogAction,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(30),
            check_interval: Duration::from_secs(5),
            action: WatchdogAction::Warn,
        }
    }
}

/// Executor-wide configuration (§6 ADD). `default_token_timeout` is the
/// five-minute deadline named in §3's `Token` record.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub default_token_timeout: Duration,
    pub optimization_level: OptimizationLevel,
    pub watchdog: Option<WatchdogConfig>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_token_timeout: Duration::from_secs(5 * 60),
            optimization_level: OptimizationLevel::None,
            watchdog: None,
        }
    }
}

impl ExecutorConfig {
    /// Read `PAWSCRIPT_TOKEN_TIMEOUT_SECS`, `PAWSCRIPT_OPT_LEVEL`,
    /// `PAWSCRIPT_WATCHDOG_SECS`. Unset or unparsable values fall back to
    /// the programmatic defaults, matching the teacher's
    /// `parse_stack_size` "warn and use default" behavior rather than
    /// failing the whole config.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_u64("PAWSCRIPT_TOKEN_TIMEOUT_SECS") {
            config.default_token_timeout = Duration::from_secs(secs);
        }

        if let Ok(level) = std::env::var("PAWSCRIPT_OPT_LEVEL") {
            config.optimization_level = OptimizationLevel::from_str(&level);
        }

        if let Some(secs) = env_u64("PAWSCRIPT_WATCHDOG_SECS") {
            if secs > 0 {
                config.watchdog = Some(WatchdogConfig {
                    threshold: Duration::from_secs(secs),
                    ..WatchdogConfig::default()
                });
            }
        }

        config
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}
