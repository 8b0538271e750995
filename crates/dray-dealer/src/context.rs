//! Root-owned resources shared by dealer subsystems.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;

use crate::config::Config;
use crate::error::DealerError;
use crate::logging;

/// One context per dealer: the parsed configuration plus the logging sink
/// guard. Subsystems receive it as a shared handle; shutdown is initiated
/// top-down so nothing needs a pointer back.
pub struct Context {
    config: Config,
    _log_guard: Option<WorkerGuard>,
}

impl Context {
    pub fn new(config_path: &Path) -> Result<Context, DealerError> {
        let config = Config::load(config_path)?;
        let log_guard = logging::init(&config.logger);
        Ok(Context {
            config,
            _log_guard: log_guard,
        })
    }

    /// Build a context around an already-parsed config, leaving the global
    /// subscriber alone. Used by tests.
    pub fn from_config(config: Config) -> Context {
        Context {
            config,
            _log_guard: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
