//! Config-driven tracing sink selection.
//!
//! Logging is advisory: nothing in the runtime branches on it, and failing
//! to install a subscriber (for instance because the host application
//! already installed one) is not an error.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::{LoggerConfig, LoggerKind};

/// Install the configured sink as the global subscriber.
///
/// Returns a guard that must stay alive for the FILE sink to keep
/// flushing. The SYSLOG sink has no ecosystem backing here and degrades to
/// stdout with a warning.
pub fn init(config: &LoggerConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::builder()
        .with_default_directive(config.level().into())
        .from_env_lossy();

    match config.kind {
        LoggerKind::Stdout | LoggerKind::Syslog => {
            let installed = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .try_init()
                .is_ok();
            if installed && config.kind == LoggerKind::Syslog {
                tracing::warn!("syslog sink is not available, logging to stdout");
            }
            None
        }
        LoggerKind::File => {
            let path = config
                .file_path
                .clone()
                .unwrap_or_else(|| "dray.log".into());
            let directory = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_owned(),
                _ => ".".into(),
            };
            let file_name = path
                .file_name()
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| "dray.log".into());

            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init();
            Some(guard)
        }
    }
}
