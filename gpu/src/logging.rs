//! Logging configuration for lattice
//!
//! The core logs through the `log` facade and never installs a logger on its
//! own. Embedders either inject their own sink with [`init_with_sink`] or use
//! the bundled `env_logger` setup below.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lattice_gpu::logging;
//!
//! // Initialize with default level (Warn)
//! logging::init();
//!
//! // Or initialize from RUST_LOG environment variable
//! logging::init_from_env();
//!
//! // Or initialize with a specific level
//! logging::init_with_level(log::LevelFilter::Debug);
//! ```
//!
//! # Log Levels
//!
//! - `error!` - Backend failures surfaced by queues and factories
//! - `warn!` - Non-compliant devices, waits on destroyed fences, restarted profiling
//! - `info!` - Context creation, selected backend and device count
//! - `debug!` - Resource creation, function cache hits, command submission
//! - `trace!` - Per-command execution on host queues
//!
//! # Environment Variable
//!
//! ```bash
//! RUST_LOG=info lattice devices
//! RUST_LOG=lattice_gpu::host=trace lattice devices
//! ```

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize logging with sensible defaults (Warn level).
///
/// This only initializes once; subsequent calls are no-ops.
pub fn init() {
    init_with_level(LevelFilter::Warn);
}

/// Initialize logging with a specific level.
///
/// This only initializes once; subsequent calls are no-ops.
pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        let _ = Builder::new()
            .filter_level(level)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{:5}] {} - {}",
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .try_init();
    });
}

/// Initialize logging from the RUST_LOG environment variable.
///
/// If RUST_LOG is not set, defaults to Warn level.
pub fn init_from_env() {
    INIT.call_once(|| {
        let _ =
            Builder::from_env(env_logger::Env::default().default_filter_or("warn")).try_init();
    });
}

/// Install an embedder-provided sink.
///
/// Fails if a logger was already installed, by this module or anyone else.
pub fn init_with_sink(
    sink: Box<dyn log::Log>,
    level: LevelFilter,
) -> Result<(), log::SetLoggerError> {
    log::set_boxed_logger(sink)?;
    log::set_max_level(level);
    INIT.call_once(|| {});
    Ok(())
}

/// Initialize logging for tests.
///
/// Suppresses most output unless RUST_LOG is explicitly set.
pub fn init_test() {
    // try_init() doesn't panic if already initialized
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Warn)
        .is_test(true)
        .try_init();
}

/// Check if one of the `init*` functions ran.
pub fn is_initialized() -> bool {
    INIT.is_completed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_test();
        init_test();
        init_test();
    }

    #[test]
    fn test_log_levels() {
        init_test();

        log::error!("Test error message");
        log::warn!("Test warning message");
        log::info!("Test info message");
        log::debug!("Test debug message");
    }
}
