pub mod agent;
pub mod checks;
pub mod config;
pub mod error;
pub mod interrupt;
pub mod issue;
pub mod pipeline;
pub mod queue;
pub mod report;
pub mod tracker;
pub mod vcs;
pub mod worktree;

pub use error::{AutofixError, ErrorCode, Result};

use tracing::info;

/// Initialise a default tracing subscriber for the library consumer.
///
/// Call this once at program start. Uses `RUST_LOG` env var for filtering,
/// defaulting to `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).init();

    info!("autofix tracing initialised");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = AutofixError::Config("missing field".into());
        assert_eq!(err.to_string(), "config error: missing field");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let autofix_err: AutofixError = io_err.into();
        assert!(matches!(autofix_err, AutofixError::Io(_)));
    }
}
