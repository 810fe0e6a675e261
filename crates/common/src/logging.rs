//! Logging setup and configuration
//!
//! The relay writers and readers log per packet at trace/debug, so the
//! default filter scopes `default_level` to the usb-mitm crates and keeps
//! every dependency at `warn`. A `RUST_LOG` environment filter overrides
//! the whole thing when set.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Crates the configured level applies to
const WORKSPACE_TARGETS: &[&str] = &["usb_mitm", "relay", "model", "common"];

fn default_directives(default_level: &str) -> String {
    let mut directives = String::from("warn");
    for target in WORKSPACE_TARGETS {
        directives.push(',');
        directives.push_str(target);
        directives.push('=');
        directives.push_str(default_level);
    }
    directives
}

/// Setup tracing subscriber for the relay
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directives(default_level)).map_err(|e| {
            crate::Error::Config(format!("invalid log level '{}': {}", default_level, e))
        })?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    Ok(())
}
