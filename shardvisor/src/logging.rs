//! Tracing subscriber setup shared by both binaries.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Level shortcut used when `RUST_LOG` is unset.
pub const ENV_LOG: &str = "SHARDVISOR_LOG";

fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn default_directives(level: &str) -> String {
    format!("shardvisor={level},shardvisor::bridge::codec=warn")
}

/// Install the global subscriber, writing to stderr.
///
/// `RUST_LOG` wins when set. Otherwise `SHARDVISOR_LOG` picks the crate's level.
/// `LOG_FORMAT=json` switches to JSON lines. Calling twice is harmless.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var(ENV_LOG).ok().as_deref());
        EnvFilter::new(default_directives(level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
