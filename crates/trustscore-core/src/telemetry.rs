//! Log output for the `trustscore` binary.
//!
//! Logs go to stderr; stdout carries reports and progress lines only.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter directives for TrustScore, checked before `RUST_LOG`.
pub const ENV_LOG: &str = "TRUSTSCORE_LOG";

/// HTTP client crates that log every connection at debug.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls"];

/// Default directives for `level`, with HTTP internals held at `warn`.
pub fn default_directives(level: Level) -> String {
    let mut directives = level.as_str().to_ascii_lowercase();
    for target in QUIET_TARGETS {
        directives.push_str(&format!(",{target}=warn"));
    }
    directives
}

/// Pick filter directives: `TRUSTSCORE_LOG`, then `RUST_LOG`, then defaults.
pub fn filter_directives<F>(lookup: F, level: Level) -> String
where
    F: Fn(&str) -> Option<String>,
{
    [ENV_LOG, "RUST_LOG"]
        .into_iter()
        .filter_map(|var| lookup(var))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| default_directives(level))
}

/// Install the global subscriber. Only the first call in a process counts.
pub fn init_tracing(json: bool, level: Level) {
    let directives = filter_directives(|var| std::env::var(var).ok(), level);
    let env_filter = EnvFilter::try_new(&directives)
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_quiet_http_internals() {
        let directives = default_directives(Level::DEBUG);
        assert!(directives.starts_with("debug,"));
        assert!(directives.contains("reqwest=warn"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn trustscore_log_wins_over_rust_log() {
        let picked = filter_directives(
            |var| match var {
                ENV_LOG => Some("trustscore_core=trace".to_string()),
                "RUST_LOG" => Some("info".to_string()),
                _ => None,
            },
            Level::WARN,
        );
        assert_eq!(picked, "trustscore_core=trace");

        let picked = filter_directives(
            |var| (var == "RUST_LOG").then(|| "error".to_string()),
            Level::WARN,
        );
        assert_eq!(picked, "error");

        let picked = filter_directives(|var| (var == ENV_LOG).then(String::new), Level::INFO);
        assert_eq!(picked, default_directives(Level::INFO));
    }

    #[test]
    fn init_twice_is_harmless() {
        init_tracing(false, Level::WARN);
        init_tracing(true, Level::DEBUG);
        tracing::warn!("still logging");
    }
}
