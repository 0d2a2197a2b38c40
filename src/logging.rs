//! Tracing subscriber setup shared by both binaries

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber
///
/// `RUST_LOG` wins when set; otherwise `verbose` picks debug over info.
/// `json` switches to one JSON object per event. Output goes to stderr so
/// command output on stdout stays clean. Calling this twice is harmless.
pub fn init(verbose: bool, json: bool) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = filter_for(verbose, rust_log.as_deref());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.with_target(false).try_init()
    };
}

fn filter_for(verbose: bool, rust_log: Option<&str>) -> EnvFilter {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    EnvFilter::builder()
        .with_default_directive(level.into())
        .parse_lossy(rust_log.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_level() {
        assert_eq!(filter_for(false, None).to_string(), "info");
        assert_eq!(filter_for(true, None).to_string(), "debug");
        assert_eq!(filter_for(false, Some("")).to_string(), "info");
    }

    #[test]
    fn test_rust_log_overrides_default() {
        let filter = filter_for(false, Some("trace")).to_string();
        assert!(filter.contains("trace"));
        assert!(!filter.contains("info"));

        let filter = filter_for(true, Some("warn")).to_string();
        assert!(filter.contains("warn"));
        assert!(!filter.contains("debug"));
    }
}
