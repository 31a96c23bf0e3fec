//! A set of utilities to enable logging configuration using tracing_subscriber.

use std::{io::IsTerminal, sync::Once};

use tracing_subscriber::{EnvFilter, filter::LevelFilter};

static SINK_LOG_ENV_VAR: &str = "SINK_LOG";

/// Default level applied to the workspace crates when `SINK_LOG` is unset.
const DEFAULT_LOG_LEVEL: &str = "info";

/// List of crates in the workspace.
const SINK_CRATES: &[&str] = &[
    "bundler",
    "files_sink",
    "monitoring",
    "parquet_rows",
    "sink_config",
    "sink_object_store",
];

/// Initializes a tracing subscriber for logging.
pub fn init() {
    // Since we also use this function to enable logging in tests, wrap it in `Once` to prevent
    // multiple initializations.
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let (env_filter, sink_log_level) = env_filter_and_log_level();

        // `try_init` so that a test binary with its own subscriber does not panic
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .try_init();

        tracing::info!("log level: {}", sink_log_level);
    });
}

fn env_filter_and_log_level() -> (EnvFilter, String) {
    let directive_string = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let log_level =
        std::env::var(SINK_LOG_ENV_VAR).unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());

    // Invalid directives are dropped by the filter builder instead of aborting startup
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::ERROR.into())
        .parse_lossy(crate_directives(&directive_string, &log_level).join(","));

    (env_filter, log_level)
}

/// Returns the `RUST_LOG` directives followed by one `<crate>=<level>` directive for each
/// workspace crate that `RUST_LOG` does not already mention.
fn crate_directives(rust_log: &str, level: &str) -> Vec<String> {
    let mut directives: Vec<String> = rust_log
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .map(ToOwned::to_owned)
        .collect();

    for crate_name in SINK_CRATES {
        if !rust_log.contains(&format!("{crate_name}=")) {
            directives.push(format!("{crate_name}={level}"));
        }
    }

    directives
}

/// Renders the `source()` chain of `err`, outermost first, for the `error_source` log field.
///
/// The top-level error is left out since it is logged in the `error` field already.
pub fn error_source(
    err: &(dyn std::error::Error + 'static),
) -> tracing::field::DisplayValue<String> {
    let mut chain = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    tracing::field::display(chain.join(" -> "))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn every_crate_gets_the_default_level() {
        let directives = crate_directives("", "debug");

        assert_eq!(directives.len(), SINK_CRATES.len());
        assert!(directives.contains(&"bundler=debug".to_string()));
        assert!(directives.contains(&"parquet_rows=debug".to_string()));
    }

    #[test]
    fn rust_log_overrides_win() {
        let directives = crate_directives("bundler=trace,object_store=warn", "info");

        assert_eq!(directives[0], "bundler=trace");
        assert_eq!(directives[1], "object_store=warn");
        assert!(!directives.contains(&"bundler=info".to_string()));
        assert!(directives.contains(&"files_sink=info".to_string()));
    }

    #[test]
    fn error_source_lists_causes() {
        #[derive(Debug)]
        struct Upload(std::io::Error);

        impl std::fmt::Display for Upload {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("upload failed")
            }
        }

        impl std::error::Error for Upload {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }

        let err = Upload(std::io::Error::other("disk full"));

        assert_eq!(error_source(&err).to_string(), "disk full");
    }
}
