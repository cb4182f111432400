use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_ENV: &str = "ETUDE_LOG";

/// Installs the global subscriber. `ETUDE_LOG` takes precedence over `level`.
///
/// Logs go to stderr so `--json` output on stdout stays machine-readable.
pub fn init(level: &str) {
    let directives = std::env::var(LOG_ENV).unwrap_or_else(|_| format!("etude={}", level));
    let env_filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("warn"));

    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    // A second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init();
}
