use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber; `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tungstenite=warn,tokio_tungstenite=warn"));

    fmt().with_env_filter(env_filter).with_target(false).init();
}
