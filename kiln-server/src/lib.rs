pub mod config;
pub mod routes;

pub use config::Config;
pub use routes::{router, AppState};

/// Installs the global tracing subscriber. `RUST_LOG` wins over the
/// default `info` level.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
