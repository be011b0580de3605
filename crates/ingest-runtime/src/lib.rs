pub mod actor;
pub mod coordinator;
pub mod error;
pub mod feeder;
pub mod status_checker;
pub mod worker;

#[cfg(test)]
mod tests;

/// Installs the process-wide log subscriber. Binaries call this once before
/// building a coordinator; `RUST_LOG` overrides the default level.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
