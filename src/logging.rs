use tracing_subscriber::EnvFilter;

/// Default filter for `-v` repetitions; `RUST_LOG` takes precedence.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "tenant_operator=warn",
        1 => "tenant_operator=info",
        2 => "tenant_operator=debug",
        _ => "tenant_operator=trace",
    }
}

/// Install the stderr subscriber. Call once from the binary entry point.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
