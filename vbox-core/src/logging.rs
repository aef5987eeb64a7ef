use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber for the supervisor.
///
/// Operator-facing lifecycle messages are emitted at `info`; pass `verbose`
/// to surface per-command debug output as well.
pub fn init_subscriber(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("vbox=debug")
    } else {
        EnvFilter::new("vbox=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_level(verbose)
        .init();
}
