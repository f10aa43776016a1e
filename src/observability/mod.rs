use tracing::Level;

/// Install the global JSON tracing subscriber. `verbose` raises the level
/// to DEBUG, which includes one event per emitted message.
pub fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .json()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
