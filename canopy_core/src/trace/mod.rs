/*
    Tracing setup for the daemon. All components log through a
    TraceHelper, which tags each event with the name of the component
    that emitted it.
*/
use tracing_subscriber::EnvFilter;

pub mod trace_helper;

/// Log category for failures talking to the measurement store.
pub const STORE_CONNECTION: &str = "store-connection";

/// # Install the global subscriber
/// `level` is the default filter (e.g. "info" or "canopy_core=debug");
/// RUST_LOG overrides it when set. Calling this more than once is
/// harmless, later calls are ignored.
pub fn init(level: &str)
{
    let filter = EnvFilter::try_from_default_env()
                    .or_else(|_| EnvFilter::try_new(level))
                    .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_thread_names(true)
                .try_init();
}
