//! Miscellaneous test code for the arbor workspace.

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

static INIT: Lazy<()> = Lazy::new(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();

    let _ = color_eyre::install();
});

/// Initialize tracing and error reports for tests.
///
/// Call at the start of every test. Initialization happens once per
/// process; later calls are no-ops, so tests never race on the global
/// subscriber.
pub fn init() {
    Lazy::force(&INIT);
}
