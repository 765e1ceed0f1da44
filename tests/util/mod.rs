//! Utilities shared between the integration tests.

use std::sync::Once;

/// Install the test logger, once per process.
///
/// Log output only shows up for failing tests, which is exactly when it's
/// wanted.
pub fn init_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        std_logger::Config::logfmt().init();
    });
}
