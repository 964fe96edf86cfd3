//! Log setup shared by the binaries.

pub mod logging;

pub use logging::{LogFormat, init_with};

/// Installs the global subscriber using `CABINET_LOG_FORMAT` and `RUST_LOG`.
/// Later calls are no-ops.
pub fn init() {
    logging::init();
}
