//! holdfast workspace root
//!
//! Re-exports the engine and its backends; the tests in `tests/` exercise
//! them together.

pub use holdfast_sync as sync;
pub use holdfast_transport as transport;
