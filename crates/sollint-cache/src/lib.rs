pub mod cache;
pub mod fingerprint;
pub mod storage;

pub use cache::*;
pub use fingerprint::*;
pub use storage::*;

// Re-export common types for convenience
pub use sollint_core::{Clock, Result, SollintError, SystemClock};
