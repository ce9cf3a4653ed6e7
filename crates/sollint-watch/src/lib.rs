pub mod aggregate;
pub mod debounce;
pub mod error;
pub mod event;
pub mod filter;
pub mod watch_mode;
pub mod watcher;

pub use aggregate::*;
pub use debounce::*;
pub use error::*;
pub use event::*;
pub use filter::*;
pub use watch_mode::*;
pub use watcher::*;

use tokio::time::Instant;

/// Milliseconds since `base`, the time axis the debounce and aggregation
/// state machines run on.
pub(crate) fn elapsed_ms(base: Instant) -> u64 {
    base.elapsed().as_millis() as u64
}

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
