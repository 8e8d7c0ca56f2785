//! Testing utilities and mock implementations
//!
//! Test doubles for exercising clients and registrars without real network
//! peers or a coordination service.

pub mod mocks;

pub use mocks::*;

use std::time::Duration;

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
///
/// Returns whether the condition was met.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
