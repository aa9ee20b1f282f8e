//! External process health check
//!
//! The camera control software runs out-of-process and can wedge
//! without dropping its connection. The watchdog mechanism (process
//! table inspection, IPC ping, heartbeat file) is platform-specific,
//! so it sits behind this capability.

use async_trait::async_trait;

/// Liveness check and kill switch for an external process.
#[async_trait]
pub trait ProcessHealth: Send + Sync {
    /// Whether the named process is alive and responsive.
    async fn is_responsive(&self, process: &str) -> bool;

    /// Forcibly terminate the named process so a fresh instance can
    /// be started. Best effort.
    async fn terminate(&self, process: &str);
}
