//! The command gate: one in-flight command frame at a time.
//!
//! Interleaved command/response frames get misattributed, so every outgoing
//! frame is serialized through this gate. This is the most safety-critical
//! invariant of the transport. The primitive is a `tokio::sync::Mutex`,
//! which is context-agnostic (acquirable from any task or thread, FIFO
//! across concurrent callers) rather than tied to the execution context that
//! first touched it.
//!
//! The gate is owned by the connection object. When the connection is torn
//! down and rebuilt, [`CommandGate::reset`] swaps in a fresh primitive so a
//! holder from the dead connection can never stall the new one.

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Guard representing exclusive ownership of the command channel.
///
/// Held for the duration of one command/response exchange; dropping it
/// (including on cancellation) releases the gate.
pub type GatePermit = OwnedMutexGuard<()>;

/// Serializes all outgoing commands for one connection.
#[derive(Debug)]
pub struct CommandGate {
    inner: parking_lot::Mutex<Arc<Mutex<()>>>,
}

impl CommandGate {
    /// Create an open gate.
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(Arc::new(Mutex::new(()))),
        }
    }

    /// Wait for exclusive use of the command channel.
    ///
    /// Callers queue in arrival order. The returned permit is `'static`, so
    /// it may be held across await points and moved between tasks.
    pub async fn acquire(&self) -> GatePermit {
        let lock = self.inner.lock().clone();
        lock.lock_owned().await
    }

    /// Replace the underlying primitive.
    ///
    /// Invoked only when the owning connection is rebuilt. Outstanding
    /// permits from the old connection keep the old primitive alive but can
    /// no longer block acquisition on the new one.
    pub fn reset(&self) {
        *self.inner.lock() = Arc::new(Mutex::new(()));
    }
}

impl Default for CommandGate {
    fn default() -> Self {
        Self::new()
    }
}
