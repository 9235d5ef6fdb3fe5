//! Pluggable session observers.
//!
//! The core calls these synchronously from the seal/open and rekey paths;
//! implementations must not block.

use crate::error::TunnelError;
use crate::types::{Role, SessionId};
use crypto::aead::CipherSuite;

/// Callback set invoked at session lifecycle points.
pub trait SessionObserver: Send + Sync {
    fn on_session_start(&self, _session_id: &SessionId, _role: Role, _suite: CipherSuite) {}

    fn on_packet_sent(&self, _len: usize, _seq: u64) {}

    fn on_packet_received(&self, _len: usize, _seq: u64) {}

    fn on_rekey_begin(&self) {}

    fn on_rekey_complete(&self) {}

    fn on_error(&self, _error: &TunnelError, _context: &'static str) {}
}

/// Observer that ignores every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Counting observer used across the crate's tests.
    #[derive(Debug, Default)]
    pub struct CountingObserver {
        pub sessions_started: AtomicU64,
        pub packets_sent: AtomicU64,
        pub packets_received: AtomicU64,
        pub rekeys_begun: AtomicU64,
        pub rekeys_completed: AtomicU64,
        pub errors: AtomicU64,
    }

    impl SessionObserver for CountingObserver {
        fn on_session_start(&self, _session_id: &SessionId, _role: Role, _suite: CipherSuite) {
            self.sessions_started.fetch_add(1, Ordering::Relaxed);
        }

        fn on_packet_sent(&self, _len: usize, _seq: u64) {
            self.packets_sent.fetch_add(1, Ordering::Relaxed);
        }

        fn on_packet_received(&self, _len: usize, _seq: u64) {
            self.packets_received.fetch_add(1, Ordering::Relaxed);
        }

        fn on_rekey_begin(&self) {
            self.rekeys_begun.fetch_add(1, Ordering::Relaxed);
        }

        fn on_rekey_complete(&self) {
            self.rekeys_completed.fetch_add(1, Ordering::Relaxed);
        }

        fn on_error(&self, _error: &TunnelError, _context: &'static str) {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}
