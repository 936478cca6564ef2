//! Server metrics.

use std::sync::atomic::{AtomicU64, Ordering};


//------------ ServerMetrics -------------------------------------------------

/// Counters kept across the lifetime of the server.
///
/// All counters are relaxed; they feed logs and the status output, nothing
/// that needs ordering.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    connections: AtomicU64,
    current_connections: AtomicU64,
    pdus_received: AtomicU64,
    notifications_sent: AtomicU64,
    errors_sent: AtomicU64,
    verify_requests: AtomicU64,
    sign_requests: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.current_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_current_connections(&self) {
        self.current_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_pdus_received(&self) {
        self.pdus_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_notifications_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errors_sent(&self) {
        self.errors_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_verify_requests(&self) {
        self.verify_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sign_requests(&self) {
        self.sign_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn current_connections(&self) -> u64 {
        self.current_connections.load(Ordering::Relaxed)
    }

    pub fn pdus_received(&self) -> u64 {
        self.pdus_received.load(Ordering::Relaxed)
    }

    pub fn notifications_sent(&self) -> u64 {
        self.notifications_sent.load(Ordering::Relaxed)
    }

    pub fn errors_sent(&self) -> u64 {
        self.errors_sent.load(Ordering::Relaxed)
    }

    pub fn verify_requests(&self) -> u64 {
        self.verify_requests.load(Ordering::Relaxed)
    }

    pub fn sign_requests(&self) -> u64 {
        self.sign_requests.load(Ordering::Relaxed)
    }
}
