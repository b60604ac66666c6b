//! Value types shared across the monitoring layer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;

/// A point-in-time sample of one established TCP flow on a monitored port.
///
/// Produced by the collector, consumed once by the tracker, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    /// Connection state as reported by the socket statistics tool.
    pub state: String,
    pub recv_q: u64,
    pub send_q: u64,
    pub detected_at: DateTime<Utc>,
}

/// The stable fact that a remote IP currently uses a monitored port.
///
/// `first_seen_at` is immutable for the lifetime of the session;
/// `last_seen_at` refreshes every cycle the IP is still observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub ip: IpAddr,
    pub port: u16,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Concurrent connection count for this IP, at least 1.
    pub connection_num: usize,
    /// Lifetime byte total, optional. Stays zero unless accounting is wired.
    pub total_bytes: u64,
}

/// Aggregate statistics for one monitored port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortStats {
    pub port: u16,
    pub active_sessions: usize,
    pub total_connections: usize,
    pub unique_ips: usize,
    pub last_updated: DateTime<Utc>,
}
