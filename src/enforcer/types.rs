//! Value types for the enforcement layer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;

use crate::config::Strategy;

/// One active or historical ban of a remote IP on a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BanRecord {
    pub ip: IpAddr,
    pub port: u16,
    pub banned_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    /// Duration in seconds.
    pub duration: u64,
    /// Why the ban was applied, e.g. "Overlimit" or "Manual".
    pub reason: String,
    /// Policy name that chose the victim, or "MANUAL".
    pub strategy: String,
}

/// Result of one victim-selection pass. Ephemeral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VictimSelection {
    /// IPs to evict, in eviction order.
    pub victims: Vec<IpAddr>,
    /// Policy applied, absent when no rule matched the port.
    pub strategy: Option<Strategy>,
    /// Session count the selection was computed from.
    pub total: usize,
    pub overlimit: usize,
}
