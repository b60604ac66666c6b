//! Established-connection sampling via the socket statistics tool.
//!
//! Runs `ss -tn state established sport = :<port>` and parses the tabular
//! output. The collector is stateless and side-effect-free; any number of
//! callers may sample concurrently.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::process::Command;

use super::types::Connection;

#[derive(Debug, Clone, Default)]
pub struct Collector;

impl Collector {
    pub fn new() -> Self {
        Self
    }

    /// Sample the established TCP flows whose local source port matches.
    pub fn collect(&self, port: u16) -> Result<Vec<Connection>> {
        let output = Command::new("ss")
            .args(["-tn", "state", "established", "sport", "=", &format!(":{port}")])
            .output()
            .context("failed to invoke ss")?;

        if !output.status.success() {
            anyhow::bail!(
                "ss exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_output(&text, Utc::now()))
    }
}

/// Parse `ss` tabular output into connection samples.
///
/// The first line is a header and is skipped. Lines with fewer than five
/// whitespace-separated fields, or with unparseable addresses, are dropped.
pub fn parse_output(output: &str, now: DateTime<Utc>) -> Vec<Connection> {
    let mut connections = Vec::new();

    for (i, line) in output.lines().enumerate() {
        if i == 0 || line.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }

        let state = fields[0];
        let recv_q = fields[1].parse().unwrap_or(0);
        let send_q = fields[2].parse().unwrap_or(0);

        let Some((local_addr, local_port)) = split_host_port(fields[3]) else {
            continue;
        };
        let Some((remote_addr, remote_port)) = split_host_port(fields[4]) else {
            continue;
        };

        connections.push(Connection {
            local_addr,
            local_port,
            remote_addr,
            remote_port,
            state: state.to_string(),
            recv_q,
            send_q,
            detected_at: now,
        });
    }

    connections
}

/// Split `"IP:port"` or `"[IPv6]:port"` into address and port.
fn split_host_port(addr: &str) -> Option<(IpAddr, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);

    let ip: IpAddr = host.parse().ok()?;
    let port: u16 = port.parse().ok()?;

    Some((ip, port))
}

/// Distinct remote IPs appearing in a sample.
pub fn unique_ips(connections: &[Connection]) -> Vec<IpAddr> {
    let mut seen = std::collections::HashSet::new();
    connections
        .iter()
        .filter(|c| seen.insert(c.remote_addr))
        .map(|c| c.remote_addr)
        .collect()
}
