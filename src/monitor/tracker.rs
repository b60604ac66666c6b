//! Per-port session tracking.
//!
//! One tracker per monitored port folds successive collector samples into a
//! stable per-IP session map. The session set is a function only of the
//! latest sample: IPs absent from a sample are dropped the same cycle.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::RwLock;

use super::types::{Connection, PortStats, Session};

#[derive(Debug)]
pub struct PortTracker {
    port: u16,
    sessions: RwLock<HashMap<IpAddr, Session>>,
}

impl PortTracker {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Fold one collector sample into the session map.
    ///
    /// Observed IPs get their `last_seen_at` and connection count refreshed,
    /// or a fresh session with `first_seen_at = last_seen_at = now`. Sessions
    /// whose IP is absent from the sample are removed. Idempotent on a
    /// repeated identical sample.
    pub fn update(&self, connections: &[Connection]) {
        let now = Utc::now();

        let mut counts: HashMap<IpAddr, usize> = HashMap::new();
        for conn in connections {
            *counts.entry(conn.remote_addr).or_insert(0) += 1;
        }
        let current: HashSet<IpAddr> = counts.keys().copied().collect();

        let mut sessions = self.sessions.write().unwrap();

        for (&ip, &count) in &counts {
            match sessions.get_mut(&ip) {
                Some(session) => {
                    session.last_seen_at = now;
                    session.connection_num = count;
                }
                None => {
                    sessions.insert(
                        ip,
                        Session {
                            ip,
                            port: self.port,
                            first_seen_at: now,
                            last_seen_at: now,
                            connection_num: count,
                            total_bytes: 0,
                        },
                    );
                }
            }
        }

        sessions.retain(|ip, _| current.contains(ip));
    }

    /// Snapshot of the active sessions. Returns owned copies so callers can
    /// read session fields while the next update cycle runs.
    pub fn active_sessions(&self) -> Vec<Session> {
        let sessions = self.sessions.read().unwrap();
        sessions.values().cloned().collect()
    }

    pub fn session_by_ip(&self, ip: IpAddr) -> Option<Session> {
        let sessions = self.sessions.read().unwrap();
        sessions.get(&ip).cloned()
    }

    /// Number of distinct remote IPs currently holding sessions.
    pub fn count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Remove one session. Returns whether it existed.
    pub fn remove_session(&self, ip: IpAddr) -> bool {
        self.sessions.write().unwrap().remove(&ip).is_some()
    }

    /// Drop every session.
    pub fn clear(&self) {
        self.sessions.write().unwrap().clear();
    }

    pub fn stats(&self) -> PortStats {
        let sessions = self.sessions.read().unwrap();
        let total_connections = sessions.values().map(|s| s.connection_num).sum();

        PortStats {
            port: self.port,
            active_sessions: sessions.len(),
            total_connections,
            unique_ips: sessions.len(),
            last_updated: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn conn(remote: &str, remote_port: u16) -> Connection {
        Connection {
            local_addr: "0.0.0.0".parse().unwrap(),
            local_port: 443,
            remote_addr: remote.parse().unwrap(),
            remote_port,
            state: "ESTAB".to_string(),
            recv_q: 0,
            send_q: 0,
            detected_at: Utc::now(),
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn tracked_set_equals_sample_set() {
        let tracker = PortTracker::new(443);

        tracker.update(&[conn("1.1.1.1", 1000), conn("2.2.2.2", 1001)]);
        assert_eq!(tracker.count(), 2);
        assert!(tracker.session_by_ip(ip("1.1.1.1")).is_some());
        assert!(tracker.session_by_ip(ip("2.2.2.2")).is_some());

        tracker.update(&[conn("2.2.2.2", 1001), conn("3.3.3.3", 1002)]);
        assert_eq!(tracker.count(), 2);
        assert!(tracker.session_by_ip(ip("1.1.1.1")).is_none());
        assert!(tracker.session_by_ip(ip("3.3.3.3")).is_some());
    }

    #[test]
    fn first_seen_is_immutable_while_observed() {
        let tracker = PortTracker::new(443);

        tracker.update(&[conn("1.1.1.1", 1000)]);
        let first: DateTime<Utc> = tracker.session_by_ip(ip("1.1.1.1")).unwrap().first_seen_at;

        tracker.update(&[conn("1.1.1.1", 1000)]);
        tracker.update(&[conn("1.1.1.1", 1000), conn("2.2.2.2", 1001)]);

        let session = tracker.session_by_ip(ip("1.1.1.1")).unwrap();
        assert_eq!(session.first_seen_at, first);
        assert!(session.last_seen_at >= session.first_seen_at);
    }

    #[test]
    fn reappearing_ip_gets_a_fresh_session() {
        let tracker = PortTracker::new(443);

        tracker.update(&[conn("1.1.1.1", 1000)]);
        let first = tracker.session_by_ip(ip("1.1.1.1")).unwrap().first_seen_at;

        tracker.update(&[]);
        assert_eq!(tracker.count(), 0);

        tracker.update(&[conn("1.1.1.1", 1003)]);
        let second = tracker.session_by_ip(ip("1.1.1.1")).unwrap().first_seen_at;
        assert!(second >= first);
    }

    #[test]
    fn connection_count_tracks_the_sample() {
        let tracker = PortTracker::new(443);

        tracker.update(&[conn("1.1.1.1", 1000), conn("1.1.1.1", 1001), conn("2.2.2.2", 2000)]);

        assert_eq!(tracker.session_by_ip(ip("1.1.1.1")).unwrap().connection_num, 2);
        assert_eq!(tracker.session_by_ip(ip("2.2.2.2")).unwrap().connection_num, 1);

        tracker.update(&[conn("1.1.1.1", 1000)]);
        assert_eq!(tracker.session_by_ip(ip("1.1.1.1")).unwrap().connection_num, 1);
    }

    #[test]
    fn update_is_idempotent() {
        let tracker = PortTracker::new(443);
        let sample = [conn("1.1.1.1", 1000), conn("2.2.2.2", 2000)];

        tracker.update(&sample);
        let mut before = tracker.active_sessions();
        before.sort_by_key(|s| s.ip);
        let firsts: Vec<_> = before.iter().map(|s| s.first_seen_at).collect();

        tracker.update(&sample);
        let mut after = tracker.active_sessions();
        after.sort_by_key(|s| s.ip);

        assert_eq!(before.len(), after.len());
        for (session, first) in after.iter().zip(firsts) {
            assert_eq!(session.first_seen_at, first);
        }
    }

    #[test]
    fn empty_sample_drops_all_sessions() {
        let tracker = PortTracker::new(443);
        tracker.update(&[conn("1.1.1.1", 1000), conn("2.2.2.2", 2000)]);
        tracker.update(&[]);
        assert_eq!(tracker.count(), 0);
        assert!(tracker.active_sessions().is_empty());
    }

    #[test]
    fn snapshots_are_isolated_from_later_updates() {
        let tracker = PortTracker::new(443);
        tracker.update(&[conn("1.1.1.1", 1000)]);

        let snapshot = tracker.active_sessions();
        tracker.update(&[]);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].ip, ip("1.1.1.1"));
    }

    #[test]
    fn remove_session_reports_presence() {
        let tracker = PortTracker::new(443);
        tracker.update(&[conn("1.1.1.1", 1000)]);

        assert!(tracker.remove_session(ip("1.1.1.1")));
        assert!(!tracker.remove_session(ip("1.1.1.1")));
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn clear_drops_everything() {
        let tracker = PortTracker::new(443);
        tracker.update(&[conn("1.1.1.1", 1000), conn("2.2.2.2", 2000)]);

        tracker.clear();
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn stats_aggregate_connections() {
        let tracker = PortTracker::new(443);
        tracker.update(&[conn("1.1.1.1", 1000), conn("1.1.1.1", 1001), conn("2.2.2.2", 2000)]);

        let stats = tracker.stats();
        assert_eq!(stats.port, 443);
        assert_eq!(stats.active_sessions, 2);
        assert_eq!(stats.unique_ips, 2);
        assert_eq!(stats.total_connections, 3);
    }
}
