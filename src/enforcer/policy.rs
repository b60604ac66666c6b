//! Victim selection.
//!
//! Pure decisions over a session snapshot: filter out allow-listed IPs,
//! order the rest by first-seen according to the effective strategy, take
//! the overlimit count. Allow-listed clients are never evicted, even when
//! that leaves the port above its limit.

use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use crate::config::{Config, Strategy};
use crate::monitor::types::Session;

use super::types::VictimSelection;

pub struct PolicyEngine {
    config: Arc<RwLock<Config>>,
}

impl PolicyEngine {
    pub fn new(config: Arc<RwLock<Config>>) -> Self {
        Self { config }
    }

    /// Choose `overlimit` victims from a session snapshot.
    ///
    /// FIFO evicts the oldest first-seen sessions, LIFO the newest. When the
    /// non-allow-listed candidate set is not larger than the overlimit, every
    /// candidate is returned.
    pub fn select_victims(
        &self,
        port: u16,
        sessions: &[Session],
        overlimit: usize,
    ) -> VictimSelection {
        let config = self.config.read().unwrap();

        let Some(rule) = config.rule_for_port(port) else {
            return VictimSelection {
                victims: Vec::new(),
                strategy: None,
                total: sessions.len(),
                overlimit,
            };
        };

        let strategy = rule.effective_strategy(config.global.strategy);

        let mut candidates: Vec<&Session> = sessions
            .iter()
            .filter(|s| !Self::matches_list(&rule.whitelist, s.ip))
            .collect();

        if candidates.len() <= overlimit {
            return VictimSelection {
                victims: candidates.iter().map(|s| s.ip).collect(),
                strategy: Some(strategy),
                total: sessions.len(),
                overlimit,
            };
        }

        match strategy {
            Strategy::Fifo => candidates.sort_by_key(|s| s.first_seen_at),
            Strategy::Lifo => candidates.sort_by_key(|s| std::cmp::Reverse(s.first_seen_at)),
        }

        VictimSelection {
            victims: candidates[..overlimit].iter().map(|s| s.ip).collect(),
            strategy: Some(strategy),
            total: sessions.len(),
            overlimit,
        }
    }

    /// True iff the IP matches an entry in the rule's deny list.
    pub fn is_denylisted(&self, port: u16, ip: IpAddr) -> bool {
        let config = self.config.read().unwrap();
        config
            .rule_for_port(port)
            .map(|rule| Self::matches_list(&rule.blacklist, ip))
            .unwrap_or(false)
    }

    fn matches_list(entries: &[String], ip: IpAddr) -> bool {
        entries.iter().any(|entry| matches_entry(entry, ip))
    }
}

/// Match a single allow/deny entry: bare IP by equality, CIDR by containment.
fn matches_entry(entry: &str, ip: IpAddr) -> bool {
    if let Ok(net) = entry.parse::<IpNet>() {
        return net.contains(&ip);
    }
    entry.parse::<IpAddr>().map(|e| e == ip).unwrap_or(false)
}
