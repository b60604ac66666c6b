//! Enforcement layer: policy, executor and cool-down scheduling composed
//! behind one facade.
//!
//! On overlimit the enforcer reads the tracker snapshot, asks the policy
//! engine for victims and delegates to the executor, which kills flows,
//! installs marker-tagged filter rules and arms timed unbans.

pub mod cooldown;
pub mod executor;
pub mod policy;
pub mod types;

pub use cooldown::{CooldownError, CooldownManager, UnbanFn};
pub use executor::{CommandRunner, ExecError, Executor, SystemRunner, BAN_MARKER};
pub use policy::PolicyEngine;
pub use types::{BanRecord, VictimSelection};

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use crate::config::{Config, Rule};
use crate::monitor::tracker::PortTracker;

pub struct Enforcer {
    config: Arc<RwLock<Config>>,
    policy: PolicyEngine,
    executor: Executor,
    cooldown: Arc<CooldownManager>,
}

impl Enforcer {
    pub fn new(config: Arc<RwLock<Config>>) -> Self {
        Self::with_runner(config, Arc::new(SystemRunner))
    }

    /// Build the enforcer over an explicit command runner.
    ///
    /// The scheduler receives only the remove-ban capability, bound over the
    /// same runner the executor uses.
    pub fn with_runner(config: Arc<RwLock<Config>>, runner: Arc<dyn CommandRunner>) -> Self {
        let unban_runner = Arc::clone(&runner);
        let unban: UnbanFn = Arc::new(move |ip, port| {
            executor::delete_filter_rule(unban_runner.as_ref(), ip, port)
        });

        let cooldown = CooldownManager::new(unban);
        let executor = Executor::new(runner, Arc::clone(&cooldown));

        Self {
            config: Arc::clone(&config),
            policy: PolicyEngine::new(config),
            executor,
            cooldown,
        }
    }

    /// Evict enough sessions to bring `port` back under its limit.
    ///
    /// No-op when the tracker is within the limit. Returns the ban records
    /// actually applied, for best-effort history persistence.
    pub fn enforce(&self, port: u16, tracker: &PortTracker, rule: &Rule) -> Vec<BanRecord> {
        let sessions = tracker.active_sessions();
        let current = sessions.len();

        let overlimit = current.saturating_sub(rule.max_ips);
        if overlimit == 0 {
            return Vec::new();
        }

        tracing::warn!(
            "port {port} overlimit: {current} IPs, max {}, evicting {overlimit}",
            rule.max_ips
        );

        let selection = self.policy.select_victims(port, &sessions, overlimit);
        if selection.victims.is_empty() {
            tracing::warn!("no evictable sessions on port {port} (all allow-listed)");
            return Vec::new();
        }

        let strategy = selection
            .strategy
            .map(|s| s.to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string());
        tracing::info!(
            "selected {} victims on port {port} (strategy {strategy})",
            selection.victims.len()
        );

        let ban_duration = {
            let cfg = self.config.read().unwrap();
            rule.effective_ban_duration(cfg.global.ban_duration)
        };

        let reason = "Overlimit";
        let banned = self
            .executor
            .enforce_victims(port, &selection.victims, ban_duration, reason);

        let now = Utc::now();
        banned
            .into_iter()
            .map(|ip| BanRecord {
                ip,
                port,
                banned_at: now,
                expire_at: now + ChronoDuration::seconds(ban_duration as i64),
                duration: ban_duration,
                reason: reason.to_string(),
                strategy: strategy.clone(),
            })
            .collect()
    }

    /// Operator-initiated ban. Errors propagate to the caller.
    pub fn manual_ban(
        &self,
        ip: IpAddr,
        port: u16,
        duration: u64,
        reason: &str,
    ) -> Result<BanRecord> {
        tracing::info!("manual ban: {ip}:{port} for {duration}s ({reason})");

        // The client may not be connected; a failed kill is not fatal here.
        if let Err(err) = self.executor.kill_flow(port, ip) {
            tracing::warn!("kill during manual ban failed: {err}");
        }

        self.executor.apply_ban(ip, port, duration)?;

        let now = Utc::now();
        Ok(BanRecord {
            ip,
            port,
            banned_at: now,
            expire_at: now + ChronoDuration::seconds(duration as i64),
            duration,
            reason: reason.to_string(),
            strategy: "MANUAL".to_string(),
        })
    }

    /// Operator-initiated unban. Falls back to a bare rule removal when the
    /// ban has no scheduled expiry.
    pub fn manual_unban(&self, ip: IpAddr, port: u16) -> Result<()> {
        tracing::info!("manual unban: {ip}:{port}");

        match self.cooldown.cancel(ip, port) {
            Ok(()) => Ok(()),
            Err(CooldownError::UnknownBan { .. }) => {
                self.executor.remove_ban(ip, port)?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn active_bans(&self) -> Vec<BanRecord> {
        self.cooldown.active_records()
    }

    pub fn is_banned(&self, ip: IpAddr, port: u16) -> bool {
        self.cooldown.is_active(ip, port)
    }

    pub fn ban_expiry(&self, ip: IpAddr, port: u16) -> Option<chrono::DateTime<Utc>> {
        self.cooldown.expiry_of(ip, port)
    }

    pub fn is_denylisted(&self, ip: IpAddr, port: u16) -> bool {
        self.policy.is_denylisted(port, ip)
    }

    /// Stop all pending unban timers, leaving filter rules installed.
    pub fn shutdown(&self) {
        tracing::info!("enforcer shutting down, bans remain in place");
        self.cooldown.clear();
    }
}
