//! Cool-down scheduling.
//!
//! Holds one cancellable unban job per (ip, port). Jobs are armed when a
//! timed ban is applied; on expiry the job calls the unban capability it was
//! constructed with and removes itself. Re-scheduling an existing key
//! replaces the timer. A fire that fails to remove the rule keeps the job
//! entry so the stuck ban stays observable and retryable.
//!
//! The job map sits behind one mutex. Timer callbacks never hold it while
//! calling the unban capability.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use super::executor::ExecError;
use super::types::BanRecord;

/// The remove-ban capability handed in at construction time.
pub type UnbanFn = Arc<dyn Fn(IpAddr, u16) -> Result<(), ExecError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum CooldownError {
    #[error("no active ban for {ip}:{port}")]
    UnknownBan { ip: IpAddr, port: u16 },

    #[error(transparent)]
    Exec(#[from] ExecError),
}

struct CooldownRecord {
    banned_at: DateTime<Utc>,
    expire_at: DateTime<Utc>,
    duration: u64,
    timer: JoinHandle<()>,
}

pub struct CooldownManager {
    records: Mutex<HashMap<(IpAddr, u16), CooldownRecord>>,
    unban: UnbanFn,
}

impl CooldownManager {
    pub fn new(unban: UnbanFn) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            unban,
        })
    }

    /// Arm a one-shot unban timer for (ip, port), replacing any existing job.
    /// The new expiry is timed from now.
    pub fn schedule(self: &Arc<Self>, ip: IpAddr, port: u16, duration: u64) {
        let mut records = self.records.lock().unwrap();

        if let Some(old) = records.remove(&(ip, port)) {
            old.timer.abort();
            tracing::debug!("replaced pending unban for {ip}:{port}");
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(duration)).await;
            if let Some(manager) = manager.upgrade() {
                manager.fire(ip, port);
            }
        });

        let now = Utc::now();
        records.insert(
            (ip, port),
            CooldownRecord {
                banned_at: now,
                expire_at: now + ChronoDuration::seconds(duration as i64),
                duration,
                timer,
            },
        );

        tracing::debug!("armed unban for {ip}:{port} in {duration}s");
    }

    /// Timer expiry path. Runs on the scheduler's worker context.
    fn fire(&self, ip: IpAddr, port: u16) {
        match (self.unban)(ip, port) {
            Ok(()) => {
                self.records.lock().unwrap().remove(&(ip, port));
                tracing::info!("cool-down expired, unbanned {ip}:{port}");
            }
            Err(err) => {
                // Entry stays so the stuck ban can be seen and retried.
                tracing::error!("timed unban of {ip}:{port} failed: {err}");
            }
        }
    }

    /// Stop the timer, unban immediately and drop the job.
    pub fn cancel(&self, ip: IpAddr, port: u16) -> Result<(), CooldownError> {
        {
            let records = self.records.lock().unwrap();
            let record = records
                .get(&(ip, port))
                .ok_or(CooldownError::UnknownBan { ip, port })?;
            record.timer.abort();
        }

        (self.unban)(ip, port)?;

        self.records.lock().unwrap().remove(&(ip, port));
        tracing::info!("cancelled ban for {ip}:{port}");
        Ok(())
    }

    pub fn is_active(&self, ip: IpAddr, port: u16) -> bool {
        self.records.lock().unwrap().contains_key(&(ip, port))
    }

    pub fn expiry_of(&self, ip: IpAddr, port: u16) -> Option<DateTime<Utc>> {
        self.records.lock().unwrap().get(&(ip, port)).map(|r| r.expire_at)
    }

    pub fn count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Snapshot of the active jobs as ban records.
    pub fn active_records(&self) -> Vec<BanRecord> {
        let records = self.records.lock().unwrap();
        records
            .iter()
            .map(|(&(ip, port), record)| BanRecord {
                ip,
                port,
                banned_at: record.banned_at,
                expire_at: record.expire_at,
                duration: record.duration,
                reason: "Overlimit".to_string(),
                strategy: "AUTO".to_string(),
            })
            .collect()
    }

    /// Stop every timer without removing filter rules, so bans survive a
    /// daemon restart.
    pub fn clear(&self) {
        let mut records = self.records.lock().unwrap();
        for (_, record) in records.drain() {
            record.timer.abort();
        }
        tracing::info!("cool-down scheduler cleared");
    }
}
