//! Polling coordinator.
//!
//! Spawns one cooperative polling task per configured port. Each task
//! samples the collector on its own ticker, folds the sample into the
//! port's tracker and fires the overlimit callback synchronously on the
//! polling task, so no two enforcement decisions for the same port can
//! overlap. A slow external command on one port never stalls another.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;

use super::collector::Collector;
use super::tracker::PortTracker;
use super::types::PortStats;

/// Invoked with (port, current distinct IPs, allowed maximum).
pub type OverlimitCallback = Arc<dyn Fn(u16, usize, usize) + Send + Sync>;

pub struct Coordinator {
    config: Arc<RwLock<Config>>,
    collector: Collector,
    trackers: RwLock<HashMap<u16, Arc<PortTracker>>>,
    tasks: tokio::sync::Mutex<HashMap<u16, PortTask>>,
    on_overlimit: RwLock<Option<OverlimitCallback>>,
}

struct PortTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Coordinator {
    pub fn new(config: Arc<RwLock<Config>>) -> Self {
        Self {
            config,
            collector: Collector::new(),
            trackers: RwLock::new(HashMap::new()),
            tasks: tokio::sync::Mutex::new(HashMap::new()),
            on_overlimit: RwLock::new(None),
        }
    }

    /// Register the overlimit callback. Replaces any previous one.
    pub fn set_overlimit_callback(&self, callback: OverlimitCallback) {
        *self.on_overlimit.write().unwrap() = Some(callback);
    }

    /// Build trackers and start one polling task per configured port.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let (ports, interval) = {
            let cfg = self.config.read().unwrap();
            let ports: Vec<(u16, usize)> =
                cfg.rules.iter().map(|r| (r.port, r.max_ips)).collect();
            (ports, cfg.global.check_interval)
        };

        let mut tasks = self.tasks.lock().await;

        for (port, max_ips) in ports {
            let tracker = Arc::new(PortTracker::new(port));
            self.trackers.write().unwrap().insert(port, Arc::clone(&tracker));
            tracing::info!("tracking port {port} (max {max_ips} IPs)");

            tasks.insert(port, self.spawn_port_task(port, tracker, interval));
        }

        tracing::info!("coordinator started, monitoring {} ports", tasks.len());
        Ok(())
    }

    /// Signal every polling task and wait for it to drain its current tick.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;

        for (port, task) in tasks.drain() {
            let _ = task.stop.send(true);
            if let Err(err) = task.handle.await {
                tracing::error!("polling task for port {port} panicked: {err}");
            }
            tracing::info!("stopped monitoring port {port}");
        }
    }

    /// Apply a new rule set: trackers for ports that remain are retained
    /// (their sessions survive the reload), new ports get fresh trackers and
    /// tasks, removed ports are stopped and dropped.
    pub async fn reconfigure(self: &Arc<Self>, new_config: &Config) {
        let new_ports: HashSet<u16> = new_config.rules.iter().map(|r| r.port).collect();
        let interval = new_config.global.check_interval;

        let mut tasks = self.tasks.lock().await;

        let removed: Vec<u16> =
            tasks.keys().copied().filter(|p| !new_ports.contains(p)).collect();
        for port in removed {
            if let Some(task) = tasks.remove(&port) {
                let _ = task.stop.send(true);
                if let Err(err) = task.handle.await {
                    tracing::error!("polling task for port {port} panicked: {err}");
                }
            }
            self.trackers.write().unwrap().remove(&port);
            tracing::info!("dropped tracker for removed port {port}");
        }

        for &port in &new_ports {
            if tasks.contains_key(&port) {
                tracing::info!("retained tracker for port {port}");
                continue;
            }
            let tracker = Arc::new(PortTracker::new(port));
            self.trackers.write().unwrap().insert(port, Arc::clone(&tracker));
            tasks.insert(port, self.spawn_port_task(port, tracker, interval));
            tracing::info!("added tracker for new port {port}");
        }
    }

    pub fn get_tracker(&self, port: u16) -> Option<Arc<PortTracker>> {
        self.trackers.read().unwrap().get(&port).cloned()
    }

    pub fn all_stats(&self) -> HashMap<u16, PortStats> {
        let trackers = self.trackers.read().unwrap();
        trackers.iter().map(|(&port, t)| (port, t.stats())).collect()
    }

    pub fn port_stats(&self, port: u16) -> Result<PortStats> {
        self.get_tracker(port)
            .map(|t| t.stats())
            .ok_or_else(|| anyhow::anyhow!("port {port} is not monitored"))
    }

    fn spawn_port_task(
        self: &Arc<Self>,
        port: u16,
        tracker: Arc<PortTracker>,
        interval_secs: u64,
    ) -> PortTask {
        let (stop_tx, stop_rx) = watch::channel(false);
        let coordinator = Arc::clone(self);

        let handle = tokio::spawn(async move {
            coordinator.monitor_port(port, tracker, interval_secs, stop_rx).await;
        });

        PortTask { stop: stop_tx, handle }
    }

    async fn monitor_port(
        self: Arc<Self>,
        port: u16,
        tracker: Arc<PortTracker>,
        interval_secs: u64,
        mut stop: watch::Receiver<bool>,
    ) {
        let period = Duration::from_secs(interval_secs);
        // First tick after one full period, not immediately.
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!("monitoring port {port} (check interval {interval_secs}s)");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_once(port, &tracker),
                _ = stop.changed() => break,
            }
        }
    }

    /// One polling cycle: sample, fold, re-read the rule, test the limit.
    fn poll_once(&self, port: u16, tracker: &PortTracker) {
        let sample = match self.collector.collect(port) {
            Ok(sample) => sample,
            Err(err) => {
                tracing::error!("sampling port {port} failed: {err:#}");
                return;
            }
        };

        tracker.update(&sample);

        // Rule is re-read every cycle so a hot-reloaded max takes effect.
        let max_ips = {
            let cfg = self.config.read().unwrap();
            cfg.rule_for_port(port).map(|r| r.max_ips)
        };
        let Some(max_ips) = max_ips else {
            return;
        };

        let current = tracker.count();
        if current > max_ips {
            tracing::warn!("port {port} overlimit: {current} IPs > max {max_ips}");
            let callback = self.on_overlimit.read().unwrap().clone();
            if let Some(callback) = callback {
                callback(port, current, max_ips);
            }
        } else {
            tracing::debug!("port {port} within limit: {current}/{max_ips} IPs");
        }
    }
}
