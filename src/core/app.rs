//! Application controller.
//!
//! Owns the coordinator, enforcer and database; wires the overlimit
//! callback; drives the lifecycle: start, hot reload on SIGHUP, graceful
//! shutdown on SIGTERM/SIGINT. Shutdown stops polling, bounds the wait for
//! background workers at ten seconds, persists live sessions and clears the
//! scheduler while leaving filter rules installed.

use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::enforcer::{executor, Enforcer, SystemRunner};
use crate::monitor::Coordinator;
use crate::storage::{Database, PortStatistics};

const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct App {
    config: Arc<RwLock<Config>>,
    config_path: PathBuf,
    coordinator: Arc<Coordinator>,
    enforcer: Arc<Enforcer>,
    db: Arc<Database>,
    state: RwLock<RunState>,
    worker_stop: watch::Sender<bool>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug, Default)]
struct RunState {
    running: bool,
    started_at: Option<DateTime<Utc>>,
}

/// Snapshot of the daemon state for status reporting.
#[derive(Debug, Clone)]
pub struct Status {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub ports: Vec<PortStatus>,
}

#[derive(Debug, Clone)]
pub struct PortStatus {
    pub port: u16,
    pub protocol: String,
    pub tag: String,
    pub max_ips: usize,
    pub current_ips: usize,
}

impl App {
    /// Load the config, open the database and wire the subsystems together.
    pub async fn new(config_path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let config_path = config_path.into();
        let config = Config::from_file(&config_path)?;

        let db = Database::open(&config.global.database_path)
            .await
            .context("failed to initialise database")?;

        let config = Arc::new(RwLock::new(config));
        let enforcer = Arc::new(Enforcer::new(Arc::clone(&config)));
        let coordinator = Arc::new(Coordinator::new(Arc::clone(&config)));

        let (worker_stop, _) = watch::channel(false);

        let app = Arc::new(Self {
            config,
            config_path,
            coordinator,
            enforcer,
            db: Arc::new(db),
            state: RwLock::new(RunState::default()),
            worker_stop,
            workers: tokio::sync::Mutex::new(Vec::new()),
        });

        let weak: Weak<App> = Arc::downgrade(&app);
        app.coordinator.set_overlimit_callback(Arc::new(move |port, current, max| {
            if let Some(app) = weak.upgrade() {
                app.handle_overlimit(port, current, max);
            }
        }));

        tracing::info!("application initialised from {}", app.config_path.display());
        Ok(app)
    }

    /// Start monitoring and the background workers.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write().unwrap();
            anyhow::ensure!(!state.running, "already running");
            state.running = true;
            state.started_at = Some(Utc::now());
        }

        tracing::info!("========== NAM starting ==========");

        let runner = SystemRunner;
        if !executor::ss_available(&runner) {
            tracing::warn!("ss not available, connection sampling will fail");
        }
        if !executor::iptables_available(&runner) {
            tracing::warn!("iptables not available, bans will fail");
        }

        self.coordinator.start().await?;

        let mut workers = self.workers.lock().await;
        workers.push(tokio::spawn(
            Arc::clone(self).statistics_worker(self.worker_stop.subscribe()),
        ));
        workers.push(tokio::spawn(
            Arc::clone(self).cleanup_worker(self.worker_stop.subscribe()),
        ));

        tracing::info!("NAM started");
        Ok(())
    }

    /// Block on the signal loop: SIGHUP reloads, SIGTERM/SIGINT shut down.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        let mut sighup =
            signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT, shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    tracing::info!("received SIGHUP, reloading configuration");
                    if let Err(err) = self.reload().await {
                        tracing::error!("reload failed, keeping previous config: {err:#}");
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Re-read the config file and apply the new rule set. On a load or
    /// validation failure the previous config stays in force.
    pub async fn reload(self: &Arc<Self>) -> Result<()> {
        tracing::info!("========== reloading configuration ==========");

        let new_config = Config::from_file(&self.config_path)?;

        *self.config.write().unwrap() = new_config.clone();
        self.coordinator.reconfigure(&new_config).await;

        tracing::info!("configuration reloaded");
        Ok(())
    }

    /// Graceful shutdown. Idempotent.
    pub async fn shutdown(self: &Arc<Self>) {
        {
            let mut state = self.state.write().unwrap();
            if !state.running {
                return;
            }
            state.running = false;
        }

        tracing::info!("========== NAM stopping ==========");

        self.coordinator.stop().await;

        let _ = self.worker_stop.send(true);
        let mut workers = self.workers.lock().await;
        let drain = async {
            for handle in workers.drain(..) {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(WORKER_SHUTDOWN_TIMEOUT, drain).await.is_err() {
            tracing::warn!("timed out waiting for background workers");
        }

        self.persist_final_sessions().await;

        // Pending unban timers stop; filter rules stay installed so banned
        // clients remain blocked across the restart.
        self.enforcer.shutdown();

        self.db.close().await;
        tracing::info!("NAM stopped");
    }

    pub fn status(&self) -> Status {
        let state = self.state.read().unwrap();
        let config = self.config.read().unwrap();

        let ports = config
            .rules
            .iter()
            .map(|rule| PortStatus {
                port: rule.port,
                protocol: rule.protocol.clone(),
                tag: rule.tag.clone(),
                max_ips: rule.max_ips,
                current_ips: self
                    .coordinator
                    .get_tracker(rule.port)
                    .map(|t| t.count())
                    .unwrap_or(0),
            })
            .collect();

        Status {
            running: state.running,
            started_at: state.started_at,
            ports,
        }
    }

    pub fn enforcer(&self) -> &Arc<Enforcer> {
        &self.enforcer
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Overlimit callback, invoked synchronously on the polling task.
    fn handle_overlimit(self: Arc<Self>, port: u16, current: usize, max: usize) {
        tracing::warn!("port {port} overlimit: {current} IPs, max {max}");

        let rule = {
            let config = self.config.read().unwrap();
            config.rule_for_port(port).cloned()
        };
        let Some(rule) = rule else {
            tracing::error!("no rule for overlimit port {port}");
            return;
        };

        let Some(tracker) = self.coordinator.get_tracker(port) else {
            tracing::error!("no tracker for overlimit port {port}");
            return;
        };

        let records = self.enforcer.enforce(port, &tracker, &rule);

        // History is best-effort and stays off the polling task.
        for record in records {
            let db = Arc::clone(&self.db);
            tokio::spawn(async move {
                if let Err(err) = db.record_ban(&record).await {
                    tracing::error!("recording ban history failed: {err:#}");
                }
            });
        }
    }

    async fn statistics_worker(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        tracing::info!("statistics worker started");

        let period = Duration::from_secs(3600);
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.collect_statistics().await,
                _ = stop.changed() => break,
            }
        }

        tracing::info!("statistics worker stopped");
    }

    async fn collect_statistics(&self) {
        let rules: Vec<u16> = {
            let config = self.config.read().unwrap();
            config.rules.iter().map(|r| r.port).collect()
        };

        let hour = Utc::now()
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or_else(Utc::now);

        for port in rules {
            let Some(tracker) = self.coordinator.get_tracker(port) else {
                continue;
            };

            let sessions = tracker.count();
            let stats = PortStatistics {
                hour,
                unique_ips: sessions as u32,
                total_bans: self.enforcer.active_bans().len() as u32,
                avg_sessions: sessions as f64,
                max_sessions: sessions as u32,
            };

            if let Err(err) = self.db.record_statistics(port, &stats).await {
                tracing::error!("recording statistics for port {port} failed: {err:#}");
            }
        }
    }

    async fn cleanup_worker(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        tracing::info!("cleanup worker started");

        let period = Duration::from_secs(24 * 3600);
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let days = self.config.read().unwrap().global.history_days;
                    if days > 0 {
                        if let Err(err) = self.db.cleanup(days).await {
                            tracing::error!("database cleanup failed: {err:#}");
                        }
                    }
                }
                _ = stop.changed() => break,
            }
        }

        tracing::info!("cleanup worker stopped");
    }

    async fn persist_final_sessions(&self) {
        tracing::info!("persisting live sessions");

        let ports: Vec<u16> = {
            let config = self.config.read().unwrap();
            config.rules.iter().map(|r| r.port).collect()
        };

        for port in ports {
            let Some(tracker) = self.coordinator.get_tracker(port) else {
                continue;
            };
            for session in tracker.active_sessions() {
                if let Err(err) = self.db.record_session(&session).await {
                    tracing::error!("recording session failed: {err:#}");
                }
            }
        }
    }
}
