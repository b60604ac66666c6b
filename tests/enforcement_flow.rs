//! End-to-end enforcement scenarios driven through the public API, with a
//! recording command runner standing in for ss and iptables.

use chrono::Utc;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};

use nam::config::Config;
use nam::enforcer::{CommandRunner, Enforcer, BAN_MARKER};
use nam::monitor::types::Connection;
use nam::monitor::PortTracker;

/// Records every invocation and reports success without touching the system.
#[derive(Default)]
struct RecordingRunner {
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl RecordingRunner {
    fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Invocations of `program` whose argv contains `needle`.
    fn matching(&self, program: &str, needle: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|(p, args)| p == program && args.iter().any(|a| a == needle))
            .map(|(_, args)| args)
            .collect()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<std::process::Output> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));

        use std::os::unix::process::ExitStatusExt;
        Ok(std::process::Output {
            status: std::process::ExitStatus::from_raw(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
}

fn build_enforcer(yaml: &str) -> (Enforcer, Arc<RecordingRunner>, Config) {
    let config = Config::from_str_checked(yaml).unwrap();
    let runner = Arc::new(RecordingRunner::default());
    let enforcer = Enforcer::with_runner(
        Arc::new(RwLock::new(config.clone())),
        Arc::clone(&runner) as Arc<dyn CommandRunner>,
    );
    (enforcer, runner, config)
}

fn conn(port: u16, remote: &str) -> Connection {
    Connection {
        local_addr: "0.0.0.0".parse().unwrap(),
        local_port: port,
        remote_addr: remote.parse().unwrap(),
        remote_port: 50000,
        state: "ESTAB".to_string(),
        recv_q: 0,
        send_q: 0,
        detected_at: Utc::now(),
    }
}

/// Feed samples one IP at a time so first-seen timestamps are ordered.
fn observe_in_order(tracker: &PortTracker, port: u16, ips: &[&str]) {
    let mut present: Vec<&str> = Vec::new();
    for ip in ips {
        present.push(ip);
        let sample: Vec<Connection> = present.iter().map(|i| conn(port, i)).collect();
        tracker.update(&sample);
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[tokio::test]
async fn fifo_eviction_kills_bans_and_arms_unbans() {
    let (enforcer, runner, config) = build_enforcer(
        r#"
global:
  check_interval: 5
  ban_duration: 60
  strategy: FIFO
rules:
  - port: 443
    max_ips: 2
"#,
    );

    let tracker = PortTracker::new(443);
    observe_in_order(&tracker, 443, &["203.0.113.1", "203.0.113.2", "203.0.113.3", "203.0.113.4"]);
    assert_eq!(tracker.count(), 4);

    let rule = config.rule_for_port(443).unwrap();

    let before = Utc::now();
    let records = enforcer.enforce(443, &tracker, rule);

    // The two oldest sessions are the victims.
    let mut banned: Vec<IpAddr> = records.iter().map(|r| r.ip).collect();
    banned.sort();
    assert_eq!(banned, vec![ip("203.0.113.1"), ip("203.0.113.2")]);

    for record in &records {
        assert_eq!(record.port, 443);
        assert_eq!(record.duration, 60);
        assert_eq!(record.reason, "Overlimit");
        assert_eq!(record.strategy, "FIFO");
        assert!(record.banned_at <= record.expire_at);
    }

    // Both flows were killed and both ban rules carry the marker.
    let kills = runner.matching("ss", "-K");
    assert_eq!(kills.len(), 2);
    assert!(kills.iter().all(|args| args.contains(&":443".to_string())));

    let inserts = runner.matching("iptables", "-I");
    assert_eq!(inserts.len(), 2);
    assert!(inserts.iter().all(|args| args.contains(&BAN_MARKER.to_string())));

    // Unbans are armed roughly sixty seconds out.
    for victim in [ip("203.0.113.1"), ip("203.0.113.2")] {
        assert!(enforcer.is_banned(victim, 443));
        let expiry = enforcer.ban_expiry(victim, 443).unwrap();
        let delta = (expiry - before).num_seconds();
        assert!((59..=61).contains(&delta), "expiry {delta}s out");
    }
    assert_eq!(enforcer.active_bans().len(), 2);
    assert!(!enforcer.is_banned(ip("203.0.113.3"), 443));
}

#[tokio::test]
async fn lifo_with_allow_list_spares_protected_clients() {
    let (enforcer, runner, config) = build_enforcer(
        r#"
global:
  check_interval: 5
  ban_duration: 30
rules:
  - port: 8443
    max_ips: 1
    strategy: LIFO
    whitelist:
      - 10.0.0.0/8
"#,
    );

    let tracker = PortTracker::new(8443);
    observe_in_order(&tracker, 8443, &["10.1.2.3", "1.2.3.4", "5.6.7.8"]);

    let rule = config.rule_for_port(8443).unwrap();

    let records = enforcer.enforce(8443, &tracker, rule);

    // Overlimit is two and only two candidates survive the allow-list
    // filter, so both public clients go and the protected one stays.
    let mut banned: Vec<IpAddr> = records.iter().map(|r| r.ip).collect();
    banned.sort();
    assert_eq!(banned, vec![ip("1.2.3.4"), ip("5.6.7.8")]);

    let killed_protected = runner.matching("ss", "10.1.2.3");
    assert!(killed_protected.is_empty());
    assert!(!enforcer.is_banned(ip("10.1.2.3"), 8443));
}

#[tokio::test]
async fn at_limit_port_triggers_nothing() {
    let (enforcer, runner, config) = build_enforcer(
        r#"
global:
  ban_duration: 60
rules:
  - port: 443
    max_ips: 2
"#,
    );

    let tracker = PortTracker::new(443);
    observe_in_order(&tracker, 443, &["203.0.113.1", "203.0.113.2"]);

    let records = enforcer.enforce(443, &tracker, config.rule_for_port(443).unwrap());

    assert!(records.is_empty());
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn zero_ban_duration_kills_without_filtering() {
    let (enforcer, runner, config) = build_enforcer(
        r#"
global:
  ban_duration: 0
rules:
  - port: 443
    max_ips: 1
"#,
    );

    let tracker = PortTracker::new(443);
    observe_in_order(&tracker, 443, &["203.0.113.1", "203.0.113.2"]);

    let records = enforcer.enforce(443, &tracker, config.rule_for_port(443).unwrap());

    // Connections die but no rule is installed and no unban is armed.
    assert!(records.is_empty());
    assert_eq!(runner.matching("ss", "-K").len(), 1);
    assert!(runner.matching("iptables", "-I").is_empty());
    assert!(enforcer.active_bans().is_empty());
}

#[tokio::test]
async fn shutdown_preserves_installed_bans() {
    let (enforcer, runner, _config) = build_enforcer(
        r#"
global:
  ban_duration: 300
rules:
  - port: 443
    max_ips: 1
"#,
    );

    enforcer.manual_ban(ip("198.51.100.7"), 443, 300, "Manual").unwrap();
    assert!(enforcer.is_banned(ip("198.51.100.7"), 443));
    assert_eq!(runner.matching("iptables", "-I").len(), 1);

    enforcer.shutdown();

    // The scheduler is empty but no delete ever ran: the rule outlives us.
    assert!(enforcer.active_bans().is_empty());
    assert!(runner.matching("iptables", "-D").is_empty());
}

#[tokio::test]
async fn manual_unban_removes_the_rule_and_the_job() {
    let (enforcer, runner, _config) = build_enforcer(
        r#"
global:
  ban_duration: 300
rules:
  - port: 443
    max_ips: 1
"#,
    );

    let target = ip("198.51.100.7");
    let record = enforcer.manual_ban(target, 443, 300, "Manual").unwrap();
    assert_eq!(record.strategy, "MANUAL");
    assert_eq!(record.reason, "Manual");

    enforcer.manual_unban(target, 443).unwrap();
    assert!(!enforcer.is_banned(target, 443));

    let deletes = runner.matching("iptables", "-D");
    assert_eq!(deletes.len(), 1);
    assert!(deletes[0].contains(&BAN_MARKER.to_string()));

    // Unbanning an IP with no scheduled job falls back to a bare removal.
    enforcer.manual_unban(ip("198.51.100.8"), 443).unwrap();
    assert_eq!(runner.matching("iptables", "-D").len(), 2);
}

#[tokio::test]
async fn deny_list_is_queryable_through_the_enforcer() {
    let (enforcer, _runner, _config) = build_enforcer(
        r#"
global: {}
rules:
  - port: 443
    max_ips: 1
    blacklist:
      - 192.0.2.0/24
"#,
    );

    assert!(enforcer.is_denylisted(ip("192.0.2.55"), 443));
    assert!(!enforcer.is_denylisted(ip("192.0.3.55"), 443));
}
