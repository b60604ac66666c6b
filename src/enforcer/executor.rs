//! Kernel-side enforcement.
//!
//! Tears down established flows with `ss -K` and manages iptables INPUT
//! rules. Every rule the daemon inserts or deletes carries the reserved
//! comment marker, so operator-installed rules are never touched. Commands
//! run synchronously; the exit status is the ground truth.

use std::net::IpAddr;
use std::process::{Command, Output};
use std::sync::Arc;
use thiserror::Error;

use super::cooldown::CooldownManager;

/// Comment marker attached to every filter rule the daemon owns.
pub const BAN_MARKER: &str = "NAM-BAN";

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to invoke {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        tool: &'static str,
        code: Option<i32>,
        stderr: String,
    },
}

/// Runs external commands. Swapped for a recording fake in tests.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<Output>;
}

/// Production runner: spawns the real tool and waits for it.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<Output> {
        Command::new(program).args(args).output()
    }
}

fn run_checked(
    runner: &dyn CommandRunner,
    tool: &'static str,
    args: Vec<String>,
) -> Result<(), ExecError> {
    let output = runner
        .run(tool, &args)
        .map_err(|source| ExecError::Spawn { tool, source })?;

    if !output.status.success() {
        return Err(ExecError::CommandFailed {
            tool,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}

pub(crate) fn kill_flow_args(port: u16, ip: IpAddr) -> Vec<String> {
    vec![
        "-K".into(),
        "dst".into(),
        ip.to_string(),
        "sport".into(),
        "=".into(),
        format!(":{port}"),
    ]
}

fn filter_rule_args(op: &str, ip: IpAddr, port: u16) -> Vec<String> {
    vec![
        op.into(),
        "INPUT".into(),
        "-s".into(),
        ip.to_string(),
        "-p".into(),
        "tcp".into(),
        "--dport".into(),
        port.to_string(),
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        BAN_MARKER.into(),
        "-j".into(),
        "DROP".into(),
    ]
}

/// Insert the marker-tagged DROP rule for (ip, port).
pub fn insert_filter_rule(
    runner: &dyn CommandRunner,
    ip: IpAddr,
    port: u16,
) -> Result<(), ExecError> {
    run_checked(runner, "iptables", filter_rule_args("-I", ip, port))
}

/// Delete the marker-tagged DROP rule for (ip, port).
pub fn delete_filter_rule(
    runner: &dyn CommandRunner,
    ip: IpAddr,
    port: u16,
) -> Result<(), ExecError> {
    run_checked(runner, "iptables", filter_rule_args("-D", ip, port))
}

pub struct Executor {
    runner: Arc<dyn CommandRunner>,
    cooldown: Arc<CooldownManager>,
}

impl Executor {
    pub fn new(runner: Arc<dyn CommandRunner>, cooldown: Arc<CooldownManager>) -> Self {
        Self { runner, cooldown }
    }

    /// Tear down every established flow from `ip` to the local `port`.
    pub fn kill_flow(&self, port: u16, ip: IpAddr) -> Result<(), ExecError> {
        run_checked(self.runner.as_ref(), "ss", kill_flow_args(port, ip))?;
        tracing::info!("killed connections from {ip} on port {port}");
        Ok(())
    }

    /// Install the filter rule and, for a positive duration, arm the unban.
    pub fn apply_ban(&self, ip: IpAddr, port: u16, duration: u64) -> Result<(), ExecError> {
        insert_filter_rule(self.runner.as_ref(), ip, port)?;
        tracing::info!("banned {ip} on port {port} for {duration}s");

        if duration > 0 {
            self.cooldown.schedule(ip, port, duration);
        }

        Ok(())
    }

    /// Delete the filter rule for (ip, port).
    pub fn remove_ban(&self, ip: IpAddr, port: u16) -> Result<(), ExecError> {
        delete_filter_rule(self.runner.as_ref(), ip, port)?;
        tracing::info!("unbanned {ip} on port {port}");
        Ok(())
    }

    /// Evict a victim list: kill each flow, then ban when duration > 0.
    ///
    /// Best-effort batch: a failure on one victim is logged and the batch
    /// continues. Returns the IPs that were actually banned.
    pub fn enforce_victims(
        &self,
        port: u16,
        victims: &[IpAddr],
        ban_duration: u64,
        reason: &str,
    ) -> Vec<IpAddr> {
        let mut banned = Vec::new();

        for &ip in victims {
            if let Err(err) = self.kill_flow(port, ip) {
                tracing::error!("killing {ip}:{port} failed: {err}");
                continue;
            }

            if ban_duration > 0 {
                match self.apply_ban(ip, port, ban_duration) {
                    Ok(()) => banned.push(ip),
                    Err(err) => tracing::error!("banning {ip}:{port} failed: {err}"),
                }
            }

            tracing::warn!("evicted {ip} from port {port} ({reason})");
        }

        banned
    }
}

/// Probe for the packet-filter administration tool.
pub fn iptables_available(runner: &dyn CommandRunner) -> bool {
    matches!(runner.run("iptables", &["-V".into()]), Ok(out) if out.status.success())
}

/// Probe for the socket statistics tool.
pub fn ss_available(runner: &dyn CommandRunner) -> bool {
    matches!(runner.run("ss", &["-V".into()]), Ok(out) if out.status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_args_match_tool_syntax() {
        let args = kill_flow_args(443, "203.0.113.9".parse().unwrap());
        assert_eq!(args, vec!["-K", "dst", "203.0.113.9", "sport", "=", ":443"]);
    }

    #[test]
    fn filter_rule_args_carry_the_marker() {
        let insert = filter_rule_args("-I", "203.0.113.9".parse().unwrap(), 443);
        assert_eq!(
            insert,
            vec![
                "-I", "INPUT", "-s", "203.0.113.9", "-p", "tcp", "--dport", "443", "-m",
                "comment", "--comment", "NAM-BAN", "-j", "DROP"
            ]
        );

        let delete = filter_rule_args("-D", "203.0.113.9".parse().unwrap(), 443);
        assert_eq!(delete[0], "-D");
        assert_eq!(&delete[1..], &insert[1..]);
        assert!(delete.contains(&BAN_MARKER.to_string()));
    }

    #[test]
    fn ipv6_addresses_render_unbracketed() {
        let args = filter_rule_args("-I", "2001:db8::9".parse().unwrap(), 443);
        assert_eq!(args[3], "2001:db8::9");
    }
}
