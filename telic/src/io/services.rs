//! Service health probes.
//!
//! The supervisor only consumes a binary running/not-running signal per
//! service; how a service is started is someone else's problem. Probe
//! order: custom command when declared, else HTTP health endpoint, else a
//! bare TCP connect.

use std::net::{SocketAddr, TcpStream};
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, instrument};

use crate::io::config::ServiceSpec;
use crate::io::process::run_captured;

/// Binary probe outcome. `reason` is evidence for the diagnosis agent, not
/// a classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Running,
    NotRunning { reason: String },
}

impl ProbeResult {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Abstraction over health probing; tests script per-service outcomes.
pub trait ServiceProbe {
    fn probe(&self, service: &ServiceSpec, timeout: Duration) -> ProbeResult;
}

/// Production probe: command, HTTP, or TCP per the service declaration.
pub struct DefaultProbe;

impl ServiceProbe for DefaultProbe {
    #[instrument(skip_all, fields(service = %service.name))]
    fn probe(&self, service: &ServiceSpec, timeout: Duration) -> ProbeResult {
        if let Some(command) = &service.probe_command {
            return probe_command(command, timeout);
        }
        if let Some(path) = &service.health_path {
            return probe_http(service.port, path, timeout);
        }
        probe_tcp(service.port, timeout)
    }
}

fn probe_command(command: &[String], timeout: Duration) -> ProbeResult {
    let Some(program) = command.first() else {
        return ProbeResult::NotRunning {
            reason: "empty probe command".to_string(),
        };
    };
    let mut cmd = Command::new(program);
    cmd.args(&command[1..]);
    match run_captured(cmd, None, timeout, 10_000) {
        Ok(captured) if captured.success() => ProbeResult::Running,
        Ok(captured) => ProbeResult::NotRunning {
            reason: format!(
                "probe command exited {:?}: {}",
                captured.exit_code(),
                captured.stderr.trim()
            ),
        },
        Err(err) => ProbeResult::NotRunning {
            reason: format!("probe command failed to run: {err:#}"),
        },
    }
}

fn probe_http(port: u16, path: &str, timeout: Duration) -> ProbeResult {
    let url = format!("http://127.0.0.1:{port}{path}");
    debug!(%url, "http probe");
    let client = match reqwest::blocking::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(err) => {
            return ProbeResult::NotRunning {
                reason: format!("http client build failed: {err}"),
            };
        }
    };
    match client.get(&url).send() {
        Ok(response) if response.status().is_success() => ProbeResult::Running,
        Ok(response) => ProbeResult::NotRunning {
            reason: format!("{url} answered {}", response.status()),
        },
        Err(err) => ProbeResult::NotRunning {
            reason: format!("{url} unreachable: {err}"),
        },
    }
}

fn probe_tcp(port: u16, timeout: Duration) -> ProbeResult {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    match TcpStream::connect_timeout(&addr, timeout) {
        Ok(_) => ProbeResult::Running,
        Err(err) => ProbeResult::NotRunning {
            reason: format!("tcp connect to {addr} failed: {err}"),
        },
    }
}

/// Probe every declared service; returns `(service, result)` pairs in
/// declaration order.
pub fn probe_all<'a, P: ServiceProbe + ?Sized>(
    probe: &P,
    services: &'a [ServiceSpec],
    timeout: Duration,
) -> Result<Vec<(&'a ServiceSpec, ProbeResult)>> {
    Ok(services
        .iter()
        .map(|service| (service, probe.probe(service, timeout)))
        .collect())
}
