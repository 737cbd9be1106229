//! Open vSwitch backend.
//!
//! Bridge and port changes go through `ovs-vsctl`, flow tables through
//! `ovs-ofctl`. Every call is a short-lived child process.

use std::process::Stdio;

use async_trait::async_trait;
use sdnagent_flows::Flow;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{FlowSwitch, SwitchError};

/// Switch backed by the OVS command line tools.
#[derive(Debug, Clone)]
pub struct OvsSwitch {
    vsctl: String,
    ofctl: String,
}

impl OvsSwitch {
    pub fn new() -> Self {
        Self {
            vsctl: "ovs-vsctl".to_string(),
            ofctl: "ovs-ofctl".to_string(),
        }
    }

    /// Use alternative binaries (e.g. wrappers that enter a container).
    pub fn with_binaries(vsctl: impl Into<String>, ofctl: impl Into<String>) -> Self {
        Self {
            vsctl: vsctl.into(),
            ofctl: ofctl.into(),
        }
    }

    async fn vsctl(&self, args: &[&str]) -> Result<String, SwitchError> {
        run(&self.vsctl, args, None).await
    }

    async fn ofctl(&self, args: &[&str], stdin: Option<String>) -> Result<String, SwitchError> {
        run(&self.ofctl, args, stdin).await
    }
}

impl Default for OvsSwitch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlowSwitch for OvsSwitch {
    async fn add_bridge(&self, bridge: &str) -> Result<(), SwitchError> {
        self.vsctl(&["--may-exist", "add-br", bridge]).await?;
        Ok(())
    }

    async fn del_bridge(&self, bridge: &str) -> Result<(), SwitchError> {
        self.vsctl(&["--if-exists", "del-br", bridge]).await?;
        Ok(())
    }

    async fn list_ports(&self, bridge: &str) -> Result<Vec<String>, SwitchError> {
        let out = self.vsctl(&["list-ports", bridge]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn add_port(&self, bridge: &str, port: &str) -> Result<(), SwitchError> {
        self.vsctl(&["--may-exist", "add-port", bridge, port]).await?;
        Ok(())
    }

    async fn del_port(&self, bridge: &str, port: &str) -> Result<(), SwitchError> {
        self.vsctl(&["--if-exists", "del-port", bridge, port]).await?;
        Ok(())
    }

    async fn dump_flows(&self, bridge: &str) -> Result<Vec<Flow>, SwitchError> {
        let out = self.ofctl(&["dump-flows", bridge], None).await?;
        Ok(parse_dump(&out))
    }

    async fn add_flows(&self, bridge: &str, flows: &[Flow]) -> Result<(), SwitchError> {
        if flows.is_empty() {
            return Ok(());
        }
        let input = batch(flows, Flow::to_string);
        self.ofctl(&["add-flows", bridge, "-"], Some(input)).await?;
        Ok(())
    }

    async fn del_flows(&self, bridge: &str, flows: &[Flow]) -> Result<(), SwitchError> {
        if flows.is_empty() {
            return Ok(());
        }
        let input = batch(flows, Flow::match_spec);
        self.ofctl(&["--strict", "del-flows", bridge, "-"], Some(input))
            .await?;
        Ok(())
    }
}

/// One line per flow, for `ovs-ofctl` reading from stdin.
fn batch(flows: &[Flow], line: impl Fn(&Flow) -> String) -> String {
    let mut input = String::new();
    for flow in flows {
        input.push_str(&line(flow));
        input.push('\n');
    }
    input
}

/// Parse `dump-flows` output, skipping the reply header and odd lines.
fn parse_dump(out: &str) -> Vec<Flow> {
    out.lines()
        .filter(|l| l.contains("actions="))
        .filter_map(|l| match l.parse::<Flow>() {
            Ok(flow) => Some(flow),
            Err(e) => {
                warn!(line = %l.trim(), error = %e, "Skipping unparseable flow");
                None
            }
        })
        .collect()
}

/// Run a command and return its stdout.
async fn run(program: &str, args: &[&str], stdin: Option<String>) -> Result<String, SwitchError> {
    debug!(program, args = ?args, "Running switch command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
        // closing stdin lets the tool see EOF
        drop(pipe);
    }

    let output = child.wait_with_output().await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SwitchError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
