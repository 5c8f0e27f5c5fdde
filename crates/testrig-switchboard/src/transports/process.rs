/*!
 * Subprocess transport.
 *
 * Runs a host program and talks to it over its pipes: stdout is the read side,
 * stdin the write side. SSH shells, ADB shells and docker/pty style processes
 * are all realised as a process transport with the right command line.
 * Stderr is forwarded to tracing at debug level.
 */
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{Result, SwitchboardError};
use crate::transport::{Transport, TransportStreams};

const KILL_GRACE: Duration = Duration::from_secs(2);

/// Transport backed by a child process
#[derive(Debug)]
pub struct ProcessTransport {
    /// Device address this process talks to, used for logging and errors
    address: String,
    /// Program to execute
    program: String,
    /// Program arguments
    args: Vec<String>,
    /// The running child, if open
    child: Option<Child>,
}

impl ProcessTransport {
    /// Create a transport that runs `program` with `args`
    pub fn new<A, P, I, S>(address: A, program: P, args: I) -> Self
    where
        A: Into<String>,
        P: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            address: address.into(),
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            child: None,
        }
    }

    /// Create a transport from a whitespace separated command line
    pub fn from_command_line<A: Into<String>>(address: A, command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| SwitchboardError::transport(command_line, "empty command line"))?;
        Ok(Self::new(address, program, parts))
    }

    /// The program this transport runs
    pub fn program(&self) -> &str {
        &self.program
    }

    /// The arguments passed to the program
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    fn name(&self) -> &'static str {
        "process"
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn is_open(&self) -> bool {
        self.child.is_some()
    }

    async fn open(&mut self) -> Result<TransportStreams> {
        if self.child.is_some() {
            return Err(SwitchboardError::transport(&self.address, "process already running"));
        }

        debug!("Spawning {} {:?} for {}", self.program, self.args, self.address);
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SwitchboardError::transport(&self.address, format!("failed to spawn {}: {}", self.program, e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SwitchboardError::transport(&self.address, "child stdout unavailable"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SwitchboardError::transport(&self.address, "child stdin unavailable"))?;

        if let Some(stderr) = child.stderr.take() {
            let address = self.address.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "testrig_switchboard::stderr", "{}: {}", address, line);
                }
            });
        }

        info!("Started process transport for {}", self.address);
        self.child = Some(child);
        Ok(TransportStreams::new(stdout, stdin))
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Err(e) = child.start_kill() {
            // The process may already have exited on its own
            debug!("Kill of {} process returned {}", self.address, e);
        }
        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!("Process for {} exited with {}", self.address, status),
            Ok(Err(e)) => warn!("Failed to reap process for {}: {}", self.address, e),
            Err(_) => warn!("Process for {} did not exit within {:?}", self.address, KILL_GRACE),
        }
        Ok(())
    }
}
