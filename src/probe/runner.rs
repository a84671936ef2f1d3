//! Runs the external `ping` program and hands its output to the parser

use super::{parser, ParseError, Run};
use log::{debug, info, warn};
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::string::FromUtf8Error;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

const DEFAULT_PROGRAM: &str = "ping";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe count must be at least 1")]
    ZeroCount,
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O error talking to probe: {0}")]
    Io(#[from] io::Error),
    #[error("probe output is not valid UTF-8: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("probe did not finish within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// How the probe program is invoked
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub program: PathBuf,
    /// Inserted before `-c <count> <host>`
    pub args: Vec<String>,
    /// `None` waits for the probe forever
    pub timeout: Option<Duration>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
            args: Vec::new(),
            timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProbeRunner {
    config: ProbeConfig,
}

impl ProbeRunner {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Pings `host` `count` times.
    ///
    /// A non-zero exit yields `Ok(Run::failure())` without looking at the
    /// output. Only a clean exit is parsed.
    pub fn perform(&self, host: &str, count: u32) -> Result<Run, ProbeError> {
        if count == 0 {
            return Err(ProbeError::ZeroCount);
        }
        info!("running ping test");

        let mut command = self.command(host, count);
        debug!("running command {:?}", command);

        let mut child = command.spawn().map_err(|source| ProbeError::Spawn {
            program: self.config.program.display().to_string(),
            source,
        })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match self.config.timeout {
            Some(limit) => wait_with_deadline(&mut child, limit)?,
            None => child.wait()?,
        };

        let stdout = join(stdout)?;
        let stderr = join(stderr)?;

        if !status.success() {
            warn!("ping failed with {}", status);
            debug!("probe stderr: {}", String::from_utf8_lossy(&stderr).trim_end());
            return Ok(Run::failure());
        }

        info!("successful ping");
        let text = String::from_utf8(stdout)?;
        Ok(parser::parse(&text)?)
    }

    fn command(&self, host: &str, count: u32) -> Command {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .arg("-c")
            .arg(count.to_string())
            .arg(host)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

/// Reads a pipe to the end on its own thread so a chatty child never
/// blocks on a full pipe while we wait for it.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}

fn join(handle: JoinHandle<io::Result<Vec<u8>>>) -> io::Result<Vec<u8>> {
    handle
        .join()
        .unwrap_or_else(|_| Err(io::Error::other("pipe reader panicked")))
}

// Readers are left detached on timeout: a grandchild may still hold the pipe.
fn wait_with_deadline(child: &mut Child, limit: Duration) -> Result<ExitStatus, ProbeError> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if started.elapsed() >= limit {
            warn!("ping exceeded {:?}, killing it", limit);
            // Fails when the child exited between try_wait and kill
            if let Err(e) = child.kill() {
                debug!("kill after timeout: {}", e);
            }
            match child.wait() {
                Ok(status) => debug!("ping ended with {} after kill", status),
                Err(e) => warn!("could not reap ping after kill: {}", e),
            }
            return Err(ProbeError::Timeout(limit));
        }
        thread::sleep(POLL_INTERVAL);
    }
}
