//! Spawning the writer and fetcher processes. The orchestrator only sees the
//! `Launcher` and `ChildHandle` traits, so tests can drive it with fakes.

use crate::protocol::{parse_child_line, write_json_line, ChildMessage, FetcherPayload};
use crate::ExtractError;
use crossbeam_channel::Sender;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

pub const WRITER_BIN: &str = "buffer_writer";
pub const FETCHER_BIN: &str = "org_fetcher";

/// A message from a child, tagged with the child's label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEvent {
    pub source: String,
    pub message: ChildMessage,
}

pub trait ChildHandle: Send {
    fn label(&self) -> &str;

    /// `None` while running, `Some(code)` once exited (`code` is `None` when
    /// the process was killed by a signal).
    fn try_wait(&mut self) -> Result<Option<Option<i32>>, ExtractError>;

    /// Ask the child to finish its work and exit.
    fn request_shutdown(&mut self);

    fn kill(&mut self);
}

pub trait Launcher {
    fn spawn_writer(
        &mut self,
        data_dir: &Path,
        comparison_id: &str,
        events: Sender<ChildEvent>,
    ) -> Result<Box<dyn ChildHandle>, ExtractError>;

    fn spawn_fetcher(
        &mut self,
        payload: &FetcherPayload,
        events: Sender<ChildEvent>,
    ) -> Result<Box<dyn ChildHandle>, ExtractError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerBinaries {
    pub writer: PathBuf,
    pub fetcher: PathBuf,
}

impl WorkerBinaries {
    /// Worker binaries installed next to the running executable. Under
    /// `cargo test` the executable lives in `deps/`, so its parent is checked
    /// too.
    pub fn beside_current_exe() -> Result<Self, ExtractError> {
        let exe = std::env::current_exe()?;
        let mut dirs = Vec::new();
        if let Some(dir) = exe.parent() {
            dirs.push(dir.to_path_buf());
            if let Some(parent) = dir.parent() {
                dirs.push(parent.to_path_buf());
            }
        }
        let find = |name: &str| -> Result<PathBuf, ExtractError> {
            let file = format!("{}{}", name, std::env::consts::EXE_SUFFIX);
            dirs.iter()
                .map(|d| d.join(&file))
                .find(|p| p.is_file())
                .ok_or_else(|| ExtractError::Config(format!("cannot find worker binary '{}' near {}", file, exe.display())))
        };
        Ok(Self { writer: find(WRITER_BIN)?, fetcher: find(FETCHER_BIN)? })
    }
}

struct ProcessChild {
    label: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout_reader: Option<JoinHandle<()>>,
    exited: Option<Option<i32>>,
}

impl ChildHandle for ProcessChild {
    fn label(&self) -> &str {
        &self.label
    }

    fn try_wait(&mut self) -> Result<Option<Option<i32>>, ExtractError> {
        if self.exited.is_none() {
            if let Some(status) = self.child.try_wait()? {
                // Every message the child wrote is forwarded before its exit
                // is reported.
                if let Some(reader) = self.stdout_reader.take() {
                    let _ = reader.join();
                }
                self.exited = Some(status.code());
            }
        }
        Ok(self.exited)
    }

    fn request_shutdown(&mut self) {
        // Closing stdin is the shutdown signal.
        self.stdin.take();
    }

    fn kill(&mut self) {
        if self.exited.is_some() {
            return;
        }
        if let Err(e) = self.child.kill() {
            debug!(child = %self.label, error = %e, "kill failed");
        }
        match self.child.wait() {
            Ok(status) => self.exited = Some(status.code()),
            Err(e) => warn!(child = %self.label, error = %e, "failed to reap child"),
        }
    }
}

fn forward_stdout(label: String, child: &mut Child, events: Sender<ChildEvent>) -> Result<JoinHandle<()>, ExtractError> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExtractError::Protocol(format!("{} has no stdout", label)))?;
    let reader = thread::Builder::new()
        .name(format!("{}-stdout", label))
        .spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                match parse_child_line(&line) {
                    Some(message) => {
                        if events.send(ChildEvent { source: label.clone(), message }).is_err() {
                            break;
                        }
                    }
                    None if !line.trim().is_empty() => debug!(child = %label, line = %line, "non-protocol output"),
                    None => {}
                }
            }
        })?;
    Ok(reader)
}

/// Launches the worker binaries as OS processes. Children inherit stderr, so
/// their logs appear alongside the orchestrator's.
pub struct ProcessLauncher {
    binaries: WorkerBinaries,
}

impl ProcessLauncher {
    pub fn new(binaries: WorkerBinaries) -> Self {
        Self { binaries }
    }

    fn spawn(&self, role: &str, label: String, mut command: Command) -> Result<(Child, String), ExtractError> {
        let child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| ExtractError::Spawn { role: role.to_string(), source })?;
        debug!(role, child = %label, pid = child.id(), "spawned");
        Ok((child, label))
    }
}

impl Launcher for ProcessLauncher {
    fn spawn_writer(
        &mut self,
        data_dir: &Path,
        comparison_id: &str,
        events: Sender<ChildEvent>,
    ) -> Result<Box<dyn ChildHandle>, ExtractError> {
        let mut command = Command::new(&self.binaries.writer);
        command.arg("--data-dir").arg(data_dir).arg("--comparison-id").arg(comparison_id);
        let (mut child, label) = self.spawn("buffer writer", "writer".to_string(), command)?;
        let stdout_reader = match forward_stdout(label.clone(), &mut child, events) {
            Ok(reader) => Some(reader),
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };
        let stdin = child.stdin.take();
        Ok(Box::new(ProcessChild { label, child, stdin, stdout_reader, exited: None }))
    }

    fn spawn_fetcher(
        &mut self,
        payload: &FetcherPayload,
        events: Sender<ChildEvent>,
    ) -> Result<Box<dyn ChildHandle>, ExtractError> {
        let command = Command::new(&self.binaries.fetcher);
        let (mut child, label) = self.spawn("fetcher", payload.job.fetcher_id.clone(), command)?;
        let stdout_reader = match forward_stdout(label.clone(), &mut child, events) {
            Ok(reader) => Some(reader),
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };
        let mut handle = ProcessChild { label, child, stdin: None, stdout_reader, exited: None };
        let Some(mut stdin) = handle.child.stdin.take() else {
            handle.kill();
            return Err(ExtractError::Protocol(format!("{} has no stdin", handle.label)));
        };
        if let Err(e) = write_json_line(&mut stdin, payload) {
            handle.kill();
            return Err(e);
        }
        drop(stdin);
        Ok(Box::new(handle))
    }
}
