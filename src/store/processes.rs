use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::validate_name;
use crate::config::{IoConfig, ProcessesConfig};
use crate::error::{MusterError, Result};
use crate::os::{self, Signal};
use crate::store::{atomic, lock};

/// How long to wait for a process to disappear after SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);
const STOP_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopped,
    Failed,
}

impl ProcessStatus {
    /// `starting` and `running` block a new `start` under the same name.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub id: String,
    pub name: String,
    pub command: Vec<String>,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub log_path: PathBuf,
    pub cwd: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_detail: Option<String>,
}

impl ProcessRecord {
    fn transition(&mut self, status: ProcessStatus, detail: Option<String>) {
        self.status = status;
        self.updated_at = Utc::now();
        if detail.is_some() {
            self.exit_detail = detail;
        }
    }
}

/// Registry of background processes under `.muster/processes/`.
///
/// Records are a cache of OS state, never the truth: every inspection first
/// checks the recorded pid and corrects a dead `running` entry to `failed`.
/// Mutations of one name are serialized by a per-name lock file.
pub struct ProcessRegistry {
    root: PathBuf,
    config: ProcessesConfig,
    io: IoConfig,
}

impl ProcessRegistry {
    pub fn open(muster_root: &Path, config: ProcessesConfig, io: IoConfig) -> Self {
        Self {
            root: muster_root.to_path_buf(),
            config,
            io,
        }
    }

    pub fn dir(&self) -> PathBuf {
        self.root.join("processes")
    }

    fn logs_dir(&self) -> PathBuf {
        self.dir().join("logs")
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir().join(format!("{name}.json"))
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.logs_dir().join(format!("{name}.log"))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.root.join("locks").join(format!("process-{name}.lock"))
    }

    pub fn default_stop_timeout(&self) -> Duration {
        self.config.stop_timeout()
    }

    // -- reconciliation -----------------------------------------------------

    /// Correct `record` against OS liveness. Returns whether it changed.
    fn reconcile(&self, record: &mut ProcessRecord) -> bool {
        match (record.status, record.pid) {
            (ProcessStatus::Running | ProcessStatus::Starting, Some(pid)) => {
                if os::pid_alive(pid) {
                    return false;
                }
                tracing::warn!(name = %record.name, pid, "recorded process is gone; marking failed");
                record.transition(
                    ProcessStatus::Failed,
                    Some(format!("process {pid} exited without being stopped")),
                );
                true
            }
            (ProcessStatus::Running, None) => {
                record.transition(ProcessStatus::Failed, Some("no pid recorded".into()));
                true
            }
            (ProcessStatus::Starting, None) => {
                let grace = chrono::Duration::from_std(self.config.starting_grace())
                    .unwrap_or(chrono::Duration::MAX);
                if Utc::now() - record.updated_at < grace {
                    return false;
                }
                tracing::warn!(name = %record.name, "start never completed; marking failed");
                record.transition(
                    ProcessStatus::Failed,
                    Some("spawn did not complete".into()),
                );
                true
            }
            _ => false,
        }
    }

    /// Read and reconcile one record while holding its name lock.
    fn load_locked(&self, name: &str) -> Result<Option<ProcessRecord>> {
        let path = self.record_path(name);
        let Some(mut record) = atomic::read_json::<ProcessRecord>(&path)? else {
            return Ok(None);
        };
        if self.reconcile(&mut record) {
            atomic::write_json(&path, &record, &self.io)?;
        }
        Ok(Some(record))
    }

    /// Reconciled view of one record.
    ///
    /// Corrections are persisted when the name lock is free; if another
    /// caller holds it (e.g. a `stop` in progress) the corrected view is
    /// returned without writing and that caller persists its own outcome.
    pub fn get(&self, name: &str) -> Result<ProcessRecord> {
        validate_name(name)?;
        let path = self.record_path(name);
        let mut record = atomic::read_json::<ProcessRecord>(&path)?
            .ok_or_else(|| MusterError::ProcessNotFound(name.into()))?;
        if self.reconcile(&mut record) {
            if let Ok(held) = lock::try_acquire_lock(&self.lock_path(name)) {
                if let Some(fresh) = self.load_locked(name)? {
                    record = fresh;
                }
                lock::release_lock(held)?;
            }
        }
        Ok(record)
    }

    /// All records after a reconciliation pass, ordered by name.
    pub fn list(&self) -> Result<Vec<ProcessRecord>> {
        let mut records = Vec::new();
        for path in atomic::list_records(&self.dir())? {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.get(stem) {
                Ok(record) => records.push(record),
                // Deregistered between listing and reading, or not ours.
                Err(MusterError::ProcessNotFound(_) | MusterError::InvalidName(_)) => {}
                Err(err) => return Err(err),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::debug!(count = records.len(), "reconciled process registry");
        Ok(records)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Spawn `command` under `name`, detached, with cwd `cwd`.
    pub fn start(&self, name: &str, command: &[String], cwd: &Path) -> Result<ProcessRecord> {
        validate_name(name)?;
        if command.is_empty() || command[0].trim().is_empty() {
            return Err(MusterError::Invalid("command must not be empty".into()));
        }
        let held = lock::acquire_lock(&self.lock_path(name), &self.io)?;
        let result = self.start_locked(name, command, cwd);
        lock::release_lock(held)?;
        result
    }

    fn start_locked(&self, name: &str, command: &[String], cwd: &Path) -> Result<ProcessRecord> {
        if let Some(existing) = self.load_locked(name)? {
            if existing.status.is_active() {
                return Err(MusterError::ProcessConflict(
                    name.into(),
                    existing.status.to_string(),
                ));
            }
        }

        std::fs::create_dir_all(self.logs_dir())?;
        let path = self.record_path(name);
        let now = Utc::now();
        let mut record = ProcessRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            command: command.to_vec(),
            pid: None,
            status: ProcessStatus::Starting,
            started_at: now,
            updated_at: now,
            log_path: self.log_path(name),
            cwd: cwd.to_path_buf(),
            exit_detail: None,
        };
        atomic::write_json(&path, &record, &self.io)?;

        match os::spawn_detached(command, cwd, &record.log_path) {
            Ok(pid) => {
                record.pid = Some(pid);
                record.transition(ProcessStatus::Running, None);
                atomic::write_json(&path, &record, &self.io)?;
                tracing::info!(name, pid, command = %command.join(" "), "started process");
                Ok(record)
            }
            Err(err) => {
                record.transition(ProcessStatus::Failed, Some(err.to_string()));
                atomic::write_json(&path, &record, &self.io)?;
                tracing::warn!(name, error = %err, "process failed to start");
                Err(err)
            }
        }
    }

    /// Terminate `name`, escalating to SIGKILL after `timeout`.
    ///
    /// Stopping a record that is already terminal is a no-op, so a `failed`
    /// status stays visible for postmortem inspection.
    pub fn stop(&self, name: &str, timeout: Duration) -> Result<ProcessRecord> {
        validate_name(name)?;
        let held = lock::acquire_lock(&self.lock_path(name), &self.io)?;
        let result = self.stop_locked(name, timeout);
        lock::release_lock(held)?;
        result
    }

    fn stop_locked(&self, name: &str, timeout: Duration) -> Result<ProcessRecord> {
        let mut record = self
            .load_locked(name)?
            .ok_or_else(|| MusterError::ProcessNotFound(name.into()))?;
        if !record.status.is_active() {
            return Ok(record);
        }

        let detail = match record.pid {
            Some(pid) => {
                if terminate(pid, timeout)? {
                    format!("killed after {}ms timeout", timeout.as_millis())
                } else {
                    "terminated".to_string()
                }
            }
            None => "stopped before spawn completed".to_string(),
        };
        record.transition(ProcessStatus::Stopped, Some(detail));
        atomic::write_json(&self.record_path(name), &record, &self.io)?;
        tracing::info!(name, pid = ?record.pid, "stopped process");
        Ok(record)
    }

    /// Stop then start again with the recorded command and working directory.
    pub fn restart(&self, name: &str, timeout: Duration) -> Result<ProcessRecord> {
        validate_name(name)?;
        let held = lock::acquire_lock(&self.lock_path(name), &self.io)?;
        let result = self
            .stop_locked(name, timeout)
            .and_then(|prior| self.start_locked(name, &prior.command, &prior.cwd));
        lock::release_lock(held)?;
        result
    }

    /// Remove a terminal record and its log.
    pub fn deregister(&self, name: &str) -> Result<ProcessRecord> {
        validate_name(name)?;
        let held = lock::acquire_lock(&self.lock_path(name), &self.io)?;
        let result = self.deregister_locked(name);
        lock::release_lock(held)?;
        if result.is_ok() {
            tracing::info!(name, "deregistered process");
        }
        result
    }

    fn deregister_locked(&self, name: &str) -> Result<ProcessRecord> {
        let record = self
            .load_locked(name)?
            .ok_or_else(|| MusterError::ProcessNotFound(name.into()))?;
        if record.status.is_active() {
            return Err(MusterError::ProcessConflict(
                name.into(),
                record.status.to_string(),
            ));
        }
        atomic::remove(&self.record_path(name))?;
        atomic::remove(&record.log_path)?;
        Ok(record)
    }

    /// Lines of `name`'s log: the last `tail` lines (or all), and with
    /// `follow` keep yielding new lines until the process exits.
    pub fn logs(&self, name: &str, tail: Option<usize>, follow: bool) -> Result<LogLines> {
        let record = self.get(name)?;
        let follow = follow.then(|| Follow {
            pid: record.pid.filter(|_| record.status.is_active()),
            poll: self.config.follow_poll(),
            drained_after_exit: false,
        });
        LogLines::open(&record.log_path, tail, follow)
    }
}

/// SIGTERM, wait up to `timeout`, then SIGKILL. Returns whether it had to kill.
fn terminate(pid: u32, timeout: Duration) -> Result<bool> {
    os::signal_group(pid, Signal::Terminate)?;
    if wait_for_exit(pid, timeout) {
        return Ok(false);
    }
    tracing::warn!(pid, "process ignored SIGTERM; sending SIGKILL");
    os::signal_group(pid, Signal::Kill)?;
    if wait_for_exit(pid, KILL_GRACE) {
        return Ok(true);
    }
    Err(MusterError::Signal(pid, "still alive after SIGKILL".into()))
}

fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !os::pid_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(STOP_POLL);
    }
}

struct Follow {
    pid: Option<u32>,
    poll: Duration,
    drained_after_exit: bool,
}

/// Lazy iterator over a process log.
///
/// Without follow it is a finite snapshot of the file as it was when opened.
/// With follow it blocks between lines until more output appears, ending
/// once the process has exited and the log is drained.
pub struct LogLines {
    reader: Option<BufReader<File>>,
    backlog: VecDeque<String>,
    /// Bytes left in the snapshot; `None` when following.
    remaining: Option<u64>,
    follow: Option<Follow>,
    partial: Vec<u8>,
}

impl LogLines {
    fn open(path: &Path, tail: Option<usize>, follow: Option<Follow>) -> Result<Self> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self {
                    reader: None,
                    backlog: VecDeque::new(),
                    remaining: Some(0),
                    follow: None,
                    partial: Vec::new(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut backlog = VecDeque::new();

        let remaining = match tail {
            Some(n) => {
                for line in (&mut reader).take(len).lines() {
                    if n == 0 {
                        continue;
                    }
                    if backlog.len() == n {
                        backlog.pop_front();
                    }
                    backlog.push_back(trim_line(line?));
                }
                if follow.is_some() { None } else { Some(0) }
            }
            None => {
                if follow.is_some() {
                    None
                } else {
                    Some(len)
                }
            }
        };

        Ok(Self {
            reader: Some(reader),
            backlog,
            remaining,
            follow,
            partial: Vec::new(),
        })
    }

    fn read_chunk(&mut self) -> std::io::Result<usize> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(0);
        };
        let n = match self.remaining {
            Some(0) => 0,
            Some(rem) => reader.by_ref().take(rem).read_until(b'\n', &mut self.partial)?,
            None => reader.read_until(b'\n', &mut self.partial)?,
        };
        if let Some(rem) = self.remaining.as_mut() {
            *rem -= n as u64;
        }
        Ok(n)
    }

    fn flush_partial(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.partial);
        Some(trim_line(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

fn trim_line(mut line: String) -> String {
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    line
}

impl Iterator for LogLines {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(line) = self.backlog.pop_front() {
            return Some(Ok(line));
        }
        loop {
            match self.read_chunk() {
                Ok(0) => {}
                Ok(_) => {
                    if self.partial.ends_with(b"\n") {
                        return self.flush_partial().map(Ok);
                    }
                    continue;
                }
                Err(e) => return Some(Err(e.into())),
            }

            let Some(follow) = self.follow.as_mut() else {
                return self.flush_partial().map(Ok);
            };
            if follow.drained_after_exit {
                return self.flush_partial().map(Ok);
            }
            if follow.pid.is_some_and(os::pid_alive) {
                std::thread::sleep(follow.poll);
            } else {
                // One more pass to pick up output written just before exit.
                follow.drained_after_exit = true;
            }
        }
    }
}
