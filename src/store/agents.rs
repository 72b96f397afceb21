use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::agent::validate_name;
use crate::config::{AgentsConfig, IoConfig};
use crate::error::{MusterError, ProvisionStep, Result};
use crate::git;
use crate::store::atomic;
use crate::store::ports::{PortAllocator, PortRange};

pub const ENV_FILE: &str = ".muster-agent.env";
pub const TASK_FILE: &str = "AGENT_TASK.md";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Provisioning,
    Active,
    Completed,
    Removed,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    pub branch: String,
    pub workspace_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range: Option<PortRange>,
    pub status: AgentStatus,
    pub task: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creates and removes an agent's isolated working copy.
pub trait Workspaces {
    /// On error, anything partially created must already be removed.
    fn create(&self, agent: &str, branch: &str, path: &Path) -> Result<()>;

    /// Must succeed when some or all of the workspace is already gone.
    fn remove(&self, agent: &str, branch: &str, path: &Path) -> Result<()>;
}

/// Linked git worktrees on per-agent branches cut from HEAD.
pub struct GitWorktrees {
    repo_root: PathBuf,
}

impl GitWorktrees {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
        }
    }
}

impl Workspaces for GitWorktrees {
    fn create(&self, agent: &str, branch: &str, path: &Path) -> Result<()> {
        git::add_worktree(&self.repo_root, agent, branch, path)
    }

    fn remove(&self, agent: &str, branch: &str, path: &Path) -> Result<()> {
        git::remove_worktree(&self.repo_root, agent, branch, path)
    }
}

/// Compensating actions recorded as provisioning progresses.
enum Undo {
    ReleasePorts(PortRange),
    RemoveWorkspace,
}

/// Owns the agent records under `.muster/agents/`.
///
/// `create` is a compensating sequence rather than a locked transaction:
/// the name is claimed by an exclusive create of the record, and every later
/// step is undone in reverse if a subsequent one fails.
pub struct AgentManager<W = GitWorktrees> {
    root: PathBuf,
    repo_root: PathBuf,
    config: AgentsConfig,
    io: IoConfig,
    ports: PortAllocator,
    workspaces: W,
}

impl<W: Workspaces> AgentManager<W> {
    pub fn new(
        repo_root: &Path,
        muster_root: &Path,
        config: AgentsConfig,
        io: IoConfig,
        ports: PortAllocator,
        workspaces: W,
    ) -> Self {
        Self {
            root: muster_root.to_path_buf(),
            repo_root: repo_root.to_path_buf(),
            config,
            io,
            ports,
            workspaces,
        }
    }

    fn agents_dir(&self) -> PathBuf {
        self.root.join("agents")
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.agents_dir().join(format!("{name}.json"))
    }

    fn workspace_path(&self, name: &str) -> PathBuf {
        self.config.workspace_root(&self.repo_root).join(name)
    }

    fn save(&self, record: &mut AgentRecord) -> Result<()> {
        record.updated_at = Utc::now();
        atomic::write_json(&self.record_path(&record.name), record, &self.io)
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Provision `name`: ports, worktree + branch, environment, then `active`.
    pub fn create(&self, name: &str, task: &str) -> Result<AgentRecord> {
        validate_name(name)?;
        if task.trim().is_empty() {
            return Err(MusterError::Invalid("task description must not be empty".into()));
        }

        let now = Utc::now();
        let mut record = AgentRecord {
            name: name.into(),
            branch: format!("{}{name}", self.config.branch_prefix),
            workspace_path: self.workspace_path(name),
            port_range: None,
            status: AgentStatus::Provisioning,
            task: task.into(),
            created_at: now,
            updated_at: now,
        };
        if !atomic::create_json(&self.record_path(name), &record)? {
            return Err(MusterError::AgentConflict(name.into()));
        }
        tracing::info!(name, branch = %record.branch, "provisioning agent");

        let mut undo = Vec::new();
        if let Err((step, err)) = self.provision(&mut record, &mut undo) {
            tracing::warn!(name, %step, error = %err, "provisioning failed; rolling back");
            self.rollback(&record, undo);
            return Err(MusterError::ProvisionFailed {
                step,
                source: Box::new(err),
            });
        }

        tracing::info!(name, ports = ?record.port_range, "agent active");
        Ok(record)
    }

    fn provision(
        &self,
        record: &mut AgentRecord,
        undo: &mut Vec<Undo>,
    ) -> std::result::Result<(), (ProvisionStep, MusterError)> {
        let at = |step: ProvisionStep| move |err: MusterError| (step, err);

        let range = self
            .ports
            .allocate(self.ports.default_width(), &record.name)
            .map_err(at(ProvisionStep::ReservePorts))?;
        undo.push(Undo::ReleasePorts(range));
        record.port_range = Some(range);
        self.save(record).map_err(at(ProvisionStep::ReservePorts))?;

        // A failed create cleans up after itself; only undo a finished one,
        // so a pre-existing branch of the same name is never deleted.
        self.workspaces
            .create(&record.name, &record.branch, &record.workspace_path)
            .map_err(at(ProvisionStep::CreateWorkspace))?;
        undo.push(Undo::RemoveWorkspace);

        self.write_environment(record, range)
            .map_err(at(ProvisionStep::WriteEnvironment))?;

        record.status = AgentStatus::Active;
        self.save(record).map_err(at(ProvisionStep::Activate))?;
        Ok(())
    }

    /// Undo completed steps in reverse, then drop the claim on the name.
    /// Undo failures are logged; the original error is what the caller sees.
    fn rollback(&self, record: &AgentRecord, undo: Vec<Undo>) {
        for action in undo.into_iter().rev() {
            let outcome = match action {
                Undo::RemoveWorkspace => self.workspaces.remove(
                    &record.name,
                    &record.branch,
                    &record.workspace_path,
                ),
                Undo::ReleasePorts(range) => self.ports.release(range),
            };
            if let Err(err) = outcome {
                tracing::warn!(name = %record.name, error = %err, "rollback step failed");
            }
        }
        if let Err(err) = atomic::remove(&self.record_path(&record.name)) {
            tracing::warn!(name = %record.name, error = %err, "could not remove agent record");
        }
    }

    fn write_environment(&self, record: &AgentRecord, range: PortRange) -> Result<()> {
        let ws = &record.workspace_path;
        atomic::write_bytes(
            &ws.join(ENV_FILE),
            render_env(&environment(record, range, &self.repo_root)).as_bytes(),
            &self.io,
        )?;
        atomic::write_bytes(
            &ws.join(TASK_FILE),
            render_task(record, range, &self.repo_root).as_bytes(),
            &self.io,
        )
    }

    pub fn get(&self, name: &str) -> Result<AgentRecord> {
        validate_name(name)?;
        atomic::read_json(&self.record_path(name))?
            .ok_or_else(|| MusterError::AgentNotFound(name.into()))
    }

    /// All agent records, ordered by name.
    pub fn list(&self) -> Result<Vec<AgentRecord>> {
        let mut agents = Vec::new();
        for path in atomic::list_records(&self.agents_dir())? {
            if let Some(record) = atomic::read_json::<AgentRecord>(&path)? {
                agents.push(record);
            }
        }
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }

    /// Mark an active agent as having finished its task.
    pub fn complete(&self, name: &str) -> Result<AgentRecord> {
        let mut record = self.get(name)?;
        match record.status {
            AgentStatus::Completed => return Ok(record),
            AgentStatus::Active => {}
            other => {
                return Err(MusterError::Invalid(format!(
                    "agent '{name}' is {other} and cannot be completed"
                )));
            }
        }
        record.status = AgentStatus::Completed;
        self.save(&mut record)?;
        tracing::info!(name, "agent completed");
        Ok(record)
    }

    /// Tear down `name`: worktree, branch, ports, then the record itself.
    ///
    /// Every step tolerates state that was never created or already removed,
    /// so this also clears agents left half-provisioned by a crash. Ports are
    /// released by owner, which catches a range reserved before the record
    /// was updated with it.
    pub fn cleanup(&self, name: &str) -> Result<AgentRecord> {
        let mut record = self.get(name)?;
        if record.status != AgentStatus::Removed {
            record.status = AgentStatus::Removed;
            self.save(&mut record)?;
        }

        self.workspaces
            .remove(&record.name, &record.branch, &record.workspace_path)?;
        let released = self.ports.release_owner(name)?;
        atomic::remove(&self.record_path(name))?;

        tracing::info!(name, released = released.len(), "agent cleaned up");
        Ok(record)
    }
}

/// Key-value pairs written to the agent's environment descriptor.
pub fn environment(record: &AgentRecord, range: PortRange, repo_root: &Path) -> Vec<(String, String)> {
    vec![
        ("AGENT_NAME".into(), record.name.clone()),
        ("AGENT_BRANCH".into(), record.branch.clone()),
        (
            "AGENT_WORKSPACE".into(),
            record.workspace_path.display().to_string(),
        ),
        ("PORT_BASE".into(), range.start.to_string()),
        ("PORT_RANGE".into(), range.to_string()),
        ("MUSTER_AGENT".into(), record.name.clone()),
        ("MUSTER_ROOT".into(), repo_root.display().to_string()),
    ]
}

fn render_env(pairs: &[(String, String)]) -> String {
    let mut out = String::new();
    for (key, value) in pairs {
        let _ = writeln!(out, "{key}={value}");
    }
    out
}

fn render_task(record: &AgentRecord, range: PortRange, repo_root: &Path) -> String {
    let base = git::current_head_info(repo_root)
        .map(|h| h.sha)
        .unwrap_or_else(|| "unknown".into());
    let mut out = String::new();
    let _ = writeln!(out, "# Task for {}\n", record.name);
    let _ = writeln!(out, "{}\n", record.task.trim());
    let _ = writeln!(out, "## Workspace\n");
    let _ = writeln!(out, "- branch: `{}` (from `{base}`)", record.branch);
    let _ = writeln!(out, "- ports: {range} (base {})", range.start);
    let _ = writeln!(out, "- environment: `{ENV_FILE}`\n");
    let _ = writeln!(out, "## Coordination\n");
    let _ = writeln!(
        out,
        "- check mail: `muster mail inbox --agent {}`",
        record.name
    );
    let _ = writeln!(
        out,
        "- report status: `muster mail send --from {} --to <agent> --subject <s> --body <text>`",
        record.name
    );
    let _ = writeln!(
        out,
        "- background jobs: `muster process start --name {}-<job> -- <command>`",
        record.name
    );
    out
}
