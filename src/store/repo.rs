use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{CONFIG_FILE, Config, IoConfig};
use crate::error::{MusterError, Result};
use crate::store::agents::{AgentManager, GitWorktrees};
use crate::store::atomic;
use crate::store::mail::MailStore;
use crate::store::ports::PortAllocator;
use crate::store::processes::ProcessRegistry;

pub const MUSTER_DIR: &str = ".muster";

/// Environment override for the repository root.
pub const ROOT_ENV: &str = "MUSTER_ROOT";

/// Directories created by `init`, relative to `.muster/`.
const STATE_DIRS: &[&str] = &["locks", "mail", "processes/logs", "agents", "workspaces"];

/// An opened muster repository and the stores living under its `.muster/`.
pub struct Repo {
    muster_root: PathBuf,
    pub config: Config,
    pub mail: MailStore,
    pub ports: PortAllocator,
    pub processes: ProcessRegistry,
    pub agents: AgentManager,
}

impl Repo {
    /// Open an existing repository rooted at `repo_root`.
    pub fn open(repo_root: &Path) -> Result<Self> {
        let muster_root = repo_root.join(MUSTER_DIR);
        if !muster_root.join(CONFIG_FILE).exists() {
            return Err(MusterError::NotInitialized);
        }
        let config = Config::load(&muster_root)?;

        let mail = MailStore::open(&muster_root, config.io);
        let ports = PortAllocator::open(&muster_root, config.ports.clone(), config.io);
        let processes =
            ProcessRegistry::open(&muster_root, config.processes.clone(), config.io);
        let agents = AgentManager::new(
            repo_root,
            &muster_root,
            config.agents.clone(),
            config.io,
            PortAllocator::open(&muster_root, config.ports.clone(), config.io),
            GitWorktrees::new(repo_root),
        );

        Ok(Self {
            muster_root,
            config,
            mail,
            ports,
            processes,
            agents,
        })
    }

    /// Create `.muster/` with a default config under `repo_root`.
    pub fn init(repo_root: &Path) -> Result<Self> {
        let muster_root = repo_root.join(MUSTER_DIR);
        if muster_root.join(CONFIG_FILE).exists() {
            return Err(MusterError::AlreadyInitialized);
        }

        for dir in STATE_DIRS {
            fs::create_dir_all(muster_root.join(dir))?;
        }
        // Keep runtime state, including agent worktrees, out of the host repo.
        let io = IoConfig::default();
        atomic::write_bytes(&muster_root.join(".gitignore"), b"*\n", &io)?;
        // Written last: its presence marks the repository as initialized.
        atomic::write_json(&muster_root.join(CONFIG_FILE), &Config::default(), &io)?;

        tracing::info!(root = %repo_root.display(), "initialized muster repository");
        Self::open(repo_root)
    }

    pub fn muster_root(&self) -> &Path {
        &self.muster_root
    }
}

/// Resolve the repository root: `MUSTER_ROOT` if set, else the nearest
/// ancestor of the current directory containing `.muster/`.
pub fn find_repo_root() -> Result<PathBuf> {
    if let Some(root) = std::env::var_os(ROOT_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(root));
    }
    let mut dir = std::env::current_dir().map_err(MusterError::Io)?;
    loop {
        if dir.join(MUSTER_DIR).join(CONFIG_FILE).exists() {
            return Ok(dir);
        }
        if !dir.pop() {
            return Err(MusterError::NotInitialized);
        }
    }
}
