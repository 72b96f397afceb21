use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MusterError, Result};

pub const CONFIG_FILE: &str = "config.json";
pub const CONFIG_VERSION: u32 = 1;

/// Contents of `.muster/config.json`. Missing fields fall back to defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub version: u32,
    pub ports: PortsConfig,
    pub agents: AgentsConfig,
    pub processes: ProcessesConfig,
    pub io: IoConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            ports: PortsConfig::default(),
            agents: AgentsConfig::default(),
            processes: ProcessesConfig::default(),
            io: IoConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// First allocatable port.
    pub base: u16,
    /// Exclusive upper bound.
    pub limit: u16,
    /// Range size handed to each agent.
    pub width: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            base: 3000,
            limit: 4000,
            width: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub branch_prefix: String,
    /// Parent of agent worktrees; relative paths resolve against the repo root.
    pub workspace_dir: PathBuf,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            branch_prefix: "agent/".into(),
            workspace_dir: PathBuf::from(".muster").join("workspaces"),
        }
    }
}

impl AgentsConfig {
    pub fn workspace_root(&self, repo_root: &Path) -> PathBuf {
        if self.workspace_dir.is_absolute() {
            self.workspace_dir.clone()
        } else {
            repo_root.join(&self.workspace_dir)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessesConfig {
    pub stop_timeout_secs: u64,
    pub starting_grace_secs: u64,
    pub follow_poll_ms: u64,
}

impl Default for ProcessesConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 10,
            starting_grace_secs: 30,
            follow_poll_ms: 200,
        }
    }
}

impl ProcessesConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn starting_grace(&self) -> Duration {
        Duration::from_secs(self.starting_grace_secs)
    }

    pub fn follow_poll(&self) -> Duration {
        Duration::from_millis(self.follow_poll_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    pub retries: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            retries: 50,
            backoff_ms: 10,
            max_backoff_ms: 200,
        }
    }
}

impl IoConfig {
    /// Backoff before retry number `attempt` (0-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }
}

impl Config {
    /// Load the config under `muster_root`, using defaults when the file is absent.
    pub fn load(muster_root: &Path) -> Result<Self> {
        let path = muster_root.join(CONFIG_FILE);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| MusterError::CorruptFile(path.display().to_string(), e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports.width == 0 {
            return Err(MusterError::Invalid("ports.width must be positive".into()));
        }
        if self.ports.base >= self.ports.limit {
            return Err(MusterError::Invalid(format!(
                "ports.base ({}) must be below ports.limit ({})",
                self.ports.base, self.ports.limit
            )));
        }
        Ok(())
    }

    pub fn workspace_dir(&self, repo_root: &Path) -> PathBuf {
        self.agents.workspace_root(repo_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.ports.base, 3000);
        assert_eq!(config.ports.width, 10);
    }

    #[test]
    fn partial_file_fills_remaining_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"version": 1, "ports": {"base": 5000}}"#,
        )
        .unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.ports.base, 5000);
        assert_eq!(config.ports.limit, 4000);
        assert_eq!(config.agents.branch_prefix, "agent/");
    }

    #[test]
    fn rejects_inverted_port_bounds() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"ports": {"base": 4000, "limit": 3000}}"#,
        )
        .unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(MusterError::Invalid(_))
        ));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let io = IoConfig {
            retries: 5,
            backoff_ms: 10,
            max_backoff_ms: 50,
        };
        assert_eq!(io.backoff(0), Duration::from_millis(10));
        assert_eq!(io.backoff(1), Duration::from_millis(20));
        assert_eq!(io.backoff(2), Duration::from_millis(40));
        assert_eq!(io.backoff(3), Duration::from_millis(50));
        assert_eq!(io.backoff(40), Duration::from_millis(50));
    }

    #[test]
    fn relative_workspace_dir_resolves_against_repo_root() {
        let config = Config::default();
        let root = Path::new("/repo");
        assert_eq!(
            config.workspace_dir(root),
            PathBuf::from("/repo/.muster/workspaces")
        );
    }
}
