use std::path::{Path, PathBuf};
use std::time::Duration;

use colored::Colorize;
use serde::Serialize;

use crate::error::Result;
use crate::output::{self, Format};
use crate::store::agents::AgentStatus;
use crate::store::atomic;
use crate::store::ports::Allocation;
use crate::store::processes::ProcessStatus;
use crate::store::repo::Repo;

/// Temp files younger than this may still belong to a live writer.
pub const DEFAULT_TEMP_AGE: Duration = Duration::from_secs(3600);

/// Outcome of an explicit sweep. Only temp files are deleted; the rest is
/// reported for an operator (or `agent cleanup`) to act on.
#[derive(Debug, Default, Serialize)]
pub struct GcReport {
    pub processes_checked: usize,
    pub failed_processes: Vec<String>,
    pub removed_temp_files: Vec<PathBuf>,
    pub stuck_agents: Vec<String>,
    pub orphaned_ports: Vec<Allocation>,
}

pub fn sweep(repo: &Repo, temp_age: Duration) -> Result<GcReport> {
    let mut report = GcReport::default();

    let processes = repo.processes.list()?;
    report.processes_checked = processes.len();
    report.failed_processes = processes
        .into_iter()
        .filter(|p| p.status == ProcessStatus::Failed)
        .map(|p| p.name)
        .collect();

    let root = repo.muster_root();
    for dir in [
        root.to_path_buf(),
        repo.mail.dir(),
        repo.processes.dir(),
        root.join("agents"),
    ] {
        report
            .removed_temp_files
            .extend(atomic::sweep_temp_files(&dir, temp_age)?);
    }

    let agents = repo.agents.list()?;
    report.stuck_agents = agents
        .iter()
        .filter(|a| a.status == AgentStatus::Provisioning)
        .map(|a| a.name.clone())
        .collect();
    report.orphaned_ports = repo
        .ports
        .list()?
        .into_iter()
        .filter(|alloc| !agents.iter().any(|a| a.name == alloc.owner))
        .collect();

    tracing::info!(
        processes = report.processes_checked,
        temp_files = report.removed_temp_files.len(),
        stuck_agents = report.stuck_agents.len(),
        "gc sweep finished"
    );
    Ok(report)
}

pub fn run(repo_root: &Path, temp_age: Duration, format: Format) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    let report = sweep(&repo, temp_age)?;
    match format {
        Format::Json => output::print_json(&report)?,
        Format::Pretty => {
            println!(
                "Checked {} processes, removed {} temp files",
                report.processes_checked.to_string().bold(),
                report.removed_temp_files.len().to_string().bold()
            );
            for name in &report.failed_processes {
                println!("  {} {}", "failed process:".red(), name);
            }
            for name in &report.stuck_agents {
                println!(
                    "  {} {} (run `muster agent cleanup --name {name}`)",
                    "stuck agent:".yellow(),
                    name
                );
            }
            for alloc in &report.orphaned_ports {
                println!(
                    "  {} {} held by {}",
                    "unowned ports:".yellow(),
                    alloc.range,
                    alloc.owner
                );
            }
        }
        Format::Minimal => println!(
            "{} {} {} {}",
            report.processes_checked,
            report.removed_temp_files.len(),
            report.stuck_agents.len(),
            report.orphaned_ports.len()
        ),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sweep_removes_stale_temp_files_and_reports_orphans() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();

        let stale = repo.mail.dir().join(".abc.1234.tmp");
        std::fs::write(&stale, "{").unwrap();
        repo.ports.allocate(5, "ci-runner").unwrap();

        let report = sweep(&repo, Duration::ZERO).unwrap();
        assert_eq!(report.removed_temp_files, vec![stale.clone()]);
        assert!(!stale.exists());
        assert_eq!(report.orphaned_ports.len(), 1);
        assert_eq!(report.orphaned_ports[0].owner, "ci-runner");
        // Reported, not released.
        assert_eq!(repo.ports.list().unwrap().len(), 1);
        assert!(report.stuck_agents.is_empty());
        assert_eq!(report.processes_checked, 0);
    }

    #[test]
    fn fresh_temp_files_survive_default_age() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        let fresh = repo.muster_root().join(".ports.json.5678.tmp");
        std::fs::write(&fresh, "{").unwrap();

        let report = sweep(&repo, DEFAULT_TEMP_AGE).unwrap();
        assert!(report.removed_temp_files.is_empty());
        assert!(fresh.exists());
    }
}
