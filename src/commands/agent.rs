use std::path::Path;

use colored::{ColoredString, Colorize};

use crate::error::Result;
use crate::output::{self, Format};
use crate::store::agents::{AgentRecord, AgentStatus};
use crate::store::repo::Repo;

fn status_label(status: AgentStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        AgentStatus::Provisioning => label.yellow(),
        AgentStatus::Active => label.green(),
        AgentStatus::Completed => label.blue(),
        AgentStatus::Removed => label.dimmed(),
    }
}

fn ports_label(record: &AgentRecord) -> String {
    record
        .port_range
        .map(|r| r.to_string())
        .unwrap_or_else(|| "-".into())
}

fn print_record(record: &AgentRecord, format: Format) -> Result<()> {
    match format {
        Format::Json => output::print_json(record)?,
        Format::Pretty => {
            println!(
                "{} {}",
                format!("[{}]", record.name).cyan().bold(),
                status_label(record.status)
            );
            println!("  {} {}", "branch:".dimmed(), record.branch);
            println!(
                "  {} {}",
                "workspace:".dimmed(),
                record.workspace_path.display()
            );
            println!("  {} {}", "ports:".dimmed(), ports_label(record));
            println!("  {} {}", "task:".dimmed(), record.task);
            println!(
                "  {} {}",
                "created:".dimmed(),
                output::timestamp(&record.created_at)
            );
        }
        Format::Minimal => println!(
            "{} {} {}",
            record.name,
            record.status,
            record.workspace_path.display()
        ),
    }
    Ok(())
}

pub fn create(repo_root: &Path, name: &str, task: &str, format: Format) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    let record = repo.agents.create(name, task)?;
    print_record(&record, format)
}

pub fn show(repo_root: &Path, name: &str, format: Format) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    let record = repo.agents.get(name)?;
    print_record(&record, format)
}

pub fn complete(repo_root: &Path, name: &str, format: Format) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    let record = repo.agents.complete(name)?;
    print_record(&record, format)
}

pub fn list(repo_root: &Path, status: Option<AgentStatus>, format: Format) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    let agents: Vec<AgentRecord> = repo
        .agents
        .list()?
        .into_iter()
        .filter(|a| status.is_none_or(|s| a.status == s))
        .collect();
    match format {
        Format::Json => output::print_json(&agents)?,
        Format::Pretty => {
            if agents.is_empty() {
                println!("{}", "No agents.".dimmed());
            }
            for a in &agents {
                println!(
                    "{:<16} {:<13} {:<11} {}",
                    a.name.cyan().bold(),
                    status_label(a.status),
                    ports_label(a),
                    a.branch.dimmed()
                );
            }
        }
        Format::Minimal => {
            for a in &agents {
                println!("{} {}", a.name, a.status);
            }
        }
    }
    Ok(())
}

pub fn cleanup(repo_root: &Path, name: &str, format: Format) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    let record = repo.agents.cleanup(name)?;
    match format {
        Format::Json => println!(
            "{}",
            serde_json::json!({
                "removed": record.name,
                "branch": record.branch,
                "workspace_path": record.workspace_path,
                "released": record.port_range.map(|r| r.to_string()),
            })
        ),
        Format::Pretty => println!(
            "Removed agent {} ({}, ports {})",
            record.name.cyan().bold(),
            record.branch.dimmed(),
            ports_label(&record)
        ),
        Format::Minimal => println!("{}", record.name),
    }
    Ok(())
}
