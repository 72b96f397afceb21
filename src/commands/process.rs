use std::io::Write;
use std::path::Path;
use std::time::Duration;

use colored::{ColoredString, Colorize};

use crate::error::Result;
use crate::output::{self, Format};
use crate::store::processes::{ProcessRecord, ProcessStatus};
use crate::store::repo::Repo;

fn status_label(status: ProcessStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        ProcessStatus::Starting => label.yellow(),
        ProcessStatus::Running => label.green(),
        ProcessStatus::Stopped => label.dimmed(),
        ProcessStatus::Failed => label.red().bold(),
    }
}

fn print_record(record: &ProcessRecord, format: Format) -> Result<()> {
    match format {
        Format::Json => output::print_json(record)?,
        Format::Pretty => {
            let pid = record
                .pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".into());
            println!(
                "{} {} {}",
                format!("[{}]", record.name).cyan().bold(),
                status_label(record.status),
                format!("pid={pid}").dimmed()
            );
            println!("  {} {}", "command:".dimmed(), record.command.join(" "));
            println!("  {} {}", "cwd:".dimmed(), record.cwd.display());
            println!("  {} {}", "log:".dimmed(), record.log_path.display());
            println!(
                "  {} {}",
                "started:".dimmed(),
                output::timestamp(&record.started_at)
            );
            if let Some(detail) = &record.exit_detail {
                println!("  {} {}", "detail:".dimmed(), detail);
            }
        }
        Format::Minimal => println!(
            "{} {} {}",
            record.name,
            record.status,
            record.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into())
        ),
    }
    Ok(())
}

pub fn start(
    repo_root: &Path,
    name: &str,
    command: &[String],
    cwd: &Path,
    format: Format,
) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    let record = repo.processes.start(name, command, cwd)?;
    print_record(&record, format)
}

fn timeout_or_default(repo: &Repo, timeout_secs: Option<u64>) -> Duration {
    timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| repo.processes.default_stop_timeout())
}

pub fn stop(repo_root: &Path, name: &str, timeout_secs: Option<u64>, format: Format) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    let record = repo
        .processes
        .stop(name, timeout_or_default(&repo, timeout_secs))?;
    print_record(&record, format)
}

pub fn restart(
    repo_root: &Path,
    name: &str,
    timeout_secs: Option<u64>,
    format: Format,
) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    let record = repo
        .processes
        .restart(name, timeout_or_default(&repo, timeout_secs))?;
    print_record(&record, format)
}

pub fn show(repo_root: &Path, name: &str, format: Format) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    let record = repo.processes.get(name)?;
    print_record(&record, format)
}

pub fn list(repo_root: &Path, format: Format) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    let records = repo.processes.list()?;
    match format {
        Format::Json => output::print_json(&records)?,
        Format::Pretty => {
            if records.is_empty() {
                println!("{}", "No processes registered.".dimmed());
            }
            for r in &records {
                println!(
                    "{:<20} {:<10} {}",
                    r.name.cyan(),
                    status_label(r.status),
                    output::truncate(&r.command.join(" "), 50).dimmed()
                );
            }
        }
        Format::Minimal => {
            for r in &records {
                println!("{} {}", r.name, r.status);
            }
        }
    }
    Ok(())
}

/// Log lines are written verbatim in every format.
pub fn logs(repo_root: &Path, name: &str, tail: Option<usize>, follow: bool) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    let lines = repo.processes.logs(name, tail, follow)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for line in lines {
        writeln!(out, "{}", line?)?;
        if follow {
            out.flush()?;
        }
    }
    Ok(())
}

pub fn deregister(repo_root: &Path, name: &str, format: Format) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    let record = repo.processes.deregister(name)?;
    match format {
        Format::Json => println!("{}", serde_json::json!({ "deregistered": record.name })),
        Format::Pretty => println!("Deregistered {}", record.name.cyan()),
        Format::Minimal => println!("{}", record.name),
    }
    Ok(())
}
