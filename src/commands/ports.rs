use std::path::Path;

use colored::Colorize;

use crate::error::Result;
use crate::output::{self, Format};
use crate::store::ports::PortRange;
use crate::store::repo::Repo;

pub fn allocate(repo_root: &Path, size: Option<u16>, owner: &str, format: Format) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    let size = size.unwrap_or_else(|| repo.ports.default_width());
    let range = repo.ports.allocate(size, owner)?;
    match format {
        Format::Json => println!(
            "{}",
            serde_json::json!({
                "range": range.to_string(),
                "start": range.start,
                "end": range.end,
                "owner": owner,
            })
        ),
        Format::Pretty => println!(
            "Allocated {} to {}",
            range.to_string().green().bold(),
            owner.cyan()
        ),
        Format::Minimal => println!("{range}"),
    }
    Ok(())
}

pub fn release(repo_root: &Path, range: PortRange, format: Format) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    repo.ports.release(range)?;
    match format {
        Format::Json => println!("{}", serde_json::json!({ "released": range.to_string() })),
        Format::Pretty => println!("Released {}", range.to_string().green()),
        Format::Minimal => println!("{range}"),
    }
    Ok(())
}

pub fn list(repo_root: &Path, format: Format) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    let allocations = repo.ports.list()?;
    match format {
        Format::Json => output::print_json(&allocations)?,
        Format::Pretty => {
            if allocations.is_empty() {
                println!("{}", "No port ranges allocated.".dimmed());
            }
            for a in &allocations {
                println!(
                    "{:>11} {} {}",
                    a.range.to_string().green(),
                    a.owner.cyan(),
                    output::timestamp(&a.allocated_at).dimmed()
                );
            }
        }
        Format::Minimal => {
            for a in &allocations {
                println!("{} {}", a.range, a.owner);
            }
        }
    }
    Ok(())
}
