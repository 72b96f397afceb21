use std::path::Path;

use colored::Colorize;

use crate::error::Result;
use crate::git;
use crate::output::Format;
use crate::store::repo::Repo;

pub fn run(repo_root: &Path, format: Format) -> Result<()> {
    let repo = Repo::init(repo_root)?;
    let root = repo.muster_root().display().to_string();
    // Agents need a git checkout for their worktrees; mail, ports and
    // processes work anywhere.
    let git = git::is_git_repository(repo_root);
    match format {
        Format::Json => println!(
            "{}",
            serde_json::json!({ "initialized": root, "git": git })
        ),
        Format::Pretty => {
            println!("Initialized {}", root.cyan().bold());
            if !git {
                println!(
                    "{}",
                    "not inside a git repository: `muster agent create` will fail".yellow()
                );
            }
        }
        Format::Minimal => println!("{root}"),
    }
    Ok(())
}
