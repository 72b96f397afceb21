use std::path::Path;

use colored::Colorize;

use crate::error::Result;
use crate::output::{self, Format};
use crate::store::mail::Message;
use crate::store::repo::Repo;

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

pub fn send(
    repo_root: &Path,
    from: &str,
    to: &[String],
    subject: &str,
    body: &str,
    format: Format,
) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    let msg = repo.mail.send(from, to, subject, body)?;
    match format {
        Format::Json => output::print_json(&msg)?,
        Format::Pretty => println!(
            "Sent {} to {}: {}",
            short_id(&msg.id).dimmed(),
            msg.to.join(", ").cyan(),
            msg.subject.bold()
        ),
        Format::Minimal => println!("{}", msg.id),
    }
    Ok(())
}

pub fn inbox(repo_root: &Path, agent: &str, unread: bool, format: Format) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    let msgs = repo.mail.inbox(agent, unread)?;
    match format {
        Format::Json => output::print_json(&msgs)?,
        Format::Pretty => {
            if msgs.is_empty() {
                println!("{}", "No messages.".dimmed());
            }
            for m in &msgs {
                let marker = if m.is_read_by(agent) { " " } else { "*" };
                println!(
                    "{} {} {} {} {}",
                    marker.yellow().bold(),
                    format!("[{}]", short_id(&m.id)).dimmed(),
                    output::timestamp(&m.created_at).dimmed(),
                    format!("{}:", m.from).cyan(),
                    output::truncate(&m.subject, 60),
                );
            }
        }
        Format::Minimal => {
            for m in &msgs {
                println!("{} {} {}", m.id, m.from, m.subject);
            }
        }
    }
    Ok(())
}

fn print_message(msg: &Message) {
    println!("{} {}", "id:".dimmed(), msg.id);
    println!("{} {}", "from:".dimmed(), msg.from.cyan());
    println!("{} {}", "to:".dimmed(), msg.to.join(", "));
    println!("{} {}", "date:".dimmed(), output::timestamp(&msg.created_at));
    println!("{} {}", "subject:".dimmed(), msg.subject.bold());
    println!();
    println!("{}", msg.body);
}

pub fn read(repo_root: &Path, id: &str, agent: &str, format: Format) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    let msg = repo.mail.read(id, agent)?;
    match format {
        Format::Json => output::print_json(&msg)?,
        Format::Pretty => print_message(&msg),
        Format::Minimal => println!("{}", msg.body),
    }
    Ok(())
}

pub fn delete(repo_root: &Path, id: &str, agent: Option<&str>, format: Format) -> Result<()> {
    let repo = Repo::open(repo_root)?;
    repo.mail.delete(id, agent)?;
    match format {
        Format::Json => println!("{}", serde_json::json!({ "deleted": id })),
        Format::Pretty => println!("Deleted message {}", short_id(id).dimmed()),
        Format::Minimal => println!("{id}"),
    }
    Ok(())
}
