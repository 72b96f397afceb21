use chrono::{DateTime, Local, Utc};
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;

use crate::error::{MusterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Pretty,
    Minimal,
}

/// Print `value` as one line of JSON.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

pub fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        let truncated: String = text.chars().take(max_len.saturating_sub(3)).collect();
        format!("{truncated}...")
    } else {
        text.to_string()
    }
}

/// Local, second-precision rendering for human output.
pub fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Report `err` on stderr in the requested format.
pub fn print_error(err: &MusterError, format: Format) {
    match format {
        Format::Json => eprintln!(
            "{}",
            serde_json::json!({
                "error": err.code(),
                "kind": err.kind().to_string(),
                "message": err.to_string(),
            })
        ),
        Format::Pretty => eprintln!(
            "{} {}",
            format!("error[{}]:", err.kind()).red().bold(),
            err
        ),
        Format::Minimal => eprintln!("error[{}]: {err}", err.kind()),
    }
}
