use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::validate_name;
use crate::config::IoConfig;
use crate::error::{MusterError, Result};
use crate::store::{atomic, lock};

/// A message between agents. One file per message under `.muster/mail/`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_by: BTreeSet<String>,
}

impl Message {
    pub fn is_addressed_to(&self, agent: &str) -> bool {
        self.to.iter().any(|r| r == agent)
    }

    pub fn is_read_by(&self, agent: &str) -> bool {
        self.read_by.contains(agent)
    }
}

/// Durable mailbox shared by every agent of a repository.
///
/// Sends never contend: each creates a fresh, uniquely named file. Reads and
/// deletes rewrite or remove existing files and run under the mail lock, so
/// a `read` can never write back a message another agent just deleted.
pub struct MailStore {
    root: PathBuf,
    io: IoConfig,
}

impl MailStore {
    pub fn open(muster_root: &Path, io: IoConfig) -> Self {
        Self {
            root: muster_root.to_path_buf(),
            io,
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join("locks").join("mail.lock")
    }

    fn message_path(&self, id: &str) -> PathBuf {
        self.dir().join(format!("{id}.json"))
    }

    fn validate_id(id: &str) -> Result<()> {
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(MusterError::MessageNotFound(id.into()));
        }
        Ok(())
    }

    /// Post a message to one or more agents. Returns the stored message.
    pub fn send(&self, from: &str, to: &[String], subject: &str, body: &str) -> Result<Message> {
        validate_name(from)?;
        let mut recipients: Vec<String> = Vec::with_capacity(to.len());
        for name in to {
            let name = name.trim();
            validate_name(name)?;
            if !recipients.iter().any(|r| r == name) {
                recipients.push(name.to_string());
            }
        }
        if recipients.is_empty() {
            return Err(MusterError::Invalid("message needs at least one recipient".into()));
        }

        let msg = Message {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.into(),
            to: recipients,
            subject: subject.into(),
            body: body.into(),
            created_at: Utc::now(),
            read_by: BTreeSet::new(),
        };

        if !atomic::create_json(&self.message_path(&msg.id), &msg)? {
            return Err(MusterError::Invalid(format!("message id {} already exists", msg.id)));
        }

        tracing::info!(id = %msg.id, from, to = ?msg.to, "sent message");
        Ok(msg)
    }

    fn load_all(&self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        for path in atomic::list_records(&self.dir())? {
            // A concurrent delete may remove the file between listing and reading.
            if let Some(msg) = atomic::read_json::<Message>(&path)? {
                messages.push(msg);
            }
        }
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(messages)
    }

    /// Messages addressed to `agent`, oldest first (ties broken by id).
    pub fn inbox(&self, agent: &str, unread_only: bool) -> Result<Vec<Message>> {
        validate_name(agent)?;
        let messages: Vec<Message> = self
            .load_all()?
            .into_iter()
            .filter(|m| m.is_addressed_to(agent))
            .filter(|m| !unread_only || !m.is_read_by(agent))
            .collect();
        tracing::debug!(agent, count = messages.len(), "read inbox");
        Ok(messages)
    }

    /// Fetch a message and mark it read by `agent`. Idempotent.
    pub fn read(&self, id: &str, agent: &str) -> Result<Message> {
        Self::validate_id(id)?;
        validate_name(agent)?;
        let path = self.message_path(id);

        let lock = lock::acquire_lock(&self.lock_path(), &self.io)?;
        let mut msg: Message =
            atomic::read_json(&path)?.ok_or_else(|| MusterError::MessageNotFound(id.into()))?;
        if msg.read_by.insert(agent.to_string()) {
            atomic::write_json(&path, &msg, &self.io)?;
            tracing::debug!(id, agent, "marked message read");
        }
        lock::release_lock(lock)?;

        Ok(msg)
    }

    /// Remove a message for everyone. Exactly one of several racing deletes wins.
    ///
    /// `agent` only identifies the caller in logs; deletion is not restricted
    /// to recipients.
    pub fn delete(&self, id: &str, agent: Option<&str>) -> Result<()> {
        Self::validate_id(id)?;
        if let Some(agent) = agent {
            validate_name(agent)?;
        }

        let lock = lock::acquire_lock(&self.lock_path(), &self.io)?;
        let removed = atomic::remove(&self.message_path(id))?;
        lock::release_lock(lock)?;

        if !removed {
            return Err(MusterError::MessageNotFound(id.into()));
        }
        tracing::info!(id, agent = agent.unwrap_or("-"), "deleted message");
        Ok(())
    }

    pub fn dir(&self) -> PathBuf {
        self.root.join("mail")
    }
}
