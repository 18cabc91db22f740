//! Subscription registry and per-turn materialisation.
//!
//! Subscriptions pin files, line patterns, or knowledge entries into the
//! context: every turn, prior materialisation messages are stripped and one
//! fresh message is prepended from the current on-disk content. Read
//! failures surface as in-band error lines, never as exceptions, so a
//! broken subscription cannot take down a turn.

use std::path::Path;
use std::sync::Mutex;

use autopoiesis_protocol::Message;
use regex_lite::Regex;
use rusqlite::Connection;
use rusqlite::params;

use crate::error::Result;

/// First line of every materialisation message; used to strip stale copies.
pub const MATERIALIZATION_MARKER: &str = "[Subscribed context]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Whole file, relative to the workspace root.
    File,
    /// Lines of a file matching a regex pattern.
    Lines,
    /// Entry in the agent's knowledge directory.
    Knowledge,
}

impl SubscriptionKind {
    fn as_str(self) -> &'static str {
        match self {
            SubscriptionKind::File => "file",
            SubscriptionKind::Lines => "lines",
            SubscriptionKind::Knowledge => "knowledge",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "file" => Some(SubscriptionKind::File),
            "lines" => Some(SubscriptionKind::Lines),
            "knowledge" => Some(SubscriptionKind::Knowledge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: i64,
    pub kind: SubscriptionKind,
    pub target: String,
    pub pattern: Option<String>,
    pub active: bool,
}

pub struct SubscriptionRegistry {
    conn: Mutex<Connection>,
}

impl SubscriptionRegistry {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS subscriptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                target TEXT NOT NULL,
                pattern TEXT,
                active INTEGER NOT NULL DEFAULT 1
            )",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn add(
        &self,
        kind: SubscriptionKind,
        target: &str,
        pattern: Option<&str>,
    ) -> Result<i64> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO subscriptions (kind, target, pattern, active) VALUES (?1, ?2, ?3, 1)",
            params![kind.as_str(), target, pattern],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn deactivate(&self, id: i64) -> Result<bool> {
        let changed = self.lock_conn().execute(
            "UPDATE subscriptions SET active = 0 WHERE id = ?1",
            params![id],
        )?;
        Ok(changed == 1)
    }

    pub fn active(&self) -> Result<Vec<Subscription>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, kind, target, pattern, active
             FROM subscriptions WHERE active = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        let mut subscriptions = Vec::new();
        for row in rows {
            let (id, kind, target, pattern, active) = row?;
            let Some(kind) = SubscriptionKind::parse(&kind) else {
                continue;
            };
            subscriptions.push(Subscription {
                id,
                kind,
                target,
                pattern,
                active: active != 0,
            });
        }
        Ok(subscriptions)
    }

    // Poisoned mutex means a panic mid-statement; propagate it.
    #[allow(clippy::unwrap_used)]
    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

/// Strip stale materialisation messages and prepend one fresh message built
/// from the active subscriptions. With no active subscriptions the history
/// is only stripped.
pub fn materialize_subscriptions(
    messages: Vec<Message>,
    registry: &SubscriptionRegistry,
    workspace_root: &Path,
    knowledge_dir: &Path,
) -> Vec<Message> {
    let mut stripped: Vec<Message> = messages
        .into_iter()
        .filter(|m| !m.starts_with_marker(MATERIALIZATION_MARKER))
        .collect();

    let subscriptions = match registry.active() {
        Ok(subs) => subs,
        Err(err) => {
            tracing::warn!("failed to read subscriptions: {err}");
            return stripped;
        }
    };
    if subscriptions.is_empty() {
        return stripped;
    }

    let mut sections = vec![MATERIALIZATION_MARKER.to_string()];
    for sub in &subscriptions {
        let content = materialize_one(sub, workspace_root, knowledge_dir);
        sections.push(format!(
            "## {}:{}\n{}",
            sub.kind.as_str(),
            sub.target,
            content
        ));
    }

    stripped.insert(0, Message::user(sections.join("\n")));
    stripped
}

fn materialize_one(sub: &Subscription, workspace_root: &Path, knowledge_dir: &Path) -> String {
    match sub.kind {
        SubscriptionKind::File => read_workspace_file(workspace_root, &sub.target),
        SubscriptionKind::Lines => {
            let pattern = sub.pattern.as_deref().unwrap_or_default();
            let regex = match Regex::new(pattern) {
                Ok(regex) => regex,
                Err(err) => return format!("error: invalid pattern {pattern:?}: {err}"),
            };
            let content = read_workspace_file(workspace_root, &sub.target);
            if content.starts_with("error:") {
                return content;
            }
            content
                .lines()
                .filter(|line| regex.is_match(line))
                .collect::<Vec<_>>()
                .join("\n")
        }
        SubscriptionKind::Knowledge => {
            match std::fs::read_to_string(knowledge_dir.join(&sub.target)) {
                Ok(content) => content,
                Err(err) => format!("error: cannot read knowledge entry {}: {err}", sub.target),
            }
        }
    }
}

/// Read a file under the workspace root, rejecting paths that escape it.
/// All failures come back as in-band error strings.
fn read_workspace_file(workspace_root: &Path, target: &str) -> String {
    let candidate = workspace_root.join(target);
    let root = match workspace_root.canonicalize() {
        Ok(root) => root,
        Err(err) => return format!("error: workspace root unavailable: {err}"),
    };
    let resolved = match candidate.canonicalize() {
        Ok(resolved) => resolved,
        Err(err) => return format!("error: cannot read {target}: {err}"),
    };
    if !resolved.starts_with(&root) {
        return format!("error: path escapes workspace root: {target}");
    }
    match std::fs::read_to_string(&resolved) {
        Ok(content) => content,
        Err(err) => format!("error: cannot read {target}: {err}"),
    }
}
