//! Agent identity and on-disk workspace layout.
//!
//! Each agent gets an isolated tree under `{AUTOPOIESIS_HOME}/agents/{id}/`;
//! no path of one agent is a prefix of any path of another. Resolution is a
//! pure function of the agent id plus two environment variables.

use std::path::Path;
use std::path::PathBuf;

use time::Date;
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;
use tracing::warn;

use crate::error::AutopoiesisErr;
use crate::error::EnvVarError;
use crate::error::Result;

pub const DEFAULT_AGENT_NAME: &str = "default";
const HOME_DIR_NAME: &str = ".autopoiesis";
const MAX_SLUG_LENGTH: usize = 64;

pub const DEFAULT_TMP_RETENTION_DAYS: i64 = 14;
pub const DEFAULT_TMP_MAX_SIZE_MB: u64 = 500;

const DATE_FORMAT: &[FormatItem] = format_description!("[year]-[month]-[day]");

/// Resolved directory tree for one agent identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPaths {
    /// `{home}/agents/{id}/`
    pub root: PathBuf,
    pub workspace: PathBuf,
    pub memory: PathBuf,
    pub skills: PathBuf,
    pub knowledge: PathBuf,
    pub tmp: PathBuf,
    /// Relational stores (`approval.sqlite`, `history.sqlite`,
    /// `subscriptions.sqlite`) and the audit log.
    pub data: PathBuf,
    /// Signing keys and keyring.
    pub keys: PathBuf,
}

impl AgentPaths {
    pub fn approval_db(&self) -> PathBuf {
        self.data.join("approval.sqlite")
    }

    pub fn history_db(&self) -> PathBuf {
        self.data.join("history.sqlite")
    }

    pub fn subscriptions_db(&self) -> PathBuf {
        self.data.join("subscriptions.sqlite")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.data.join("audit.jsonl")
    }

    /// Create the full directory layout.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [
            &self.workspace,
            &self.memory,
            &self.skills,
            &self.knowledge,
            &self.tmp,
            &self.data,
            &self.keys,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Validate a slug-style agent identifier: non-empty, at most 64 chars, no
/// path separators or traversal sequences.
pub fn validate_slug(name: &str) -> Result<&str> {
    let stripped = name.trim();
    if stripped.is_empty() {
        return Err(invalid_name("name must not be empty"));
    }
    if stripped.contains('/') || stripped.contains('\\') || stripped.contains("..") {
        return Err(invalid_name("name contains unsafe path characters"));
    }
    if stripped.len() > MAX_SLUG_LENGTH {
        return Err(invalid_name("name exceeds 64 characters"));
    }
    Ok(stripped)
}

fn invalid_name(reason: &str) -> AutopoiesisErr {
    AutopoiesisErr::InvalidWorkItem(format!("invalid agent name: {reason}"))
}

/// Agent name resolution: explicit parameter > `AUTOPOIESIS_AGENT` >
/// `"default"`.
pub fn resolve_agent_name(explicit: Option<&str>) -> String {
    if let Some(name) = explicit.filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    std::env::var("AUTOPOIESIS_AGENT")
        .ok()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_AGENT_NAME.to_string())
}

/// Home resolution: `AUTOPOIESIS_HOME` > `~/.autopoiesis`.
pub fn resolve_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("AUTOPOIESIS_HOME")
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|home| home.join(HOME_DIR_NAME))
        .ok_or_else(|| {
            AutopoiesisErr::EnvVar(EnvVarError {
                var: "AUTOPOIESIS_HOME".to_string(),
                instructions: Some(
                    "Set it explicitly; the user home directory could not be determined."
                        .to_string(),
                ),
            })
        })
}

/// Build the full [`AgentPaths`] for `agent_name` under `home`.
pub fn resolve_agent_workspace_in(home: &Path, agent_name: &str) -> Result<AgentPaths> {
    let name = validate_slug(agent_name)?;
    let root = home.join("agents").join(name);
    let workspace = root.join("workspace");
    Ok(AgentPaths {
        memory: workspace.join("memory"),
        skills: workspace.join("skills"),
        knowledge: workspace.join("knowledge"),
        tmp: workspace.join("tmp"),
        data: root.join("data"),
        keys: root.join("keys"),
        workspace,
        root,
    })
}

/// Environment-driven variant of [`resolve_agent_workspace_in`].
pub fn resolve_agent_workspace(agent_name: Option<&str>) -> Result<AgentPaths> {
    let name = resolve_agent_name(agent_name);
    resolve_agent_workspace_in(&resolve_home()?, &name)
}

/// Today's date directory under `tmp/`, where per-run spill files land.
pub fn tmp_date_dir(tmp_root: &Path) -> PathBuf {
    let today = OffsetDateTime::now_utc().date();
    match today.format(DATE_FORMAT) {
        Ok(formatted) => tmp_root.join(formatted),
        Err(_) => tmp_root.join("undated"),
    }
}

/// Enforce tmp retention: date-directories older than `retention_days` are
/// deleted first, then remaining date-directories oldest-first until the
/// total size fits in `max_size_mb`. Non-date entries are left alone.
pub fn cleanup_tmp(tmp_root: &Path, retention_days: i64, max_size_mb: u64) -> Result<()> {
    let Ok(entries) = std::fs::read_dir(tmp_root) else {
        return Ok(());
    };

    let mut dated: Vec<(Date, PathBuf)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Ok(date) = Date::parse(name, DATE_FORMAT) {
            dated.push((date, path));
        }
    }
    dated.sort_by_key(|(date, _)| *date);

    let cutoff = OffsetDateTime::now_utc().date() - time::Duration::days(retention_days);
    dated.retain(|(date, path)| {
        if *date < cutoff {
            remove_dir_logged(path);
            false
        } else {
            true
        }
    });

    let max_bytes = max_size_mb * 1024 * 1024;
    let mut sizes: Vec<u64> = dated.iter().map(|(_, path)| dir_size(path)).collect();
    let mut total: u64 = sizes.iter().sum();
    let mut index = 0;
    while total > max_bytes && index < dated.len() {
        remove_dir_logged(&dated[index].1);
        total -= sizes[index];
        sizes[index] = 0;
        index += 1;
    }
    Ok(())
}

fn remove_dir_logged(path: &Path) {
    if let Err(err) = std::fs::remove_dir_all(path) {
        warn!("failed to remove tmp dir {}: {err}", path.display());
    }
}

fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    for entry in entries.flatten() {
        let entry_path = entry.path();
        if entry_path.is_dir() {
            total += dir_size(&entry_path);
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    total
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn layout_is_deterministic() {
        let home = Path::new("/srv/autopoiesis");
        let paths = resolve_agent_workspace_in(home, "alpha").unwrap();
        assert_eq!(paths.root, home.join("agents/alpha"));
        assert_eq!(paths.workspace, home.join("agents/alpha/workspace"));
        assert_eq!(paths.tmp, home.join("agents/alpha/workspace/tmp"));
        assert_eq!(paths.data, home.join("agents/alpha/data"));
        assert_eq!(paths.keys, home.join("agents/alpha/keys"));
    }

    #[test]
    fn distinct_agents_have_disjoint_trees() {
        let home = Path::new("/srv/autopoiesis");
        let a = resolve_agent_workspace_in(home, "alpha").unwrap();
        let b = resolve_agent_workspace_in(home, "beta").unwrap();
        assert!(!a.root.starts_with(&b.root));
        assert!(!b.root.starts_with(&a.root));
        assert_ne!(a.approval_db(), b.approval_db());
        assert_ne!(a.history_db(), b.history_db());
    }

    #[test]
    fn slug_validation_rejects_traversal() {
        assert!(validate_slug("alpha").is_ok());
        assert!(validate_slug("alpha-2_x").is_ok());
        assert!(validate_slug("").is_err());
        assert!(validate_slug("   ").is_err());
        assert!(validate_slug("a/b").is_err());
        assert!(validate_slug("a\\b").is_err());
        assert!(validate_slug("..").is_err());
        assert!(validate_slug(&"x".repeat(65)).is_err());
    }

    #[test]
    fn explicit_name_beats_default() {
        assert_eq!(resolve_agent_name(Some("beta")), "beta");
    }

    #[test]
    fn cleanup_removes_expired_date_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("2001-01-01");
        let fresh = tmp_date_dir(dir.path());
        std::fs::create_dir_all(&old).unwrap();
        std::fs::create_dir_all(&fresh).unwrap();
        std::fs::write(old.join("x.log"), "old").unwrap();
        std::fs::write(fresh.join("y.log"), "fresh").unwrap();
        // Non-date dirs survive.
        std::fs::create_dir_all(dir.path().join("tool-results")).unwrap();

        cleanup_tmp(dir.path(), DEFAULT_TMP_RETENTION_DAYS, DEFAULT_TMP_MAX_SIZE_MB).unwrap();
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(dir.path().join("tool-results").exists());
    }

    #[test]
    fn cleanup_enforces_size_budget_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let older = tmp_date_dir(dir.path()).with_file_name("2030-01-01");
        let newer = tmp_date_dir(dir.path()).with_file_name("2030-01-02");
        std::fs::create_dir_all(&older).unwrap();
        std::fs::create_dir_all(&newer).unwrap();
        std::fs::write(older.join("big.log"), vec![b'x'; 1024 * 1024]).unwrap();
        std::fs::write(newer.join("big.log"), vec![b'x'; 1024 * 1024]).unwrap();

        // Budget of 1 MiB forces the older directory out.
        cleanup_tmp(dir.path(), 10_000, 1).unwrap();
        assert!(!older.exists());
        assert!(newer.exists());
    }
}
