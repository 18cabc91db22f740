//! Environment purging for shell subprocesses.
//!
//! The subprocess environment is built from an explicit allow-list rather
//! than a secret denylist: a denylist would leak new secret-bearing
//! variables as the ecosystem evolves.

use std::collections::HashMap;

const ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "USER", "LANG", "TERM"];

/// The purged environment handed to every shell subprocess.
pub fn create_env() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(key, _)| ENV_ALLOWLIST.contains(&key.as_str()))
        .collect()
}
