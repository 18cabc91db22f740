//! Shell-command risk classification for the approval gate.
//!
//! A command string is split on chain operators (`;`, `&&`, `||`, `|`) and
//! each sub-command is classified by its first token; the most dangerous
//! tier seen wins. Redirects to absolute paths are caught before
//! tokenisation.

use std::sync::LazyLock;

use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;

/// Risk tier, least to most dangerous. `Ord` follows declaration order so
/// `max` picks the most dangerous tier of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Review,
    Approve,
    Block,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Review => "review",
            Tier::Approve => "approve",
            Tier::Block => "block",
        }
    }
}

const FREE_COMMANDS: &[&str] = &[
    "ls", "cat", "head", "tail", "wc", "echo", "pwd", "grep", "find", "rg", "true", "false",
    "date", "whoami", "which", "env", "printenv", "sort", "uniq", "diff", "seq", "tr", "cut",
    "awk", "sed", "tee", "less", "more", "file", "stat", "du", "df", "uname", "id", "basename",
    "dirname", "realpath", "readlink", "test", "sleep",
];

const FREE_GIT: &[&str] = &[
    "status", "log", "diff", "branch", "show", "stash", "tag", "remote", "fetch",
];
const REVIEW_GIT: &[&str] = &["commit", "add", "reset", "rebase", "merge", "cherry-pick"];
const APPROVE_GIT: &[&str] = &["push", "force-push"];

/// Interpreter invocations and session managers land in `review`.
const REVIEW_COMMANDS: &[&str] = &["pip", "pip3", "python", "python3", "tmux"];

const APPROVE_COMMANDS: &[&str] = &[
    "rm", "curl", "wget", "chmod", "chown", "chgrp", "mv", "cp", "mkfs", "dd", "mount", "umount",
    "kill", "killall",
];

/// Privilege escalation is unconditionally denied.
const BLOCK_COMMANDS: &[&str] = &["sudo", "su", "doas"];

static REDIRECT_TO_ABSOLUTE: LazyLock<Regex> = LazyLock::new(|| {
    // The pattern is a literal; compilation cannot fail.
    #[allow(clippy::unwrap_used)]
    let redirect = Regex::new(r">\s*/").unwrap();
    redirect
});

/// Classify a full shell command string into its security tier.
pub fn classify(command: &str) -> Tier {
    split_chains(command)
        .iter()
        .map(|part| classify_single(part))
        .max()
        .unwrap_or(Tier::Free)
}

fn classify_single(command: &str) -> Tier {
    let command = command.trim();
    if command.is_empty() {
        return Tier::Free;
    }

    if REDIRECT_TO_ABSOLUTE.is_match(command) {
        return Tier::Approve;
    }

    let tokens = shlex::split(command)
        .unwrap_or_else(|| command.split_whitespace().map(str::to_string).collect());
    let Some(first) = tokens.first() else {
        return Tier::Free;
    };
    // Strip any leading path so `/usr/bin/sudo` matches `sudo`.
    let program = first.rsplit('/').next().unwrap_or(first);

    if BLOCK_COMMANDS.contains(&program) {
        return Tier::Block;
    }
    if APPROVE_COMMANDS.contains(&program) {
        return Tier::Approve;
    }
    if program == "git" {
        return match tokens.get(1).map(String::as_str) {
            Some(sub) if APPROVE_GIT.contains(&sub) => Tier::Approve,
            Some(sub) if REVIEW_GIT.contains(&sub) => Tier::Review,
            Some(sub) if FREE_GIT.contains(&sub) => Tier::Free,
            // Un-classified git subcommands (and bare `git`) need review.
            _ => Tier::Review,
        };
    }
    if REVIEW_COMMANDS.contains(&program) {
        return Tier::Review;
    }
    if FREE_COMMANDS.contains(&program) {
        return Tier::Free;
    }
    // Unknown commands default to review rather than approve.
    Tier::Review
}

/// Split on `;`, `&&`, `||` and `|`, preserving order.
fn split_chains(command: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let bytes: Vec<char> = command.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            ';' => {
                parts.push(std::mem::take(&mut current));
                i += 1;
            }
            '&' if bytes.get(i + 1) == Some(&'&') => {
                parts.push(std::mem::take(&mut current));
                i += 2;
            }
            '|' => {
                parts.push(std::mem::take(&mut current));
                // `||` consumes two chars, `|` one.
                i += if bytes.get(i + 1) == Some(&'|') { 2 } else { 1 };
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_commands() {
        assert_eq!(classify("ls"), Tier::Free);
        assert_eq!(classify("cat foo.txt"), Tier::Free);
        assert_eq!(classify("git status"), Tier::Free);
        assert_eq!(classify("git log --oneline"), Tier::Free);
        assert_eq!(classify(""), Tier::Free);
    }

    #[test]
    fn review_commands() {
        assert_eq!(classify("python script.py"), Tier::Review);
        assert_eq!(classify("pip install requests"), Tier::Review);
        assert_eq!(classify("git commit -m x"), Tier::Review);
        // Un-classified git subcommand.
        assert_eq!(classify("git bisect start"), Tier::Review);
        // Unknown command defaults to review.
        assert_eq!(classify("frobnicate --all"), Tier::Review);
    }

    #[test]
    fn approve_commands() {
        assert_eq!(classify("rm /tmp/foo"), Tier::Approve);
        assert_eq!(classify("curl https://example.com"), Tier::Approve);
        assert_eq!(classify("git push origin main"), Tier::Approve);
        assert_eq!(classify("mv a b"), Tier::Approve);
    }

    #[test]
    fn block_commands() {
        assert_eq!(classify("sudo rm -rf /"), Tier::Block);
        assert_eq!(classify("su root"), Tier::Block);
        assert_eq!(classify("doas ls"), Tier::Block);
    }

    #[test]
    fn leading_path_is_stripped() {
        assert_eq!(classify("/usr/bin/sudo ls"), Tier::Block);
        assert_eq!(classify("/bin/ls"), Tier::Free);
    }

    #[test]
    fn redirect_to_absolute_path_requires_approval() {
        assert_eq!(classify("echo hi > /etc/motd"), Tier::Approve);
        assert_eq!(classify("echo hi >/tmp/out"), Tier::Approve);
        // Relative redirect stays at the command's own tier.
        assert_eq!(classify("echo hi > out.txt"), Tier::Free);
    }

    #[test]
    fn chains_take_the_most_dangerous_tier() {
        assert_eq!(classify("ls && rm /tmp/foo"), Tier::Approve);
        assert_eq!(classify("cat a | grep b"), Tier::Free);
        assert_eq!(classify("ls; sudo reboot"), Tier::Block);
        assert_eq!(classify("python x.py || ls"), Tier::Review);
    }

    #[test]
    fn classifier_is_monotone_over_chaining() {
        let pairs = [
            ("ls", "rm /x"),
            ("git status", "git push"),
            ("echo hi", "sudo id"),
            ("python a.py", "cat b"),
        ];
        for (a, b) in pairs {
            let chained = classify(&format!("{a} && {b}"));
            assert_eq!(chained, classify(a).max(classify(b)));
        }
    }

    #[test]
    fn unbalanced_quotes_fall_back_to_whitespace_tokens() {
        // shlex fails on the dangling quote; the fallback still sees `rm`.
        assert_eq!(classify("rm 'unterminated"), Tier::Approve);
    }
}
