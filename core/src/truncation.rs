//! Truncate oversized tool returns, spilling the full output to disk.

use std::path::Path;
use std::path::PathBuf;

use autopoiesis_protocol::Message;
use autopoiesis_protocol::Part;
use tracing::warn;

/// Default byte limit for tool-return content kept in history.
pub const DEFAULT_MAX_TOOL_RESULT_BYTES: usize = 5 * 1024;

const SPILL_SUBDIR: &str = "tool-results";

/// Rewrite any tool-return part whose content exceeds `max_bytes`: the
/// history keeps a prefix plus a pointer line, the full content is spilled
/// to a per-call file under `tmp_dir`.
pub fn truncate_tool_results(
    messages: Vec<Message>,
    tmp_dir: &Path,
    max_bytes: usize,
) -> Vec<Message> {
    let mut spill_dir: Option<PathBuf> = None;
    messages
        .into_iter()
        .map(|mut msg| {
            let needs_update = msg.parts.iter().any(|p| {
                matches!(p, Part::ToolReturn { content, .. } if content.len() > max_bytes)
            });
            if !needs_update {
                return msg;
            }
            let dir = spill_dir.get_or_insert_with(|| ensure_spill_dir(tmp_dir));
            msg.parts = msg
                .parts
                .into_iter()
                .map(|part| truncate_part(part, dir, max_bytes))
                .collect();
            msg
        })
        .collect()
}

fn truncate_part(part: Part, spill_dir: &Path, max_bytes: usize) -> Part {
    let Part::ToolReturn {
        tool_call_id,
        tool_name,
        content,
    } = part
    else {
        return part;
    };
    if content.len() <= max_bytes {
        return Part::ToolReturn {
            tool_call_id,
            tool_name,
            content,
        };
    }

    let spill_path = spill_dir.join(format!("{tool_call_id}.log"));
    if let Err(err) = std::fs::write(&spill_path, &content) {
        warn!(tool_call_id, "failed to spill tool result: {err}");
    }

    // Cut on a char boundary at or below the byte limit.
    let mut cut = max_bytes;
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    let truncated = format!(
        "{}\n[Truncated — full output ({} bytes) saved to {}]",
        &content[..cut],
        content.len(),
        spill_path.display(),
    );
    Part::ToolReturn {
        tool_call_id,
        tool_name,
        content: truncated,
    }
}

fn ensure_spill_dir(tmp_dir: &Path) -> PathBuf {
    let dir = tmp_dir.join(SPILL_SUBDIR);
    if let Err(err) = std::fs::create_dir_all(&dir) {
        warn!("failed to create tool-result spill dir: {err}");
    }
    dir
}
