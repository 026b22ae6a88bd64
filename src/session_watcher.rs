//! Session Watcher (C7 supplement): the conversation-tailing logic
//! itself, not only the control plane's `lookup_watchers` responder.
//! Shipped as a library module because P7 ("delivers entries in file
//! order, never delivers the same deterministic entry id twice") is
//! only testable against a real watcher implementation.
//!
//! Runs conceptually inside the laptop agent; this crate's process
//! never schedules it on its own account, but embeds it so the bridge
//! and any future local-pod-side binary can share one tested
//! implementation of id-assignment and pagination logic.
//!
//! This module is the parse/dedupe/paginate core only — it does not
//! itself own a filesystem-event debounce timer. §4.7.2's debounce
//! window is the laptop-agent-side file watcher's job (coalescing
//! bursts of change events before calling back in here); nothing in
//! this process schedules that loop, so there's no debounce constant
//! to carry here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};

/// One normalised entry from a conversation's `.jsonl` file. Unknown
/// entry types are forwarded with `raw` populated and the typed fields
/// left at their defaults, per §4.7.2's "MUST NOT drop entry types it
/// does not understand".
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationEntry {
    pub entry_id: String,
    pub entry_type: String,
    pub raw: Value,
}

/// `/` <-> `-` translation Claude Code uses to flatten a project's
/// absolute path into a single directory-name component under
/// `~/.claude/projects`.
pub fn encode_project_path(path: &str) -> String {
    let normalized = normalize_path(path);
    normalized.replace('/', "-")
}

pub fn decode_project_path(encoded: &str) -> String {
    encoded.replace('-', "/")
}

fn normalize_path(path: &str) -> String {
    let mut parts = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if path.starts_with('/') {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Deterministic id for an entry that lacks a native identifier: the
/// lower 128 bits of a sha256 digest of the entry's canonical JSON
/// bytes, hex-encoded. Stable across restarts so deduplication still
/// works after a watcher is re-started mid-conversation.
pub fn stable_entry_id(value: &Value) -> String {
    let canonical = serde_json::to_vec(value).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    hex_encode(&digest[..16])
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing into a String never fails");
    }
    out
}

fn native_entry_id(raw: &Value) -> Option<String> {
    for key in ["uuid", "id", "leafUuid"] {
        if let Some(id) = raw.get(key).and_then(Value::as_str) {
            return Some(id.to_string());
        }
    }
    None
}

/// Parses one `.jsonl` conversation file into normalised entries, in
/// file order. Malformed lines are skipped and logged rather than
/// aborting the whole read — an in-progress append can leave a
/// partially-written trailing line.
pub fn parse_conversation_file(contents: &str) -> Vec<ConversationEntry> {
    let mut entries = Vec::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let raw: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(err) => {
                tracing::debug!(error = %err, "skipping malformed conversation line");
                continue;
            }
        };
        let entry_type = raw
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let entry_id = native_entry_id(&raw).unwrap_or_else(|| stable_entry_id(&raw));
        entries.push(ConversationEntry {
            entry_id,
            entry_type,
            raw,
        });
    }
    entries
}

/// §4.7.2 step 1: entries strictly after `last_synced_entry_id` in file
/// order. `None` means "nothing synced yet" — the whole file is new.
pub fn entries_after<'a>(
    entries: &'a [ConversationEntry],
    last_synced_entry_id: Option<&str>,
) -> &'a [ConversationEntry] {
    match last_synced_entry_id {
        None => entries,
        Some(marker) => match entries.iter().position(|e| e.entry_id == marker) {
            Some(index) => &entries[index + 1..],
            None => entries,
        },
    }
}

/// §4.7.2's "bottom-up fetch": paginate a slice of entries either
/// oldest-first (default) or newest-first (`reverse=true`), so a UI can
/// render the tail immediately and backfill.
pub fn paginate<'a>(
    entries: &'a [ConversationEntry],
    limit: usize,
    offset: usize,
    reverse: bool,
) -> Vec<&'a ConversationEntry> {
    if reverse {
        entries
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .collect()
    } else {
        entries.iter().skip(offset).take(limit).collect()
    }
}

/// Lists conversation ids under a project directory by scanning
/// `*.jsonl` files directly, per the Supplement: a project index file is
/// used only to enrich metadata, never trusted as the source of truth
/// for which sessions exist, since it can go stale or be incomplete.
pub async fn list_conversation_files(project_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(project_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// One watched conversation's read position, tracked per subscriber so
/// fan-out to multiple subscribers at different catch-up points never
/// cross-delivers another subscriber's already-seen entries.
#[derive(Debug, Clone, Default)]
pub struct WatcherCursor {
    last_synced_entry_id: HashMap<String, Option<String>>,
}

impl WatcherCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_synced(&self, subscriber_key: &str) -> Option<&str> {
        self.last_synced_entry_id
            .get(subscriber_key)
            .and_then(|o| o.as_deref())
    }

    pub fn advance(&mut self, subscriber_key: &str, entry_id: String) {
        self.last_synced_entry_id
            .insert(subscriber_key.to_string(), Some(entry_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips_simple_paths() {
        let path = "/home/dev/my-project";
        let encoded = encode_project_path(path);
        assert_eq!(encoded, "-home-dev-my-project");
        assert_eq!(decode_project_path(&encoded), path);
    }

    #[test]
    fn normalizes_dot_segments_before_encoding() {
        assert_eq!(encode_project_path("/home/dev/../dev/proj"), "-home-dev-proj");
    }

    #[test]
    fn unknown_entry_types_are_forwarded_with_raw_fields() {
        let jsonl = r#"{"type":"some_future_entry_type","custom_field":"value"}"#;
        let entries = parse_conversation_file(jsonl);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, "some_future_entry_type");
        assert_eq!(entries[0].raw["custom_field"], "value");
    }

    #[test]
    fn entries_without_native_id_get_a_stable_hash() {
        let jsonl = r#"{"type":"progress","data":"x"}"#;
        let first = parse_conversation_file(jsonl);
        let second = parse_conversation_file(jsonl);
        assert_eq!(first[0].entry_id, second[0].entry_id);
        assert_eq!(first[0].entry_id.len(), 32);
    }

    #[test]
    fn native_id_is_preferred_over_hash() {
        let jsonl = r#"{"type":"user","uuid":"abc-123","message":"hi"}"#;
        let entries = parse_conversation_file(jsonl);
        assert_eq!(entries[0].entry_id, "abc-123");
    }

    #[test]
    fn entries_after_returns_only_the_tail() {
        let jsonl = "{\"type\":\"user\",\"uuid\":\"a\"}\n{\"type\":\"user\",\"uuid\":\"b\"}\n{\"type\":\"user\",\"uuid\":\"c\"}";
        let entries = parse_conversation_file(jsonl);
        let tail = entries_after(&entries, Some("a"));
        assert_eq!(tail.iter().map(|e| e.entry_id.as_str()).collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn entries_after_with_no_marker_returns_everything() {
        let jsonl = "{\"type\":\"user\",\"uuid\":\"a\"}\n{\"type\":\"user\",\"uuid\":\"b\"}";
        let entries = parse_conversation_file(jsonl);
        assert_eq!(entries_after(&entries, None).len(), 2);
    }

    #[test]
    fn paginate_reverse_walks_newest_first() {
        let jsonl = "{\"type\":\"user\",\"uuid\":\"a\"}\n{\"type\":\"user\",\"uuid\":\"b\"}\n{\"type\":\"user\",\"uuid\":\"c\"}";
        let entries = parse_conversation_file(jsonl);
        let page = paginate(&entries, 2, 0, true);
        assert_eq!(page.iter().map(|e| e.entry_id.as_str()).collect::<Vec<_>>(), vec!["c", "b"]);
    }

    #[test]
    fn malformed_trailing_line_is_skipped_not_fatal() {
        let jsonl = "{\"type\":\"user\",\"uuid\":\"a\"}\n{not valid json";
        let entries = parse_conversation_file(jsonl);
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn lists_only_jsonl_files_in_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.jsonl"), "{}").await.unwrap();
        tokio::fs::write(dir.path().join("index.json"), "{}").await.unwrap();
        tokio::fs::write(dir.path().join("b.jsonl"), "{}").await.unwrap();

        let files = list_conversation_files(dir.path()).await.unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|p| p.extension().unwrap() == "jsonl"));
    }

    #[test]
    fn watcher_cursor_tracks_per_subscriber_position() {
        let mut cursor = WatcherCursor::new();
        assert_eq!(cursor.last_synced("sub1"), None);
        cursor.advance("sub1", "entry-5".to_string());
        assert_eq!(cursor.last_synced("sub1"), Some("entry-5"));
        assert_eq!(cursor.last_synced("sub2"), None);
    }

    // P7 end-to-end: a subscriber never re-receives an entry it has
    // already advanced its cursor past, even after the file grows and
    // is re-parsed from scratch, and the entries it does receive arrive
    // in file order.
    #[test]
    fn cursor_advance_then_reparse_delivers_only_new_entries_in_order() {
        let mut cursor = WatcherCursor::new();
        let subscriber = "sub1";

        let first_read = "{\"type\":\"user\",\"uuid\":\"a\"}\n{\"type\":\"user\",\"uuid\":\"b\"}";
        let entries = parse_conversation_file(first_read);
        let tail = entries_after(&entries, cursor.last_synced(subscriber));
        assert_eq!(tail.iter().map(|e| e.entry_id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        cursor.advance(subscriber, tail.last().unwrap().entry_id.clone());

        // The underlying file has grown by two more lines; the watcher
        // re-parses it in full, as it would after a debounce fires.
        let grown = "{\"type\":\"user\",\"uuid\":\"a\"}\n{\"type\":\"user\",\"uuid\":\"b\"}\n{\"type\":\"user\",\"uuid\":\"c\"}\n{\"type\":\"user\",\"uuid\":\"d\"}";
        let entries = parse_conversation_file(grown);
        let tail = entries_after(&entries, cursor.last_synced(subscriber));
        assert_eq!(tail.iter().map(|e| e.entry_id.as_str()).collect::<Vec<_>>(), vec!["c", "d"]);
        cursor.advance(subscriber, tail.last().unwrap().entry_id.clone());

        // Nothing new arrived: re-parsing again yields an empty tail,
        // never a repeat of "c" or "d".
        let entries = parse_conversation_file(grown);
        let tail = entries_after(&entries, cursor.last_synced(subscriber));
        assert!(tail.is_empty());
    }
}
