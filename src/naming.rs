//! Deterministic container naming and slot allocation.
//!
//! `ContainerName`/`ParseContainerName`/`WorkspaceHash` are pure. Slot
//! allocation needs the live container list, which is supplied by the
//! caller (the container manager) so this module stays testable without a
//! hypervisor.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::OnceLock;

use crate::error::SlotError;

pub const DEFAULT_MAX_SLOTS: u32 = 10;
pub const DEFAULT_PREFIX: &str = "coi-";

/// The prefix in effect, honoring `COI_CONTAINER_PREFIX` so test runs never
/// collide with real sessions.
pub fn container_prefix() -> String {
    std::env::var("COI_CONTAINER_PREFIX").unwrap_or_else(|_| DEFAULT_PREFIX.to_string())
}

/// Eight lowercase hex characters: the first 32 bits of sha256(absolute workspace path).
pub fn workspace_hash(workspace: &Path) -> String {
    let absolute = absolute_path(workspace);
    let digest = Sha256::digest(absolute.as_bytes());
    hex_encode(&digest[..4])
}

fn absolute_path(workspace: &Path) -> String {
    let absolute = if workspace.is_absolute() {
        workspace.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(workspace))
            .unwrap_or_else(|_| workspace.to_path_buf())
    };
    absolute.to_string_lossy().into_owned()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// `"<prefix><workspace-hash>-<slot>"`.
pub fn container_name(workspace: &Path, slot: u32) -> String {
    format!("{}{}-{}", container_prefix(), workspace_hash(workspace), slot)
}

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let prefix = regex::escape(&container_prefix());
        Regex::new(&format!(r"^{}([0-9a-f]{{8}})-([0-9]+)$", prefix)).unwrap()
    })
}

/// Inverse of `container_name`: recovers `(workspace_hash, slot)`.
pub fn parse_container_name(name: &str) -> Option<(String, u32)> {
    let caps = name_regex().captures(name)?;
    let hash = caps.get(1)?.as_str().to_string();
    let slot: u32 = caps.get(2)?.as_str().parse().ok()?;
    Some((hash, slot))
}

/// Lowest integer in `[1, max_slots]` not present as a running container for
/// this workspace. `running_names` is the full list of currently running
/// container names (any workspace); this function filters to the ones
/// matching `workspace`'s hash.
pub fn allocate_slot(
    workspace: &Path,
    running_names: &[String],
    max_slots: u32,
) -> Result<u32, SlotError> {
    allocate_slot_from(workspace, running_names, 1, max_slots)
}

/// Same as `allocate_slot` but starts the search at `start` instead of 1 —
/// used when a caller's requested slot was occupied and we want "the next
/// free slot >= request + 1".
pub fn allocate_slot_from(
    workspace: &Path,
    running_names: &[String],
    start: u32,
    max_slots: u32,
) -> Result<u32, SlotError> {
    let hash = workspace_hash(workspace);
    let occupied = occupied_slots(&hash, running_names);

    for slot in start..=max_slots {
        if !occupied.contains(&slot) {
            return Ok(slot);
        }
    }
    Err(SlotError::NoFreeSlot { hash, max_slots })
}

/// Point query: is this specific slot free for this workspace right now?
pub fn is_slot_available(workspace: &Path, running_names: &[String], slot: u32) -> bool {
    let hash = workspace_hash(workspace);
    !occupied_slots(&hash, running_names).contains(&slot)
}

fn occupied_slots(hash: &str, running_names: &[String]) -> Vec<u32> {
    running_names
        .iter()
        .filter_map(|n| parse_container_name(n))
        .filter(|(h, _)| h == hash)
        .map(|(_, slot)| slot)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ws(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn name_is_deterministic() {
        let a = container_name(&ws("/tmp/proj"), 1);
        let b = container_name(&ws("/tmp/proj"), 1);
        assert_eq!(a, b);
    }

    #[test]
    fn name_round_trips_through_parse() {
        let name = container_name(&ws("/tmp/proj"), 3);
        let (hash, slot) = parse_container_name(&name).expect("should parse");
        assert_eq!(hash, workspace_hash(&ws("/tmp/proj")));
        assert_eq!(slot, 3);
    }

    #[test]
    fn different_workspaces_hash_differently() {
        let h1 = workspace_hash(&ws("/tmp/a"));
        let h2 = workspace_hash(&ws("/tmp/b"));
        assert_ne!(h1, h2);
        assert_eq!(h1.len(), 8);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn allocate_slot_picks_lowest_free() {
        let workspace = ws("/tmp/proj");
        let hash = workspace_hash(&workspace);
        let running = vec![
            format!("{}{}-1", container_prefix(), hash),
            format!("{}{}-2", container_prefix(), hash),
        ];
        let slot = allocate_slot(&workspace, &running, DEFAULT_MAX_SLOTS).unwrap();
        assert_eq!(slot, 3);
    }

    #[test]
    fn allocate_slot_never_returns_running_slot() {
        let workspace = ws("/tmp/proj");
        let hash = workspace_hash(&workspace);
        for occupied in 1..=5u32 {
            let running = vec![format!("{}{}-{}", container_prefix(), hash, occupied)];
            let slot = allocate_slot(&workspace, &running, DEFAULT_MAX_SLOTS).unwrap();
            assert_ne!(slot, occupied);
        }
    }

    #[test]
    fn allocate_slot_exhausted_errors() {
        let workspace = ws("/tmp/proj");
        let hash = workspace_hash(&workspace);
        let running: Vec<String> = (1..=3).map(|s| format!("{}{}-{}", container_prefix(), hash, s)).collect();
        let err = allocate_slot(&workspace, &running, 3).unwrap_err();
        assert!(matches!(err, SlotError::NoFreeSlot { .. }));
    }

    #[test]
    fn allocate_slot_from_skips_requested_occupied() {
        let workspace = ws("/tmp/proj");
        let hash = workspace_hash(&workspace);
        let running = vec![
            format!("{}{}-2", container_prefix(), hash),
        ];
        // caller requested slot 2; it's occupied, so search starts at 3.
        let slot = allocate_slot_from(&workspace, &running, 3, DEFAULT_MAX_SLOTS).unwrap();
        assert_eq!(slot, 3);
    }

    #[test]
    fn is_slot_available_ignores_other_workspaces() {
        let a = ws("/tmp/a");
        let b = ws("/tmp/b");
        let hash_b = workspace_hash(&b);
        let running = vec![format!("{}{}-1", container_prefix(), hash_b)];
        assert!(is_slot_available(&a, &running, 1));
        assert!(!is_slot_available(&b, &running, 1));
    }

    #[test]
    fn parse_rejects_malformed_names() {
        assert!(parse_container_name("not-a-container").is_none());
        assert!(parse_container_name("coi-short-1").is_none());
        assert!(parse_container_name("coi-deadbeef-notanumber").is_none());
    }
}
