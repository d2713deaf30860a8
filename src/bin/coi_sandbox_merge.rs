//! Standalone helper pushed into the container image's filesystem. Reads a
//! `MergeRequest` JSON payload from stdin, merges it, writes the merged
//! JSON to stdout. Kept dependency-free beyond `serde_json` so it's cheap to
//! push and has no risk of diverging from the host's merge semantics.

use std::io::{self, Read, Write};

use coi::tool::sandbox_merge::{merge_json, MergeRequest};

fn main() -> io::Result<()> {
    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;

    let request: MergeRequest = serde_json::from_str(&input).unwrap_or_else(|e| {
        eprintln!("coi-sandbox-merge: invalid input: {e}");
        std::process::exit(1);
    });

    let merged = merge_json(request.base, request.overlay);
    io::stdout().write_all(serde_json::to_string_pretty(&merged)?.as_bytes())?;
    Ok(())
}
