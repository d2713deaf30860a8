//! Per-agent policy.
//!
//! Isolating agent-specific quirks (flag names, config-directory naming,
//! sandbox-settings schema) behind one small trait means adding a new agent
//! is "implement this trait", not "teach the orchestrator a new branch".

use std::collections::HashMap;
use std::path::Path;

pub mod claude_code;
pub mod sandbox_merge;

pub use claude_code::ClaudeCode;

/// Capability set an agent CLI must expose to be orchestrated.
pub trait Tool: Send + Sync {
    /// Human-readable identifier, also used as the default sessions-subdir
    /// suffix (`sessions-<name>`).
    fn name(&self) -> &'static str;

    /// In-container config directory name (e.g. `.claude`). An empty string
    /// signals "this tool authenticates via environment variables; do not
    /// manage a config directory" — `ConfigDirName` callers must check for
    /// this before doing any config-dir push/pull/chown.
    fn config_dir_name(&self) -> &'static str;

    /// Subdirectory of the session store's base this tool's saved sessions
    /// live under.
    fn sessions_dir_name(&self) -> String {
        format!("sessions-{}", self.name())
    }

    /// Build the argv to launch the agent inside the container.
    fn build_command(&self, session_id: &str, resume: bool, internal_session_id: Option<&str>) -> Vec<String>;

    /// Discover the tool's own internal session id by inspecting its
    /// restored state directory. Returns `None` if it can't be determined
    /// (e.g. first-ever run, or the tool manages no internal id).
    fn discover_session_id(&self, session_state_path: &Path) -> Option<String>;

    /// Keys to merge into the tool's state JSON file to disable interactive
    /// permission prompts so the agent runs non-interactively. Empty map if
    /// the tool has no such concept.
    fn sandbox_settings(&self) -> HashMap<String, serde_json::Value>;

    /// Name of the JSON file (relative to the config dir) sandbox settings
    /// get merged into, e.g. `settings.json`.
    fn state_file_name(&self) -> &'static str {
        "settings.json"
    }

    /// Small allowlist of files safe to copy from the host's CLI-config path
    /// on first launch (credentials, non-secret preferences). Never the
    /// agent's full history/cache.
    fn first_launch_allowlist(&self) -> &'static [&'static str];

    /// Name of the credentials file pushed fresh into the container on
    /// every resume, regardless of persistent/ephemeral mode.
    fn credentials_file_name(&self) -> &'static str;
}

/// Resolve a tool by name.
pub fn by_name(name: &str) -> Option<Box<dyn Tool>> {
    match name {
        "claude" | "claude-code" => Some(Box::new(ClaudeCode)),
        _ => None,
    }
}
