//! Concrete `Tool` implementation for the Claude Code CLI.

use std::collections::HashMap;
use std::path::Path;

use serde_json::json;

use super::Tool;

pub struct ClaudeCode;

impl Tool for ClaudeCode {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn config_dir_name(&self) -> &'static str {
        ".claude"
    }

    fn build_command(&self, _session_id: &str, resume: bool, internal_session_id: Option<&str>) -> Vec<String> {
        let mut argv = vec!["claude".to_string()];
        argv.push("--dangerously-skip-permissions".to_string());
        if resume {
            argv.push("--resume".to_string());
            if let Some(id) = internal_session_id {
                argv.push(id.to_string());
            }
        }
        argv
    }

    fn discover_session_id(&self, session_state_path: &Path) -> Option<String> {
        // The CLI keeps its most recent conversation id under
        // `<config-dir>/.session-id`, written on exit; fall back to scanning
        // the project history for the most recently modified session file.
        let direct = session_state_path.join(".session-id");
        if let Ok(contents) = std::fs::read_to_string(&direct) {
            let id = contents.trim();
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }

        let projects_dir = session_state_path.join("projects");
        let mut best: Option<(std::path::PathBuf, std::time::SystemTime)> = None;
        if let Ok(entries) = std::fs::read_dir(&projects_dir) {
            for project in entries.flatten() {
                if let Ok(files) = std::fs::read_dir(project.path()) {
                    for file in files.flatten() {
                        let path = file.path();
                        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                            continue;
                        }
                        if let Ok(meta) = file.metadata() {
                            if let Ok(modified) = meta.modified() {
                                if best.as_ref().map(|(_, t)| modified > *t).unwrap_or(true) {
                                    best = Some((path, modified));
                                }
                            }
                        }
                    }
                }
            }
        }

        best.and_then(|(path, _)| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
    }

    fn sandbox_settings(&self) -> HashMap<String, serde_json::Value> {
        let mut settings = HashMap::new();
        settings.insert(
            "permissions".to_string(),
            json!({ "defaultMode": "bypassPermissions" }),
        );
        settings.insert("hasTrustDialogAccepted".to_string(), json!(true));
        settings
    }

    fn first_launch_allowlist(&self) -> &'static [&'static str] {
        &[".credentials.json", "config.yml", "settings.json"]
    }

    fn credentials_file_name(&self) -> &'static str {
        ".credentials.json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_command_without_resume_has_no_resume_flag() {
        let tool = ClaudeCode;
        let argv = tool.build_command("sess", false, None);
        assert!(!argv.contains(&"--resume".to_string()));
    }

    #[test]
    fn build_command_with_resume_and_internal_id() {
        let tool = ClaudeCode;
        let argv = tool.build_command("sess", true, Some("internal-123"));
        let idx = argv.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(argv[idx + 1], "internal-123");
    }

    #[test]
    fn build_command_with_resume_but_no_internal_id_lets_agent_autodetect() {
        let tool = ClaudeCode;
        let argv = tool.build_command("sess", true, None);
        assert_eq!(argv.last().unwrap(), "--resume");
    }

    #[test]
    fn sandbox_settings_disables_prompts() {
        let tool = ClaudeCode;
        let settings = tool.sandbox_settings();
        assert!(settings.contains_key("permissions"));
    }
}
