//! Interactive attach/dispatch through a terminal multiplexer running inside
//! the container, driven entirely over the hypervisor's subprocess `exec`.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info};

use crate::container::{ContainerManager, ExecOpts};
use crate::error::HypervisorError;

const SERVER_POLL_ATTEMPTS: u32 = 20;
const SERVER_POLL_INTERVAL: Duration = Duration::from_millis(100);
const ATTACH_SETTLE_DELAY: Duration = Duration::from_millis(500);

const DENYLISTED_MESSAGES: &[&str] = &["Failed to retrieve PID", "server exited", "connection reset"];

pub struct InteractiveRunner {
    containers: ContainerManager,
    container_name: String,
}

impl InteractiveRunner {
    pub fn new(containers: ContainerManager, container_name: impl Into<String>) -> Self {
        Self {
            containers,
            container_name: container_name.into(),
        }
    }

    fn session_name(&self) -> String {
        format!("coi-{}", self.container_name)
    }

    fn exec_opts(&self, interactive: bool, term: &str) -> ExecOpts {
        let mut env = HashMap::new();
        env.insert("TERM".to_string(), term.to_string());
        ExecOpts {
            interactive,
            env,
            ..Default::default()
        }
    }

    fn ensure_server_running(&self) -> Result<(), HypervisorError> {
        for _ in 0..SERVER_POLL_ATTEMPTS {
            if self
                .containers
                .exec_command(&self.container_name, "tmux list-sessions >/dev/null 2>&1 || tmux start-server", &ExecOpts::default())
                .is_ok()
            {
                return Ok(());
            }
            std::thread::sleep(SERVER_POLL_INTERVAL);
        }
        self.containers
            .exec_command(&self.container_name, "tmux start-server", &ExecOpts::default())
    }

    fn session_exists(&self) -> bool {
        let probe = format!("tmux has-session -t {}", shell_escape::escape(self.session_name().as_str().into()));
        self.containers
            .exec_command(&self.container_name, &probe, &ExecOpts::default())
            .is_ok()
    }

    /// Dispatch `command` either into a fresh multiplexer session or an
    /// existing one, in foreground (attached) or background mode. `term` is
    /// sanitized and injected into the exec/multiplexer environment; a
    /// benign exit (expected signal, or a known detach race) is folded into
    /// `Ok(())` rather than propagated as a failure.
    pub fn dispatch(&self, command: &str, interactive: bool, term: &str) -> Result<(), HypervisorError> {
        let term = sanitize_term(term);
        self.ensure_server_running()?;
        let exists = self.session_exists();
        let session = self.session_name();

        let (result, stderr) = match (exists, interactive) {
            (true, false) => {
                info!(session, "sending keystrokes to existing session");
                let send = format!(
                    "tmux send-keys -t {} {} Enter",
                    shell_escape::escape(session.as_str().into()),
                    shell_escape::escape(command.into())
                );
                self.containers
                    .exec_command_checked(&self.container_name, &send, &self.exec_opts(false, &term))
            }
            (true, true) => {
                info!(session, "attaching to existing session");
                let attach = format!("tmux attach-session -t {}", shell_escape::escape(session.as_str().into()));
                self.containers
                    .exec_command_checked(&self.container_name, &attach, &self.exec_opts(true, &term))
            }
            (false, false) => {
                info!(session, "creating detached session for background command");
                let wrapped = format!("trap : INT; {}; exec bash", command);
                let create = format!(
                    "tmux new-session -d -s {} {}",
                    shell_escape::escape(session.as_str().into()),
                    shell_escape::escape(wrapped.into())
                );
                self.containers
                    .exec_command_checked(&self.container_name, &create, &self.exec_opts(false, &term))
            }
            (false, true) => {
                info!(session, "creating session then attaching");
                let create = format!(
                    "tmux new-session -d -s {} {}",
                    shell_escape::escape(session.as_str().into()),
                    shell_escape::escape(command.into())
                );
                let (create_result, create_stderr) =
                    self.containers
                        .exec_command_checked(&self.container_name, &create, &self.exec_opts(false, &term));
                if let Err(e) = create_result {
                    (Err(e), create_stderr)
                } else {
                    std::thread::sleep(ATTACH_SETTLE_DELAY);
                    let attach = format!("tmux attach-session -t {}", shell_escape::escape(session.as_str().into()));
                    self.containers
                        .exec_command_checked(&self.container_name, &attach, &self.exec_opts(true, &term))
                }
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(HypervisorError::Exit(e)) if Self::is_benign_exit(Some(e.code), &stderr) => {
                debug!(container = %self.container_name, code = e.code, "treating dispatch exit as benign");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Whether an exit from an interactive attach should be reported to the
    /// user as a failure. 130/137/143 are expected signal-driven exits; a
    /// handful of multiplexer error strings are benign detach races, not
    /// real failures of the underlying command.
    pub fn is_benign_exit(code: Option<i32>, stderr: &str) -> bool {
        if let Some(c) = code {
            if matches!(c, 130 | 137 | 143) {
                return true;
            }
        }
        DENYLISTED_MESSAGES.iter().any(|m| stderr.contains(m))
    }
}

/// Join an argv into a single shell-safe command string for the
/// tmux-over-exec path, which only accepts one command string.
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|a| shell_escape::escape(a.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalize the host's `TERM` for use inside the container. Known modern
/// terminals (ghostty, wezterm, ...) and multiplexer values (tmux-256color,
/// screen-256color) advertise or assume terminfo entries the container image
/// is unlikely to ship; rewriting them to the widely-available
/// `xterm-256color` keeps `tmux`/readline apps functional. Everything else
/// passes through unchanged. Idempotent so callers can apply it without
/// tracking whether it already ran.
pub fn sanitize_term(term: &str) -> String {
    const REWRITE: &[&str] = &[
        "ghostty",
        "wezterm",
        "alacritty",
        "kitty",
        "tmux-256color",
        "screen-256color",
    ];

    if term.is_empty() {
        return "xterm-256color".to_string();
    }
    if REWRITE.iter().any(|t| term.contains(t)) {
        debug!(term, "rewriting unsupported TERM to xterm-256color");
        return "xterm-256color".to_string();
    }
    term.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_term_defaults_to_xterm() {
        assert_eq!(sanitize_term(""), "xterm-256color");
    }

    #[test]
    fn known_multiplexer_terms_rewrite_to_xterm() {
        assert_eq!(sanitize_term("tmux-256color"), "xterm-256color");
        assert_eq!(sanitize_term("screen-256color"), "xterm-256color");
    }

    #[test]
    fn modern_terminals_rewrite_to_xterm() {
        assert_eq!(sanitize_term("ghostty"), "xterm-256color");
        assert_eq!(sanitize_term("xterm-kitty"), "xterm-256color");
        assert_eq!(sanitize_term("wezterm"), "xterm-256color");
    }

    #[test]
    fn unrecognized_terms_pass_through_unchanged() {
        assert_eq!(sanitize_term("vt100"), "vt100");
        assert_eq!(sanitize_term("xterm-256color"), "xterm-256color");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for term in ["", "ghostty", "tmux-256color", "vt100", "xterm-256color"] {
            let once = sanitize_term(term);
            let twice = sanitize_term(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn signal_exit_codes_are_benign() {
        assert!(InteractiveRunner::is_benign_exit(Some(130), ""));
        assert!(InteractiveRunner::is_benign_exit(Some(137), ""));
        assert!(InteractiveRunner::is_benign_exit(Some(143), ""));
        assert!(!InteractiveRunner::is_benign_exit(Some(1), ""));
    }

    #[test]
    fn denylisted_messages_are_benign() {
        assert!(InteractiveRunner::is_benign_exit(Some(1), "server exited unexpectedly"));
        assert!(!InteractiveRunner::is_benign_exit(Some(1), "command not found"));
    }
}
