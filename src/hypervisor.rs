//! Thin driver over the external hypervisor CLI.
//!
//! Everything above this module talks to the hypervisor only through
//! `exec_silent` / `exec_capture` / `exec_interactive`. No other module is
//! allowed to shell out directly, so the exit-code and argument-passing
//! contracts stay in one place.

use std::collections::HashMap;
use std::io::Write;
use std::process::{Command, Stdio};

use tracing::{debug, trace};

use crate::error::{ExitError, HypervisorError};

/// Name of the executable to invoke, and any environment overlay to apply to
/// every invocation (used by tests to point at a stub binary).
#[derive(Debug, Clone)]
pub struct HypervisorDriver {
    bin: String,
    env: HashMap<String, String>,
}

impl Default for HypervisorDriver {
    fn default() -> Self {
        let bin = std::env::var("COI_HYPERVISOR_BIN").unwrap_or_else(|_| "incus".to_string());
        Self {
            bin,
            env: HashMap::new(),
        }
    }
}

impl HypervisorDriver {
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }

    /// Run `args` via the dedicated args-path: no shell is invoked, so
    /// whitespace and shell metacharacters in any argument are preserved
    /// verbatim. This is the path every structured operation (init, launch,
    /// exec with an argv, ...) should use.
    pub fn exec_silent(&self, args: &[&str]) -> Result<(), HypervisorError> {
        trace!(bin = %self.bin, ?args, "exec_silent");
        let status = self
            .command(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        self.classify(status.code())
    }

    /// Same as `exec_silent` but keeps the child's stderr text alongside the
    /// classified result instead of discarding it, so callers that need to
    /// tell a benign failure message from a real one (the interactive
    /// runner's exit classification) have something to match against.
    pub fn exec_silent_capturing_stderr(&self, args: &[&str]) -> (Result<(), HypervisorError>, String) {
        trace!(bin = %self.bin, ?args, "exec_silent_capturing_stderr");
        let output = self
            .command(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();
        match output {
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
                (self.classify(out.status.code()), stderr)
            }
            Err(e) => (Err(HypervisorError::Io(e)), String::new()),
        }
    }

    /// Same as `exec_silent` but returns captured stdout. stderr is
    /// discarded on success and folded into the error on failure.
    pub fn exec_capture(&self, args: &[&str]) -> Result<String, HypervisorError> {
        trace!(bin = %self.bin, ?args, "exec_capture");
        let output = self.command(args).stdin(Stdio::null()).output()?;
        if !output.status.success() {
            debug!(
                stderr = %String::from_utf8_lossy(&output.stderr),
                "hypervisor command failed"
            );
            self.classify(output.status.code())?;
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run `args`, inheriting this process's stdin/stdout/stderr. Used for
    /// PTY-style interactive attachment (e.g. `exec -it` into a multiplexer
    /// session). Exit codes 130/137/143 are classified normally here —
    /// higher layers (the interactive runner) are responsible for treating
    /// them as benign, since only they know the call was interactive.
    pub fn exec_interactive(&self, args: &[&str]) -> Result<(), HypervisorError> {
        trace!(bin = %self.bin, ?args, "exec_interactive");
        let status = self
            .command(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()?;
        self.classify(status.code())
    }

    /// Same as `exec_capture` but writes `stdin_payload` to the child's
    /// stdin before waiting on it. Used to feed structured data (e.g. a JSON
    /// merge payload) to an in-container helper without ever shell-escaping
    /// it onto the command line.
    pub fn exec_capture_with_stdin(&self, args: &[&str], stdin_payload: &[u8]) -> Result<String, HypervisorError> {
        trace!(bin = %self.bin, ?args, "exec_capture_with_stdin");
        let mut child = self
            .command(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        {
            let mut stdin = child.stdin.take().expect("stdin was requested as piped");
            stdin.write_all(stdin_payload)?;
        } // drop closes the pipe so the child sees EOF
        let output = child.wait_with_output()?;
        if !output.status.success() {
            debug!(
                stderr = %String::from_utf8_lossy(&output.stderr),
                "hypervisor command failed"
            );
            self.classify(output.status.code())?;
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a caller-supplied shell string through the hypervisor's `--` bash
    /// invocation. Only used when the caller explicitly wants shell
    /// features (pipes, globbing); everything else must go through the
    /// args-path so user commands are never re-parsed by a shell.
    pub fn exec_bash_capture(&self, argv_prefix: &[&str], script: &str) -> Result<String, HypervisorError> {
        let mut args: Vec<&str> = argv_prefix.to_vec();
        args.push("bash");
        args.push("-c");
        args.push(script);
        self.exec_capture(&args)
    }

    fn classify(&self, code: Option<i32>) -> Result<(), HypervisorError> {
        match code {
            Some(0) => Ok(()),
            Some(n) => Err(HypervisorError::Exit(ExitError::new(n))),
            None => Err(HypervisorError::Exit(ExitError::new(-1))),
        }
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_zero_is_ok() {
        let d = HypervisorDriver::new("true");
        assert!(d.classify(Some(0)).is_ok());
    }

    #[test]
    fn classify_nonzero_wraps_exit_error() {
        let d = HypervisorDriver::new("true");
        let err = d.classify(Some(137)).unwrap_err();
        match err {
            HypervisorError::Exit(e) => assert_eq!(e.code, 137),
            _ => panic!("expected Exit variant"),
        }
    }

    #[test]
    fn exec_silent_against_real_true_and_false() {
        let ok = HypervisorDriver::new("true");
        assert!(ok.exec_silent(&[]).is_ok());

        let bad = HypervisorDriver::new("false");
        let err = bad.exec_silent(&[]).unwrap_err();
        assert!(matches!(err, HypervisorError::Exit(_)));
    }

    #[test]
    fn exec_capture_returns_stdout() {
        let d = HypervisorDriver::new("echo");
        let out = d.exec_capture(&["hello world"]).unwrap();
        assert_eq!(out.trim(), "hello world");
    }

    #[test]
    fn exec_capture_with_stdin_roundtrips_through_cat() {
        let d = HypervisorDriver::new("cat");
        let out = d.exec_capture_with_stdin(&[], b"hello from stdin").unwrap();
        assert_eq!(out, "hello from stdin");
    }

    #[test]
    fn preserves_whitespace_in_args() {
        // The args-path must not collapse/re-split on whitespace the way a
        // shell would if the command were wrapped in `sh -c`.
        let d = HypervisorDriver::new("echo");
        let out = d.exec_capture(&["a  b   c"]).unwrap();
        assert_eq!(out.trim(), "a  b   c");
    }
}
