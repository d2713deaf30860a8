//! Typed facade over the hypervisor driver.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::HypervisorError;
use crate::hypervisor::HypervisorDriver;

/// Options for an in-container exec.
#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    pub user: Option<u32>,
    pub group: Option<u32>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub interactive: bool,
}

impl ExecOpts {
    pub fn user(uid: u32) -> Self {
        Self {
            user: Some(uid),
            group: Some(uid),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawContainer {
    name: String,
    status: Option<String>,
}

/// Typed operations over the hypervisor CLI for one logical container
/// manager instance. Stateless beyond the driver — every call re-shells out.
#[derive(Clone)]
pub struct ContainerManager {
    driver: HypervisorDriver,
}

impl ContainerManager {
    pub fn new(driver: HypervisorDriver) -> Self {
        Self { driver }
    }

    /// Create a running container. The core always launches non-ephemeral so
    /// state survives an in-container `shutdown` — see the orchestrator's
    /// cleanup contract.
    pub fn launch(&self, name: &str, image: &str) -> Result<(), HypervisorError> {
        info!(name, image, "launching container");
        self.driver
            .exec_silent(&["launch", image, name])
    }

    /// Create a stopped container — used when devices/ACLs must be attached
    /// before the first start.
    pub fn init(&self, name: &str, image: &str) -> Result<(), HypervisorError> {
        info!(name, image, "initializing container (stopped)");
        self.driver.exec_silent(&["init", image, name])
    }

    pub fn start(&self, name: &str) -> Result<(), HypervisorError> {
        info!(name, "starting container");
        self.driver.exec_silent(&["start", name])
    }

    pub fn stop(&self, name: &str, force: bool) -> Result<(), HypervisorError> {
        info!(name, force, "stopping container");
        if force {
            self.driver.exec_silent(&["stop", name, "--force"])
        } else {
            self.driver.exec_silent(&["stop", name])
        }
    }

    pub fn delete(&self, name: &str, force: bool) -> Result<(), HypervisorError> {
        info!(name, force, "deleting container");
        if force {
            self.driver.exec_silent(&["delete", name, "--force"])
        } else {
            self.driver.exec_silent(&["delete", name])
        }
    }

    pub fn exists(&self, name: &str) -> Result<bool, HypervisorError> {
        match self.driver.exec_capture(&["info", name]) {
            Ok(_) => Ok(true),
            Err(HypervisorError::Exit(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn running(&self, name: &str) -> Result<bool, HypervisorError> {
        Ok(self.status(name)?.is_some_and(|s| s.eq_ignore_ascii_case("running")))
    }

    fn status(&self, name: &str) -> Result<Option<String>, HypervisorError> {
        for container in self.list(None)? {
            if container.name == name {
                return Ok(container.status);
            }
        }
        Ok(None)
    }

    /// Add a bind-mount device. `shift=true` requests kernel UID mapping; if
    /// the hypervisor can't do that (e.g. under CI) the caller should retry
    /// with `shift=false` after setting a `raw.idmap` property instead.
    pub fn mount_disk(
        &self,
        name: &str,
        device: &str,
        host_path: &str,
        container_path: &str,
        shift: bool,
    ) -> Result<(), HypervisorError> {
        debug!(name, device, host_path, container_path, shift, "attaching mount device");
        let mut args = vec![
            "config",
            "device",
            "add",
            name,
            device,
            "disk",
            "source=",
        ];
        let source_arg = format!("source={}", host_path);
        let path_arg = format!("path={}", container_path);
        args[6] = &source_arg;
        args.push(&path_arg);
        if shift {
            args.push("shift=true");
        }
        self.driver.exec_silent(&args)
    }

    pub fn set_idmap(&self, name: &str, idmap: &str) -> Result<(), HypervisorError> {
        self.driver
            .exec_silent(&["config", "set", name, "raw.idmap", idmap])
    }

    /// Build argv for `exec` from the in-container command and options,
    /// without actually running it — so callers can choose exec_silent /
    /// exec_capture / exec_interactive depending on whether they need
    /// output or a PTY.
    fn exec_argv<'a>(&self, name: &'a str, opts: &'a ExecOpts, owned_env_flags: &'a mut Vec<String>) -> Vec<&'a str> {
        let mut args = vec!["exec", name];
        if let Some(cwd) = &opts.cwd {
            args.push("--cwd");
            args.push(cwd);
        }
        if let Some(uid) = opts.user {
            owned_env_flags.push(format!("--user={}", uid));
        }
        if let Some(gid) = opts.group {
            owned_env_flags.push(format!("--group={}", gid));
        }
        for (k, v) in &opts.env {
            owned_env_flags.push(format!("--env={}={}", k, v));
        }
        for flag in owned_env_flags.iter() {
            args.push(flag);
        }
        args.push("--");
        args
    }

    pub fn exec_args(&self, name: &str, argv: &[&str], opts: &ExecOpts) -> Result<(), HypervisorError> {
        let mut owned = Vec::new();
        let mut args = self.exec_argv(name, opts, &mut owned);
        args.extend_from_slice(argv);
        if opts.interactive {
            self.driver.exec_interactive(&args)
        } else {
            self.driver.exec_silent(&args)
        }
    }

    pub fn exec_args_capture(&self, name: &str, argv: &[&str], opts: &ExecOpts) -> Result<String, HypervisorError> {
        let mut owned = Vec::new();
        let mut args = self.exec_argv(name, opts, &mut owned);
        args.extend_from_slice(argv);
        self.driver.exec_capture(&args)
    }

    pub fn exec_command(&self, name: &str, command: &str, opts: &ExecOpts) -> Result<(), HypervisorError> {
        self.exec_args(name, &["bash", "-c", command], opts)
    }

    /// Same as `exec_command`, but keeps the child's stderr text alongside
    /// the result for callers that need to classify a failure by message.
    pub fn exec_command_checked(&self, name: &str, command: &str, opts: &ExecOpts) -> (Result<(), HypervisorError>, String) {
        let mut owned = Vec::new();
        let mut args = self.exec_argv(name, opts, &mut owned);
        args.extend_from_slice(&["bash", "-c", command]);
        self.driver.exec_silent_capturing_stderr(&args)
    }

    pub fn exec_command_capture(&self, name: &str, command: &str) -> Result<String, HypervisorError> {
        self.exec_args_capture(name, &["bash", "-c", command], &ExecOpts::default())
    }

    /// Run an in-container argv, feeding `stdin_payload` to it and capturing
    /// stdout. Used for the sandbox-settings JSON merge helper so the
    /// payload never touches a shell command line.
    pub fn exec_args_capture_with_stdin(
        &self,
        name: &str,
        argv: &[&str],
        opts: &ExecOpts,
        stdin_payload: &[u8],
    ) -> Result<String, HypervisorError> {
        let mut owned = Vec::new();
        let mut args = self.exec_argv(name, opts, &mut owned);
        args.extend_from_slice(argv);
        self.driver.exec_capture_with_stdin(&args, stdin_payload)
    }

    pub fn push_file(&self, name: &str, host_path: &Path, container_path: &str) -> Result<(), HypervisorError> {
        let target = format!("{}{}", name, container_path);
        self.driver
            .exec_silent(&["file", "push", &host_path.to_string_lossy(), &target])
    }

    pub fn push_directory(&self, name: &str, host_dir: &Path, container_dir: &str) -> Result<(), HypervisorError> {
        let target = format!("{}{}", name, container_dir);
        self.driver.exec_silent(&[
            "file",
            "push",
            "--recursive",
            &host_dir.to_string_lossy(),
            &target,
        ])
    }

    /// Pull `container_dir` so that it materializes at exactly `local_path`
    /// (not as a subdirectory of it). The hypervisor's `file pull
    /// --recursive` places the remote directory *inside* the destination,
    /// so we pull into a scratch directory and rename the single resulting
    /// entry into place.
    pub fn pull_directory(&self, name: &str, container_dir: &str, local_path: &Path) -> Result<(), HypervisorError> {
        let scratch = tempfile::tempdir()?;
        let source = format!("{}{}", name, container_dir);
        self.driver.exec_silent(&[
            "file",
            "pull",
            "--recursive",
            &source,
            &scratch.path().to_string_lossy(),
        ])?;

        let remote_basename = container_dir
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or("");
        let pulled = scratch.path().join(remote_basename);

        if local_path.exists() {
            std::fs::remove_dir_all(local_path)?;
        }
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&pulled, local_path)?;
        Ok(())
    }

    pub fn chown(&self, name: &str, path: &str, uid: u32, gid: u32) -> Result<(), HypervisorError> {
        self.exec_args(
            name,
            &["chown", "-R", &format!("{}:{}", uid, gid), path],
            &ExecOpts::user(0),
        )
    }

    pub fn file_exists(&self, name: &str, path: &str) -> Result<bool, HypervisorError> {
        let test = format!("test -e {}", shell_escape::escape(path.into()));
        match self.exec_command(name, &test, &ExecOpts::default()) {
            Ok(()) => Ok(true),
            Err(HypervisorError::Exit(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn dir_exists(&self, name: &str, path: &str) -> Result<bool, HypervisorError> {
        let test = format!("test -d {}", shell_escape::escape(path.into()));
        match self.exec_command(name, &test, &ExecOpts::default()) {
            Ok(()) => Ok(true),
            Err(HypervisorError::Exit(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// List all known containers (optionally filtered to a name prefix),
    /// preferring structured JSON; if the hypervisor's output can't be
    /// parsed as JSON, fall back to a line-oriented regex scan so a single
    /// malformed entry can't stall slot allocation.
    pub fn list(&self, name_prefix: Option<&str>) -> Result<Vec<ContainerSummary>, HypervisorError> {
        let raw = self.driver.exec_capture(&["list", "--format", "json"])?;
        let containers = match serde_json::from_str::<Vec<RawContainer>>(&raw) {
            Ok(parsed) => parsed
                .into_iter()
                .map(|r| ContainerSummary {
                    name: r.name,
                    status: r.status,
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "failed to parse hypervisor list JSON, falling back to regex scan");
                regex_fallback_list(&raw)
            }
        };

        Ok(match name_prefix {
            Some(prefix) => containers
                .into_iter()
                .filter(|c| c.name.starts_with(prefix))
                .collect(),
            None => containers,
        })
    }

    pub fn running_names(&self, name_prefix: Option<&str>) -> Result<Vec<String>, HypervisorError> {
        Ok(self
            .list(name_prefix)?
            .into_iter()
            .filter(|c| c.status.as_deref().is_some_and(|s| s.eq_ignore_ascii_case("running")))
            .map(|c| c.name)
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub name: String,
    pub status: Option<String>,
}

fn regex_fallback_list(raw: &str) -> Vec<ContainerSummary> {
    let name_re = regex::Regex::new(r#""name"\s*:\s*"([^"]+)""#).unwrap();
    let status_re = regex::Regex::new(r#""status"\s*:\s*"([^"]+)""#).unwrap();
    // Best-effort: scan line by line, pairing a name with the next status
    // seen. This will not perfectly reconstruct deeply nested JSON, but it
    // keeps allocation from stalling entirely on a parse error.
    let mut out = Vec::new();
    let mut pending_name: Option<String> = None;
    for line in raw.lines() {
        if let Some(c) = name_re.captures(line) {
            if let Some(name) = pending_name.take() {
                out.push(ContainerSummary { name, status: None });
            }
            pending_name = Some(c[1].to_string());
        }
        if let Some(c) = status_re.captures(line) {
            if let Some(name) = pending_name.take() {
                out.push(ContainerSummary {
                    name,
                    status: Some(c[1].to_string()),
                });
            }
        }
    }
    if let Some(name) = pending_name {
        out.push(ContainerSummary { name, status: None });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regex_fallback_extracts_name_status_pairs() {
        let raw = r#"[{"name": "coi-deadbeef-1", "status": "Running"}, {"name": "coi-deadbeef-2", "status": "Stopped"}]"#;
        let parsed = regex_fallback_list(raw);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "coi-deadbeef-1");
        assert_eq!(parsed[0].status.as_deref(), Some("Running"));
    }

    #[test]
    fn regex_fallback_survives_malformed_entries() {
        let raw = "garbage\n\"name\": \"coi-deadbeef-1\"\nmore garbage";
        let parsed = regex_fallback_list(raw);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "coi-deadbeef-1");
    }
}
