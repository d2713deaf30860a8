//! Session lifecycle orchestration: the resume protocol.
//!
//! Everything here is driven by the container-state x persistent decision
//! table in the design notes. The table itself is a pure function
//! (`decide_action`) so its branches are unit-testable without a hypervisor;
//! everything that actually touches the container lives in `start`/`stop`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};

use crate::container::{ContainerManager, ExecOpts};
use crate::hypervisor::HypervisorDriver;
use crate::naming;
use crate::network::{NetworkConfig, NetworkManager};
use crate::runner::InteractiveRunner;
use crate::session_store::{generate_session_id, SessionMetadata, SessionStore};
use crate::tool::sandbox_merge::{merge_json, MergeRequest};
use crate::tool::Tool;

const READINESS_POLL_ATTEMPTS: u32 = 30;
const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(1);
const POST_STOP_SETTLE_ATTEMPTS: u32 = 5;
const POST_STOP_SETTLE_INTERVAL: Duration = Duration::from_secs(1);
const MERGE_HELPER_CONTAINER_PATH: &str = "/usr/local/bin/coi-sandbox-merge";

/// `raw.idmap` value applied when the hypervisor can't do a kernel
/// UID-shifted bind mount: maps the whole host-uid range onto the
/// container's root-uid range so a workspace owned by the invoking host
/// user stays writable from inside the container.
const HOST_WORKSPACE_IDMAP: &str = "both 0 1000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerState {
    Absent,
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    CreateConfigureStart,
    Reuse,
    StartExisting,
    RecreateFresh,
}

/// The container-state x persistent decision table. `running && !persistent`
/// never reaches a caller of `decide_action` through normal operation — a
/// non-persistent session's container is always torn down on exit — so if we
/// observe it here it means the slot allocator handed out a slot that was
/// already running, which is always its own bug, not a transient race.
fn decide_action(state: ContainerState, persistent: bool) -> Result<Action, String> {
    match (state, persistent) {
        (ContainerState::Absent, _) => Ok(Action::CreateConfigureStart),
        (ContainerState::Running, true) => Ok(Action::Reuse),
        (ContainerState::Running, false) => {
            Err("bug in slot allocation: container is already running for a non-persistent slot".to_string())
        }
        (ContainerState::Stopped, true) => Ok(Action::StartExisting),
        (ContainerState::Stopped, false) => Ok(Action::RecreateFresh),
    }
}

pub struct StartRequest {
    pub workspace: PathBuf,
    pub image: String,
    pub persistent: bool,
    pub network: NetworkConfig,
    pub requested_slot: Option<u32>,
}

pub struct SessionHandle {
    pub session_id: String,
    pub container_name: String,
    pub persistent: bool,
    pub argv: Vec<String>,
}

pub struct SessionOrchestrator {
    tool: Box<dyn Tool>,
    driver: HypervisorDriver,
    containers: ContainerManager,
    store: SessionStore,
    base_dir: PathBuf,
    max_slots: u32,
}

impl SessionOrchestrator {
    pub fn new(tool: Box<dyn Tool>, driver: HypervisorDriver, base_dir: PathBuf, max_slots: u32) -> Self {
        let containers = ContainerManager::new(driver.clone());
        let store = SessionStore::new(&base_dir, &tool.sessions_dir_name());
        Self {
            tool,
            driver,
            containers,
            store,
            base_dir,
            max_slots,
        }
    }

    fn host_config_dir(&self) -> Option<PathBuf> {
        let name = self.tool.config_dir_name();
        if name.is_empty() {
            return None;
        }
        directories::BaseDirs::new().map(|d| d.home_dir().join(name))
    }

    async fn container_state(&self, name: &str) -> Result<ContainerState> {
        if !self.containers.exists(name)? {
            return Ok(ContainerState::Absent);
        }
        if self.containers.running(name)? {
            Ok(ContainerState::Running)
        } else {
            Ok(ContainerState::Stopped)
        }
    }

    /// Bind-mount the workspace at `/workspace`, preferring a kernel
    /// UID-shifted mount and falling back to an explicit `raw.idmap` when the
    /// hypervisor can't shift (e.g. no shiftfs/idmapped-mounts support).
    fn mount_workspace(&self, container_name: &str, workspace: &Path) -> Result<()> {
        let host_path = workspace.to_string_lossy();
        if self
            .containers
            .mount_disk(container_name, "workspace", &host_path, "/workspace", true)
            .is_err()
        {
            warn!(container = container_name, "kernel UID-shifted mount failed, falling back to raw.idmap");
            self.containers.set_idmap(container_name, HOST_WORKSPACE_IDMAP)?;
            self.containers
                .mount_disk(container_name, "workspace", &host_path, "/workspace", false)?;
        }
        Ok(())
    }

    pub async fn start(&self, req: StartRequest) -> Result<(SessionHandle, NetworkManager)> {
        let running = self.containers.running_names(Some(&naming::container_prefix()))?;
        let slot = match req.requested_slot {
            Some(s) if naming::is_slot_available(&req.workspace, &running, s) => s,
            Some(s) => naming::allocate_slot_from(&req.workspace, &running, s + 1, self.max_slots)?,
            None => naming::allocate_slot(&req.workspace, &running, self.max_slots)?,
        };
        let container_name = naming::container_name(&req.workspace, slot);

        let state = self.container_state(&container_name).await?;
        let action = decide_action(state, req.persistent).map_err(|e| anyhow!(e))?;

        let mut network = NetworkManager::new(container_name.clone(), self.driver.clone(), self.base_dir.clone(), req.network);

        let (session_id, resuming) = match self.store.latest_session_for_workspace(&req.workspace) {
            Some(existing) if req.persistent || action != Action::CreateConfigureStart => (existing, true),
            _ => (generate_session_id(), false),
        };

        match action {
            Action::CreateConfigureStart => {
                self.containers.init(&container_name, &req.image)?;
                self.mount_workspace(&container_name, &req.workspace)?;
                network.setup().await?;
                self.containers.start(&container_name)?;
                self.wait_ready(&container_name).await?;
                self.first_launch_configure(&container_name).await?;
            }
            Action::Reuse => {
                info!(container = %container_name, "reusing running persistent container");
                self.push_fresh_credentials(&container_name).await?;
            }
            Action::StartExisting => {
                self.containers.start(&container_name)?;
                self.wait_ready(&container_name).await?;
                self.push_fresh_credentials(&container_name).await?;
            }
            Action::RecreateFresh => {
                self.containers.delete(&container_name, true)?;
                self.containers.init(&container_name, &req.image)?;
                self.mount_workspace(&container_name, &req.workspace)?;
                network.setup().await?;
                self.containers.start(&container_name)?;
                self.wait_ready(&container_name).await?;
                self.restore_ephemeral_session(&container_name, &session_id).await?;
            }
        }

        let metadata = SessionMetadata {
            session_id: session_id.clone(),
            container_name: container_name.clone(),
            persistent: req.persistent,
            workspace: req.workspace.clone(),
            saved_at: chrono::Utc::now(),
            tool_name: self.tool.name().to_string(),
        };
        self.store.write_metadata(&metadata)?;

        let internal_id = if resuming {
            self.discover_internal_session_id(&container_name)
        } else {
            None
        };
        let argv = self.tool.build_command(&session_id, resuming, internal_id.as_deref());
        info!(container = %container_name, argv = ?argv, "agent command ready");

        Ok((
            SessionHandle {
                session_id,
                container_name,
                persistent: req.persistent,
                argv,
            },
            network,
        ))
    }

    async fn wait_ready(&self, container_name: &str) -> Result<()> {
        for _ in 0..READINESS_POLL_ATTEMPTS {
            if let Ok(out) = self
                .containers
                .exec_args_capture(container_name, &["echo", "ready"], &ExecOpts::default())
            {
                if out.trim() == "ready" {
                    return Ok(());
                }
            }
            tokio::time::sleep(READINESS_POLL_INTERVAL).await;
        }
        Err(anyhow!("container {container_name} did not become ready within {READINESS_POLL_ATTEMPTS}s"))
    }

    fn discover_internal_session_id(&self, container_name: &str) -> Option<String> {
        let config_dir_name = self.tool.config_dir_name();
        if config_dir_name.is_empty() {
            return None;
        }
        let scratch = tempfile::tempdir().ok()?;
        let local_copy = scratch.path().join(config_dir_name);
        let container_path = format!("/root/{}", config_dir_name);
        self.containers
            .pull_directory(container_name, &container_path, &local_copy)
            .ok()?;
        self.tool.discover_session_id(&local_copy)
    }

    async fn first_launch_configure(&self, container_name: &str) -> Result<()> {
        let config_dir_name = self.tool.config_dir_name();
        if config_dir_name.is_empty() {
            return Ok(());
        }

        let scratch = tempfile::tempdir()?;
        let staged = scratch.path().join(config_dir_name);
        std::fs::create_dir_all(&staged)?;

        if let Some(host_dir) = self.host_config_dir() {
            for file in self.tool.first_launch_allowlist() {
                let src = host_dir.join(file);
                if src.is_file() {
                    std::fs::copy(&src, staged.join(file))
                        .with_context(|| format!("copying {} into staged config", file))?;
                }
            }
        }

        let container_path = format!("/root/{}", config_dir_name);
        self.containers.push_directory(container_name, &staged, "/root/")?;
        self.containers.chown(container_name, &container_path, 0, 0)?;

        self.merge_sandbox_settings_in_container(container_name, &container_path)?;
        Ok(())
    }

    /// Push the merge helper once, then run base-settings x sandbox-overlay
    /// through it over stdin — the payload never touches a shell command
    /// line, unlike a `python3 -c '<json>'` invocation.
    fn merge_sandbox_settings_in_container(&self, container_name: &str, container_config_path: &str) -> Result<()> {
        let overlay = self.tool.sandbox_settings();
        if overlay.is_empty() {
            return Ok(());
        }

        let helper = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|d| d.join("coi-sandbox-merge")));
        let Some(helper) = helper.filter(|p| p.is_file()) else {
            warn!(container = container_name, "sandbox-merge helper binary not found next to the running executable, falling back to host-side merge");
            return self.merge_sandbox_settings_on_host(container_name, container_config_path, overlay);
        };

        self.containers.push_file(container_name, &helper, MERGE_HELPER_CONTAINER_PATH)?;
        self.containers
            .exec_command(container_name, &format!("chmod +x {}", MERGE_HELPER_CONTAINER_PATH), &ExecOpts::user(0))?;

        let settings_path = format!("{}/{}", container_config_path, self.tool.state_file_name());
        let base = self
            .containers
            .exec_command_capture(container_name, &format!("cat {} 2>/dev/null || echo '{{}}'", settings_path))
            .unwrap_or_else(|_| "{}".to_string());
        let base: serde_json::Value = serde_json::from_str(base.trim()).unwrap_or_else(|_| serde_json::json!({}));

        let request = MergeRequest {
            base,
            overlay: serde_json::Value::Object(overlay.into_iter().collect()),
        };
        let payload = serde_json::to_vec(&request)?;

        let merged = self.containers.exec_args_capture_with_stdin(
            container_name,
            &[MERGE_HELPER_CONTAINER_PATH],
            &ExecOpts::default(),
            &payload,
        )?;

        self.write_string_into_container(container_name, &settings_path, &merged)?;
        self.containers.chown(container_name, container_config_path, 0, 0)?;
        Ok(())
    }

    fn merge_sandbox_settings_on_host(
        &self,
        container_name: &str,
        container_config_path: &str,
        overlay: std::collections::HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let settings_path = format!("{}/{}", container_config_path, self.tool.state_file_name());
        let base_raw = self
            .containers
            .exec_command_capture(container_name, &format!("cat {} 2>/dev/null || echo '{{}}'", settings_path))
            .unwrap_or_else(|_| "{}".to_string());
        let base: serde_json::Value = serde_json::from_str(base_raw.trim()).unwrap_or_else(|_| serde_json::json!({}));
        let overlay_value = serde_json::Value::Object(overlay.into_iter().collect());
        let merged = merge_json(base, overlay_value);
        self.write_string_into_container(container_name, &settings_path, &serde_json::to_string_pretty(&merged)?)?;
        Ok(())
    }

    fn write_string_into_container(&self, container_name: &str, container_path: &str, content: &str) -> Result<()> {
        let scratch = tempfile::tempdir()?;
        let local = scratch.path().join("merged.json");
        std::fs::write(&local, content)?;
        self.containers.push_file(container_name, &local, container_path)?;
        Ok(())
    }

    async fn push_fresh_credentials(&self, container_name: &str) -> Result<()> {
        let config_dir_name = self.tool.config_dir_name();
        if config_dir_name.is_empty() {
            return Ok(());
        }
        let Some(host_dir) = self.host_config_dir() else {
            return Ok(());
        };
        let creds = host_dir.join(self.tool.credentials_file_name());
        if !creds.is_file() {
            warn!(container = %container_name, "no host credentials file found to refresh");
            return Ok(());
        }
        let container_path = format!("/root/{}/{}", config_dir_name, self.tool.credentials_file_name());
        self.containers.push_file(container_name, &creds, &container_path)?;
        self.containers.chown(container_name, &container_path, 0, 0)?;
        Ok(())
    }

    /// Ephemeral resume: push the saved config directory (if one exists for
    /// this session), then refresh credentials on top so auth never goes
    /// stale between sessions.
    async fn restore_ephemeral_session(&self, container_name: &str, session_id: &str) -> Result<()> {
        let config_dir_name = self.tool.config_dir_name();
        if !config_dir_name.is_empty() && self.store.session_exists(session_id, config_dir_name) {
            let saved = self.store.config_dir_path(session_id, config_dir_name);
            let container_path = format!("/root/{}", config_dir_name);
            self.containers.push_directory(container_name, &saved, "/root/")?;
            self.containers.chown(container_name, &container_path, 0, 0)?;
        } else {
            self.first_launch_configure(container_name).await?;
        }
        self.push_fresh_credentials(container_name).await?;
        Ok(())
    }

    /// Save state and, for non-persistent sessions, tear the container down
    /// unless it's somehow still running (another process attached to it).
    pub async fn cleanup(&self, container_name: &str, session_id: &str, persistent: bool, network: &mut NetworkManager) -> Result<()> {
        let config_dir_name = self.tool.config_dir_name();
        if !config_dir_name.is_empty() {
            let container_path = format!("/root/{}", config_dir_name);
            let local = self.store.config_dir_path(session_id, config_dir_name);
            if let Err(e) = self.containers.pull_directory(container_name, &container_path, &local) {
                warn!(container = container_name, error = %e, "failed to pull config dir on cleanup");
            }
        }

        if let Ok(mut metadata) = self.store.load_metadata(session_id) {
            metadata.saved_at = chrono::Utc::now();
            let _ = self.store.write_metadata(&metadata);
        }

        if persistent {
            return Ok(());
        }

        for _ in 0..POST_STOP_SETTLE_ATTEMPTS {
            if !self.containers.running(container_name)? {
                break;
            }
            tokio::time::sleep(POST_STOP_SETTLE_INTERVAL).await;
        }

        if self.containers.running(container_name)? {
            info!(container = container_name, "still running after settle window, leaving in place");
            return Ok(());
        }

        network.teardown().await;
        self.containers.delete(container_name, true)?;
        Ok(())
    }

    /// Run the agent command built by `start` inside the multiplexer, then
    /// always run cleanup afterward — whether dispatch returned normally or
    /// we were interrupted by SIGINT/SIGTERM first. `network` must be the
    /// same instance `start` returned, so a live allowlist refresher gets
    /// torn down instead of silently leaked.
    pub async fn dispatch_and_cleanup(&self, handle: &SessionHandle, mut network: NetworkManager, interactive: bool, term: &str) -> Result<()> {
        let runner = InteractiveRunner::new(self.containers.clone(), handle.container_name.clone());
        let command = crate::runner::shell_join(&handle.argv);
        let term = term.to_string();

        let dispatch_result = tokio::select! {
            result = tokio::task::spawn_blocking(move || runner.dispatch(&command, interactive, &term)) => {
                result.context("dispatch task panicked")?.map_err(|e| anyhow!(e))
            }
            _ = wait_for_shutdown_signal() => {
                info!(container = %handle.container_name, "shutdown signal received, stopping dispatch");
                Ok(())
            }
        };

        if let Err(e) = self
            .cleanup(&handle.container_name, &handle.session_id, handle.persistent, &mut network)
            .await
        {
            warn!(container = %handle.container_name, error = %e, "cleanup after dispatch failed");
        }

        dispatch_result
    }
}

/// Wait for either SIGINT or (on Unix) SIGTERM, whichever comes first.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler, only SIGINT will trigger cleanup");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_always_creates_regardless_of_persistence() {
        assert_eq!(decide_action(ContainerState::Absent, true), Ok(Action::CreateConfigureStart));
        assert_eq!(decide_action(ContainerState::Absent, false), Ok(Action::CreateConfigureStart));
    }

    #[test]
    fn running_persistent_reuses() {
        assert_eq!(decide_action(ContainerState::Running, true), Ok(Action::Reuse));
    }

    #[test]
    fn running_non_persistent_is_an_allocator_bug() {
        let err = decide_action(ContainerState::Running, false).unwrap_err();
        assert!(err.contains("bug in slot allocation"));
    }

    #[test]
    fn stopped_persistent_restarts_in_place() {
        assert_eq!(decide_action(ContainerState::Stopped, true), Ok(Action::StartExisting));
    }

    #[test]
    fn stopped_non_persistent_recreates_fresh() {
        assert_eq!(decide_action(ContainerState::Stopped, false), Ok(Action::RecreateFresh));
    }
}
