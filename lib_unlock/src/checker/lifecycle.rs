//! # Engine Lifecycle
//!
//! Owns the routing-engine subprocess (the control session) and talks to its
//! control-plane API: health checks, selector discovery and route switching.
//!
//! Start and restart failures are fatal for the current run. Switch and
//! query failures only concern the endpoint at hand.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::error::{LifecycleError, SwitchError};
use crate::configs::app_config::EngineConfig;
use crate::retrieve::ky_http::ApiClient;

const RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Operations the pipeline needs from the routing engine.
#[async_trait]
pub trait EngineControl: Send + Sync {
    /// Idempotent: succeeds without spawning when the control plane is
    /// already healthy.
    async fn start(&self, config_path: &Path) -> Result<(), LifecycleError>;

    /// [`EngineControl::ensure_stopped`] followed by [`EngineControl::start`].
    async fn restart(&self, config_path: &Path) -> Result<(), LifecycleError>;

    /// Idempotent: graceful signal, bounded wait, forced kill, then a sweep
    /// of same-named orphan processes.
    async fn ensure_stopped(&self);

    async fn is_healthy(&self) -> bool;

    /// Selects `endpoint` in the selector group. Returns once the control
    /// plane acknowledged; settling is up to the caller.
    async fn switch_route(&self, endpoint: &str) -> Result<(), SwitchError>;

    /// Active selection of the selector group, `None` when unresolved.
    async fn current_route(&self) -> Option<String>;
}

/// Bounded ring of the most recent output lines of the engine.
#[derive(Debug, Clone)]
struct OutputTail {
    lines: Arc<StdMutex<VecDeque<String>>>,
    capacity: usize,
}

impl OutputTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(StdMutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if let Ok(mut lines) = self.lines.lock() {
            while lines.len() >= self.capacity {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn clear(&self) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.clear();
        }
    }
}

/// Forwards each line of `reader` to the log and the tail.
fn forward_output<R>(reader: R, stream: &'static str, tail: OutputTail)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "engine", stream, "{}", line);
            tail.push(line);
        }
    });
}

#[derive(Debug, Deserialize)]
struct ProxiesListing {
    #[serde(default)]
    proxies: Map<String, Value>,
}

/// Picks the selector group: `preferred` when the engine knows it, otherwise
/// the first group of type `Selector`.
///
/// The listing is a JSON object, so "first" follows the key order of the
/// parsed map.
fn pick_selector(proxies: &Map<String, Value>, preferred: &str) -> Option<String> {
    if !preferred.is_empty() && proxies.contains_key(preferred) {
        return Some(preferred.to_string());
    }
    proxies
        .iter()
        .find(|(_, entry)| entry.get("type").and_then(Value::as_str) == Some("Selector"))
        .map(|(name, _)| name.clone())
}

/// # Engine Manager
///
#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        warn!("Could not send SIGTERM to engine (pid {}): {}", pid, e);
    }
}

/// No graceful signal off unix; the bounded wait ends in a kill.
#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

/// Process-wide owner of the engine subprocess. At most one child is managed
/// at a time.
#[derive(Debug)]
pub struct EngineManager {
    config: EngineConfig,
    api: ApiClient,
    child: Mutex<Option<Child>>,
    tail: OutputTail,
    selector: Mutex<Option<String>>,
}

impl EngineManager {
    /// Builds the manager and its control-plane client. Nothing is spawned.
    pub fn new(config: EngineConfig) -> Result<Self, LifecycleError> {
        let api = ApiClient::new(
            &config.api_url,
            config.secret().map(str::to_string),
            config.api_timeout(),
        )?;
        Ok(Self {
            tail: OutputTail::new(config.output_tail_lines),
            config,
            api,
            child: Mutex::new(None),
            selector: Mutex::new(None),
        })
    }

    /// Most recent output lines of the engine process.
    pub fn output_tail(&self) -> Vec<String> {
        self.tail.snapshot()
    }

    /// PID of the managed child, if one is running.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }

    fn start_failed(&self, reason: impl Into<String>) -> LifecycleError {
        LifecycleError::StartFailed {
            reason: reason.into(),
            output_tail: self.tail.snapshot(),
        }
    }

    async fn spawn(&self, config_path: &Path) -> Result<(), LifecycleError> {
        let binary = &self.config.binary_path;
        let mut child = Command::new(binary)
            .arg("-f")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LifecycleError::SpawnFailed {
                binary: binary.clone(),
                source: e,
            })?;

        self.tail.clear();
        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout", self.tail.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr", self.tail.clone());
        }

        info!(
            "Engine started: {} -f {} (pid {:?})",
            binary.display(),
            config_path.display(),
            child.id()
        );
        *self.child.lock().await = Some(child);
        Ok(())
    }

    /// Reports the exit status if the child already died.
    async fn exited_early(&self) -> Option<String> {
        let mut guard = self.child.lock().await;
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                *guard = None;
                Some(format!("engine exited during startup with {}", status))
            }
            Ok(None) => None,
            Err(e) => Some(format!("could not query engine process: {}", e)),
        }
    }

    async fn wait_healthy(&self) -> Result<(), LifecycleError> {
        for attempt in 1..=self.config.health_attempts {
            if self.is_healthy().await {
                info!("Engine control plane healthy (attempt {})", attempt);
                return Ok(());
            }
            if let Some(reason) = self.exited_early().await {
                return Err(self.start_failed(reason));
            }
            debug!(
                "Health check {}/{} failed",
                attempt, self.config.health_attempts
            );
            sleep(self.config.health_interval()).await;
        }
        Err(self.start_failed(format!(
            "control plane did not answer after {} health checks",
            self.config.health_attempts
        )))
    }

    /// Graceful stop of one child with escalation.
    async fn terminate(&self, mut child: Child) {
        let pid = child.id();

        if let Some(pid) = pid {
            send_sigterm(pid);
        }

        match timeout(self.config.stop_timeout(), child.wait()).await {
            Ok(Ok(status)) => info!("Engine (pid {:?}) stopped with {}", pid, status),
            Ok(Err(e)) => warn!("Waiting for engine (pid {:?}) failed: {}", pid, e),
            Err(_) => {
                warn!(
                    "Engine (pid {:?}) ignored SIGTERM for {:?}, killing",
                    pid,
                    self.config.stop_timeout()
                );
                if let Err(e) = child.kill().await {
                    error!("Failed to kill engine (pid {:?}): {}", pid, e);
                }
            }
        }
    }

    /// Kills leftover processes started from the engine's executable path.
    ///
    /// Matches on the full command line, so long binary names that the
    /// kernel truncates in the process name are still found.
    async fn sweep_orphans(&self) {
        if !cfg!(unix) {
            debug!("Orphan sweep is only supported on unix");
            return;
        }
        let pattern = self.orphan_pattern();
        match Command::new("pkill").arg("-f").arg(&pattern).status().await {
            Ok(status) if status.success() => info!("Swept orphan engine processes ({})", pattern),
            Ok(_) => debug!("No orphan engine processes"),
            Err(e) => debug!("pkill unavailable, orphan sweep skipped: {}", e),
        }
    }

    /// Command-line pattern of processes spawned from `binary_path`: the
    /// path as a whole word, also behind an interpreter such as `/bin/sh`.
    fn orphan_pattern(&self) -> String {
        let binary = self.config.binary_path.to_string_lossy();
        format!("(^| ){}( |$)", regex::escape(&binary))
    }

    /// Waits until nothing answers on the control plane any more.
    ///
    /// A swept orphan may keep serving for a moment while it shuts down.
    /// Returns `false` when it still answers after the stop timeout.
    async fn wait_control_plane_released(&self) -> bool {
        let deadline = Instant::now() + self.config.stop_timeout();
        loop {
            if !self.is_healthy().await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            debug!("Control plane still answering after stop, waiting");
            sleep(RELEASE_POLL_INTERVAL).await;
        }
    }

    /// Spawns a fresh child and waits for its control plane.
    async fn launch(&self, config_path: &Path) -> Result<(), LifecycleError> {
        if !config_path.exists() {
            return Err(LifecycleError::ConfigMissing(config_path.to_path_buf()));
        }

        self.spawn(config_path).await?;
        sleep(self.config.startup_settle()).await;

        if let Some(reason) = self.exited_early().await {
            let err = self.start_failed(reason);
            error!("{}", err);
            return Err(err);
        }

        if let Err(err) = self.wait_healthy().await {
            error!("{}", err);
            if let LifecycleError::StartFailed { output_tail, .. } = &err {
                for line in output_tail {
                    error!(target: "engine", "{}", line);
                }
            }
            self.ensure_stopped().await;
            return Err(err);
        }
        Ok(())
    }

    async fn resolve_selector(&self) -> Result<String, SwitchError> {
        let mut cached = self.selector.lock().await;
        if let Some(group) = cached.as_ref() {
            return Ok(group.clone());
        }

        let response = self.api.get::<ProxiesListing>(&["proxies"]).await?;
        if !response.success {
            warn!("Listing route groups failed: HTTP {}", response.status);
            return Err(SwitchError::NoSelector);
        }
        let listing = response.data.ok_or(SwitchError::NoSelector)?;
        let group = pick_selector(&listing.proxies, &self.config.selector_group)
            .ok_or(SwitchError::NoSelector)?;

        if group != self.config.selector_group {
            info!(
                "Selector group '{}' not found, using '{}'",
                self.config.selector_group, group
            );
        }
        *cached = Some(group.clone());
        Ok(group)
    }
}

#[async_trait]
impl EngineControl for EngineManager {
    async fn start(&self, config_path: &Path) -> Result<(), LifecycleError> {
        if self.is_healthy().await {
            info!("Engine control plane already healthy, not spawning");
            return Ok(());
        }
        self.launch(config_path).await
    }

    async fn restart(&self, config_path: &Path) -> Result<(), LifecycleError> {
        info!("Restarting engine with {}", config_path.display());
        self.ensure_stopped().await;
        if !self.wait_control_plane_released().await {
            let err = self.start_failed(format!(
                "control plane at {} still answers {:?} after stopping the engine",
                self.config.api_url,
                self.config.stop_timeout()
            ));
            error!("{}", err);
            return Err(err);
        }
        self.launch(config_path).await
    }

    async fn ensure_stopped(&self) {
        let child = self.child.lock().await.take();
        if let Some(child) = child {
            self.terminate(child).await;
        }
        self.sweep_orphans().await;
        *self.selector.lock().await = None;
    }

    async fn is_healthy(&self) -> bool {
        match self.api.get::<Value>(&["version"]).await {
            Ok(response) if response.success => true,
            Ok(response) => {
                debug!("Health check answered HTTP {}", response.status);
                false
            }
            Err(e) => {
                debug!("Health check failed: {}", e);
                false
            }
        }
    }

    async fn switch_route(&self, endpoint: &str) -> Result<(), SwitchError> {
        let group = self.resolve_selector().await?;
        let body = json!({ "name": endpoint });
        let response = self
            .api
            .request::<Value, Value>(Method::PUT, &["proxies", &group], None, Some(&body))
            .await?;

        if response.success {
            debug!("Selected '{}' in '{}'", endpoint, group);
            Ok(())
        } else {
            Err(SwitchError::Rejected {
                endpoint: endpoint.to_string(),
                group,
                status: response.status,
            })
        }
    }

    async fn current_route(&self) -> Option<String> {
        let group = self.resolve_selector().await.ok()?;
        match self.api.get::<Value>(&["proxies", &group]).await {
            Ok(response) => response
                .data
                .as_ref()
                .and_then(|v| v.get("now"))
                .and_then(Value::as_str)
                .map(str::to_string),
            Err(e) => {
                debug!("Querying '{}' failed: {}", group, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn output_tail_is_bounded() {
        let tail = OutputTail::new(3);
        for i in 0..5 {
            tail.push(format!("line {}", i));
        }
        assert_eq!(tail.snapshot(), vec!["line 2", "line 3", "line 4"]);
        tail.clear();
        assert!(tail.snapshot().is_empty());

        let none = OutputTail::new(0);
        none.push("dropped".to_string());
        assert!(none.snapshot().is_empty());
    }

    #[test]
    fn preferred_selector_wins() {
        let listing: Map<String, Value> = serde_json::from_value(json!({
            "Auto": { "type": "URLTest" },
            "GLOBAL": { "type": "Selector", "now": "DIRECT" },
            "Manual": { "type": "Selector" }
        }))
        .unwrap();
        assert_eq!(pick_selector(&listing, "GLOBAL"), Some("GLOBAL".to_string()));
    }

    #[test]
    fn falls_back_to_first_selector() {
        let listing: Map<String, Value> = serde_json::from_value(json!({
            "Auto": { "type": "URLTest" },
            "Manual": { "type": "Selector" },
            "a1": { "type": "Shadowsocks" }
        }))
        .unwrap();
        assert_eq!(pick_selector(&listing, "GLOBAL"), Some("Manual".to_string()));
        assert_eq!(pick_selector(&Map::new(), "GLOBAL"), None);
    }

    #[test]
    fn orphan_pattern_anchors_full_path() {
        let mut config = EngineConfig::default();
        config.binary_path = PathBuf::from("/opt/engine/mihomo-linux-amd64.v1");
        let manager = EngineManager::new(config).unwrap();
        let pattern = regex::Regex::new(&manager.orphan_pattern()).unwrap();
        assert!(pattern.is_match("/opt/engine/mihomo-linux-amd64.v1 -f /etc/engine.yaml"));
        assert!(pattern.is_match("/bin/sh /opt/engine/mihomo-linux-amd64.v1"));
        assert!(!pattern.is_match("/opt/engine/mihomo-linux-amd64xv1 -f x"));
        assert!(!pattern.is_match("cp /opt/engine/mihomo-linux-amd64.v1.bak /tmp"));
    }
}
