//! Headless Chrome over the DevTools protocol
//!
//! Spawns Chromium as a subprocess with a throwaway profile directory,
//! reads the DevTools WebSocket URL from its stderr, and drives one
//! isolated page per session.
//!
//! The child is spawned with `kill_on_drop`, so a session that is dropped
//! without [`close`](BrowserSession::close) still takes its process down.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::cdp::{CdpConnection, CdpEvent};
use super::{BrowserLauncher, BrowserSession, NetworkObserver};
use crate::config::ResolverConfig;
use crate::fingerprint::{BrowserProfile, Viewport};

/// Binaries tried in order when no explicit path is configured.
const CANDIDATE_BINARIES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "headless_shell",
];

/// Serverless-friendly launch flags: no GPU, no sandbox, no shared memory,
/// nothing running in the background.
const LAUNCH_FLAGS: &[&str] = &[
    "--headless=new",
    "--disable-gpu",
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--no-zygote",
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-extensions",
    "--disable-background-networking",
    "--disable-background-timer-throttling",
    "--disable-sync",
    "--disable-translate",
    "--metrics-recording-only",
    "--mute-audio",
    "--hide-scrollbars",
    "--autoplay-policy=no-user-gesture-required",
    "--disable-features=IsolateOrigins,site-per-process",
    "--remote-debugging-port=0",
];

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_GRACE: Duration = Duration::from_secs(5);
/// Network counts as idle after this long with nothing in flight.
const IDLE_QUIET: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Child targets whose network traffic belongs to the page.
const NETWORK_TARGET_TYPES: &[&str] = &["iframe", "worker", "shared_worker", "service_worker"];

/// Finds the first element whose aria-label, title, class or id has a word
/// starting with "play" (not "playlist"), preferring real buttons, and
/// clicks it.
const PLAY_BUTTON_SCRIPT: &str = r#"(() => {
  const playWord = /\bplay(?!list)/i;
  const mentionsPlay = (el) => ['aria-label', 'title', 'class', 'id'].some((attr) => {
    const value = el.getAttribute(attr);
    return value !== null && playWord.test(value);
  });
  const pick = (selector) => Array.from(document.querySelectorAll(selector)).find(mentionsPlay);
  const target = pick('button, [role="button"]') || pick('*');
  if (!target) return false;
  target.click();
  return true;
})()"#;

/// Launches headless Chromium processes.
pub struct ChromeLauncher {
    config: ResolverConfig,
}

impl ChromeLauncher {
    #[must_use]
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Configured binary, or the first known name found on `PATH`.
    pub fn executable(&self) -> Result<PathBuf> {
        if let Some(path) = &self.config.chrome_path {
            return Ok(path.clone());
        }
        CANDIDATE_BINARIES
            .iter()
            .find_map(|name| which::which(name).ok())
            .ok_or_else(|| {
                anyhow!(
                    "No Chromium binary found on PATH (tried {}); set resolver.chrome_path",
                    CANDIDATE_BINARIES.join(", ")
                )
            })
    }

    /// Build browser command line arguments
    fn build_args(&self, profile: &BrowserProfile, user_data_dir: &Path) -> Vec<String> {
        let mut args: Vec<String> = LAUNCH_FLAGS.iter().map(ToString::to_string).collect();

        args.push(format!("--user-data-dir={}", user_data_dir.display()));
        args.push(format!(
            "--window-size={},{}",
            profile.viewport.width, profile.viewport.height
        ));
        args.push(format!("--user-agent={}", profile.user_agent));
        args.extend(self.config.extra_args.iter().cloned());
        args.push("about:blank".to_string());

        args
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, profile: &BrowserProfile) -> Result<Box<dyn BrowserSession>> {
        let executable = self.executable()?;
        let profile_dir = tempfile::Builder::new()
            .prefix("mediarelay-chrome-")
            .tempdir()
            .context("Failed to create browser profile directory")?;

        let args = self.build_args(profile, profile_dir.path());
        debug!("browser args: {:?}", args);

        let mut child = Command::new(&executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", executable.display()))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("Failed to capture browser stderr"))?;

        // Keep draining stderr for the life of the process, or Chrome blocks
        // once the pipe fills.
        let (ws_tx, ws_rx) = oneshot::channel();
        let stderr_task = tokio::spawn(drain_stderr(stderr, ws_tx));

        let ws_url = match tokio::time::timeout(self.config.launch_timeout(), ws_rx).await {
            Ok(Ok(url)) => url,
            Ok(Err(_)) => {
                let status = child.try_wait().ok().flatten();
                bail!("Browser exited before DevTools came up (status: {status:?})");
            }
            Err(_) => bail!(
                "Timeout ({:?}) waiting for DevTools endpoint",
                self.config.launch_timeout()
            ),
        };

        info!(pid = ?child.id(), executable = %executable.display(), "Browser launched");

        let cdp = Arc::new(CdpConnection::connect(&ws_url).await?);

        Ok(Box::new(ChromeSession {
            child: Some(child),
            cdp: Some(cdp),
            profile_dir: Some(profile_dir),
            stderr_task: Some(stderr_task),
            page_session: None,
            sessions: Arc::new(AttachedSessions::default()),
            activity: Arc::new(NetworkActivity::default()),
            user_agent: profile.user_agent.clone(),
            accept_language: profile.accept_language.clone(),
            viewport: profile.viewport,
            blocked_urls: self.config.blocked_url_patterns.clone(),
        }))
    }
}

/// `ws://` URL from Chrome's "DevTools listening on …" stderr line.
fn devtools_url(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix("DevTools listening on ")
        .filter(|url| url.starts_with("ws://"))
}

async fn drain_stderr(stderr: ChildStderr, ws_tx: oneshot::Sender<String>) {
    let mut lines = BufReader::new(stderr).lines();
    let mut ws_tx = Some(ws_tx);

    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(url) = devtools_url(&line) {
            if let Some(tx) = ws_tx.take() {
                let _ = tx.send(url.to_string());
            }
            continue;
        }
        trace!("chrome: {}", line);
    }
}

/// In-flight request bookkeeping for the network-idle wait.
#[derive(Debug)]
struct NetworkActivity {
    state: Mutex<ActivityState>,
}

#[derive(Debug)]
struct ActivityState {
    inflight: HashSet<String>,
    loaded: bool,
    last_change: Instant,
}

impl Default for NetworkActivity {
    fn default() -> Self {
        Self {
            state: Mutex::new(ActivityState {
                inflight: HashSet::new(),
                loaded: false,
                last_change: Instant::now(),
            }),
        }
    }
}

impl NetworkActivity {
    fn reset(&self) {
        let mut state = self.state.lock();
        state.inflight.clear();
        state.loaded = false;
        state.last_change = Instant::now();
    }

    fn started(&self, request_id: &str) {
        let mut state = self.state.lock();
        state.inflight.insert(request_id.to_string());
        state.last_change = Instant::now();
    }

    fn finished(&self, request_id: &str) {
        let mut state = self.state.lock();
        if state.inflight.remove(request_id) {
            state.last_change = Instant::now();
        }
    }

    /// Drop in-flight requests of a detached target.
    fn forget_session(&self, session_id: &str) {
        let prefix = format!("{session_id}/");
        let mut state = self.state.lock();
        let before = state.inflight.len();
        state.inflight.retain(|key| !key.starts_with(&prefix));
        if state.inflight.len() != before {
            state.last_change = Instant::now();
        }
    }

    fn loaded(&self) {
        let mut state = self.state.lock();
        state.loaded = true;
        state.last_change = Instant::now();
    }

    /// Load event seen and no request in flight for at least `quiet`.
    fn is_idle(&self, quiet: Duration) -> bool {
        let state = self.state.lock();
        state.loaded && state.inflight.is_empty() && state.last_change.elapsed() >= quiet
    }
}

/// Feed one page event to the observer and the idle tracker.
fn route_event(event: &CdpEvent, observer: &NetworkObserver, activity: &NetworkActivity) {
    let params = &event.params;
    // Request ids are only unique per target.
    let request_id = params.get("requestId").and_then(Value::as_str).map(|id| {
        format!("{}/{id}", event.session_id.as_deref().unwrap_or_default())
    });

    match event.method.as_str() {
        "Network.requestWillBeSent" => {
            let url = params
                .pointer("/request/url")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let resource_type = params
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("Other");
            observer.on_request(url, resource_type);
            if let Some(id) = &request_id {
                activity.started(id);
            }
        }
        "Network.responseReceived" => {
            let Some(response) = params.get("response") else {
                return;
            };
            let url = response
                .get("url")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let headers = response
                .get("headers")
                .and_then(Value::as_object)
                .map(|headers| {
                    headers
                        .iter()
                        .map(|(name, value)| {
                            let value = value
                                .as_str()
                                .map_or_else(|| value.to_string(), str::to_string);
                            (name.clone(), value)
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            observer.on_response(url, headers);
        }
        "Network.loadingFinished" | "Network.loadingFailed" => {
            if let Some(id) = &request_id {
                activity.finished(id);
            }
        }
        "Page.loadEventFired" => activity.loaded(),
        _ => {}
    }
}

/// Flattened sessions that make up the page: the page target itself plus
/// every frame and worker auto-attached below it.
#[derive(Debug, Default)]
struct AttachedSessions {
    ids: Mutex<HashSet<String>>,
}

impl AttachedSessions {
    fn insert(&self, session_id: &str) {
        self.ids.lock().insert(session_id.to_string());
    }

    fn contains(&self, session_id: Option<&str>) -> bool {
        session_id.is_some_and(|id| self.ids.lock().contains(id))
    }

    fn remove(&self, session_id: &str) -> bool {
        self.ids.lock().remove(session_id)
    }
}

/// A target auto-attached (paused) below one of the page's sessions.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChildTarget {
    session_id: String,
    target_info: ChildTargetInfo,
}

#[derive(Debug, Deserialize)]
struct ChildTargetInfo {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    url: String,
}

/// Page-level settings repeated on every child target.
#[derive(Debug, Clone)]
struct ChildSetup {
    user_agent: String,
    accept_language: String,
    blocked_urls: Vec<String>,
}

fn auto_attach_params() -> Value {
    json!({ "autoAttach": true, "waitForDebuggerOnStart": true, "flatten": true })
}

impl ChildSetup {
    /// Commands sent to a freshly attached child, in order. The last one
    /// always releases the paused target.
    fn commands(&self, kind: &str) -> Vec<(&'static str, Value)> {
        let mut commands = Vec::new();
        if NETWORK_TARGET_TYPES.contains(&kind) {
            commands.push(("Network.enable", json!({})));
            commands.push((
                "Network.setUserAgentOverride",
                json!({ "userAgent": self.user_agent, "acceptLanguage": self.accept_language }),
            ));
            if !self.blocked_urls.is_empty() {
                commands.push(("Network.setBlockedURLs", json!({ "urls": self.blocked_urls })));
            }
            if kind == "iframe" {
                commands.push(("Target.setAutoAttach", auto_attach_params()));
            }
        }
        commands.push(("Runtime.runIfWaitingForDebugger", json!({})));
        commands
    }
}

/// Handle one event on the page's connection.
///
/// Events from sessions outside the page are ignored. Attach and detach
/// notifications keep the session set current; a newly attached child is
/// returned so the caller can set it up.
fn handle_page_event(
    event: &CdpEvent,
    sessions: &AttachedSessions,
    observer: &NetworkObserver,
    activity: &NetworkActivity,
) -> Option<ChildTarget> {
    if !sessions.contains(event.session_id.as_deref()) {
        return None;
    }

    match event.method.as_str() {
        "Target.attachedToTarget" => {
            let child: ChildTarget = match serde_json::from_value(event.params.clone()) {
                Ok(child) => child,
                Err(e) => {
                    debug!("Unreadable attachedToTarget: {e}");
                    return None;
                }
            };
            debug!(
                session = %child.session_id,
                kind = %child.target_info.kind,
                url = %child.target_info.url,
                "Child target attached"
            );
            sessions.insert(&child.session_id);
            Some(child)
        }
        "Target.detachedFromTarget" => {
            if let Some(id) = event.params.get("sessionId").and_then(Value::as_str) {
                if sessions.remove(id) {
                    activity.forget_session(id);
                }
            }
            None
        }
        _ => {
            route_event(event, observer, activity);
            None
        }
    }
}

async fn prepare_child(cdp: Arc<CdpConnection>, setup: Arc<ChildSetup>, child: ChildTarget) {
    let sid = Some(child.session_id.as_str());
    for (method, params) in setup.commands(&child.target_info.kind) {
        // Targets can detach at any point; a failed step is not fatal.
        if let Err(e) = cdp.call(method, params, sid, COMMAND_TIMEOUT).await {
            debug!(session = %child.session_id, "{method} on child target: {e:#}");
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrowserContextCreated {
    browser_context_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetCreated {
    target_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachedToTarget {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Navigated {
    #[serde(default)]
    error_text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Evaluated {
    result: RemoteObject,
    #[serde(default)]
    exception_details: Option<Value>,
}

#[derive(Deserialize)]
struct RemoteObject {
    #[serde(default)]
    value: Option<Value>,
}

/// One running Chromium process with at most one open page.
pub struct ChromeSession {
    child: Option<Child>,
    cdp: Option<Arc<CdpConnection>>,
    profile_dir: Option<TempDir>,
    stderr_task: Option<JoinHandle<()>>,
    /// Flattened DevTools session id of the open page.
    page_session: Option<String>,
    sessions: Arc<AttachedSessions>,
    activity: Arc<NetworkActivity>,
    user_agent: String,
    accept_language: String,
    viewport: Viewport,
    blocked_urls: Vec<String>,
}

impl ChromeSession {
    fn cdp(&self) -> Result<&CdpConnection> {
        self.cdp
            .as_deref()
            .ok_or_else(|| anyhow!("Browser already closed"))
    }

    fn page(&self) -> Result<&str> {
        self.page_session
            .as_deref()
            .ok_or_else(|| anyhow!("No page open"))
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn open_page(&mut self, observer: NetworkObserver) -> Result<()> {
        let cdp = self.cdp()?;

        let context: BrowserContextCreated = cdp
            .call_typed(
                "Target.createBrowserContext",
                json!({ "disposeOnDetach": true }),
                None,
                COMMAND_TIMEOUT,
            )
            .await?;
        let target: TargetCreated = cdp
            .call_typed(
                "Target.createTarget",
                json!({ "url": "about:blank", "browserContextId": context.browser_context_id }),
                None,
                COMMAND_TIMEOUT,
            )
            .await?;
        let attached: AttachedToTarget = cdp
            .call_typed(
                "Target.attachToTarget",
                json!({ "targetId": target.target_id, "flatten": true }),
                None,
                COMMAND_TIMEOUT,
            )
            .await?;
        let session_id = attached.session_id;

        // Listeners go in before Network.enable so no event is missed. The
        // connection owns the handler, so the handler only holds it weakly.
        self.sessions.insert(&session_id);
        let sessions = self.sessions.clone();
        let activity = self.activity.clone();
        let connection = self
            .cdp
            .as_ref()
            .map(Arc::downgrade)
            .ok_or_else(|| anyhow!("Browser already closed"))?;
        let setup = Arc::new(ChildSetup {
            user_agent: self.user_agent.clone(),
            accept_language: self.accept_language.clone(),
            blocked_urls: self.blocked_urls.clone(),
        });
        cdp.subscribe(Arc::new(move |event: &CdpEvent| {
            let Some(child) = handle_page_event(event, &sessions, &observer, &activity) else {
                return;
            };
            if let Some(cdp) = connection.upgrade() {
                tokio::spawn(prepare_child(cdp, setup.clone(), child));
            }
        }));

        let sid = Some(session_id.as_str());
        cdp.call("Network.enable", json!({}), sid, COMMAND_TIMEOUT).await?;
        cdp.call("Page.enable", json!({}), sid, COMMAND_TIMEOUT).await?;
        cdp.call(
            "Network.setUserAgentOverride",
            json!({ "userAgent": self.user_agent, "acceptLanguage": self.accept_language }),
            sid,
            COMMAND_TIMEOUT,
        )
        .await?;
        cdp.call(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": self.viewport.width,
                "height": self.viewport.height,
                "deviceScaleFactor": 1,
                "mobile": false,
            }),
            sid,
            COMMAND_TIMEOUT,
        )
        .await?;
        if !self.blocked_urls.is_empty() {
            cdp.call(
                "Network.setBlockedURLs",
                json!({ "urls": self.blocked_urls }),
                sid,
                COMMAND_TIMEOUT,
            )
            .await?;
        }
        // Out-of-process frames and workers get their own sessions.
        cdp.call("Target.setAutoAttach", auto_attach_params(), sid, COMMAND_TIMEOUT)
            .await?;

        debug!(session = %session_id, "Page opened");
        self.page_session = Some(session_id);
        Ok(())
    }

    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()> {
        let cdp = self.cdp()?;
        let page = self.page()?;
        let deadline = Instant::now() + timeout;

        self.activity.reset();
        let navigated: Navigated = cdp
            .call_typed("Page.navigate", json!({ "url": url }), Some(page), timeout)
            .await?;
        if let Some(error) = navigated.error_text {
            bail!("Navigation to {url} failed: {error}");
        }

        while Instant::now() < deadline {
            if self.activity.is_idle(IDLE_QUIET) {
                debug!("Network idle");
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        Err(anyhow!("Timeout ({timeout:?}) waiting for network idle"))
    }

    async fn click_play(&mut self) -> Result<bool> {
        let cdp = self.cdp()?;
        let page = self.page()?;

        let evaluated: Evaluated = cdp
            .call_typed(
                "Runtime.evaluate",
                json!({
                    "expression": PLAY_BUTTON_SCRIPT,
                    "returnByValue": true,
                    "userGesture": true,
                }),
                Some(page),
                COMMAND_TIMEOUT,
            )
            .await?;

        if let Some(details) = evaluated.exception_details {
            bail!("Play button script threw: {details}");
        }
        Ok(evaluated
            .result
            .value
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    async fn close(&mut self) -> Result<()> {
        self.page_session = None;

        if let Some(cdp) = self.cdp.take() {
            // Chrome usually drops the socket before answering.
            if let Err(e) = cdp.call("Browser.close", json!({}), None, CLOSE_GRACE).await {
                debug!("Browser.close: {e:#}");
            }
            cdp.close().await;
        }

        let mut result = Ok(());
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "Browser exited"),
                Ok(Err(e)) => {
                    warn!("Failed to wait for browser: {e}");
                    result = child.kill().await.context("Failed to kill browser");
                }
                Err(_) => {
                    warn!("Browser did not exit within {CLOSE_GRACE:?}, killing");
                    result = child.kill().await.context("Failed to kill browser");
                }
            }
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        if let Some(dir) = self.profile_dir.take() {
            if let Err(e) = dir.close() {
                warn!("Failed to remove browser profile directory: {e}");
            }
        }

        result
    }
}
