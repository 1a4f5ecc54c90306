//! Cluster supervisor: owns one downstream MCP child process per cluster.
//!
//! Each configured cluster gets an endpoint record holding the child
//! process, the MCP client bound to its stdio, the discovered tools, and
//! health bookkeeping. The supervisor provides idempotent connect, ping,
//! reconnect, call, and shutdown operations; the health loop drives it
//! from the outside and listens for child exits on the event bus.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, Content, JsonObject, Tool},
    service::{RunningService, ServiceExt},
    RoleClient,
};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::cluster::{self, ClusterMapping};
use crate::config::Config;
use crate::events::{EndpointEvent, EndpointEventReceiver, EndpointEventSender};

/// Type alias for the running MCP client service.
type McpService = RunningService<RoleClient, ()>;

/// Child handle plus MCP client, taken out of a record together.
type Connection = (Option<ChildHandle>, Option<Arc<McpService>>);

/// Consecutive ping failures before a cluster is considered disconnected.
const MAX_PING_FAILURES: u32 = 3;

/// How long a child gets to exit after SIGTERM before SIGKILL.
const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection state of one cluster endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Connection attempt in progress.
    Connecting,
    /// Child alive, client attached, tools discovered.
    Connected,
    /// Last connect or ping failed; reconnect pending.
    Failed,
    /// Child gone (exit, ping threshold, or teardown).
    Disconnected,
}

impl EndpointState {
    /// Get the state name as a string for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointState::Connecting => "connecting",
            EndpointState::Connected => "connected",
            EndpointState::Failed => "failed",
            EndpointState::Disconnected => "disconnected",
        }
    }
}

/// Handle to a spawned child, owned by the record while the exit watcher
/// task owns the `Child` itself.
struct ChildHandle {
    /// OS pid at spawn time; used for signalling and for the watcher to
    /// recognize whether an exit belongs to the currently tracked child.
    pid: Option<u32>,
    /// Flips to true once the watcher observes the exit.
    exited: watch::Receiver<bool>,
}

/// Internal per-cluster record. Mutated only under the endpoint map lock.
struct EndpointRecord {
    url: String,
    identity: String,
    status: EndpointState,
    child: Option<ChildHandle>,
    client: Option<Arc<McpService>>,
    last_heartbeat: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    tools: Vec<Tool>,
    /// Guard: true while a reconnect is in flight.
    reconnecting: bool,
    call_count: u64,
    last_tool: Option<String>,
}

impl EndpointRecord {
    fn new(url: String, identity: String) -> Self {
        Self {
            url,
            identity,
            status: EndpointState::Connecting,
            child: None,
            client: None,
            last_heartbeat: None,
            consecutive_failures: 0,
            tools: Vec::new(),
            reconnecting: false,
            call_count: 0,
            last_tool: None,
        }
    }

    fn take_connection(&mut self) -> Connection {
        (self.child.take(), self.client.take())
    }
}

/// Status snapshot for logging, the health loop, and tests.
#[derive(Debug, Clone)]
pub struct EndpointStatus {
    pub url: String,
    pub identity: String,
    pub state: EndpointState,
    pub tool_count: usize,
    pub consecutive_failures: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub call_count: u64,
    pub last_tool: Option<String>,
}

/// Supervisor for the downstream cluster fleet.
///
/// Records live for the whole process; child processes come and go within
/// them. Operations on different clusters run concurrently; the map lock is
/// held only for bookkeeping, never across child I/O.
pub struct Supervisor {
    endpoints: Arc<RwLock<HashMap<String, EndpointRecord>>>,
    server_command: Vec<String>,
    read_only: bool,
    ping_timeout: Duration,
    events: EndpointEventSender,
}

impl Supervisor {
    /// Create a supervisor from the resolved configuration.
    ///
    /// `config.server_command` is non-empty by construction.
    pub fn new(config: &Config, events: EndpointEventSender) -> Self {
        Self {
            endpoints: Arc::new(RwLock::new(HashMap::new())),
            server_command: config.server_command.clone(),
            read_only: config.read_only,
            ping_timeout: config.ping_timeout,
            events,
        }
    }

    /// Subscribe to endpoint lifecycle events.
    pub fn subscribe(&self) -> EndpointEventReceiver {
        self.events.subscribe()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create records for all mappings (deduplicated by normalized URL) and
    /// connect them in parallel. Individual failures are non-fatal; returns
    /// the number of clusters that came up.
    pub async fn init_all(&self, mappings: &[ClusterMapping]) -> usize {
        let unique = cluster::dedupe_mappings(mappings);

        {
            let mut map = self.endpoints.write().await;
            for mapping in &unique {
                map.insert(
                    mapping.url.clone(),
                    EndpointRecord::new(mapping.url.clone(), mapping.identity.clone()),
                );
            }
        }

        let attempts = unique.iter().map(|mapping| async {
            match self.connect(&mapping.url).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(cluster = %mapping.url, error = %e, "initial connection failed");
                    false
                }
            }
        });
        let results = futures::future::join_all(attempts).await;

        let connected = results.into_iter().filter(|ok| *ok).count();
        info!(connected, total = unique.len(), "cluster initialization complete");
        connected
    }

    /// Spawn the cluster's child process, attach an MCP client to its
    /// stdio, and discover its tools.
    pub async fn connect(&self, url: &str) -> Result<()> {
        let identity = {
            let mut map = self.endpoints.write().await;
            let rec = map
                .get_mut(url)
                .with_context(|| format!("unknown cluster {url}"))?;
            rec.status = EndpointState::Connecting;
            rec.identity.clone()
        };
        self.events.send(EndpointEvent::Connecting {
            cluster: url.to_string(),
        });
        debug!(cluster = %url, "spawning downstream server");

        let mut child = match self.child_command(&identity).spawn() {
            Ok(child) => child,
            Err(e) => {
                self.fail_connect(url, None).await;
                anyhow::bail!("failed to spawn {:?}: {e}", self.server_command[0]);
            }
        };
        let pid = child.id();
        let (stdout, stdin) = match (child.stdout.take(), child.stdin.take()) {
            (Some(stdout), Some(stdin)) => (stdout, stdin),
            _ => {
                // kill_on_drop reaps the child when it falls out of scope
                self.fail_connect(url, pid).await;
                anyhow::bail!("child stdio was not piped");
            }
        };

        let (exit_tx, exit_rx) = watch::channel(false);
        self.spawn_exit_watcher(url.to_string(), pid, child, exit_tx);

        let service = match ().serve((stdout, stdin)).await {
            Ok(service) => service,
            Err(e) => {
                self.fail_connect(url, pid).await;
                anyhow::bail!("MCP handshake failed for {url}: {e}");
            }
        };

        let tools = match service.list_tools(Default::default()).await {
            Ok(result) => result.tools,
            Err(e) => {
                service.cancellation_token().cancel();
                self.fail_connect(url, pid).await;
                anyhow::bail!("tool discovery failed for {url}: {e}");
            }
        };

        let tool_count = tools.len();
        {
            let mut map = self.endpoints.write().await;
            let Some(rec) = map.get_mut(url) else {
                // the fleet was shut down while this connect was in flight
                drop(map);
                service.cancellation_token().cancel();
                if let Some(pid) = pid {
                    send_kill(pid);
                }
                anyhow::bail!("cluster {url} was removed during connect");
            };
            rec.status = EndpointState::Connected;
            rec.child = Some(ChildHandle {
                pid,
                exited: exit_rx,
            });
            rec.client = Some(Arc::new(service));
            rec.tools = tools;
            rec.last_heartbeat = Some(Utc::now());
            rec.consecutive_failures = 0;
        }

        info!(cluster = %url, tool_count, "cluster connected");
        self.events.send(EndpointEvent::Connected {
            cluster: url.to_string(),
            tool_count,
        });
        Ok(())
    }

    /// Liveness probe. Only meaningful for a `Connected` cluster; anything
    /// else returns false without touching the child.
    ///
    /// A lightweight `tools/list` round-trip serves as the protocol ping.
    pub async fn ping(&self, url: &str) -> bool {
        let client = {
            let map = self.endpoints.read().await;
            match map.get(url) {
                Some(rec) if rec.status == EndpointState::Connected => {
                    match rec.client.clone() {
                        Some(client) => client,
                        None => return false,
                    }
                }
                _ => return false,
            }
        };

        let outcome =
            tokio::time::timeout(self.ping_timeout, client.list_tools(Default::default())).await;

        match outcome {
            Ok(Ok(_)) => {
                let mut map = self.endpoints.write().await;
                if let Some(rec) = map.get_mut(url) {
                    rec.last_heartbeat = Some(Utc::now());
                    rec.consecutive_failures = 0;
                }
                true
            }
            Ok(Err(e)) => {
                self.ping_failed(url, Some(e.to_string())).await;
                false
            }
            Err(_) => {
                self.ping_failed(url, None).await;
                false
            }
        }
    }

    async fn ping_failed(&self, url: &str, error: Option<String>) {
        let (failures, connection) = {
            let mut map = self.endpoints.write().await;
            let Some(rec) = map.get_mut(url) else { return };
            rec.consecutive_failures += 1;
            rec.status = if rec.consecutive_failures >= MAX_PING_FAILURES {
                EndpointState::Disconnected
            } else {
                EndpointState::Failed
            };
            (rec.consecutive_failures, rec.take_connection())
        };

        match error {
            Some(error) => warn!(cluster = %url, failures, %error, "ping failed"),
            None => warn!(cluster = %url, failures, "ping timed out"),
        }

        // A non-Connected cluster only comes back through reconnect, so the
        // dead connection is released now instead of lingering until then.
        self.dispose_connection(connection).await;
        self.events.send(EndpointEvent::PingFailed {
            cluster: url.to_string(),
            failures,
        });
    }

    /// Tear down and re-establish the cluster connection.
    ///
    /// Returns false immediately if a reconnect is already in flight.
    pub async fn reconnect(&self, url: &str) -> bool {
        {
            let mut map = self.endpoints.write().await;
            let Some(rec) = map.get_mut(url) else {
                return false;
            };
            if rec.reconnecting {
                debug!(cluster = %url, "reconnect already in flight");
                return false;
            }
            rec.reconnecting = true;
        }
        self.events.send(EndpointEvent::Reconnecting {
            cluster: url.to_string(),
        });

        self.teardown(url).await;
        let ok = match self.connect(url).await {
            Ok(()) => true,
            Err(e) => {
                warn!(cluster = %url, error = %e, "reconnect failed");
                let mut map = self.endpoints.write().await;
                if let Some(rec) = map.get_mut(url) {
                    rec.status = EndpointState::Failed;
                }
                false
            }
        };

        let mut map = self.endpoints.write().await;
        if let Some(rec) = map.get_mut(url) {
            rec.reconnecting = false;
        }
        ok
    }

    /// Close the client and stop the child (SIGTERM, 5 s grace, SIGKILL).
    async fn teardown(&self, url: &str) {
        let connection = {
            let mut map = self.endpoints.write().await;
            let Some(rec) = map.get_mut(url) else { return };
            if rec.status == EndpointState::Connected {
                rec.status = EndpointState::Disconnected;
            }
            rec.take_connection()
        };
        self.dispose_connection(connection).await;
    }

    async fn dispose_connection(&self, (child, client): Connection) {
        if let Some(client) = client {
            // Best-effort close; the transport may already be gone.
            client.cancellation_token().cancel();
        }

        let Some(mut handle) = child else { return };
        let Some(pid) = handle.pid else { return };

        send_terminate(pid);
        let graceful =
            tokio::time::timeout(GRACEFUL_EXIT_TIMEOUT, handle.exited.wait_for(|done| *done))
                .await;
        if graceful.is_err() {
            warn!(pid, "child ignored SIGTERM, killing");
            send_kill(pid);
        }
    }

    /// Tear down every cluster in parallel and clear the map.
    pub async fn shutdown_all(&self) {
        let urls: Vec<String> = self.endpoints.read().await.keys().cloned().collect();
        info!(clusters = urls.len(), "shutting down all clusters");
        futures::future::join_all(urls.iter().map(|url| self.teardown(url))).await;
        self.endpoints.write().await.clear();
    }

    /// Mark a failed connect attempt, reaping the half-spawned child.
    async fn fail_connect(&self, url: &str, pid: Option<u32>) {
        if let Some(pid) = pid {
            send_kill(pid);
        }
        let mut map = self.endpoints.write().await;
        if let Some(rec) = map.get_mut(url) {
            rec.status = EndpointState::Failed;
            rec.child = None;
            rec.client = None;
        }
    }

    /// Watch the child from a background task.
    ///
    /// The watcher is the sole owner of the `Child`; it reaps the process,
    /// flips the exit flag for teardown, and, when the exit was not caused
    /// by teardown (pid still tracked by the record), marks the cluster
    /// `Disconnected` and emits exactly one `ChildExited` event.
    fn spawn_exit_watcher(
        &self,
        url: String,
        pid: Option<u32>,
        mut child: Child,
        exit_tx: watch::Sender<bool>,
    ) {
        let endpoints = self.endpoints.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = exit_tx.send(true);

            let mut map = endpoints.write().await;
            let Some(rec) = map.get_mut(&url) else { return };
            if !rec.child.as_ref().is_some_and(|c| c.pid == pid) {
                // Teardown already detached this child; nothing to report.
                return;
            }

            match &status {
                Ok(code) => warn!(cluster = %url, status = %code, "child process exited"),
                Err(e) => warn!(cluster = %url, error = %e, "failed waiting on child process"),
            }
            rec.status = EndpointState::Disconnected;
            rec.child = None;
            if let Some(client) = rec.client.take() {
                client.cancellation_token().cancel();
            }
            drop(map);

            events.send(EndpointEvent::ChildExited { cluster: url });
        });
    }

    /// Build the child command with the credential environment.
    ///
    /// Credential values are opaque: they are forwarded into the child's
    /// environment and never interpreted here.
    fn child_command(&self, identity: &str) -> Command {
        let mut cmd = Command::new(&self.server_command[0]);
        cmd.args(&self.server_command[1..]);
        if self.read_only {
            cmd.arg("--read-only");
        }

        match std::env::var("AZURE_TOKEN_CREDENTIALS") {
            Ok(value) => cmd.env("AZURE_TOKEN_CREDENTIALS", value),
            Err(_) => cmd.env("AZURE_TOKEN_CREDENTIALS", "managedidentitycredential"),
        };
        for key in ["IDENTITY_ENDPOINT", "IDENTITY_HEADER"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        if identity.is_empty() {
            cmd.env_remove("AZURE_CLIENT_ID");
        } else {
            cmd.env("AZURE_CLIENT_ID", identity);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    // ========================================================================
    // Data plane
    // ========================================================================

    /// Call a tool on one cluster.
    ///
    /// An unknown or non-connected cluster yields an `isError` result
    /// naming the available clusters rather than an Err; call failures are
    /// encoded the same way.
    pub async fn call_on_one(&self, url: &str, tool: &str, args: JsonObject) -> CallToolResult {
        let (client, identity) = {
            let map = self.endpoints.read().await;
            let found = map.get(url).and_then(|rec| {
                if rec.status == EndpointState::Connected {
                    rec.client.clone().map(|client| (client, rec.identity.clone()))
                } else {
                    None
                }
            });
            match found {
                Some(pair) => pair,
                None => {
                    let available = join_urls(map.keys());
                    return error_result(format!(
                        "Cluster \"{url}\" is not connected. Available clusters: {available}"
                    ));
                }
            }
        };

        debug!(cluster = %url, tool, "calling downstream tool");
        let request = CallToolRequestParam {
            name: tool.to_string().into(),
            arguments: Some(args),
        };

        match client.call_tool(request).await {
            Ok(result) => {
                let mut map = self.endpoints.write().await;
                if let Some(rec) = map.get_mut(url) {
                    rec.call_count += 1;
                    rec.last_tool = Some(tool.to_string());
                }
                result
            }
            Err(e) => {
                let message = e.to_string();
                if is_auth_error(&message) {
                    error!(
                        cluster = %url,
                        identity = %identity,
                        tool,
                        error = %message,
                        "authentication failure calling downstream tool"
                    );
                }
                error_result(format!("Tool \"{tool}\" failed on {url}: {message}"))
            }
        }
    }

    /// Call a tool on every connected cluster in parallel and merge the
    /// results. Individual failures become text entries and flip the
    /// aggregated error flag; content order is stable by cluster URL.
    pub async fn call_on_all(&self, tool: &str, args: JsonObject) -> CallToolResult {
        let mut targets: Vec<String> = {
            let map = self.endpoints.read().await;
            map.values()
                .filter(|rec| rec.status == EndpointState::Connected && rec.client.is_some())
                .map(|rec| rec.url.clone())
                .collect()
        };
        targets.sort();

        if targets.is_empty() {
            return error_result("No clusters connected. Cannot execute the tool call.".to_string());
        }

        let calls = targets
            .iter()
            .map(|url| self.call_on_one(url, tool, args.clone()));
        let results = futures::future::join_all(calls).await;

        let mut content = Vec::new();
        let mut is_error = false;
        for (url, result) in targets.iter().zip(results) {
            if result.is_error.unwrap_or(false) {
                is_error = true;
                content.push(Content::text(format!("[{url}] {}", text_of(&result))));
            } else {
                content.extend(result.content);
            }
        }

        if is_error {
            CallToolResult::error(content)
        } else {
            CallToolResult::success(content)
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Configured cluster URLs, sorted.
    pub async fn endpoint_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.endpoints.read().await.keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Number of clusters currently connected.
    pub async fn connected_count(&self) -> usize {
        self.endpoints
            .read()
            .await
            .values()
            .filter(|rec| rec.status == EndpointState::Connected)
            .count()
    }

    /// Status snapshot for one cluster.
    pub async fn status(&self, url: &str) -> Option<EndpointStatus> {
        self.endpoints.read().await.get(url).map(snapshot)
    }

    /// Status snapshots for all clusters, sorted by URL.
    pub async fn statuses(&self) -> Vec<EndpointStatus> {
        let map = self.endpoints.read().await;
        let mut all: Vec<EndpointStatus> = map.values().map(snapshot).collect();
        all.sort_by(|a, b| a.url.cmp(&b.url));
        all
    }

    /// Tool list of the first connected cluster (by URL order) reporting a
    /// non-empty list. The fleet is assumed homogeneous; tool sets are not
    /// reconciled across clusters.
    pub async fn source_tools(&self) -> Vec<Tool> {
        let map = self.endpoints.read().await;
        let mut urls: Vec<&String> = map.keys().collect();
        urls.sort();
        for url in urls {
            if let Some(rec) = map.get(url) {
                if rec.status == EndpointState::Connected && !rec.tools.is_empty() {
                    return rec.tools.clone();
                }
            }
        }
        Vec::new()
    }
}

fn snapshot(rec: &EndpointRecord) -> EndpointStatus {
    EndpointStatus {
        url: rec.url.clone(),
        identity: rec.identity.clone(),
        state: rec.status,
        tool_count: rec.tools.len(),
        consecutive_failures: rec.consecutive_failures,
        last_heartbeat: rec.last_heartbeat,
        call_count: rec.call_count,
        last_tool: rec.last_tool.clone(),
    }
}

fn error_result(message: String) -> CallToolResult {
    CallToolResult::error(vec![Content::text(message)])
}

/// Concatenate the text items of a tool result.
fn text_of(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|c| c.as_text().map(|t| t.text.to_string()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn join_urls<'a>(urls: impl Iterator<Item = &'a String>) -> String {
    let mut list: Vec<&str> = urls.map(String::as_str).collect();
    list.sort_unstable();
    if list.is_empty() {
        "(none)".to_string()
    } else {
        list.join(", ")
    }
}

/// Markers the downstream transports use for credential failures.
fn is_auth_error(message: &str) -> bool {
    message.contains("401")
        || message.contains("403")
        || message.contains("Unauthorized")
        || message.contains("Forbidden")
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    // SAFETY: delivering SIGTERM to a pid this process spawned
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(unix)]
fn send_kill(pid: u32) {
    // SAFETY: as above, with SIGKILL
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) {}

#[cfg(not(unix))]
fn send_kill(_pid: u32) {}
