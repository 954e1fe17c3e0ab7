//! Headless Chromium driver speaking the DevTools protocol.
//!
//! `ChromiumBackend` spawns a browser process with remote debugging
//! enabled, attaches to its first page target over WebSocket, and exposes
//! the page through the `WebSession` trait. One IO task owns the socket;
//! commands go through an mpsc channel and replies route back over
//! oneshots keyed by call id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::{BridgeError, SessionBackend, WebSession};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/127.0.0.0 Safari/537.36";
const DEFAULT_TIMEZONE: &str = "Asia/Calcutta";
const VIEWPORT_WIDTH: u32 = 1366;
const VIEWPORT_HEIGHT: u32 = 768;

/// How long the network must stay quiet to count as idle
const NETWORK_SETTLE: Duration = Duration::from_millis(500);
/// Polling cadence for selector and idle waits
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Browser launch configuration
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub headless: bool,
    /// Explicit browser binary; falls back to `chromium` on PATH
    pub browser_path: Option<PathBuf>,
    /// Persistent profile dir so the login survives restarts
    pub user_data_dir: PathBuf,
    pub user_agent: String,
    pub timezone: String,
}

impl LaunchOptions {
    pub fn new(user_data_dir: PathBuf) -> Self {
        Self {
            headless: true,
            browser_path: None,
            user_data_dir,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timezone: DEFAULT_TIMEZONE.to_string(),
        }
    }
}

/// Launches Chromium sessions
pub struct ChromiumBackend {
    opts: LaunchOptions,
}

impl ChromiumBackend {
    pub fn new(opts: LaunchOptions) -> Self {
        Self { opts }
    }
}

#[async_trait]
impl SessionBackend for ChromiumBackend {
    async fn launch(&self) -> Result<Box<dyn WebSession>, BridgeError> {
        let port = pick_debug_port()?;

        let binary = self
            .opts
            .browser_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("chromium"));

        let mut cmd = Command::new(&binary);
        cmd.arg(format!("--remote-debugging-port={port}"))
            .arg(format!(
                "--user-data-dir={}",
                self.opts.user_data_dir.display()
            ))
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg(format!(
                "--window-size={VIEWPORT_WIDTH},{VIEWPORT_HEIGHT}"
            ))
            .arg(format!("--user-agent={}", self.opts.user_agent))
            .arg("--no-first-run")
            .arg("about:blank")
            .env("TZ", &self.opts.timezone)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if self.opts.headless {
            cmd.arg("--headless=new");
        }

        let child = cmd.spawn().map_err(|e| {
            BridgeError::SessionInit(format!("failed to spawn {}: {e}", binary.display()))
        })?;

        let ws_url = wait_for_page_target(port).await?;
        debug!(component = "chromium", %ws_url, "attaching to page target");

        let (ws, _) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .map_err(|e| BridgeError::SessionInit(format!("devtools connect: {e}")))?;

        let cdp = CdpClient::spawn(ws);

        for (method, params) in [
            ("Page.enable", json!({})),
            ("Network.enable", json!({})),
            (
                "Emulation.setTimezoneOverride",
                json!({ "timezoneId": self.opts.timezone }),
            ),
            (
                "Emulation.setDeviceMetricsOverride",
                json!({
                    "width": VIEWPORT_WIDTH,
                    "height": VIEWPORT_HEIGHT,
                    "deviceScaleFactor": 1,
                    "mobile": false,
                }),
            ),
        ] {
            cdp.call(method, params)
                .await
                .map_err(|e| BridgeError::SessionInit(format!("{method}: {e}")))?;
        }

        Ok(Box::new(ChromiumSession { child, cdp }))
    }
}

/// Ask the OS for a free port, then hand it to the browser
fn pick_debug_port() -> Result<u16, BridgeError> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| BridgeError::SessionInit(format!("no free debug port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| BridgeError::SessionInit(format!("no free debug port: {e}")))?
        .port();
    Ok(port)
}

/// Poll the debugger HTTP endpoint until the first page target shows up.
async fn wait_for_page_target(port: u16) -> Result<String, BridgeError> {
    let url = format!("http://127.0.0.1:{port}/json/list");
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let Ok(resp) = reqwest::get(&url).await else {
            continue;
        };
        let Ok(targets) = resp.json::<Value>().await else {
            continue;
        };
        if let Some(ws_url) = page_ws_url(&targets) {
            return Ok(ws_url);
        }
    }
    Err(BridgeError::SessionInit(
        "browser never exposed a page target".into(),
    ))
}

/// Pull the first page target's debugger URL out of a `/json/list` response
fn page_ws_url(targets: &Value) -> Option<String> {
    targets.as_array()?.iter().find_map(|t| {
        if t.get("type")?.as_str()? != "page" {
            return None;
        }
        Some(t.get("webSocketDebuggerUrl")?.as_str()?.to_string())
    })
}

// ---------------------------------------------------------------------------
// CDP plumbing
// ---------------------------------------------------------------------------

struct CdpCall {
    method: String,
    params: Value,
    reply: oneshot::Sender<Result<Value, BridgeError>>,
}

/// Tracks network activity reported by the IO task so sessions can wait
/// for quiescence without subscribing to events themselves.
struct NetworkWatch {
    inflight: AtomicI64,
    last_activity_ms: AtomicU64,
    epoch: Instant,
}

impl NetworkWatch {
    fn new() -> Self {
        Self {
            inflight: AtomicI64::new(0),
            last_activity_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn request_started(&self) {
        self.inflight.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    fn request_finished(&self) {
        // Events can arrive for requests started before we attached
        let _ = self
            .inflight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some((n - 1).max(0))
            });
        self.touch();
    }

    fn idle(&self, settle: Duration) -> bool {
        if self.inflight.load(Ordering::Relaxed) > 0 {
            return false;
        }
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last) >= settle
    }
}

#[derive(Clone)]
struct CdpClient {
    call_tx: mpsc::Sender<CdpCall>,
    net: Arc<NetworkWatch>,
}

impl CdpClient {
    fn spawn(ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        let (call_tx, call_rx) = mpsc::channel(64);
        let net = Arc::new(NetworkWatch::new());
        tokio::spawn(io_loop(ws, call_rx, net.clone()));
        Self { call_tx, net }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.call_tx
            .send(CdpCall {
                method: method.to_string(),
                params,
                reply: tx,
            })
            .await
            .map_err(|_| BridgeError::Transient("devtools connection closed".into()))?;
        rx.await
            .map_err(|_| BridgeError::Transient("devtools call dropped".into()))?
    }
}

async fn io_loop(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut call_rx: mpsc::Receiver<CdpCall>,
    net: Arc<NetworkWatch>,
) {
    let (mut sink, mut stream) = ws.split();
    let mut pending: HashMap<u64, oneshot::Sender<Result<Value, BridgeError>>> = HashMap::new();
    let mut next_id: u64 = 1;

    loop {
        tokio::select! {
            call = call_rx.recv() => {
                let Some(call) = call else { break };
                let id = next_id;
                next_id += 1;
                let frame = json!({ "id": id, "method": call.method, "params": call.params });
                if sink.send(WsMessage::Text(frame.to_string().into())).await.is_err() {
                    let _ = call.reply.send(Err(BridgeError::Transient(
                        "devtools connection closed".into(),
                    )));
                    break;
                }
                pending.insert(id, call.reply);
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(txt))) => {
                        handle_frame(txt.as_str(), &mut pending, &net);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(component = "chromium", error = %e, "devtools socket error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(BridgeError::Transient(
            "devtools connection closed".into(),
        )));
    }
}

fn handle_frame(
    raw: &str,
    pending: &mut HashMap<u64, oneshot::Sender<Result<Value, BridgeError>>>,
    net: &NetworkWatch,
) {
    let Ok(frame) = serde_json::from_str::<Value>(raw) else {
        return;
    };

    if let Some(id) = frame.get("id").and_then(Value::as_u64) {
        if let Some(reply) = pending.remove(&id) {
            let result = match frame.get("error") {
                Some(err) => {
                    let msg = err
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown devtools error");
                    Err(BridgeError::Transient(format!("devtools: {msg}")))
                }
                None => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = reply.send(result);
        }
        return;
    }

    match frame.get("method").and_then(Value::as_str) {
        Some("Network.requestWillBeSent") => net.request_started(),
        Some("Network.loadingFinished") | Some("Network.loadingFailed") => net.request_finished(),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct ChromiumSession {
    child: Child,
    cdp: CdpClient,
}

impl ChromiumSession {
    async fn eval(&self, expr: &str) -> Result<Value, BridgeError> {
        let resp = self
            .cdp
            .call(
                "Runtime.evaluate",
                json!({ "expression": expr, "returnByValue": true }),
            )
            .await?;
        if let Some(details) = resp.get("exceptionDetails") {
            let text = details
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("script exception");
            return Err(BridgeError::Transient(format!("page script: {text}")));
        }
        Ok(resp
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn wait_for_load(&self, timeout: Duration) -> Result<(), BridgeError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.eval("document.readyState").await? == json!("complete") {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BridgeError::Timeout("page load".into()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl WebSession for ChromiumSession {
    async fn navigate(&mut self, url: &str) -> Result<(), BridgeError> {
        self.cdp.call("Page.navigate", json!({ "url": url })).await?;
        self.wait_for_load(Duration::from_secs(30)).await?;
        // Best effort: heavy web apps keep trickling requests after load
        if let Err(BridgeError::Timeout(_)) =
            self.wait_for_network_idle(Duration::from_secs(10)).await
        {
            debug!(component = "chromium", "network never settled after navigation");
        }
        Ok(())
    }

    async fn reload(&mut self) -> Result<(), BridgeError> {
        self.cdp.call("Page.reload", json!({})).await?;
        self.wait_for_load(Duration::from_secs(30)).await
    }

    async fn wait_for_selector(&mut self, css: &str, timeout: Duration) -> Result<(), BridgeError> {
        let css_json = serde_json::to_string(css)?;
        let expr = format!("!!document.querySelector({css_json})");
        let deadline = Instant::now() + timeout;
        loop {
            if self.eval(&expr).await? == json!(true) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BridgeError::Timeout(css.to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn query_attribute(
        &mut self,
        css: &str,
        attr: &str,
    ) -> Result<Option<String>, BridgeError> {
        let css_json = serde_json::to_string(css)?;
        let attr_json = serde_json::to_string(attr)?;
        let expr = format!(
            "(() => {{ const el = document.querySelector({css_json}); \
             return el ? el.getAttribute({attr_json}) : null; }})()"
        );
        Ok(self.eval(&expr).await?.as_str().map(String::from))
    }

    async fn press_enter(&mut self) -> Result<(), BridgeError> {
        self.cdp
            .call(
                "Input.dispatchKeyEvent",
                json!({
                    "type": "keyDown",
                    "key": "Enter",
                    "code": "Enter",
                    "windowsVirtualKeyCode": 13,
                    "text": "\r",
                }),
            )
            .await?;
        self.cdp
            .call(
                "Input.dispatchKeyEvent",
                json!({ "type": "keyUp", "key": "Enter", "code": "Enter" }),
            )
            .await?;
        Ok(())
    }

    async fn click(&mut self, css: &str) -> Result<(), BridgeError> {
        let css_json = serde_json::to_string(css)?;
        let expr = format!(
            "(() => {{ const el = document.querySelector({css_json}); \
             if (el) el.click(); return !!el; }})()"
        );
        if self.eval(&expr).await? != json!(true) {
            return Err(BridgeError::Transient(format!("no element for {css}")));
        }
        Ok(())
    }

    async fn wait_for_network_idle(&mut self, timeout: Duration) -> Result<(), BridgeError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.cdp.net.idle(NETWORK_SETTLE) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BridgeError::Timeout("network idle".into()));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, BridgeError> {
        let resp = self
            .cdp
            .call("Page.captureScreenshot", json!({ "format": "png" }))
            .await?;
        let data = resp
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::Transient("screenshot returned no data".into()))?;
        STANDARD
            .decode(data)
            .map_err(|e| BridgeError::Transient(format!("screenshot decode: {e}")))
    }

    async fn clear_local_state(&mut self) -> Result<(), BridgeError> {
        self.eval("localStorage.clear(); indexedDB.deleteDatabase('wawc'); true")
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BridgeError> {
        // Politely first, then by force
        let _ = self.cdp.call("Browser.close", json!({})).await;
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_first_page_target() {
        let targets = json!([
            { "type": "background_page", "webSocketDebuggerUrl": "ws://x/1" },
            { "type": "page", "webSocketDebuggerUrl": "ws://x/2" },
            { "type": "page", "webSocketDebuggerUrl": "ws://x/3" },
        ]);
        assert_eq!(page_ws_url(&targets).as_deref(), Some("ws://x/2"));
        assert_eq!(page_ws_url(&json!([])), None);
        assert_eq!(page_ws_url(&json!({"not": "an array"})), None);
    }

    #[test]
    fn network_watch_requires_settle_window() {
        let net = NetworkWatch::new();
        assert!(net.idle(Duration::ZERO));

        net.request_started();
        assert!(!net.idle(Duration::ZERO));

        net.request_finished();
        // Activity just happened, so a settle window is still pending
        assert!(!net.idle(Duration::from_secs(5)));
        assert!(net.idle(Duration::ZERO));
    }

    #[test]
    fn finish_never_goes_negative() {
        let net = NetworkWatch::new();
        net.request_finished();
        net.request_finished();
        net.request_started();
        assert_eq!(net.inflight.load(Ordering::Relaxed), 1);
    }
}
