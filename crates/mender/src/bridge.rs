//! Live page driver backed by a browser extension.
//!
//! The extension connects to a local WebSocket server and evaluates the
//! scripts it is sent in the active tab:
//!
//! ```text
//! -> {"id": "...", "action": "eval", "code": "...", "await_promise": true}
//! <- {"id": "...", "ok": true, "result": ...}
//! <- {"id": "...", "ok": false, "error": "..."}
//! <- {"type": "hello"} | {"type": "pong"} | {"type": "console_event", ...}
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::command::Selector;
use crate::errors::PageError;
use crate::page::{ElementHandle, PageDriver};

pub const DEFAULT_BRIDGE_ADDR: &str = "127.0.0.1:17373";

/// Attribute used to tag resolved elements so later calls can find them.
pub const HANDLE_ATTRIBUTE: &str = "data-mender-handle";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

type BridgeResult = Result<Value, String>;
type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<BridgeResult>>>>;
type Clients = Arc<Mutex<Vec<Client>>>;

#[derive(Debug, Serialize)]
struct EvalRequest<'a> {
    id: &'a str,
    action: &'a str,
    code: &'a str,
    await_promise: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BridgeIncoming {
    EvalResult {
        id: String,
        ok: bool,
        result: Option<Value>,
        error: Option<String>,
    },
    Typed(TypedIncoming),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum TypedIncoming {
    #[serde(rename = "hello")]
    Hello { from: Option<String> },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "console_event")]
    ConsoleEvent {
        level: Option<String>,
        args: Option<Value>,
    },
}

struct Client {
    sender: mpsc::UnboundedSender<Message>,
    connected_at: Instant,
}

/// WebSocket server the browser extension connects to.
pub struct ExtensionBridge {
    server_task: JoinHandle<()>,
    clients: Clients,
    pending: Pending,
    local_addr: SocketAddr,
}

impl ExtensionBridge {
    /// Binds `addr` and starts accepting extension connections.
    pub async fn start(addr: &str) -> Result<Self, PageError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PageError::Connection(format!("cannot bind bridge to {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| PageError::Connection(format!("bridge has no local address: {e}")))?;
        info!("Extension bridge listening on {}", local_addr);

        let clients: Clients = Arc::new(Mutex::new(Vec::new()));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let server_task = tokio::spawn(accept_loop(listener, clients.clone(), pending.clone()));

        Ok(Self {
            server_task,
            clients,
            pending,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        !self.server_task.is_finished()
    }

    pub async fn is_client_connected(&self) -> bool {
        let mut clients = self.clients.lock().await;
        clients.retain(|c| !c.sender.is_closed());
        !clients.is_empty()
    }

    /// Waits until an extension is connected, up to `timeout`.
    pub async fn wait_for_client(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_client_connected().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("No browser extension connected after {:?}", timeout);
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Evaluates `code` in the active tab of the most recently connected
    /// browser.
    pub async fn eval(&self, code: &str, timeout: Duration) -> Result<Value, PageError> {
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(&EvalRequest {
            id: &id,
            action: "eval",
            code,
            await_promise: true,
        })
        .map_err(|e| PageError::Script(format!("cannot encode eval request: {e}")))?;

        let (tx, rx) = oneshot::channel::<BridgeResult>();
        self.pending.lock().await.insert(id.clone(), tx);

        let sent = {
            let mut clients = self.clients.lock().await;
            clients.retain(|c| !c.sender.is_closed());
            match clients.last() {
                Some(client) => {
                    let preview: String = code.chars().take(120).collect();
                    debug!(
                        id = %id,
                        connected_for = ?client.connected_at.elapsed(),
                        preview = %preview,
                        "Sending eval to extension"
                    );
                    client.sender.send(Message::Text(payload)).is_ok()
                }
                None => false,
            }
        };
        if !sent {
            self.pending.lock().await.remove(&id);
            return Err(PageError::Connection(
                "no browser extension is connected".to_string(),
            ));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(PageError::Script(message)),
            Ok(Err(_)) => Err(PageError::Connection(
                "extension disconnected before answering".to_string(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(PageError::Timeout(format!(
                    "extension did not answer within {timeout:?}"
                )))
            }
        }
    }
}

impl Drop for ExtensionBridge {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, clients: Clients, pending: Pending) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!("Bridge accept error: {}", e);
                continue;
            }
        };
        debug!(%peer, "Bridge connection");
        tokio::spawn(serve_client(stream, clients.clone(), pending.clone()));
    }
}

async fn serve_client(stream: tokio::net::TcpStream, clients: Clients, pending: Pending) {
    let ws_stream = match accept_async(stream).await {
        Ok(s) => s,
        Err(e) => {
            warn!("Bridge handshake error: {}", e);
            return;
        }
    };
    let (mut sink, mut incoming) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                warn!("Bridge send error: {}", e);
                break;
            }
        }
    });

    clients.lock().await.push(Client {
        sender: tx,
        connected_at: Instant::now(),
    });

    while let Some(Ok(msg)) = incoming.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        match serde_json::from_str::<BridgeIncoming>(&text) {
            Ok(BridgeIncoming::EvalResult {
                id,
                ok,
                result,
                error,
            }) => {
                let outcome = if ok {
                    Ok(result.unwrap_or(Value::Null))
                } else {
                    let message = error.unwrap_or_else(|| "unknown error".into());
                    let shown: String = message.chars().take(400).collect();
                    debug!(id = %id, error = %shown, "Eval failed in page");
                    Err(message)
                };
                if let Some(waiter) = pending.lock().await.remove(&id) {
                    let _ = waiter.send(outcome);
                }
            }
            Ok(BridgeIncoming::Typed(TypedIncoming::Hello { from })) => {
                info!(from = ?from, "Browser extension connected");
            }
            Ok(BridgeIncoming::Typed(TypedIncoming::Pong)) => {}
            Ok(BridgeIncoming::Typed(TypedIncoming::ConsoleEvent { level, args })) => {
                let args = args.map(|v| v.to_string()).unwrap_or_default();
                match level.as_deref() {
                    Some("error") => error!(args = %args, "Page console error"),
                    Some("warn") | Some("warning") => warn!(args = %args, "Page console warning"),
                    _ => debug!(args = %args, "Page console"),
                }
            }
            Err(e) => warn!("Invalid bridge message: {}", e),
        }
    }

    {
        let mut clients = clients.lock().await;
        clients.retain(|c| !c.sender.is_closed());
        if clients.is_empty() {
            let mut pending = pending.lock().await;
            if !pending.is_empty() {
                warn!("Last extension disconnected with {} pending eval(s)", pending.len());
                pending.clear();
            }
        }
        info!("Extension disconnected, {} client(s) remaining", clients.len());
    }
    writer.abort();
}

/// JS string literal for `s`.
fn js_str(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

const FINDER_PRELUDE: &str = r#"const norm = s => (s || '').replace(/\s+/g, ' ').trim();
const implicitRole = el => {
  const tag = el.tagName.toLowerCase();
  const type = (el.getAttribute('type') || 'text').toLowerCase();
  if (tag === 'button' || (tag === 'input' && ['button', 'submit', 'reset'].includes(type))) return 'button';
  if (tag === 'a' && el.hasAttribute('href')) return 'link';
  if (tag === 'input' && type === 'checkbox') return 'checkbox';
  if (tag === 'input' && type === 'radio') return 'radio';
  if (tag === 'input' || tag === 'textarea') return 'textbox';
  if (tag === 'select') return 'combobox';
  if (/^h[1-6]$/.test(tag)) return 'heading';
  if (tag === 'img') return 'img';
  if (tag === 'nav') return 'navigation';
  if (tag === 'form') return 'form';
  return null;
};"#;

/// JS expression evaluating to the array of elements `selector` matches.
pub fn finder_expression(selector: &Selector) -> String {
    match selector {
        Selector::CssClass(value) => format!(
            "Array.from(document.getElementsByClassName({}))",
            js_str(value.trim_start_matches('.'))
        ),
        Selector::CssAttribute(value) | Selector::Css(value) => {
            format!("Array.from(document.querySelectorAll({}))", js_str(value))
        }
        Selector::Text(value) => format!(
            "(() => {{ const want = norm({}); \
return Array.from(document.querySelectorAll('body *')).filter(el => norm(el.textContent) === want \
&& !Array.from(el.children).some(c => norm(c.textContent) === want)); }})()",
            js_str(value)
        ),
        Selector::Placeholder(value) => format!(
            "Array.from(document.querySelectorAll('[placeholder]')).filter(el => el.getAttribute('placeholder') === {})",
            js_str(value)
        ),
        Selector::Role(_) => {
            let (role, name) = selector.role_and_name().unwrap_or((selector.value(), None));
            let name = name.map(js_str).unwrap_or_else(|| "null".to_string());
            format!(
                "(() => {{ const role = {}; const name = {name}; \
return Array.from(document.querySelectorAll('body *')).filter(el => \
((el.getAttribute('role') || implicitRole(el)) === role) && \
(name === null || norm(el.getAttribute('aria-label')) === norm(name) || norm(el.textContent) === norm(name))); }})()",
                js_str(role)
            )
        }
        Selector::TestId(value) => {
            let v = js_str(value);
            format!(
                "Array.from(document.querySelectorAll('[data-testid],[data-test-id],[data-test],[data-qa]')).filter(el => \
[el.getAttribute('data-testid'), el.getAttribute('data-test-id'), el.getAttribute('data-test'), el.getAttribute('data-qa')].includes({v}))"
            )
        }
        Selector::Xpath(value) => format!(
            "(() => {{ const snap = document.evaluate({}, document, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null); \
const out = []; for (let i = 0; i < snap.snapshotLength; i++) out.push(snap.snapshotItem(i)); return out; }})()",
            js_str(value)
        ),
    }
}

/// Script tagging the first match with `handle` and returning the number of
/// matches. Only the most recently queried element carries a handle, so
/// earlier handles become detached.
fn tag_script(selector: &Selector, handle: &str) -> String {
    format!(
        "(() => {{ {FINDER_PRELUDE}\nconst found = {};\n\
if (found.length > 0) {{\n\
document.querySelectorAll('[{HANDLE_ATTRIBUTE}]').forEach(e => e.removeAttribute('{HANDLE_ATTRIBUTE}'));\n\
found[0].setAttribute('{HANDLE_ATTRIBUTE}', {}); }}\n\
return found.length; }})()",
        finder_expression(selector),
        js_str(handle)
    )
}

fn count_script(selector: &Selector) -> String {
    format!(
        "(() => {{ {FINDER_PRELUDE}\nreturn ({}).length; }})()",
        finder_expression(selector)
    )
}

/// Wraps `body` with a lookup of the tagged element bound to `el`. `body`
/// must return `{value: ...}`.
fn element_script(element: &ElementHandle, body: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector('[{HANDLE_ATTRIBUTE}=' + JSON.stringify({}) + ']');\n\
if (!el) return {{detached: true}};\n{body} }})()",
        js_str(&element.id)
    )
}

/// [`PageDriver`] that drives the active tab through an [`ExtensionBridge`].
/// Screenshots are not available through the extension.
pub struct BridgePage {
    bridge: Arc<ExtensionBridge>,
    eval_timeout: Duration,
}

impl BridgePage {
    pub fn new(bridge: Arc<ExtensionBridge>) -> Self {
        Self {
            bridge,
            eval_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_eval_timeout(mut self, timeout: Duration) -> Self {
        self.eval_timeout = timeout;
        self
    }

    async fn on_element(&self, element: &ElementHandle, body: &str) -> Result<Value, PageError> {
        let result = self
            .bridge
            .eval(&element_script(element, body), self.eval_timeout)
            .await?;
        if result.get("detached").and_then(Value::as_bool) == Some(true) {
            return Err(PageError::ElementDetached(element.selector.to_string()));
        }
        Ok(result.get("value").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl PageDriver for BridgePage {
    async fn query(&self, selector: &Selector, timeout: Duration) -> Result<ElementHandle, PageError> {
        let handle = Uuid::new_v4().to_string();
        let script = tag_script(selector, &handle);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let found = self
                .bridge
                .eval(&script, remaining.max(POLL_INTERVAL).min(self.eval_timeout))
                .await?;
            if found.as_u64().unwrap_or(0) > 0 {
                return Ok(ElementHandle::new(handle, selector.clone()));
            }
            if tokio::time::Instant::now() + POLL_INTERVAL >= deadline {
                return Err(PageError::ElementNotFound(selector.to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn count(&self, selector: &Selector) -> Result<usize, PageError> {
        let count = self
            .bridge
            .eval(&count_script(selector), self.eval_timeout)
            .await?;
        Ok(count.as_u64().unwrap_or(0) as usize)
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), PageError> {
        let started = tokio::time::Instant::now();
        let script = format!("(() => {{ window.location.href = {}; return true; }})()", js_str(url));
        // The page unloads under the script, so a missing answer is expected
        match self.bridge.eval(&script, self.eval_timeout.min(timeout)).await {
            Ok(_) | Err(PageError::Timeout(_)) | Err(PageError::Script(_)) => {}
            Err(e) => return Err(PageError::Navigation(format!("{url}: {e}"))),
        }

        loop {
            let state = self
                .bridge
                .eval("document.readyState", self.eval_timeout)
                .await;
            if matches!(&state, Ok(Value::String(s)) if s == "complete") {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(PageError::Navigation(format!(
                    "{url} did not finish loading within {timeout:?}"
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), PageError> {
        self.on_element(
            element,
            "el.scrollIntoView({block: 'center'}); el.click(); return {value: true};",
        )
        .await
        .map(|_| ())
    }

    async fn hover(&self, element: &ElementHandle) -> Result<(), PageError> {
        self.on_element(
            element,
            "el.scrollIntoView({block: 'center'});\n\
for (const type of ['mouseover', 'mouseenter', 'mousemove']) el.dispatchEvent(new MouseEvent(type, {bubbles: true}));\n\
return {value: true};",
        )
        .await
        .map(|_| ())
    }

    async fn type_text(&self, element: &ElementHandle, text: &str) -> Result<(), PageError> {
        let body = format!(
            "el.focus();\n\
const proto = el instanceof HTMLTextAreaElement ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;\n\
const setter = Object.getOwnPropertyDescriptor(proto, 'value');\n\
if (setter && setter.set && (el instanceof HTMLInputElement || el instanceof HTMLTextAreaElement)) setter.set.call(el, {text});\n\
else if (el.isContentEditable) el.textContent = {text};\n\
else return {{value: false}};\n\
el.dispatchEvent(new Event('input', {{bubbles: true}}));\n\
el.dispatchEvent(new Event('change', {{bubbles: true}}));\n\
return {{value: true}};",
            text = js_str(text)
        );
        match self.on_element(element, &body).await? {
            Value::Bool(false) => Err(PageError::UnsupportedOperation(format!(
                "{} does not accept text",
                element.selector
            ))),
            _ => Ok(()),
        }
    }

    async fn select_option(&self, element: &ElementHandle, value: &str) -> Result<(), PageError> {
        let body = format!(
            "if (!(el instanceof HTMLSelectElement)) return {{value: 'not-select'}};\n\
const want = {};\n\
const option = Array.from(el.options).find(o => o.value === want || o.textContent.trim() === want);\n\
if (!option) return {{value: 'no-option'}};\n\
el.value = option.value;\n\
el.dispatchEvent(new Event('input', {{bubbles: true}}));\n\
el.dispatchEvent(new Event('change', {{bubbles: true}}));\n\
return {{value: 'ok'}};",
            js_str(value)
        );
        match self.on_element(element, &body).await?.as_str() {
            Some("ok") => Ok(()),
            Some("no-option") => Err(PageError::ElementNotFound(format!(
                "option '{value}' in {}",
                element.selector
            ))),
            _ => Err(PageError::UnsupportedOperation(format!(
                "{} is not a select element",
                element.selector
            ))),
        }
    }

    async fn press_key(&self, key: &str) -> Result<(), PageError> {
        let script = format!(
            "(() => {{ const key = {};\n\
const target = document.activeElement || document.body;\n\
for (const type of ['keydown', 'keypress', 'keyup']) target.dispatchEvent(new KeyboardEvent(type, {{key, bubbles: true}}));\n\
if (key === 'Enter' && target.form) {{ if (target.form.requestSubmit) target.form.requestSubmit(); else target.form.submit(); }}\n\
return true; }})()",
            js_str(key)
        );
        self.bridge.eval(&script, self.eval_timeout).await.map(|_| ())
    }

    async fn read_attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, PageError> {
        let body = format!("return {{value: el.getAttribute({})}};", js_str(name));
        Ok(self
            .on_element(element, &body)
            .await?
            .as_str()
            .map(str::to_string))
    }

    async fn text_content(&self, element: &ElementHandle) -> Result<String, PageError> {
        let value = self
            .on_element(element, "return {value: el.innerText || el.textContent || ''};")
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn is_visible(&self, element: &ElementHandle) -> Result<bool, PageError> {
        let value = self
            .on_element(
                element,
                "const style = window.getComputedStyle(el);\n\
const rect = el.getBoundingClientRect();\n\
return {value: style.display !== 'none' && style.visibility !== 'hidden' && rect.width > 0 && rect.height > 0};",
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn current_url(&self) -> Result<String, PageError> {
        let value = self.bridge.eval("window.location.href", self.eval_timeout).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn page_markup(&self) -> Result<String, PageError> {
        let value = self
            .bridge
            .eval("document.documentElement.outerHTML", self.eval_timeout)
            .await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PageError::Script("page markup was not a string".to_string()))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, PageError> {
        Err(PageError::UnsupportedOperation(
            "screenshots are not available through the extension bridge".to_string(),
        ))
    }
}
