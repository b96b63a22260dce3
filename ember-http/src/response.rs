//! The response being built for one request, and the shared handle that
//! lets handlers complete it asynchronously.

use std::cell::{Cell, RefCell, RefMut};
use std::rc::Rc;
use std::sync::OnceLock;

use http::header::{self, HeaderMap, HeaderValue, IntoHeaderName};
use http::StatusCode;
use regex::Regex;
use tokio::sync::oneshot;
use tracing::{debug, error};

/// Liveness of the connection owning a response.
///
/// Handlers that defer completion must consult this before mutating the
/// response from a late callback; the connection flips it when the socket
/// goes away.
#[derive(Debug, Clone)]
pub struct Liveness(Rc<Cell<bool>>);

impl Liveness {
    #[must_use]
    pub fn new_alive() -> Self {
        Self(Rc::new(Cell::new(true)))
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.0.get()
    }

    pub fn mark_closed(&self) {
        self.0.set(false);
    }
}

/// The owning response message: status, headers, body bytes and a JSON
/// value that is serialized lazily when the body is still empty at
/// completion time.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    pub headers: HeaderMap,
    body: Vec<u8>,
    /// Structured payload filled by handlers; rendered into the body at
    /// completion when no body bytes were written explicitly.
    pub json_value: serde_json::Value,
    completed: bool,
    pub(crate) keep_alive: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
            json_value: serde_json::Value::Null,
            completed: false,
            keep_alive: true,
        }
    }
}

impl Response {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn add_header<K: IntoHeaderName>(&mut self, name: K, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Appends to the body.
    pub fn write(&mut self, part: impl AsRef<[u8]>) {
        self.body.extend_from_slice(part.as_ref());
    }

    /// Marks the response complete. Ending twice is a logged no-op.
    pub fn end(&mut self) {
        if self.completed {
            debug!("response was ended twice");
            return;
        }
        self.completed = true;
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Moves the response out, leaving a fresh empty one behind.
    #[must_use]
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Renders the default body at completion time: the accumulated JSON
    /// value (HTML-decorated when the client prefers HTML), a
    /// reason-phrase body for otherwise-empty error responses, and no
    /// body at all on 204.
    pub(crate) fn finalize_body(&mut self, prefers_html: bool) {
        if self.body.is_empty() && !self.json_value.is_null() {
            if prefers_html {
                self.render_html_body();
            } else {
                self.add_header(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                self.body = render_json_pretty(&self.json_value).into_bytes();
            }
        }

        if self.status.as_u16() >= 400 && self.body.is_empty() {
            self.body = self
                .status
                .canonical_reason()
                .unwrap_or("")
                .as_bytes()
                .to_vec();
        }

        if self.status == StatusCode::NO_CONTENT && !self.body.is_empty() {
            // A 204 must not carry content; dropping it beats writing an
            // invalid message.
            error!("response content provided but code was no-content");
            self.body.clear();
        }
    }

    fn render_html_body(&mut self) {
        let mut value = render_json_pretty(&self.json_value);
        value = escape_html(&value);
        value = convert_to_links(&value);
        self.body = format!(
            "<html>\n<head>\n<title>Management API</title>\n</head>\n<body>\n\
             <pre>\n<code class=\"json\">{value}</code>\n</pre>\n</body>\n</html>\n"
        )
        .into_bytes();
        self.add_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html;charset=UTF-8"),
        );
    }
}

fn render_json_pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

fn escape_html(data: &str) -> String {
    let mut buffer = String::with_capacity(data.len() * 11 / 10);
    for c in data.chars() {
        match c {
            '&' => buffer.push_str("&amp;"),
            '"' => buffer.push_str("&quot;"),
            '\'' => buffer.push_str("&apos;"),
            '<' => buffer.push_str("&lt;"),
            '>' => buffer.push_str("&gt;"),
            _ => buffer.push(c),
        }
    }
    buffer
}

/// Turns quoted absolute-path string values in the (already escaped) JSON
/// text into anchors, so the HTML rendering is navigable.
fn convert_to_links(s: &str) -> String {
    static API_PATH: OnceLock<Option<Regex>> = OnceLock::new();
    let re = API_PATH.get_or_init(|| Regex::new("(:[ \\n]*)(&quot;(/[^&\\n]*)&quot;)").ok());
    match re {
        Some(re) => re.replace_all(s, "$1<a href=\"$3\">$2</a>").into_owned(),
        None => s.to_owned(),
    }
}

/// Shared handle through which a routed handler completes its response,
/// either synchronously or from a deferred continuation holding a clone.
///
/// Completion fires exactly once: on the first explicit [`end`] or, at the
/// latest, when the final clone drops.
///
/// [`end`]: AsyncResponse::end
pub struct AsyncResponse {
    response: RefCell<Response>,
    tx: Cell<Option<oneshot::Sender<Response>>>,
    liveness: Liveness,
}

impl AsyncResponse {
    /// Wraps a response and returns the shared handle plus the receiver
    /// that resolves with the finished response.
    #[must_use]
    pub fn channel(
        response: Response,
        liveness: Liveness,
    ) -> (Rc<Self>, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (
            Rc::new(Self {
                response: RefCell::new(response),
                tx: Cell::new(Some(tx)),
                liveness,
            }),
            rx,
        )
    }

    /// Mutable access to the response under construction.
    ///
    /// Do not hold the guard across an await point.
    pub fn response(&self) -> RefMut<'_, Response> {
        self.response.borrow_mut()
    }

    /// True while the owning connection is still open.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    /// Completes the request. Subsequent calls (and the final drop) are
    /// no-ops.
    pub fn end(&self) {
        let Some(tx) = self.tx.take() else {
            debug!("async response ended twice");
            return;
        };
        let mut response = self.response.borrow_mut().take();
        response.end();
        let _ = tx.send(response);
    }
}

impl Drop for AsyncResponse {
    fn drop(&mut self) {
        self.end();
    }
}
