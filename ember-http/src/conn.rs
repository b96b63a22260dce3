//! The per-socket state machine.
//!
//! One task owns one connection: optional TLS handshake, then the
//! keep-alive loop of read headers → read body → dispatch → write. Every
//! read or write is bracketed by a deadline entry in the shared timer
//! queue; the deadline callback trips the close signal and the pending
//! operation completes with a timeout error, which drives the normal
//! teardown path. A successful websocket upgrade moves the socket out of
//! the loop instead; the task ending is the connection's destruction.

use std::cell::Cell;
use std::rc::Rc;

use bytes::{Buf, Bytes, BytesMut};
use http::header;
use http::{StatusCode, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, error, info, trace};

use crate::date;
use crate::error::{Error, Parse};
use crate::h1::{self, BodyFraming, ChunkedDecoder, ParseStatus};
use crate::middleware::MiddlewareChain;
use crate::request::{Request, UserSession};
use crate::response::{AsyncResponse, Liveness, Response};
use crate::router::Adaptor;
use crate::server::ServerShared;

/// Flag tripped by the deadline callback (or a peer reset discovered
/// elsewhere) to abort the connection's pending I/O.
pub(crate) struct CloseSignal {
    closed: Cell<bool>,
    notify: Notify,
}

impl CloseSignal {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            closed: Cell::new(false),
            notify: Notify::new(),
        })
    }

    pub(crate) fn close(&self) {
        self.closed.set(true);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub(crate) async fn wait(&self) {
        while !self.closed.get() {
            self.notify.notified().await;
        }
    }
}

pub(crate) struct Connection<A, C> {
    stream: A,
    buffer: BytesMut,
    shared: Rc<ServerShared<C>>,
    close: Rc<CloseSignal>,
    liveness: Liveness,
    timer_key: Option<u64>,
    session: Option<Rc<UserSession>>,
}

impl<A, C> Connection<A, C>
where
    A: Adaptor,
    C: MiddlewareChain,
{
    pub(crate) fn new(
        stream: A,
        shared: Rc<ServerShared<C>>,
        session: Option<Rc<UserSession>>,
    ) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(h1::MAX_HEAD_BYTES),
            shared,
            close: CloseSignal::new(),
            liveness: Liveness::new_alive(),
            timer_key: None,
            session,
        }
    }

    pub(crate) async fn run(mut self) {
        trace!("connection open");
        loop {
            let head = match self.read_head().await {
                Ok(Some(head)) => head,
                Ok(None) => break,
                Err(err) => {
                    self.finish_with_error(err, Version::HTTP_11).await;
                    break;
                }
            };
            let version = head.version;

            let framing = match h1::body_framing(&head.headers) {
                Ok(framing) => framing,
                Err(err) => {
                    self.finish_with_error(err, version).await;
                    break;
                }
            };
            let body = match self.read_body(framing).await {
                Ok(body) => body,
                Err(err) => {
                    self.finish_with_error(err, version).await;
                    break;
                }
            };

            let keep_alive = h1::keep_alive(version, &head.headers);
            let mut req = Request::new(
                head.method,
                version,
                head.target,
                head.headers,
                body,
                keep_alive,
            );
            req.session = self.session.clone();
            info!(
                method = %req.method,
                uri = %req.target,
                version = req.version_number(),
                "request"
            );

            let mut res = Response::new();
            let mut close_after = false;
            let mut ctx = C::Context::default();
            let mut run_afters = false;

            let host_missing = version == Version::HTTP_11
                && req.header(&header::HOST).is_none_or(str::is_empty);
            if host_missing {
                res.set_status(StatusCode::BAD_REQUEST);
                res.end();
                close_after = true;
            } else {
                req.route_privileges = self.shared.router.required_privileges(&req.path);
                let short_circuited =
                    self.shared
                        .middlewares
                        .run_before(&mut req, &mut res, &mut ctx);
                if !short_circuited {
                    if req.is_websocket_upgrade() && self.shared.router.can_upgrade(&req.path) {
                        debug!(path = %req.path, "handing socket to upgrade handler");
                        let Self { stream, shared, .. } = self;
                        if shared.router.handle_upgrade(req, Box::new(stream)).is_err() {
                            debug!("upgrade rule disappeared during handoff");
                        }
                        return;
                    }

                    run_afters = true;
                    let (handle, rx) = AsyncResponse::channel(res, self.liveness.clone());
                    let router = self.shared.router.clone();
                    let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        router.handle(&req, handle);
                    }))
                    .is_err();
                    res = if panicked {
                        error!(path = %req.path, "handler panicked");
                        let mut res = Response::new();
                        res.set_status(StatusCode::INTERNAL_SERVER_ERROR);
                        res.end();
                        close_after = true;
                        res
                    } else {
                        match rx.await {
                            Ok(res) => res,
                            Err(_) => break,
                        }
                    };
                }
            }

            if run_afters {
                self.shared
                    .middlewares
                    .run_after(&mut req, &mut res, &mut ctx);
            }

            if self.close.is_closed() {
                // The socket died while the handler was running; the
                // response has nowhere to go.
                debug!("dropping response for a dead connection");
                break;
            }

            res.finalize_body(req.prefers_html());
            res.add_header(header::SERVER, self.shared.server_name.clone());
            res.add_header(header::DATE, date::update_and_header_value());
            res.keep_alive = keep_alive && !close_after;

            let mut out = Vec::with_capacity(res.body().len() + 256);
            h1::encode_response(&res, version, &mut out);
            if let Err(err) = self.write_all(&out).await {
                debug!(error = %err, "write failed");
                break;
            }
            info!(
                status = res.status().as_u16(),
                keep_alive = res.keep_alive,
                "response"
            );

            if !res.keep_alive {
                break;
            }
            // Fresh parser state for the next request; bytes pipelined
            // past the current request are dropped.
            self.buffer.clear();
        }
        self.finish().await;
    }

    async fn read_head(&mut self) -> Result<Option<h1::Head>, Error> {
        loop {
            if !self.buffer.is_empty() {
                if let ParseStatus::Complete(head, consumed) = h1::parse_head(&self.buffer)? {
                    self.buffer.advance(consumed);
                    return Ok(Some(head));
                }
            }
            let n = self.read_some().await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    // Clean close between requests.
                    return Ok(None);
                }
                return Err(Error::new_parse(Parse::Header));
            }
        }
    }

    async fn read_body(&mut self, framing: BodyFraming) -> Result<Bytes, Error> {
        match framing {
            BodyFraming::None => Ok(Bytes::new()),
            BodyFraming::ContentLength(length) => {
                if length > h1::MAX_BODY_BYTES as u64 {
                    return Err(Error::new_body_too_large());
                }
                let length = length as usize;
                while self.buffer.len() < length {
                    let n = self.read_some().await?;
                    if n == 0 {
                        return Err(Error::new_io(std::io::ErrorKind::UnexpectedEof.into()));
                    }
                }
                Ok(self.buffer.split_to(length).freeze())
            }
            BodyFraming::Chunked => {
                let mut decoder = ChunkedDecoder::new();
                let mut out = Vec::new();
                loop {
                    if decoder.decode(&mut self.buffer, &mut out, h1::MAX_BODY_BYTES)? {
                        return Ok(out.into());
                    }
                    let n = self.read_some().await?;
                    if n == 0 {
                        return Err(Error::new_io(std::io::ErrorKind::UnexpectedEof.into()));
                    }
                }
            }
        }
    }

    async fn read_some(&mut self) -> Result<usize, Error> {
        self.start_deadline();
        let result = tokio::select! {
            biased;
            _ = self.close.wait() => Err(Error::new_timed_out()),
            r = self.stream.read_buf(&mut self.buffer) => r.map_err(Error::new_io),
        };
        self.cancel_deadline();
        result
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        self.start_deadline();
        let result = tokio::select! {
            biased;
            _ = self.close.wait() => Err(Error::new_timed_out()),
            r = self.stream.write_all(data) => r.map_err(Error::new_io),
        };
        self.cancel_deadline();
        result
    }

    fn start_deadline(&mut self) {
        self.cancel_deadline();
        let close = self.close.clone();
        let key = self
            .shared
            .timer_queue
            .borrow_mut()
            .add(Box::new(move || close.close()));
        self.timer_key = Some(key);
    }

    fn cancel_deadline(&mut self) {
        if let Some(key) = self.timer_key.take() {
            self.shared.timer_queue.borrow_mut().cancel(key);
        }
    }

    /// Writes an error response when one can still be written; I/O and
    /// deadline failures tear the connection down silently.
    async fn finish_with_error(&mut self, err: Error, version: Version) {
        let status = if err.is_body_too_large() {
            Some(StatusCode::PAYLOAD_TOO_LARGE)
        } else if err.is_parse() {
            Some(StatusCode::BAD_REQUEST)
        } else {
            if err.is_timed_out() {
                debug!("connection idled past the deadline");
            } else {
                debug!(error = %err, "connection error");
            }
            return;
        };

        let Some(status) = status.filter(|_| !self.close.is_closed()) else {
            return;
        };
        debug!(error = %err, status = status.as_u16(), "rejecting request");
        let mut res = Response::new();
        res.set_status(status);
        res.keep_alive = false;
        res.finalize_body(false);
        res.add_header(header::SERVER, self.shared.server_name.clone());
        res.add_header(header::DATE, date::update_and_header_value());
        let mut out = Vec::new();
        h1::encode_response(&res, version, &mut out);
        if let Err(err) = self.write_all(&out).await {
            debug!(error = %err, "error response write failed");
        }
    }

    async fn finish(mut self) {
        self.liveness.mark_closed();
        self.cancel_deadline();
        let _ = self.stream.shutdown().await;
        trace!("connection closed");
    }
}

/// Serves one plain TCP connection to completion.
pub(crate) async fn serve<A, C>(stream: A, shared: Rc<ServerShared<C>>)
where
    A: Adaptor,
    C: MiddlewareChain,
{
    Connection::new(stream, shared, None).run().await;
}

/// Performs the TLS handshake under a deadline, then serves the encrypted
/// stream. Handshake failures are logged and the socket is dropped.
#[cfg(feature = "tls")]
pub(crate) async fn serve_tls<C>(
    stream: tokio::net::TcpStream,
    acceptor: tokio_rustls::TlsAcceptor,
    shared: Rc<ServerShared<C>>,
) where
    C: MiddlewareChain,
{
    let close = CloseSignal::new();
    let key = {
        let close = close.clone();
        shared
            .timer_queue
            .borrow_mut()
            .add(Box::new(move || close.close()))
    };
    let handshake = tokio::select! {
        biased;
        _ = close.wait() => Err(std::io::ErrorKind::TimedOut.into()),
        r = acceptor.accept(stream) => r,
    };
    shared.timer_queue.borrow_mut().cancel(key);

    match handshake {
        Ok(stream) => {
            let session = crate::tls::session_from_stream(&stream).map(Rc::new);
            Connection::new(stream, shared, session).run().await;
        }
        Err(err) => {
            // No response is possible before the handshake completes.
            debug!(error = %err, "TLS handshake failed");
        }
    }
}
