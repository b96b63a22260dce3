//! The websocket session: the successor lifetime of an upgraded HTTP
//! connection.
//!
//! One task owns the socket for the rest of its life. Outbound messages
//! go through a queue drained by that task with a single write in flight
//! at a time, mirroring the HTTP connection's single-writer rule; user
//! callbacks run inline on the reactor and must not block.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::{Buf, BytesMut};
use ember_http::router::RuleBuilder;
use ember_http::{AsyncResponse, BoxedAdaptor, Liveness, Method, Request, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::handshake;
use crate::protocol::{
    apply_mask, encode_frame, parse_close_payload, validate_client_frame, FrameHeader, OpCode,
    ProtocolError, MAX_MESSAGE_BYTES,
};

/// A live websocket connection, as seen by the registered callbacks.
///
/// Cheap to clone through `Rc`; messages may be sent from any callback
/// or from deferred work spawned on the reactor.
pub struct Session {
    req: Request,
    out: RefCell<VecDeque<(OpCode, Vec<u8>)>>,
    wake: Notify,
    closing: Cell<bool>,
    userdata: RefCell<Option<Rc<dyn Any>>>,
}

impl Session {
    fn new(req: Request) -> Rc<Self> {
        Rc::new(Self {
            req,
            out: RefCell::new(VecDeque::new()),
            wake: Notify::new(),
            closing: Cell::new(false),
            userdata: RefCell::new(None),
        })
    }

    /// The upgrade request this session was created from.
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.req
    }

    pub fn send_text(&self, msg: impl Into<String>) {
        self.enqueue(OpCode::Text, msg.into().into_bytes());
    }

    pub fn send_binary(&self, msg: impl Into<Vec<u8>>) {
        self.enqueue(OpCode::Binary, msg.into());
    }

    /// Sends a normal close with the given reason; idempotent.
    pub fn close(&self, reason: &str) {
        if self.closing.replace(true) {
            return;
        }
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(reason.as_bytes());
        self.out.borrow_mut().push_back((OpCode::Close, payload));
        self.wake.notify_one();
    }

    /// Attaches caller state to the session.
    pub fn set_userdata(&self, data: Rc<dyn Any>) {
        *self.userdata.borrow_mut() = Some(data);
    }

    #[must_use]
    pub fn userdata(&self) -> Option<Rc<dyn Any>> {
        self.userdata.borrow().clone()
    }

    fn enqueue(&self, opcode: OpCode, payload: Vec<u8>) {
        if self.closing.get() {
            trace!("dropping websocket message queued after close");
            return;
        }
        self.out.borrow_mut().push_back((opcode, payload));
        self.wake.notify_one();
    }
}

type OpenHandler = Box<dyn Fn(&Rc<Session>, Rc<AsyncResponse>)>;
type MessageHandler = Box<dyn Fn(&Rc<Session>, &[u8], bool)>;
type CloseHandler = Box<dyn Fn(&Rc<Session>, &str)>;
type ErrorHandler = Box<dyn Fn(&Rc<Session>)>;

/// Callback configuration for one websocket route.
#[derive(Default)]
pub struct WebSocketBuilder {
    open: Option<OpenHandler>,
    message: Option<MessageHandler>,
    close: Option<CloseHandler>,
    error: Option<ErrorHandler>,
}

impl WebSocketBuilder {
    /// Called once the handshake completed. Reading begins when the
    /// given async handle completes, so the handler may defer (e.g. for
    /// an authorization round-trip) by holding a clone.
    #[must_use]
    pub fn onopen<F>(mut self, f: F) -> Self
    where
        F: Fn(&Rc<Session>, Rc<AsyncResponse>) + 'static,
    {
        self.open = Some(Box::new(f));
        self
    }

    /// Called with every complete message; `is_text` distinguishes text
    /// from binary payloads.
    #[must_use]
    pub fn onmessage<F>(mut self, f: F) -> Self
    where
        F: Fn(&Rc<Session>, &[u8], bool) + 'static,
    {
        self.message = Some(Box::new(f));
        self
    }

    /// Called when the peer closes, the connection dies, or a protocol
    /// violation tears the session down.
    #[must_use]
    pub fn onclose<F>(mut self, f: F) -> Self
    where
        F: Fn(&Rc<Session>, &str) + 'static,
    {
        self.close = Some(Box::new(f));
        self
    }

    /// Called on I/O or protocol errors, before the close callback.
    #[must_use]
    pub fn onerror<F>(mut self, f: F) -> Self
    where
        F: Fn(&Rc<Session>) + 'static,
    {
        self.error = Some(Box::new(f));
        self
    }
}

/// Binds a route's upgrade handler to a websocket session.
pub trait WebSocketRouteExt {
    /// Marks this route as a websocket endpoint; the closure configures
    /// the session callbacks.
    fn websocket<F>(self, configure: F)
    where
        F: FnOnce(WebSocketBuilder) -> WebSocketBuilder;
}

impl WebSocketRouteExt for RuleBuilder<'_> {
    fn websocket<F>(self, configure: F)
    where
        F: FnOnce(WebSocketBuilder) -> WebSocketBuilder,
    {
        let handlers = Rc::new(configure(WebSocketBuilder::default()));
        self.methods([Method::GET]).upgrade(move |req, adaptor| {
            let handlers = handlers.clone();
            tokio::task::spawn_local(run_session(req, adaptor, handlers));
        });
    }
}

struct MessageAssembly {
    opcode: Option<OpCode>,
    payload: Vec<u8>,
}

pub(crate) async fn run_session(
    req: Request,
    mut stream: BoxedAdaptor,
    handlers: Rc<WebSocketBuilder>,
) {
    let Some(response) = handshake::accept_response(&req) else {
        debug!("websocket upgrade without a usable key, dropping socket");
        return;
    };
    if let Err(err) = stream.write_all(&response).await {
        debug!(error = %err, "websocket accept write failed");
        return;
    }
    trace!("websocket accepted");

    let session = Session::new(req);

    if let Some(open) = &handlers.open {
        let (handle, rx) = AsyncResponse::channel(Response::new(), Liveness::new_alive());
        open(&session, handle);
        // Reading starts once the open handler releases its handle.
        let _ = rx.await;
    }

    let mut buf = BytesMut::with_capacity(4096);
    let mut assembly = MessageAssembly {
        opcode: None,
        payload: Vec::new(),
    };
    let mut close_sent = false;

    loop {
        if let Err(err) = flush_outbound(&session, &mut stream, &mut close_sent).await {
            debug!(error = %err, "websocket write failed");
            fire_error(&handlers, &session);
            fire_close(&handlers, &session, "");
            return;
        }

        tokio::select! {
            biased;
            _ = session.wake.notified() => continue,
            read = stream.read_buf(&mut buf) => match read {
                Ok(0) => {
                    debug!("websocket peer went away");
                    fire_close(&handlers, &session, "");
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(error = %err, "websocket read failed");
                    fire_error(&handlers, &session);
                    fire_close(&handlers, &session, "");
                    return;
                }
            },
        }

        match process_frames(
            &mut buf,
            &mut stream,
            &session,
            &handlers,
            &mut assembly,
            &mut close_sent,
        )
        .await
        {
            Ok(None) => {}
            Ok(Some(reason)) => {
                fire_close(&handlers, &session, &reason);
                return;
            }
            Err(err) => {
                debug!(error = %err, "websocket protocol error");
                if !close_sent {
                    let mut payload = close_code(&err).to_be_bytes().to_vec();
                    payload.extend_from_slice(err.to_string().as_bytes());
                    let mut frame = Vec::with_capacity(payload.len() + 4);
                    encode_frame(OpCode::Close, true, &payload, &mut frame);
                    let _ = stream.write_all(&frame).await;
                }
                fire_error(&handlers, &session);
                fire_close(&handlers, &session, &err.to_string());
                return;
            }
        }
    }
}

/// Consumes every complete frame in `buf`. Returns the close reason once
/// the peer closed the session.
async fn process_frames(
    buf: &mut BytesMut,
    stream: &mut BoxedAdaptor,
    session: &Rc<Session>,
    handlers: &WebSocketBuilder,
    assembly: &mut MessageAssembly,
    close_sent: &mut bool,
) -> Result<Option<String>, ProtocolError> {
    loop {
        let Some((header, header_len)) = FrameHeader::parse(buf)? else {
            return Ok(None);
        };
        validate_client_frame(&header)?;
        let total = header_len + header.payload_len as usize;
        if buf.len() < total {
            return Ok(None);
        }
        buf.advance(header_len);
        let mut payload = buf.split_to(header.payload_len as usize).to_vec();
        if let Some(key) = header.mask {
            apply_mask(&mut payload, key);
        }

        match header.opcode {
            OpCode::Ping => {
                // The pong rides the outbound queue like any other frame.
                session.out.borrow_mut().push_back((OpCode::Pong, payload));
            }
            OpCode::Pong => {}
            OpCode::Close => {
                let (_code, reason) = parse_close_payload(&payload);
                if !*close_sent {
                    let mut frame = Vec::with_capacity(payload.len() + 4);
                    encode_frame(OpCode::Close, true, &payload, &mut frame);
                    let _ = stream.write_all(&frame).await;
                    *close_sent = true;
                }
                return Ok(Some(reason));
            }
            OpCode::Text | OpCode::Binary => {
                if assembly.opcode.is_some() {
                    return Err(ProtocolError::InterleavedDataFrame);
                }
                if header.fin {
                    deliver(handlers, session, &payload, header.opcode == OpCode::Text)?;
                } else {
                    assembly.opcode = Some(header.opcode);
                    assembly.payload = payload;
                }
            }
            OpCode::Continuation => {
                let Some(opcode) = assembly.opcode else {
                    return Err(ProtocolError::UnexpectedContinuation);
                };
                if assembly.payload.len() + payload.len() > MAX_MESSAGE_BYTES {
                    return Err(ProtocolError::MessageTooLong {
                        size: assembly.payload.len() + payload.len(),
                        max_size: MAX_MESSAGE_BYTES,
                    });
                }
                assembly.payload.extend_from_slice(&payload);
                if header.fin {
                    let message = std::mem::take(&mut assembly.payload);
                    assembly.opcode = None;
                    deliver(handlers, session, &message, opcode == OpCode::Text)?;
                }
            }
        }
    }
}

fn deliver(
    handlers: &WebSocketBuilder,
    session: &Rc<Session>,
    payload: &[u8],
    is_text: bool,
) -> Result<(), ProtocolError> {
    if is_text && std::str::from_utf8(payload).is_err() {
        return Err(ProtocolError::InvalidUtf8);
    }
    if let Some(message) = &handlers.message {
        message(session, payload, is_text);
    }
    Ok(())
}

async fn flush_outbound(
    session: &Session,
    stream: &mut BoxedAdaptor,
    close_sent: &mut bool,
) -> std::io::Result<()> {
    loop {
        let next = session.out.borrow_mut().pop_front();
        let Some((opcode, payload)) = next else {
            return Ok(());
        };
        if *close_sent {
            trace!("discarding websocket frame queued after close");
            continue;
        }
        let mut frame = Vec::with_capacity(payload.len() + 10);
        encode_frame(opcode, true, &payload, &mut frame);
        stream.write_all(&frame).await?;
        if opcode == OpCode::Close {
            *close_sent = true;
        }
    }
}

fn fire_close(handlers: &WebSocketBuilder, session: &Rc<Session>, reason: &str) {
    if let Some(close) = &handlers.close {
        close(session, reason);
    }
}

fn fire_error(handlers: &WebSocketBuilder, session: &Rc<Session>) {
    if let Some(error) = &handlers.error {
        error(session);
    }
}

fn close_code(err: &ProtocolError) -> u16 {
    match err {
        ProtocolError::MessageTooLong { .. } => 1009,
        ProtocolError::InvalidUtf8 => 1007,
        _ => 1002,
    }
}
