//! WebSocket sessions for the ember serving engine.
//!
//! After the HTTP engine recognizes an `Upgrade: websocket` request on a
//! route registered with an upgrade handler, the socket adaptor is moved
//! out of the connection loop. This crate builds the successor lifetime
//! on top of that handoff: the RFC 6455 accept handshake (with the fixed
//! security header set), the frame protocol, and the [`Session`] driving
//! the open/message/close callbacks with a single-writer outbound queue.
//!
//! Routes opt in through [`WebSocketRouteExt`]:
//!
//! ```no_run
//! use ember_http::{route, App};
//! use ember_ws::WebSocketRouteExt;
//!
//! let mut app = App::new();
//! route!(app, "/console").websocket(|ws| {
//!     ws.onopen(|_session, _res| tracing::info!("console attached"))
//!         .onmessage(|session, payload, _is_text| {
//!             session.send_binary(payload.to_vec());
//!         })
//!         .onclose(|_session, reason| tracing::info!(reason, "console detached"))
//! });
//! ```

mod handshake;
mod protocol;
mod session;

pub use protocol::ProtocolError;
pub use session::{Session, WebSocketBuilder, WebSocketRouteExt};
