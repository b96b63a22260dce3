//! An embedded HTTP/1.1 + WebSocket serving framework for device
//! management APIs.
//!
//! `ember` re-exports the engine (`ember-http`) and the websocket
//! successor lifetime (`ember-ws`) behind one crate:
//!
//! ```no_run
//! use ember::{route, App, WebSocketRouteExt};
//!
//! let mut app = App::new();
//!
//! route!(app, "/thermal/<uint>/reading").handle(|_req, res, zone: u64| {
//!     res.response().json_value = serde_json::json!({ "Zone": zone });
//!     res.end();
//! });
//!
//! route!(app, "/console").websocket(|ws| {
//!     ws.onmessage(|session, payload, _is_text| session.send_binary(payload.to_vec()))
//! });
//!
//! app.port(8080).run().unwrap();
//! ```

pub use ember_http::{
    route, App, AsyncResponse, Error, HeaderMap, HeaderName, HeaderValue, Liveness, Method,
    Middleware, MiddlewareChain, Prior, QueryParams, Request, Response, Router, RuleBuilder,
    StatusCode, StopHandle, UserSession, Version,
};

/// Engine internals, for embedders that need more than the facade.
pub use ember_http as engine;

pub use ember_ws::{ProtocolError, Session, WebSocketBuilder, WebSocketRouteExt};

/// Pattern-tag utilities backing the [`route!`] macro.
pub use ember_http::params;

#[cfg(feature = "tls")]
pub use ember_http::tls;
