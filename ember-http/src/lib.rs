//! Embedded HTTP/1.1 serving engine for device management APIs.
//!
//! `ember-http` is the request-processing core used to expose a
//! Redfish-style management API from a constrained device: a
//! single-threaded cooperative reactor that accepts TCP (optionally TLS)
//! connections, parses HTTP/1.1 requests, dispatches them through a
//! parameterized route trie, runs a statically composed middleware chain,
//! and writes responses with keep-alive, per-connection deadline timers
//! and an explicit completion protocol for deferred handlers.
//!
//! The composition root is [`App`]: register routes with the [`route!`]
//! macro (pattern tags are computed at compile time), add middleware as a
//! tuple, then [`App::run`] blocks on a current-thread runtime until
//! [`App::stop`] or a termination signal.
//!
//! ```no_run
//! use ember_http::{App, route};
//!
//! let mut app = App::new();
//! route!(app, "/thermal/<uint>/reading").handle(|_req, res, zone: u64| {
//!     res.response().json_value = serde_json::json!({ "Zone": zone });
//!     res.end();
//! });
//! app.port(8080).run().unwrap();
//! ```
//!
//! WebSocket upgrades are handed off through [`router::RuleBuilder::upgrade`];
//! the companion `ember-ws` crate builds the session lifetime on top of it.

pub mod app;
pub mod error;
pub mod middleware;
pub mod params;
pub mod request;
pub mod response;
pub mod router;
pub mod timer;

#[cfg(feature = "tls")]
pub mod tls;

mod conn;
mod date;
mod h1;
mod server;

pub use app::{App, StopHandle};
pub use error::Error;
pub use middleware::{Middleware, MiddlewareChain, Prior};
pub use request::{HeaderLookup, QueryParams, Request, UserSession};
pub use response::{AsyncResponse, Liveness, Response};
pub use router::{Adaptor, BoxedAdaptor, Router, RuleBuilder};

/// HTTP vocabulary types, re-exported for handler signatures.
pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
