//! The composition root: route registration, listener and TLS
//! configuration, middleware access, and the blocking reactor entry.

use std::any::Any;
use std::rc::Rc;
use std::time::Duration;

use http::HeaderValue;
use tokio::sync::watch;

use crate::error::Error;
use crate::middleware::MiddlewareChain;
use crate::router::{Router, RuleBuilder};
use crate::server::{self, ListenerSource, ServerSettings};

const DEFAULT_SERVER_NAME: &str = "ember";

/// Registers a route with its parameter tag computed at compile time
/// from the pattern literal; a malformed pattern fails the build.
///
/// ```no_run
/// # use ember_http::{App, route};
/// # let mut app = App::new();
/// route!(app, "/chassis/<str>/power").handle(|_req, res, name: String| {
///     res.response().json_value = serde_json::json!({ "Chassis": name });
///     res.end();
/// });
/// ```
#[macro_export]
macro_rules! route {
    ($app:expr, $pattern:literal) => {
        $app.route_tagged::<{ $crate::params::parameter_tag($pattern) }>($pattern)
    };
}

/// An embedded HTTP application: router, middleware stack, listener
/// configuration and the reactor lifecycle.
///
/// The type parameter is the middleware tuple; [`App::new`] builds an
/// application without middleware.
pub struct App<C: MiddlewareChain = ()> {
    router: Router,
    middlewares: Rc<C>,
    bindaddr: String,
    port: Option<u16>,
    existing: Option<std::net::TcpListener>,
    server_name: HeaderValue,
    tick: Option<(Duration, Box<dyn FnMut()>)>,
    #[cfg(feature = "tls")]
    tls: Option<crate::tls::TlsSource>,
    stop: watch::Sender<bool>,
}

impl App<()> {
    /// An application without middleware.
    #[must_use]
    pub fn new() -> Self {
        Self::with_middlewares(())
    }
}

impl Default for App<()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: MiddlewareChain> App<C> {
    /// An application wrapping every request in the given middleware
    /// tuple, in order.
    #[must_use]
    pub fn with_middlewares(middlewares: C) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            router: Router::new(),
            middlewares: Rc::new(middlewares),
            bindaddr: "::".to_owned(),
            port: None,
            existing: None,
            server_name: HeaderValue::from_static(DEFAULT_SERVER_NAME),
            tick: None,
            #[cfg(feature = "tls")]
            tls: None,
            stop,
        }
    }

    /// Registers a route whose tag was computed at compile time; prefer
    /// the [`route!`] macro, which derives the tag from the literal.
    pub fn route_tagged<const TAG: u64>(&mut self, pattern: &str) -> RuleBuilder<'_> {
        self.router.new_rule_tagged::<TAG>(pattern)
    }

    /// Registers a route from a pattern only known at runtime; the tag
    /// is computed and checked at [`validate`](Self::validate).
    pub fn route_dynamic(&mut self, pattern: &str) -> RuleBuilder<'_> {
        self.router.new_rule_dynamic(pattern)
    }

    pub fn port(&mut self, port: u16) -> &mut Self {
        self.port = Some(port);
        self
    }

    pub fn bindaddr(&mut self, bindaddr: impl Into<String>) -> &mut Self {
        self.bindaddr = bindaddr.into();
        self
    }

    /// Takes over a pre-opened listening socket instead of binding.
    pub fn socket(&mut self, listener: std::net::TcpListener) -> &mut Self {
        self.existing = Some(listener);
        self
    }

    /// Value of the `Server` response header.
    pub fn server_name(&mut self, name: HeaderValue) -> &mut Self {
        self.server_name = name;
        self
    }

    /// Installs a periodic hook driven by the reactor.
    pub fn tick<F>(&mut self, period: Duration, tick: F) -> &mut Self
    where
        F: FnMut() + 'static,
    {
        self.tick = Some((period, Box::new(tick)));
        self
    }

    /// Serves TLS with a certificate and key PEM file pair.
    #[cfg(feature = "tls")]
    pub fn ssl_file(
        &mut self,
        cert: impl Into<std::path::PathBuf>,
        key: impl Into<std::path::PathBuf>,
    ) -> &mut Self {
        self.tls = Some(crate::tls::TlsSource::Files {
            cert: cert.into(),
            key: key.into(),
        });
        self
    }

    /// Serves TLS with a combined PEM carrying both chain and key.
    #[cfg(feature = "tls")]
    pub fn ssl_pem(&mut self, pem: impl Into<std::path::PathBuf>) -> &mut Self {
        self.tls = Some(crate::tls::TlsSource::CombinedPem(pem.into()));
        self
    }

    /// Serves TLS with an injected rustls configuration.
    #[cfg(feature = "tls")]
    pub fn ssl(&mut self, config: std::sync::Arc<rustls::ServerConfig>) -> &mut Self {
        self.tls = Some(crate::tls::TlsSource::Config(config));
        self
    }

    /// Serves TLS with a certificate generated at startup; for devices
    /// that have not been provisioned with one yet.
    #[cfg(feature = "tls")]
    pub fn ssl_self_signed(&mut self) -> &mut Self {
        self.tls = Some(crate::tls::TlsSource::SelfSigned);
        self
    }

    /// The process-wide instance of a middleware in the stack.
    #[must_use]
    pub fn get_middleware<T: Any>(&self) -> Option<&T> {
        self.middlewares.find::<T>()
    }

    /// Validates every registered route. Idempotent; [`run`](Self::run)
    /// calls it implicitly.
    pub fn validate(&mut self) -> Result<(), Error> {
        self.router.validate()
    }

    /// Blocks on the reactor until [`stop`](Self::stop) or a
    /// termination signal. All I/O, timers and handlers run on the
    /// calling thread.
    pub fn run(&mut self) -> Result<(), Error> {
        self.validate()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::new_runtime)?;
        let local = tokio::task::LocalSet::new();

        let listener = match self.existing.take() {
            Some(listener) => ListenerSource::Existing(listener),
            None => ListenerSource::Bind {
                addr: self.bindaddr.clone(),
                port: self.resolved_port(),
            },
        };
        let settings = ServerSettings {
            listener,
            server_name: self.server_name.clone(),
            tick: self.tick.take(),
            #[cfg(feature = "tls")]
            tls: self.tls.clone(),
        };
        let router = std::mem::take(&mut self.router);
        let middlewares = self.middlewares.clone();
        let shutdown = self.stop.subscribe();

        runtime.block_on(local.run_until(server::serve(router, middlewares, settings, shutdown)))
    }

    /// Requests a stop; safe from any thread holding a
    /// [`StopHandle`], and from handlers on the reactor itself.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// A cloneable, `Send` handle that stops the running application.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    fn resolved_port(&self) -> u16 {
        if let Some(port) = self.port {
            return port;
        }
        #[cfg(feature = "tls")]
        if self.tls.is_some() {
            return 443;
        }
        80
    }
}

/// Stops a running [`App`] from another thread.
#[derive(Clone)]
pub struct StopHandle(watch::Sender<bool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{Middleware, Prior};
    use crate::request::Request;
    use crate::response::Response;

    struct Tagger;

    #[derive(Default)]
    struct TagCtx;

    impl Middleware for Tagger {
        type Context = TagCtx;

        fn before_handle(
            &self,
            _req: &mut Request,
            _res: &mut Response,
            _ctx: &mut Self::Context,
            _prior: &Prior<'_>,
        ) {
        }
    }

    fn assert_send<T: Send>() {}

    #[test]
    fn stop_handle_is_send() {
        assert_send::<StopHandle>();
    }

    #[test]
    fn default_port_is_plain_http() {
        let app = App::new();
        assert_eq!(app.resolved_port(), 80);
        let mut app = App::new();
        app.port(8443);
        assert_eq!(app.resolved_port(), 8443);
    }

    #[cfg(feature = "tls")]
    #[test]
    fn default_port_switches_with_tls() {
        let mut app = App::new();
        app.ssl_self_signed();
        assert_eq!(app.resolved_port(), 443);
    }

    #[test]
    fn get_middleware_returns_the_stack_instance() {
        let app = App::with_middlewares((Tagger,));
        assert!(app.get_middleware::<Tagger>().is_some());
        let plain = App::new();
        assert!(plain.get_middleware::<Tagger>().is_none());
    }

    #[test]
    fn validate_surfaces_route_errors() {
        let mut app = App::new();
        app.route_dynamic("/broken/<wat>")
            .handle(|_req: &Request, res: std::rc::Rc<crate::response::AsyncResponse>| res.end());
        assert!(app.validate().is_err());
    }

    #[test]
    fn route_macro_computes_the_tag() {
        let mut app = App::new();
        route!(app, "/fans/<uint>/speed").handle(
            |_req: &Request, res: std::rc::Rc<crate::response::AsyncResponse>, _fan: u64| {
                res.end();
            },
        );
        app.validate().unwrap();
    }
}
