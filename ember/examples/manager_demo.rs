//! A small management-API service exercising routes, middleware, the
//! periodic tick and a websocket console.
//!
//! # Run the example
//!
//! ```sh
//! cargo run --example manager_demo
//! ```
//!
//! The server listens on `127.0.0.1:62700`:
//!
//! ```sh
//! curl http://127.0.0.1:62700/v1/thermal/0/reading
//! curl -X POST http://127.0.0.1:62700/v1/chassis/tray7/reset
//! ```

use std::time::Duration;

use ember::{route, App, Middleware, Prior, Request, Response, WebSocketRouteExt};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Logs every request with the time the handler took.
struct RequestTimer;

#[derive(Default)]
struct Started {
    at: Option<std::time::Instant>,
}

impl Middleware for RequestTimer {
    type Context = Started;

    fn before_handle(
        &self,
        _req: &mut Request,
        _res: &mut Response,
        ctx: &mut Self::Context,
        _prior: &Prior<'_>,
    ) {
        ctx.at = Some(std::time::Instant::now());
    }

    fn after_handle(
        &self,
        req: &mut Request,
        res: &mut Response,
        ctx: &mut Self::Context,
        _prior: &Prior<'_>,
    ) {
        let elapsed = ctx.at.map(|at| at.elapsed()).unwrap_or_default();
        info!(
            uri = %req.target,
            status = res.status().as_u16(),
            ?elapsed,
            "handled"
        );
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::DEBUG.into())
                .from_env_lossy(),
        )
        .init();

    let mut app = App::with_middlewares((RequestTimer,));

    route!(app, "/v1/thermal/<uint>/reading").handle(|_req, res, zone: u64| {
        res.response().json_value = serde_json::json!({
            "Zone": zone,
            "ReadingCelsius": 42.5,
        });
        res.end();
    });

    route!(app, "/v1/chassis/<str>/reset")
        .methods([ember::Method::POST])
        .privileges(["ConfigureManager"])
        .handle(|_req, res, name: String| {
            info!(chassis = %name, "reset requested");
            res.response().json_value = serde_json::json!({ "Chassis": name, "Reset": "ok" });
            res.end();
        });

    route!(app, "/console").websocket(|ws| {
        ws.onopen(|_session, _res| info!("console attached"))
            .onmessage(|session, payload, is_text| {
                if is_text {
                    session.send_text(String::from_utf8_lossy(payload).into_owned());
                } else {
                    session.send_binary(payload.to_vec());
                }
            })
            .onclose(|_session, reason| info!(reason, "console detached"))
    });

    app.tick(Duration::from_secs(30), || info!("tick"));

    app.port(62700).bindaddr("127.0.0.1");
    if let Err(err) = app.run() {
        tracing::error!(error = %err, "server exited with an error");
        std::process::exit(1);
    }
}
