//! The acceptor: listener, signal handling, the 1-Hz timer tick and the
//! optional user tick hook.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use http::HeaderValue;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::conn;
use crate::date;
use crate::error::Error;
use crate::middleware::MiddlewareChain;
use crate::router::Router;
use crate::timer::TimerQueue;

/// State shared by every connection task on the reactor.
pub(crate) struct ServerShared<C> {
    pub(crate) router: Rc<Router>,
    pub(crate) middlewares: Rc<C>,
    pub(crate) timer_queue: Rc<RefCell<TimerQueue>>,
    pub(crate) server_name: HeaderValue,
}

pub(crate) enum ListenerSource {
    Bind { addr: String, port: u16 },
    /// A pre-opened listening socket taken over from the environment.
    Existing(std::net::TcpListener),
}

pub(crate) struct ServerSettings {
    pub(crate) listener: ListenerSource,
    pub(crate) server_name: HeaderValue,
    pub(crate) tick: Option<(Duration, Box<dyn FnMut()>)>,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<crate::tls::TlsSource>,
}

#[cfg(feature = "tls")]
struct TlsState {
    source: crate::tls::TlsSource,
    acceptor: Rc<RefCell<tokio_rustls::TlsAcceptor>>,
}

/// Runs the accept loop until a stop is requested or a termination signal
/// arrives. Must run inside a `LocalSet` on the reactor thread.
pub(crate) async fn serve<C: MiddlewareChain>(
    router: Router,
    middlewares: Rc<C>,
    mut settings: ServerSettings,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    // Load the TLS context up front so certificate problems fail the
    // startup instead of the first connection.
    #[cfg(feature = "tls")]
    let tls = match settings.tls.take() {
        Some(source) => {
            let acceptor = crate::tls::build_acceptor(&source)?;
            Some(TlsState {
                source,
                acceptor: Rc::new(RefCell::new(acceptor)),
            })
        }
        None => None,
    };

    let listener = match settings.listener {
        ListenerSource::Bind { addr, port } => TcpListener::bind((addr.as_str(), port))
            .await
            .map_err(Error::new_bind)?,
        ListenerSource::Existing(std_listener) => {
            std_listener.set_nonblocking(true).map_err(Error::new_bind)?;
            TcpListener::from_std(std_listener).map_err(Error::new_bind)?
        }
    };

    let shared = Rc::new(ServerShared {
        router: Rc::new(router),
        middlewares,
        timer_queue: Rc::new(RefCell::new(TimerQueue::new())),
        server_name: settings.server_name,
    });

    date::update();
    match listener.local_addr() {
        Ok(endpoint) => info!(%endpoint, "server is running"),
        Err(_) => info!("server is running"),
    }
    for pattern in shared.router.routes() {
        debug!(pattern, "serving route");
    }

    // The global tick that drives deadline expiry.
    let timer_queue = shared.timer_queue.clone();
    let timer_task = tokio::task::spawn_local(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            timer_queue.borrow_mut().process();
        }
    });

    let tick_task = settings.tick.take().map(|(period, mut tick)| {
        tokio::task::spawn_local(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick();
            }
        })
    });

    let mut sigint = signal(SignalKind::interrupt()).map_err(Error::new_runtime)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(Error::new_runtime)?;
    let mut sighup = signal(SignalKind::hangup()).map_err(Error::new_runtime)?;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    let shared = shared.clone();
                    #[cfg(feature = "tls")]
                    if let Some(tls) = &tls {
                        let acceptor = tls.acceptor.borrow().clone();
                        tokio::task::spawn_local(conn::serve_tls(stream, acceptor, shared));
                        continue;
                    }
                    tokio::task::spawn_local(conn::serve(stream, shared));
                }
                Err(err) => {
                    // Transient accept failures re-arm immediately.
                    debug!(error = %err, "accept failed");
                }
            },
            _ = sigint.recv() => {
                info!("received SIGINT, stopping");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, stopping");
                break;
            }
            _ = sighup.recv() => {
                #[cfg(feature = "tls")]
                reload_certificate(&tls);
                #[cfg(not(feature = "tls"))]
                info!("received reload signal, no TLS context to reload");
            }
            _ = shutdown.wait_for(|stopped| *stopped) => {
                info!("stop requested");
                break;
            }
        }
    }

    timer_task.abort();
    if let Some(tick_task) = tick_task {
        tick_task.abort();
    }
    Ok(())
}

#[cfg(feature = "tls")]
fn reload_certificate(tls: &Option<TlsState>) {
    let Some(tls) = tls else {
        info!("received reload signal, no TLS context to reload");
        return;
    };
    info!("received reload signal, rebuilding TLS context");
    match crate::tls::build_acceptor(&tls.source) {
        Ok(acceptor) => *tls.acceptor.borrow_mut() = acceptor,
        Err(err) => {
            tracing::error!(error = %err, "certificate reload failed, keeping the previous context");
        }
    }
}
