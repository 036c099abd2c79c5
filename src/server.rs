use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::Bootstrap;
use crate::fetch::OriginFetcher;
use crate::metrics;
use crate::mirror::{text_response, Body, MirrorHandler, MirrorOptions};
use crate::store::local::LocalStore;
use crate::store::ObjectStore;

const LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "127.1", "::1"];

pub async fn run(cfg: Arc<Bootstrap>) -> Result<()> {
    let handler = build_handler(&cfg)?;

    let addr = bind_addr(&cfg.server.addr)?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    log::info!("listen on {addr}");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(shutdown_tx);

    serve(listener, shutdown_rx, handler).await
}

pub fn build_handler(cfg: &Bootstrap) -> Result<Arc<MirrorHandler>> {
    let remote_cache: Option<Arc<dyn ObjectStore>> = match &cfg.storage {
        None => None,
        Some(storage) => match storage.driver.as_str() {
            "" | "local" => Some(Arc::new(LocalStore::new(&storage.root))),
            other => return Err(anyhow!("unknown storage.driver {other:?}")),
        },
    };

    Ok(MirrorHandler::new(MirrorOptions {
        fetcher: OriginFetcher::with_redirect_limit(cfg.upstream.redirect_limit),
        remote_cache,
        link_expires: cfg.mirror.link_expires,
        base_domain: cfg.mirror.base_domain.clone(),
        host_from_first_path: cfg.mirror.host_from_first_path,
        block_suffixes: cfg.mirror.block_suffixes.clone(),
        check_sync_timeout: cfg.mirror.check_sync_timeout,
        no_redirect: cfg.mirror.no_redirect,
        tee_response: cfg.mirror.tee_response,
        local_cache_dir: cfg.mirror.local_cache_dir.clone(),
        orchestrator: None,
        not_found: None,
    }))
}

fn bind_addr(addr: &str) -> Result<SocketAddr> {
    let addr = addr.trim();
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    normalized.parse().context("parse server.addr")
}

fn spawn_signal_handlers(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();
        tokio::select! {
            _ = async {
                if let Some(sig) = sigterm.as_mut() {
                    let _ = sig.recv().await;
                } else {
                    std::future::pending::<()>().await;
                }
            } => {}
            _ = async {
                if let Some(sig) = sigint.as_mut() {
                    let _ = sig.recv().await;
                } else {
                    std::future::pending::<()>().await;
                }
            } => {}
        }
        log::info!("shutdown signal received");
        let _ = shutdown.send(true);
    });
}

async fn serve(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    handler: Arc<MirrorHandler>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, _) = res.context("accept tcp")?;
                let io = TokioIo::new(stream);
                let handler = Arc::clone(&handler);

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let handler = Arc::clone(&handler);
                        async move { Ok::<_, Infallible>(route(req, handler).await) }
                    });
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::error!("http connection error: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn route(req: Request<Incoming>, handler: Arc<MirrorHandler>) -> Response<Body> {
    if is_local_request(&req) {
        return handle_internal(&req);
    }
    handler.handle(req).await
}

fn is_local_request(req: &Request<Incoming>) -> bool {
    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let host = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
    LOCAL_HOSTS.contains(&host)
}

fn handle_internal(req: &Request<Incoming>) -> Response<Body> {
    let path = req.uri().path();
    if path == "/healthz" || path.starts_with("/healthz/") {
        return text_response(StatusCode::OK, "ok");
    }
    if path == "/metrics" {
        return text_response(StatusCode::OK, &metrics::render());
    }
    text_response(StatusCode::NOT_FOUND, "not found")
}
