//! HTTP server: shared handler state and request dispatch.

use std::convert::Infallible;
use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{debug, info};
use thiserror::Error;

use super::admission::AdmissionGate;
use super::artifacts::ResolvedArtifacts;
use super::engine::SharedEngine;
use super::response_helpers::{cors_preflight, json_error};
use super::routes;

/// Everything a request handler needs. Cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub gate: AdmissionGate,
    pub engine: SharedEngine,
    pub artifacts: Arc<ResolvedArtifacts>,
    pub default_prompt: Arc<str>,
    pub max_upload_bytes: u64,
    pub offline: bool,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP server error: {0}")]
    Http(#[from] hyper::Error),
}

pub async fn handle_request(req: Request<Body>, state: AppState) -> Result<Response<Body>, Infallible> {
    debug!("[HTTP] {} {}", req.method(), req.uri().path());
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/caption-file") => routes::caption::handle(req, state).await,
        (&Method::GET, "/healthz") => routes::health::handle(state).await,
        (&Method::OPTIONS, _) => Ok(cors_preflight()),
        _ => Ok(json_error(StatusCode::NOT_FOUND, "Not found")),
    }
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, state: AppState, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()>,
{
    let listener = TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
    serve_on(listener, state, shutdown).await
}

/// Serve on an already-bound listener.
pub async fn serve_on<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()>,
{
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle_request(req, state.clone()))) }
    });

    let server = Server::from_tcp(listener)?.serve(make_svc);
    info!("[HTTP] Caption server listening on http://{}", server.local_addr());
    info!("[HTTP]   POST /caption-file  - caption an uploaded image");
    info!("[HTTP]   GET  /healthz       - model and concurrency status");

    server.with_graceful_shutdown(shutdown).await?;
    info!("[HTTP] Server stopped");
    Ok(())
}
