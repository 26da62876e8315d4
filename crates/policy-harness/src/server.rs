// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP/1 accept loop shared by the harness servers.

use std::io;
use std::net::SocketAddr;

use hyper::body::Incoming;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::HarnessError;
use crate::http_utils::HttpResponse;

/// Binds `127.0.0.1:port` (0 picks an ephemeral port). A port collision is reported as a setup
/// error naming `component`.
pub async fn bind(component: &str, port: u16) -> Result<TcpListener, HarnessError> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpListener::bind(&addr)
        .await
        .map_err(|e| HarnessError::setup(component, format!("unable to bind {addr}: {e}")))
}

/// Picks a currently free loopback port for a component whose port must be known before it
/// starts. The port is released again before returning, so another process could still take it.
pub fn reserve_port(component: &str) -> Result<u16, HarnessError> {
    std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .map_err(|e| HarnessError::setup(component, format!("unable to reserve a port: {e}")))
}

/// Serves HTTP/1 connections from `listener` until `cancel` fires. Connections still open at that
/// point are aborted, so the port is free once this returns.
pub async fn serve_tcp<S>(
    component: &str,
    listener: TcpListener,
    service: S,
    cancel: CancellationToken,
) -> Result<(), io::Error>
where
    S: hyper::service::Service<hyper::Request<Incoming>, Response = HttpResponse>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = tokio::task::JoinSet::new();

    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("{component}: shutting down, aborting {} connections", joinset.len());
                joinset.abort_all();
                return Ok(());
            },
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("{component}: server error: {e}");
                    return Err(e);
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    // Don't kill server on panic - log and continue
                    error!("{component}: connection handler panicked: {:?}", e);
                    continue;
                },
                Ok(()) | Err(_) => continue,
            },
        };
        let conn = hyper_util::rt::TokioIo::new(conn);
        let server = server.clone();
        let service = service.clone();
        let component = component.to_string();
        joinset.spawn(async move {
            if let Err(e) = server.serve_connection(conn, service).await {
                debug!("{component}: connection error: {e}");
            }
        });
    }
}
