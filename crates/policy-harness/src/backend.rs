// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{header, http, Request, Response, StatusCode};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::HarnessError;
use crate::http_utils::{log_and_create_http_response, Body, HttpResponse};
use crate::server;

const COMPONENT_NAME: &str = "backend";

/// Backend that answers every request with 200 and the request body.
pub struct EchoBackend {
    port: u16,
    cancel: CancellationToken,
    local_addr: Option<SocketAddr>,
    server_handle: Option<JoinHandle<()>>,
}

impl EchoBackend {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            cancel: CancellationToken::new(),
            local_addr: None,
            server_handle: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn start(&mut self) -> Result<SocketAddr, HarnessError> {
        if let Some(addr) = self.local_addr {
            return Ok(addr);
        }
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        let listener = server::bind(COMPONENT_NAME, self.port).await?;
        let addr = listener
            .local_addr()
            .map_err(|e| HarnessError::setup(COMPONENT_NAME, e))?;

        let service = service_fn(echo);
        let cancel = self.cancel.clone();
        self.server_handle = Some(tokio::spawn(async move {
            if let Err(e) = server::serve_tcp(COMPONENT_NAME, listener, service, cancel).await {
                error!("Backend stopped unexpectedly: {e}");
            }
        }));
        self.local_addr = Some(addr);
        info!("Backend listening on {addr}");
        Ok(addr)
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.local_addr = None;
        if let Some(handle) = self.server_handle.take() {
            if let Err(e) = handle.await {
                error!("Backend task failed: {e}");
            }
            debug!("Backend stopped");
        }
    }
}

impl Drop for EchoBackend {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn echo(req: Request<Incoming>) -> http::Result<HttpResponse> {
    let content_type = req.headers().get(header::CONTENT_TYPE).cloned();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return log_and_create_http_response(
                &format!("Backend: unable to read request body: {e}"),
                StatusCode::BAD_REQUEST,
            )
        }
    };

    let mut response = Response::builder().status(StatusCode::OK);
    if let Some(content_type) = content_type {
        response = response.header(header::CONTENT_TYPE, content_type);
    }
    response.body(Body::from(body))
}
