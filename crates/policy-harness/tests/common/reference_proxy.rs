// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Loopback proxy standing in for the real one in end-to-end tests.
//!
//! For each request it makes a Check call, consumes quota (directly or through a prefetching
//! cache), forwards the request to the backend and reports the outcome in the background. Its
//! configuration is the rendered fragment list wrapped in braces, i.e. a JSON object.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{http, Request, Response, StatusCode};
use policy_harness::client::ControlPlaneClient;
use policy_harness::http_utils::{log_and_create_http_response, Body, HttpResponse};
use policy_harness::protocol::QuotaRequest;
use policy_harness::quota_cache::{QuotaPrefetch, QuotaPrefetchConfig};
use policy_harness::{server, AttributeBag, Component, HarnessError, PortMap};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const COMPONENT_NAME: &str = "proxy";
const RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// Base fragment pointing the proxy at the harness components.
pub const BASE_FRAGMENT: &str = r#""listen_port": {proxy_port},
"control_plane": "http://127.0.0.1:{control_plane_port}",
"backend": "http://127.0.0.1:{backend_port}""#;
pub const CHECK_CACHE_FRAGMENT: &str = r#""check_cache": true"#;
pub const QUOTA_FRAGMENT: &str = r#""quota": {"name": "requestcount", "amount": 1}"#;
pub const QUOTA_CACHE_FRAGMENT: &str =
    r#""quota": {"name": "requestcount", "amount": 1, "cache": true}"#;

#[derive(Debug, Deserialize)]
struct ReferenceProxyConfig {
    listen_port: u16,
    control_plane: String,
    backend: String,
    #[serde(default)]
    check_cache: bool,
    #[serde(default)]
    quota: Option<QuotaSettings>,
}

#[derive(Debug, Deserialize)]
struct QuotaSettings {
    name: String,
    amount: i64,
    #[serde(default)]
    cache: bool,
}

enum QuotaMode {
    Direct { name: String, amount: i64 },
    Cached { amount: i64, cache: QuotaPrefetch<ControlPlaneClient> },
}

struct CachedCheck {
    expires_at: Instant,
    uses_left: u32,
}

struct ProxyState {
    control_plane: ControlPlaneClient,
    backend: String,
    forwarder: reqwest::Client,
    check_cache: Option<Mutex<HashMap<String, CachedCheck>>>,
    quota: Option<QuotaMode>,
}

impl ProxyState {
    fn new(config: ReferenceProxyConfig) -> Result<Self, HarnessError> {
        let control_plane = ControlPlaneClient::new(&config.control_plane, RPC_TIMEOUT)?;
        let quota = match config.quota {
            None => None,
            Some(settings) if settings.cache => Some(QuotaMode::Cached {
                amount: settings.amount,
                cache: QuotaPrefetch::new(
                    &settings.name,
                    QuotaPrefetchConfig::default(),
                    control_plane.clone(),
                )?,
            }),
            Some(settings) => Some(QuotaMode::Direct {
                name: settings.name,
                amount: settings.amount,
            }),
        };
        Ok(Self {
            control_plane,
            backend: config.backend.trim_end_matches('/').to_string(),
            forwarder: policy_harness::http_utils::build_client(RPC_TIMEOUT)?,
            check_cache: config.check_cache.then(|| Mutex::new(HashMap::new())),
            quota,
        })
    }

    /// Returns the status to answer with when the request is denied.
    async fn check(
        &self,
        bag: &AttributeBag,
        path: &str,
    ) -> Result<Option<StatusCode>, HarnessError> {
        if let Some(cache) = &self.check_cache {
            let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = cache.get_mut(path) {
                if entry.expires_at > Instant::now() && entry.uses_left > 0 {
                    entry.uses_left -= 1;
                    return Ok(None);
                }
                cache.remove(path);
            }
        }

        let response = self.control_plane.check(bag.clone()).await?;
        if !response.status.is_ok() {
            return Ok(Some(StatusCode::FORBIDDEN));
        }
        if let Some(cache) = &self.check_cache {
            cache.lock().unwrap_or_else(|e| e.into_inner()).insert(
                path.to_string(),
                CachedCheck {
                    expires_at: Instant::now() + Duration::from_millis(response.valid_duration_ms),
                    uses_left: response.valid_use_count.saturating_sub(1),
                },
            );
        }
        Ok(None)
    }

    async fn consume_quota(&self) -> Result<bool, HarnessError> {
        match &self.quota {
            None => Ok(true),
            Some(QuotaMode::Direct { name, amount }) => {
                let response = self
                    .control_plane
                    .quota(&QuotaRequest::new(name, *amount))
                    .await?;
                Ok(response.granted_amount >= *amount)
            }
            Some(QuotaMode::Cached { amount, cache }) => cache.acquire(*amount).await,
        }
    }

    async fn forward(
        &self,
        method: &http::Method,
        path_and_query: &str,
        body: bytes::Bytes,
    ) -> Result<(StatusCode, bytes::Bytes), HarnessError> {
        let response = self
            .forwarder
            .request(method.clone(), format!("{}{path_and_query}", self.backend))
            .body(body)
            .send()
            .await?;
        let status = response.status();
        Ok((status, response.bytes().await?))
    }

    async fn handle(self: Arc<Self>, req: Request<Incoming>) -> http::Result<HttpResponse> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let path_and_query = req
            .uri()
            .path_and_query()
            .map_or_else(|| path.clone(), |pq| pq.as_str().to_string());
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return log_and_create_http_response(
                    &format!("Proxy: unable to read request body: {e}"),
                    StatusCode::BAD_REQUEST,
                )
            }
        };

        let bag = AttributeBag::new()
            .with("request_protocol", "http")
            .with("request_method", method.as_str())
            .with("request_path", path.as_str())
            .with("request_size", body.len() as i64);

        let outcome = self
            .process(&bag, &method, &path, &path_and_query, body)
            .await;
        let (status, response_body) = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Proxy: {e}");
                (StatusCode::SERVICE_UNAVAILABLE, bytes::Bytes::new())
            }
        };

        let report = bag.with("response_code", i64::from(status.as_u16()));
        let state = Arc::clone(&self);
        tokio::spawn(async move {
            if let Err(e) = state.control_plane.report(report).await {
                debug!("Proxy: report failed: {e}");
            }
        });

        Response::builder()
            .status(status)
            .body(Body::from(response_body))
    }

    async fn process(
        &self,
        bag: &AttributeBag,
        method: &http::Method,
        path: &str,
        path_and_query: &str,
        body: bytes::Bytes,
    ) -> Result<(StatusCode, bytes::Bytes), HarnessError> {
        if let Some(denied) = self.check(bag, path).await? {
            return Ok((denied, bytes::Bytes::new()));
        }
        if !self.consume_quota().await? {
            return Ok((StatusCode::TOO_MANY_REQUESTS, bytes::Bytes::new()));
        }
        self.forward(method, path_and_query, body).await
    }
}

/// The reference proxy as a harness [`Component`].
#[derive(Default)]
pub struct ReferenceProxy {
    cancel: CancellationToken,
    server_handle: Option<JoinHandle<()>>,
}

impl ReferenceProxy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Component for ReferenceProxy {
    fn name(&self) -> &str {
        COMPONENT_NAME
    }

    async fn start(&mut self, ports: &PortMap, proxy_config: &str) -> Result<u16, HarnessError> {
        let config: ReferenceProxyConfig = serde_json::from_str(&format!("{{{proxy_config}}}"))
            .map_err(|e| HarnessError::setup(COMPONENT_NAME, format!("bad configuration: {e}")))?;
        debug_assert_eq!(config.listen_port, ports.proxy);

        let listener = server::bind(COMPONENT_NAME, config.listen_port).await?;
        let port = listener
            .local_addr()
            .map_err(|e| HarnessError::setup(COMPONENT_NAME, e))?
            .port();
        let state = Arc::new(ProxyState::new(config)?);
        let service = service_fn(move |req| Arc::clone(&state).handle(req));

        let cancel = self.cancel.clone();
        self.server_handle = Some(tokio::spawn(async move {
            if let Err(e) = server::serve_tcp(COMPONENT_NAME, listener, service, cancel).await {
                error!("Reference proxy stopped unexpectedly: {e}");
            }
        }));
        Ok(port)
    }

    async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.server_handle.take() {
            if let Err(e) = handle.await {
                error!("Reference proxy task failed: {e}");
            }
        }
    }
}

impl Drop for ReferenceProxy {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
