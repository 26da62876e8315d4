// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fake policy/telemetry control plane.
//!
//! Serves the Check, Report and Quota calls a proxy makes, counts them, records each one on a
//! per-kind [`EventChannel`] and answers with a canned response taken from the current
//! [`ResponsePolicy`]. A call's event is published before its response is written, so a verifier
//! woken by an event knows the call has happened (though the proxy may not have the answer yet).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{http, Method, Request, StatusCode};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::event_channel::{CallKind, EventChannel, RecordedEvent};
use crate::http_utils::{
    create_json_http_response, log_and_create_http_response, verify_request_content_length,
    HttpResponse,
};
use crate::protocol::{
    CheckRequest, CheckResponse, CheckStatus, QuotaRequest, QuotaResponse, ReportRequest,
    ReportResponse, CHECK_ENDPOINT_PATH, QUOTA_ENDPOINT_PATH, REPORT_ENDPOINT_PATH,
};
use crate::server;

const COMPONENT_NAME: &str = "control plane";
const DEFAULT_VALID_DURATION_MS: u64 = 60_000;
const DEFAULT_VALID_USE_COUNT: u32 = 10_000;

/// How Quota calls are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaGrant {
    /// Grant whatever was asked for
    Full,
    /// Grant at most this much per call
    Capped(i64),
    /// Grant nothing
    Deny,
    /// Grant from a shared allowance that shrinks with every grant, then nothing
    Budget(i64),
}

impl QuotaGrant {
    fn grant(&mut self, requested: i64) -> i64 {
        let requested = requested.max(0);
        match self {
            QuotaGrant::Full => requested,
            QuotaGrant::Capped(cap) => requested.min(*cap),
            QuotaGrant::Deny => 0,
            QuotaGrant::Budget(remaining) => {
                let granted = requested.min(*remaining);
                *remaining -= granted;
                granted
            }
        }
    }
}

/// Responses the fake control plane gives. Tests can swap it at any time through
/// [`ControlPlaneRecorder::update_policy`].
#[derive(Debug, Clone)]
pub struct ResponsePolicy {
    pub check_status: CheckStatus,
    pub check_message: String,
    pub check_valid_duration_ms: u64,
    pub check_valid_use_count: u32,
    pub quota_grant: QuotaGrant,
    pub quota_valid_duration_ms: u64,
    /// Delay applied after recording a call and before answering it
    pub response_delay: Duration,
    /// Per-kind overrides of `response_delay`
    pub check_delay: Option<Duration>,
    pub report_delay: Option<Duration>,
    pub quota_delay: Option<Duration>,
}

impl Default for ResponsePolicy {
    fn default() -> Self {
        Self {
            check_status: CheckStatus::Ok,
            check_message: String::new(),
            check_valid_duration_ms: DEFAULT_VALID_DURATION_MS,
            check_valid_use_count: DEFAULT_VALID_USE_COUNT,
            quota_grant: QuotaGrant::Full,
            quota_valid_duration_ms: DEFAULT_VALID_DURATION_MS,
            response_delay: Duration::ZERO,
            check_delay: None,
            report_delay: None,
            quota_delay: None,
        }
    }
}

impl ResponsePolicy {
    /// The delay before answering a call of `kind`.
    pub fn delay_for(&self, kind: CallKind) -> Duration {
        let delay = match kind {
            CallKind::Check => self.check_delay,
            CallKind::Report => self.report_delay,
            CallKind::Quota => self.quota_delay,
        };
        delay.unwrap_or(self.response_delay)
    }
}

struct CallRecord {
    count: AtomicU64,
    channel: Arc<EventChannel<RecordedEvent>>,
}

impl CallRecord {
    fn new(kind: CallKind, capacity: usize, recording: bool) -> Self {
        Self {
            count: AtomicU64::new(0),
            channel: Arc::new(EventChannel::new(kind, capacity, recording)),
        }
    }
}

/// Counters, channels and response policy of one fake control plane instance.
pub struct ControlPlaneRecorder {
    check: CallRecord,
    report: CallRecord,
    quota: CallRecord,
    policy: Mutex<ResponsePolicy>,
    max_request_content_length: usize,
}

impl ControlPlaneRecorder {
    pub fn new(config: &HarnessConfig) -> Self {
        let recording = !config.stress;
        let capacity = config.event_channel_capacity;
        Self {
            check: CallRecord::new(CallKind::Check, capacity, recording),
            report: CallRecord::new(CallKind::Report, capacity, recording),
            quota: CallRecord::new(CallKind::Quota, capacity, recording),
            policy: Mutex::new(ResponsePolicy::default()),
            max_request_content_length: config.max_request_content_length,
        }
    }

    fn record(&self, kind: CallKind) -> &CallRecord {
        match kind {
            CallKind::Check => &self.check,
            CallKind::Report => &self.report,
            CallKind::Quota => &self.quota,
        }
    }

    /// Number of calls of `kind` received so far, including ones that failed to decode.
    ///
    /// A call is counted as soon as it arrives, before its body is decoded and its event
    /// published, so the count can run ahead of [`EventChannel::published`].
    pub fn count(&self, kind: CallKind) -> u64 {
        self.record(kind).count.load(Ordering::SeqCst)
    }

    pub fn channel(&self, kind: CallKind) -> Arc<EventChannel<RecordedEvent>> {
        Arc::clone(&self.record(kind).channel)
    }

    pub fn policy(&self) -> ResponsePolicy {
        self.lock_policy().clone()
    }

    pub fn set_policy(&self, policy: ResponsePolicy) {
        *self.lock_policy() = policy;
    }

    pub fn update_policy(&self, f: impl FnOnce(&mut ResponsePolicy)) {
        f(&mut self.lock_policy());
    }

    fn lock_policy(&self) -> std::sync::MutexGuard<'_, ResponsePolicy> {
        // a poisoned policy is still a valid policy
        self.policy.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_sequence(&self, kind: CallKind) -> u64 {
        self.record(kind).count.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish(&self, event: RecordedEvent) {
        self.record(event.kind).channel.publish(event);
    }

    async fn handle_check(&self, req: Request<Incoming>) -> http::Result<HttpResponse> {
        let sequence = self.next_sequence(CallKind::Check);
        let request: CheckRequest = match self.read_payload(CallKind::Check, req).await {
            Ok(request) => request,
            Err(response) => return response,
        };
        debug!("Control plane | check #{sequence}: {}", request.attributes);
        self.publish(RecordedEvent::check(sequence, request));

        let policy = self.policy();
        delay(policy.delay_for(CallKind::Check)).await;
        create_json_http_response(&CheckResponse {
            status: policy.check_status,
            message: policy.check_message,
            valid_duration_ms: policy.check_valid_duration_ms,
            valid_use_count: policy.check_valid_use_count,
        })
    }

    async fn handle_report(&self, req: Request<Incoming>) -> http::Result<HttpResponse> {
        let sequence = self.next_sequence(CallKind::Report);
        let request: ReportRequest = match self.read_payload(CallKind::Report, req).await {
            Ok(request) => request,
            Err(response) => return response,
        };
        debug!("Control plane | report #{sequence}: {}", request.attributes);
        self.publish(RecordedEvent::report(sequence, request));

        delay(self.policy().delay_for(CallKind::Report)).await;
        create_json_http_response(&ReportResponse {})
    }

    async fn handle_quota(&self, req: Request<Incoming>) -> http::Result<HttpResponse> {
        let sequence = self.next_sequence(CallKind::Quota);
        let request: QuotaRequest = match self.read_payload(CallKind::Quota, req).await {
            Ok(request) => request,
            Err(response) => return response,
        };
        let requested = request.amount;

        // the grant is decided while holding the lock so concurrent calls can't overspend a budget
        let (granted_amount, valid_duration_ms, response_delay) = {
            let mut policy = self.lock_policy();
            (
                policy.quota_grant.grant(requested),
                policy.quota_valid_duration_ms,
                policy.delay_for(CallKind::Quota),
            )
        };
        debug!(
            "Control plane | quota #{sequence}: {} requested {requested}, granted {granted_amount}",
            request.name
        );
        self.publish(RecordedEvent::quota(sequence, request));

        delay(response_delay).await;
        create_json_http_response(&QuotaResponse {
            granted_amount,
            valid_duration_ms,
        })
    }

    async fn read_payload<T: DeserializeOwned>(
        &self,
        kind: CallKind,
        req: Request<Incoming>,
    ) -> Result<T, http::Result<HttpResponse>> {
        let prefix = format!("Error processing {kind} call");
        if let Some(response) =
            verify_request_content_length(req.headers(), self.max_request_content_length, &prefix)
        {
            return Err(response);
        }

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return Err(log_and_create_http_response(
                    &format!("{prefix}: unable to read request body: {e}"),
                    StatusCode::BAD_REQUEST,
                ))
            }
        };
        if body.len() > self.max_request_content_length {
            return Err(log_and_create_http_response(
                &format!("{prefix}: Payload too large"),
                StatusCode::PAYLOAD_TOO_LARGE,
            ));
        }

        serde_json::from_slice(&body).map_err(|e| {
            let error = HarnessError::Decode {
                kind: kind.to_string(),
                reason: e.to_string(),
            };
            log_and_create_http_response(&error.to_string(), StatusCode::BAD_REQUEST)
        })
    }

    async fn endpoint_handler(&self, req: Request<Incoming>) -> http::Result<HttpResponse> {
        match (req.method(), req.uri().path()) {
            (&Method::POST, CHECK_ENDPOINT_PATH) => self.handle_check(req).await,
            (&Method::POST, REPORT_ENDPOINT_PATH) => self.handle_report(req).await,
            (&Method::POST, QUOTA_ENDPOINT_PATH) => self.handle_quota(req).await,
            (_, CHECK_ENDPOINT_PATH | REPORT_ENDPOINT_PATH | QUOTA_ENDPOINT_PATH) => {
                log_and_create_http_response(
                    &format!("Unsupported method {} on {}", req.method(), req.uri().path()),
                    StatusCode::METHOD_NOT_ALLOWED,
                )
            }
            (_, path) => log_and_create_http_response(
                &format!("Unknown control plane endpoint {path}"),
                StatusCode::NOT_FOUND,
            ),
        }
    }
}

async fn delay(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

/// The fake control plane server. A fresh instance owns its own counters and channels, so tests
/// running in parallel never share state.
pub struct FakeControlPlaneServer {
    port: u16,
    recorder: Arc<ControlPlaneRecorder>,
    cancel: CancellationToken,
    local_addr: Option<SocketAddr>,
    server_handle: Option<JoinHandle<()>>,
}

impl FakeControlPlaneServer {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            port: config.control_plane_port,
            recorder: Arc::new(ControlPlaneRecorder::new(config)),
            cancel: CancellationToken::new(),
            local_addr: None,
            server_handle: None,
        }
    }

    pub fn recorder(&self) -> Arc<ControlPlaneRecorder> {
        Arc::clone(&self.recorder)
    }

    /// Address the server is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn url(&self) -> Option<String> {
        self.local_addr.map(|addr| format!("http://{addr}"))
    }

    pub fn is_running(&self) -> bool {
        self.server_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Binds the listening port and starts serving in the background.
    pub async fn start(&mut self) -> Result<SocketAddr, HarnessError> {
        if let Some(addr) = self.local_addr {
            return Ok(addr);
        }
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        let now = Instant::now();
        let listener = server::bind(COMPONENT_NAME, self.port).await?;
        let addr = listener
            .local_addr()
            .map_err(|e| HarnessError::setup(COMPONENT_NAME, e))?;

        let recorder = Arc::clone(&self.recorder);
        let service = service_fn(move |req| {
            let recorder = Arc::clone(&recorder);
            async move { recorder.endpoint_handler(req).await }
        });

        let cancel = self.cancel.clone();
        self.server_handle = Some(tokio::spawn(async move {
            if let Err(e) = server::serve_tcp(COMPONENT_NAME, listener, service, cancel).await {
                error!("Control plane stopped unexpectedly: {e}");
            }
        }));
        self.local_addr = Some(addr);

        info!("Control plane listening on {addr}");
        debug!(
            "Time taken to start the control plane: {} ms",
            now.elapsed().as_millis()
        );
        Ok(addr)
    }

    /// Stops serving and releases the port. Safe to call on a server that never started.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.local_addr = None;
        if let Some(handle) = self.server_handle.take() {
            if let Err(e) = handle.await {
                error!("Control plane task failed: {e}");
            }
            debug!("Control plane stopped");
        }
    }
}

impl Drop for FakeControlPlaneServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
