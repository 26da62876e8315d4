// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Clients used by tests: a plain HTTP driver for traffic through the proxy, and a control-plane
//! client speaking the same JSON calls a proxy would make.

use core::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::attributes::AttributeBag;
use crate::error::HarnessError;
use crate::event_channel::CallKind;
use crate::http_utils::build_client;
use crate::protocol::{
    CheckRequest, CheckResponse, QuotaRequest, QuotaResponse, ReportRequest, ReportResponse,
    CHECK_ENDPOINT_PATH, QUOTA_ENDPOINT_PATH, REPORT_ENDPOINT_PATH,
};

/// Issues plain HTTP requests and hands back status and body.
#[derive(Clone)]
pub struct HttpDriver {
    client: reqwest::Client,
}

impl HttpDriver {
    pub fn new(timeout: Duration) -> Result<Self, HarnessError> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }

    pub async fn get(&self, url: &str) -> Result<(StatusCode, String), HarnessError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        Ok((status, response.text().await?))
    }

    pub async fn post(&self, url: &str, body: String) -> Result<(StatusCode, String), HarnessError> {
        let response = self.client.post(url).body(body).send().await?;
        let status = response.status();
        Ok((status, response.text().await?))
    }
}

#[derive(Clone)]
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
}

impl ControlPlaneClient {
    /// `base_url` is the control plane's scheme and authority, e.g. `http://127.0.0.1:29091`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, HarnessError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn check(&self, attributes: AttributeBag) -> Result<CheckResponse, HarnessError> {
        self.call(CallKind::Check, CHECK_ENDPOINT_PATH, &CheckRequest { attributes })
            .await
    }

    pub async fn report(&self, attributes: AttributeBag) -> Result<(), HarnessError> {
        let _: ReportResponse = self
            .call(CallKind::Report, REPORT_ENDPOINT_PATH, &ReportRequest { attributes })
            .await?;
        Ok(())
    }

    pub async fn quota(&self, request: &QuotaRequest) -> Result<QuotaResponse, HarnessError> {
        self.call(CallKind::Quota, QUOTA_ENDPOINT_PATH, request).await
    }

    async fn call<Req, Resp>(
        &self,
        kind: CallKind,
        path: &str,
        payload: &Req,
    ) -> Result<Resp, HarnessError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.post(&url).json(payload).send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!("Control plane client | {kind} answered {status}: {body}");

        if !status.is_success() {
            return Err(HarnessError::Rpc {
                kind: kind.to_string(),
                status: status.as_u16(),
                message: body,
            });
        }
        serde_json::from_str(&body).map_err(|e| HarnessError::Decode {
            kind: format!("{kind} response"),
            reason: e.to_string(),
        })
    }
}
