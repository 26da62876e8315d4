// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! JSON payloads exchanged between a proxy and the control plane.

use serde::{Deserialize, Serialize};

use crate::attributes::AttributeBag;

pub const CHECK_ENDPOINT_PATH: &str = "/v1/check";
pub const REPORT_ENDPOINT_PATH: &str = "/v1/report";
pub const QUOTA_ENDPOINT_PATH: &str = "/v1/quota";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub attributes: AttributeBag,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    #[default]
    Ok,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    Unavailable,
}

impl CheckStatus {
    pub fn is_ok(&self) -> bool {
        *self == CheckStatus::Ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub status: CheckStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// How long the proxy may cache this decision, in milliseconds
    pub valid_duration_ms: u64,
    /// How many requests the proxy may answer from this decision
    pub valid_use_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub attributes: AttributeBag,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRequest {
    pub name: String,
    pub amount: i64,
    #[serde(default)]
    pub dedup_id: String,
    #[serde(default)]
    pub best_effort: bool,
}

impl QuotaRequest {
    pub fn new(name: &str, amount: i64) -> Self {
        Self {
            name: name.to_string(),
            amount,
            dedup_id: String::new(),
            best_effort: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaResponse {
    pub granted_amount: i64,
    pub valid_duration_ms: u64,
}
