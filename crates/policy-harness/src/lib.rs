// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Integration-test harness for a proxy that enforces policy against a policy/telemetry control
//! plane.
//!
//! The harness starts a fake control plane, the proxy under test and an echo backend, drives
//! traffic through the proxy and verifies the Check, Report and Quota calls the proxy makes,
//! including the client-side quota prefetching that must keep Quota calls rare.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod attributes;
pub mod backend;
pub mod client;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod event_channel;
pub mod http_utils;
pub mod orchestrator;
pub mod protocol;
pub mod quota_cache;
pub mod server;
pub mod verifier;

pub use attributes::{AttributeBag, AttributeValue, BagVerifier, JsonBagVerifier};
pub use config::{is_sanitizer_build, HarnessConfig, PortMap, ProxyConfig};
pub use control_plane::{ControlPlaneRecorder, FakeControlPlaneServer, QuotaGrant, ResponsePolicy};
pub use error::HarnessError;
pub use event_channel::{CallKind, RecordedEvent};
pub use orchestrator::{Component, Harness, ProcessHandle, ProxyProcess};
pub use quota_cache::{PrefetchState, QuotaPrefetch, QuotaPrefetchConfig, QuotaSource};
pub use verifier::{DrainGuard, EventVerifier};
