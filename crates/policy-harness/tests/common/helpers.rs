// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use policy_harness::client::{ControlPlaneClient, HttpDriver};
use policy_harness::{FakeControlPlaneServer, Harness, HarnessConfig, ProxyConfig};

use super::reference_proxy::{ReferenceProxy, BASE_FRAGMENT};

pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Harness settings for tests: ephemeral ports everywhere and a short wait.
pub fn test_config() -> HarnessConfig {
    HarnessConfig {
        wait_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub fn base_proxy_config() -> ProxyConfig {
    ProxyConfig::new(BASE_FRAGMENT)
}

pub async fn start_harness(proxy_config: ProxyConfig) -> Harness {
    start_harness_with(test_config(), proxy_config).await
}

pub async fn start_harness_with(config: HarnessConfig, proxy_config: ProxyConfig) -> Harness {
    Harness::start(config, Box::new(ReferenceProxy::new()), &proxy_config)
        .await
        .expect("harness failed to start")
}

/// Starts a control plane on its own, for tests that talk to it directly.
pub async fn start_control_plane(config: &HarnessConfig) -> (FakeControlPlaneServer, ControlPlaneClient) {
    let mut server = FakeControlPlaneServer::new(config);
    server.start().await.expect("control plane failed to start");
    let url = server.url().expect("control plane has no address");
    let client = ControlPlaneClient::new(&url, CLIENT_TIMEOUT).expect("failed to build client");
    (server, client)
}

pub fn driver() -> HttpDriver {
    HttpDriver::new(CLIENT_TIMEOUT).expect("failed to build HTTP driver")
}
