// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::HarnessError;
use crate::event_channel::DEFAULT_EVENT_CHANNEL_CAPACITY;

const DEFAULT_CONTROL_PLANE_PORT: u16 = 29091;
const DEFAULT_PROXY_PORT: u16 = 29090;
const DEFAULT_BACKEND_PORT: u16 = 28080;
const DEFAULT_WAIT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_PROXY_READY_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_REQUEST_CONTENT_LENGTH: usize = 1024 * 1024;

const CONTROL_PLANE_PORT_PLACEHOLDER: &str = "{control_plane_port}";
const PROXY_PORT_PLACEHOLDER: &str = "{proxy_port}";
const BACKEND_PORT_PLACEHOLDER: &str = "{backend_port}";

/// Settings shared by every component of one harness instance.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Port of the fake control plane, 0 picks an ephemeral port
    pub control_plane_port: u16,
    /// Port the proxy listens on for test traffic
    pub proxy_port: u16,
    /// Port of the echo backend, 0 picks an ephemeral port
    pub backend_port: u16,
    /// Location of the prebuilt proxy binary
    pub proxy_bin: Option<PathBuf>,
    /// Extra arguments appended to the proxy command line
    pub proxy_args: Vec<String>,
    /// Skip event recording entirely (high-throughput tests that only look at counters)
    pub stress: bool,
    /// Upper bound for every blocking verification
    pub wait_timeout: Duration,
    /// How long to wait for the proxy to accept connections after spawning it
    pub proxy_ready_timeout: Duration,
    pub event_channel_capacity: usize,
    pub max_request_content_length: usize,
    pub log_level: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            control_plane_port: 0,
            proxy_port: 0,
            backend_port: 0,
            proxy_bin: None,
            proxy_args: Vec::new(),
            stress: false,
            wait_timeout: Duration::from_millis(DEFAULT_WAIT_TIMEOUT_MS),
            proxy_ready_timeout: Duration::from_millis(DEFAULT_PROXY_READY_TIMEOUT_MS),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            max_request_content_length: DEFAULT_MAX_REQUEST_CONTENT_LENGTH,
            log_level: "info".to_string(),
        }
    }
}

impl HarnessConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, HarnessError> {
        let port = |name: &str, default: u16| {
            env::var(name)
                .ok()
                .and_then(|port| port.parse::<u16>().ok())
                .unwrap_or(default)
        };
        let control_plane_port = port("HARNESS_CONTROL_PLANE_PORT", DEFAULT_CONTROL_PLANE_PORT);
        let proxy_port = port("HARNESS_PROXY_PORT", DEFAULT_PROXY_PORT);
        let backend_port = port("HARNESS_BACKEND_PORT", DEFAULT_BACKEND_PORT);

        let proxy_bin = env::var("HARNESS_PROXY_BIN").ok().map(PathBuf::from);
        let proxy_args = env::var("HARNESS_PROXY_ARGS")
            .map(|args| args.split_whitespace().map(String::from).collect())
            .unwrap_or_default();
        let stress = env::var("HARNESS_STRESS")
            .map(|val| matches!(val.to_lowercase().as_str(), "1" | "true"))
            .unwrap_or(false);
        let wait_timeout_ms = env::var("HARNESS_WAIT_TIMEOUT_MS")
            .ok()
            .and_then(|ms| ms.parse::<u64>().ok())
            .unwrap_or(DEFAULT_WAIT_TIMEOUT_MS);
        let log_level = env::var("HARNESS_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| "info".to_string());

        let config = Self {
            control_plane_port,
            proxy_port,
            backend_port,
            proxy_bin,
            proxy_args,
            stress,
            wait_timeout: Duration::from_millis(wait_timeout_ms),
            log_level,
            ..Default::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.wait_timeout.is_zero() {
            return Err(HarnessError::InvalidConfig(
                "wait timeout must be greater than 0".to_string(),
            ));
        }

        if self.event_channel_capacity == 0 {
            return Err(HarnessError::InvalidConfig(
                "event channel capacity must be greater than 0".to_string(),
            ));
        }

        let fixed_ports = [self.control_plane_port, self.proxy_port, self.backend_port]
            .into_iter()
            .filter(|port| *port != 0)
            .collect::<Vec<u16>>();
        for (i, port) in fixed_ports.iter().enumerate() {
            if fixed_ports[i + 1..].contains(port) {
                return Err(HarnessError::InvalidConfig(format!(
                    "port {port} is assigned to more than one component"
                )));
            }
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(HarnessError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}

/// Returns true when running under a thread or address sanitizer build, where timing-sensitive
/// scenarios are skipped.
pub fn is_sanitizer_build() -> bool {
    is_sanitizer_build_from_env(
        env::var("TSAN").ok().as_deref(),
        env::var("ASAN").ok().as_deref(),
    )
}

fn is_sanitizer_build_from_env(tsan: Option<&str>, asan: Option<&str>) -> bool {
    tsan.is_some_and(|v| !v.is_empty()) || asan.is_some_and(|v| !v.is_empty())
}

/// Ports actually bound by the harness components, known once the components have started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortMap {
    pub control_plane: u16,
    pub proxy: u16,
    pub backend: u16,
}

/// Proxy configuration text, assembled from named fragments joined with `,`.
///
/// The harness never parses the result. The only processing is substitution of the
/// `{control_plane_port}`, `{proxy_port}` and `{backend_port}` placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    fragments: Vec<(String, String)>,
}

impl ProxyConfig {
    pub fn new(base: &str) -> Self {
        Self::default().with_fragment("base", base)
    }

    pub fn with_fragment(mut self, name: &str, text: &str) -> Self {
        self.fragments.push((name.to_string(), text.to_string()));
        self
    }

    pub fn has_fragment(&self, name: &str) -> bool {
        self.fragments.iter().any(|(n, _)| n == name)
    }

    pub fn fragment_names(&self) -> Vec<&str> {
        self.fragments.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn render(&self, ports: &PortMap) -> String {
        self.fragments
            .iter()
            .map(|(_, text)| text.as_str())
            .collect::<Vec<&str>>()
            .join(",")
            .replace(CONTROL_PLANE_PORT_PLACEHOLDER, &ports.control_plane.to_string())
            .replace(PROXY_PORT_PLACEHOLDER, &ports.proxy.to_string())
            .replace(BACKEND_PORT_PLACEHOLDER, &ports.backend.to_string())
    }
}
