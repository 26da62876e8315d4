// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Starts and stops the three collaborating components of a test: the fake control plane, the
//! proxy under test and the echo backend.
//!
//! Components start in that order and stop in reverse. A failing component doesn't prevent the
//! later ones from being attempted: every failure is recorded on the component's
//! [`ProcessHandle`] so a broken setup can be diagnosed in one run.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::backend::EchoBackend;
use crate::config::{HarnessConfig, PortMap, ProxyConfig};
use crate::control_plane::{ControlPlaneRecorder, FakeControlPlaneServer};
use crate::error::HarnessError;
use crate::server;
use crate::verifier::EventVerifier;

const PROXY_COMPONENT_NAME: &str = "proxy";
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A process (or in-process server) the harness starts and stops.
#[async_trait]
pub trait Component: Send {
    fn name(&self) -> &str;

    /// Starts the component and returns the port it listens on. `proxy_config` is the rendered
    /// proxy configuration; only the proxy uses it.
    async fn start(&mut self, ports: &PortMap, proxy_config: &str) -> Result<u16, HarnessError>;

    /// Stops the component. Must not fail and must be safe to call more than once.
    async fn stop(&mut self);
}

#[async_trait]
impl Component for FakeControlPlaneServer {
    fn name(&self) -> &str {
        "control plane"
    }

    async fn start(&mut self, _ports: &PortMap, _proxy_config: &str) -> Result<u16, HarnessError> {
        FakeControlPlaneServer::start(self)
            .await
            .map(|addr| addr.port())
    }

    async fn stop(&mut self) {
        FakeControlPlaneServer::stop(self).await
    }
}

#[async_trait]
impl Component for EchoBackend {
    fn name(&self) -> &str {
        "backend"
    }

    async fn start(&mut self, _ports: &PortMap, _proxy_config: &str) -> Result<u16, HarnessError> {
        EchoBackend::start(self).await.map(|addr| addr.port())
    }

    async fn stop(&mut self) {
        EchoBackend::stop(self).await
    }
}

/// Lifecycle bookkeeping for one component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessHandle {
    pub name: String,
    pub started: bool,
    pub stopped: bool,
    pub last_error: Option<String>,
}

impl ProcessHandle {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn is_running(&self) -> bool {
        self.started && !self.stopped
    }
}

/// Runs the proxy binary with the rendered configuration written to a temporary file passed as
/// `-c <path>`.
pub struct ProxyProcess {
    bin: PathBuf,
    args: Vec<String>,
    ready_timeout: Duration,
    child: Option<Child>,
    config_file: Option<NamedTempFile>,
}

impl ProxyProcess {
    pub fn new(bin: impl Into<PathBuf>, args: Vec<String>, ready_timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            args,
            ready_timeout,
            child: None,
            config_file: None,
        }
    }

    /// Builds the proxy from `HARNESS_PROXY_BIN` and the extra arguments of `config`.
    pub fn from_config(config: &HarnessConfig) -> Result<Self, HarnessError> {
        let bin = config.proxy_bin.clone().ok_or_else(|| {
            HarnessError::setup(PROXY_COMPONENT_NAME, "no proxy binary configured")
        })?;
        Ok(Self::new(
            bin,
            config.proxy_args.clone(),
            config.proxy_ready_timeout,
        ))
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|child| child.id())
    }

    fn write_config(proxy_config: &str) -> Result<NamedTempFile, HarnessError> {
        let mut file = tempfile::Builder::new()
            .prefix("harness-proxy-")
            .suffix(".conf")
            .tempfile()
            .map_err(|e| HarnessError::setup(PROXY_COMPONENT_NAME, e))?;
        file.write_all(proxy_config.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| HarnessError::setup(PROXY_COMPONENT_NAME, e))?;
        Ok(file)
    }

    async fn wait_until_ready(&mut self, port: u16) -> Result<(), HarnessError> {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            if let Some(child) = self.child.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        return Err(HarnessError::setup(
                            PROXY_COMPONENT_NAME,
                            format!("exited before accepting connections ({status})"),
                        ))
                    }
                    Ok(None) => {}
                    Err(e) => return Err(HarnessError::setup(PROXY_COMPONENT_NAME, e)),
                }
            }
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::setup(
                    PROXY_COMPONENT_NAME,
                    format!(
                        "port {port} not accepting connections after {:?}",
                        self.ready_timeout
                    ),
                ));
            }
            tokio::time::sleep(READINESS_POLL_INTERVAL).await;
        }
    }

    async fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill proxy process: {e}");
            }
        }
        self.config_file = None;
    }
}

#[async_trait]
impl Component for ProxyProcess {
    fn name(&self) -> &str {
        PROXY_COMPONENT_NAME
    }

    async fn start(&mut self, ports: &PortMap, proxy_config: &str) -> Result<u16, HarnessError> {
        if self.child.is_some() {
            return Ok(ports.proxy);
        }
        if !self.bin.is_file() {
            return Err(HarnessError::setup(
                PROXY_COMPONENT_NAME,
                format!("proxy binary {} not found", self.bin.display()),
            ));
        }

        let config_file = Self::write_config(proxy_config)?;
        debug!(
            "Starting {} -c {} {}",
            self.bin.display(),
            config_file.path().display(),
            self.args.join(" ")
        );
        let child = Command::new(&self.bin)
            .arg("-c")
            .arg(config_file.path())
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HarnessError::setup(
                    PROXY_COMPONENT_NAME,
                    format!("unable to spawn {}: {e}", self.bin.display()),
                )
            })?;
        self.child = Some(child);
        self.config_file = Some(config_file);

        if let Err(e) = self.wait_until_ready(ports.proxy).await {
            self.kill().await;
            return Err(e);
        }
        info!("Proxy listening on port {}", ports.proxy);
        Ok(ports.proxy)
    }

    async fn stop(&mut self) {
        self.kill().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    ControlPlane,
    Proxy,
    Backend,
}

struct Slot {
    role: Role,
    handle: ProcessHandle,
    component: Box<dyn Component>,
}

/// A running set of control plane, proxy and backend.
pub struct Harness {
    config: HarnessConfig,
    ports: PortMap,
    recorder: Arc<ControlPlaneRecorder>,
    slots: Vec<Slot>,
}

impl Harness {
    /// Starts every component. On any failure the components that did start are stopped again
    /// and the first failure is returned.
    pub async fn start(
        config: HarnessConfig,
        proxy: Box<dyn Component>,
        proxy_config: &ProxyConfig,
    ) -> Result<Self, HarnessError> {
        let (mut harness, errors) = Self::start_partial(config, proxy, proxy_config).await;
        match errors.into_iter().next() {
            None => Ok(harness),
            Some(first) => {
                harness.stop().await;
                Err(first)
            }
        }
    }

    /// Starts every component and hands back whatever came up, along with all failures.
    pub async fn start_partial(
        config: HarnessConfig,
        proxy: Box<dyn Component>,
        proxy_config: &ProxyConfig,
    ) -> (Self, Vec<HarnessError>) {
        let mut errors = Vec::new();
        if let Err(e) = config.validate() {
            errors.push(e);
        }

        // the proxy configuration names the proxy and backend ports, so both must be fixed
        // before the proxy starts
        let mut ports = PortMap {
            control_plane: config.control_plane_port,
            proxy: config.proxy_port,
            backend: config.backend_port,
        };
        for (component, port) in [
            (PROXY_COMPONENT_NAME, &mut ports.proxy),
            ("backend", &mut ports.backend),
        ] {
            if *port == 0 {
                match server::reserve_port(component) {
                    Ok(reserved) => *port = reserved,
                    Err(e) => errors.push(e),
                }
            }
        }

        let control_plane = FakeControlPlaneServer::new(&config);
        let recorder = control_plane.recorder();
        let backend = EchoBackend::new(ports.backend);
        let slots = vec![
            Slot::new(Role::ControlPlane, Box::new(control_plane)),
            Slot::new(Role::Proxy, proxy),
            Slot::new(Role::Backend, Box::new(backend)),
        ];
        let mut harness = Self {
            config,
            ports,
            recorder,
            slots,
        };

        let now = Instant::now();
        for slot in harness.slots.iter_mut() {
            let rendered = proxy_config.render(&harness.ports);
            match slot.component.start(&harness.ports, &rendered).await {
                Ok(port) => {
                    slot.handle.started = true;
                    match slot.role {
                        Role::ControlPlane => harness.ports.control_plane = port,
                        Role::Proxy => harness.ports.proxy = port,
                        Role::Backend => harness.ports.backend = port,
                    }
                    debug!("Started {} on port {port}", slot.handle.name);
                }
                Err(e) => {
                    error!("Failed to start {}: {e}", slot.handle.name);
                    slot.handle.last_error = Some(e.to_string());
                    errors.push(e);
                }
            }
        }
        debug!(
            "Time taken to start the harness: {} ms",
            now.elapsed().as_millis()
        );
        (harness, errors)
    }

    /// Stops every started component, in reverse start order. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        for slot in self.slots.iter_mut().rev() {
            if slot.handle.is_running() {
                slot.component.stop().await;
                slot.handle.stopped = true;
                debug!("Stopped {}", slot.handle.name);
            }
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn ports(&self) -> PortMap {
        self.ports
    }

    pub fn recorder(&self) -> Arc<ControlPlaneRecorder> {
        Arc::clone(&self.recorder)
    }

    /// A verifier over this harness' control plane, bounded by the configured wait timeout.
    pub fn verifier(&self) -> EventVerifier {
        EventVerifier::new(self.recorder(), self.config.wait_timeout)
    }

    pub fn handles(&self) -> impl Iterator<Item = &ProcessHandle> {
        self.slots.iter().map(|slot| &slot.handle)
    }

    pub fn handle(&self, name: &str) -> Option<&ProcessHandle> {
        self.handles().find(|handle| handle.name == name)
    }

    pub fn proxy_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.ports.proxy)
    }

    pub fn control_plane_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.ports.control_plane)
    }

    pub fn backend_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.ports.backend)
    }
}

impl Slot {
    fn new(role: Role, component: Box<dyn Component>) -> Self {
        Self {
            role,
            handle: ProcessHandle::new(component.name()),
            component,
        }
    }
}
