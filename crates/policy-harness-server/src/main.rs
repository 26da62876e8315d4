// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;

use anyhow::Context;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use policy_harness::backend::EchoBackend;
use policy_harness::{CallKind, EventVerifier, FakeControlPlaneServer, HarnessConfig};

const STATS_LOG_INTERVAL: u64 = 10;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("HARNESS_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    if let Err(e) = run().await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = HarnessConfig::from_env().context("Error reading harness configuration")?;

    let mut control_plane = FakeControlPlaneServer::new(&config);
    let control_plane_addr = control_plane.start().await?;

    let mut backend = EchoBackend::new(config.backend_port);
    let backend_addr = match backend.start().await {
        Ok(addr) => addr,
        Err(e) => {
            control_plane.stop().await;
            return Err(e.into());
        }
    };

    info!(
        "Control plane on {control_plane_addr}, backend on {backend_addr}; start the proxy on port {}",
        config.proxy_port
    );

    let recorder = control_plane.recorder();
    // nothing reads events here, keep the channels empty so no event is dropped as overflow
    let drain = EventVerifier::new(recorder.clone(), config.wait_timeout).drain_all();
    let mut stats_interval = interval(Duration::from_secs(STATS_LOG_INTERVAL));
    stats_interval.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Unable to listen for shutdown signal: {e}");
                }
                break;
            }
            _ = stats_interval.tick() => {
                let counts = CallKind::ALL
                    .iter()
                    .map(|kind| format!("{kind}={}", recorder.count(*kind)))
                    .collect::<Vec<String>>();
                info!("Calls received: {}", counts.join(", "));
            }
        }
    }

    info!("Shutting down");
    let discarded = drain.shutdown().await;
    debug!("Discarded {discarded} events");
    backend.stop().await;
    control_plane.stop().await;
    Ok(())
}
