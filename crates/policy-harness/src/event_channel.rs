// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-kind queues of recorded control-plane calls.
//!
//! The fake control plane is the only producer of each channel and never blocks on it: events are
//! offered with `try_send` and dropped (with a warning) when the channel is full, so a test that
//! stops reading can't stall the server and, through it, the proxy under test. Readers are
//! serialized by a mutex around the receiver, so at most one verifier consumes a kind at a time.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::attributes::AttributeBag;
use crate::protocol::{CheckRequest, QuotaRequest, ReportRequest};

pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Check,
    Report,
    Quota,
}

impl CallKind {
    pub const ALL: [CallKind; 3] = [CallKind::Check, CallKind::Report, CallKind::Quota];

    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Check => "check",
            CallKind::Report => "report",
            CallKind::Quota => "quota",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The decoded request a recorded event was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Check(CheckRequest),
    Report(ReportRequest),
    Quota(QuotaRequest),
}

/// One inbound control-plane call, as seen by the fake server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub kind: CallKind,
    /// 1-based position of this call among calls of the same kind
    pub sequence: u64,
    pub bag: AttributeBag,
    pub raw: Payload,
}

impl RecordedEvent {
    pub fn check(sequence: u64, request: CheckRequest) -> Self {
        Self {
            kind: CallKind::Check,
            sequence,
            bag: request.attributes.clone(),
            raw: Payload::Check(request),
        }
    }

    pub fn report(sequence: u64, request: ReportRequest) -> Self {
        Self {
            kind: CallKind::Report,
            sequence,
            bag: request.attributes.clone(),
            raw: Payload::Report(request),
        }
    }

    pub fn quota(sequence: u64, request: QuotaRequest) -> Self {
        Self {
            kind: CallKind::Quota,
            sequence,
            bag: AttributeBag::new(),
            raw: Payload::Quota(request),
        }
    }

    /// The quota request carried by a Quota event.
    pub fn quota_request(&self) -> Option<&QuotaRequest> {
        match &self.raw {
            Payload::Quota(request) => Some(request),
            _ => None,
        }
    }
}

pub struct EventChannel<T> {
    kind: CallKind,
    recording: bool,
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    published: AtomicU64,
    dropped: AtomicU64,
    draining: AtomicBool,
}

impl<T: Send + 'static> EventChannel<T> {
    /// Creates a channel holding at most `capacity` unread events. A channel that isn't
    /// `recording` accepts and discards everything (stress mode).
    pub fn new(kind: CallKind, capacity: usize, recording: bool) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            kind,
            recording,
            tx,
            rx: Mutex::new(rx),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            draining: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Number of events queued so far, whether or not they have been read yet.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    /// Number of events waiting to be read.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Number of events discarded because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Offers an event without waiting. Returns whether the event was queued.
    pub fn publish(&self, event: T) -> bool {
        if !self.recording {
            return false;
        }
        match self.tx.try_send(event) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::AcqRel);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "{} channel is full, dropping event ({} dropped so far)",
                    self.kind, dropped
                );
                false
            }
            // the receiver lives as long as self
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Waits up to `timeout` for the next event, consuming it.
    ///
    /// The timeout also bounds the wait for another reader to release the receiver.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        })
        .await
        .ok()
        .flatten()
    }

    /// Takes the next event if one is already queued and no other reader holds the receiver.
    pub fn try_recv(&self) -> Option<T> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// Discards every event until `cancel` fires and returns how many were discarded. Holds the
    /// receiver for the whole time.
    pub async fn drain(&self, cancel: CancellationToken) -> u64 {
        let mut rx = self.rx.lock().await;
        self.draining.store(true, Ordering::Release);
        debug!("Draining {} channel", self.kind);

        let mut discarded = 0u64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(_) => discarded += 1,
                    None => break,
                },
            }
        }

        self.draining.store(false, Ordering::Release);
        debug!(
            "Stopped draining {} channel, {} events discarded",
            self.kind, discarded
        );
        discarded
    }
}
