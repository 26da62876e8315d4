// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Test-facing assertions over the calls recorded by the fake control plane.
//!
//! Every wait is bounded: a missing event turns into a [`HarnessError::Timeout`] naming the
//! assertion tag and the channel, never a hung test. Each successful wait consumes exactly one
//! event from its channel, so assertions on the same kind must be made in arrival order.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::attributes::{AttributeBag, BagVerifier, JsonBagVerifier};
use crate::control_plane::ControlPlaneRecorder;
use crate::error::HarnessError;
use crate::event_channel::{CallKind, RecordedEvent};

pub struct EventVerifier {
    recorder: Arc<ControlPlaneRecorder>,
    bag_verifier: Arc<dyn BagVerifier + Send + Sync>,
    timeout: Duration,
}

impl EventVerifier {
    /// `timeout` bounds the waits made by the `verify_*` helpers.
    pub fn new(recorder: Arc<ControlPlaneRecorder>, timeout: Duration) -> Self {
        Self {
            recorder,
            bag_verifier: Arc::new(JsonBagVerifier),
            timeout,
        }
    }

    pub fn with_bag_verifier(mut self, bag_verifier: Arc<dyn BagVerifier + Send + Sync>) -> Self {
        self.bag_verifier = bag_verifier;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn recorder(&self) -> &Arc<ControlPlaneRecorder> {
        &self.recorder
    }

    /// Waits for, and consumes, the next event of `kind`.
    pub async fn wait_for_next(
        &self,
        tag: &str,
        kind: CallKind,
        timeout: Duration,
    ) -> Result<RecordedEvent, HarnessError> {
        let channel = self.recorder.channel(kind);
        if channel.is_draining() {
            return Err(HarnessError::Draining {
                channel: kind.to_string(),
            });
        }
        if !channel.is_recording() {
            return Err(HarnessError::InvalidConfig(format!(
                "{kind} events are not recorded in stress mode"
            )));
        }

        match channel.recv_timeout(timeout).await {
            Some(event) => {
                debug!("{tag}: got {kind} event #{}", event.sequence);
                Ok(event)
            }
            None => Err(HarnessError::Timeout {
                tag: tag.to_string(),
                channel: kind.to_string(),
                waited: timeout,
            }),
        }
    }

    /// Fails if an event of `kind` shows up within `window`.
    pub async fn expect_no_event(
        &self,
        tag: &str,
        kind: CallKind,
        window: Duration,
    ) -> Result<(), HarnessError> {
        match self.wait_for_next(tag, kind, window).await {
            Ok(event) => Err(HarnessError::Mismatch {
                tag: tag.to_string(),
                what: format!("unexpected {kind} event #{}", event.sequence),
                actual: event.bag.to_string(),
                expected: "no event".to_string(),
            }),
            Err(e) if e.is_timeout() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn expect_count(&self, tag: &str, kind: CallKind, expected: u64) -> Result<(), HarnessError> {
        let actual = self.recorder.count(kind);
        if actual != expected {
            return Err(HarnessError::mismatch(
                tag,
                &format!("{kind} count"),
                actual,
                expected,
            ));
        }
        Ok(())
    }

    pub fn expect_bag(
        &self,
        tag: &str,
        bag: &AttributeBag,
        expected: &str,
    ) -> Result<(), HarnessError> {
        self.bag_verifier
            .verify(bag, expected)
            .map_err(|reason| HarnessError::Mismatch {
                tag: tag.to_string(),
                what: format!("attributes ({reason})"),
                actual: bag.to_string(),
                expected: expected.to_string(),
            })
    }

    pub fn expect_quota(
        &self,
        tag: &str,
        event: &RecordedEvent,
        name: &str,
        amount: i64,
    ) -> Result<(), HarnessError> {
        let Some(request) = event.quota_request() else {
            return Err(HarnessError::mismatch(
                tag,
                "event kind",
                event.kind,
                CallKind::Quota,
            ));
        };
        if request.name != name {
            return Err(HarnessError::mismatch(tag, "quota name", &request.name, name));
        }
        if request.amount != amount {
            return Err(HarnessError::mismatch(
                tag,
                "quota amount",
                request.amount,
                amount,
            ));
        }
        Ok(())
    }

    pub async fn verify_check(&self, tag: &str, expected: &str) -> Result<RecordedEvent, HarnessError> {
        let event = self.wait_for_next(tag, CallKind::Check, self.timeout).await?;
        self.expect_bag(&format!("{tag} check"), &event.bag, expected)?;
        Ok(event)
    }

    pub async fn verify_report(&self, tag: &str, expected: &str) -> Result<RecordedEvent, HarnessError> {
        let event = self.wait_for_next(tag, CallKind::Report, self.timeout).await?;
        self.expect_bag(&format!("{tag} report"), &event.bag, expected)?;
        Ok(event)
    }

    pub async fn verify_quota(
        &self,
        tag: &str,
        name: &str,
        amount: i64,
    ) -> Result<RecordedEvent, HarnessError> {
        let event = self.wait_for_next(tag, CallKind::Quota, self.timeout).await?;
        self.expect_quota(tag, &event, name, amount)?;
        Ok(event)
    }

    /// Starts discarding events on every channel until the returned guard is shut down or
    /// dropped.
    pub fn drain_all(&self) -> DrainGuard {
        self.drain(&CallKind::ALL)
    }

    pub fn drain(&self, kinds: &[CallKind]) -> DrainGuard {
        let cancel = CancellationToken::new();
        let tasks = kinds
            .iter()
            .map(|kind| {
                let channel = self.recorder.channel(*kind);
                let cancel = cancel.clone();
                tokio::spawn(async move { channel.drain(cancel).await })
            })
            .collect();
        DrainGuard { cancel, tasks }
    }
}

/// Background consumers started by [`EventVerifier::drain`]. Dropping the guard cancels them;
/// [`DrainGuard::shutdown`] also waits for them to finish.
pub struct DrainGuard {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<u64>>,
}

impl DrainGuard {
    /// Stops draining and returns the number of events discarded across all drained kinds.
    pub async fn shutdown(mut self) -> u64 {
        self.cancel.cancel();
        let mut discarded = 0;
        for task in self.tasks.drain(..) {
            match task.await {
                Ok(count) => discarded += count,
                Err(e) => debug!("Drain task ended abnormally: {e}"),
            }
        }
        discarded
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;
    use crate::protocol::{CheckRequest, QuotaRequest, ReportRequest};

    fn verifier() -> EventVerifier {
        let recorder = Arc::new(ControlPlaneRecorder::new(&HarnessConfig::default()));
        EventVerifier::new(recorder, Duration::from_millis(100))
    }

    fn publish_check(verifier: &EventVerifier, sequence: u64, bag: AttributeBag) {
        verifier
            .recorder()
            .channel(CallKind::Check)
            .publish(RecordedEvent::check(sequence, CheckRequest { attributes: bag }));
    }

    #[tokio::test]
    async fn test_wait_for_next_times_out_on_empty_channel() {
        let verifier = verifier();
        let started = std::time::Instant::now();
        let err = verifier
            .wait_for_next("NoTraffic", CallKind::Report, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            err.to_string(),
            "NoTraffic: timed out after 50ms waiting for report event"
        );
    }

    #[tokio::test]
    async fn test_verify_check_consumes_in_order() {
        let verifier = verifier();
        publish_check(&verifier, 1, AttributeBag::new().with("request_path", "/first"));
        publish_check(&verifier, 2, AttributeBag::new().with("request_path", "/second"));

        let first = verifier
            .verify_check("First", r#"{"request_path": "/first"}"#)
            .await
            .unwrap();
        assert_eq!(first.sequence, 1);
        let second = verifier
            .verify_check("Second", r#"{"request_path": "/second"}"#)
            .await
            .unwrap();
        assert_eq!(second.sequence, 2);
    }

    #[tokio::test]
    async fn test_verify_report_mismatch_reports_actual_and_expected() {
        let verifier = verifier();
        verifier.recorder().channel(CallKind::Report).publish(RecordedEvent::report(
            1,
            ReportRequest {
                attributes: AttributeBag::new().with("response_code", 503),
            },
        ));

        let err = verifier
            .verify_report("OKGet", r#"{"response_code": "200"}"#)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "OKGet report: attributes (attribute response_code: 503, expected: \"200\") doesn't match: \
             {response_code: 503}, expected: {\"response_code\": \"200\"}"
        );
    }

    #[tokio::test]
    async fn test_verify_quota() {
        let verifier = verifier();
        let quota = verifier.recorder().channel(CallKind::Quota);
        quota.publish(RecordedEvent::quota(1, QuotaRequest::new("requestcount", 1)));
        quota.publish(RecordedEvent::quota(2, QuotaRequest::new("requestcount", 5)));
        quota.publish(RecordedEvent::quota(3, QuotaRequest::new("bytes", 1)));

        verifier.verify_quota("Quota", "requestcount", 1).await.unwrap();

        let err = verifier
            .verify_quota("Quota", "requestcount", 1)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Quota: quota amount doesn't match: 5, expected: 1"
        );

        let err = verifier
            .verify_quota("Quota", "requestcount", 1)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Quota: quota name doesn't match: \"bytes\", expected: \"requestcount\""
        );
    }

    #[test]
    fn test_expect_quota_on_wrong_kind() {
        let verifier = verifier();
        let event = RecordedEvent::check(1, CheckRequest::default());
        let err = verifier
            .expect_quota("Quota", &event, "requestcount", 1)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Quota: event kind doesn't match: Check, expected: Quota"
        );
    }

    #[test]
    fn test_expect_count_on_fresh_server() {
        let verifier = verifier();
        assert!(verifier.expect_count("Fresh", CallKind::Check, 0).is_ok());
        let err = verifier.expect_count("Fresh", CallKind::Quota, 2).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Fresh: quota count doesn't match: 0, expected: 2"
        );
    }

    #[tokio::test]
    async fn test_expect_no_event() {
        let verifier = verifier();
        verifier
            .expect_no_event("Cached", CallKind::Check, Duration::from_millis(20))
            .await
            .unwrap();

        publish_check(&verifier, 1, AttributeBag::new());
        let err = verifier
            .expect_no_event("Cached", CallKind::Check, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Mismatch { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_drained_channel_rejects_waits_until_shutdown() {
        let verifier = verifier();
        let guard = verifier.drain(&[CallKind::Check]);
        let check = verifier.recorder().channel(CallKind::Check);
        while !check.is_draining() {
            tokio::task::yield_now().await;
        }

        let err = verifier
            .wait_for_next("Drained", CallKind::Check, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Draining { .. }), "{err}");

        guard.shutdown().await;
        assert!(!check.is_draining());
        publish_check(&verifier, 1, AttributeBag::new());
        verifier.verify_check("AfterDrain", "{}").await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_all_keeps_small_channels_from_overflowing() {
        let recorder = Arc::new(ControlPlaneRecorder::new(&HarnessConfig {
            event_channel_capacity: 2,
            ..Default::default()
        }));
        let verifier = EventVerifier::new(Arc::clone(&recorder), Duration::from_millis(100));
        let guard = verifier.drain_all();
        for kind in CallKind::ALL {
            while !recorder.channel(kind).is_draining() {
                tokio::task::yield_now().await;
            }
        }

        let reports = recorder.channel(CallKind::Report);
        let quotas = recorder.channel(CallKind::Quota);
        for sequence in 1..=5 {
            reports.publish(RecordedEvent::report(sequence, ReportRequest::default()));
            quotas.publish(RecordedEvent::quota(sequence, QuotaRequest::new("requestcount", 1)));
            while reports.queued() > 0 || quotas.queued() > 0 {
                tokio::task::yield_now().await;
            }
        }

        assert_eq!(guard.shutdown().await, 10);
        assert_eq!(reports.dropped(), 0);
        assert_eq!(quotas.dropped(), 0);
    }

    #[tokio::test]
    async fn test_stress_mode_waits_fail_fast() {
        let recorder = Arc::new(ControlPlaneRecorder::new(&HarnessConfig {
            stress: true,
            ..Default::default()
        }));
        let verifier = EventVerifier::new(recorder, Duration::from_secs(30));
        let err = verifier.verify_check("Stress", "{}").await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidConfig(_)), "{err}");
    }
}
