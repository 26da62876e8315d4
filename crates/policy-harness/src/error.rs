// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Errors surfaced by the harness to the test driving it.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// A component could not be started (bind failure, missing binary, ...).
    #[error("Failed to start {component}: {reason}")]
    Setup { component: String, reason: String },

    /// An expected event did not arrive in time.
    #[error("{tag}: timed out after {waited:?} waiting for {channel} event")]
    Timeout {
        tag: String,
        channel: String,
        waited: Duration,
    },

    /// An event arrived but did not match the expectation.
    #[error("{tag}: {what} doesn't match: {actual}, expected: {expected}")]
    Mismatch {
        tag: String,
        what: String,
        actual: String,
        expected: String,
    },

    #[error("Failed to decode {kind} payload: {reason}")]
    Decode { kind: String, reason: String },

    #[error("{kind} call failed with status {status}: {message}")]
    Rpc {
        kind: String,
        status: u16,
        message: String,
    },

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{channel} channel is being drained, events can't be awaited")]
    Draining { channel: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HarnessError {
    pub fn setup(component: impl Into<String>, reason: impl ToString) -> Self {
        HarnessError::Setup {
            component: component.into(),
            reason: reason.to_string(),
        }
    }

    pub fn mismatch(
        tag: &str,
        what: &str,
        actual: impl std::fmt::Debug,
        expected: impl std::fmt::Debug,
    ) -> Self {
        HarnessError::Mismatch {
            tag: tag.to_string(),
            what: what.to_string(),
            actual: format!("{actual:?}"),
            expected: format!("{expected:?}"),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HarnessError::Timeout { .. })
    }
}
