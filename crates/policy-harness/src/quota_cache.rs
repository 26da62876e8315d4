// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Executable model of a client-side prefetching quota cache.
//!
//! The cache asks the control plane for a batch of tokens the first time quota is needed and
//! answers later requests from that batch, going back to the control plane only once the batch
//! can't cover a request. A zero grant rejects the request. Under a steady low request rate this
//! keeps Quota calls far below the number of requests, while a finite control-plane allowance
//! still ends in observable rejections.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::client::ControlPlaneClient;
use crate::error::HarnessError;
use crate::protocol::QuotaRequest;

/// Smallest batch requested from the control plane.
pub const DEFAULT_MIN_PREFETCH: i64 = 10;
/// Largest batch requested from the control plane, unless a single request needs more.
pub const DEFAULT_MAX_PREFETCH: i64 = 20;

/// Where the cache gets its tokens from.
#[async_trait]
pub trait QuotaSource: Send + Sync {
    /// Asks for `amount` tokens of quota `name`, returning how many were granted.
    async fn request_quota(&self, name: &str, amount: i64) -> Result<i64, HarnessError>;
}

#[async_trait]
impl QuotaSource for ControlPlaneClient {
    async fn request_quota(&self, name: &str, amount: i64) -> Result<i64, HarnessError> {
        let response = self.quota(&QuotaRequest::new(name, amount)).await?;
        Ok(response.granted_amount)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchState {
    /// Nothing was ever fetched
    Empty,
    /// A Quota call is in flight
    Prefetching,
    /// Tokens are available locally
    Stocked,
    /// The local batch is used up, or the last refill was refused
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPrefetchConfig {
    pub min_prefetch: i64,
    pub max_prefetch: i64,
    /// Refill as soon as a request would leave fewer tokens than this. 0 refills only when a
    /// request can't be covered.
    pub refill_threshold: i64,
}

impl Default for QuotaPrefetchConfig {
    fn default() -> Self {
        Self {
            min_prefetch: DEFAULT_MIN_PREFETCH,
            max_prefetch: DEFAULT_MAX_PREFETCH,
            refill_threshold: 0,
        }
    }
}

impl QuotaPrefetchConfig {
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.min_prefetch < 1 {
            return Err(HarnessError::InvalidConfig(format!(
                "min prefetch must be at least 1, got {}",
                self.min_prefetch
            )));
        }
        if self.max_prefetch < self.min_prefetch {
            return Err(HarnessError::InvalidConfig(format!(
                "max prefetch {} is below min prefetch {}",
                self.max_prefetch, self.min_prefetch
            )));
        }
        // a negative threshold would admit requests the stock can't cover
        if self.refill_threshold < 0 {
            return Err(HarnessError::InvalidConfig(format!(
                "refill threshold must not be negative, got {}",
                self.refill_threshold
            )));
        }
        Ok(())
    }

    fn batch_size(&self, amount: i64) -> i64 {
        self.min_prefetch
            .max(amount)
            .min(self.max_prefetch.max(amount))
    }
}

#[derive(Debug)]
struct Stock {
    state: PrefetchState,
    tokens: i64,
}

pub struct QuotaPrefetch<S> {
    name: String,
    config: QuotaPrefetchConfig,
    source: S,
    stock: Mutex<Stock>,
    // serializes acquisitions so only one refill is ever in flight
    refill_lock: tokio::sync::Mutex<()>,
    rpc_count: AtomicU64,
}

impl<S: QuotaSource> QuotaPrefetch<S> {
    pub fn new(name: &str, config: QuotaPrefetchConfig, source: S) -> Result<Self, HarnessError> {
        config.validate()?;
        Ok(Self {
            name: name.to_string(),
            config,
            source,
            stock: Mutex::new(Stock {
                state: PrefetchState::Empty,
                tokens: 0,
            }),
            refill_lock: tokio::sync::Mutex::new(()),
            rpc_count: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PrefetchState {
        self.lock_stock().state
    }

    pub fn tokens(&self) -> i64 {
        self.lock_stock().tokens
    }

    /// Number of Quota calls made to the source so far.
    pub fn rpc_count(&self) -> u64 {
        self.rpc_count.load(Ordering::SeqCst)
    }

    fn lock_stock(&self) -> std::sync::MutexGuard<'_, Stock> {
        self.stock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Takes `amount` tokens, refilling from the source first if needed. Returns `Ok(false)` when
    /// the request is rejected for lack of quota.
    pub async fn acquire(&self, amount: i64) -> Result<bool, HarnessError> {
        if amount <= 0 {
            return Ok(true);
        }
        let _guard = self.refill_lock.lock().await;

        let tokens = {
            let mut stock = self.lock_stock();
            if stock.tokens - amount >= self.config.refill_threshold {
                return Ok(take(&mut stock, amount));
            }
            stock.state = PrefetchState::Prefetching;
            stock.tokens
        };

        let batch = self.config.batch_size(amount);
        self.rpc_count.fetch_add(1, Ordering::SeqCst);
        let granted = self.source.request_quota(&self.name, batch).await;

        let mut stock = self.lock_stock();
        let granted = match granted {
            Ok(granted) => granted.max(0),
            Err(e) => {
                warn!("Quota cache | refill of {} failed: {e}", self.name);
                stock.state = settled_state(tokens);
                return Err(e);
            }
        };
        debug!(
            "Quota cache | {} asked for {batch}, granted {granted}, {tokens} tokens left",
            self.name
        );
        stock.tokens += granted;

        if stock.tokens >= amount {
            Ok(take(&mut stock, amount))
        } else {
            stock.state = PrefetchState::Exhausted;
            Ok(false)
        }
    }
}

fn take(stock: &mut Stock, amount: i64) -> bool {
    stock.tokens -= amount;
    stock.state = settled_state(stock.tokens);
    true
}

fn settled_state(tokens: i64) -> PrefetchState {
    if tokens > 0 {
        PrefetchState::Stocked
    } else {
        PrefetchState::Exhausted
    }
}
