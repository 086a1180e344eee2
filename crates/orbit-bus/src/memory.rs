//! In-memory topic exchange for single-node deployments and tests.
//!
//! Several gateways sharing one `MemoryExchange` behave like several
//! instances attached to the same broker.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::topic::{topic_matches, validate_binding};
use crate::traits::{BusError, Delivery, Exchange, Subscription};

struct Binding {
    patterns: Vec<String>,
    sender: mpsc::UnboundedSender<Result<Delivery, BusError>>,
}

/// In-process topic exchange.
pub struct MemoryExchange {
    bindings: Mutex<Vec<Binding>>,
    available: AtomicBool,
    published: AtomicU64,
}

impl MemoryExchange {
    /// Create an empty exchange.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bindings: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            published: AtomicU64::new(0),
        }
    }

    /// Number of messages accepted since creation.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        let mut bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
        bindings.retain(|binding| !binding.sender.is_closed());
        bindings.len()
    }

    /// Simulate the broker going away or coming back.
    ///
    /// While unavailable, publishes and subscribes fail. Going unavailable
    /// also ends every open subscription.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.disconnect_all();
        }
        debug!(available, "Memory exchange availability changed");
    }

    /// End every open subscription, as a dropped broker connection would.
    pub fn disconnect_all(&self) {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn ensure_available(&self) -> Result<(), BusError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Unreachable("memory exchange unavailable".into()))
        }
    }
}

impl Default for MemoryExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exchange for MemoryExchange {
    async fn publish(&self, delivery: Delivery) -> Result<(), BusError> {
        self.ensure_available()?;

        let mut bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
        bindings.retain(|binding| !binding.sender.is_closed());

        let mut routed = 0;
        for binding in bindings.iter() {
            let matched = binding
                .patterns
                .iter()
                .any(|pattern| topic_matches(pattern, &delivery.routing_key));
            if matched && binding.sender.send(Ok(delivery.clone())).is_ok() {
                routed += 1;
            }
        }

        self.published.fetch_add(1, Ordering::SeqCst);
        trace!(routing_key = %delivery.routing_key, routed, "Published to memory exchange");
        Ok(())
    }

    async fn subscribe(&self, bindings: &[String]) -> Result<Subscription, BusError> {
        self.ensure_available()?;
        for pattern in bindings {
            validate_binding(pattern)?;
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Binding {
                patterns: bindings.to_vec(),
                sender,
            });

        debug!(?bindings, "Subscribed to memory exchange");

        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed())
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_healthy(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}
