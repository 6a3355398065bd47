//! In-process stand-ins for external services.
//!
//! Used by the CLI demos and the tests: every call sleeps for a configurable
//! latency and is counted, and one step can be told to fail.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::task::Task;
use crate::orchestration::order::{
    OrderError, OrderServices, PaymentReceipt, Product, StockReservation, User, CHECK_STOCK,
    FETCH_PRODUCT, FETCH_USER, NOTIFY, PAY, PAY_BACKUP,
};

const STEPS: [&str; 6] = [FETCH_USER, FETCH_PRODUCT, CHECK_STOCK, PAY, PAY_BACKUP, NOTIFY];

/// Units in stock for every simulated product.
pub const SIMULATED_STOCK: u32 = 10;

/// How an injected failure behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// The provider is unavailable; another provider may succeed.
    Transient,
    /// The request itself is rejected.
    Permanent,
}

/// Order services backed by nothing but timers and counters.
#[derive(Debug)]
pub struct SimulatedOrderServices {
    latency: Duration,
    failing: Option<(String, FailureMode)>,
    calls: [AtomicUsize; STEPS.len()],
    next_id: AtomicU64,
}

impl Default for SimulatedOrderServices {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedOrderServices {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            failing: None,
            calls: Default::default(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make every call to `step` fail.
    pub fn failing(mut self, step: impl Into<String>, mode: FailureMode) -> Self {
        self.failing = Some((step.into(), mode));
        self
    }

    /// How many times `step` was invoked.
    pub fn calls(&self, step: &str) -> usize {
        STEPS
            .iter()
            .position(|s| *s == step)
            .map_or(0, |i| self.calls[i].load(Ordering::SeqCst))
    }

    /// Count the call, wait out the latency, and report the injected
    /// failure mode for `step`, if any.
    async fn enter(&self, step: &str) -> Option<FailureMode> {
        if let Some(i) = STEPS.iter().position(|s| *s == step) {
            self.calls[i].fetch_add(1, Ordering::SeqCst);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match &self.failing {
            Some((failing, mode)) if failing == step => Some(*mode),
            _ => None,
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{:04}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn charge(
        &self,
        step: &str,
        provider: &str,
        user: &User,
        amount_cents: u64,
    ) -> Result<PaymentReceipt, OrderError> {
        match self.enter(step).await {
            Some(FailureMode::Transient) => Err(OrderError::PaymentUnavailable(format!(
                "{} provider timed out",
                provider
            ))),
            Some(FailureMode::Permanent) => Err(OrderError::PaymentDeclined(format!(
                "card for {} was declined",
                user.id
            ))),
            None => Ok(PaymentReceipt {
                transaction_id: self.next_id("txn"),
                amount_cents,
                provider: provider.to_string(),
            }),
        }
    }
}

impl OrderServices for SimulatedOrderServices {
    async fn fetch_user(&self, user_id: &str) -> Result<User, OrderError> {
        if self.enter(FETCH_USER).await.is_some() {
            return Err(OrderError::UserNotFound(user_id.to_string()));
        }
        Ok(User {
            id: user_id.to_string(),
            name: format!("Customer {}", user_id),
            email: format!("{}@example.com", user_id),
        })
    }

    async fn fetch_product(&self, product_id: &str) -> Result<Product, OrderError> {
        if self.enter(FETCH_PRODUCT).await.is_some() {
            return Err(OrderError::ProductNotFound(product_id.to_string()));
        }
        Ok(Product {
            id: product_id.to_string(),
            name: format!("Product {}", product_id),
            unit_price_cents: 1_250,
        })
    }

    async fn check_stock(
        &self,
        product: &Product,
        quantity: u32,
    ) -> Result<StockReservation, OrderError> {
        let available = match self.enter(CHECK_STOCK).await {
            Some(_) => 0,
            None => SIMULATED_STOCK,
        };
        if quantity > available {
            return Err(OrderError::OutOfStock {
                product_id: product.id.clone(),
                requested: quantity,
                available,
            });
        }
        Ok(StockReservation {
            reservation_id: self.next_id("rsv"),
            product_id: product.id.clone(),
            quantity,
        })
    }

    async fn process_payment(
        &self,
        user: &User,
        amount_cents: u64,
    ) -> Result<PaymentReceipt, OrderError> {
        self.charge(PAY, "primary", user, amount_cents).await
    }

    async fn process_payment_backup(
        &self,
        user: &User,
        amount_cents: u64,
    ) -> Result<PaymentReceipt, OrderError> {
        self.charge(PAY_BACKUP, "backup", user, amount_cents).await
    }

    async fn send_notification(&self, user: &User, order_id: &str) -> Result<String, OrderError> {
        if self.enter(NOTIFY).await.is_some() {
            return Err(OrderError::NotificationFailed(format!(
                "mailbox {} rejected order {}",
                user.email, order_id
            )));
        }
        Ok(self.next_id("msg"))
    }
}

/// Result of a simulated download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Download {
    pub name: String,
    pub bytes: u64,
}

/// A leaf task that "downloads" for `latency`, stopping early if cancelled.
pub fn simulated_download(name: impl Into<String>, latency: Duration) -> Task<Download, String> {
    let name = name.into();
    Task::new(name.clone(), move |ctx| {
        let name = name.clone();
        async move {
            tokio::select! {
                _ = ctx.cancelled() => Err(format!("download {} cancelled", name)),
                _ = tokio::time::sleep(latency) => Ok(Download {
                    bytes: 1024 * (name.len() as u64 + 1),
                    name,
                }),
            }
        }
    })
}
