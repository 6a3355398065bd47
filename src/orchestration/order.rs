//! Order processing workflow.
//!
//! ```text
//! join2(fetch-user, fetch-product)
//!   -> check-stock
//!   -> pay (fallback: pay-backup on transient errors)
//!   -> notify
//! ```
//!
//! The business operations themselves are behind [`OrderServices`]; this
//! module only wires them into a task graph.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::core::retry::RetryPolicy;
use crate::core::task::{Payload, Task};
use crate::orchestration::combinators::{chain, fallback, join2};
use crate::orchestration::context::TaskContext;
use crate::orchestration::orchestrator::Workflow;

pub const FETCH_USER: &str = "fetch-user";
pub const FETCH_PRODUCT: &str = "fetch-product";
pub const CHECK_STOCK: &str = "check-stock";
pub const PAY: &str = "pay";
pub const PAY_BACKUP: &str = "pay-backup";
pub const NOTIFY: &str = "notify";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_id: String,
    pub user_id: String,
    pub product_id: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub unit_price_cents: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReservation {
    pub reservation_id: String,
    pub product_id: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub transaction_id: String,
    pub amount_cents: u64,
    /// Which payment provider charged the order.
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmation {
    pub order_id: String,
    pub user: User,
    pub product: Product,
    pub reservation: StockReservation,
    pub receipt: PaymentReceipt,
    pub notification_id: String,
}

/// Errors raised by the order services.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderError {
    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("product not found: {0}")]
    ProductNotFound(String),

    #[error("insufficient stock for {product_id}: requested {requested}, available {available}")]
    OutOfStock {
        product_id: String,
        requested: u32,
        available: u32,
    },

    #[error("payment declined: {0}")]
    PaymentDeclined(String),

    #[error("payment provider unavailable: {0}")]
    PaymentUnavailable(String),

    #[error("notification failed: {0}")]
    NotificationFailed(String),
}

impl OrderError {
    /// Whether another payment provider might succeed where this one failed.
    pub fn is_transient(&self) -> bool {
        matches!(self, OrderError::PaymentUnavailable(_))
    }
}

/// External collaborators of the order workflow.
pub trait OrderServices: Send + Sync + 'static {
    fn fetch_user(&self, user_id: &str) -> impl Future<Output = Result<User, OrderError>> + Send;

    fn fetch_product(
        &self,
        product_id: &str,
    ) -> impl Future<Output = Result<Product, OrderError>> + Send;

    fn check_stock(
        &self,
        product: &Product,
        quantity: u32,
    ) -> impl Future<Output = Result<StockReservation, OrderError>> + Send;

    fn process_payment(
        &self,
        user: &User,
        amount_cents: u64,
    ) -> impl Future<Output = Result<PaymentReceipt, OrderError>> + Send;

    fn process_payment_backup(
        &self,
        user: &User,
        amount_cents: u64,
    ) -> impl Future<Output = Result<PaymentReceipt, OrderError>> + Send;

    fn send_notification(
        &self,
        user: &User,
        order_id: &str,
    ) -> impl Future<Output = Result<String, OrderError>> + Send;
}

/// Order state after stock has been reserved.
#[derive(Debug, Clone)]
struct Reserved {
    user: User,
    product: Product,
    reservation: StockReservation,
}

impl Reserved {
    fn amount_cents(&self) -> u64 {
        self.product.unit_price_cents * u64::from(self.reservation.quantity)
    }
}

/// Order state after payment.
#[derive(Debug, Clone)]
struct Paid {
    reserved: Reserved,
    receipt: PaymentReceipt,
}

/// The order processing workflow.
pub struct OrderWorkflow<S> {
    services: Arc<S>,
    step_timeout: Option<Duration>,
    fetch_retry: Option<RetryPolicy>,
}

impl<S> Clone for OrderWorkflow<S> {
    fn clone(&self) -> Self {
        Self {
            services: Arc::clone(&self.services),
            step_timeout: self.step_timeout,
            fetch_retry: self.fetch_retry.clone(),
        }
    }
}

impl<S: OrderServices> OrderWorkflow<S> {
    pub fn new(services: S) -> Self {
        Self::from_arc(Arc::new(services))
    }

    /// Share services with the caller, e.g. to inspect them after a run.
    pub fn from_arc(services: Arc<S>) -> Self {
        Self {
            services,
            step_timeout: None,
            fetch_retry: None,
        }
    }

    /// Bound every individual step.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    /// Retry the idempotent fetch steps.
    pub fn with_fetch_retry(mut self, policy: RetryPolicy) -> Self {
        self.fetch_retry = Some(policy);
        self
    }

    pub fn services(&self) -> &Arc<S> {
        &self.services
    }

    /// A leaf step calling into the services.
    fn step<V, F, Fut>(&self, name: &str, op: F) -> Task<V, OrderError>
    where
        V: Payload,
        F: Fn(Arc<S>, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, OrderError>> + Send + 'static,
    {
        let services = Arc::clone(&self.services);
        let task = Task::new(name, move |ctx| op(Arc::clone(&services), ctx));
        match self.step_timeout {
            Some(timeout) => task.with_timeout(timeout),
            None => task,
        }
    }

    fn fetch_user(&self, user_id: String) -> Task<User, OrderError> {
        let task = self.step(FETCH_USER, move |services, _ctx| {
            let user_id = user_id.clone();
            async move { services.fetch_user(&user_id).await }
        });
        self.apply_fetch_retry(task)
    }

    fn fetch_product(&self, product_id: String) -> Task<Product, OrderError> {
        let task = self.step(FETCH_PRODUCT, move |services, _ctx| {
            let product_id = product_id.clone();
            async move { services.fetch_product(&product_id).await }
        });
        self.apply_fetch_retry(task)
    }

    fn apply_fetch_retry<V: Payload>(&self, task: Task<V, OrderError>) -> Task<V, OrderError> {
        match &self.fetch_retry {
            Some(policy) => task.with_retry(policy.clone()),
            None => task,
        }
    }

    fn check_stock(&self, user: User, product: Product, quantity: u32) -> Task<Reserved, OrderError> {
        self.step(CHECK_STOCK, move |services, _ctx| {
            let (user, product) = (user.clone(), product.clone());
            async move {
                let reservation = services.check_stock(&product, quantity).await?;
                Ok(Reserved {
                    user,
                    product,
                    reservation,
                })
            }
        })
    }

    /// Charge the primary provider, falling back to the backup provider on
    /// transient errors. Other errors keep the original `pay` failure.
    fn pay(&self, reserved: Reserved) -> Task<Paid, OrderError> {
        let primary = self.charge(PAY, reserved.clone(), false);
        let this = self.clone();
        fallback("pay-or-backup", primary, move |failure| {
            let transient = failure.error.operation().is_some_and(OrderError::is_transient);
            if transient {
                this.charge(PAY_BACKUP, reserved.clone(), true)
            } else {
                Task::rejected(failure)
            }
        })
    }

    fn charge(&self, name: &str, reserved: Reserved, backup: bool) -> Task<Paid, OrderError> {
        self.step(name, move |services, _ctx| {
            let reserved = reserved.clone();
            async move {
                let amount = reserved.amount_cents();
                let receipt = if backup {
                    services.process_payment_backup(&reserved.user, amount).await?
                } else {
                    services.process_payment(&reserved.user, amount).await?
                };
                Ok(Paid { reserved, receipt })
            }
        })
        // Charging twice is worse than failing.
        .with_retry(RetryPolicy::none())
    }

    fn notify(&self, order_id: String, paid: Paid) -> Task<OrderConfirmation, OrderError> {
        self.step(NOTIFY, move |services, _ctx| {
            let (order_id, paid) = (order_id.clone(), paid.clone());
            async move {
                let notification_id = services
                    .send_notification(&paid.reserved.user, &order_id)
                    .await?;
                Ok(OrderConfirmation {
                    order_id,
                    user: paid.reserved.user,
                    product: paid.reserved.product,
                    reservation: paid.reserved.reservation,
                    receipt: paid.receipt,
                    notification_id,
                })
            }
        })
    }
}

impl<S: OrderServices> Workflow for OrderWorkflow<S> {
    type Input = OrderRequest;
    type Output = OrderConfirmation;
    type Error = OrderError;

    fn name(&self) -> &str {
        "process-order"
    }

    fn build(&self, request: OrderRequest) -> Task<OrderConfirmation, OrderError> {
        let fetched = join2(
            "fetch",
            self.fetch_user(request.user_id.clone()),
            self.fetch_product(request.product_id.clone()),
        );

        let this = self.clone();
        let quantity = request.quantity;
        let reserved = chain("reserve", fetched, move |(user, product)| {
            this.check_stock(user, product, quantity)
        });

        let this = self.clone();
        let paid = chain("charge", reserved, move |reserved| this.pay(reserved));

        let this = self.clone();
        let order_id = request.order_id;
        chain("process-order", paid, move |paid| {
            this.notify(order_id.clone(), paid)
        })
    }
}
