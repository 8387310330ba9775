use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::order::{OrderStatus, PaymentStatus};

/// Domain events emitted after a state change commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    CartItemAdded {
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    },
    CartItemRemoved {
        user_id: Uuid,
        product_id: Uuid,
    },
    CartCleared(Uuid),
    CouponRedeemed {
        code: String,
        order_id: Uuid,
    },
    OrderCreated {
        order_id: Uuid,
        user_id: Uuid,
        total: Decimal,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    PaymentStatusChanged {
        order_id: Uuid,
        payment_intent_id: String,
        old_status: PaymentStatus,
        new_status: PaymentStatus,
    },
    PaymentEventBuffered {
        payment_intent_id: String,
        outcome: PaymentStatus,
    },
}

/// Cloneable handle for publishing domain events.
#[derive(Clone, Debug)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Publishes without blocking or failing the caller; a closed or full channel is logged.
    pub fn send_or_log(&self, event: Event) {
        if let Err(e) = self.sender.try_send(event) {
            warn!(error = %e, "dropping domain event");
        }
    }
}

/// Consumes the event channel and writes an audit log line per event.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated {
                order_id,
                user_id,
                total,
            } => info!(%order_id, %user_id, %total, "order created"),
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => info!(%order_id, %old_status, %new_status, "order status changed"),
            Event::PaymentStatusChanged {
                order_id,
                payment_intent_id,
                old_status,
                new_status,
            } => info!(
                %order_id,
                payment_intent_id,
                %old_status,
                %new_status,
                "payment status changed"
            ),
            Event::PaymentEventBuffered {
                payment_intent_id,
                outcome,
            } => warn!(payment_intent_id, %outcome, "payment outcome buffered until order exists"),
            other => info!(event = ?other, "domain event"),
        }
    }

    info!("event processing loop stopped");
}
