use crate::{
    entities::order::{
        self, AppliedCoupon, BillingDetails, OrderLine, OrderLines, OrderStatus, PaymentStatus,
        ShippingDetails,
    },
    entities::{pending_payment_event, Order, PendingPaymentEvent},
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        cart::CartService,
        coupons::{CartLineRef, CouponService},
        notifications::OrderNotifier,
    },
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::{Expr, Func},
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

/// Highest page number served by the admin listing; larger requests are clamped.
pub const MAX_PAGE: u64 = 1_000_000;

/// Checkout snapshot submitted by the client once the payment intent exists.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderInput {
    pub items: Vec<OrderLine>,
    pub subtotal: Decimal,
    pub gst: Decimal,
    #[serde(default)]
    pub discount: Decimal,
    pub total: Decimal,
    #[serde(default)]
    pub coupon: Option<AppliedCoupon>,
    pub payment_intent_id: String,
    pub billing_details: BillingDetails,
}

impl CreateOrderInput {
    /// Structural checks that need no storage access.
    fn check_totals(&self) -> Result<(), ServiceError> {
        if self.items.is_empty() {
            return Err(ServiceError::ValidationError(
                "Order must contain at least one item".to_string(),
            ));
        }
        if self.payment_intent_id.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "paymentIntentId is required".to_string(),
            ));
        }
        for line in &self.items {
            if line.quantity < 1 {
                return Err(ServiceError::ValidationError(format!(
                    "Quantity for product {} must be at least 1",
                    line.product_id
                )));
            }
            if line.price.is_sign_negative() {
                return Err(ServiceError::ValidationError(format!(
                    "Price for product {} must not be negative",
                    line.product_id
                )));
            }
        }
        if [self.subtotal, self.gst, self.discount, self.total]
            .iter()
            .any(|amount| amount.is_sign_negative())
        {
            return Err(ServiceError::ValidationError(
                "Order amounts must not be negative".to_string(),
            ));
        }

        let out_of_range =
            || ServiceError::ValidationError("Order amounts are out of range".to_string());
        let computed = self
            .items
            .iter()
            .try_fold(Decimal::ZERO, |acc, line| {
                line.line_total().and_then(|t| acc.checked_add(t))
            })
            .ok_or_else(out_of_range)?;
        if computed != self.subtotal {
            return Err(ServiceError::ValidationError(format!(
                "Subtotal {} does not match item total {}",
                self.subtotal, computed
            )));
        }
        let expected_total = self
            .subtotal
            .checked_add(self.gst)
            .and_then(|sum| sum.checked_sub(self.discount))
            .ok_or_else(out_of_range)?;
        if expected_total != self.total {
            return Err(ServiceError::ValidationError(format!(
                "Total {} does not equal subtotal + gst - discount ({})",
                self.total, expected_total
            )));
        }

        match &self.coupon {
            Some(coupon) if coupon.discount != self.discount => {
                Err(ServiceError::ValidationError(format!(
                    "Coupon discount {} does not match order discount {}",
                    coupon.discount, self.discount
                )))
            }
            None if !self.discount.is_zero() => Err(ServiceError::ValidationError(
                "A discount requires a coupon".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

fn check_billing(billing: &BillingDetails) -> Result<(), ServiceError> {
    let required = [
        ("firstName", &billing.first_name),
        ("email", &billing.email),
        ("address", &billing.address),
        ("city", &billing.city),
        ("zipCode", &billing.zip_code),
        ("country", &billing.country),
    ];
    if let Some((field, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
        return Err(ServiceError::ValidationError(format!(
            "billingDetails.{} is required",
            field
        )));
    }
    if !billing.email.contains('@') {
        return Err(ServiceError::ValidationError(
            "billingDetails.email is not a valid address".to_string(),
        ));
    }
    Ok(())
}

/// Result of applying a verified payment outcome to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// The order moved to the new payment status.
    Applied(order::Model),
    /// The order was already in the target status.
    Duplicate(order::Model),
    /// The transition is not allowed from the order's current status.
    Ignored(order::Model),
    /// No order exists for the intent yet; the outcome was stored for replay.
    Buffered,
}

impl Reconciliation {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::Duplicate(_) => "duplicate",
            Self::Ignored(_) => "ignored",
            Self::Buffered => "buffered",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams, ToSchema)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct OrderListQuery {
    /// Fulfillment status, or `all`
    pub status: Option<String>,
    /// Matches order id, payment intent, customer name or email
    pub search: Option<String>,
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderPage {
    pub orders: Vec<order::Model>,
    pub total_pages: u64,
    pub current_page: u64,
    pub total_orders: u64,
}

/// Order ledger.
///
/// Payment status only changes through [`OrderService::reconcile_payment_event`],
/// fulfillment status only through [`OrderService::update_order_status`]. Both
/// writes are conditional on the previous state, so concurrent deliveries of
/// the same event apply at most once.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    coupons: CouponService,
    carts: CartService,
    notifier: OrderNotifier,
    default_page_size: u64,
    max_page_size: u64,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        coupons: CouponService,
        carts: CartService,
        notifier: OrderNotifier,
    ) -> Self {
        Self {
            db,
            event_sender,
            coupons,
            carts,
            notifier,
            default_page_size: 10,
            max_page_size: 100,
        }
    }

    pub fn with_page_sizes(mut self, default_page_size: u64, max_page_size: u64) -> Self {
        self.max_page_size = max_page_size.max(1);
        self.default_page_size = default_page_size.clamp(1, self.max_page_size);
        self
    }

    async fn find_by_intent(&self, intent_id: &str) -> Result<Option<order::Model>, ServiceError> {
        Ok(Order::find()
            .filter(order::Column::PaymentIntentId.eq(intent_id))
            .one(&*self.db)
            .await?)
    }

    /// Records a checkout. Amounts are checked against each other and the coupon
    /// is validated again; nothing the client sent is trusted as-is.
    #[instrument(skip(self, input), fields(payment_intent_id = %input.payment_intent_id))]
    pub async fn create_order(
        &self,
        user_id: Uuid,
        input: CreateOrderInput,
    ) -> Result<order::Model, ServiceError> {
        input.check_totals()?;
        check_billing(&input.billing_details)?;

        if let Some(applied) = &input.coupon {
            let lines: Vec<CartLineRef> = input
                .items
                .iter()
                .map(|line| CartLineRef {
                    product_id: line.product_id,
                    category: None,
                })
                .collect();
            let validation = self
                .coupons
                .validate(&applied.code, user_id, input.subtotal, &lines)
                .await?;
            if validation.discount_amount != applied.discount {
                return Err(ServiceError::ValidationError(format!(
                    "Coupon {} grants {} but the order claims {}",
                    validation.coupon.code, validation.discount_amount, applied.discount
                )));
            }
        }

        let intent_id = input.payment_intent_id.trim().to_string();
        let conflict = || format!("An order already exists for payment intent {}", intent_id);
        if self.find_by_intent(&intent_id).await?.is_some() {
            return Err(ServiceError::Conflict(conflict()));
        }

        let now = Utc::now();
        let coupon = input.coupon.map(|c| AppliedCoupon {
            code: crate::entities::coupon::normalize_code(&c.code),
            discount: c.discount,
        });
        let order = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            items: Set(OrderLines(input.items)),
            subtotal: Set(input.subtotal),
            gst: Set(input.gst),
            discount: Set(input.discount),
            total: Set(input.total),
            coupon: Set(coupon.clone()),
            payment_intent_id: Set(intent_id.clone()),
            payment_status: Set(PaymentStatus::Pending),
            order_status: Set(OrderStatus::Processing),
            shipping_details: Set(ShippingDetails::from(&input.billing_details)),
            customer_name: Set(input.billing_details.full_name()),
            customer_email: Set(input.billing_details.email.trim().to_lowercase()),
            billing_details: Set(input.billing_details),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .map_err(|e| ServiceError::from_db_conflict(e, conflict()))?;

        self.event_sender.send_or_log(Event::OrderCreated {
            order_id: order.id,
            user_id,
            total: order.total,
        });
        info!(order_id = %order.id, %user_id, total = %order.total, "order created");

        if let Some(coupon) = &coupon {
            match self.coupons.increment_usage(&coupon.code).await {
                Ok(true) => self.event_sender.send_or_log(Event::CouponRedeemed {
                    code: coupon.code.clone(),
                    order_id: order.id,
                }),
                Ok(false) => {}
                Err(e) => error!(
                    order_id = %order.id,
                    code = %coupon.code,
                    error = %e,
                    "failed to record coupon usage"
                ),
            }
        }

        if let Err(e) = self.carts.clear(user_id).await {
            error!(
                order_id = %order.id,
                %user_id,
                error = %e,
                "failed to clear cart after checkout"
            );
        }

        match self.replay_buffered(&intent_id).await {
            Ok(Some(updated)) => Ok(updated),
            Ok(None) => Ok(order),
            Err(e) => {
                error!(order_id = %order.id, error = %e, "failed to replay buffered payment event");
                Ok(order)
            }
        }
    }

    /// Applies a payment outcome stored before the order existed, then drops it.
    async fn replay_buffered(&self, intent_id: &str) -> Result<Option<order::Model>, ServiceError> {
        let Some(pending) = PendingPaymentEvent::find()
            .filter(pending_payment_event::Column::PaymentIntentId.eq(intent_id))
            .one(&*self.db)
            .await?
        else {
            return Ok(None);
        };

        info!(
            payment_intent_id = intent_id,
            outcome = %pending.outcome,
            "replaying buffered payment event"
        );
        let mut latest = None;
        for step in replay_path(pending.outcome) {
            match self
                .apply_to_order(intent_id, step, &pending.provider_event_id)
                .await?
            {
                Some(Reconciliation::Applied(order))
                | Some(Reconciliation::Duplicate(order))
                | Some(Reconciliation::Ignored(order)) => latest = Some(order),
                Some(Reconciliation::Buffered) | None => {}
            }
        }

        PendingPaymentEvent::delete_by_id(pending.id)
            .exec(&*self.db)
            .await?;
        Ok(latest)
    }

    /// Moves the order for `intent_id` to `outcome` if that is a legal transition.
    ///
    /// Redelivered events resolve to `Duplicate`; events for unknown intents
    /// are buffered and applied when the order is created.
    #[instrument(skip(self))]
    pub async fn reconcile_payment_event(
        &self,
        intent_id: &str,
        outcome: PaymentStatus,
        provider_event_id: &str,
    ) -> Result<Reconciliation, ServiceError> {
        if outcome.sources().is_empty() {
            return Err(ServiceError::InvalidOperation(format!(
                "{} is not a reachable payment status",
                outcome
            )));
        }

        if let Some(result) = self
            .apply_to_order(intent_id, outcome, provider_event_id)
            .await?
        {
            return Ok(result);
        }

        self.buffer_event(intent_id, outcome, provider_event_id)
            .await?;

        // The order may have been created while the event was being stored.
        if self.find_by_intent(intent_id).await?.is_some() {
            if let Some(updated) = self.replay_buffered(intent_id).await? {
                return Ok(Reconciliation::Applied(updated));
            }
        }
        Ok(Reconciliation::Buffered)
    }

    /// `None` when no order exists for the intent.
    async fn apply_to_order(
        &self,
        intent_id: &str,
        outcome: PaymentStatus,
        provider_event_id: &str,
    ) -> Result<Option<Reconciliation>, ServiceError> {
        let Some(current) = self.find_by_intent(intent_id).await? else {
            return Ok(None);
        };
        if current.payment_status == outcome {
            info!(order_id = %current.id, %outcome, provider_event_id, "duplicate payment event");
            return Ok(Some(Reconciliation::Duplicate(current)));
        }

        let result = Order::update_many()
            .col_expr(order::Column::PaymentStatus, Expr::value(outcome))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::PaymentIntentId.eq(intent_id))
            .filter(order::Column::PaymentStatus.is_in(outcome.sources()))
            .exec(&*self.db)
            .await?;

        let Some(updated) = self.find_by_intent(intent_id).await? else {
            return Ok(None);
        };

        if result.rows_affected == 0 {
            if updated.payment_status == outcome {
                return Ok(Some(Reconciliation::Duplicate(updated)));
            }
            warn!(
                order_id = %updated.id,
                from = %updated.payment_status,
                to = %outcome,
                provider_event_id,
                "ignoring illegal payment transition"
            );
            return Ok(Some(Reconciliation::Ignored(updated)));
        }

        self.event_sender.send_or_log(Event::PaymentStatusChanged {
            order_id: updated.id,
            payment_intent_id: intent_id.to_string(),
            old_status: current.payment_status,
            new_status: outcome,
        });
        info!(
            order_id = %updated.id,
            from = %current.payment_status,
            to = %outcome,
            provider_event_id,
            "payment status updated"
        );

        if outcome == PaymentStatus::Succeeded {
            self.notifier.order_paid(&updated).await;
        }
        Ok(Some(Reconciliation::Applied(updated)))
    }

    /// Stores the outcome for an intent with no order. A later outcome replaces
    /// an earlier one only when it is a legal successor of it.
    async fn buffer_event(
        &self,
        intent_id: &str,
        outcome: PaymentStatus,
        provider_event_id: &str,
    ) -> Result<(), ServiceError> {
        let existing = PendingPaymentEvent::find()
            .filter(pending_payment_event::Column::PaymentIntentId.eq(intent_id))
            .one(&*self.db)
            .await?;

        match existing {
            Some(pending) if pending.outcome.can_transition_to(outcome) => {
                let mut active: pending_payment_event::ActiveModel = pending.into();
                active.outcome = Set(outcome);
                active.provider_event_id = Set(provider_event_id.to_string());
                active.received_at = Set(Utc::now());
                active.update(&*self.db).await?;
            }
            Some(_) => {
                info!(
                    payment_intent_id = intent_id,
                    %outcome,
                    "buffered payment event already newer"
                );
                return Ok(());
            }
            None => {
                let inserted = pending_payment_event::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    payment_intent_id: Set(intent_id.to_string()),
                    outcome: Set(outcome),
                    provider_event_id: Set(provider_event_id.to_string()),
                    received_at: Set(Utc::now()),
                }
                .insert(&*self.db)
                .await;
                if let Err(e) = inserted {
                    match ServiceError::from_db_conflict(e, "payment event already buffered") {
                        ServiceError::Conflict(_) => return Ok(()),
                        other => return Err(other),
                    }
                }
            }
        }

        self.event_sender.send_or_log(Event::PaymentEventBuffered {
            payment_intent_id: intent_id.to_string(),
            outcome,
        });
        warn!(
            payment_intent_id = intent_id,
            %outcome,
            "no order for payment intent yet, event buffered"
        );
        Ok(())
    }

    /// Admin fulfillment update. Re-setting the current status changes nothing.
    #[instrument(skip(self))]
    pub async fn update_order_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        let current = self.get_order(order_id).await?;
        if current.order_status == new_status {
            return Ok(current);
        }
        if !current.order_status.can_transition_to(new_status) {
            return Err(ServiceError::InvalidStatus(format!(
                "cannot move order from {} to {}",
                current.order_status, new_status
            )));
        }

        let result = Order::update_many()
            .col_expr(order::Column::OrderStatus, Expr::value(new_status))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::OrderStatus.eq(current.order_status))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(order_id));
        }

        let updated = self.get_order(order_id).await?;
        self.event_sender.send_or_log(Event::OrderStatusChanged {
            order_id,
            old_status: current.order_status,
            new_status,
        });
        info!(%order_id, from = %current.order_status, to = %new_status, "order status updated");

        if new_status.notifies_customer() {
            self.notifier.order_status_changed(&updated).await;
        }
        Ok(updated)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    pub async fn list_user_orders(&self, user_id: Uuid) -> Result<Vec<order::Model>, ServiceError> {
        Ok(Order::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// Admin listing, newest first.
    #[instrument(skip(self))]
    pub async fn list_orders(&self, query: OrderListQuery) -> Result<OrderPage, ServiceError> {
        let page = query.page.unwrap_or(1).clamp(1, MAX_PAGE);
        let limit = query
            .limit
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size);

        let mut select = Order::find();

        if let Some(status) = query
            .status
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("all"))
        {
            let status: OrderStatus = status.to_lowercase().parse().map_err(|_| {
                ServiceError::ValidationError(format!("Unknown order status {}", status))
            })?;
            select = select.filter(order::Column::OrderStatus.eq(status));
        }

        if let Some(search) = query.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let pattern = format!("%{}%", search.to_lowercase());
            let mut any = Condition::any()
                .add(Expr::expr(Func::lower(Expr::col(order::Column::CustomerName))).like(&pattern))
                .add(order::Column::CustomerEmail.like(&pattern))
                .add(order::Column::PaymentIntentId.eq(search));
            if let Ok(id) = Uuid::parse_str(search) {
                any = any.add(order::Column::Id.eq(id));
            }
            select = select.filter(any);
        }

        let paginator = select
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, limit);
        let total_orders = paginator.num_items().await?;
        let orders = paginator.fetch_page(page - 1).await?;

        Ok(OrderPage {
            orders,
            total_pages: total_orders.div_ceil(limit),
            current_page: page,
            total_orders,
        })
    }
}

/// Statuses to apply, in order, to bring a freshly created order to `outcome`.
fn replay_path(outcome: PaymentStatus) -> Vec<PaymentStatus> {
    match outcome {
        PaymentStatus::Refunded => vec![PaymentStatus::Succeeded, PaymentStatus::Refunded],
        PaymentStatus::Pending => Vec::new(),
        other => vec![other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn billing() -> BillingDetails {
        BillingDetails {
            first_name: "Asha".into(),
            last_name: "Rao".into(),
            email: "asha@example.com".into(),
            phone: "9999999999".into(),
            address: "12 MG Road".into(),
            city: "Pune".into(),
            state: "MH".into(),
            zip_code: "411001".into(),
            country: "IN".into(),
            organization_name: None,
            organization_email: None,
            gst_number: None,
        }
    }

    fn input(total: Decimal, discount: Decimal, coupon: Option<AppliedCoupon>) -> CreateOrderInput {
        CreateOrderInput {
            items: vec![OrderLine {
                product_id: Uuid::new_v4(),
                name: "Poster".into(),
                image: None,
                quantity: 2,
                price: dec!(500),
                client_info: Default::default(),
            }],
            subtotal: dec!(1000),
            gst: dec!(180),
            discount,
            total,
            coupon,
            payment_intent_id: "pi_1".into(),
            billing_details: billing(),
        }
    }

    fn coupon(discount: Decimal) -> Option<AppliedCoupon> {
        Some(AppliedCoupon {
            code: "SAVE10".into(),
            discount,
        })
    }

    #[test]
    fn totals_must_add_up() {
        assert!(input(dec!(1100), dec!(80), coupon(dec!(80))).check_totals().is_ok());
        assert_matches!(
            input(dec!(1180), dec!(80), coupon(dec!(80))).check_totals(),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn overflowing_amounts_are_rejected() {
        let mut order = input(dec!(1100), dec!(0), None);
        order.items[0].price = Decimal::MAX;
        assert_matches!(order.check_totals(), Err(ServiceError::ValidationError(_)));

        let mut order = input(dec!(1100), dec!(0), None);
        order.items.push(order.items[0].clone());
        order.items[0].price = Decimal::MAX;
        order.items[0].quantity = 1;
        assert_matches!(order.check_totals(), Err(ServiceError::ValidationError(_)));

        let mut order = input(Decimal::MAX, dec!(0), None);
        order.gst = Decimal::MAX;
        assert_matches!(order.check_totals(), Err(ServiceError::ValidationError(_)));
    }

    #[test]
    fn subtotal_must_match_lines() {
        let mut order = input(dec!(1180), dec!(0), None);
        order.subtotal = dec!(900);
        order.total = dec!(1080);
        assert_matches!(order.check_totals(), Err(ServiceError::ValidationError(_)));
    }

    #[test]
    fn discount_needs_matching_coupon() {
        assert_matches!(
            input(dec!(1100), dec!(80), None).check_totals(),
            Err(ServiceError::ValidationError(_))
        );
        assert_matches!(
            input(dec!(1100), dec!(80), coupon(dec!(50))).check_totals(),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn empty_and_zero_quantity_orders_are_rejected() {
        let mut order = input(dec!(1180), dec!(0), None);
        order.items[0].quantity = 0;
        assert!(order.check_totals().is_err());

        let mut order = input(dec!(1180), dec!(0), None);
        order.items.clear();
        assert!(order.check_totals().is_err());
    }

    #[test]
    fn billing_requires_contact_fields() {
        assert!(check_billing(&billing()).is_ok());
        let mut b = billing();
        b.email = "not-an-email".into();
        assert!(check_billing(&b).is_err());
        let mut b = billing();
        b.city = "  ".into();
        assert!(check_billing(&b).is_err());
    }

    #[test]
    fn refunds_replay_through_success() {
        assert_eq!(
            replay_path(PaymentStatus::Refunded),
            vec![PaymentStatus::Succeeded, PaymentStatus::Refunded]
        );
        assert_eq!(replay_path(PaymentStatus::Failed), vec![PaymentStatus::Failed]);
    }
}
