use crate::{
    entities::coupon::{self, normalize_code, DiscountType, IdList, NameList},
    entities::Coupon,
    errors::ServiceError,
    services::catalog::CatalogService,
};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait,
    DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Why a coupon was refused. Checks run in declaration order and stop at the first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CouponRejection {
    #[error("Invalid coupon code")]
    Invalid,
    #[error("Coupon is not valid yet")]
    NotYetValid,
    #[error("Coupon has expired")]
    Expired,
    #[error("Coupon has reached its maximum usage limit")]
    UsageExceeded,
    #[error("Minimum order amount of ₹{minimum} required for this coupon")]
    BelowMinimum { minimum: Decimal },
    #[error("This coupon is not valid for your account")]
    NotAllowedForUser,
    #[error("Coupon not applicable to any items in your cart")]
    NotApplicable,
}

impl CouponRejection {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::NotYetValid => "not_yet_valid",
            Self::Expired => "expired",
            Self::UsageExceeded => "usage_exceeded",
            Self::BelowMinimum { .. } => "below_minimum",
            Self::NotAllowedForUser => "not_allowed_for_user",
            Self::NotApplicable => "not_applicable",
        }
    }
}

/// Cart line as seen by coupon restrictions.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CartLineRef {
    pub product_id: Uuid,
    #[serde(default, alias = "categoryId")]
    pub category: Option<String>,
}

/// Runs every eligibility check against an already loaded coupon and returns the discount.
///
/// Pure: reads nothing but its arguments and never touches the usage counter.
pub fn evaluate(
    coupon: &coupon::Model,
    user_id: Uuid,
    cart_amount: Decimal,
    items: &[CartLineRef],
    now: DateTime<Utc>,
) -> Result<Decimal, CouponRejection> {
    if !coupon.is_active {
        return Err(CouponRejection::Invalid);
    }
    if now < coupon.start_date {
        return Err(CouponRejection::NotYetValid);
    }
    if now > coupon.end_date {
        return Err(CouponRejection::Expired);
    }
    if let Some(max_uses) = coupon.max_uses {
        if coupon.current_uses >= max_uses {
            return Err(CouponRejection::UsageExceeded);
        }
    }
    if cart_amount < coupon.min_order_amount {
        return Err(CouponRejection::BelowMinimum {
            minimum: coupon.min_order_amount.normalize(),
        });
    }
    if coupon.user_specific && !coupon.allowed_users.0.contains(&user_id) {
        return Err(CouponRejection::NotAllowedForUser);
    }
    if !applies_to_items(coupon, items) {
        return Err(CouponRejection::NotApplicable);
    }

    Ok(compute_discount(coupon, cart_amount))
}

fn applies_to_items(coupon: &coupon::Model, items: &[CartLineRef]) -> bool {
    let products = &coupon.products.0;
    let categories = &coupon.categories.0;
    if products.is_empty() && categories.is_empty() {
        return true;
    }
    items.iter().any(|item| {
        products.contains(&item.product_id)
            || item
                .category
                .as_ref()
                .map(|c| categories.iter().any(|allowed| allowed.eq_ignore_ascii_case(c)))
                .unwrap_or(false)
    })
}

/// Percentage discounts are capped by `max_discount_amount`; fixed discounts never exceed the cart.
pub fn compute_discount(coupon: &coupon::Model, cart_amount: Decimal) -> Decimal {
    let raw = match coupon.discount_type {
        DiscountType::Percentage => {
            // Percentages are at most 100, so the cart amount bounds the result.
            let amount = cart_amount
                .checked_mul(coupon.discount_value)
                .map(|product| product / Decimal::ONE_HUNDRED)
                .or_else(|| (cart_amount / Decimal::ONE_HUNDRED).checked_mul(coupon.discount_value))
                .unwrap_or(cart_amount)
                .min(cart_amount);
            match coupon.max_discount_amount {
                Some(cap) => amount.min(cap),
                None => amount,
            }
        }
        DiscountType::Fixed => coupon.discount_value.min(cart_amount),
    };
    raw.max(Decimal::ZERO)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CouponSummary {
    pub code: String,
    pub description: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub max_discount_amount: Option<Decimal>,
}

impl From<&coupon::Model> for CouponSummary {
    fn from(c: &coupon::Model) -> Self {
        Self {
            code: c.code.clone(),
            description: c.description.clone(),
            discount_type: c.discount_type,
            discount_value: c.discount_value,
            max_discount_amount: c.max_discount_amount,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CouponValidation {
    pub coupon: CouponSummary,
    pub discount_amount: Decimal,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CouponInput {
    #[validate(length(min = 3, max = 64))]
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    #[serde(default)]
    pub min_order_amount: Decimal,
    #[serde(default)]
    pub max_discount_amount: Option<Decimal>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    #[validate(range(min = 1))]
    pub max_uses: Option<i32>,
    #[serde(default)]
    pub user_specific: bool,
    #[serde(default)]
    pub allowed_users: Vec<Uuid>,
    #[serde(default)]
    pub products: Vec<Uuid>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Partial update. Nullable fields accept an explicit `null` to clear them.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CouponPatch {
    pub description: Option<String>,
    pub discount_type: Option<DiscountType>,
    pub discount_value: Option<Decimal>,
    pub min_order_amount: Option<Decimal>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<Decimal>)]
    pub max_discount_amount: Option<Option<Decimal>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<i32>)]
    pub max_uses: Option<Option<i32>>,
    pub user_specific: Option<bool>,
    pub allowed_users: Option<Vec<Uuid>>,
    pub products: Option<Vec<Uuid>>,
    pub categories: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn check_terms(
    discount_type: DiscountType,
    discount_value: Decimal,
    min_order_amount: Decimal,
    max_discount_amount: Option<Decimal>,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
) -> Result<(), ServiceError> {
    if discount_value.is_sign_negative() || min_order_amount.is_sign_negative() {
        return Err(ServiceError::ValidationError(
            "discount value and minimum order amount must not be negative".to_string(),
        ));
    }
    if discount_type == DiscountType::Percentage && discount_value > Decimal::ONE_HUNDRED {
        return Err(ServiceError::ValidationError(
            "percentage discount cannot exceed 100".to_string(),
        ));
    }
    if max_discount_amount.map_or(false, |cap| cap.is_sign_negative()) {
        return Err(ServiceError::ValidationError(
            "maxDiscountAmount must not be negative".to_string(),
        ));
    }
    if end_date <= start_date {
        return Err(ServiceError::ValidationError(
            "endDate must be after startDate".to_string(),
        ));
    }
    Ok(())
}

/// Coupon administration and checkout-time validation.
#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
    catalog: CatalogService,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>, catalog: CatalogService) -> Self {
        Self { db, catalog }
    }

    async fn find_by_code<C: ConnectionTrait>(
        conn: &C,
        code: &str,
    ) -> Result<Option<coupon::Model>, ServiceError> {
        Ok(Coupon::find()
            .filter(coupon::Column::Code.eq(normalize_code(code)))
            .one(conn)
            .await?)
    }

    /// Validates `code` for a cart and returns the discount it would grant.
    ///
    /// Cart lines without a category get it from the catalog when the coupon is
    /// category-restricted.
    #[instrument(skip(self, items))]
    pub async fn validate(
        &self,
        code: &str,
        user_id: Uuid,
        cart_amount: Decimal,
        items: &[CartLineRef],
    ) -> Result<CouponValidation, ServiceError> {
        if cart_amount.is_sign_negative() {
            return Err(ServiceError::ValidationError(
                "cartAmount must not be negative".to_string(),
            ));
        }

        let coupon = Self::find_by_code(&*self.db, code)
            .await?
            .filter(|c| c.is_active)
            .ok_or(CouponRejection::Invalid)?;

        let items = self.with_categories(&coupon, items).await?;
        let discount_amount = evaluate(&coupon, user_id, cart_amount, &items, Utc::now())?;

        Ok(CouponValidation {
            coupon: CouponSummary::from(&coupon),
            discount_amount,
        })
    }

    async fn with_categories(
        &self,
        coupon: &coupon::Model,
        items: &[CartLineRef],
    ) -> Result<Vec<CartLineRef>, ServiceError> {
        let missing: Vec<Uuid> = items
            .iter()
            .filter(|i| i.category.is_none())
            .map(|i| i.product_id)
            .collect();
        if coupon.categories.0.is_empty() || missing.is_empty() {
            return Ok(items.to_vec());
        }

        let categories: HashMap<Uuid, String> =
            self.catalog.categories_for(&missing).await?.into_iter().collect();
        Ok(items
            .iter()
            .map(|item| CartLineRef {
                product_id: item.product_id,
                category: item
                    .category
                    .clone()
                    .or_else(|| categories.get(&item.product_id).cloned()),
            })
            .collect())
    }

    /// Consumes one use of the coupon. The cap is checked in the same statement,
    /// so concurrent checkouts cannot push `current_uses` past `max_uses`.
    /// Returns false when the coupon is missing or exhausted.
    #[instrument(skip(self))]
    pub async fn increment_usage(&self, code: &str) -> Result<bool, ServiceError> {
        let result = Coupon::update_many()
            .col_expr(
                coupon::Column::CurrentUses,
                Expr::col(coupon::Column::CurrentUses).add(1),
            )
            .col_expr(coupon::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(coupon::Column::Code.eq(normalize_code(code)))
            .filter(
                Condition::any()
                    .add(coupon::Column::MaxUses.is_null())
                    .add(
                        Expr::col(coupon::Column::CurrentUses)
                            .lt(Expr::col(coupon::Column::MaxUses)),
                    ),
            )
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            warn!(code, "coupon usage not recorded: missing or exhausted");
            return Ok(false);
        }
        Ok(true)
    }

    #[instrument(skip(self, input), fields(code = %input.code))]
    pub async fn create_coupon(&self, input: CouponInput) -> Result<coupon::Model, ServiceError> {
        input.validate()?;
        check_terms(
            input.discount_type,
            input.discount_value,
            input.min_order_amount,
            input.max_discount_amount,
            input.start_date,
            input.end_date,
        )?;

        let code = normalize_code(&input.code);
        if Self::find_by_code(&*self.db, &code).await?.is_some() {
            return Err(ServiceError::Conflict(format!(
                "Coupon code {} already exists",
                code
            )));
        }

        let now = Utc::now();
        let model = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.clone()),
            description: Set(input.description),
            discount_type: Set(input.discount_type),
            discount_value: Set(input.discount_value),
            min_order_amount: Set(input.min_order_amount),
            max_discount_amount: Set(input.max_discount_amount),
            start_date: Set(input.start_date),
            end_date: Set(input.end_date),
            max_uses: Set(input.max_uses),
            current_uses: Set(0),
            user_specific: Set(input.user_specific),
            allowed_users: Set(IdList(input.allowed_users)),
            products: Set(IdList(input.products)),
            categories: Set(NameList(input.categories)),
            is_active: Set(input.is_active),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .map_err(|e| ServiceError::from_db_conflict(e, format!("Coupon code {} already exists", code)))?;

        info!(coupon_id = %model.id, code = %model.code, "coupon created");
        Ok(model)
    }

    pub async fn list_coupons(&self) -> Result<Vec<coupon::Model>, ServiceError> {
        Ok(Coupon::find()
            .order_by_desc(coupon::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    #[instrument(skip(self, patch))]
    pub async fn update_coupon(
        &self,
        coupon_id: Uuid,
        patch: CouponPatch,
    ) -> Result<coupon::Model, ServiceError> {
        let existing = Coupon::find_by_id(coupon_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Coupon {} not found", coupon_id)))?;

        let discount_type = patch.discount_type.unwrap_or(existing.discount_type);
        let discount_value = patch.discount_value.unwrap_or(existing.discount_value);
        let min_order_amount = patch.min_order_amount.unwrap_or(existing.min_order_amount);
        let max_discount_amount = patch
            .max_discount_amount
            .unwrap_or(existing.max_discount_amount);
        let start_date = patch.start_date.unwrap_or(existing.start_date);
        let end_date = patch.end_date.unwrap_or(existing.end_date);
        check_terms(
            discount_type,
            discount_value,
            min_order_amount,
            max_discount_amount,
            start_date,
            end_date,
        )?;

        let mut active: coupon::ActiveModel = existing.into();
        active.discount_type = Set(discount_type);
        active.discount_value = Set(discount_value);
        active.min_order_amount = Set(min_order_amount);
        active.max_discount_amount = Set(max_discount_amount);
        active.start_date = Set(start_date);
        active.end_date = Set(end_date);
        if let Some(description) = patch.description {
            active.description = Set(description);
        }
        if let Some(max_uses) = patch.max_uses {
            active.max_uses = Set(max_uses);
        }
        if let Some(user_specific) = patch.user_specific {
            active.user_specific = Set(user_specific);
        }
        if let Some(users) = patch.allowed_users {
            active.allowed_users = Set(IdList(users));
        }
        if let Some(products) = patch.products {
            active.products = Set(IdList(products));
        }
        if let Some(categories) = patch.categories {
            active.categories = Set(NameList(categories));
        }
        if let Some(is_active) = patch.is_active {
            active.is_active = Set(is_active);
        }
        active.updated_at = Set(Utc::now());

        let updated = active.update(&*self.db).await?;
        info!(%coupon_id, "coupon updated");
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn delete_coupon(&self, coupon_id: Uuid) -> Result<(), ServiceError> {
        let result = Coupon::delete_by_id(coupon_id).exec(&*self.db).await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "Coupon {} not found",
                coupon_id
            )));
        }
        info!(%coupon_id, "coupon deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Duration;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn coupon(discount_type: DiscountType, value: Decimal) -> coupon::Model {
        let now = Utc::now();
        coupon::Model {
            id: Uuid::new_v4(),
            code: "SAVE10".into(),
            description: "Ten percent off".into(),
            discount_type,
            discount_value: value,
            min_order_amount: Decimal::ZERO,
            max_discount_amount: None,
            start_date: now - Duration::days(1),
            end_date: now + Duration::days(1),
            max_uses: None,
            current_uses: 0,
            user_specific: false,
            allowed_users: IdList::default(),
            products: IdList::default(),
            categories: NameList::default(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn line(product_id: Uuid, category: &str) -> CartLineRef {
        CartLineRef {
            product_id,
            category: Some(category.to_string()),
        }
    }

    #[test]
    fn percentage_discount_is_capped() {
        let mut c = coupon(DiscountType::Percentage, dec!(10));
        c.max_discount_amount = Some(dec!(80));
        let discount = evaluate(&c, Uuid::new_v4(), dec!(1000), &[], Utc::now()).unwrap();
        assert_eq!(discount, dec!(80));
    }

    #[test]
    fn percentage_discount_below_cap_is_exact() {
        let mut c = coupon(DiscountType::Percentage, dec!(10));
        c.max_discount_amount = Some(dec!(500));
        assert_eq!(compute_discount(&c, dec!(1000)), dec!(100));
    }

    #[test]
    fn huge_cart_amounts_do_not_overflow() {
        let mut c = coupon(DiscountType::Percentage, dec!(50));
        let half = Decimal::MAX / Decimal::TWO;
        let discount = compute_discount(&c, Decimal::MAX);
        assert!(discount >= half - Decimal::ONE && discount <= half + Decimal::ONE);

        c.max_discount_amount = Some(dec!(80));
        assert_eq!(compute_discount(&c, Decimal::MAX), dec!(80));

        let full = coupon(DiscountType::Percentage, dec!(100));
        assert!(compute_discount(&full, Decimal::MAX) >= Decimal::MAX - Decimal::ONE);
    }

    #[test]
    fn fixed_discount_never_exceeds_cart() {
        let c = coupon(DiscountType::Fixed, dec!(300));
        assert_eq!(compute_discount(&c, dec!(250)), dec!(250));
        assert_eq!(compute_discount(&c, dec!(1000)), dec!(300));
    }

    #[test]
    fn checks_short_circuit_in_order() {
        let now = Utc::now();
        let user = Uuid::new_v4();

        let mut c = coupon(DiscountType::Fixed, dec!(50));
        c.is_active = false;
        c.max_uses = Some(1);
        c.current_uses = 1;
        assert_eq!(
            evaluate(&c, user, dec!(100), &[], now),
            Err(CouponRejection::Invalid)
        );

        let mut c = coupon(DiscountType::Fixed, dec!(50));
        c.start_date = now + Duration::hours(1);
        c.end_date = now + Duration::hours(2);
        assert_eq!(
            evaluate(&c, user, dec!(100), &[], now),
            Err(CouponRejection::NotYetValid)
        );

        let mut c = coupon(DiscountType::Fixed, dec!(50));
        c.end_date = now - Duration::hours(1);
        c.min_order_amount = dec!(1000);
        assert_eq!(
            evaluate(&c, user, dec!(100), &[], now),
            Err(CouponRejection::Expired)
        );

        let mut c = coupon(DiscountType::Fixed, dec!(50));
        c.max_uses = Some(3);
        c.current_uses = 3;
        assert_eq!(
            evaluate(&c, user, dec!(100), &[], now),
            Err(CouponRejection::UsageExceeded)
        );

        let mut c = coupon(DiscountType::Fixed, dec!(50));
        c.min_order_amount = dec!(500.0000);
        c.user_specific = true;
        let rejection = evaluate(&c, user, dec!(100), &[], now).unwrap_err();
        assert_eq!(
            rejection,
            CouponRejection::BelowMinimum { minimum: dec!(500) }
        );
        assert_eq!(
            rejection.to_string(),
            "Minimum order amount of ₹500 required for this coupon"
        );
    }

    #[test]
    fn user_specific_coupon_requires_allow_listing() {
        let user = Uuid::new_v4();
        let mut c = coupon(DiscountType::Fixed, dec!(50));
        c.user_specific = true;
        assert_eq!(
            evaluate(&c, user, dec!(100), &[], Utc::now()),
            Err(CouponRejection::NotAllowedForUser)
        );
        c.allowed_users = IdList(vec![user]);
        assert_eq!(evaluate(&c, user, dec!(100), &[], Utc::now()), Ok(dec!(50)));
    }

    #[test]
    fn restrictions_need_one_matching_line() {
        let product = Uuid::new_v4();
        let mut c = coupon(DiscountType::Fixed, dec!(50));
        c.categories = NameList(vec!["Posters".into()]);
        let user = Uuid::new_v4();

        assert_matches!(
            evaluate(&c, user, dec!(100), &[line(product, "cards")], Utc::now()),
            Err(CouponRejection::NotApplicable)
        );
        assert_matches!(
            evaluate(&c, user, dec!(100), &[line(product, "posters")], Utc::now()),
            Ok(_)
        );

        let mut c = coupon(DiscountType::Fixed, dec!(50));
        c.products = IdList(vec![product]);
        assert_matches!(
            evaluate(&c, user, dec!(100), &[line(product, "cards")], Utc::now()),
            Ok(_)
        );
    }

    #[test]
    fn rejection_codes_are_distinct() {
        let all = [
            CouponRejection::Invalid,
            CouponRejection::NotYetValid,
            CouponRejection::Expired,
            CouponRejection::UsageExceeded,
            CouponRejection::BelowMinimum {
                minimum: Decimal::ZERO,
            },
            CouponRejection::NotAllowedForUser,
            CouponRejection::NotApplicable,
        ];
        let codes: std::collections::HashSet<_> = all.iter().map(|r| r.code()).collect();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn patch_distinguishes_null_from_absent() {
        let patch: CouponPatch = serde_json::from_str(r#"{"maxUses": null}"#).unwrap();
        assert_eq!(patch.max_uses, Some(None));
        let patch: CouponPatch = serde_json::from_str("{}").unwrap();
        assert_eq!(patch.max_uses, None);
    }

    proptest! {
        #[test]
        fn discount_respects_bounds(
            cart in 0i64..10_000_000,
            pct in 0i64..=100,
            cap in 0i64..1_000_000,
            fixed in 0i64..10_000_000,
        ) {
            let cart = Decimal::new(cart, 2);
            let mut c = coupon(DiscountType::Percentage, Decimal::from(pct));
            c.max_discount_amount = Some(Decimal::new(cap, 2));
            let d = compute_discount(&c, cart);
            prop_assert!(d <= Decimal::new(cap, 2));
            prop_assert!(d >= Decimal::ZERO);

            let c = coupon(DiscountType::Fixed, Decimal::new(fixed, 2));
            let d = compute_discount(&c, cart);
            prop_assert!(d <= cart);
        }
    }
}
