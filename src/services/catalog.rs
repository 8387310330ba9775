use crate::{
    entities::product::{self, ImageList, ProductStatus},
    entities::{cart, cart_item, Cart, CartItem, Product},
    errors::ServiceError,
    services::cart::recompute_total,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Product catalog: admin CRUD plus the public listing of active products.
#[derive(Clone)]
pub struct CatalogService {
    db: Arc<DatabaseConnection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProductInput {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub price: Decimal,
    #[serde(default)]
    pub original_price: Option<Decimal>,
    #[validate(length(min = 1, max = 100))]
    pub category: String,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub delivery_time: Option<String>,
    #[serde(default)]
    pub status: Option<ProductStatus>,
}

impl ProductInput {
    fn check_prices(&self) -> Result<(), ServiceError> {
        if self.price.is_sign_negative() {
            return Err(ServiceError::ValidationError(
                "price must not be negative".to_string(),
            ));
        }
        if let Some(original) = self.original_price {
            if self.price > original {
                return Err(ServiceError::ValidationError(
                    "price must not exceed originalPrice".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl CatalogService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_product(&self, input: ProductInput) -> Result<product::Model, ServiceError> {
        input.validate()?;
        input.check_prices()?;

        let now = Utc::now();
        let model = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(input.name.trim().to_string()),
            description: Set(input.description),
            price: Set(input.price),
            original_price: Set(input.original_price),
            category: Set(input.category.trim().to_string()),
            subcategory: Set(input.subcategory),
            images: Set(ImageList(input.images)),
            delivery_time: Set(input.delivery_time),
            status: Set(input.status.unwrap_or(ProductStatus::Draft)),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        info!(product_id = %model.id, "product created");
        Ok(model)
    }

    #[instrument(skip(self, input))]
    pub async fn update_product(
        &self,
        product_id: Uuid,
        input: ProductInput,
    ) -> Result<product::Model, ServiceError> {
        input.validate()?;
        input.check_prices()?;

        let existing = self.get_product(product_id).await?;
        let mut active: product::ActiveModel = existing.into();
        active.name = Set(input.name.trim().to_string());
        active.description = Set(input.description);
        active.price = Set(input.price);
        active.original_price = Set(input.original_price);
        active.category = Set(input.category.trim().to_string());
        active.subcategory = Set(input.subcategory);
        active.images = Set(ImageList(input.images));
        active.delivery_time = Set(input.delivery_time);
        if let Some(status) = input.status {
            active.status = Set(status);
        }
        active.updated_at = Set(Utc::now());

        let updated = active.update(&*self.db).await?;
        info!(%product_id, "product updated");
        Ok(updated)
    }

    pub async fn get_product(&self, product_id: Uuid) -> Result<product::Model, ServiceError> {
        Product::find_by_id(product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
    }

    /// Publicly visible products, newest first.
    pub async fn list_active(&self) -> Result<Vec<product::Model>, ServiceError> {
        Ok(Product::find()
            .filter(product::Column::Status.eq(ProductStatus::Active))
            .order_by_desc(product::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    pub async fn list_all(&self) -> Result<Vec<product::Model>, ServiceError> {
        Ok(Product::find()
            .order_by_desc(product::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// Category lookup for coupon restriction checks.
    pub async fn categories_for(
        &self,
        product_ids: &[Uuid],
    ) -> Result<Vec<(Uuid, String)>, ServiceError> {
        if product_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(Product::find()
            .filter(product::Column::Id.is_in(product_ids.iter().copied()))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|p| (p.id, p.category))
            .collect())
    }

    /// Deletes a product. Cart lines referencing it go with it, so the totals of
    /// those carts are recomputed in the same transaction.
    #[instrument(skip(self))]
    pub async fn delete_product(&self, product_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let cart_ids: Vec<Uuid> = CartItem::find()
            .filter(cart_item::Column::ProductId.eq(product_id))
            .all(&txn)
            .await?
            .into_iter()
            .map(|line| line.cart_id)
            .collect();

        CartItem::delete_many()
            .filter(cart_item::Column::ProductId.eq(product_id))
            .exec(&txn)
            .await?;
        let result = Product::delete_by_id(product_id).exec(&txn).await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "Product {} not found",
                product_id
            )));
        }

        for cart in Cart::find()
            .filter(cart::Column::Id.is_in(cart_ids))
            .all(&txn)
            .await?
        {
            recompute_total(&txn, cart).await?;
        }
        txn.commit().await?;

        info!(%product_id, "product deleted");
        Ok(())
    }
}
