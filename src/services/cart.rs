use crate::{
    entities::cart_item::{self, AttachedFile, ClientInfo},
    entities::{cart, product, Cart, CartItem, Product},
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

/// Per-user shopping cart.
///
/// Every mutation runs in one transaction that also rewrites the cart total and
/// bumps its version. Mutations for the same user are additionally serialized
/// in-process so the read-modify-write of the total never interleaves.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddToCartInput {
    pub product_id: Uuid,
    pub quantity: i32,
    pub client_info: ClientInfo,
}

/// Cart as returned to clients, lines joined with their product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CartView {
    pub items: Vec<CartLineView>,
    pub total: Decimal,
    pub version: i32,
}

impl CartView {
    fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: Decimal::ZERO,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CartLineView {
    pub product_id: Uuid,
    pub name: String,
    pub image: Option<String>,
    pub category: Option<String>,
    pub delivery_time: Option<String>,
    pub price: Decimal,
    pub quantity: i32,
    pub client_info: ClientInfo,
}

/// Holds a user's cart lock and drops the map entry once nobody else wants it.
struct UserLockGuard {
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    user_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn cart_total(items: &[cart_item::Model]) -> Result<Decimal, ServiceError> {
    items
        .iter()
        .try_fold(Decimal::ZERO, |acc, item| {
            item.line_total().and_then(|t| acc.checked_add(t))
        })
        .ok_or_else(|| ServiceError::ValidationError("Cart total is out of range".to_string()))
}

/// Rewrites `carts.total` from the stored lines and bumps the version.
pub(crate) async fn recompute_total<C: ConnectionTrait>(
    conn: &C,
    cart: cart::Model,
) -> Result<cart::Model, ServiceError> {
    let items = CartItem::find()
        .filter(cart_item::Column::CartId.eq(cart.id))
        .all(conn)
        .await?;
    let total = cart_total(&items)?;

    let version = cart.version;
    let mut active: cart::ActiveModel = cart.into();
    active.total = Set(total);
    active.version = Set(version + 1);
    active.updated_at = Set(Utc::now());
    let updated = active.update(conn).await?;

    debug!(cart_id = %updated.id, %total, version = updated.version, "cart total recomputed");
    Ok(updated)
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db,
            event_sender,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn user_lock(&self, user_id: Uuid) -> Arc<Mutex<()>> {
        self.locks.entry(user_id).or_default().clone()
    }

    async fn lock_user(&self, user_id: Uuid) -> UserLockGuard {
        let guard = self.user_lock(user_id).lock_owned().await;
        UserLockGuard {
            locks: Arc::clone(&self.locks),
            user_id,
            guard: Some(guard),
        }
    }

    async fn find_cart<C: ConnectionTrait>(
        conn: &C,
        user_id: Uuid,
    ) -> Result<Option<cart::Model>, ServiceError> {
        Ok(Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(conn)
            .await?)
    }

    /// Adds a product line. The price is copied from the product now and never re-read.
    /// Uploaded `files` are appended to the line's client info.
    #[instrument(skip(self, input, files), fields(product_id = %input.product_id))]
    pub async fn add_item(
        &self,
        user_id: Uuid,
        input: AddToCartInput,
        files: Vec<AttachedFile>,
    ) -> Result<CartView, ServiceError> {
        if input.quantity < 1 {
            return Err(ServiceError::ValidationError(
                "quantity must be at least 1".to_string(),
            ));
        }

        let _guard = self.lock_user(user_id).await;
        let txn = self.db.begin().await?;

        let product = Product::find_by_id(input.product_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", input.product_id))
            })?;
        if !product.is_purchasable() {
            return Err(ServiceError::InvalidOperation(format!(
                "Product {} is not available for purchase",
                product.id
            )));
        }

        let now = Utc::now();
        let cart = match Self::find_cart(&txn, user_id).await? {
            Some(cart) => cart,
            None => {
                cart::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    user_id: Set(user_id),
                    total: Set(Decimal::ZERO),
                    version: Set(0),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?
            }
        };

        let lines = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .all(&txn)
            .await?;
        if lines.iter().any(|l| l.product_id == product.id) {
            return Err(ServiceError::Conflict("Product already in cart".to_string()));
        }
        let position = lines.iter().map(|l| l.position + 1).max().unwrap_or(0);

        let mut client_info = input.client_info;
        client_info.files.extend(files);

        cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            cart_id: Set(cart.id),
            product_id: Set(product.id),
            position: Set(position),
            quantity: Set(input.quantity),
            price: Set(product.price),
            client_info: Set(client_info),
            created_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(|e| ServiceError::from_db_conflict(e, "Product already in cart"))?;

        let cart = recompute_total(&txn, cart).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::CartItemAdded {
            user_id,
            product_id: product.id,
            quantity: input.quantity,
        });
        info!(
            %user_id,
            product_id = %product.id,
            quantity = input.quantity,
            total = %cart.total,
            "item added to cart"
        );

        self.view(&*self.db, Some(cart)).await
    }

    /// Removes the line for `product_id`. Removing an absent product returns the cart unchanged.
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<CartView, ServiceError> {
        let _guard = self.lock_user(user_id).await;
        let txn = self.db.begin().await?;

        let cart = Self::find_cart(&txn, user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Cart not found".to_string()))?;

        let deleted = CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .exec(&txn)
            .await?;

        if deleted.rows_affected == 0 {
            txn.commit().await?;
            return self.view(&*self.db, Some(cart)).await;
        }

        let cart = recompute_total(&txn, cart).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::CartItemRemoved {
            user_id,
            product_id,
        });
        info!(%user_id, %product_id, total = %cart.total, "item removed from cart");

        self.view(&*self.db, Some(cart)).await
    }

    /// Empties the cart. Never creates one; clearing an empty cart changes nothing.
    #[instrument(skip(self))]
    pub async fn clear(&self, user_id: Uuid) -> Result<CartView, ServiceError> {
        let _guard = self.lock_user(user_id).await;
        let txn = self.db.begin().await?;

        let Some(cart) = Self::find_cart(&txn, user_id).await? else {
            return Ok(CartView::empty());
        };

        let deleted = CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&txn)
            .await?;
        if deleted.rows_affected == 0 && cart.total.is_zero() {
            txn.commit().await?;
            return self.view(&*self.db, Some(cart)).await;
        }

        let cart = recompute_total(&txn, cart).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::CartCleared(user_id));
        info!(%user_id, "cart cleared");

        self.view(&*self.db, Some(cart)).await
    }

    pub async fn get(&self, user_id: Uuid) -> Result<CartView, ServiceError> {
        let cart = Self::find_cart(&*self.db, user_id).await?;
        self.view(&*self.db, cart).await
    }

    async fn view<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart: Option<cart::Model>,
    ) -> Result<CartView, ServiceError> {
        let Some(cart) = cart else {
            return Ok(CartView::empty());
        };

        let lines = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .order_by_asc(cart_item::Column::Position)
            .all(conn)
            .await?;

        let products: HashMap<Uuid, product::Model> = if lines.is_empty() {
            HashMap::new()
        } else {
            Product::find()
                .filter(product::Column::Id.is_in(lines.iter().map(|l| l.product_id)))
                .all(conn)
                .await?
                .into_iter()
                .map(|p| (p.id, p))
                .collect()
        };

        let items = lines
            .into_iter()
            .map(|line| {
                let product = products.get(&line.product_id);
                CartLineView {
                    product_id: line.product_id,
                    name: product.map(|p| p.name.clone()).unwrap_or_default(),
                    image: product.and_then(|p| p.primary_image().map(str::to_string)),
                    category: product.map(|p| p.category.clone()),
                    delivery_time: product.and_then(|p| p.delivery_time.clone()),
                    price: line.price,
                    quantity: line.quantity,
                    client_info: line.client_info,
                }
            })
            .collect();

        Ok(CartView {
            items,
            total: cart.total,
            version: cart.version,
        })
    }
}
