pub mod cart;
pub mod common;
pub mod coupons;
pub mod orders;
pub mod payments;
pub mod products;

use crate::{
    config::AppConfig,
    db::DbPool,
    errors::ServiceError,
    events::EventSender,
    services::{
        cart::CartService,
        catalog::CatalogService,
        coupons::CouponService,
        notifications::{transport_from_config, EmailTransport, NotifierConfig, OrderNotifier},
        orders::OrderService,
        payments::{PaymentGateway, PaymentService, StripeGateway, WebhookVerifier},
        uploads::{FileStore, LocalFileStore},
    },
};
use std::sync::Arc;
use std::time::Duration;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Outbound integrations. Swapped for fakes in tests.
#[derive(Clone)]
pub struct Integrations {
    pub gateway: Arc<dyn PaymentGateway>,
    pub email: Arc<dyn EmailTransport>,
    pub files: Arc<dyn FileStore>,
}

impl Integrations {
    /// Stripe, the configured mail transport and local disk storage.
    pub fn from_config(cfg: &AppConfig) -> Result<Self, ServiceError> {
        let gateway = StripeGateway::from_app_config(cfg)?;
        let email = transport_from_config(cfg)
            .map_err(|e| ServiceError::InternalError(format!("email transport: {}", e)))?;
        Ok(Self {
            gateway: Arc::new(gateway),
            email,
            files: Arc::new(LocalFileStore::new(&cfg.upload_dir, cfg.max_upload_bytes)),
        })
    }
}

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub catalog: Arc<CatalogService>,
    pub coupons: Arc<CouponService>,
    pub cart: Arc<CartService>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub notifier: OrderNotifier,
    pub files: Arc<dyn FileStore>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        cfg: &AppConfig,
        integrations: Integrations,
    ) -> Self {
        let catalog = CatalogService::new(db_pool.clone());
        let coupons = CouponService::new(db_pool.clone(), catalog.clone());
        let cart = CartService::new(db_pool.clone(), event_sender.clone());
        let notifier = OrderNotifier::new(
            integrations.email,
            NotifierConfig::from_app_config(cfg),
        );
        let orders = OrderService::new(
            db_pool,
            event_sender,
            coupons.clone(),
            cart.clone(),
            notifier.clone(),
        )
        .with_page_sizes(cfg.api_default_page_size, cfg.api_max_page_size);

        let verifier = cfg
            .payment_webhook_secret
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|secret| {
                WebhookVerifier::new(
                    secret,
                    Duration::from_secs(cfg.payment_webhook_tolerance_secs),
                )
            });
        let payments = PaymentService::new(
            integrations.gateway,
            verifier,
            orders.clone(),
            cfg.default_currency.clone(),
        );

        Self {
            catalog: Arc::new(catalog),
            coupons: Arc::new(coupons),
            cart: Arc::new(cart),
            orders: Arc::new(orders),
            payments: Arc::new(payments),
            notifier,
            files: integrations.files,
        }
    }
}
