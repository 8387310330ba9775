use crate::{
    config::AppConfig,
    entities::order,
    middleware_helpers::retry::{with_retry, RetryConfig},
};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("mail provider rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

impl NotificationError {
    /// Client-side rejections (4xx) will not succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
            Self::Transport(_) | Self::Timeout(_) => true,
        }
    }
}

/// Outbound mail delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), NotificationError>;
}

/// Writes mail to the log instead of sending it. Used when no mail API is configured.
#[derive(Debug, Default, Clone)]
pub struct LogTransport;

#[async_trait]
impl EmailTransport for LogTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), NotificationError> {
        info!(to = %message.to, subject = %message.subject, "email (log transport)");
        Ok(())
    }
}

/// JSON mail API client: `POST {url}` with `{from, to, subject, html}` and a bearer key.
#[derive(Debug, Clone)]
pub struct HttpEmailTransport {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpEmailTransport {
    pub fn new(
        url: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotificationError::Transport(e.to_string()))?;
        Ok(Self { client, url, api_key })
    }
}

#[async_trait]
impl EmailTransport for HttpEmailTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), NotificationError> {
        let mut request = self.client.post(&self.url).json(message);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Picks the HTTP transport when a mail API URL is configured, the log transport otherwise.
pub fn transport_from_config(
    cfg: &AppConfig,
) -> Result<Arc<dyn EmailTransport>, NotificationError> {
    match &cfg.email_api_url {
        Some(url) if !url.trim().is_empty() => Ok(Arc::new(HttpEmailTransport::new(
            url.clone(),
            cfg.email_api_key.clone(),
            cfg.email_timeout(),
        )?)),
        _ => Ok(Arc::new(LogTransport)),
    }
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub from: String,
    pub admin_email: Option<String>,
    pub storefront_url: String,
    pub send_timeout: Duration,
    pub retry: RetryConfig,
}

impl NotifierConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self {
            from: cfg.email_from.clone(),
            admin_email: cfg.admin_email.clone().filter(|a| !a.trim().is_empty()),
            storefront_url: cfg.storefront_url.trim_end_matches('/').to_string(),
            send_timeout: cfg.email_timeout(),
            retry: RetryConfig {
                max_attempts: cfg.email_max_attempts,
                ..RetryConfig::default()
            },
        }
    }
}

/// Fire-and-forget order email.
///
/// Each message is sent on its own task with a timeout per attempt and
/// exponential backoff between attempts. Failures end in a log line; callers
/// never observe them. Handles are kept so shutdown (and tests) can `drain`.
#[derive(Clone)]
pub struct OrderNotifier {
    transport: Arc<dyn EmailTransport>,
    config: Arc<NotifierConfig>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl OrderNotifier {
    pub fn new(transport: Arc<dyn EmailTransport>, config: NotifierConfig) -> Self {
        Self {
            transport,
            config: Arc::new(config),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Customer confirmation plus, when an admin address is configured, the admin notice.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn order_paid(&self, order: &order::Model) {
        self.dispatch("order_confirmation", self.confirmation_email(order))
            .await;
        if let Some(message) = self.admin_email(order) {
            self.dispatch("admin_new_order", message).await;
        }
    }

    #[instrument(skip(self, order), fields(order_id = %order.id, status = %order.order_status))]
    pub async fn order_status_changed(&self, order: &order::Model) {
        self.dispatch("order_status_update", self.status_email(order))
            .await;
    }

    /// Waits for every queued send to finish.
    pub async fn drain(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock().await);
        if handles.is_empty() {
            return;
        }
        info!(pending = handles.len(), "draining notification tasks");
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "notification task panicked");
            }
        }
    }

    async fn dispatch(&self, kind: &'static str, message: EmailMessage) {
        let transport = Arc::clone(&self.transport);
        let config = Arc::clone(&self.config);

        let handle = tokio::spawn(async move {
            let send_timeout = config.send_timeout;
            let result = with_retry(
                &config.retry,
                |e: &NotificationError| e.is_retryable(),
                || {
                    let transport = Arc::clone(&transport);
                    let message = &message;
                    async move {
                        tokio::time::timeout(send_timeout, transport.send(message))
                            .await
                            .map_err(|_| NotificationError::Timeout(send_timeout))?
                    }
                },
            )
            .await;

            match result {
                Ok(()) => info!(kind, to = %message.to, "email sent"),
                Err(e) => warn!(kind, to = %message.to, error = %e, "email delivery failed"),
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    fn order_link(&self, order: &order::Model) -> String {
        format!("{}/orders/{}", self.config.storefront_url, order.id)
    }

    fn confirmation_email(&self, order: &order::Model) -> EmailMessage {
        let billing = &order.billing_details;
        let mut html = String::new();
        let _ = write!(
            html,
            "<h2>Thank you for your order, {}!</h2>\
             <p>We have received your payment for order <b>#{}</b>.</p>",
            escape_html(&billing.first_name),
            order.reference()
        );
        html.push_str(&items_table(order));
        html.push_str(&totals_block(order));
        let _ = write!(
            html,
            "<p>Shipping to: {}, {}, {}, {} {}</p><p><a href=\"{}\">View your order</a></p>",
            escape_html(&order.shipping_details.name),
            escape_html(&order.shipping_details.address),
            escape_html(&order.shipping_details.city),
            escape_html(&order.shipping_details.state),
            escape_html(&order.shipping_details.zip_code),
            self.order_link(order)
        );

        EmailMessage {
            from: self.config.from.clone(),
            to: billing.email.clone(),
            subject: format!("Your Artify Order #{}", order.reference()),
            html,
        }
    }

    fn admin_email(&self, order: &order::Model) -> Option<EmailMessage> {
        let to = self.config.admin_email.clone()?;
        let billing = &order.billing_details;
        let mut html = String::new();
        let _ = write!(
            html,
            "<h2>New order #{}</h2><p>Customer: {} &lt;{}&gt;, {}</p>",
            order.reference(),
            escape_html(&billing.full_name()),
            escape_html(&billing.email),
            escape_html(&billing.phone)
        );
        if let Some(org) = &billing.organization_name {
            let _ = write!(html, "<p>Organization: {}</p>", escape_html(org));
        }
        if let Some(gst) = &billing.gst_number {
            let _ = write!(html, "<p>GST number: {}</p>", escape_html(gst));
        }
        html.push_str(&items_table(order));
        html.push_str(&totals_block(order));
        let _ = write!(
            html,
            "<p>Payment intent: {}</p>",
            escape_html(&order.payment_intent_id)
        );

        Some(EmailMessage {
            from: self.config.from.clone(),
            to,
            subject: format!("New Order Received - #{}", order.reference()),
            html,
        })
    }

    fn status_email(&self, order: &order::Model) -> EmailMessage {
        let html = format!(
            "<h2>Hi {},</h2><p>Your order <b>#{}</b> is now <b>{}</b>.</p>\
             <p><a href=\"{}\">Track your order</a></p>",
            escape_html(&order.billing_details.first_name),
            order.reference(),
            order.order_status,
            self.order_link(order)
        );
        EmailMessage {
            from: self.config.from.clone(),
            to: order.billing_details.email.clone(),
            subject: format!(
                "Your Artify Order #{} has been {}",
                order.reference(),
                order.order_status
            ),
            html,
        }
    }
}

fn items_table(order: &order::Model) -> String {
    let mut html = String::from(
        "<table><thead><tr><th>Item</th><th>Qty</th><th>Price</th><th>Total</th></tr></thead><tbody>",
    );
    for line in &order.items.0 {
        let _ = write!(
            html,
            "<tr><td>{}</td><td>{}</td><td>₹{:.2}</td><td>₹{:.2}</td></tr>",
            escape_html(&line.name),
            line.quantity,
            line.price,
            line.line_total().unwrap_or_default()
        );
    }
    html.push_str("</tbody></table>");
    html
}

fn totals_block(order: &order::Model) -> String {
    let mut html = format!("<p>Subtotal: ₹{:.2}<br/>GST: ₹{:.2}<br/>", order.subtotal, order.gst);
    if let Some(coupon) = &order.coupon {
        let _ = write!(
            html,
            "Coupon {}: -₹{:.2}<br/>",
            escape_html(&coupon.code),
            order.discount
        );
    } else if !order.discount.is_zero() {
        let _ = write!(html, "Discount: -₹{:.2}<br/>", order.discount);
    }
    let _ = write!(html, "<b>Total: ₹{:.2}</b></p>", order.total);
    html
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
