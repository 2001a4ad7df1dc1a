//! Shared domain types for both services.
//!
//! Entities are identified by UUID and looked up by id; back-references are
//! ids, never in-memory pointers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a monitored product is refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringType {
    Api,
    Scraping,
}

impl MonitoringType {
    pub fn as_str(&self) -> &str {
        match self {
            MonitoringType::Api => "api",
            MonitoringType::Scraping => "scraping",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "api" => Some(MonitoringType::Api),
            "scraping" => Some(MonitoringType::Scraping),
            _ => None,
        }
    }
}

/// State of the monitoring configuration itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoredStatus {
    Active,
    Inactive,
    Pending,
    Failed,
}

impl MonitoredStatus {
    pub fn as_str(&self) -> &str {
        match self {
            MonitoredStatus::Active => "active",
            MonitoredStatus::Inactive => "inactive",
            MonitoredStatus::Pending => "pending",
            MonitoredStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(MonitoredStatus::Active),
            "inactive" => Some(MonitoredStatus::Inactive),
            "pending" => Some(MonitoredStatus::Pending),
            "failed" => Some(MonitoredStatus::Failed),
            _ => None,
        }
    }
}

/// State of a listing on the marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Available,
    Unavailable,
    Removed,
}

impl ProductStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ProductStatus::Available => "available",
            ProductStatus::Unavailable => "unavailable",
            ProductStatus::Removed => "removed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(ProductStatus::Available),
            "unavailable" => Some(ProductStatus::Unavailable),
            "removed" => Some(ProductStatus::Removed),
            _ => None,
        }
    }
}

/// Rule/alert categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    PriceTarget,
    PriceChange,
    ListingPaused,
    ListingRemoved,
    ScrapingError,
}

impl AlertType {
    pub fn as_str(&self) -> &str {
        match self {
            AlertType::PriceTarget => "price_target",
            AlertType::PriceChange => "price_change",
            AlertType::ListingPaused => "listing_paused",
            AlertType::ListingRemoved => "listing_removed",
            AlertType::ScrapingError => "scraping_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "price_target" => Some(AlertType::PriceTarget),
            "price_change" => Some(AlertType::PriceChange),
            "listing_paused" => Some(AlertType::ListingPaused),
            "listing_removed" => Some(AlertType::ListingRemoved),
            "scraping_error" => Some(AlertType::ScrapingError),
            _ => None,
        }
    }
}

/// Delivery channels for notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Email,
    Sms,
    Push,
    Whatsapp,
    Slack,
    Webhook,
}

impl ChannelKind {
    pub fn as_str(&self) -> &str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Sms => "sms",
            ChannelKind::Push => "push",
            ChannelKind::Whatsapp => "whatsapp",
            ChannelKind::Slack => "slack",
            ChannelKind::Webhook => "webhook",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(ChannelKind::Email),
            "sms" => Some(ChannelKind::Sms),
            "push" => Some(ChannelKind::Push),
            "whatsapp" => Some(ChannelKind::Whatsapp),
            "slack" => Some(ChannelKind::Slack),
            "webhook" => Some(ChannelKind::Webhook),
            _ => None,
        }
    }
}

/// Failure categories recorded for scraping runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapingErrorType {
    HttpError,
    MissingData,
    Timeout,
    ParsingError,
}

impl ScrapingErrorType {
    pub fn as_str(&self) -> &str {
        match self {
            ScrapingErrorType::HttpError => "http_error",
            ScrapingErrorType::MissingData => "missing_data",
            ScrapingErrorType::Timeout => "timeout",
            ScrapingErrorType::ParsingError => "parsing_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http_error" => Some(ScrapingErrorType::HttpError),
            "missing_data" => Some(ScrapingErrorType::MissingData),
            "timeout" => Some(ScrapingErrorType::Timeout),
            "parsing_error" => Some(ScrapingErrorType::ParsingError),
            _ => None,
        }
    }
}

/// Notification recipient plus per-user delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub whatsapp_number: Option<String>,
    pub fcm_token: Option<String>,
    pub notifications_enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// A product the user tracks. Unique per (user, product_url).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredProduct {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub monitoring_type: MonitoringType,
    pub product_url: String,
    pub target_price: Option<Decimal>,
    pub current_price: Option<Decimal>,
    pub free_shipping: bool,
    pub thumbnail: Option<String>,
    pub etag: Option<String>,
    pub status: MonitoredStatus,
    pub last_checked: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A competing listing attached to a monitored product.
/// Unique per (monitored_product_id, product_url). On each successful
/// refresh `old_price` receives the prior `current_price`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetitorProduct {
    pub id: Uuid,
    pub monitored_product_id: Uuid,
    pub name: String,
    pub product_url: String,
    pub current_price: Option<Decimal>,
    pub old_price: Option<Decimal>,
    pub free_shipping: bool,
    pub seller: Option<String>,
    pub thumbnail: Option<String>,
    pub status: ProductStatus,
    pub last_checked: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A user-configured matcher, optionally scoped to one product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: Option<Uuid>,
    pub user_id: Uuid,
    pub monitored_product_id: Option<Uuid>,
    pub rule_type: AlertType,
    pub threshold_value: Option<Decimal>,
    pub threshold_percent: Option<Decimal>,
    pub target_price: Option<Decimal>,
    pub product_status: Option<ProductStatus>,
    pub enabled: bool,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AlertRule {
    /// Synthesized fallback when a user has no rules configured.
    pub fn default_price_target(user_id: Uuid) -> Self {
        Self {
            id: None,
            user_id,
            monitored_product_id: None,
            rule_type: AlertType::PriceTarget,
            threshold_value: None,
            threshold_percent: None,
            target_price: None,
            product_status: None,
            enabled: true,
            last_notified_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Kind of price movement detected against a competitor's previous price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceMove {
    PriceIncrease,
    PriceDecrease,
}

impl PriceMove {
    pub fn as_str(&self) -> &str {
        match self {
            PriceMove::PriceIncrease => "price_increase",
            PriceMove::PriceDecrease => "price_decrease",
        }
    }
}

/// One candidate alert produced by the comparison engine. Fields are
/// populated per alert shape; the rule matcher inspects whichever are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertCandidate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub competitor_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pct_change: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pct_below_target: Option<Decimal>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub movement: Option<PriceMove>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ProductStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<Uuid>,
}

/// Per-competitor price discrepancy block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discrepancy {
    pub competitor_id: Uuid,
    pub name: String,
    pub price: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pct_x_target: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pct_x_monitored: Option<Decimal>,
    pub delta_x_min_competitor: Decimal,
    pub delta_x_monitored: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_from_old: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pct_change_from_old: Option<Decimal>,
}

/// Full output of one comparison run; persisted verbatim as the
/// `PriceComparison` snapshot payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub monitored_price: Decimal,
    pub target_price: Decimal,
    pub average_competitor_price: Option<Decimal>,
    pub lowest_competitor: Option<Discrepancy>,
    pub highest_competitor: Option<Discrepancy>,
    pub discrepancies: Vec<Discrepancy>,
    pub alerts: Vec<AlertCandidate>,
}

/// Immutable snapshot of a comparison run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceComparison {
    pub id: Uuid,
    pub monitored_product_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub data: ComparisonResult,
}

/// Immutable record of one delivery attempt to one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationLog {
    pub id: Uuid,
    pub user_id: Uuid,
    pub alert_rule_id: Option<Uuid>,
    pub alert_type: Option<AlertType>,
    pub channel: ChannelKind,
    pub subject: String,
    pub message: String,
    pub provider_metadata: Option<serde_json::Value>,
    pub sent_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

/// One recorded scraping failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapingErrorRecord {
    pub id: Uuid,
    pub monitored_product_id: Uuid,
    pub url: String,
    pub status_code: Option<u16>,
    pub error_type: ScrapingErrorType,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
