//! HTTP contract between the services.
//!
//! The alert service never fetches marketplace pages itself; it POSTs the
//! URL to the scraper service and receives the parsed fields. A trait
//! fronts the client so task handlers are testable without a live scraper.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::ScrapeError;

/// `product_type` discriminator in the parse request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    Monitored,
    Competitor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseRequest {
    pub url: String,
    pub product_type: ProductKind,
}

/// Parsed product fields as they travel over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedDetails {
    pub name: Option<String>,
    pub current_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub free_shipping: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seller: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipping: Option<String>,
}

impl ScrapedDetails {
    /// Wire floats become decimals at the persistence boundary.
    pub fn current_price_decimal(&self) -> Decimal {
        Decimal::from_f64(self.current_price).unwrap_or_default()
    }

    pub fn old_price_decimal(&self) -> Option<Decimal> {
        self.old_price.and_then(Decimal::from_f64)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<String>,
}

#[async_trait]
pub trait ProductScraper: Send + Sync {
    async fn parse(&self, url: &str, kind: ProductKind) -> Result<ScrapedDetails, ScrapeError>;
}

/// reqwest-backed client for the scraper service.
pub struct HttpScraperClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpScraperClient {
    pub fn new(cfg: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: cfg.scraper_service_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ProductScraper for HttpScraperClient {
    async fn parse(&self, url: &str, kind: ProductKind) -> Result<ScrapedDetails, ScrapeError> {
        let request = ParseRequest {
            url: url.to_string(),
            product_type: kind,
        };
        let response = self
            .http
            .post(format!("{}/scraper/parse", self.base_url))
            .json(&request)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ScrapeError::TransientRemote(format!("scraper timeout: {}", e))
                } else {
                    ScrapeError::TransientRemote(format!("scraper unreachable: {}", e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| ScrapeError::ParsingFailed(format!("invalid scraper response: {}", e)));
        }

        let detail = response
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|b| b.detail)
            .unwrap_or_else(|| format!("scraper returned {}", status));

        Err(match status.as_u16() {
            400 => ScrapeError::InvalidInput(detail),
            429 => ScrapeError::RateLimited(detail),
            500..=599 => ScrapeError::TransientRemote(detail),
            _ => ScrapeError::TransientRemote(detail),
        })
    }
}

/// Always-failing placeholder used where a scraper is required but the
/// deployment disables outbound fetches.
pub struct DisabledScraper;

#[async_trait]
impl ProductScraper for DisabledScraper {
    async fn parse(&self, url: &str, _kind: ProductKind) -> Result<ScrapedDetails, ScrapeError> {
        Err(ScrapeError::DependencyUnavailable(format!(
            "scraper disabled, cannot fetch {}",
            url
        )))
    }
}

pub type SharedScraper = Arc<dyn ProductScraper>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        let details = ScrapedDetails {
            name: Some("tv".into()),
            current_price: 1234.56,
            old_price: Some(1300.0),
            thumbnail: None,
            free_shipping: true,
            seller: Some("store".into()),
            shipping: Some("Frete Grátis".into()),
        };
        let json = serde_json::to_string(&details).unwrap();
        let back: ScrapedDetails = serde_json::from_str(&json).unwrap();
        assert_eq!(back.current_price, 1234.56);
        assert!(back.free_shipping);
    }

    #[test]
    fn test_decimal_conversion() {
        let details = ScrapedDetails {
            name: None,
            current_price: 99.9,
            old_price: None,
            thumbnail: None,
            free_shipping: false,
            seller: None,
            shipping: None,
        };
        assert_eq!(
            details.current_price_decimal().round_dp(2),
            rust_decimal_macros::dec!(99.9)
        );
        assert_eq!(details.old_price_decimal(), None);
    }

    #[test]
    fn test_request_serialization() {
        let request = ParseRequest {
            url: "https://produto.mercadolivre.com.br/MLB-1".into(),
            product_type: ProductKind::Competitor,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["product_type"], "competitor");
    }

    #[tokio::test]
    async fn test_disabled_scraper_errors() {
        let scraper = DisabledScraper;
        let err = scraper
            .parse("https://produto.mercadolivre.com.br/MLB-1", ProductKind::Monitored)
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::DependencyUnavailable(_)));
    }
}
