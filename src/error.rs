//! Error taxonomy for the scraping and notification pipelines.
//!
//! Recover locally when a failure concerns a single product or channel;
//! only the outermost layer (HTTP handler or worker top-level) translates
//! these into status codes or retry decisions.

use crate::models::ScrapingErrorType;

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    /// Payload validation failed; the task exits without retry.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Network error, 5xx or timeout; retried with bounded backoff.
    #[error("transient remote error: {0}")]
    TransientRemote(String),

    /// Blocked by the target site (429/403/CAPTCHA) and recovery failed.
    #[error("blocked: {0}")]
    Blocked(String),

    /// HTML fetched but required fields could not be extracted.
    #[error("parsing failed: {0}")]
    ParsingFailed(String),

    /// The page is clearly a search/listing page, not a product page.
    #[error("not a product page: {0}")]
    NotProductPage(String),

    /// KV, SQL or broker unreachable.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Requests are currently rate limited or suspended.
    #[error("rate limited: {0}")]
    RateLimited(String),
}

impl ScrapeError {
    /// Whether the worker should re-enqueue the task with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScrapeError::TransientRemote(_) | ScrapeError::DependencyUnavailable(_)
        )
    }

    /// Category persisted in the scraping_errors table.
    pub fn error_type(&self) -> ScrapingErrorType {
        match self {
            ScrapeError::TransientRemote(_)
            | ScrapeError::Blocked(_)
            | ScrapeError::RateLimited(_)
            | ScrapeError::DependencyUnavailable(_) => ScrapingErrorType::HttpError,
            ScrapeError::ParsingFailed(_) => ScrapingErrorType::ParsingError,
            ScrapeError::NotProductPage(_) => ScrapingErrorType::MissingData,
            ScrapeError::InvalidInput(_) => ScrapingErrorType::ParsingError,
        }
    }

    /// HTTP status used when this error surfaces from the scraper API.
    pub fn status_code(&self) -> u16 {
        match self {
            ScrapeError::InvalidInput(_) | ScrapeError::NotProductPage(_) => 400,
            ScrapeError::RateLimited(_) => 429,
            ScrapeError::Blocked(_) | ScrapeError::TransientRemote(_) => 502,
            ScrapeError::ParsingFailed(_) => 500,
            ScrapeError::DependencyUnavailable(_) => 503,
        }
    }
}

/// Failure of one notification channel; siblings keep going.
#[derive(Debug, thiserror::Error)]
#[error("channel delivery failed: {0}")]
pub struct ChannelDeliveryError(pub String);
