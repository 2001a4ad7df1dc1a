//! Product page parsing.
//!
//! The selector heuristics are deliberately thin: a `ProductParser` trait
//! fronts the extraction so alternative strategies can be plugged in, and
//! the default implementation handles the standard product page shape with
//! regex selectors over the mobile markup.

use regex::Regex;
use rust_decimal::Decimal;
use std::sync::OnceLock;

use crate::error::ScrapeError;

/// Raw fields pulled from a product page. Prices stay as display strings
/// ("R$ 1.234,56") until the response layer converts them.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ParsedDetails {
    pub name: Option<String>,
    pub current_price: Option<String>,
    pub old_price: Option<String>,
    pub thumbnail: Option<String>,
    pub seller: Option<String>,
    pub shipping: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParserError {
    #[error("captcha challenge detected")]
    Captcha,
    #[error("parsing failed: {0}")]
    Failed(String),
}

pub trait ProductParser: Send + Sync {
    /// True when the HTML is plainly a product page rather than a search
    /// or category listing.
    fn looks_like_product_page(&self, html: &str) -> bool;

    fn parse(&self, html: &str, url: &str) -> Result<ParsedDetails, ParserError>;
}

fn captcha_markers(html: &str) -> bool {
    let lowered = html.to_lowercase();
    lowered.contains("captcha") || lowered.contains("digite os caracteres")
}

fn re(pattern: &'static str, slot: &'static OnceLock<Regex>) -> &'static Regex {
    slot.get_or_init(|| Regex::new(pattern).expect("static regex"))
}

static TITLE_RE: OnceLock<Regex> = OnceLock::new();
static PRICE_RE: OnceLock<Regex> = OnceLock::new();
static OLD_PRICE_RE: OnceLock<Regex> = OnceLock::new();
static THUMB_RE: OnceLock<Regex> = OnceLock::new();
static SELLER_RE: OnceLock<Regex> = OnceLock::new();
static SHIPPING_RE: OnceLock<Regex> = OnceLock::new();

/// Default parser for the marketplace's product pages.
#[derive(Default)]
pub struct MeliParser;

impl MeliParser {
    fn first_capture(regex: &Regex, html: &str) -> Option<String> {
        regex
            .captures(html)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

impl ProductParser for MeliParser {
    fn looks_like_product_page(&self, html: &str) -> bool {
        html.contains("ui-pdp-title")
            || html.contains("price-tag-fraction")
            || html.contains("andes-money-amount__fraction")
    }

    fn parse(&self, html: &str, url: &str) -> Result<ParsedDetails, ParserError> {
        if captcha_markers(html) {
            return Err(ParserError::Captcha);
        }

        let title_re = re(
            r#"(?s)class="ui-pdp-title"[^>]*>([^<]+)<"#,
            &TITLE_RE,
        );
        let price_re = re(
            r#"(?s)class="[^"]*(?:andes-money-amount__fraction|price-tag-fraction)[^"]*"[^>]*>([\d.,]+)<"#,
            &PRICE_RE,
        );
        let old_price_re = re(
            r#"(?s)class="[^"]*ui-pdp-price__original-value[^"]*".*?(?:andes-money-amount__fraction|price-tag-fraction)[^"]*"[^>]*>([\d.,]+)<"#,
            &OLD_PRICE_RE,
        );
        let thumb_re = re(
            r#"class="[^"]*ui-pdp-image[^"]*"[^>]*src="([^"]+)""#,
            &THUMB_RE,
        );
        let seller_re = re(
            r#"(?s)class="[^"]*ui-pdp-seller__link-trigger[^"]*"[^>]*>([^<]+)<"#,
            &SELLER_RE,
        );
        let shipping_re = re(r#">(Frete gr[áa]tis|Frete Gr[áa]tis)<"#, &SHIPPING_RE);

        let current_price = Self::first_capture(price_re, html);
        if current_price.is_none() {
            return Err(ParserError::Failed(format!("price not found in {}", url)));
        }

        Ok(ParsedDetails {
            name: Self::first_capture(title_re, html),
            current_price,
            old_price: Self::first_capture(old_price_re, html),
            thumbnail: Self::first_capture(thumb_re, html),
            seller: Self::first_capture(seller_re, html),
            shipping: Self::first_capture(shipping_re, html).map(|_| "Frete Grátis".to_string()),
        })
    }
}

/// Converts a Brazilian price string ("R$ 1.234,56") into a Decimal.
pub fn parse_price_str(raw: &str, url: &str) -> Result<Decimal, ScrapeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ScrapeError::ParsingFailed(format!(
            "price missing on page {}",
            url
        )));
    }
    let normalized = trimmed
        .replace("R$", "")
        .trim()
        .replace('.', "")
        .replace(',', ".");
    normalized.parse().map_err(|_| {
        ScrapeError::ParsingFailed(format!("invalid price on {}: {}", url, raw))
    })
}

/// Same conversion, tolerating an absent value.
pub fn parse_optional_price_str(raw: Option<&str>, url: &str) -> Result<Option<Decimal>, ScrapeError> {
    match raw {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => parse_price_str(value, url).map(Some),
    }
}
