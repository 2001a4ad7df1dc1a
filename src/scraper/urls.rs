//! Marketplace URL handling.
//!
//! Any mirror of a product URL reduces to the canonical
//! `https://produto.mercadolivre.com.br/MLB-<id>` form, which doubles as
//! the uniqueness key. Fetches go through the mobile domain.

use regex::Regex;
use std::sync::OnceLock;

pub const MOBILE_DOMAIN: &str = "m.mercadolivre.com.br";

/// Hosts that serve product pages.
pub const PRODUCT_HOSTS: &[&str] = &[
    "produto.mercadolivre.com.br",
    "www.mercadolivre.com.br",
    MOBILE_DOMAIN,
];

fn product_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)MLB[-_]?(\d+)").expect("static regex"))
}

/// Canonical product URL, or None for non-marketplace URLs.
pub fn canonicalize_ml_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    if !host.contains("mercadolivre.com.br") {
        return None;
    }
    let captures = product_re().captures(url)?;
    let product_id = captures.get(1)?.as_str();
    Some(format!("https://produto.mercadolivre.com.br/MLB-{}", product_id))
}

/// Whether the URL points at a known product host.
pub fn is_product_url(url: &str) -> bool {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| PRODUCT_HOSTS.contains(&h)))
        .unwrap_or(false)
}

/// Swaps the desktop host for the mobile one. Non-marketplace URLs and
/// catalog (`/p/`) links pass through untouched.
pub fn to_mobile_url(url: &str) -> String {
    let Ok(mut parsed) = reqwest::Url::parse(url) else {
        return url.to_string();
    };
    let Some(host) = parsed.host_str() else {
        return url.to_string();
    };
    if !host.split('.').any(|part| part == "mercadolivre") {
        return url.to_string();
    }
    if parsed.path().contains("/p/") {
        return url.to_string();
    }
    if parsed.set_host(Some(MOBILE_DOMAIN)).is_err() {
        return url.to_string();
    }
    parsed.to_string()
}

/// Hostname of a URL, or empty string when unparseable.
pub fn extract_hostname(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_default()
}
