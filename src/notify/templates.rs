//! Message rendering for alert notifications.
//!
//! Each alert shape has one template rendered as plain text for most
//! channels and as HTML for email.

use rust_decimal::Decimal;

use crate::models::{AlertCandidate, MonitoredProduct, PriceMove, ProductStatus};

fn currency(value: Option<Decimal>) -> String {
    match value {
        Some(v) => format!("R$ {:.2}", v),
        None => String::new(),
    }
}

fn competitor_name(alert: &AlertCandidate) -> &str {
    alert.name.as_deref().unwrap_or("concorrente")
}

/// Price-target alert: a competitor undercut the configured target.
pub fn render_price_alert(monitored: &MonitoredProduct, alert: &AlertCandidate, html: bool) -> String {
    let name = competitor_name(alert);
    let price = currency(alert.price);
    let target = currency(monitored.target_price);
    let pct = alert
        .pct_below_target
        .map(|p| format!("{:.2}%", p))
        .unwrap_or_default();

    if html {
        format!(
            "<h2>Preço abaixo do alvo</h2>\
             <p>O concorrente <strong>{}</strong> está vendendo <strong>{}</strong> por <strong>{}</strong>.</p>\
             <p>Isso é {} abaixo do seu preço alvo de {}.</p>",
            name, monitored.name, price, pct, target
        )
    } else {
        format!(
            "O concorrente {} está vendendo {} por {} ({} abaixo do seu preço alvo de {}).",
            name, monitored.name, price, pct, target
        )
    }
}

/// Price-change alert: a competitor moved its price beyond the threshold.
pub fn render_price_change_alert(
    monitored: &MonitoredProduct,
    alert: &AlertCandidate,
    html: bool,
) -> String {
    let name = competitor_name(alert);
    let direction = match alert.movement {
        Some(PriceMove::PriceIncrease) => "subiu",
        _ => "caiu",
    };
    let price = currency(alert.price);
    let old = currency(alert.old_price);
    let pct = alert
        .pct_change
        .map(|p| format!(" ({:.2}%)", p))
        .unwrap_or_default();

    if html {
        format!(
            "<h2>Variação de preço</h2>\
             <p>O preço de <strong>{}</strong> no concorrente <strong>{}</strong> {} de {} para <strong>{}</strong>{}.</p>",
            monitored.name, name, direction, old, price, pct
        )
    } else {
        format!(
            "O preço de {} no concorrente {} {} de {} para {}{}.",
            monitored.name, name, direction, old, price, pct
        )
    }
}

/// Listing alert: a competitor listing was paused or removed.
pub fn render_listing_alert(monitored: &MonitoredProduct, alert: &AlertCandidate, html: bool) -> String {
    let name = competitor_name(alert);
    let state = match alert.status {
        Some(ProductStatus::Removed) => "foi removido",
        _ => "está pausado",
    };

    if html {
        format!(
            "<h2>Anúncio alterado</h2>\
             <p>O anúncio do concorrente <strong>{}</strong> para <strong>{}</strong> {}.</p>",
            name, monitored.name, state
        )
    } else {
        format!(
            "O anúncio do concorrente {} para {} {}.",
            name, monitored.name, state
        )
    }
}

/// Error alert: scraping failed for this product.
pub fn render_error_alert(monitored: &MonitoredProduct, alert: &AlertCandidate, html: bool) -> String {
    let detail = alert
        .error
        .as_deref()
        .or(alert.detail.as_deref())
        .unwrap_or("erro desconhecido");

    if html {
        format!(
            "<h2>Falha de monitoramento</h2>\
             <p>Não foi possível coletar dados de <strong>{}</strong>: {}</p>",
            monitored.name, detail
        )
    } else {
        format!("Não foi possível coletar dados de {}: {}", monitored.name, detail)
    }
}
