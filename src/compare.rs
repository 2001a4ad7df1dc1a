//! Price comparison between a monitored product and its competitors.
//!
//! All arithmetic is decimal with half-up rounding; binary floats never
//! touch money.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use tracing::{debug, info};

use crate::models::{
    AlertCandidate, ComparisonResult, CompetitorProduct, Discrepancy, MonitoredProduct,
    PriceMove, ProductStatus,
};

fn half_up(value: Decimal, scale: u32) -> Decimal {
    value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero)
}

/// Percentage values are always reported at two decimal places.
fn pct(value: Decimal) -> Decimal {
    half_up(value, 2)
}

/// Discrepancy block for a single competitor with a known price.
fn calculate_discrepancies(
    competitor: &CompetitorProduct,
    price: Decimal,
    monitored_price: Decimal,
    target_price: Decimal,
    min_price: Decimal,
    scale: u32,
) -> Discrepancy {
    let pct_x_target = if target_price > Decimal::ZERO {
        Some(pct((price - target_price) / target_price * dec!(100)))
    } else {
        None
    };
    let pct_x_monitored = if monitored_price > Decimal::ZERO {
        Some(pct((price - monitored_price) / monitored_price * dec!(100)))
    } else {
        None
    };

    let (change_from_old, pct_change_from_old) = match competitor.old_price {
        Some(old) => {
            let change = half_up(price - old, scale);
            let pct_change = if old != Decimal::ZERO {
                Some(pct(change / old * dec!(100)))
            } else {
                None
            };
            (Some(change), pct_change)
        }
        None => (None, None),
    };

    Discrepancy {
        competitor_id: competitor.id,
        name: competitor.name.clone(),
        price,
        pct_x_target,
        pct_x_monitored,
        delta_x_min_competitor: half_up(price - min_price, scale),
        delta_x_monitored: half_up(price - monitored_price, scale),
        old_price: competitor.old_price,
        change_from_old,
        pct_change_from_old,
    }
}

/// Price movement alert when the delta against `old_price` crosses the
/// threshold.
fn detect_price_change(
    competitor: &CompetitorProduct,
    price: Decimal,
    scale: u32,
    change_threshold: Decimal,
) -> Option<AlertCandidate> {
    let old = competitor.old_price?;
    let diff = half_up(price - old, scale);
    if diff.abs() < change_threshold {
        return None;
    }
    let pct_change = if old != Decimal::ZERO {
        Some(pct(diff / old * dec!(100)))
    } else {
        None
    };
    Some(AlertCandidate {
        competitor_id: Some(competitor.id),
        name: Some(competitor.name.clone()),
        price: Some(price),
        old_price: Some(old),
        change: Some(diff),
        pct_change,
        movement: Some(if diff > Decimal::ZERO {
            PriceMove::PriceIncrease
        } else {
            PriceMove::PriceDecrease
        }),
        ..Default::default()
    })
}

/// Alert for a paused or removed competitor listing.
fn detect_listing_status(competitor: &CompetitorProduct) -> Option<AlertCandidate> {
    match competitor.status {
        ProductStatus::Unavailable | ProductStatus::Removed => Some(AlertCandidate {
            competitor_id: Some(competitor.id),
            name: Some(competitor.name.clone()),
            status: Some(competitor.status),
            ..Default::default()
        }),
        ProductStatus::Available => None,
    }
}

/// Compares a monitored product against its competitors, producing the
/// snapshot payload and all alert candidates.
pub fn compare_prices(
    monitored: &MonitoredProduct,
    competitors: &[CompetitorProduct],
    tolerance: Decimal,
    price_change_threshold: Option<Decimal>,
) -> ComparisonResult {
    let monitored_price = monitored.current_price.unwrap_or(Decimal::ZERO);
    let target_price = monitored.target_price.unwrap_or(Decimal::ZERO);
    let scale = tolerance.scale();

    let priced: Vec<(&CompetitorProduct, Decimal)> = competitors
        .iter()
        .filter_map(|c| c.current_price.map(|p| (c, p)))
        .collect();

    if priced.is_empty() {
        info!(monitored_id = %monitored.id, "no competitor prices to compare");
        return ComparisonResult {
            monitored_price,
            target_price,
            ..Default::default()
        };
    }

    let min_price = priced.iter().map(|(_, p)| *p).min().unwrap_or_default();
    let max_price = priced.iter().map(|(_, p)| *p).max().unwrap_or_default();
    let avg_price = half_up(
        priced.iter().map(|(_, p)| *p).sum::<Decimal>() / Decimal::from(priced.len()),
        scale,
    );

    let lowest = priced
        .iter()
        .min_by_key(|(_, p)| *p)
        .expect("non-empty priced set");
    let highest = priced
        .iter()
        .max_by_key(|(_, p)| *p)
        .expect("non-empty priced set");

    let change_threshold = price_change_threshold.unwrap_or(tolerance);
    let mut discrepancies = Vec::with_capacity(priced.len());
    let mut alerts = Vec::new();

    for (competitor, price) in &priced {
        debug!(
            monitored_id = %monitored.id,
            competitor_id = %competitor.id,
            price = %price,
            "comparing competitor price"
        );
        discrepancies.push(calculate_discrepancies(
            competitor,
            *price,
            monitored_price,
            target_price,
            min_price,
            scale,
        ));

        if let Some(alert) = detect_listing_status(competitor) {
            alerts.push(alert);
        }
        if let Some(alert) = detect_price_change(competitor, *price, scale, change_threshold) {
            alerts.push(alert);
        }

        // Below-target alert for competitors undercutting the target price.
        if target_price > Decimal::ZERO && *price < target_price - tolerance {
            let pct_below = pct((target_price - *price) / target_price * dec!(100));
            alerts.push(AlertCandidate {
                competitor_id: Some(competitor.id),
                name: Some(competitor.name.clone()),
                price: Some(*price),
                pct_below_target: Some(pct_below),
                ..Default::default()
            });
        }
    }

    info!(
        monitored_id = %monitored.id,
        lowest = %min_price,
        highest = %max_price,
        alerts = alerts.len(),
        "comparison summary"
    );

    ComparisonResult {
        monitored_price,
        target_price,
        average_competitor_price: Some(avg_price),
        lowest_competitor: Some(calculate_discrepancies(
            lowest.0,
            lowest.1,
            monitored_price,
            target_price,
            min_price,
            scale,
        )),
        highest_competitor: Some(calculate_discrepancies(
            highest.0,
            highest.1,
            monitored_price,
            target_price,
            min_price,
            scale,
        )),
        discrepancies,
        alerts,
    }
}

/// Appends the product-level status alert when the monitored listing itself
/// is paused or removed.
pub fn append_product_status_alert(
    result: &mut ComparisonResult,
    monitored: &MonitoredProduct,
    listing_status: ProductStatus,
) {
    if matches!(listing_status, ProductStatus::Unavailable | ProductStatus::Removed) {
        result.alerts.push(AlertCandidate {
            product_id: Some(monitored.id),
            status: Some(listing_status),
            ..Default::default()
        });
    }
}
