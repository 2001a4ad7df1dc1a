//! Evaluates whether an alert candidate satisfies a configured rule.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::models::{AlertCandidate, AlertRule, AlertType, ProductStatus};

pub fn alert_matches_rule(alert: &AlertCandidate, rule: &AlertRule) -> bool {
    // Generic constraints apply to every rule type.
    if let Some(target) = rule.target_price {
        match alert.price {
            Some(price) if price <= target => {}
            _ => return false,
        }
    }

    if let Some(required) = rule.product_status {
        if alert.status != Some(required) {
            return false;
        }
    }

    match rule.rule_type {
        AlertType::PriceTarget => {
            let Some(price) = alert.price else {
                return false;
            };
            if let Some(threshold) = rule.threshold_value {
                if price > threshold {
                    return false;
                }
            }
            if let Some(min_pct) = rule.threshold_percent {
                match alert.pct_below_target {
                    Some(pct) if pct >= min_pct => {}
                    _ => return false,
                }
            }
            true
        }
        AlertType::PriceChange => {
            if alert.movement.is_none() {
                return false;
            }
            let change = alert.change.unwrap_or(Decimal::ZERO).abs();
            if let Some(threshold) = rule.threshold_value {
                if change < threshold {
                    return false;
                }
            }
            if let Some(min_pct) = rule.threshold_percent {
                let old = alert.old_price.unwrap_or(Decimal::ZERO);
                let pct_change = if old != Decimal::ZERO {
                    (change / old * dec!(100)).abs()
                } else {
                    Decimal::ZERO
                };
                if pct_change < min_pct {
                    return false;
                }
            }
            true
        }
        AlertType::ListingPaused => alert.status == Some(ProductStatus::Unavailable),
        AlertType::ListingRemoved => alert.status == Some(ProductStatus::Removed),
        AlertType::ScrapingError => alert.error.is_some() || alert.detail.is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceMove;
    use uuid::Uuid;

    fn rule(rule_type: AlertType) -> AlertRule {
        let mut rule = AlertRule::default_price_target(Uuid::new_v4());
        rule.rule_type = rule_type;
        rule
    }

    #[test]
    fn test_price_target_thresholds() {
        let mut r = rule(AlertType::PriceTarget);
        r.threshold_value = Some(dec!(90.00));
        r.threshold_percent = Some(dec!(10.00));

        let alert = AlertCandidate {
            price: Some(dec!(80.00)),
            pct_below_target: Some(dec!(20.00)),
            ..Default::default()
        };
        assert!(alert_matches_rule(&alert, &r));

        // Price above the absolute threshold fails.
        let expensive = AlertCandidate {
            price: Some(dec!(95.00)),
            pct_below_target: Some(dec!(20.00)),
            ..Default::default()
        };
        assert!(!alert_matches_rule(&expensive, &r));

        // Percent below the minimum fails.
        let shallow = AlertCandidate {
            price: Some(dec!(80.00)),
            pct_below_target: Some(dec!(5.00)),
            ..Default::default()
        };
        assert!(!alert_matches_rule(&shallow, &r));

        // No price at all fails.
        assert!(!alert_matches_rule(&AlertCandidate::default(), &r));
    }

    #[test]
    fn test_default_rule_accepts_any_priced_alert() {
        let r = rule(AlertType::PriceTarget);
        let alert = AlertCandidate {
            price: Some(dec!(123.45)),
            ..Default::default()
        };
        assert!(alert_matches_rule(&alert, &r));
    }

    #[test]
    fn test_price_change_requires_movement() {
        let mut r = rule(AlertType::PriceChange);
        r.threshold_value = Some(dec!(5.00));

        let alert = AlertCandidate {
            movement: Some(PriceMove::PriceDecrease),
            change: Some(dec!(-10.00)),
            old_price: Some(dec!(100.00)),
            price: Some(dec!(90.00)),
            ..Default::default()
        };
        assert!(alert_matches_rule(&alert, &r));

        let no_move = AlertCandidate {
            change: Some(dec!(-10.00)),
            ..Default::default()
        };
        assert!(!alert_matches_rule(&no_move, &r));

        let small = AlertCandidate {
            movement: Some(PriceMove::PriceIncrease),
            change: Some(dec!(2.00)),
            price: Some(dec!(102.00)),
            ..Default::default()
        };
        assert!(!alert_matches_rule(&small, &r));
    }

    #[test]
    fn test_price_change_percent_threshold() {
        let mut r = rule(AlertType::PriceChange);
        r.threshold_percent = Some(dec!(8.00));

        let big = AlertCandidate {
            movement: Some(PriceMove::PriceIncrease),
            change: Some(dec!(10.00)),
            old_price: Some(dec!(100.00)),
            price: Some(dec!(110.00)),
            ..Default::default()
        };
        assert!(alert_matches_rule(&big, &r));

        let small = AlertCandidate {
            movement: Some(PriceMove::PriceIncrease),
            change: Some(dec!(5.00)),
            old_price: Some(dec!(100.00)),
            price: Some(dec!(105.00)),
            ..Default::default()
        };
        assert!(!alert_matches_rule(&small, &r));
    }

    #[test]
    fn test_listing_rules() {
        let paused = AlertCandidate {
            status: Some(ProductStatus::Unavailable),
            ..Default::default()
        };
        let removed = AlertCandidate {
            status: Some(ProductStatus::Removed),
            ..Default::default()
        };
        assert!(alert_matches_rule(&paused, &rule(AlertType::ListingPaused)));
        assert!(!alert_matches_rule(&removed, &rule(AlertType::ListingPaused)));
        assert!(alert_matches_rule(&removed, &rule(AlertType::ListingRemoved)));
        assert!(!alert_matches_rule(&paused, &rule(AlertType::ListingRemoved)));
    }

    #[test]
    fn test_scraping_error_rule() {
        let r = rule(AlertType::ScrapingError);
        let with_error = AlertCandidate {
            error: Some("fetch failed".into()),
            ..Default::default()
        };
        let with_detail = AlertCandidate {
            detail: Some("detail".into()),
            ..Default::default()
        };
        assert!(alert_matches_rule(&with_error, &r));
        assert!(alert_matches_rule(&with_detail, &r));
        assert!(!alert_matches_rule(&AlertCandidate::default(), &r));
    }

    #[test]
    fn test_rule_level_target_price_gate() {
        let mut r = rule(AlertType::PriceTarget);
        r.target_price = Some(dec!(50.00));
        let alert = AlertCandidate {
            price: Some(dec!(80.00)),
            ..Default::default()
        };
        assert!(!alert_matches_rule(&alert, &r));

        let cheap = AlertCandidate {
            price: Some(dec!(45.00)),
            ..Default::default()
        };
        assert!(alert_matches_rule(&cheap, &r));
    }

    #[test]
    fn test_rule_level_status_gate() {
        let mut r = rule(AlertType::ListingPaused);
        r.product_status = Some(ProductStatus::Unavailable);
        let paused = AlertCandidate {
            status: Some(ProductStatus::Unavailable),
            ..Default::default()
        };
        assert!(alert_matches_rule(&paused, &r));

        let removed = AlertCandidate {
            status: Some(ProductStatus::Removed),
            ..Default::default()
        };
        assert!(!alert_matches_rule(&removed, &r));
    }
}
