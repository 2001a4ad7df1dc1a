//! Notification fan-out.
//!
//! Matches comparison alerts against the user's rules, applies cooldown and
//! duplicate suppression, renders per-channel messages and dispatches all
//! channels in parallel, logging every attempt.

pub mod channels;
pub mod templates;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::future::join_all;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::models::{
    AlertCandidate, AlertType, ChannelKind, MonitoredProduct, NotificationLog, User,
};
use crate::rules::alert_matches_rule;
use crate::storage::Database;

use channels::{
    EmailChannel, NotificationChannel, PushChannel, SlackChannel, SmsChannel, WebhookChannel,
    WhatsAppChannel,
};
use templates::{
    render_error_alert, render_listing_alert, render_price_alert, render_price_change_alert,
};

type Renderer = fn(&MonitoredProduct, &AlertCandidate, bool) -> String;

/// Picks the template and alert type from the alert shape.
fn classify(alert: &AlertCandidate) -> (Renderer, AlertType) {
    if alert.movement.is_some() {
        (render_price_change_alert, AlertType::PriceChange)
    } else if let Some(status) = alert.status {
        let alert_type = if status == crate::models::ProductStatus::Unavailable {
            AlertType::ListingPaused
        } else {
            AlertType::ListingRemoved
        };
        (render_listing_alert, alert_type)
    } else if alert.error.is_some() || alert.detail.is_some() {
        (render_error_alert, AlertType::ScrapingError)
    } else {
        (render_price_alert, AlertType::PriceTarget)
    }
}

pub struct NotificationManager {
    channels: Vec<Arc<dyn NotificationChannel>>,
    metrics: Arc<Metrics>,
}

impl NotificationManager {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>, metrics: Arc<Metrics>) -> Self {
        Self { channels, metrics }
    }

    /// The default channel set; Slack and the generic webhook join only
    /// when configured.
    pub fn with_default_channels(cfg: Arc<Config>, metrics: Arc<Metrics>) -> Self {
        let mut channels: Vec<Arc<dyn NotificationChannel>> = vec![
            Arc::new(EmailChannel::new(cfg.clone(), metrics.clone())),
            Arc::new(SmsChannel::new(cfg.clone(), metrics.clone())),
            Arc::new(PushChannel::new(cfg.clone(), metrics.clone())),
            Arc::new(WhatsAppChannel::new(cfg.clone(), metrics.clone())),
        ];
        if cfg.slack_webhook_url.is_some() {
            channels.push(Arc::new(SlackChannel::new(
                cfg.slack_webhook_url.clone(),
                metrics.clone(),
            )));
        }
        if cfg.webhook_url.is_some() {
            channels.push(Arc::new(WebhookChannel::new(
                cfg.webhook_url.clone(),
                metrics.clone(),
            )));
        }
        Self::new(channels, metrics)
    }

    /// Sends to one channel and logs the attempt. Channel failures are
    /// contained here; siblings proceed.
    async fn send_one(
        &self,
        db: &Database,
        user: &User,
        subject: &str,
        message: &str,
        alert_rule_id: Option<Uuid>,
        alert_type: Option<AlertType>,
        channel: &Arc<dyn NotificationChannel>,
    ) {
        let kind = channel.kind();
        let start = Instant::now();
        let (success, metadata, error_msg) = match channel.send(user, subject, message).await {
            Ok(metadata) => (true, metadata, None),
            Err(err) => {
                error!(channel = kind.as_str(), error = %err, "notification failed");
                (false, None, Some(err.to_string()))
            }
        };
        self.metrics
            .notification_send_duration_seconds
            .observe(start.elapsed().as_secs_f64());
        self.metrics
            .notifications_sent_total
            .inc(&format!("{}_{}", kind.as_str(), success));

        let log = NotificationLog {
            id: Uuid::new_v4(),
            user_id: user.id,
            alert_rule_id,
            alert_type,
            channel: kind,
            subject: subject.to_string(),
            message: message.to_string(),
            provider_metadata: metadata,
            sent_at: Utc::now(),
            success,
            error: error_msg,
        };
        if let Err(err) = db.insert_notification_log(&log) {
            error!(error = %err, "failed writing notification log");
        }
    }

    /// Re-sends through a single channel, as used by the alert resend task.
    pub async fn send_via(
        &self,
        db: &Database,
        kind: ChannelKind,
        user: &User,
        subject: &str,
        message: &str,
        alert_rule_id: Option<Uuid>,
        alert_type: Option<AlertType>,
    ) -> bool {
        let Some(channel) = self.channels.iter().find(|c| c.kind() == kind) else {
            self.metrics.notifications_skipped_total.inc("channel_unavailable");
            return false;
        };
        self.send_one(db, user, subject, message, alert_rule_id, alert_type, channel)
            .await;
        true
    }

    /// Renders per channel (HTML for email, plain text otherwise), then
    /// dispatches all channels in parallel.
    pub async fn send_rendered(
        &self,
        db: &Database,
        user: &User,
        subject: &str,
        renderer: Renderer,
        monitored: &MonitoredProduct,
        alert: &AlertCandidate,
        alert_rule_id: Option<Uuid>,
        alert_type: Option<AlertType>,
    ) {
        let sends = self.channels.iter().map(|channel| {
            let html = channel.kind() == ChannelKind::Email;
            let message = renderer(monitored, alert, html);
            async move {
                self.send_one(db, user, subject, &message, alert_rule_id, alert_type, channel)
                    .await;
            }
        });
        join_all(sends).await;
    }
}

/// Full fan-out for one product's comparison alerts.
pub async fn dispatch_price_alerts(
    db: &Database,
    cfg: &Config,
    metrics: &Metrics,
    manager: &NotificationManager,
    monitored: &MonitoredProduct,
    alerts: &[AlertCandidate],
) -> anyhow::Result<()> {
    let Some(user) = db.get_user(monitored.user_id)? else {
        anyhow::bail!("user {} not found", monitored.user_id);
    };

    if !user.notifications_enabled {
        metrics.notifications_skipped_total.inc("disabled");
        return Ok(());
    }

    let rules = db.rules_or_default(user.id, Some(monitored.id))?;
    let now = Utc::now();
    let cooldown = cfg.alert_rule_cooldown;

    let mut filtered: Vec<(AlertCandidate, Option<Uuid>)> = Vec::new();
    for alert in alerts {
        for rule in &rules {
            if !alert_matches_rule(alert, rule) {
                continue;
            }
            metrics
                .alert_rules_triggered_total
                .inc(rule.rule_type.as_str());

            if let Some(last) = rule.last_notified_at {
                if (now - last).num_seconds() < cooldown {
                    metrics.alert_rules_suppressed_total.inc("cooldown");
                    break;
                }
            }

            let mut matched = alert.clone();
            matched.rule_id = rule.id;
            filtered.push((matched, rule.id));
            break;
        }
    }

    for (alert, rule_id) in filtered {
        let (renderer, alert_type) = classify(&alert);
        let subject = format!(
            "Alerta {} - {}",
            alert_type.as_str().replace('_', " "),
            monitored.name
        );
        let preview = renderer(monitored, &alert, false);

        let duplicate = db.has_recent_duplicate_notification(
            user.id,
            &subject,
            &preview,
            cfg.alert_duplicate_window,
        )?;
        if duplicate {
            metrics.alert_rules_suppressed_total.inc("duplicate");
            continue;
        }

        info!(
            monitored_id = %monitored.id,
            alert_type = alert_type.as_str(),
            "dispatching alert"
        );
        manager
            .send_rendered(
                db,
                &user,
                &subject,
                renderer,
                monitored,
                &alert,
                rule_id,
                Some(alert_type),
            )
            .await;

        if let Some(rule_id) = rule_id {
            db.update_last_notified(rule_id, now)?;
        }
    }
    Ok(())
}
