//! Notification delivery channels.
//!
//! Each channel returns Ok(Some(metadata)) on delivery, Ok(None) when it
//! skipped (missing configuration or recipient data, which is never an
//! error), and Err on a provider failure. Failures in one channel do not
//! abort siblings.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;
use tracing::warn;

use crate::config::Config;
use crate::error::ChannelDeliveryError;
use crate::metrics::Metrics;
use crate::models::{ChannelKind, User};

pub type ChannelResult = Result<Option<serde_json::Value>, ChannelDeliveryError>;

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;
    async fn send(&self, user: &User, subject: &str, message: &str) -> ChannelResult;
}

fn skip(metrics: &Metrics, reason: &str) -> ChannelResult {
    warn!(reason, "notification channel skipped");
    metrics.notifications_skipped_total.inc(reason);
    Ok(None)
}

/// SMTP email. The manager renders HTML for this channel.
pub struct EmailChannel {
    cfg: Arc<Config>,
    metrics: Arc<Metrics>,
}

impl EmailChannel {
    pub fn new(cfg: Arc<Config>, metrics: Arc<Metrics>) -> Self {
        Self { cfg, metrics }
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(&self, user: &User, subject: &str, message: &str) -> ChannelResult {
        let Some(to) = user.email.as_deref() else {
            return skip(&self.metrics, "email_missing");
        };
        let Some(host) = self.cfg.smtp_host.as_deref() else {
            return skip(&self.metrics, "smtp_not_configured");
        };

        let from = self
            .cfg
            .smtp_from
            .as_deref()
            .or(self.cfg.smtp_username.as_deref())
            .unwrap_or("alerts@localhost");

        let email = Message::builder()
            .from(
                from.parse()
                    .map_err(|e| ChannelDeliveryError(format!("invalid sender: {}", e)))?,
            )
            .to(to
                .parse()
                .map_err(|e| ChannelDeliveryError(format!("invalid recipient: {}", e)))?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(message.to_string())
            .map_err(|e| ChannelDeliveryError(format!("message build failed: {}", e)))?;

        let mut builder = if self.cfg.smtp_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| ChannelDeliveryError(format!("smtp relay: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };
        builder = builder.port(self.cfg.smtp_port);
        if let Some(username) = self.cfg.smtp_username.as_deref() {
            builder = builder.credentials(Credentials::new(
                username.to_string(),
                self.cfg.smtp_password.clone().unwrap_or_default(),
            ));
        }
        let mailer = builder.build();

        let response = mailer
            .send(email)
            .await
            .map_err(|e| ChannelDeliveryError(format!("smtp send failed: {}", e)))?;
        Ok(Some(json!({ "code": response.code().to_string() })))
    }
}

/// Twilio SMS over the REST API.
pub struct SmsChannel {
    cfg: Arc<Config>,
    metrics: Arc<Metrics>,
    http: reqwest::Client,
}

impl SmsChannel {
    pub fn new(cfg: Arc<Config>, metrics: Arc<Metrics>) -> Self {
        Self {
            cfg,
            metrics,
            http: reqwest::Client::new(),
        }
    }
}

async fn twilio_send(
    http: &reqwest::Client,
    sid: &str,
    token: &str,
    from: &str,
    to: &str,
    body: &str,
) -> ChannelResult {
    let url = format!("https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json", sid);
    let resp = http
        .post(&url)
        .basic_auth(sid, Some(token))
        .form(&[("To", to), ("From", from), ("Body", body)])
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| ChannelDeliveryError(format!("twilio request failed: {}", e)))?;

    if !resp.status().is_success() {
        return Err(ChannelDeliveryError(format!(
            "twilio returned {}",
            resp.status()
        )));
    }
    let payload: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| ChannelDeliveryError(format!("twilio response: {}", e)))?;
    Ok(Some(json!({ "sid": payload.get("sid") })))
}

#[async_trait]
impl NotificationChannel for SmsChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sms
    }

    async fn send(&self, user: &User, subject: &str, message: &str) -> ChannelResult {
        let (Some(sid), Some(token), Some(from)) = (
            self.cfg.twilio_account_sid.as_deref(),
            self.cfg.twilio_auth_token.as_deref(),
            self.cfg.twilio_sms_from.as_deref(),
        ) else {
            return skip(&self.metrics, "twilio_not_configured");
        };
        let Some(phone) = user.phone.as_deref() else {
            return skip(&self.metrics, "phone_missing");
        };

        let body = format!("{}: {}", subject, message);
        twilio_send(&self.http, sid, token, from, phone, &body).await
    }
}

/// Twilio WhatsApp channel; same API with `whatsapp:` address prefixes.
pub struct WhatsAppChannel {
    cfg: Arc<Config>,
    metrics: Arc<Metrics>,
    http: reqwest::Client,
}

impl WhatsAppChannel {
    pub fn new(cfg: Arc<Config>, metrics: Arc<Metrics>) -> Self {
        Self {
            cfg,
            metrics,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationChannel for WhatsAppChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Whatsapp
    }

    async fn send(&self, user: &User, subject: &str, message: &str) -> ChannelResult {
        let (Some(sid), Some(token), Some(from)) = (
            self.cfg.twilio_account_sid.as_deref(),
            self.cfg.twilio_auth_token.as_deref(),
            self.cfg.twilio_whatsapp_from.as_deref(),
        ) else {
            return skip(&self.metrics, "twilio_not_configured");
        };
        let Some(phone) = user.whatsapp_number.as_deref() else {
            return skip(&self.metrics, "phone_missing");
        };

        let body = format!("{}: {}", subject, message);
        twilio_send(
            &self.http,
            sid,
            token,
            &format!("whatsapp:{}", from),
            &format!("whatsapp:{}", phone),
            &body,
        )
        .await
    }
}

/// Firebase Cloud Messaging push notifications.
pub struct PushChannel {
    cfg: Arc<Config>,
    metrics: Arc<Metrics>,
    http: reqwest::Client,
}

impl PushChannel {
    pub fn new(cfg: Arc<Config>, metrics: Arc<Metrics>) -> Self {
        Self {
            cfg,
            metrics,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationChannel for PushChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    async fn send(&self, user: &User, subject: &str, message: &str) -> ChannelResult {
        let Some(token) = user.fcm_token.as_deref() else {
            return skip(&self.metrics, "push_token_missing");
        };
        let Some(server_key) = self.cfg.fcm_server_key.as_deref() else {
            return skip(&self.metrics, "fcm_not_configured");
        };

        let payload = json!({
            "to": token,
            "notification": { "title": subject, "body": message },
        });
        let resp = self
            .http
            .post("https://fcm.googleapis.com/fcm/send")
            .header("Authorization", format!("key={}", server_key))
            .json(&payload)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| ChannelDeliveryError(format!("fcm request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(ChannelDeliveryError(format!("fcm returned {}", resp.status())));
        }
        Ok(Some(json!({ "status": resp.status().as_u16() })))
    }
}

/// Slack incoming webhook.
pub struct SlackChannel {
    webhook: Option<String>,
    metrics: Arc<Metrics>,
    http: reqwest::Client,
}

impl SlackChannel {
    pub fn new(webhook: Option<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            webhook,
            metrics,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationChannel for SlackChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Slack
    }

    async fn send(&self, _user: &User, subject: &str, message: &str) -> ChannelResult {
        let Some(webhook) = self.webhook.as_deref() else {
            return skip(&self.metrics, "slack_webhook_missing");
        };
        let payload = json!({ "text": format!("*{}*\n{}", subject, message) });
        let resp = self
            .http
            .post(webhook)
            .json(&payload)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| ChannelDeliveryError(format!("slack request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(ChannelDeliveryError(format!("slack returned {}", resp.status())));
        }
        Ok(Some(json!({ "status": resp.status().as_u16() })))
    }
}

/// Generic webhook fallback, posting the rendered alert as JSON.
pub struct WebhookChannel {
    url: Option<String>,
    metrics: Arc<Metrics>,
    http: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: Option<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            url,
            metrics,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn send(&self, user: &User, subject: &str, message: &str) -> ChannelResult {
        let Some(url) = self.url.as_deref() else {
            return skip(&self.metrics, "webhook_not_configured");
        };
        let payload = json!({
            "user_id": user.id,
            "subject": subject,
            "message": message,
        });
        let resp = self
            .http
            .post(url)
            .json(&payload)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| ChannelDeliveryError(format!("webhook request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(ChannelDeliveryError(format!("webhook returned {}", resp.status())));
        }
        Ok(Some(json!({ "status": resp.status().as_u16() })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn user() -> User {
        User {
            id: Uuid::new_v4(),
            email: Some("user@example.com".into()),
            phone: Some("+5511999990000".into()),
            whatsapp_number: None,
            fcm_token: None,
            notifications_enabled: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_unconfigured_channels_skip_not_error() {
        let cfg = Arc::new(Config::default());
        let metrics = Arc::new(Metrics::new());

        let email = EmailChannel::new(cfg.clone(), metrics.clone());
        assert!(email.send(&user(), "s", "m").await.unwrap().is_none());
        assert_eq!(metrics.notifications_skipped_total.get("smtp_not_configured"), 1);

        let sms = SmsChannel::new(cfg.clone(), metrics.clone());
        assert!(sms.send(&user(), "s", "m").await.unwrap().is_none());
        assert_eq!(metrics.notifications_skipped_total.get("twilio_not_configured"), 1);

        let push = PushChannel::new(cfg.clone(), metrics.clone());
        assert!(push.send(&user(), "s", "m").await.unwrap().is_none());
        assert_eq!(metrics.notifications_skipped_total.get("push_token_missing"), 1);

        let slack = SlackChannel::new(None, metrics.clone());
        assert!(slack.send(&user(), "s", "m").await.unwrap().is_none());

        let webhook = WebhookChannel::new(None, metrics.clone());
        assert!(webhook.send(&user(), "s", "m").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_recipient_data_skips() {
        let mut cfg = Config::default();
        cfg.twilio_account_sid = Some("sid".into());
        cfg.twilio_auth_token = Some("token".into());
        cfg.twilio_sms_from = Some("+15550001111".into());
        let metrics = Arc::new(Metrics::new());

        let no_phone = User {
            phone: None,
            ..user()
        };
        let sms = SmsChannel::new(Arc::new(cfg), metrics.clone());
        assert!(sms.send(&no_phone, "s", "m").await.unwrap().is_none());
        assert_eq!(metrics.notifications_skipped_total.get("phone_missing"), 1);
    }

    #[test]
    fn test_channel_kinds() {
        let cfg = Arc::new(Config::default());
        let metrics = Arc::new(Metrics::new());
        assert_eq!(EmailChannel::new(cfg.clone(), metrics.clone()).kind(), ChannelKind::Email);
        assert_eq!(SmsChannel::new(cfg.clone(), metrics.clone()).kind(), ChannelKind::Sms);
        assert_eq!(WhatsAppChannel::new(cfg.clone(), metrics.clone()).kind(), ChannelKind::Whatsapp);
        assert_eq!(PushChannel::new(cfg, metrics.clone()).kind(), ChannelKind::Push);
        assert_eq!(SlackChannel::new(None, metrics.clone()).kind(), ChannelKind::Slack);
        assert_eq!(WebhookChannel::new(None, metrics).kind(), ChannelKind::Webhook);
    }
}
