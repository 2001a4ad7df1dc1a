//! SQLite-backed durable store.
//!
//! WAL mode, one shared connection behind a mutex, UUIDs/decimals/dates as
//! TEXT. Deleting a monitored product cascades to its competitors and
//! scoped rules.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{
    AlertRule, AlertType, ChannelKind, ComparisonResult, CompetitorProduct, MonitoredProduct,
    MonitoredStatus, MonitoringType, NotificationLog, PriceComparison, ProductStatus,
    ScrapingErrorRecord, ScrapingErrorType, User,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    email TEXT,
    phone TEXT,
    whatsapp_number TEXT,
    fcm_token TEXT,
    notifications_enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS monitored_products (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    monitoring_type TEXT NOT NULL,
    product_url TEXT NOT NULL,
    target_price TEXT,
    current_price TEXT,
    free_shipping INTEGER NOT NULL DEFAULT 0,
    thumbnail TEXT,
    etag TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    last_checked TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(user_id, product_url)
);

CREATE TABLE IF NOT EXISTS competitor_products (
    id TEXT PRIMARY KEY,
    monitored_product_id TEXT NOT NULL REFERENCES monitored_products(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    product_url TEXT NOT NULL,
    current_price TEXT,
    old_price TEXT,
    free_shipping INTEGER NOT NULL DEFAULT 0,
    seller TEXT,
    thumbnail TEXT,
    status TEXT NOT NULL DEFAULT 'available',
    last_checked TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(monitored_product_id, product_url)
);

CREATE TABLE IF NOT EXISTS alert_rules (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    monitored_product_id TEXT REFERENCES monitored_products(id) ON DELETE CASCADE,
    rule_type TEXT NOT NULL,
    threshold_value TEXT,
    threshold_percent TEXT,
    target_price TEXT,
    product_status TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_notified_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS price_comparisons (
    id TEXT PRIMARY KEY,
    monitored_product_id TEXT NOT NULL REFERENCES monitored_products(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_comparisons_product_time
    ON price_comparisons(monitored_product_id, created_at DESC);

CREATE TABLE IF NOT EXISTS notification_logs (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    alert_rule_id TEXT,
    alert_type TEXT,
    channel TEXT NOT NULL,
    subject TEXT NOT NULL,
    message TEXT NOT NULL,
    provider_metadata TEXT,
    sent_at TEXT NOT NULL,
    success INTEGER NOT NULL,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_notification_dedup
    ON notification_logs(user_id, subject, sent_at DESC);

CREATE TABLE IF NOT EXISTS scraping_errors (
    id TEXT PRIMARY KEY,
    monitored_product_id TEXT NOT NULL,
    url TEXT NOT NULL,
    status_code INTEGER,
    error_type TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// Fields extracted by the scraper for a monitored product.
#[derive(Debug, Clone)]
pub struct MonitoredScrapedInfo {
    pub current_price: Decimal,
    pub thumbnail: Option<String>,
    pub free_shipping: bool,
}

/// Fields extracted by the scraper for a competitor listing.
#[derive(Debug, Clone)]
pub struct CompetitorScrapedInfo {
    pub name: String,
    pub current_price: Decimal,
    pub old_price: Option<Decimal>,
    pub thumbnail: Option<String>,
    pub free_shipping: bool,
    pub seller: Option<String>,
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

fn dt(s: String) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(&s)
        .context("invalid timestamp in database")?
        .with_timezone(&Utc))
}

fn opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(dt).transpose()
}

fn opt_decimal(s: Option<String>) -> Option<Decimal> {
    s.and_then(|raw| raw.parse().ok())
}

fn uuid_col(s: String) -> Result<Uuid> {
    Uuid::parse_str(&s).context("invalid uuid in database")
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("failed opening database")?;
        conn.execute_batch(SCHEMA_SQL).context("schema init failed")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn health_check(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    // ---------- users ----------

    /// Inserts the user and the automatic default price-target rule.
    pub fn create_user(&self, user: &User) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO users (id, email, phone, whatsapp_number, fcm_token, notifications_enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    user.id.to_string(),
                    user.email,
                    user.phone,
                    user.whatsapp_number,
                    user.fcm_token,
                    user.notifications_enabled as i64,
                    user.created_at.to_rfc3339(),
                ],
            )?;
        }
        let mut default_rule = AlertRule::default_price_target(user.id);
        default_rule.id = Some(Uuid::new_v4());
        self.create_rule(&default_rule)?;
        Ok(())
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, email, phone, whatsapp_number, fcm_token, notifications_enabled, created_at
             FROM users WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?
        .map(|(id, email, phone, whatsapp, fcm, enabled, created)| {
            Ok(User {
                id: uuid_col(id)?,
                email,
                phone,
                whatsapp_number: whatsapp,
                fcm_token: fcm,
                notifications_enabled: enabled != 0,
                created_at: dt(created)?,
            })
        })
        .transpose()
    }

    // ---------- monitored products ----------

    fn monitored_from_row(row: &Row<'_>) -> rusqlite::Result<(MonitoredProduct, Option<String>, Option<String>)> {
        // Returns raw timestamps separately so error mapping stays out of
        // the rusqlite closure.
        Ok((
            MonitoredProduct {
                id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
                user_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
                name: row.get(2)?,
                monitoring_type: MonitoringType::parse(&row.get::<_, String>(3)?)
                    .unwrap_or(MonitoringType::Scraping),
                product_url: row.get(4)?,
                target_price: opt_decimal(row.get(5)?),
                current_price: opt_decimal(row.get(6)?),
                free_shipping: row.get::<_, i64>(7)? != 0,
                thumbnail: row.get(8)?,
                etag: row.get(9)?,
                status: MonitoredStatus::parse(&row.get::<_, String>(10)?)
                    .unwrap_or(MonitoredStatus::Active),
                last_checked: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            row.get(11)?,
            row.get(12)?,
        ))
    }

    const MONITORED_COLS: &'static str =
        "id, user_id, name, monitoring_type, product_url, target_price, current_price, \
         free_shipping, thumbnail, etag, status, last_checked, created_at, updated_at";

    fn finish_monitored(
        (mut product, last_checked, created_at): (MonitoredProduct, Option<String>, Option<String>),
        updated_at: Option<String>,
    ) -> Result<MonitoredProduct> {
        product.last_checked = opt_dt(last_checked)?;
        if let Some(created) = created_at {
            product.created_at = dt(created)?;
        }
        if let Some(updated) = updated_at {
            product.updated_at = dt(updated)?;
        }
        Ok(product)
    }

    fn query_monitored(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<MonitoredProduct>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| {
            let parts = Self::monitored_from_row(row)?;
            let updated: Option<String> = row.get(13)?;
            Ok((parts, updated))
        })?;
        let mut products = Vec::new();
        for row in rows {
            let (parts, updated) = row?;
            products.push(Self::finish_monitored(parts, updated)?);
        }
        Ok(products)
    }

    pub fn get_monitored(&self, id: Uuid) -> Result<Option<MonitoredProduct>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM monitored_products WHERE id = ?1",
            Self::MONITORED_COLS
        );
        Ok(Self::query_monitored(&conn, &sql, &[&id.to_string()])?.pop())
    }

    pub fn list_monitored_by_type(&self, monitoring_type: MonitoringType) -> Result<Vec<MonitoredProduct>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM monitored_products WHERE monitoring_type = ?1 AND status = 'active' ORDER BY created_at",
            Self::MONITORED_COLS
        );
        Self::query_monitored(&conn, &sql, &[&monitoring_type.as_str()])
    }

    /// Insert-or-refresh from a scrape run, keyed by (user_id, url).
    pub fn upsert_monitored_scraped(
        &self,
        user_id: Uuid,
        name: &str,
        product_url: &str,
        target_price: Option<Decimal>,
        info: &MonitoredScrapedInfo,
        last_checked: DateTime<Utc>,
    ) -> Result<MonitoredProduct> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();

        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM monitored_products WHERE user_id = ?1 AND product_url = ?2",
                params![user_id.to_string(), product_url],
                |row| row.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE monitored_products
                     SET current_price = ?1, thumbnail = ?2, free_shipping = ?3,
                         status = 'active', last_checked = ?4, updated_at = ?5
                     WHERE id = ?6",
                    params![
                        info.current_price.to_string(),
                        info.thumbnail,
                        info.free_shipping as i64,
                        last_checked.to_rfc3339(),
                        now,
                        id,
                    ],
                )?;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO monitored_products
                     (id, user_id, name, monitoring_type, product_url, target_price, current_price,
                      free_shipping, thumbnail, status, last_checked, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'scraping', ?4, ?5, ?6, ?7, ?8, 'active', ?9, ?10, ?10)",
                    params![
                        id,
                        user_id.to_string(),
                        name,
                        product_url,
                        target_price.map(|p| p.to_string()),
                        info.current_price.to_string(),
                        info.free_shipping as i64,
                        info.thumbnail,
                        last_checked.to_rfc3339(),
                        now,
                    ],
                )?;
                id
            }
        };

        let sql = format!(
            "SELECT {} FROM monitored_products WHERE id = ?1",
            Self::MONITORED_COLS
        );
        Self::query_monitored(&conn, &sql, &[&id])?
            .pop()
            .context("monitored product vanished after upsert")
    }

    pub fn delete_monitored(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM monitored_products WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    // ---------- competitor products ----------

    const COMPETITOR_COLS: &'static str =
        "id, monitored_product_id, name, product_url, current_price, old_price, free_shipping, \
         seller, thumbnail, status, last_checked, created_at, updated_at";

    fn query_competitors(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<CompetitorProduct>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, Option<String>>(10)?,
                row.get::<_, String>(11)?,
                row.get::<_, String>(12)?,
            ))
        })?;
        let mut competitors = Vec::new();
        for row in rows {
            let (id, mid, name, url, price, old, shipping, seller, thumb, status, checked, created, updated) = row?;
            competitors.push(CompetitorProduct {
                id: uuid_col(id)?,
                monitored_product_id: uuid_col(mid)?,
                name,
                product_url: url,
                current_price: opt_decimal(price),
                old_price: opt_decimal(old),
                free_shipping: shipping != 0,
                seller,
                thumbnail: thumb,
                status: ProductStatus::parse(&status).unwrap_or(ProductStatus::Available),
                last_checked: opt_dt(checked)?,
                created_at: dt(created)?,
                updated_at: dt(updated)?,
            });
        }
        Ok(competitors)
    }

    pub fn list_competitors(&self, monitored_product_id: Uuid) -> Result<Vec<CompetitorProduct>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM competitor_products WHERE monitored_product_id = ?1 ORDER BY created_at",
            Self::COMPETITOR_COLS
        );
        Self::query_competitors(&conn, &sql, &[&monitored_product_id.to_string()])
    }

    pub fn list_all_competitors(&self) -> Result<Vec<CompetitorProduct>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM competitor_products ORDER BY created_at",
            Self::COMPETITOR_COLS
        );
        Self::query_competitors(&conn, &sql, &[])
    }

    /// Insert-or-refresh from a scrape run. On refresh the previous
    /// current_price rolls into old_price.
    pub fn upsert_competitor_scraped(
        &self,
        monitored_product_id: Uuid,
        product_url: &str,
        info: &CompetitorScrapedInfo,
        last_checked: DateTime<Utc>,
    ) -> Result<CompetitorProduct> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();

        let existing: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT id, current_price FROM competitor_products
                 WHERE monitored_product_id = ?1 AND product_url = ?2",
                params![monitored_product_id.to_string(), product_url],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let id = match existing {
            Some((id, prior_price)) => {
                conn.execute(
                    "UPDATE competitor_products
                     SET name = ?1, current_price = ?2, old_price = ?3, thumbnail = ?4,
                         free_shipping = ?5, seller = ?6, status = 'available',
                         last_checked = ?7, updated_at = ?8
                     WHERE id = ?9",
                    params![
                        info.name,
                        info.current_price.to_string(),
                        prior_price,
                        info.thumbnail,
                        info.free_shipping as i64,
                        info.seller,
                        last_checked.to_rfc3339(),
                        now,
                        id,
                    ],
                )?;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO competitor_products
                     (id, monitored_product_id, name, product_url, current_price, old_price,
                      free_shipping, seller, thumbnail, status, last_checked, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'available', ?10, ?11, ?11)",
                    params![
                        id,
                        monitored_product_id.to_string(),
                        info.name,
                        product_url,
                        info.current_price.to_string(),
                        info.old_price.map(|p| p.to_string()),
                        info.free_shipping as i64,
                        info.seller,
                        info.thumbnail,
                        last_checked.to_rfc3339(),
                        now,
                    ],
                )?;
                id
            }
        };

        let sql = format!(
            "SELECT {} FROM competitor_products WHERE id = ?1",
            Self::COMPETITOR_COLS
        );
        Self::query_competitors(&conn, &sql, &[&id])?
            .pop()
            .context("competitor vanished after upsert")
    }

    pub fn set_competitor_status(&self, id: Uuid, status: ProductStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE competitor_products SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }

    // ---------- comparisons ----------

    pub fn insert_comparison(
        &self,
        monitored_product_id: Uuid,
        data: &ComparisonResult,
    ) -> Result<PriceComparison> {
        let conn = self.conn.lock();
        let comparison = PriceComparison {
            id: Uuid::new_v4(),
            monitored_product_id,
            created_at: Utc::now(),
            data: data.clone(),
        };
        conn.execute(
            "INSERT INTO price_comparisons (id, monitored_product_id, created_at, data)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                comparison.id.to_string(),
                monitored_product_id.to_string(),
                comparison.created_at.to_rfc3339(),
                serde_json::to_string(&comparison.data)?,
            ],
        )?;
        Ok(comparison)
    }

    pub fn latest_comparisons(&self, monitored_product_id: Uuid, limit: usize) -> Result<Vec<PriceComparison>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, monitored_product_id, created_at, data
             FROM price_comparisons
             WHERE monitored_product_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![monitored_product_id.to_string(), limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut comparisons = Vec::new();
        for row in rows {
            let (id, mid, created, data) = row?;
            comparisons.push(PriceComparison {
                id: uuid_col(id)?,
                monitored_product_id: uuid_col(mid)?,
                created_at: dt(created)?,
                data: serde_json::from_str(&data)?,
            });
        }
        Ok(comparisons)
    }

    // ---------- alert rules ----------

    pub fn create_rule(&self, rule: &AlertRule) -> Result<Uuid> {
        let conn = self.conn.lock();
        let id = rule.id.unwrap_or_else(Uuid::new_v4);
        conn.execute(
            "INSERT INTO alert_rules
             (id, user_id, monitored_product_id, rule_type, threshold_value, threshold_percent,
              target_price, product_status, enabled, last_notified_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id.to_string(),
                rule.user_id.to_string(),
                rule.monitored_product_id.map(|id| id.to_string()),
                rule.rule_type.as_str(),
                rule.threshold_value.map(|v| v.to_string()),
                rule.threshold_percent.map(|v| v.to_string()),
                rule.target_price.map(|v| v.to_string()),
                rule.product_status.map(|s| s.as_str().to_string()),
                rule.enabled as i64,
                rule.last_notified_at.map(|t| t.to_rfc3339()),
                rule.created_at.to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    /// Enabled rules for the user scoped to this product or unscoped. When
    /// none exist a synthesized default price-target rule is returned.
    pub fn rules_or_default(&self, user_id: Uuid, monitored_product_id: Option<Uuid>) -> Result<Vec<AlertRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, monitored_product_id, rule_type, threshold_value, threshold_percent,
                    target_price, product_status, enabled, last_notified_at, created_at
             FROM alert_rules
             WHERE user_id = ?1 AND enabled = 1
               AND (monitored_product_id IS NULL OR monitored_product_id = ?2)
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(
            params![
                user_id.to_string(),
                monitored_product_id.map(|id| id.to_string()),
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, String>(10)?,
                ))
            },
        )?;

        let mut rules = Vec::new();
        for row in rows {
            let (id, uid, mid, rtype, tv, tp, target, pstatus, enabled, last, created) = row?;
            rules.push(AlertRule {
                id: Some(uuid_col(id)?),
                user_id: uuid_col(uid)?,
                monitored_product_id: mid.map(uuid_col).transpose()?,
                rule_type: AlertType::parse(&rtype).unwrap_or(AlertType::PriceTarget),
                threshold_value: opt_decimal(tv),
                threshold_percent: opt_decimal(tp),
                target_price: opt_decimal(target),
                product_status: pstatus.as_deref().and_then(ProductStatus::parse),
                enabled: enabled != 0,
                last_notified_at: opt_dt(last)?,
                created_at: dt(created)?,
            });
        }

        if rules.is_empty() {
            rules.push(AlertRule::default_price_target(user_id));
        }
        Ok(rules)
    }

    pub fn update_last_notified(&self, rule_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE alert_rules SET last_notified_at = ?1 WHERE id = ?2",
            params![at.to_rfc3339(), rule_id.to_string()],
        )?;
        Ok(())
    }

    // ---------- notification logs ----------

    pub fn insert_notification_log(&self, log: &NotificationLog) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO notification_logs
             (id, user_id, alert_rule_id, alert_type, channel, subject, message,
              provider_metadata, sent_at, success, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                log.id.to_string(),
                log.user_id.to_string(),
                log.alert_rule_id.map(|id| id.to_string()),
                log.alert_type.map(|t| t.as_str().to_string()),
                log.channel.as_str(),
                log.subject,
                log.message,
                log.provider_metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                log.sent_at.to_rfc3339(),
                log.success as i64,
                log.error,
            ],
        )?;
        Ok(())
    }

    /// A successful log row with the same (user, subject, message) inside
    /// the window suppresses a resend.
    pub fn has_recent_duplicate_notification(
        &self,
        user_id: Uuid,
        subject: &str,
        message: &str,
        window_secs: i64,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let cutoff = (Utc::now() - Duration::seconds(window_secs)).to_rfc3339();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notification_logs
             WHERE user_id = ?1 AND subject = ?2 AND message = ?3
               AND success = 1 AND sent_at >= ?4",
            params![user_id.to_string(), subject, message, cutoff],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_notification_log(&self, id: Uuid) -> Result<Option<NotificationLog>> {
        // Reuses the per-user reader; log ids are globally unique.
        let conn = self.conn.lock();
        let user_id: Option<String> = conn
            .query_row(
                "SELECT user_id FROM notification_logs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);
        let Some(user_id) = user_id else {
            return Ok(None);
        };
        Ok(self
            .notification_logs_for_user(uuid_col(user_id)?)?
            .into_iter()
            .find(|log| log.id == id))
    }

    pub fn notification_logs_for_user(&self, user_id: Uuid) -> Result<Vec<NotificationLog>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, alert_rule_id, alert_type, channel, subject, message,
                    provider_metadata, sent_at, success, error
             FROM notification_logs WHERE user_id = ?1 ORDER BY sent_at",
        )?;
        let rows = stmt.query_map(params![user_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, i64>(9)?,
                row.get::<_, Option<String>>(10)?,
            ))
        })?;
        let mut logs = Vec::new();
        for row in rows {
            let (id, uid, rule, atype, channel, subject, message, metadata, sent, success, error) = row?;
            logs.push(NotificationLog {
                id: uuid_col(id)?,
                user_id: uuid_col(uid)?,
                alert_rule_id: rule.map(uuid_col).transpose()?,
                alert_type: atype.as_deref().and_then(AlertType::parse),
                channel: ChannelKind::parse(&channel).unwrap_or(ChannelKind::Webhook),
                subject,
                message,
                provider_metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                sent_at: dt(sent)?,
                success: success != 0,
                error,
            });
        }
        Ok(logs)
    }

    // ---------- scraping errors ----------

    pub fn insert_scraping_error(
        &self,
        monitored_product_id: Uuid,
        url: &str,
        status_code: Option<u16>,
        error_type: ScrapingErrorType,
        message: &str,
    ) -> Result<ScrapingErrorRecord> {
        let conn = self.conn.lock();
        let record = ScrapingErrorRecord {
            id: Uuid::new_v4(),
            monitored_product_id,
            url: url.to_string(),
            status_code,
            error_type,
            message: message.to_string(),
            created_at: Utc::now(),
        };
        conn.execute(
            "INSERT INTO scraping_errors
             (id, monitored_product_id, url, status_code, error_type, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.to_string(),
                record.monitored_product_id.to_string(),
                record.url,
                record.status_code.map(|c| c as i64),
                record.error_type.as_str(),
                record.message,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(record)
    }

    /// Row counts per table, for the periodic database metrics task.
    pub fn table_counts(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        let tables = [
            "users",
            "monitored_products",
            "competitor_products",
            "alert_rules",
            "price_comparisons",
            "notification_logs",
            "scraping_errors",
        ];
        let mut counts = Vec::with_capacity(tables.len());
        for table in tables {
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
            counts.push((table.to_string(), count));
        }
        Ok(counts)
    }
}
