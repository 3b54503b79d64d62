use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{
    BrokerConnectionRepository, ChannelRepository, PolicyRepository, ReviewSink, SessionStore,
    TenantRepository,
};
use crate::domain::{
    BrokerConnection, BrokerType, ChannelConfig, NormalizedSignal, SizingMode, SubscriptionTier,
    Tenant, TenantStatus, TradingPolicy, TradingSession,
};
use crate::error::{RelayError, Result};
use crate::idempotency::IdempotencyStore;

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a PostgreSQL store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Remove expired idempotency claims
    pub async fn purge_expired_claims(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM message_claims WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn not_updated(entity: &'static str, id: impl ToString, rows: u64) -> Result<()> {
    if rows == 0 {
        Err(RelayError::not_found(entity, id))
    } else {
        Ok(())
    }
}

// ==================== Row mapping ====================

fn tenant_from_row(r: &PgRow) -> Result<Tenant> {
    Ok(Tenant {
        id: r.get("id"),
        email: r.get("email"),
        status: TenantStatus::try_from(r.get::<String, _>("status").as_str())?,
        tier: SubscriptionTier::try_from(r.get::<String, _>("tier").as_str())?,
        feed_credentials: r.get("feed_credentials"),
        channel_ids: r.get("channel_ids"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn channel_from_row(r: &PgRow) -> ChannelConfig {
    ChannelConfig {
        id: r.get("id"),
        tenant_id: r.get("tenant_id"),
        channel_id: r.get("channel_id"),
        channel_name: r.get("channel_name"),
        pattern: r.get("pattern"),
        take_profit_pattern: r.get("take_profit_pattern"),
        enabled: r.get("enabled"),
        broker_connection_ids: r.get("broker_connection_ids"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

fn policy_from_row(r: &PgRow) -> Result<TradingPolicy> {
    let sizing: SizingMode = serde_json::from_value(r.get("sizing"))?;
    let session: Option<TradingSession> = r
        .get::<Option<serde_json::Value>, _>("session")
        .map(serde_json::from_value)
        .transpose()?;
    let allowed: Vec<String> = r.get("allowed_symbols");
    let denied: Vec<String> = r.get("denied_symbols");

    Ok(TradingPolicy {
        tenant_id: r.get("tenant_id"),
        sizing,
        allowed_symbols: allowed.into_iter().collect::<BTreeSet<_>>(),
        denied_symbols: denied.into_iter().collect::<BTreeSet<_>>(),
        max_exposure_pct: r.get::<Decimal, _>("max_exposure_pct"),
        session,
        max_slippage_pct: r.get::<Decimal, _>("max_slippage_pct"),
        auto_execute: r.get("auto_execute"),
        updated_at: r.get("updated_at"),
    })
}

fn broker_from_row(r: &PgRow) -> Result<BrokerConnection> {
    let broker_type: BrokerType = r.get::<String, _>("broker_type").parse()?;
    let metadata = match r.get::<serde_json::Value, _>("metadata") {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    Ok(BrokerConnection {
        id: r.get("id"),
        tenant_id: r.get("tenant_id"),
        broker_type,
        credentials: r.get("credentials"),
        active: r.get("active"),
        last_used_at: r.get("last_used_at"),
        metadata,
        created_at: r.get("created_at"),
    })
}

// ==================== Tenants ====================

#[async_trait]
impl TenantRepository for PostgresStore {
    #[instrument(skip(self))]
    async fn get(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let row = sqlx::query(
            r#"
            SELECT id, email, status, tier, feed_credentials, channel_ids, created_at, updated_at
            FROM tenants WHERE id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(tenant_from_row).transpose()
    }

    async fn list_active(&self) -> Result<Vec<Tenant>> {
        let rows = sqlx::query(
            r#"
            SELECT id, email, status, tier, feed_credentials, channel_ids, created_at, updated_at
            FROM tenants WHERE status = 'active'
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(tenant_from_row).collect()
    }

    #[instrument(skip(self, tenant), fields(tenant = %tenant.id))]
    async fn add(&self, tenant: &Tenant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tenants (id, email, status, tier, feed_credentials, channel_ids, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&tenant.id)
        .bind(&tenant.email)
        .bind(tenant.status.as_str())
        .bind(tenant.tier.as_str())
        .bind(&tenant.feed_credentials)
        .bind(&tenant.channel_ids)
        .bind(tenant.created_at)
        .bind(tenant.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, tenant), fields(tenant = %tenant.id))]
    async fn update(&self, tenant: &Tenant) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tenants
            SET email = $2, status = $3, tier = $4, feed_credentials = $5,
                channel_ids = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(&tenant.id)
        .bind(&tenant.email)
        .bind(tenant.status.as_str())
        .bind(tenant.tier.as_str())
        .bind(&tenant.feed_credentials)
        .bind(&tenant.channel_ids)
        .bind(tenant.updated_at)
        .execute(&self.pool)
        .await?;
        not_updated("tenant", &tenant.id, result.rows_affected())
    }

    async fn delete(&self, tenant_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, tenant_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM tenants WHERE id = $1) AS found")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("found"))
    }
}

// ==================== Channel configs ====================

const CHANNEL_COLUMNS: &str = "id, tenant_id, channel_id, channel_name, pattern, take_profit_pattern, \
     enabled, broker_connection_ids, created_at, updated_at";

#[async_trait]
impl ChannelRepository for PostgresStore {
    #[instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<Option<ChannelConfig>> {
        let sql = format!("SELECT {} FROM channel_configs WHERE id = $1", CHANNEL_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(channel_from_row))
    }

    async fn get_by_tenant(&self, tenant_id: &str) -> Result<Vec<ChannelConfig>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM channel_configs WHERE tenant_id = $1 ORDER BY created_at",
            CHANNEL_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(channel_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn find(&self, tenant_id: &str, channel_id: &str) -> Result<Option<ChannelConfig>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM channel_configs WHERE tenant_id = $1 AND channel_id = $2",
            CHANNEL_COLUMNS
        ))
        .bind(tenant_id)
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(channel_from_row))
    }

    async fn add(&self, config: &ChannelConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channel_configs
            (id, tenant_id, channel_id, channel_name, pattern, take_profit_pattern,
             enabled, broker_connection_ids, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(config.id)
        .bind(&config.tenant_id)
        .bind(&config.channel_id)
        .bind(&config.channel_name)
        .bind(&config.pattern)
        .bind(&config.take_profit_pattern)
        .bind(config.enabled)
        .bind(&config.broker_connection_ids)
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, config: &ChannelConfig) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE channel_configs
            SET channel_name = $2, pattern = $3, take_profit_pattern = $4, enabled = $5,
                broker_connection_ids = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(config.id)
        .bind(&config.channel_name)
        .bind(&config.pattern)
        .bind(&config.take_profit_pattern)
        .bind(config.enabled)
        .bind(&config.broker_connection_ids)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;
        not_updated("channel config", config.id, result.rows_affected())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM channel_configs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, id: Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM channel_configs WHERE id = $1) AS found")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("found"))
    }
}

// ==================== Trading policies ====================

#[async_trait]
impl PolicyRepository for PostgresStore {
    #[instrument(skip(self))]
    async fn get_by_tenant(&self, tenant_id: &str) -> Result<Option<TradingPolicy>> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, sizing, allowed_symbols, denied_symbols, max_exposure_pct,
                   session, max_slippage_pct, auto_execute, updated_at
            FROM trading_policies WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(policy_from_row).transpose()
    }

    async fn add(&self, policy: &TradingPolicy) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trading_policies
            (tenant_id, sizing, allowed_symbols, denied_symbols, max_exposure_pct,
             session, max_slippage_pct, auto_execute, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&policy.tenant_id)
        .bind(serde_json::to_value(policy.sizing)?)
        .bind(policy.allowed_symbols.iter().cloned().collect::<Vec<_>>())
        .bind(policy.denied_symbols.iter().cloned().collect::<Vec<_>>())
        .bind(policy.max_exposure_pct)
        .bind(policy.session.as_ref().map(serde_json::to_value).transpose()?)
        .bind(policy.max_slippage_pct)
        .bind(policy.auto_execute)
        .bind(policy.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, policy: &TradingPolicy) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE trading_policies
            SET sizing = $2, allowed_symbols = $3, denied_symbols = $4, max_exposure_pct = $5,
                session = $6, max_slippage_pct = $7, auto_execute = $8, updated_at = $9
            WHERE tenant_id = $1
            "#,
        )
        .bind(&policy.tenant_id)
        .bind(serde_json::to_value(policy.sizing)?)
        .bind(policy.allowed_symbols.iter().cloned().collect::<Vec<_>>())
        .bind(policy.denied_symbols.iter().cloned().collect::<Vec<_>>())
        .bind(policy.max_exposure_pct)
        .bind(policy.session.as_ref().map(serde_json::to_value).transpose()?)
        .bind(policy.max_slippage_pct)
        .bind(policy.auto_execute)
        .bind(policy.updated_at)
        .execute(&self.pool)
        .await?;
        not_updated("trading policy", &policy.tenant_id, result.rows_affected())
    }

    async fn delete(&self, tenant_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM trading_policies WHERE tenant_id = $1")
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, tenant_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM trading_policies WHERE tenant_id = $1) AS found",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("found"))
    }
}

// ==================== Broker connections ====================

const BROKER_COLUMNS: &str =
    "id, tenant_id, broker_type, credentials, active, last_used_at, metadata, created_at";

#[async_trait]
impl BrokerConnectionRepository for PostgresStore {
    #[instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<Option<BrokerConnection>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM broker_connections WHERE id = $1",
            BROKER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(broker_from_row).transpose()
    }

    async fn get_by_tenant(&self, tenant_id: &str) -> Result<Vec<BrokerConnection>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM broker_connections WHERE tenant_id = $1 ORDER BY created_at",
            BROKER_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(broker_from_row).collect()
    }

    async fn add(&self, connection: &BrokerConnection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO broker_connections
            (id, tenant_id, broker_type, credentials, active, last_used_at, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(connection.id)
        .bind(&connection.tenant_id)
        .bind(connection.broker_type.as_str())
        .bind(&connection.credentials)
        .bind(connection.active)
        .bind(connection.last_used_at)
        .bind(serde_json::Value::Object(connection.metadata.clone()))
        .bind(connection.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, connection: &BrokerConnection) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE broker_connections
            SET broker_type = $2, credentials = $3, active = $4, last_used_at = $5, metadata = $6
            WHERE id = $1
            "#,
        )
        .bind(connection.id)
        .bind(connection.broker_type.as_str())
        .bind(&connection.credentials)
        .bind(connection.active)
        .bind(connection.last_used_at)
        .bind(serde_json::Value::Object(connection.metadata.clone()))
        .execute(&self.pool)
        .await?;
        not_updated("broker connection", connection.id, result.rows_affected())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM broker_connections WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, id: Uuid) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM broker_connections WHERE id = $1) AS found",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("found"))
    }

    async fn touch_last_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE broker_connections SET last_used_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        not_updated("broker connection", id, result.rows_affected())
    }
}

// ==================== Feed session files ====================

#[async_trait]
impl SessionStore for PostgresStore {
    async fn get(&self, tenant_id: &str, name: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query(
            "SELECT data FROM feed_session_files WHERE tenant_id = $1 AND name = $2",
        )
        .bind(tenant_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("data")))
    }

    async fn put(&self, tenant_id: &str, name: &str, data: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO feed_session_files (tenant_id, name, data, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (tenant_id, name) DO UPDATE SET
                data = EXCLUDED.data,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(name)
        .bind(data)
        .execute(&self.pool)
        .await?;
        debug!(tenant = tenant_id, name, bytes = data.len(), "session file stored");
        Ok(())
    }

    async fn delete(&self, tenant_id: &str, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM feed_session_files WHERE tenant_id = $1 AND name = $2")
            .bind(tenant_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ==================== Manual review ====================

#[async_trait]
impl ReviewSink for PostgresStore {
    #[instrument(
        skip(self, signal),
        fields(tenant = %signal.tenant_id, correlation_id = %signal.hash)
    )]
    async fn record(&self, signal: &NormalizedSignal, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO manual_review_signals (tenant_id, source, symbol, side, signal_hash, payload, reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (signal_hash) DO NOTHING
            "#,
        )
        .bind(&signal.tenant_id)
        .bind(&signal.source)
        .bind(&signal.symbol)
        .bind(signal.side.to_string())
        .bind(&signal.hash)
        .bind(serde_json::to_value(signal)?)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ==================== Idempotency claims ====================

#[async_trait]
impl IdempotencyStore for PostgresStore {
    async fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).map_err(|e| {
                RelayError::Validation(format!("idempotency ttl out of range: {}", e))
            })?;

        // An expired claim is taken over by the next caller.
        let row = sqlx::query(
            r#"
            INSERT INTO message_claims (claim_key, expires_at)
            VALUES ($1, $2)
            ON CONFLICT (claim_key) DO UPDATE SET expires_at = EXCLUDED.expires_at
                WHERE message_claims.expires_at <= NOW()
            RETURNING claim_key
            "#,
        )
        .bind(key)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn is_claimed(&self, key: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM message_claims WHERE claim_key = $1 AND expires_at > NOW()) AS found",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("found"))
    }

    async fn release(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM message_claims WHERE claim_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
