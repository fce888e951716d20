//! PostgreSQL / CockroachDB credential store.
//!
//! Uses sqlx with runtime-checked queries. Binding and code tables share a
//! shape, so their names are picked from the login type or channel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

use super::{CredentialStore, StoreTx, TokenStore};
use crate::config::DatabaseConfig;
use crate::models::{
    ApiKey, Binding, Channel, DeviceBinding, Group, History, HistoryAction, LoginType,
    PersistedToken, UserRecord, UserType, VerificationCode,
};

/// Schema version this build reads and writes.
pub const SCHEMA_VERSION: i64 = 1;
const SCHEMA_VERSION_KEY: &str = "db.version";

fn binding_table(login_type: LoginType) -> &'static str {
    match login_type {
        LoginType::Username => "usernames",
        LoginType::Phone => "phones",
        LoginType::Email => "emails",
        LoginType::Facebook => "facebook_ids",
    }
}

fn code_table(channel: Channel) -> &'static str {
    match channel {
        Channel::Phone => "phone_codes",
        Channel::Email => "email_codes",
    }
}

fn db_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |e| AppError::from(e).context(operation)
}

#[derive(FromRow)]
struct CodeRow {
    id: Uuid,
    user_id: Uuid,
    address: String,
    code_hash: String,
    is_used: bool,
    issued_at: DateTime<Utc>,
    expiry_at: DateTime<Utc>,
}

impl CodeRow {
    fn into_code(self, channel: Channel) -> VerificationCode {
        VerificationCode {
            id: self.id,
            user_id: self.user_id,
            address: self.address,
            channel,
            code_hash: self.code_hash,
            issued_at: self.issued_at,
            expiry_at: self.expiry_at,
            is_used: self.is_used,
        }
    }
}

#[derive(FromRow)]
struct HistoryRow {
    id: Uuid,
    user_id: Option<Uuid>,
    action: String,
    successful: bool,
    ip_address: Option<String>,
    device_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for History {
    type Error = AppError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        Ok(History {
            id: row.id,
            user_id: row.user_id,
            action: row.action.parse().map_err(|e: AppError| e.context("history row"))?,
            successful: row.successful,
            ip_address: row.ip_address,
            device_id: row.device_id,
            created_at: row.created_at,
        })
    }
}

/// Create a PostgreSQL connection pool.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, AppError> {
    tracing::info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.url)
        .await
        .map_err(db_err("connect to database"))?;

    tracing::info!("Successfully connected to PostgreSQL");

    Ok(pool)
}

/// PostgreSQL store. The schema check runs once in [`PgStore::connect`] and
/// its outcome is held by the handle.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    schema_version: i64,
}

impl PgStore {
    /// Verifies the stamped schema version, then applies pending migrations.
    /// A mismatch is fatal and needs an operator; it is reported before any
    /// migration touches the database.
    pub async fn connect(pool: PgPool) -> Result<Self, AppError> {
        if let Some(found) = stamped_version(&pool).await? {
            ensure_compatible(found)?;
        }

        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        tracing::info!("Database migrations completed");

        let schema_version = stamp_schema_version(&pool).await?;
        tracing::info!(schema_version, "Database schema is compatible");

        Ok(Self {
            pool,
            schema_version,
        })
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema_version(&self) -> i64 {
        self.schema_version
    }

    /// Health check - ping the database.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                AppError::DatabaseError(anyhow::anyhow!("Database health check failed: {}", e))
            })?;
        Ok(())
    }
}

/// Version stamped by a previous run, if the database has been set up.
async fn stamped_version(pool: &PgPool) -> Result<Option<i64>, AppError> {
    let exists: bool =
        sqlx::query_scalar("SELECT to_regclass('configurations') IS NOT NULL")
            .fetch_one(pool)
            .await
            .map_err(db_err("look up configurations table"))?;
    if !exists {
        return Ok(None);
    }

    let stamped: Option<String> =
        sqlx::query_scalar("SELECT value FROM configurations WHERE key = $1")
            .bind(SCHEMA_VERSION_KEY)
            .fetch_optional(pool)
            .await
            .map_err(db_err("read schema version"))?;

    stamped.map(|value| parse_version(&value)).transpose()
}

/// Stamps the version on a fresh database, then compares.
async fn stamp_schema_version(pool: &PgPool) -> Result<i64, AppError> {
    sqlx::query("INSERT INTO configurations (key, value) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING")
        .bind(SCHEMA_VERSION_KEY)
        .bind(SCHEMA_VERSION.to_string())
        .execute(pool)
        .await
        .map_err(db_err("stamp schema version"))?;

    let stamped: String = sqlx::query_scalar("SELECT value FROM configurations WHERE key = $1")
        .bind(SCHEMA_VERSION_KEY)
        .fetch_one(pool)
        .await
        .map_err(db_err("read schema version"))?;

    let found = parse_version(&stamped)?;
    ensure_compatible(found)?;
    Ok(found)
}

fn parse_version(stamped: &str) -> Result<i64, AppError> {
    stamped.parse().map_err(|e: std::num::ParseIntError| {
        AppError::ConfigError(anyhow::anyhow!(
            "invalid {} value '{}': {}",
            SCHEMA_VERSION_KEY,
            stamped,
            e
        ))
    })
}

fn ensure_compatible(found: i64) -> Result<(), AppError> {
    if found != SCHEMA_VERSION {
        return Err(AppError::ConfigError(anyhow::anyhow!(
            "db incompatible: need db version '{}', found '{}'",
            SCHEMA_VERSION,
            found
        )));
    }
    Ok(())
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err("begin transaction"))?;
        // Conflicting writers get 40001 and are retried by execute_tx
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(db_err("set isolation level"))?;
        Ok(Box::new(PgTx { tx }))
    }

    // ==================== Group Operations ====================

    async fn group_by_name(&self, name: &str) -> Result<Group, AppError> {
        sqlx::query_as::<_, Group>(
            "SELECT id, name, access_level, created_at FROM groups WHERE name = $1",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("find group by name"))
    }

    async fn group(&self, id: Uuid) -> Result<Group, AppError> {
        sqlx::query_as::<_, Group>(
            "SELECT id, name, access_level, created_at FROM groups WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("find group by id"))
    }

    async fn insert_group(&self, group: &Group) -> Result<(), AppError> {
        sqlx::query("INSERT INTO groups (id, name, access_level, created_at) VALUES ($1, $2, $3, $4)")
            .bind(group.id)
            .bind(&group.name)
            .bind(group.access_level)
            .bind(group.created_at)
            .execute(&self.pool)
            .await
            .map_err(db_err("insert group"))?;
        Ok(())
    }

    // ==================== User Type Operations ====================

    async fn user_type_by_name(&self, name: &str) -> Result<UserType, AppError> {
        sqlx::query_as::<_, UserType>("SELECT id, name, created_at FROM user_types WHERE name = $1")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("find user type by name"))
    }

    async fn user_type(&self, id: Uuid) -> Result<UserType, AppError> {
        sqlx::query_as::<_, UserType>("SELECT id, name, created_at FROM user_types WHERE id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("find user type by id"))
    }

    async fn insert_user_type(&self, user_type: &UserType) -> Result<(), AppError> {
        sqlx::query("INSERT INTO user_types (id, name, created_at) VALUES ($1, $2, $3)")
            .bind(user_type.id)
            .bind(&user_type.name)
            .bind(user_type.created_at)
            .execute(&self.pool)
            .await
            .map_err(db_err("insert user type"))?;
        Ok(())
    }

    // ==================== User Operations ====================

    async fn user_record(&self, id: Uuid) -> Result<UserRecord, AppError> {
        sqlx::query_as::<_, UserRecord>(
            "SELECT id, type_id, password_hash, created_at, updated_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("find user by id"))
    }

    async fn user_id_by_identifier(
        &self,
        login_type: LoginType,
        value: &str,
    ) -> Result<Uuid, AppError> {
        let sql = format!("SELECT user_id FROM {} WHERE value = $1", binding_table(login_type));
        sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(value)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("find user by identifier"))
    }

    async fn user_id_by_device(&self, device_id: &str) -> Result<Uuid, AppError> {
        sqlx::query_scalar::<_, Uuid>("SELECT user_id FROM device_ids WHERE device_id = $1")
            .bind(device_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("find user by device"))
    }

    async fn binding(
        &self,
        login_type: LoginType,
        user_id: Uuid,
    ) -> Result<Option<Binding>, AppError> {
        let sql = format!(
            "SELECT id, user_id, value, verified, created_at, updated_at FROM {} WHERE user_id = $1",
            binding_table(login_type)
        );
        sqlx::query_as::<_, Binding>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("find binding"))
    }

    async fn user_groups(&self, user_id: Uuid) -> Result<Vec<Group>, AppError> {
        sqlx::query_as::<_, Group>(
            r#"
            SELECT g.id, g.name, g.access_level, g.created_at
            FROM groups g
            JOIN user_groups ug ON ug.group_id = g.id
            WHERE ug.user_id = $1
            ORDER BY g.access_level
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list user groups"))
    }

    // ==================== Verification Code Operations ====================

    async fn latest_unused_code(
        &self,
        user_id: Uuid,
        channel: Channel,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<VerificationCode>, AppError> {
        let sql = format!(
            r#"
            SELECT id, user_id, address, code_hash, is_used, issued_at, expiry_at
            FROM {}
            WHERE user_id = $1 AND address = $2 AND is_used = FALSE AND expiry_at > $3
            ORDER BY issued_at DESC
            LIMIT 1
            "#,
            code_table(channel)
        );
        let row = sqlx::query_as::<_, CodeRow>(&sql)
            .bind(user_id)
            .bind(address)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("find verification code"))?;
        Ok(row.map(|r| r.into_code(channel)))
    }

    // ==================== API Key Operations ====================

    async fn insert_api_key(&self, key: &ApiKey) -> Result<(), AppError> {
        sqlx::query("INSERT INTO api_keys (id, user_id, key_hash, created_at) VALUES ($1, $2, $3, $4)")
            .bind(key.id)
            .bind(&key.user_id)
            .bind(&key.key_hash)
            .bind(key.created_at)
            .execute(&self.pool)
            .await
            .map_err(db_err("insert api key"))?;
        Ok(())
    }

    async fn api_keys_for(&self, user_id: &str) -> Result<Vec<ApiKey>, AppError> {
        sqlx::query_as::<_, ApiKey>(
            "SELECT id, user_id, key_hash, created_at FROM api_keys WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list api keys"))
    }

    // ==================== History Operations ====================

    async fn insert_history(&self, entry: &History) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO history (id, user_id, action, successful, ip_address, device_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(entry.action.as_str())
        .bind(entry.successful)
        .bind(&entry.ip_address)
        .bind(&entry.device_id)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("insert history"))?;
        Ok(())
    }

    async fn history_for(
        &self,
        user_id: Uuid,
        offset: usize,
        count: usize,
        actions: &[HistoryAction],
    ) -> Result<Vec<History>, AppError> {
        let actions: Vec<&str> = actions.iter().map(HistoryAction::as_str).collect();
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT id, user_id, action, successful, ip_address, device_id, created_at
            FROM history
            WHERE user_id = $1 AND (cardinality($2::text[]) = 0 OR action = ANY($2))
            ORDER BY created_at DESC
            OFFSET $3 LIMIT $4
            "#,
        )
        .bind(user_id)
        .bind(&actions)
        .bind(offset as i64)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list history"))?;

        rows.into_iter().map(History::try_from).collect()
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn insert_token(&self, token: &PersistedToken) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO tokens (id, user_id, device_id, token_hash, issued_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(token.id)
        .bind(token.user_id)
        .bind(&token.device_id)
        .bind(&token.token_hash)
        .bind(token.issued_at)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("insert token"))?;
        Ok(())
    }

    async fn token_by_hash(&self, token_hash: &str) -> Result<PersistedToken, AppError> {
        sqlx::query_as::<_, PersistedToken>(
            r#"
            SELECT id, user_id, device_id, token_hash, issued_at, expires_at
            FROM tokens WHERE token_hash = $1
            "#,
        )
        .bind(token_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("find token"))
    }

    async fn delete_token(&self, token_hash: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM tokens WHERE token_hash = $1")
            .bind(token_hash)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete token"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn min_expiry_token(&self) -> Result<Option<PersistedToken>, AppError> {
        sqlx::query_as::<_, PersistedToken>(
            r#"
            SELECT id, user_id, device_id, token_hash, issued_at, expires_at
            FROM tokens ORDER BY expires_at ASC LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("find nearest token expiry"))
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn insert_user(&mut self, user: &UserRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, type_id, password_hash, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(user.id)
        .bind(user.type_id)
        .bind(&user.password_hash)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("insert user"))?;
        Ok(())
    }

    async fn add_user_to_group(&mut self, user_id: Uuid, group_id: Uuid) -> Result<(), AppError> {
        sqlx::query("INSERT INTO user_groups (user_id, group_id) VALUES ($1, $2)")
            .bind(user_id)
            .bind(group_id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err("add user to group"))?;
        Ok(())
    }

    async fn insert_binding(
        &mut self,
        login_type: LoginType,
        binding: &Binding,
    ) -> Result<(), AppError> {
        let sql = format!(
            r#"
            INSERT INTO {} (id, user_id, value, verified, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            binding_table(login_type)
        );
        sqlx::query(&sql)
            .bind(binding.id)
            .bind(binding.user_id)
            .bind(&binding.value)
            .bind(binding.verified)
            .bind(binding.created_at)
            .bind(binding.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err("insert binding"))?;
        Ok(())
    }

    async fn upsert_binding(
        &mut self,
        login_type: LoginType,
        binding: &Binding,
    ) -> Result<(), AppError> {
        let sql = format!(
            r#"
            INSERT INTO {} (id, user_id, value, verified, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO UPDATE
            SET value = EXCLUDED.value, verified = EXCLUDED.verified, updated_at = EXCLUDED.updated_at
            "#,
            binding_table(login_type)
        );
        sqlx::query(&sql)
            .bind(binding.id)
            .bind(binding.user_id)
            .bind(&binding.value)
            .bind(binding.verified)
            .bind(binding.created_at)
            .bind(binding.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err("upsert binding"))?;
        Ok(())
    }

    async fn insert_device(&mut self, device: &DeviceBinding) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO device_ids (id, user_id, device_id, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(device.id)
        .bind(device.user_id)
        .bind(&device.device_id)
        .bind(device.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("insert device"))?;
        Ok(())
    }

    async fn insert_code(&mut self, code: &VerificationCode) -> Result<(), AppError> {
        let sql = format!(
            r#"
            INSERT INTO {} (id, user_id, address, code_hash, is_used, issued_at, expiry_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
            code_table(code.channel)
        );
        sqlx::query(&sql)
            .bind(code.id)
            .bind(code.user_id)
            .bind(&code.address)
            .bind(&code.code_hash)
            .bind(code.is_used)
            .bind(code.issued_at)
            .bind(code.expiry_at)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err("insert verification code"))?;
        Ok(())
    }

    async fn mark_code_used(&mut self, channel: Channel, code_id: Uuid) -> Result<(), AppError> {
        let sql = format!(
            "UPDATE {} SET is_used = TRUE WHERE id = $1 AND is_used = FALSE",
            code_table(channel)
        );
        let result = sqlx::query(&sql)
            .bind(code_id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err("mark verification code used"))?;

        if result.rows_affected() == 0 {
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "verification code already used"
            )));
        }
        Ok(())
    }

    async fn set_binding_verified(
        &mut self,
        login_type: LoginType,
        user_id: Uuid,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let sql = format!(
            "UPDATE {} SET verified = TRUE, updated_at = $3 WHERE user_id = $1 AND value = $2",
            binding_table(login_type)
        );
        let result = sqlx::query(&sql)
            .bind(user_id)
            .bind(value)
            .bind(now)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err("verify binding"))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "{} binding not found",
                login_type
            )));
        }
        Ok(())
    }

    async fn update_password(
        &mut self,
        user_id: Uuid,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let result =
            sqlx::query("UPDATE users SET password_hash = $2, updated_at = $3 WHERE id = $1")
                .bind(user_id)
                .bind(password_hash)
                .bind(now)
                .execute(&mut *self.tx)
                .await
                .map_err(db_err("update password"))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!("user not found")));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        self.tx.commit().await.map_err(db_err("commit transaction"))
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppError> {
        self.tx
            .rollback()
            .await
            .map_err(db_err("rollback transaction"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{execute_tx, TxBody};
    use service_core::retry::RetryConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn store() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = create_pool(&DatabaseConfig {
            url,
            max_connections: 5,
            min_connections: 1,
        })
        .await
        .expect("connect");
        PgStore::connect(pool).await.expect("schema check")
    }

    async fn seed_user(store: &PgStore) -> Uuid {
        let now = Utc::now();
        let user_type = match store.user_type_by_name("individual").await {
            Ok(user_type) => user_type,
            Err(_) => {
                let user_type = UserType {
                    id: Uuid::new_v4(),
                    name: "individual".into(),
                    created_at: now,
                };
                store.insert_user_type(&user_type).await.expect("insert user type");
                user_type
            }
        };
        let user = UserRecord::new(user_type.id, None, now);
        let mut tx = store.begin().await.unwrap();
        tx.insert_user(&user).await.unwrap();
        tx.commit().await.unwrap();
        user.id
    }

    /// Loses its first attempt to a rival writer that commits mid-transaction.
    struct ContendedPasswordUpdate {
        store: PgStore,
        user_id: Uuid,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl TxBody for ContendedPasswordUpdate {
        type Output = ();

        async fn run(&self, tx: &mut dyn StoreTx) -> Result<(), AppError> {
            let now = Utc::now();
            // Any statement pins the snapshot
            let _ = tx.mark_code_used(Channel::Phone, Uuid::new_v4()).await;

            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                let mut rival = self.store.begin().await?;
                rival.update_password(self.user_id, "rival", now).await?;
                rival.commit().await?;
            }
            tx.update_password(self.user_id, "winner", now).await
        }
    }

    #[test]
    fn test_schema_version_mismatch_is_config_error() {
        assert!(ensure_compatible(SCHEMA_VERSION).is_ok());
        let err = ensure_compatible(SCHEMA_VERSION + 1).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
        assert!(err.to_string().contains("db incompatible"));
        assert!(matches!(parse_version("one"), Err(AppError::ConfigError(_))));
        assert_eq!(parse_version("1").unwrap(), 1);
    }

    #[test]
    fn test_table_names() {
        assert_eq!(binding_table(LoginType::Facebook), "facebook_ids");
        assert_eq!(code_table(Channel::Email), "email_codes");
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_schema_version_is_stamped() {
        let store = store().await;
        assert_eq!(store.schema_version(), SCHEMA_VERSION);
        store.health_check().await.expect("health check");
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_duplicate_group_name_is_conflict() {
        let store = store().await;
        let name = format!("group-{}", Uuid::new_v4());
        let now = Utc::now();
        store
            .insert_group(&Group::new(&name, 5, now).unwrap())
            .await
            .expect("first insert");
        let err = store
            .insert_group(&Group::new(&name, 5, now).unwrap())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_token_round_trip_and_min_expiry() {
        let store = store().await;
        let now = Utc::now();
        let token = PersistedToken::new(
            Uuid::new_v4(),
            "device".into(),
            &Uuid::new_v4().to_string(),
            now,
            chrono::Duration::seconds(-3600),
        );
        store.insert_token(&token).await.unwrap();

        let nearest = store.min_expiry_token().await.unwrap().expect("a token");
        assert!(nearest.expires_at <= token.expires_at);
        assert!(store.delete_token(&token.token_hash).await.unwrap());
        assert!(store.token_by_hash(&token.token_hash).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_concurrent_writers_conflict() {
        // 1. Setup
        let store = store().await;
        let user_id = seed_user(&store).await;
        let now = Utc::now();

        // 2. Both transactions hold a snapshot before either writes
        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        let _ = second.mark_code_used(Channel::Phone, Uuid::new_v4()).await;

        first.update_password(user_id, "first", now).await.unwrap();
        first.commit().await.unwrap();

        // 3. The late writer is told to retry
        let err = second.update_password(user_id, "second", now).await.unwrap_err();
        assert!(err.is_tx_conflict());
        second.rollback().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_execute_tx_retries_serialization_conflict() {
        let store = store().await;
        let user_id = seed_user(&store).await;
        let body = ContendedPasswordUpdate {
            store: store.clone(),
            user_id,
            attempts: AtomicU32::new(0),
        };

        execute_tx(&store, &RetryConfig::quick(), &body).await.unwrap();

        assert_eq!(body.attempts.load(Ordering::SeqCst), 2);
        let record = store.user_record(user_id).await.unwrap();
        assert_eq!(record.password_hash.as_deref(), Some("winner"));
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_mismatched_version_fails_before_migrating() {
        let store = store().await;
        let pool = store.pool().clone();
        sqlx::query("UPDATE configurations SET value = '999' WHERE key = $1")
            .bind(SCHEMA_VERSION_KEY)
            .execute(&pool)
            .await
            .unwrap();

        let err = PgStore::connect(pool.clone()).await.err().unwrap();
        assert!(matches!(err, AppError::ConfigError(_)));

        sqlx::query("UPDATE configurations SET value = $2 WHERE key = $1")
            .bind(SCHEMA_VERSION_KEY)
            .bind(SCHEMA_VERSION.to_string())
            .execute(&pool)
            .await
            .unwrap();
        PgStore::connect(pool).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_history_page_newest_first() {
        let store = store().await;
        let user_id = Uuid::new_v4();
        let start = Utc::now();
        for (i, action) in [HistoryAction::Registration, HistoryAction::Login, HistoryAction::Login]
            .into_iter()
            .enumerate()
        {
            let at = start + chrono::Duration::seconds(i as i64);
            store
                .insert_history(&History::new(Some(user_id), action, true, at))
                .await
                .unwrap();
        }

        let logins = store
            .history_for(user_id, 0, 10, &[HistoryAction::Login])
            .await
            .unwrap();
        assert_eq!(logins.len(), 2);
        assert!(logins[0].created_at > logins[1].created_at);

        let oldest = store.history_for(user_id, 2, 10, &[]).await.unwrap();
        assert_eq!(oldest.len(), 1);
        assert_eq!(oldest[0].action, HistoryAction::Registration);
    }
}
