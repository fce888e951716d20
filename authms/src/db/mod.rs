//! Credential store abstraction and the transaction runner.
//!
//! Engines talk to storage only through [`CredentialStore`], [`StoreTx`] and
//! [`TokenStore`]. Implementations translate driver errors into [`AppError`]
//! at this boundary; nothing above it inspects driver error types.

#[cfg(any(test, feature = "testing"))]
mod memory;
mod postgres;

#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryStore;
pub use postgres::{create_pool, PgStore, SCHEMA_VERSION};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use service_core::retry::{retry_async, RetryConfig};
use uuid::Uuid;

use crate::models::{
    ApiKey, Binding, Channel, DeviceBinding, Group, History, HistoryAction, LoginType,
    PersistedToken, User, UserRecord, UserType, VerificationCode,
};

/// Reads and single-statement writes outside a transaction.
///
/// Lookups of a single entity fail with `AppError::NotFound` on a miss;
/// inserts fail with `AppError::Conflict` when a unique value is taken.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, AppError>;

    async fn group_by_name(&self, name: &str) -> Result<Group, AppError>;
    async fn group(&self, id: Uuid) -> Result<Group, AppError>;
    async fn insert_group(&self, group: &Group) -> Result<(), AppError>;

    async fn user_type_by_name(&self, name: &str) -> Result<UserType, AppError>;
    async fn user_type(&self, id: Uuid) -> Result<UserType, AppError>;
    async fn insert_user_type(&self, user_type: &UserType) -> Result<(), AppError>;

    async fn user_record(&self, id: Uuid) -> Result<UserRecord, AppError>;
    async fn user_id_by_identifier(
        &self,
        login_type: LoginType,
        value: &str,
    ) -> Result<Uuid, AppError>;
    async fn user_id_by_device(&self, device_id: &str) -> Result<Uuid, AppError>;
    async fn binding(
        &self,
        login_type: LoginType,
        user_id: Uuid,
    ) -> Result<Option<Binding>, AppError>;
    async fn user_groups(&self, user_id: Uuid) -> Result<Vec<Group>, AppError>;

    /// Most recently issued code for (user, channel, address) that is unused
    /// and unexpired at `now`.
    async fn latest_unused_code(
        &self,
        user_id: Uuid,
        channel: Channel,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<VerificationCode>, AppError>;

    async fn insert_api_key(&self, key: &ApiKey) -> Result<(), AppError>;
    async fn api_keys_for(&self, user_id: &str) -> Result<Vec<ApiKey>, AppError>;

    async fn insert_history(&self, entry: &History) -> Result<(), AppError>;
    /// A page of the user's history, newest first. An empty `actions` slice
    /// matches every action.
    async fn history_for(
        &self,
        user_id: Uuid,
        offset: usize,
        count: usize,
        actions: &[HistoryAction],
    ) -> Result<Vec<History>, AppError>;
}

/// An open unit of work. Dropping it without `commit` discards every write.
#[async_trait]
pub trait StoreTx: Send {
    async fn insert_user(&mut self, user: &UserRecord) -> Result<(), AppError>;
    async fn add_user_to_group(&mut self, user_id: Uuid, group_id: Uuid) -> Result<(), AppError>;
    async fn insert_binding(
        &mut self,
        login_type: LoginType,
        binding: &Binding,
    ) -> Result<(), AppError>;
    /// Replaces the user's binding of this type, or inserts one if absent.
    async fn upsert_binding(
        &mut self,
        login_type: LoginType,
        binding: &Binding,
    ) -> Result<(), AppError>;
    async fn insert_device(&mut self, device: &DeviceBinding) -> Result<(), AppError>;
    async fn insert_code(&mut self, code: &VerificationCode) -> Result<(), AppError>;
    /// Flips `is_used` false -> true. Fails `Unauthorized` if the code is gone
    /// or was consumed concurrently.
    async fn mark_code_used(&mut self, channel: Channel, code_id: Uuid) -> Result<(), AppError>;
    async fn set_binding_verified(
        &mut self,
        login_type: LoginType,
        user_id: Uuid,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError>;
    async fn update_password(
        &mut self,
        user_id: Uuid,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError>;

    async fn commit(self: Box<Self>) -> Result<(), AppError>;
    async fn rollback(self: Box<Self>) -> Result<(), AppError>;
}

/// The persisted-session token table.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert_token(&self, token: &PersistedToken) -> Result<(), AppError>;
    async fn token_by_hash(&self, token_hash: &str) -> Result<PersistedToken, AppError>;
    /// Returns whether a row was removed.
    async fn delete_token(&self, token_hash: &str) -> Result<bool, AppError>;
    /// Token with the smallest expiry, if any rows exist.
    async fn min_expiry_token(&self) -> Result<Option<PersistedToken>, AppError>;
}

/// Body of a transaction. Runs once per attempt; anything it does outside
/// `tx` is repeated when a conflict forces a retry.
#[async_trait]
pub trait TxBody: Send + Sync {
    type Output: Send;

    async fn run(&self, tx: &mut dyn StoreTx) -> Result<Self::Output, AppError>;
}

/// Runs `body` in a transaction: commit on success, rollback on error.
/// Serialization conflicts re-run the whole body per `retry`.
pub async fn execute_tx<B: TxBody>(
    store: &dyn CredentialStore,
    retry: &RetryConfig,
    body: &B,
) -> Result<B::Output, AppError> {
    retry_async(retry, "execute_tx", AppError::is_tx_conflict, move || async move {
        run_once(store, body).await
    })
    .await
}

async fn run_once<B: TxBody>(
    store: &dyn CredentialStore,
    body: &B,
) -> Result<B::Output, AppError> {
    let mut tx = store.begin().await?;

    match body.run(tx.as_mut()).await {
        Ok(output) => {
            tx.commit().await?;
            Ok(output)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "Transaction rollback failed");
            }
            Err(err)
        }
    }
}

/// Hydrates a user with its type, bindings and groups.
pub async fn load_user(store: &dyn CredentialStore, user_id: Uuid) -> Result<User, AppError> {
    let record = store.user_record(user_id).await?;
    let user_type = store.user_type(record.type_id).await?;

    Ok(User {
        id: record.id,
        user_type,
        username: store.binding(LoginType::Username, user_id).await?,
        phone: store.binding(LoginType::Phone, user_id).await?,
        email: store.binding(LoginType::Email, user_id).await?,
        facebook: store.binding(LoginType::Facebook, user_id).await?,
        groups: store.user_groups(user_id).await?,
        created_at: record.created_at,
        updated_at: record.updated_at,
    })
}
