//! In-process credential store.
//!
//! Holds every table behind one async mutex. A transaction takes the lock for
//! its whole lifetime and writes to a staged copy, so concurrent units of work
//! serialize and a rollback is just dropping the copy. Unique constraints are
//! enforced the way the relational schema does, so duplicate inserts surface
//! as `AppError::Conflict`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::{AppError, TxConflict};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{CredentialStore, StoreTx, TokenStore};
use crate::models::{
    ApiKey, Binding, Channel, DeviceBinding, Group, History, HistoryAction, LoginType,
    PersistedToken, UserRecord, UserType, VerificationCode,
};
use crate::utils::clock::{Clock, SystemClock};

fn not_found(what: &str) -> AppError {
    AppError::NotFound(anyhow::anyhow!("{} not found", what))
}

fn duplicate(what: &str) -> AppError {
    AppError::Conflict(anyhow::anyhow!("{} already exists", what))
}

#[derive(Debug, Default, Clone)]
struct Tables {
    users: HashMap<Uuid, UserRecord>,
    user_types: HashMap<Uuid, UserType>,
    groups: HashMap<Uuid, Group>,
    memberships: HashSet<(Uuid, Uuid)>,
    /// login type -> user id -> binding
    bindings: HashMap<LoginType, HashMap<Uuid, Binding>>,
    devices: HashMap<String, DeviceBinding>,
    codes: HashMap<Channel, Vec<VerificationCode>>,
    api_keys: Vec<ApiKey>,
    history: Vec<History>,
}

impl Tables {
    fn bindings_of(&self, login_type: LoginType) -> impl Iterator<Item = &Binding> {
        self.bindings
            .get(&login_type)
            .into_iter()
            .flat_map(|by_user| by_user.values())
    }

    fn value_taken_by_other(&self, login_type: LoginType, value: &str, user_id: Uuid) -> bool {
        self.bindings_of(login_type)
            .any(|b| b.value == value && b.user_id != user_id)
    }
}

#[derive(Debug, Default)]
struct TokenTable {
    rows: HashMap<String, PersistedToken>,
    deleted: Vec<(String, DateTime<Utc>)>,
    delete_attempts: Vec<String>,
}

/// Credential and token store kept entirely in memory.
#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<AsyncMutex<Tables>>,
    tokens: Arc<Mutex<TokenTable>>,
    clock: Arc<dyn Clock>,
    pending_conflicts: Arc<AtomicU32>,
    fail_token_deletes: Arc<AtomicBool>,
    fail_expiry_queries: Arc<AtomicBool>,
    transactions_started: Arc<AtomicU32>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// The clock stamps token deletions, letting tests check when the
    /// garbage collector removed each row.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Arc::new(AsyncMutex::new(Tables::default())),
            tokens: Arc::new(Mutex::new(TokenTable::default())),
            clock,
            pending_conflicts: Arc::new(AtomicU32::new(0)),
            fail_token_deletes: Arc::new(AtomicBool::new(false)),
            fail_expiry_queries: Arc::new(AtomicBool::new(false)),
            transactions_started: Arc::new(AtomicU32::new(0)),
        }
    }

    /// The next `n` commits fail with a serialization conflict.
    pub fn inject_commit_conflicts(&self, n: u32) {
        self.pending_conflicts.store(n, Ordering::SeqCst);
    }

    /// Makes every token delete fail until switched off.
    pub fn fail_token_deletes(&self, fail: bool) {
        self.fail_token_deletes.store(fail, Ordering::SeqCst);
    }

    /// Makes `min_expiry_token` fail until switched off.
    pub fn fail_expiry_queries(&self, fail: bool) {
        self.fail_expiry_queries.store(fail, Ordering::SeqCst);
    }

    pub fn transactions_started(&self) -> u32 {
        self.transactions_started.load(Ordering::SeqCst)
    }

    pub async fn user_count(&self) -> usize {
        self.tables.lock().await.users.len()
    }

    pub async fn binding_count(&self, login_type: LoginType) -> usize {
        self.tables.lock().await.bindings_of(login_type).count()
    }

    pub async fn group_count(&self) -> usize {
        self.tables.lock().await.groups.len()
    }

    pub async fn user_type_count(&self) -> usize {
        self.tables.lock().await.user_types.len()
    }

    pub async fn membership_count(&self) -> usize {
        self.tables.lock().await.memberships.len()
    }

    pub async fn codes(&self, channel: Channel) -> Vec<VerificationCode> {
        self.tables
            .lock()
            .await
            .codes
            .get(&channel)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn history(&self) -> Vec<History> {
        self.tables.lock().await.history.clone()
    }

    pub fn token_count(&self) -> Result<usize, AppError> {
        Ok(self.lock_tokens()?.rows.len())
    }

    /// Removed token hashes with the clock reading at removal, in order.
    pub fn deleted_tokens(&self) -> Result<Vec<(String, DateTime<Utc>)>, AppError> {
        Ok(self.lock_tokens()?.deleted.clone())
    }

    /// Every hash a delete was requested for, including misses.
    pub fn delete_attempts(&self) -> Result<Vec<String>, AppError> {
        Ok(self.lock_tokens()?.delete_attempts.clone())
    }

    fn lock_tokens(&self) -> Result<std::sync::MutexGuard<'_, TokenTable>, AppError> {
        self.tokens
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("token table mutex poisoned: {}", e)))
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, AppError> {
        let guard = self.tables.clone().lock_owned().await;
        let staged = guard.clone();
        self.transactions_started.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTx {
            guard,
            staged,
            pending_conflicts: self.pending_conflicts.clone(),
        }))
    }

    async fn group_by_name(&self, name: &str) -> Result<Group, AppError> {
        let tables = self.tables.lock().await;
        tables
            .groups
            .values()
            .find(|g| g.name == name)
            .cloned()
            .ok_or_else(|| not_found("group"))
    }

    async fn group(&self, id: Uuid) -> Result<Group, AppError> {
        let tables = self.tables.lock().await;
        tables.groups.get(&id).cloned().ok_or_else(|| not_found("group"))
    }

    async fn insert_group(&self, group: &Group) -> Result<(), AppError> {
        let mut tables = self.tables.lock().await;
        if tables
            .groups
            .values()
            .any(|g| g.name == group.name || g.id == group.id)
        {
            return Err(duplicate("group"));
        }
        tables.groups.insert(group.id, group.clone());
        Ok(())
    }

    async fn user_type_by_name(&self, name: &str) -> Result<UserType, AppError> {
        let tables = self.tables.lock().await;
        tables
            .user_types
            .values()
            .find(|t| t.name == name)
            .cloned()
            .ok_or_else(|| not_found("user type"))
    }

    async fn user_type(&self, id: Uuid) -> Result<UserType, AppError> {
        let tables = self.tables.lock().await;
        tables
            .user_types
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("user type"))
    }

    async fn insert_user_type(&self, user_type: &UserType) -> Result<(), AppError> {
        let mut tables = self.tables.lock().await;
        if tables
            .user_types
            .values()
            .any(|t| t.name == user_type.name || t.id == user_type.id)
        {
            return Err(duplicate("user type"));
        }
        tables.user_types.insert(user_type.id, user_type.clone());
        Ok(())
    }

    async fn user_record(&self, id: Uuid) -> Result<UserRecord, AppError> {
        let tables = self.tables.lock().await;
        tables.users.get(&id).cloned().ok_or_else(|| not_found("user"))
    }

    async fn user_id_by_identifier(
        &self,
        login_type: LoginType,
        value: &str,
    ) -> Result<Uuid, AppError> {
        let tables = self.tables.lock().await;
        let user_id = tables
            .bindings_of(login_type)
            .find(|b| b.value == value)
            .map(|b| b.user_id)
            .ok_or_else(|| not_found(login_type.as_str()));
        user_id
    }

    async fn user_id_by_device(&self, device_id: &str) -> Result<Uuid, AppError> {
        let tables = self.tables.lock().await;
        tables
            .devices
            .get(device_id)
            .map(|d| d.user_id)
            .ok_or_else(|| not_found("device"))
    }

    async fn binding(
        &self,
        login_type: LoginType,
        user_id: Uuid,
    ) -> Result<Option<Binding>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .bindings
            .get(&login_type)
            .and_then(|by_user| by_user.get(&user_id))
            .cloned())
    }

    async fn user_groups(&self, user_id: Uuid) -> Result<Vec<Group>, AppError> {
        let tables = self.tables.lock().await;
        let mut groups: Vec<Group> = tables
            .memberships
            .iter()
            .filter(|(u, _)| *u == user_id)
            .filter_map(|(_, g)| tables.groups.get(g).cloned())
            .collect();
        groups.sort_by_key(|g| g.access_level);
        Ok(groups)
    }

    async fn latest_unused_code(
        &self,
        user_id: Uuid,
        channel: Channel,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<VerificationCode>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .codes
            .get(&channel)
            .into_iter()
            .flatten()
            .filter(|c| c.user_id == user_id && c.address == address && c.is_valid_at(now))
            .max_by_key(|c| c.issued_at)
            .cloned())
    }

    async fn insert_api_key(&self, key: &ApiKey) -> Result<(), AppError> {
        let mut tables = self.tables.lock().await;
        if tables.api_keys.iter().any(|k| k.id == key.id) {
            return Err(duplicate("api key"));
        }
        tables.api_keys.push(key.clone());
        Ok(())
    }

    async fn api_keys_for(&self, user_id: &str) -> Result<Vec<ApiKey>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .api_keys
            .iter()
            .filter(|k| k.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_history(&self, entry: &History) -> Result<(), AppError> {
        self.tables.lock().await.history.push(entry.clone());
        Ok(())
    }

    async fn history_for(
        &self,
        user_id: Uuid,
        offset: usize,
        count: usize,
        actions: &[HistoryAction],
    ) -> Result<Vec<History>, AppError> {
        let tables = self.tables.lock().await;
        let mut entries: Vec<History> = tables
            .history
            .iter()
            .filter(|h| h.user_id == Some(user_id))
            .filter(|h| actions.is_empty() || actions.contains(&h.action))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries.into_iter().skip(offset).take(count).collect())
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_token(&self, token: &PersistedToken) -> Result<(), AppError> {
        let mut table = self.lock_tokens()?;
        if table.rows.contains_key(&token.token_hash) {
            return Err(duplicate("token"));
        }
        table.rows.insert(token.token_hash.clone(), token.clone());
        Ok(())
    }

    async fn token_by_hash(&self, token_hash: &str) -> Result<PersistedToken, AppError> {
        self.lock_tokens()?
            .rows
            .get(token_hash)
            .cloned()
            .ok_or_else(|| not_found("token"))
    }

    async fn delete_token(&self, token_hash: &str) -> Result<bool, AppError> {
        let mut table = self.lock_tokens()?;
        table.delete_attempts.push(token_hash.to_string());

        if self.fail_token_deletes.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "token delete failed: store unavailable"
            )));
        }

        let removed = table.rows.remove(token_hash).is_some();
        if removed {
            let at = self.clock.now();
            table.deleted.push((token_hash.to_string(), at));
        }
        Ok(removed)
    }

    async fn min_expiry_token(&self) -> Result<Option<PersistedToken>, AppError> {
        if self.fail_expiry_queries.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "token query failed: store unavailable"
            )));
        }
        Ok(self
            .lock_tokens()?
            .rows
            .values()
            .min_by_key(|t| t.expires_at)
            .cloned())
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
    pending_conflicts: Arc<AtomicU32>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert_user(&mut self, user: &UserRecord) -> Result<(), AppError> {
        if self.staged.users.contains_key(&user.id) {
            return Err(duplicate("user"));
        }
        if !self.staged.user_types.contains_key(&user.type_id) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "users.type_id references a missing user type"
            )));
        }
        self.staged.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn add_user_to_group(&mut self, user_id: Uuid, group_id: Uuid) -> Result<(), AppError> {
        if !self.staged.users.contains_key(&user_id) || !self.staged.groups.contains_key(&group_id)
        {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "group membership references a missing user or group"
            )));
        }
        if !self.staged.memberships.insert((user_id, group_id)) {
            return Err(duplicate("group membership"));
        }
        Ok(())
    }

    async fn insert_binding(
        &mut self,
        login_type: LoginType,
        binding: &Binding,
    ) -> Result<(), AppError> {
        if !self.staged.users.contains_key(&binding.user_id) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "{} binding references a missing user",
                login_type
            )));
        }
        let taken = self.staged.bindings_of(login_type).any(|b| b.value == binding.value);
        let by_user = self.staged.bindings.entry(login_type).or_default();
        if taken || by_user.contains_key(&binding.user_id) {
            return Err(duplicate(login_type.as_str()));
        }
        by_user.insert(binding.user_id, binding.clone());
        Ok(())
    }

    async fn upsert_binding(
        &mut self,
        login_type: LoginType,
        binding: &Binding,
    ) -> Result<(), AppError> {
        if self
            .staged
            .value_taken_by_other(login_type, &binding.value, binding.user_id)
        {
            return Err(duplicate(login_type.as_str()));
        }
        let by_user = self.staged.bindings.entry(login_type).or_default();
        match by_user.get_mut(&binding.user_id) {
            Some(existing) => {
                existing.value = binding.value.clone();
                existing.verified = binding.verified;
                existing.updated_at = binding.updated_at;
            }
            None => {
                by_user.insert(binding.user_id, binding.clone());
            }
        }
        Ok(())
    }

    async fn insert_device(&mut self, device: &DeviceBinding) -> Result<(), AppError> {
        if self.staged.devices.contains_key(&device.device_id) {
            return Err(duplicate("device"));
        }
        self.staged
            .devices
            .insert(device.device_id.clone(), device.clone());
        Ok(())
    }

    async fn insert_code(&mut self, code: &VerificationCode) -> Result<(), AppError> {
        self.staged
            .codes
            .entry(code.channel)
            .or_default()
            .push(code.clone());
        Ok(())
    }

    async fn mark_code_used(&mut self, channel: Channel, code_id: Uuid) -> Result<(), AppError> {
        let code = self
            .staged
            .codes
            .get_mut(&channel)
            .and_then(|codes| codes.iter_mut().find(|c| c.id == code_id && !c.is_used))
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!("verification code already used"))
            })?;
        code.is_used = true;
        Ok(())
    }

    async fn set_binding_verified(
        &mut self,
        login_type: LoginType,
        user_id: Uuid,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let binding = self
            .staged
            .bindings
            .get_mut(&login_type)
            .and_then(|by_user| by_user.get_mut(&user_id))
            .filter(|b| b.value == value)
            .ok_or_else(|| not_found(login_type.as_str()))?;
        binding.verified = true;
        binding.updated_at = now;
        Ok(())
    }

    async fn update_password(
        &mut self,
        user_id: Uuid,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let user = self
            .staged
            .users
            .get_mut(&user_id)
            .ok_or_else(|| not_found("user"))?;
        user.password_hash = Some(password_hash.to_string());
        user.updated_at = now;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        let MemoryTx {
            mut guard,
            staged,
            pending_conflicts,
        } = *self;

        let conflicted = pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflicted {
            return Err(AppError::DatabaseError(anyhow::Error::new(TxConflict(
                "restart transaction: injected serialization failure".to_string(),
            ))));
        }

        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserTypeName;
    use chrono::Duration;

    async fn seeded() -> (MemoryStore, UserType) {
        let store = MemoryStore::new();
        let user_type = UserType {
            id: Uuid::new_v4(),
            name: UserTypeName::Individual.as_str().to_string(),
            created_at: Utc::now(),
        };
        store.insert_user_type(&user_type).await.unwrap();
        (store, user_type)
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_writes() {
        let (store, user_type) = seeded().await;
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_user(&UserRecord::new(user_type.id, None, Utc::now()))
                .await
                .unwrap();
        }
        assert_eq!(store.user_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_binding_value_is_conflict() {
        let (store, user_type) = seeded().await;
        let now = Utc::now();
        let a = UserRecord::new(user_type.id, None, now);
        let b = UserRecord::new(user_type.id, None, now);

        let mut tx = store.begin().await.unwrap();
        tx.insert_user(&a).await.unwrap();
        tx.insert_user(&b).await.unwrap();
        tx.insert_binding(LoginType::Username, &Binding::new(a.id, LoginType::Username, "alice".into(), now))
            .await
            .unwrap();
        let err = tx
            .insert_binding(LoginType::Username, &Binding::new(b.id, LoginType::Username, "alice".into(), now))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_injected_conflict_fails_commit_once() {
        let (store, user_type) = seeded().await;
        store.inject_commit_conflicts(1);

        let mut tx = store.begin().await.unwrap();
        tx.insert_user(&UserRecord::new(user_type.id, None, Utc::now()))
            .await
            .unwrap();
        assert!(tx.commit().await.unwrap_err().is_tx_conflict());
        assert_eq!(store.user_count().await, 0);

        let mut tx = store.begin().await.unwrap();
        tx.insert_user(&UserRecord::new(user_type.id, None, Utc::now()))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.user_count().await, 1);
    }

    #[tokio::test]
    async fn test_mark_code_used_only_once() {
        let (store, user_type) = seeded().await;
        let now = Utc::now();
        let user = UserRecord::new(user_type.id, None, now);
        let code = VerificationCode::new(
            user.id,
            "+254712345678".into(),
            Channel::Phone,
            "hash".into(),
            now,
            now + Duration::minutes(5),
        );

        let mut tx = store.begin().await.unwrap();
        tx.insert_user(&user).await.unwrap();
        tx.insert_code(&code).await.unwrap();
        tx.mark_code_used(Channel::Phone, code.id).await.unwrap();
        let err = tx.mark_code_used(Channel::Phone, code.id).await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_min_expiry_token() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let user = Uuid::new_v4();
        let late = PersistedToken::new(user, "d".into(), "late", now, Duration::seconds(20));
        let soon = PersistedToken::new(user, "d".into(), "soon", now, Duration::seconds(5));
        store.insert_token(&late).await.unwrap();
        store.insert_token(&soon).await.unwrap();

        assert_eq!(store.min_expiry_token().await.unwrap(), Some(soon.clone()));
        assert!(store.delete_token(&soon.token_hash).await.unwrap());
        assert!(!store.delete_token(&soon.token_hash).await.unwrap());
        assert_eq!(store.min_expiry_token().await.unwrap(), Some(late));
    }
}
