use service_core::error::AppError;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::db::CredentialStore;
use crate::models::{History, HistoryAction};
use crate::utils::clock::Clock;

/// Writes audit entries off the request path. A failed write is logged and
/// never reaches the caller.
#[derive(Clone)]
pub struct HistoryRecorder {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
}

impl HistoryRecorder {
    pub fn new(store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn record(
        &self,
        user_id: Option<Uuid>,
        action: HistoryAction,
        successful: bool,
        device_id: Option<&str>,
    ) -> JoinHandle<()> {
        let entry = History::new(user_id, action, successful, self.clock.now())
            .with_device(device_id.map(str::to_string));
        let store = self.store.clone();

        tokio::spawn(async move {
            if let Err(e) = store.insert_history(&entry).await {
                tracing::warn!(
                    error = %e,
                    action = entry.action.as_str(),
                    "Failed to record history"
                );
            }
        })
    }

    /// Records the outcome of `result` for `user_id`.
    pub fn record_result<T>(
        &self,
        user_id: Option<Uuid>,
        action: HistoryAction,
        device_id: Option<&str>,
        result: &Result<T, AppError>,
    ) -> JoinHandle<()> {
        self.record(user_id, action, result.is_ok(), device_id)
    }

    /// Up to `count` of the user's entries, newest first, skipping the
    /// first `offset`. No `actions` means every action.
    pub async fn history(
        &self,
        user_id: Uuid,
        offset: usize,
        count: usize,
        actions: &[HistoryAction],
    ) -> Result<Vec<History>, AppError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.store
            .history_for(user_id, offset, count, actions)
            .await
            .map_err(|e| e.context("read history"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::utils::clock::{ManualClock, SystemClock};
    use chrono::Duration;

    #[tokio::test]
    async fn test_entries_are_written_in_background() {
        let store = MemoryStore::new();
        let recorder = HistoryRecorder::new(Arc::new(store.clone()), Arc::new(SystemClock));

        let user = Uuid::new_v4();
        recorder
            .record(Some(user), HistoryAction::Login, false, Some("dev-1"))
            .await
            .unwrap();

        let history = store.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].user_id, Some(user));
        assert!(!history[0].successful);
        assert_eq!(history[0].device_id.as_deref(), Some("dev-1"));
    }

    #[tokio::test]
    async fn test_history_is_paged_newest_first() {
        // 1. Setup
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::default());
        let recorder = HistoryRecorder::new(Arc::new(store.clone()), clock.clone());
        let user = Uuid::new_v4();

        // 2. Five entries a minute apart, plus noise from another user
        let actions = [
            HistoryAction::Registration,
            HistoryAction::Verification,
            HistoryAction::Login,
            HistoryAction::Login,
            HistoryAction::UpdatePassword,
        ];
        for action in actions {
            recorder.record(Some(user), action, true, None).await.unwrap();
            clock.advance(Duration::minutes(1));
        }
        recorder
            .record(Some(Uuid::new_v4()), HistoryAction::Login, true, None)
            .await
            .unwrap();

        // 3. Newest first, paged
        let all = recorder.history(user, 0, 10, &[]).await.unwrap();
        let got: Vec<HistoryAction> = all.iter().map(|h| h.action).collect();
        assert_eq!(
            got,
            vec![
                HistoryAction::UpdatePassword,
                HistoryAction::Login,
                HistoryAction::Login,
                HistoryAction::Verification,
                HistoryAction::Registration,
            ]
        );

        let page = recorder.history(user, 1, 2, &[]).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, all[1].id);
        assert_eq!(page[1].id, all[2].id);

        assert!(recorder.history(user, 5, 10, &[]).await.unwrap().is_empty());
        assert!(recorder.history(user, 0, 0, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_filters_by_action() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::default());
        let recorder = HistoryRecorder::new(Arc::new(store.clone()), clock.clone());
        let user = Uuid::new_v4();

        for action in [HistoryAction::Login, HistoryAction::Registration, HistoryAction::Login] {
            recorder.record(Some(user), action, true, None).await.unwrap();
            clock.advance(Duration::seconds(1));
        }

        let logins = recorder.history(user, 0, 10, &[HistoryAction::Login]).await.unwrap();
        assert_eq!(logins.len(), 2);
        assert!(logins.iter().all(|h| h.action == HistoryAction::Login));
        assert!(logins[0].created_at > logins[1].created_at);

        let either = recorder
            .history(user, 0, 10, &[HistoryAction::Registration, HistoryAction::ResetPassword])
            .await
            .unwrap();
        assert_eq!(either.len(), 1);
        assert_eq!(either[0].action, HistoryAction::Registration);
    }
}
