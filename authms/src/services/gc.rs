//! Expired persisted-token collector.
//!
//! A single worker owns the cached candidate: the live token with the
//! smallest expiry. Its timer is always armed for no later than that expiry.
//! Writers never touch the worker's state; they post [`GcEvent`]s through a
//! [`GcNotifier`] and the worker reacts in arrival order.

use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::db::TokenStore;
use crate::models::PersistedToken;
use crate::utils::clock::Clock;

pub const ALREADY_RUNNING: &str = "garbage collector is already running";

#[derive(Debug)]
pub enum GcEvent {
    TimerFired,
    Inserted(PersistedToken),
    Deleted(PersistedToken),
    DeleteFailed(AppError),
}

/// Posts token-table changes to the collector. Sends never block and are
/// dropped while no collector is running; a starting worker reads the table
/// itself.
#[derive(Clone)]
pub struct GcNotifier {
    tx: mpsc::UnboundedSender<GcEvent>,
    running: Arc<AtomicBool>,
}

impl GcNotifier {
    pub fn inserted(&self, token: &PersistedToken) {
        self.send(GcEvent::Inserted(token.clone()));
    }

    pub fn deleted(&self, token: &PersistedToken) {
        self.send(GcEvent::Deleted(token.clone()));
    }

    fn send(&self, event: GcEvent) {
        if self.running.load(Ordering::SeqCst) {
            let _ = self.tx.send(event);
        }
    }
}

struct Inner {
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    short_interval: Duration,
    tx: mpsc::UnboundedSender<GcEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<GcEvent>>>,
    running: Arc<AtomicBool>,
}

/// Handle to the collector. Cheap to clone; at most one worker runs at a time.
#[derive(Clone)]
pub struct TokenGc {
    inner: Arc<Inner>,
}

impl TokenGc {
    pub fn new(store: Arc<dyn TokenStore>, clock: Arc<dyn Clock>, short_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                store,
                clock,
                short_interval,
                tx,
                rx: Mutex::new(Some(rx)),
                running: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    pub fn notifier(&self) -> GcNotifier {
        GcNotifier {
            tx: self.inner.tx.clone(),
            running: self.inner.running.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Reads the current minimum, arms the timer and spawns the worker.
    ///
    /// Fails without spawning anything when a worker is already running.
    pub async fn start(&self, cancel: CancellationToken) -> Result<GcHandle, AppError> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::InternalError(anyhow::anyhow!(ALREADY_RUNNING)));
        }

        match self.spawn_worker(cancel.clone()).await {
            Ok((join, armed)) => {
                tracing::info!("Token garbage collector started");
                Ok(GcHandle {
                    cancel,
                    join,
                    armed,
                })
            }
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn spawn_worker(
        &self,
        cancel: CancellationToken,
    ) -> Result<
        (
            JoinHandle<Result<(), AppError>>,
            watch::Receiver<Option<DateTime<Utc>>>,
        ),
        AppError,
    > {
        let mut rx = self
            .inner
            .rx
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("gc receiver mutex poisoned: {}", e)))?
            .take()
            .ok_or_else(|| AppError::InternalError(anyhow::anyhow!(ALREADY_RUNNING)))?;

        // Leftovers from a previous worker; the query below supersedes them
        let mut stale = 0usize;
        while rx.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            tracing::debug!(stale, "Dropped stale collector events");
        }

        let candidate = match self.inner.store.min_expiry_token().await {
            Ok(candidate) => candidate,
            Err(e) => {
                self.return_receiver(rx);
                return Err(e.context("read nearest token expiry"));
            }
        };

        let (armed_tx, armed_rx) = watch::channel(None);
        let mut worker = Worker {
            inner: self.inner.clone(),
            rx,
            candidate: None,
            deleting: None,
            deadline: Instant::now(),
            armed: armed_tx,
        };
        worker.set_candidate(candidate);

        let join = tokio::spawn(async move {
            let result = worker.run(cancel).await;
            let Worker { inner, rx, .. } = worker;
            if let Ok(mut slot) = inner.rx.lock() {
                *slot = Some(rx);
            }
            inner.running.store(false, Ordering::SeqCst);

            match &result {
                Ok(()) => tracing::info!("Token garbage collector stopped"),
                Err(e) => tracing::error!(error = %e, "Token garbage collector terminated"),
            }
            result
        });

        Ok((join, armed_rx))
    }

    fn return_receiver(&self, rx: mpsc::UnboundedReceiver<GcEvent>) {
        if let Ok(mut slot) = self.inner.rx.lock() {
            *slot = Some(rx);
        }
    }
}

/// A running collector.
pub struct GcHandle {
    cancel: CancellationToken,
    join: JoinHandle<Result<(), AppError>>,
    armed: watch::Receiver<Option<DateTime<Utc>>>,
}

impl GcHandle {
    /// Expiry the timer is armed for; `None` while the table is empty.
    pub fn armed_expiry(&self) -> Option<DateTime<Utc>> {
        *self.armed.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the worker to exit on its own.
    pub async fn join(self) -> Result<(), AppError> {
        self.join
            .await
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("gc worker panicked: {}", e)))?
    }

    /// Cancels the worker and waits for it.
    pub async fn shutdown(self) -> Result<(), AppError> {
        self.cancel.cancel();
        self.join().await
    }
}

struct Worker {
    inner: Arc<Inner>,
    rx: mpsc::UnboundedReceiver<GcEvent>,
    candidate: Option<PersistedToken>,
    /// Hash of the row with a delete in flight.
    deleting: Option<String>,
    deadline: Instant,
    armed: watch::Sender<Option<DateTime<Utc>>>,
}

impl Worker {
    async fn run(&mut self, cancel: CancellationToken) -> Result<(), AppError> {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => return Ok(()),
                },
                _ = tokio::time::sleep_until(self.deadline) => GcEvent::TimerFired,
            };

            self.handle(event).await?;
        }
    }

    async fn handle(&mut self, event: GcEvent) -> Result<(), AppError> {
        match event {
            GcEvent::TimerFired => self.on_timer().await,
            GcEvent::Inserted(token) => {
                let sooner = self
                    .candidate
                    .as_ref()
                    .map_or(true, |c| token.expires_at < c.expires_at);
                if sooner {
                    self.set_candidate(Some(token));
                }
            }
            GcEvent::Deleted(token) => {
                if self.deleting.as_deref() == Some(token.token_hash.as_str()) {
                    self.deleting = None;
                }
                if self
                    .candidate
                    .as_ref()
                    .is_some_and(|c| c.token_hash == token.token_hash)
                {
                    self.requery().await;
                }
            }
            GcEvent::DeleteFailed(err) => {
                metrics::counter!("authms_gc_delete_failures_total").increment(1);
                return Err(err.context("delete expired token"));
            }
        }
        Ok(())
    }

    async fn on_timer(&mut self) {
        let Some(candidate) = self.candidate.clone() else {
            self.requery().await;
            return;
        };

        let now = self.inner.clock.now();
        if candidate.expires_at > now {
            self.arm_for(candidate.expires_at, now);
            return;
        }

        if self.deleting.is_none() {
            self.deleting = Some(candidate.token_hash.clone());
            self.spawn_delete(candidate);
        }
        self.deadline = Instant::now() + self.inner.short_interval;
    }

    fn spawn_delete(&self, token: PersistedToken) {
        let store = self.inner.store.clone();
        let tx = self.inner.tx.clone();

        tokio::spawn(async move {
            let event = match store.delete_token(&token.token_hash).await {
                Ok(_) => {
                    metrics::counter!("authms_gc_tokens_deleted_total").increment(1);
                    tracing::debug!(token_id = %token.id, "Expired token collected");
                    GcEvent::Deleted(token)
                }
                Err(e) => GcEvent::DeleteFailed(e),
            };
            let _ = tx.send(event);
        });
    }

    async fn requery(&mut self) {
        match self.inner.store.min_expiry_token().await {
            Ok(candidate) => self.set_candidate(candidate),
            Err(e) => {
                // The old candidate may be gone; retry the query rather than trust it
                tracing::warn!(error = %e, "Failed to read nearest token expiry");
                self.set_candidate(None);
            }
        }
    }

    fn set_candidate(&mut self, candidate: Option<PersistedToken>) {
        let now = self.inner.clock.now();
        match &candidate {
            Some(token) => self.arm_for(token.expires_at, now),
            None => {
                self.deadline = Instant::now() + self.inner.short_interval;
                self.armed.send_replace(None);
            }
        }
        self.candidate = candidate;
    }

    fn arm_for(&mut self, expiry: DateTime<Utc>, now: DateTime<Utc>) {
        let wait = (expiry - now).to_std().unwrap_or(Duration::ZERO);
        self.deadline = Instant::now() + wait;
        self.armed.send_replace(Some(expiry));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::utils::clock::TokioClock;

    fn token(clock: &TokioClock, secs: i64) -> PersistedToken {
        PersistedToken::new(
            uuid::Uuid::new_v4(),
            "dev".into(),
            &uuid::Uuid::new_v4().to_string(),
            clock.now(),
            chrono::Duration::seconds(secs),
        )
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_fails_fast() {
        let store = MemoryStore::new();
        let gc = TokenGc::new(Arc::new(store), Arc::new(TokioClock::new()), Duration::from_secs(1));

        let handle = gc.start(CancellationToken::new()).await.unwrap();
        let err = gc.start(CancellationToken::new()).await.err().unwrap();
        assert!(err.to_string().contains(ALREADY_RUNNING));

        handle.shutdown().await.unwrap();
        assert!(!gc.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_shutdown() {
        let gc = TokenGc::new(
            Arc::new(MemoryStore::new()),
            Arc::new(TokioClock::new()),
            Duration::from_secs(1),
        );

        gc.start(CancellationToken::new()).await.unwrap().shutdown().await.unwrap();
        let handle = gc.start(CancellationToken::new()).await.unwrap();
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sooner_insert_replaces_candidate() {
        let clock = TokioClock::new();
        let store = MemoryStore::with_clock(Arc::new(clock));
        let late = token(&clock, 60);
        store.insert_token(&late).await.unwrap();

        let gc = TokenGc::new(Arc::new(store.clone()), Arc::new(clock), Duration::from_secs(1));
        let handle = gc.start(CancellationToken::new()).await.unwrap();
        assert_eq!(handle.armed_expiry(), Some(late.expires_at));

        let early = token(&clock, 5);
        store.insert_token(&early).await.unwrap();
        gc.notifier().inserted(&early);
        settle().await;
        assert_eq!(handle.armed_expiry(), Some(early.expires_at));

        let later = token(&clock, 30);
        store.insert_token(&later).await.unwrap();
        gc.notifier().inserted(&later);
        settle().await;
        assert_eq!(handle.armed_expiry(), Some(early.expires_at));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_failure_terminates_worker() {
        let clock = TokioClock::new();
        let store = MemoryStore::with_clock(Arc::new(clock));
        store.insert_token(&token(&clock, 1)).await.unwrap();
        store.fail_token_deletes(true);

        let gc = TokenGc::new(Arc::new(store.clone()), Arc::new(clock), Duration::from_secs(1));
        let handle = gc.start(CancellationToken::new()).await.unwrap();

        let err = handle.join().await.unwrap_err();
        assert!(err.is_internal());
        assert_eq!(store.delete_attempts().unwrap().len(), 1);
        assert!(!gc.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifier_is_silent_while_stopped() {
        let clock = TokioClock::new();
        let gc = TokenGc::new(Arc::new(MemoryStore::new()), Arc::new(clock), Duration::from_secs(1));
        let notifier = gc.notifier();

        notifier.inserted(&token(&clock, 5));
        notifier.deleted(&token(&clock, 5));

        let mut slot = gc.inner.rx.lock().unwrap();
        assert!(slot.as_mut().unwrap().try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_requery_drops_candidate() {
        // 1. Setup
        let clock = TokioClock::new();
        let store = MemoryStore::with_clock(Arc::new(clock));
        let first = token(&clock, 10);
        let second = token(&clock, 20);
        store.insert_token(&first).await.unwrap();
        store.insert_token(&second).await.unwrap();

        let gc = TokenGc::new(Arc::new(store.clone()), Arc::new(clock), Duration::from_secs(1));
        let handle = gc.start(CancellationToken::new()).await.unwrap();
        assert_eq!(handle.armed_expiry(), Some(first.expires_at));

        // 2. The candidate is revoked while the table cannot be read
        store.fail_expiry_queries(true);
        assert!(store.delete_token(&first.token_hash).await.unwrap());
        gc.notifier().deleted(&first);
        settle().await;
        assert_eq!(handle.armed_expiry(), None);

        // 3. The next successful query re-arms for what is really there
        store.fail_expiry_queries(false);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        settle().await;
        assert_eq!(handle.armed_expiry(), Some(second.expires_at));

        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;
        assert_eq!(
            store.delete_attempts().unwrap(),
            vec![first.token_hash.clone(), second.token_hash.clone()]
        );

        handle.shutdown().await.unwrap();
    }
}
