use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::warn;

use crate::store::{StoreError, StoreTx, TxOptions, TxProvider};

/// Runs units of work inside a transaction: begin, run, then commit on
/// success or roll back on failure.
pub struct TxExecutor<P> {
    provider: Arc<P>,
}

impl<P> Clone for TxExecutor<P> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
        }
    }
}

impl<P: TxProvider> TxExecutor<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }

    /// Run `work` in a fresh transaction opened with `options`.
    ///
    /// The work receives the transaction handle and must pass it to every
    /// repository call that should join the transaction. Its error is
    /// returned as [`TxError::Work`] after a rollback; if the rollback also
    /// fails both errors come back in [`TxError::Rollback`].
    pub async fn execute<T, E, F, Fut>(&self, options: TxOptions, work: F) -> Result<T, TxError<E>>
    where
        F: FnOnce(P::Tx) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let tx = self.provider.begin(options).await.map_err(TxError::Begin)?;

        match work(tx.clone()).await {
            Ok(value) => {
                tx.commit().await.map_err(TxError::Commit)?;
                metrics::counter!(crate::observability::TX_COMMITS_TOTAL).increment(1);
                Ok(value)
            }
            Err(source) => {
                metrics::counter!(crate::observability::TX_ROLLBACKS_TOTAL).increment(1);
                match tx.rollback().await {
                    Ok(()) => Err(TxError::Work(source)),
                    Err(rollback) => {
                        warn!("rollback failed: {rollback}");
                        Err(TxError::Rollback { source, rollback })
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum TxError<E> {
    /// The transaction could not be opened; the work never ran.
    Begin(StoreError),
    /// The work failed and the transaction was rolled back.
    Work(E),
    /// The work failed and the rollback failed too.
    Rollback { source: E, rollback: StoreError },
    /// The work succeeded but the commit did not.
    Commit(StoreError),
}

impl<E: fmt::Display> fmt::Display for TxError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxError::Begin(e) => write!(f, "begin failed: {e}"),
            TxError::Work(e) => write!(f, "{e}"),
            TxError::Rollback { source, rollback } => {
                write!(f, "{source} (rollback failed: {rollback})")
            }
            TxError::Commit(e) => write!(f, "commit failed: {e}"),
        }
    }
}

impl<E> std::error::Error for TxError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TxError::Begin(e) | TxError::Commit(e) => Some(e),
            TxError::Work(e) => Some(e),
            TxError::Rollback { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IsolationLevel, MemoryStore, ReservationRepository, Scope};
    use crate::model::{ResourceId, TimeInterval};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn slot() -> TimeInterval {
        TimeInterval::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn room() -> ResourceId {
        ResourceId::new("a").unwrap()
    }

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("boom")
        }
    }

    impl std::error::Error for Boom {}

    #[tokio::test]
    async fn commits_on_success() {
        let store = Arc::new(MemoryStore::in_memory());
        let executor = TxExecutor::new(store.clone());
        let repo = store.clone();

        let created = executor
            .execute(TxOptions::default(), |tx| async move {
                repo.create(Scope::Tx(&tx), &room(), slot()).await
            })
            .await
            .unwrap();

        let rows = store.list_by_room(Scope::Direct, &room()).await.unwrap();
        assert_eq!(rows, vec![created]);
    }

    #[tokio::test]
    async fn rolls_back_on_work_error() {
        let store = Arc::new(MemoryStore::in_memory());
        let executor = TxExecutor::new(store.clone());
        let repo = store.clone();

        let result: Result<(), _> = executor
            .execute(TxOptions::default(), |tx| async move {
                repo.create(Scope::Tx(&tx), &room(), slot()).await.map_err(|_| Boom)?;
                Err(Boom)
            })
            .await;

        assert!(matches!(result, Err(TxError::Work(Boom))));
        assert!(store.list_by_room(Scope::Direct, &room()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_failure_is_reported() {
        let store = Arc::new(MemoryStore::in_memory());
        let executor = TxExecutor::new(store.clone());
        let repo = store.clone();

        let result = executor
            .execute(TxOptions::new(IsolationLevel::Serializable), |tx| async move {
                repo.list_by_room(Scope::Tx(&tx), &room()).await?;
                // A concurrent writer commits first
                repo.create(Scope::Direct, &room(), slot()).await?;
                repo.create(Scope::Tx(&tx), &room(), slot()).await
            })
            .await;

        match result {
            Err(TxError::Commit(e)) => assert!(e.is_serialization_failure()),
            other => panic!("expected commit failure, got {other:?}"),
        }
    }

    // Provider whose transactions can't roll back.
    #[derive(Default)]
    struct BrokenRollback {
        begins: AtomicUsize,
    }

    #[derive(Clone)]
    struct BrokenTx;

    #[async_trait]
    impl StoreTx for BrokenTx {
        async fn commit(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn rollback(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection reset".into()))
        }
    }

    #[async_trait]
    impl TxProvider for BrokenRollback {
        type Tx = BrokenTx;

        async fn begin(&self, _options: TxOptions) -> Result<BrokenTx, StoreError> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            Ok(BrokenTx)
        }
    }

    #[tokio::test]
    async fn rollback_failure_keeps_both_errors() {
        let provider = Arc::new(BrokenRollback::default());
        let executor = TxExecutor::new(provider.clone());

        let result: Result<(), TxError<Boom>> = executor
            .execute(TxOptions::default(), |_tx| async { Err(Boom) })
            .await;

        let err = result.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("boom"), "{msg}");
        assert!(msg.contains("connection reset"), "{msg}");
        match err {
            TxError::Rollback { source: Boom, rollback } => {
                assert!(matches!(rollback, StoreError::Unavailable(_)));
            }
            other => panic!("expected rollback failure, got {other:?}"),
        }
        assert_eq!(provider.begins.load(Ordering::SeqCst), 1);
    }

    struct NoBegin;

    #[async_trait]
    impl TxProvider for NoBegin {
        type Tx = BrokenTx;

        async fn begin(&self, _options: TxOptions) -> Result<BrokenTx, StoreError> {
            Err(StoreError::Unavailable("pool exhausted".into()))
        }
    }

    #[tokio::test]
    async fn begin_failure_skips_work() {
        let executor = TxExecutor::new(Arc::new(NoBegin));
        let ran = AtomicUsize::new(0);

        let result: Result<(), TxError<Boom>> = executor
            .execute(TxOptions::default(), |_tx| async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(TxError::Begin(StoreError::Unavailable(_)))));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
