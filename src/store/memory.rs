use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::model::{insert_sorted, Reservation, ResourceId, TimeInterval};

use super::wal::{CommitRecord, RowRecord, Wal};
use super::{
    AccessMode, IsolationLevel, ReservationRepository, Scope, StoreError, StoreTx, TxOptions,
    TxProvider,
};

/// Committed rows of one room, sorted by start. `version` is bumped by every
/// commit that writes to the room.
#[derive(Debug, Default)]
struct RoomState {
    version: u64,
    reservations: Vec<Reservation>,
}

type SharedRoom = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

struct WalAppend {
    record: CommitRecord,
    response: oneshot::Sender<io::Result<()>>,
}

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is queued, then one
/// flush + fsync for the whole batch.
///
/// A failed batch is cut back off the file before anyone else appends. If
/// that also fails the log is left alone and every later append is refused.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalAppend>) {
    let mut poisoned: Option<String> = None;
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        if let Some(reason) = &poisoned {
            for append in batch {
                let _ = append
                    .response
                    .send(Err(io::Error::new(io::ErrorKind::Other, format!("WAL unusable: {reason}"))));
            }
            continue;
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());

        if let Err(e) = &result {
            warn!("WAL flush of {} records to {} failed: {e}", batch.len(), wal.path().display());
            if let Err(discard) = wal.discard_unsynced() {
                error!("cannot cut failed batch from {}: {discard}", wal.path().display());
                poisoned = Some(discard.to_string());
            }
        }
        for append in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = append.response.send(r);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[WalAppend]) -> io::Result<()> {
    for append in batch {
        wal.append_buffered(&append.record)?;
    }
    wal.flush_sync()
}

struct Shared {
    rooms: DashMap<ResourceId, SharedRoom>,
    next_id: AtomicI64,
    next_tx: AtomicU64,
    wal_tx: Option<mpsc::Sender<WalAppend>>,
}

impl Shared {
    /// Room state for writing, created on first use.
    fn room(&self, id: &ResourceId) -> SharedRoom {
        self.rooms
            .entry(id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(RoomState::default())))
            .clone()
    }

    /// Committed rows and the version they were read at. Unknown rooms read
    /// as empty at version 0 without allocating state.
    async fn read_room(&self, id: &ResourceId) -> (u64, Vec<Reservation>) {
        let Some(room) = self.rooms.get(id).map(|e| e.value().clone()) else {
            return (0, Vec::new());
        };
        let guard = room.read().await;
        (guard.version, guard.reservations.clone())
    }

    async fn wal_append(&self, record: CommitRecord) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalAppend { record, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }
}

/// Transactional reservation store kept in memory, optionally made durable
/// by a write-ahead log replayed on open.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// A store with no log. Contents are lost when the process exits.
    pub fn in_memory() -> Self {
        Self::build(DashMap::new(), 1, None)
    }

    /// Replay the log at `wal_path` and keep appending to it. Must be called
    /// inside a Tokio runtime: the log writer runs as a background task.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let replayed = Wal::replay(wal_path)?;
        let wal = Wal::open(wal_path, replayed.valid_len)?;

        let mut by_room: HashMap<ResourceId, Vec<Reservation>> = HashMap::new();
        let mut max_id = 0;
        let mut loaded = 0usize;
        let mut skipped = 0usize;
        for row in replayed.records.into_iter().flat_map(|r| r.rows) {
            match Reservation::new(row.id, &row.room_id, row.start, row.end) {
                Ok(reservation) => {
                    max_id = max_id.max(reservation.id);
                    let rows = by_room.entry(reservation.room_id.clone()).or_default();
                    if let Some(kept) = rows.iter().find(|r| r.interval.overlaps(&reservation.interval)) {
                        warn!(
                            "skipping WAL row {} in room {}: {} overlaps row {}",
                            reservation.id, reservation.room_id, reservation.interval, kept.id
                        );
                        skipped += 1;
                        continue;
                    }
                    insert_sorted(rows, reservation);
                    loaded += 1;
                }
                Err(e) => {
                    warn!("skipping invalid WAL row {}: {e}", row.id);
                    skipped += 1;
                }
            }
        }

        let rooms = DashMap::new();
        for (id, reservations) in by_room {
            let state = RoomState {
                version: 1,
                reservations,
            };
            rooms.insert(id, Arc::new(RwLock::new(state)));
        }

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        info!(
            "replayed {loaded} reservations across {} rooms from {} ({skipped} skipped)",
            rooms.len(),
            wal_path.display()
        );
        Ok(Self::build(rooms, max_id + 1, Some(wal_tx)))
    }

    fn build(rooms: DashMap<ResourceId, SharedRoom>, next_id: i64, wal_tx: Option<mpsc::Sender<WalAppend>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                rooms,
                next_id: AtomicI64::new(next_id),
                next_tx: AtomicU64::new(1),
                wal_tx,
            }),
        }
    }

    pub fn room_count(&self) -> usize {
        self.shared.rooms.len()
    }
}

#[async_trait]
impl TxProvider for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self, options: TxOptions) -> Result<MemoryTx, StoreError> {
        let id = self.shared.next_tx.fetch_add(1, Ordering::Relaxed);
        debug!("begin tx {id} ({})", options.isolation);
        Ok(MemoryTx {
            shared: self.shared.clone(),
            state: Arc::new(Mutex::new(TxState {
                id,
                options,
                open: true,
                snapshots: HashMap::new(),
                read_versions: HashMap::new(),
                pending: Vec::new(),
            })),
        })
    }
}

#[async_trait]
impl ReservationRepository for MemoryStore {
    type Tx = MemoryTx;

    async fn create(
        &self,
        scope: Scope<'_, MemoryTx>,
        room_id: &ResourceId,
        interval: TimeInterval,
    ) -> Result<Reservation, StoreError> {
        match scope {
            Scope::Tx(tx) => tx.insert(room_id, interval).await,
            Scope::Direct => {
                let tx = self.begin(TxOptions::new(IsolationLevel::ReadCommitted)).await?;
                let reservation = tx.insert(room_id, interval).await?;
                tx.commit().await?;
                Ok(reservation)
            }
        }
    }

    async fn list_by_room(
        &self,
        scope: Scope<'_, MemoryTx>,
        room_id: &ResourceId,
    ) -> Result<Vec<Reservation>, StoreError> {
        match scope {
            Scope::Tx(tx) => tx.list(room_id).await,
            Scope::Direct => Ok(self.shared.read_room(room_id).await.1),
        }
    }
}

struct TxState {
    id: u64,
    options: TxOptions,
    open: bool,
    /// Rows seen by the first read of each room (repeatable read and up).
    snapshots: HashMap<ResourceId, Vec<Reservation>>,
    /// Room version at the first read.
    read_versions: HashMap<ResourceId, u64>,
    pending: Vec<Reservation>,
}

/// Open transaction on a [`MemoryStore`]. Clones share the same transaction.
#[derive(Clone)]
pub struct MemoryTx {
    shared: Arc<Shared>,
    state: Arc<Mutex<TxState>>,
}

impl MemoryTx {
    async fn list(&self, room_id: &ResourceId) -> Result<Vec<Reservation>, StoreError> {
        let mut state = self.state.lock().await;
        if !state.open {
            return Err(StoreError::Closed);
        }

        let mut rows = match state.options.isolation {
            IsolationLevel::ReadCommitted => {
                let (version, rows) = self.shared.read_room(room_id).await;
                state.read_versions.entry(room_id.clone()).or_insert(version);
                rows
            }
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                if let Some(rows) = state.snapshots.get(room_id) {
                    rows.clone()
                } else {
                    let (version, rows) = self.shared.read_room(room_id).await;
                    state.read_versions.insert(room_id.clone(), version);
                    state.snapshots.insert(room_id.clone(), rows.clone());
                    rows
                }
            }
        };

        for pending in state.pending.iter().filter(|r| &r.room_id == room_id) {
            insert_sorted(&mut rows, pending.clone());
        }
        Ok(rows)
    }

    async fn insert(&self, room_id: &ResourceId, interval: TimeInterval) -> Result<Reservation, StoreError> {
        let mut state = self.state.lock().await;
        if !state.open {
            return Err(StoreError::Closed);
        }
        if state.options.access_mode == AccessMode::ReadOnly {
            return Err(StoreError::ReadOnly);
        }
        let reservation = Reservation {
            id: self.shared.next_id.fetch_add(1, Ordering::SeqCst),
            room_id: room_id.clone(),
            interval,
        };
        state.pending.push(reservation.clone());
        Ok(reservation)
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn commit(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.open {
            return Err(StoreError::Closed);
        }
        state.open = false;
        let pending = std::mem::take(&mut state.pending);
        let isolation = state.options.isolation;
        if pending.is_empty() {
            debug!("commit tx {} (no writes)", state.id);
            return Ok(());
        }

        // Lock every touched room in key order so concurrent commits can't deadlock.
        let mut touched: BTreeSet<ResourceId> = pending.iter().map(|r| r.room_id.clone()).collect();
        if isolation == IsolationLevel::Serializable {
            touched.extend(state.read_versions.keys().cloned());
        }
        let mut guards: Vec<(ResourceId, OwnedRwLockWriteGuard<RoomState>)> = Vec::with_capacity(touched.len());
        for room_id in touched {
            let room = self.shared.room(&room_id);
            guards.push((room_id, room.write_owned().await));
        }

        for (room_id, guard) in &guards {
            let Some(&seen) = state.read_versions.get(room_id) else {
                continue;
            };
            let must_be_unchanged = match isolation {
                IsolationLevel::Serializable => true,
                IsolationLevel::RepeatableRead => pending.iter().any(|r| &r.room_id == room_id),
                IsolationLevel::ReadCommitted => false,
            };
            if must_be_unchanged && guard.version != seen {
                debug!(
                    "tx {} serialization failure on room {room_id}: read v{seen}, now v{}",
                    state.id, guard.version
                );
                metrics::counter!(crate::observability::SERIALIZATION_FAILURES_TOTAL).increment(1);
                return Err(StoreError::SerializationFailure(room_id.clone()));
            }
        }

        let record = CommitRecord {
            rows: pending.iter().map(RowRecord::from).collect(),
        };
        let rows = pending.len();

        // Log and apply in a task of their own: a caller that stops waiting
        // can't leave a logged commit unapplied.
        let shared = self.shared.clone();
        let finish = tokio::spawn(async move {
            shared.wal_append(record).await?;
            for (room_id, guard) in guards.iter_mut() {
                let mut wrote = false;
                for reservation in pending.iter().filter(|r| &r.room_id == room_id) {
                    insert_sorted(&mut guard.reservations, reservation.clone());
                    wrote = true;
                }
                if wrote {
                    guard.version += 1;
                }
            }
            Ok::<_, StoreError>(())
        });
        finish
            .await
            .map_err(|e| StoreError::Unavailable(format!("commit task failed: {e}")))??;
        debug!("commit tx {} ({rows} rows)", state.id);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.open {
            return Err(StoreError::Closed);
        }
        state.open = false;
        state.pending.clear();
        state.snapshots.clear();
        debug!("rollback tx {}", state.id);
        Ok(())
    }
}
