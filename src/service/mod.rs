//! Reservation orchestration: validate, serialize per room, then check and
//! insert inside a transaction.
//!
//! Two layers keep overlapping reservations out. The keyed lock linearizes
//! every `reserve_room` call for one room inside this process, and the
//! serializable (or repeatable read) transaction around the read-check-write
//! sequence keeps the store consistent when several processes share it.

mod conflict;
mod error;

pub use error::ReservationError;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, TimeZone};
use tracing::{debug, warn};

use crate::locks::LockRegistry;
use crate::model::{Reservation, ResourceId, TimeInterval};
use crate::store::{IsolationLevel, MemoryStore, ReservationRepository, Scope, TxOptions, TxProvider};
use crate::tx::TxExecutor;

use conflict::check_no_conflict;

/// The service as the server runs it: one in-memory store acting as both
/// transaction provider and repository.
pub type Service = ReservationService<MemoryStore, MemoryStore>;

pub struct ReservationService<P, R> {
    locks: Arc<LockRegistry>,
    tx: TxExecutor<P>,
    repo: Arc<R>,
    options: TxOptions,
}

impl<P, R> ReservationService<P, R>
where
    P: TxProvider,
    R: ReservationRepository<Tx = P::Tx>,
{
    /// Reserve at serializable isolation.
    pub fn new(locks: Arc<LockRegistry>, provider: Arc<P>, repo: Arc<R>) -> Self {
        Self {
            locks,
            tx: TxExecutor::new(provider),
            repo,
            options: TxOptions::new(IsolationLevel::Serializable),
        }
    }

    /// Run reservations at `isolation`. Anything weaker than repeatable read
    /// can't detect a concurrent insert and is raised to repeatable read.
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        let floor = IsolationLevel::RepeatableRead;
        if isolation < floor {
            warn!("isolation {isolation} too weak for reservations, using {floor}");
        }
        self.options = TxOptions::new(isolation.max(floor));
        self
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.options.isolation
    }

    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Book `[from, to)` on `room`. Both ends are converted to UTC and
    /// truncated to whole seconds first.
    ///
    /// Fails with [`ReservationError::Validation`] before touching the lock
    /// table or the store, with [`ReservationError::Conflict`] if the room
    /// already has an overlapping reservation, and with
    /// [`ReservationError::Store`] for anything else.
    pub async fn reserve_room<Tz: TimeZone>(
        &self,
        room: &str,
        from: DateTime<Tz>,
        to: DateTime<Tz>,
    ) -> Result<Reservation, ReservationError> {
        let start = Instant::now();
        let result = self.reserve_inner(room, from, to).await;
        metrics::histogram!(crate::observability::RESERVE_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());

        let status = match &result {
            Ok(created) => {
                debug!("reserved {} on room {} (id {})", created.interval, created.room_id, created.id);
                "created"
            }
            Err(e @ ReservationError::Store(_)) => {
                warn!("reservation on room {room} failed: {e}");
                e.status()
            }
            Err(e) => {
                debug!("reservation on room {room} rejected: {e}");
                e.status()
            }
        };
        metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "status" => status).increment(1);
        result
    }

    async fn reserve_inner<Tz: TimeZone>(
        &self,
        room: &str,
        from: DateTime<Tz>,
        to: DateTime<Tz>,
    ) -> Result<Reservation, ReservationError> {
        let room_id = ResourceId::new(room)?;
        let interval = TimeInterval::new(from, to)?;

        let wait_start = Instant::now();
        let _guard = self.locks.lock(room_id.as_str()).await;
        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
            .record(wait_start.elapsed().as_secs_f64());

        let repo = &self.repo;
        let room_id = &room_id;
        let created = self
            .tx
            .execute(self.options, |tx| async move {
                let existing = repo.list_by_room(Scope::Tx(&tx), room_id).await?;
                check_no_conflict(room_id, &existing, &interval)?;
                let created = repo.create(Scope::Tx(&tx), room_id, interval).await?;
                Ok::<_, ReservationError>(created)
            })
            .await?;
        Ok(created)
    }

    /// Committed reservations of `room`, sorted by start. Reads outside any
    /// transaction and takes no lock.
    pub async fn list_by_room(&self, room: &str) -> Result<Vec<Reservation>, ReservationError> {
        let room_id = ResourceId::new(room)?;
        Ok(self.repo.list_by_room(Scope::Direct, &room_id).await?)
    }
}
