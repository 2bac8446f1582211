//! Persistence and transaction interfaces, plus the built-in store.
//!
//! The reservation service only talks to the traits in this module. A
//! transaction is an explicit handle: the executor hands it to the unit of
//! work, and repository calls that should join the transaction receive it
//! wrapped in [`Scope::Tx`]. Calls made with [`Scope::Direct`] run outside
//! any transaction.

mod memory;
mod wal;

pub use memory::{MemoryStore, MemoryTx};

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::model::{Reservation, ResourceId, TimeInterval};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "read_committed",
            IsolationLevel::RepeatableRead => "repeatable_read",
            IsolationLevel::Serializable => "serializable",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable_read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(format!("unknown isolation level: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub access_mode: AccessMode,
}

impl TxOptions {
    pub fn new(isolation: IsolationLevel) -> Self {
        Self {
            isolation,
            access_mode: AccessMode::ReadWrite,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.access_mode = AccessMode::ReadOnly;
        self
    }
}

/// Where a repository call runs.
pub enum Scope<'a, T> {
    /// Join the given open transaction.
    Tx(&'a T),
    /// Run on its own, outside any transaction.
    Direct,
}

/// Opens transactions.
#[async_trait]
pub trait TxProvider: Send + Sync {
    type Tx: StoreTx;

    async fn begin(&self, options: TxOptions) -> Result<Self::Tx, StoreError>;
}

/// Handle to an open transaction. Clones refer to the same transaction;
/// once committed or rolled back every clone is closed.
#[async_trait]
pub trait StoreTx: Clone + Send + Sync + 'static {
    async fn commit(&self) -> Result<(), StoreError>;
    async fn rollback(&self) -> Result<(), StoreError>;
}

/// Reservation rows.
#[async_trait]
pub trait ReservationRepository: Send + Sync {
    type Tx: Send + Sync;

    async fn create(
        &self,
        scope: Scope<'_, Self::Tx>,
        room_id: &ResourceId,
        interval: TimeInterval,
    ) -> Result<Reservation, StoreError>;

    async fn list_by_room(
        &self,
        scope: Scope<'_, Self::Tx>,
        room_id: &ResourceId,
    ) -> Result<Vec<Reservation>, StoreError>;
}

#[derive(Debug)]
pub enum StoreError {
    /// The transaction was already committed or rolled back.
    Closed,
    /// Write attempted in a read-only transaction.
    ReadOnly,
    /// A concurrent commit changed rows this transaction depends on.
    SerializationFailure(ResourceId),
    WalError(String),
    Unavailable(String),
    /// The unit of work failed and so did the rollback.
    Rollback {
        cause: Box<dyn std::error::Error + Send + Sync>,
        rollback: Box<StoreError>,
    },
}

impl StoreError {
    pub fn is_serialization_failure(&self) -> bool {
        matches!(self, StoreError::SerializationFailure(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Closed => write!(f, "transaction is closed"),
            StoreError::ReadOnly => write!(f, "cannot write in a read-only transaction"),
            StoreError::SerializationFailure(room) => {
                write!(f, "could not serialize access to room {room} due to concurrent update")
            }
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
            StoreError::Rollback { cause, rollback } => {
                write!(f, "{cause} | rollback failed: {rollback}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Rollback { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_parse() {
        assert_eq!("serializable".parse::<IsolationLevel>(), Ok(IsolationLevel::Serializable));
        assert_eq!("REPEATABLE READ".parse::<IsolationLevel>(), Ok(IsolationLevel::RepeatableRead));
        assert_eq!("read-committed".parse::<IsolationLevel>(), Ok(IsolationLevel::ReadCommitted));
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn isolation_ordering() {
        assert!(IsolationLevel::Serializable > IsolationLevel::RepeatableRead);
        assert!(IsolationLevel::RepeatableRead > IsolationLevel::ReadCommitted);
        assert_eq!(TxOptions::default().isolation, IsolationLevel::Serializable);
    }

    #[test]
    fn rollback_error_keeps_both_causes() {
        let err = StoreError::Rollback {
            cause: Box::new(StoreError::Unavailable("disk gone".into())),
            rollback: Box::new(StoreError::Closed),
        };
        let msg = err.to_string();
        assert!(msg.contains("disk gone"));
        assert!(msg.contains("transaction is closed"));
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("disk gone"));
    }
}
