use crate::model::{ResourceId, TimeInterval, ValidationError};
use crate::store::StoreError;
use crate::tx::TxError;

#[derive(Debug)]
pub enum ReservationError {
    Validation(ValidationError),
    /// The requested interval overlaps a reservation already on the room.
    Conflict {
        room_id: ResourceId,
        requested: TimeInterval,
        existing: TimeInterval,
    },
    Store(StoreError),
}

impl ReservationError {
    /// Short label for metrics.
    pub fn status(&self) -> &'static str {
        match self {
            ReservationError::Validation(_) => "invalid",
            ReservationError::Conflict { .. } => "conflict",
            ReservationError::Store(_) => "error",
        }
    }
}

impl std::fmt::Display for ReservationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReservationError::Validation(e) => write!(f, "{e}"),
            ReservationError::Conflict {
                room_id,
                requested,
                existing,
            } => write!(
                f,
                "room {room_id} is already reserved for {existing}; requested {requested}"
            ),
            ReservationError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for ReservationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReservationError::Validation(e) => Some(e),
            ReservationError::Conflict { .. } => None,
            ReservationError::Store(e) => Some(e),
        }
    }
}

impl From<ValidationError> for ReservationError {
    fn from(e: ValidationError) -> Self {
        ReservationError::Validation(e)
    }
}

impl From<StoreError> for ReservationError {
    fn from(e: StoreError) -> Self {
        ReservationError::Store(e)
    }
}

/// Business errors from the unit of work pass through unchanged. Everything
/// that went wrong around it becomes a store error; a failed rollback keeps
/// the triggering error as its cause.
impl From<TxError<ReservationError>> for ReservationError {
    fn from(e: TxError<ReservationError>) -> Self {
        match e {
            TxError::Begin(e) | TxError::Commit(e) => ReservationError::Store(e),
            TxError::Work(e) => e,
            TxError::Rollback { source, rollback } => ReservationError::Store(StoreError::Rollback {
                cause: Box::new(source),
                rollback: Box::new(rollback),
            }),
        }
    }
}
