use crate::model::{Reservation, ResourceId, TimeInterval};

use super::ReservationError;

/// Fails on the first existing reservation that overlaps `requested`.
pub(crate) fn check_no_conflict(
    room_id: &ResourceId,
    existing: &[Reservation],
    requested: &TimeInterval,
) -> Result<(), ReservationError> {
    match existing.iter().find(|r| r.interval.overlaps(requested)) {
        Some(hit) => Err(ReservationError::Conflict {
            room_id: room_id.clone(),
            requested: *requested,
            existing: hit.interval,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn iv(from: u32, to: u32) -> TimeInterval {
        TimeInterval::new(
            Utc.with_ymd_and_hms(2024, 5, 1, from, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, to, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn rows(spans: &[(u32, u32)]) -> Vec<Reservation> {
        spans
            .iter()
            .enumerate()
            .map(|(i, &(from, to))| Reservation {
                id: i as i64 + 1,
                room_id: ResourceId::new("r").unwrap(),
                interval: iv(from, to),
            })
            .collect()
    }

    #[test]
    fn empty_room_never_conflicts() {
        let room = ResourceId::new("r").unwrap();
        assert!(check_no_conflict(&room, &[], &iv(9, 10)).is_ok());
    }

    #[test]
    fn adjacent_is_free() {
        let room = ResourceId::new("r").unwrap();
        let existing = rows(&[(8, 9), (11, 12)]);
        assert!(check_no_conflict(&room, &existing, &iv(9, 11)).is_ok());
    }

    #[test]
    fn reports_first_overlap() {
        let room = ResourceId::new("r").unwrap();
        let existing = rows(&[(8, 9), (10, 11), (11, 13)]);
        match check_no_conflict(&room, &existing, &iv(10, 12)) {
            Err(ReservationError::Conflict {
                requested, existing, ..
            }) => {
                assert_eq!(requested, iv(10, 12));
                assert_eq!(existing, iv(10, 11));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }
}
