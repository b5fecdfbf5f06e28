//! Producer evaluator (spec §4.3): stateless over input, reads and writes
//! the producer row. Classifies an incoming `(id, epoch, seq)` against the
//! stream's current producer state.

use crate::error::{header_name, AppError};
use crate::hot_storage::ProducerState;

#[derive(Debug)]
pub enum Decision {
    /// No producer headers were supplied; nothing to evaluate.
    None,
    /// Accept as a new append; the caller should upsert the producer row.
    Accept,
    /// Idempotent replay: return the previously committed offset, create
    /// no new op, and leave producer state unchanged.
    Duplicate { offset: i64 },
    Error(AppError),
}

/// `state` must already have been dropped by the caller if it is older
/// than the expiry window (spec step 1: "now − last_updated > 7d" is a
/// lazy-delete condition evaluated by the sequencer, not this pure
/// function — see `sequencer::touch_producer`).
pub fn evaluate(state: Option<&ProducerState>, id: &str, epoch: i64, seq: i64) -> Decision {
    let Some(state) = state else {
        return if seq == 0 {
            Decision::Accept
        } else {
            Decision::Error(AppError::bad_input("unknown producer, seq must start at 0"))
        };
    };
    debug_assert_eq!(state.producer_id, id);

    if epoch < state.epoch {
        return Decision::Error(
            AppError::forbidden(format!(
                "epoch {epoch} is behind current epoch {}",
                state.epoch
            ))
            .with_header(header_name("Producer-Epoch"), state.epoch.to_string()),
        );
    }
    if epoch > state.epoch {
        return if seq == 0 {
            Decision::Accept
        } else {
            Decision::Error(AppError::bad_input("epoch reset requires seq to start at 0"))
        };
    }

    if seq <= state.last_seq {
        return Decision::Duplicate { offset: state.last_offset };
    }
    if seq == state.last_seq + 1 {
        return Decision::Accept;
    }
    Decision::Error(
        AppError::conflict(format!(
            "producer seq gap: expected {}, received {seq}",
            state.last_seq + 1
        ))
        .with_header(header_name("Producer-Expected-Seq"), (state.last_seq + 1).to_string())
        .with_header(header_name("Producer-Received-Seq"), seq.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(epoch: i64, last_seq: i64, last_offset: i64) -> ProducerState {
        ProducerState {
            producer_id: "p1".into(),
            epoch,
            last_seq,
            last_offset,
            last_updated: 0,
        }
    }

    #[test]
    fn absent_producer_accepts_only_seq_zero() {
        assert!(matches!(evaluate(None, "p1", 1, 0), Decision::Accept));
        assert!(matches!(evaluate(None, "p1", 1, 1), Decision::Error(_)));
    }

    #[test]
    fn lower_epoch_is_forbidden() {
        let s = state(5, 0, 100);
        assert!(matches!(evaluate(Some(&s), "p1", 4, 0), Decision::Error(_)));
    }

    #[test]
    fn higher_epoch_resets_only_at_seq_zero() {
        let s = state(1, 3, 100);
        assert!(matches!(evaluate(Some(&s), "p1", 2, 0), Decision::Accept));
        assert!(matches!(evaluate(Some(&s), "p1", 2, 1), Decision::Error(_)));
    }

    #[test]
    fn same_epoch_duplicate_returns_prior_offset() {
        let s = state(1, 5, 999);
        match evaluate(Some(&s), "p1", 1, 5) {
            Decision::Duplicate { offset } => assert_eq!(offset, 999),
            other => panic!("expected Duplicate, got {other:?}"),
        }
        match evaluate(Some(&s), "p1", 1, 3) {
            Decision::Duplicate { offset } => assert_eq!(offset, 999),
            other => panic!("expected Duplicate, got {other:?}"),
        }
    }

    #[test]
    fn same_epoch_next_seq_accepts() {
        let s = state(1, 5, 999);
        assert!(matches!(evaluate(Some(&s), "p1", 1, 6), Decision::Accept));
    }

    #[test]
    fn same_epoch_seq_gap_errors() {
        let s = state(1, 5, 999);
        assert!(matches!(evaluate(Some(&s), "p1", 1, 8), Decision::Error(_)));
    }
}
