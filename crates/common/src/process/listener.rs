use super::{Outcome, RollbackReport};
use crate::error::SyncError;

/// Observer of a process's terminal events
///
/// Every listener hears exactly one of `on_succeeded` or `on_failed`;
/// `on_rolled_back` follows `on_failed` once compensation is done. A
/// listener attached after the fact is replayed what already happened.
pub trait ProcessListener: Send + Sync {
    fn on_succeeded(&self, _outcome: Outcome) {}

    fn on_failed(&self, _error: &SyncError) {}

    fn on_rolled_back(&self, _report: &RollbackReport) {}
}
