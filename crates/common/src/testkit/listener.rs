use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::SyncError;
use crate::process::{Outcome, ProcessListener, RollbackReport};

/// Counts every notification a process hands out
#[derive(Debug, Default)]
pub struct TestListener {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    rolled_back: AtomicUsize,
    outcome: Mutex<Option<Outcome>>,
    error: Mutex<Option<SyncError>>,
    report: Mutex<Option<RollbackReport>>,
}

impl TestListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn rolled_back(&self) -> usize {
        self.rolled_back.load(Ordering::SeqCst)
    }

    /// `on_succeeded` plus `on_failed` calls; exactly one once a process is done
    pub fn terminal(&self) -> usize {
        self.succeeded() + self.failed()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        *self.outcome.lock()
    }

    pub fn error(&self) -> Option<SyncError> {
        self.error.lock().clone()
    }

    pub fn report(&self) -> Option<RollbackReport> {
        self.report.lock().clone()
    }
}

impl ProcessListener for TestListener {
    fn on_succeeded(&self, outcome: Outcome) {
        self.succeeded.fetch_add(1, Ordering::SeqCst);
        *self.outcome.lock() = Some(outcome);
    }

    fn on_failed(&self, error: &SyncError) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        *self.error.lock() = Some(error.clone());
    }

    fn on_rolled_back(&self, report: &RollbackReport) {
        self.rolled_back.fetch_add(1, Ordering::SeqCst);
        *self.report.lock() = Some(report.clone());
    }
}
