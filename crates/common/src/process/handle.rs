use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use super::{Outcome, ProcessListener, ProcessState, RollbackReport};
use crate::error::SyncError;

/// Requested by a handle, honoured by the executor at the next checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Run,
    Pause,
    Cancel,
}

#[derive(Default)]
struct Record {
    listeners: Vec<Arc<dyn ProcessListener>>,
    succeeded: Option<Outcome>,
    failed: Option<SyncError>,
    rolled_back: Option<RollbackReport>,
}

/// State shared by a process, its executor and every handle to it
pub(crate) struct Shared {
    name: String,
    state: watch::Sender<ProcessState>,
    control: watch::Sender<Control>,
    record: Mutex<Record>,
}

impl Shared {
    pub(crate) fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: watch::Sender::new(ProcessState::Created),
            control: watch::Sender::new(Control::Run),
            record: Mutex::new(Record::default()),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: ProcessState) {
        self.state.send_replace(state);
    }

    pub(crate) fn control(&self) -> watch::Receiver<Control> {
        self.control.subscribe()
    }

    pub(crate) fn finish_succeeded(&self, outcome: Outcome) {
        let listeners = {
            let mut record = self.record.lock();
            record.succeeded = Some(outcome);
            record.listeners.clone()
        };
        self.set_state(ProcessState::Succeeded);
        for listener in listeners {
            listener.on_succeeded(outcome);
        }
    }

    pub(crate) fn finish_failed(&self, error: &SyncError) {
        let listeners = {
            let mut record = self.record.lock();
            record.failed = Some(error.clone());
            record.listeners.clone()
        };
        self.set_state(ProcessState::Failed);
        for listener in listeners {
            listener.on_failed(error);
        }
    }

    pub(crate) fn finish_rolled_back(&self, report: RollbackReport) {
        let listeners = {
            let mut record = self.record.lock();
            record.rolled_back = Some(report.clone());
            record.listeners.clone()
        };
        self.set_state(ProcessState::RolledBack);
        for listener in listeners {
            listener.on_rolled_back(&report);
        }
    }

    fn listen(&self, listener: Arc<dyn ProcessListener>) {
        let (succeeded, failed, rolled_back) = {
            let mut record = self.record.lock();
            record.listeners.push(listener.clone());
            (
                record.succeeded,
                record.failed.clone(),
                record.rolled_back.clone(),
            )
        };
        if let Some(outcome) = succeeded {
            listener.on_succeeded(outcome);
        }
        if let Some(error) = failed {
            listener.on_failed(&error);
        }
        if let Some(report) = rolled_back {
            listener.on_rolled_back(&report);
        }
    }

    fn result(&self) -> Result<Outcome, SyncError> {
        let record = self.record.lock();
        match (&record.succeeded, &record.failed) {
            (Some(outcome), _) => Ok(*outcome),
            (None, Some(error)) => Err(error.clone()),
            (None, None) => Err(SyncError::Cancelled),
        }
    }
}

/// Observe and steer a process from anywhere
#[derive(Clone)]
pub struct ProcessHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.shared.name())
            .field("state", &self.state())
            .finish()
    }
}

impl ProcessHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn state(&self) -> ProcessState {
        self.shared.state()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    pub fn listen(&self, listener: Arc<dyn ProcessListener>) {
        self.shared.listen(listener);
    }

    /// Wait for the process to finish, including any rollback
    ///
    /// Never resolves for a process that is never run.
    pub async fn wait(&self) -> Result<Outcome, SyncError> {
        let mut state = self.shared.state.subscribe();
        // the sender lives in `shared`, which we hold, so this cannot close
        let _ = state.wait_for(|state| state.is_done()).await;
        self.shared.result()
    }

    /// The failure, if the process finished failed within `timeout`
    pub async fn wait_till_failed(&self, timeout: Duration) -> Option<SyncError> {
        tokio::time::timeout(timeout, self.wait()).await.ok()?.err()
    }

    /// The outcome, if the process finished successfully within `timeout`
    pub async fn wait_till_succeeded(&self, timeout: Duration) -> Option<Outcome> {
        tokio::time::timeout(timeout, self.wait()).await.ok()?.ok()
    }

    pub fn pause(&self) {
        self.shared.control.send_if_modified(|control| {
            if *control == Control::Run {
                *control = Control::Pause;
                return true;
            }
            false
        });
    }

    pub fn resume(&self) {
        self.shared.control.send_if_modified(|control| {
            if *control == Control::Pause {
                *control = Control::Run;
                return true;
            }
            false
        });
    }

    /// Takes effect at the next checkpoint and rolls back what already ran
    pub fn cancel(&self) {
        self.shared.control.send_replace(Control::Cancel);
    }
}
