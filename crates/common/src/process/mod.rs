//! Reversible multi-step processes
//!
//! A process is a tree of components:
//! - **Step**: one unit of work that knows how to undo itself
//! - **Sequence**: children run in order
//! - **Decision**: a branch picked at run time from state earlier steps produced
//!
//! The executor runs the tree on a tokio task. When any step fails, every
//! step that already completed is rolled back in reverse completion order,
//! then listeners hear about the failure and the rollback. Pause, cancel and
//! the process timeout are only looked at between steps, so an in-flight
//! network call is never interrupted.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::SyncError;

mod executor;
mod handle;
mod listener;

pub use executor::Process;
pub use handle::ProcessHandle;
pub use listener::ProcessListener;

/// One reversible unit of work
#[async_trait]
pub trait Step: Send {
    fn name(&self) -> &str;

    async fn execute(&mut self) -> Result<(), SyncError>;

    /// Undo a successful `execute`. Only called on steps that completed
    async fn rollback(&mut self) -> Result<(), SyncError> {
        Ok(())
    }
}

type Predicate = Box<dyn FnOnce() -> bool + Send>;

pub enum ProcessComponent {
    Step(Box<dyn Step>),
    Sequence(Vec<ProcessComponent>),
    Decision {
        predicate: Predicate,
        then: Box<ProcessComponent>,
        otherwise: Box<ProcessComponent>,
    },
}

impl fmt::Debug for ProcessComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessComponent::Step(step) => write!(f, "Step({})", step.name()),
            ProcessComponent::Sequence(children) => f.debug_list().entries(children).finish(),
            ProcessComponent::Decision {
                then, otherwise, ..
            } => f
                .debug_struct("Decision")
                .field("then", then)
                .field("otherwise", otherwise)
                .finish(),
        }
    }
}

impl ProcessComponent {
    pub fn step(step: impl Step + 'static) -> Self {
        ProcessComponent::Step(Box::new(step))
    }

    pub fn sequence(children: impl IntoIterator<Item = ProcessComponent>) -> Self {
        ProcessComponent::Sequence(children.into_iter().collect())
    }

    /// `predicate` is evaluated when execution reaches the decision, not before
    pub fn decision(
        predicate: impl FnOnce() -> bool + Send + 'static,
        then: ProcessComponent,
        otherwise: ProcessComponent,
    ) -> Self {
        ProcessComponent::Decision {
            predicate: Box::new(predicate),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    /// A branch that does nothing
    pub fn nothing() -> Self {
        ProcessComponent::Sequence(Vec::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Created,
    Running,
    Paused,
    Succeeded,
    Failed,
    /// Failed, and compensation has finished
    RolledBack,
}

impl ProcessState {
    /// No further transitions will happen
    pub fn is_done(&self) -> bool {
        matches!(self, ProcessState::Succeeded | ProcessState::RolledBack)
    }
}

/// What a successful process did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Outcome {
    #[default]
    Applied,
    /// Nothing needed doing, e.g. the content was already in place
    NoOp,
}

/// Lets a step report a different outcome than `Applied`
#[derive(Debug, Clone, Default)]
pub struct OutcomeCell(Arc<Mutex<Outcome>>);

impl OutcomeCell {
    pub fn set(&self, outcome: Outcome) {
        *self.0.lock() = outcome;
    }

    pub fn get(&self) -> Outcome {
        *self.0.lock()
    }
}

/// Result of compensating a failed process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    /// Steps undone, in the order they were undone
    pub rolled_back: Vec<String>,
    /// Steps whose rollback itself failed
    pub failures: Vec<(String, SyncError)>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}
