//! Task lifecycle notifications.

use parking_lot::RwLock;
use tokio::sync::broadcast;

use twinpane_core::{OperationKind, ResultCode, TaskId};

use crate::conflict::ConflictAction;
use crate::prompt::ConflictPrompt;
use crate::task::TaskPhase;

/// Buffered events per subscriber before the slowest one starts lagging.
pub const EVENT_CHANNEL_SIZE: usize = 256;

/// Something that happened to a task.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Started {
        id: TaskId,
        kind: OperationKind,
    },
    PhaseChanged {
        id: TaskId,
        phase: TaskPhase,
    },
    PromptRaised {
        id: TaskId,
        prompt: ConflictPrompt,
    },
    PromptResolved {
        id: TaskId,
        prompt_id: u64,
        action: ConflictAction,
    },
    Completed {
        id: TaskId,
        result: ResultCode,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Started { id, .. }
            | Self::PhaseChanged { id, .. }
            | Self::PromptRaised { id, .. }
            | Self::PromptResolved { id, .. }
            | Self::Completed { id, .. } => *id,
        }
    }
}

/// Broadcast hub that can be closed for good.
///
/// `emit` holds the read lock while sending, so once `close` returns no
/// event can be delivered anymore.
#[derive(Debug)]
pub(crate) struct EventHub {
    sender: RwLock<Option<broadcast::Sender<TaskEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            sender: RwLock::new(Some(sender)),
        }
    }

    pub fn emit(&self, event: TaskEvent) {
        if let Some(sender) = self.sender.read().as_ref() {
            // No subscribers is fine.
            let _ = sender.send(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        match self.sender.read().as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn close(&self) {
        self.sender.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }
}
