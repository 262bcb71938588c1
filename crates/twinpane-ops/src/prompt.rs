//! Per-task conflict prompt state machine.
//!
//! A task shows at most one prompt at a time. Items that hit a conflict while
//! a prompt is up wait in FIFO order. A decision submitted with apply-to-all
//! is cached for its bucket and answers later conflicts of that bucket
//! without prompting, until the cached action itself fails for an item: then
//! exactly one more prompt is shown (without the cached action and without
//! Retry), and any further failure of that bucket is skipped.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::conflict::{ConflictAction, ConflictBucket};

/// A conflict waiting for the user's decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictPrompt {
    pub id: u64,
    pub bucket: ConflictBucket,
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    /// Actions the UI may offer.
    pub actions: Vec<ConflictAction>,
    /// A Retry of this item already failed.
    pub retry_failed: bool,
    pub message: String,
}

impl ConflictPrompt {
    pub fn offers(&self, action: ConflictAction) -> bool {
        self.actions.contains(&action)
    }
}

/// Errors from [`crate::Task::submit_conflict_decision`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("No conflict prompt is active")]
    NoActivePrompt,

    #[error("{action} is not offered by the active prompt")]
    IllegalAction { action: ConflictAction },
}

/// What an item asks about.
#[derive(Debug, Clone)]
pub(crate) struct ConflictRequest {
    pub bucket: ConflictBucket,
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    pub retry_failed: bool,
    /// The item's previous answer came from the bucket cache and failed
    /// again with the same bucket.
    pub cached_failed: bool,
    pub message: String,
}

/// Answer delivered to a waiting item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Answer {
    pub action: ConflictAction,
    pub from_cache: bool,
}

pub(crate) enum Ticket {
    /// Answered without prompting.
    Ready(Answer),
    /// Wait for the user. `raised` is set when this request became the
    /// active prompt right away.
    Waiting {
        reply: oneshot::Receiver<Answer>,
        raised: Option<ConflictPrompt>,
    },
}

/// Result of a submitted decision.
#[derive(Debug)]
pub(crate) struct Submitted {
    /// Prompt ids answered by this decision, with the action each received.
    pub resolved: Vec<(u64, ConflictAction)>,
    /// Prompt promoted to active.
    pub next: Option<ConflictPrompt>,
}

#[derive(Debug, Clone, Copy)]
struct Cached {
    action: ConflictAction,
    capped: bool,
}

struct Pending {
    prompt: ConflictPrompt,
    reply: oneshot::Sender<Answer>,
}

impl Pending {
    fn answer(self, action: ConflictAction, from_cache: bool) -> (u64, ConflictAction) {
        let id = self.prompt.id;
        // The item may already be gone after a halt.
        let _ = self.reply.send(Answer { action, from_cache });
        (id, action)
    }
}

#[derive(Default)]
struct State {
    active: Option<Pending>,
    queue: VecDeque<Pending>,
    cache: HashMap<ConflictBucket, Cached>,
    next_id: u64,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct PromptBoard {
    state: Mutex<State>,
}

impl std::fmt::Debug for PromptBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PromptBoard")
            .field("active", &state.active.as_ref().map(|p| p.prompt.id))
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl PromptBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, req: ConflictRequest) -> Ticket {
        let mut state = self.state.lock();
        if state.closed {
            return Ticket::Ready(Answer {
                action: ConflictAction::Cancel,
                from_cache: false,
            });
        }

        let mut capped = None;
        if let Some(cached) = state.cache.get_mut(&req.bucket) {
            if !req.cached_failed {
                return Ticket::Ready(Answer {
                    action: cached.action,
                    from_cache: true,
                });
            }
            if cached.capped {
                return Ticket::Ready(Answer {
                    action: ConflictAction::Skip,
                    from_cache: true,
                });
            }
            cached.capped = true;
            capped = Some(cached.action);
        }

        state.next_id += 1;
        let prompt = ConflictPrompt {
            id: state.next_id,
            bucket: req.bucket,
            source: req.source,
            destination: req.destination,
            actions: req.bucket.legal_actions(req.retry_failed, capped),
            retry_failed: req.retry_failed,
            message: req.message,
        };

        let (tx, rx) = oneshot::channel();
        let pending = Pending {
            prompt: prompt.clone(),
            reply: tx,
        };
        let raised = if state.active.is_none() {
            state.active = Some(pending);
            Some(prompt)
        } else {
            state.queue.push_back(pending);
            None
        };
        Ticket::Waiting { reply: rx, raised }
    }

    pub fn submit(
        &self,
        action: ConflictAction,
        apply_to_all: bool,
    ) -> Result<Submitted, PromptError> {
        let mut state = self.state.lock();
        let Some(pending) = state.active.take() else {
            return Err(PromptError::NoActivePrompt);
        };
        if !pending.prompt.offers(action) {
            state.active = Some(pending);
            return Err(PromptError::IllegalAction { action });
        }

        let bucket = pending.prompt.bucket;
        let apply_to_all = apply_to_all || action == ConflictAction::SkipAll;
        let reply = if action == ConflictAction::SkipAll {
            ConflictAction::Skip
        } else {
            action
        };

        let mut resolved = vec![pending.answer(reply, false)];

        if reply == ConflictAction::Cancel {
            resolved.extend(
                state
                    .queue
                    .drain(..)
                    .map(|p| p.answer(ConflictAction::Cancel, false)),
            );
        } else if apply_to_all && reply != ConflictAction::Retry {
            let capped = state.cache.get(&bucket).is_some_and(|c| c.capped);
            state.cache.insert(
                bucket,
                Cached {
                    action: reply,
                    capped,
                },
            );

            let (same, rest): (VecDeque<_>, VecDeque<_>) = state
                .queue
                .drain(..)
                .partition(|p| p.prompt.bucket == bucket);
            state.queue = rest;
            for p in same {
                let answer = if p.prompt.offers(reply) {
                    reply
                } else {
                    ConflictAction::Skip
                };
                resolved.push(p.answer(answer, true));
            }
        }

        let next = state.queue.pop_front();
        let next_prompt = next.as_ref().map(|p| p.prompt.clone());
        state.active = next;

        Ok(Submitted {
            resolved,
            next: next_prompt,
        })
    }

    /// Answer everything with Cancel and refuse later requests.
    pub fn cancel_all(&self) -> Vec<(u64, ConflictAction)> {
        let mut state = self.state.lock();
        state.closed = true;
        let active = state.active.take();
        active
            .into_iter()
            .chain(state.queue.drain(..))
            .map(|p| p.answer(ConflictAction::Cancel, false))
            .collect()
    }

    pub fn active(&self) -> Option<ConflictPrompt> {
        self.state.lock().active.as_ref().map(|p| p.prompt.clone())
    }

    pub fn has_active(&self) -> bool {
        self.state.lock().active.is_some()
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Cached apply-to-all action for a bucket.
    pub fn cached(&self, bucket: ConflictBucket) -> Option<ConflictAction> {
        self.state.lock().cache.get(&bucket).map(|c| c.action)
    }
}
