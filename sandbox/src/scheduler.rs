//! Cooperative promise scheduler.
//!
//! The scheduler owns every promise of a run, the join records created by
//! `all`, and a FIFO job queue. Guest code never runs inside the
//! scheduler: [`Scheduler::poll`] hands back a [`Task`] whenever a guest
//! continuation must run, and the runtime reports the task's outcome via
//! [`Scheduler::resolve`] or [`Scheduler::reject`].
//!
//! Ordering rules:
//!
//! - Settling a promise queues its reactions in attachment order.
//! - Attaching a reaction to an already-settled promise queues it at once.
//! - Jobs run strictly in queue order, so ties between continuations whose
//!   dependencies settled in the same turn are broken by enqueue order.
//!
//! `K` is the continuation payload; the runtime uses a typed guest export.

use std::collections::VecDeque;

use keel_hostapi::{PromiseId, Value};

/// State of one promise. Leaves `Pending` exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum PromiseState {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

impl PromiseState {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone)]
enum Outcome {
    Fulfilled(Value),
    Rejected(Value),
}

enum Reaction<K> {
    Then {
        on_fulfilled: Option<K>,
        on_rejected: Option<K>,
        derived: PromiseId,
    },
    Join {
        join: usize,
        index: usize,
    },
}

struct Job<K> {
    reaction: Reaction<K>,
    outcome: Outcome,
}

struct PromiseSlot<K> {
    state: PromiseState,
    reactions: Vec<Reaction<K>>,
    /// Set once any reaction is attached. Rejections of handled promises
    /// are passed on instead of being reported.
    handled: bool,
}

struct Join {
    target: PromiseId,
    results: Vec<Option<Value>>,
    remaining: usize,
}

/// A guest continuation that is ready to run.
#[derive(Debug, Clone)]
pub struct Task<K> {
    pub continuation: K,
    /// Fulfilment value, or rejection reason when `rejected` is set.
    pub argument: Value,
    /// Promise to settle with the continuation's result.
    pub derived: PromiseId,
    /// True when this is a rejection handler receiving a reason.
    pub rejected: bool,
}

pub struct Scheduler<K> {
    promises: Vec<PromiseSlot<K>>,
    joins: Vec<Join>,
    queue: VecDeque<Job<K>>,
}

impl<K> Default for Scheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Scheduler<K> {
    pub fn new() -> Self {
        Self {
            promises: Vec::new(),
            joins: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    /// Create a pending promise.
    pub fn create(&mut self) -> PromiseId {
        let id = PromiseId(self.promises.len() as u32);
        self.promises.push(PromiseSlot {
            state: PromiseState::Pending,
            reactions: Vec::new(),
            handled: false,
        });
        id
    }

    /// `Promise.resolve`: promises pass through unchanged.
    pub fn resolved(&mut self, value: Value) -> PromiseId {
        if let Value::Promise(id) = value {
            return id;
        }
        let id = self.create();
        self.fulfill(id, value);
        id
    }

    /// `Promise.reject`.
    pub fn rejected(&mut self, reason: Value) -> PromiseId {
        let id = self.create();
        self.reject(id, reason);
        id
    }

    pub fn state(&self, id: PromiseId) -> Option<&PromiseState> {
        self.promises.get(id.index()).map(|slot| &slot.state)
    }

    /// Resolve `id` with `value`, adopting the state of `value` when it is
    /// itself a promise.
    pub fn resolve(&mut self, id: PromiseId, value: Value) {
        match value {
            Value::Promise(other) if other == id => {
                self.reject(id, Value::from("TypeError: promise resolved with itself"));
            }
            Value::Promise(other) => {
                self.attach(
                    other,
                    Reaction::Then {
                        on_fulfilled: None,
                        on_rejected: None,
                        derived: id,
                    },
                );
            }
            value => self.settle(id, Outcome::Fulfilled(value)),
        }
    }

    /// Fulfil without adoption.
    pub fn fulfill(&mut self, id: PromiseId, value: Value) {
        self.settle(id, Outcome::Fulfilled(value));
    }

    pub fn reject(&mut self, id: PromiseId, reason: Value) {
        self.settle(id, Outcome::Rejected(reason));
    }

    /// Register continuations on `promise`; returns the derived promise
    /// settled with the continuation's result.
    pub fn then(
        &mut self,
        promise: PromiseId,
        on_fulfilled: Option<K>,
        on_rejected: Option<K>,
    ) -> PromiseId {
        let derived = self.create();
        self.attach(
            promise,
            Reaction::Then {
                on_fulfilled,
                on_rejected,
                derived,
            },
        );
        derived
    }

    /// Join: fulfils with every operand's value in operand order, or
    /// rejects with the earliest rejection in operand order among those
    /// queued in the same turn.
    pub fn all(&mut self, operands: &[PromiseId]) -> PromiseId {
        let target = self.create();
        if operands.is_empty() {
            self.fulfill(target, Value::List(Vec::new()));
            return target;
        }
        let join = self.joins.len();
        self.joins.push(Join {
            target,
            results: vec![None; operands.len()],
            remaining: operands.len(),
        });
        for (index, operand) in operands.iter().enumerate() {
            self.attach(*operand, Reaction::Join { join, index });
        }
        target
    }

    /// Mark a promise as observed by the host, so its rejection is not
    /// reported as unhandled.
    pub fn mark_handled(&mut self, id: PromiseId) {
        if let Some(slot) = self.promises.get_mut(id.index()) {
            slot.handled = true;
        }
    }

    /// Number of promises still pending.
    pub fn pending_count(&self) -> usize {
        self.promises.iter().filter(|s| s.state.is_pending()).count()
    }

    /// Run queued jobs until one needs guest code. Joins and pass-through
    /// reactions are processed here. Returns `None` when the queue is empty.
    pub fn poll(&mut self) -> Option<Task<K>> {
        while let Some(job) = self.queue.pop_front() {
            match job.reaction {
                Reaction::Join { join, index } => self.run_join(join, index, job.outcome),
                Reaction::Then {
                    on_fulfilled,
                    on_rejected,
                    derived,
                } => match job.outcome {
                    Outcome::Fulfilled(value) => match on_fulfilled {
                        Some(continuation) => {
                            return Some(Task {
                                continuation,
                                argument: value,
                                derived,
                                rejected: false,
                            })
                        }
                        None => self.fulfill(derived, value),
                    },
                    Outcome::Rejected(reason) => match on_rejected {
                        Some(continuation) => {
                            return Some(Task {
                                continuation,
                                argument: reason,
                                derived,
                                rejected: true,
                            })
                        }
                        None => self.reject(derived, reason),
                    },
                },
            }
        }
        None
    }

    /// First rejected promise (in creation order) nobody handled.
    pub fn unhandled(&self) -> Option<(PromiseId, &Value)> {
        self.promises
            .iter()
            .enumerate()
            .find_map(|(i, slot)| match &slot.state {
                PromiseState::Rejected(reason) if !slot.handled => {
                    Some((PromiseId(i as u32), reason))
                }
                _ => None,
            })
    }

    /// Report the first unhandled rejection, then mark every rejected
    /// promise handled so later checks only see new rejections.
    pub fn take_unhandled(&mut self) -> Option<Value> {
        let reason = self.unhandled().map(|(_, reason)| reason.clone())?;
        for slot in &mut self.promises {
            if matches!(slot.state, PromiseState::Rejected(_)) {
                slot.handled = true;
            }
        }
        Some(reason)
    }

    /// Drop every queued job. Used after a fault leaves a turn unfinished.
    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    fn attach(&mut self, promise: PromiseId, reaction: Reaction<K>) {
        let slot = match self.promises.get_mut(promise.index()) {
            Some(slot) => slot,
            None => return,
        };
        slot.handled = true;
        let outcome = match &slot.state {
            PromiseState::Pending => {
                slot.reactions.push(reaction);
                return;
            }
            PromiseState::Fulfilled(value) => Outcome::Fulfilled(value.clone()),
            PromiseState::Rejected(reason) => Outcome::Rejected(reason.clone()),
        };
        self.queue.push_back(Job { reaction, outcome });
    }

    fn settle(&mut self, id: PromiseId, outcome: Outcome) {
        let slot = match self.promises.get_mut(id.index()) {
            Some(slot) => slot,
            None => return,
        };
        if !slot.state.is_pending() {
            return;
        }
        slot.state = match &outcome {
            Outcome::Fulfilled(value) => PromiseState::Fulfilled(value.clone()),
            Outcome::Rejected(reason) => PromiseState::Rejected(reason.clone()),
        };
        let reactions = std::mem::take(&mut slot.reactions);
        for reaction in reactions {
            self.queue.push_back(Job {
                reaction,
                outcome: outcome.clone(),
            });
        }
    }

    fn run_join(&mut self, join: usize, index: usize, outcome: Outcome) {
        let record = match self.joins.get_mut(join) {
            Some(record) => record,
            None => return,
        };
        let target = record.target;
        match outcome {
            Outcome::Fulfilled(value) => {
                record.results[index] = Some(value);
                record.remaining -= 1;
                if record.remaining == 0 {
                    let values = record
                        .results
                        .iter_mut()
                        .map(|v| v.take().unwrap_or_default())
                        .collect();
                    self.fulfill(target, Value::List(values));
                }
            }
            Outcome::Rejected(reason) => {
                let reason = self.earliest_queued_rejection(join, index).unwrap_or(reason);
                self.reject(target, reason);
            }
        }
    }

    /// Among rejections of `join` already queued in this turn, the reason of
    /// the one with the lowest operand index below `index`.
    fn earliest_queued_rejection(&self, join: usize, index: usize) -> Option<Value> {
        self.queue
            .iter()
            .filter_map(|job| match (&job.reaction, &job.outcome) {
                (Reaction::Join { join: j, index: i }, Outcome::Rejected(reason))
                    if *j == join && *i < index =>
                {
                    Some((*i, reason))
                }
                _ => None,
            })
            .min_by_key(|(i, _)| *i)
            .map(|(_, reason)| reason.clone())
    }
}
