// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Deferred completion of requests in a globally determined order.
//!
//! A request registers its sequence id with [`EventRelay::block_event`] and
//! awaits the returned [`EventWait`]. It only resumes once the checkpoint
//! mechanism releases that id. Resumption follows release order, whatever
//! order the requests were issued or finished in.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Releases kept until [`EventRelay::take_log`] collects them.
const MAX_LOG_LEN: usize = 1 << 20;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplayMode {
    /// Requests are released in the order they reached the relay, and that
    /// order is logged.
    #[default]
    Record,
    /// Requests are released in the order of a previously recorded log.
    Replay,
}

#[derive(Default)]
struct RelayState {
    next_request_id: u64,
    waiting: BTreeMap<u64, oneshot::Sender<()>>,
    arrival: VecDeque<u64>,
    released_early: BTreeSet<u64>,
    /// Ids below this mark that are neither waiting nor released early
    /// have completed.
    watermark: u64,
    /// Completed ids at or above `watermark`.
    fired: BTreeSet<u64>,
    script: VecDeque<u64>,
    released: u64,
    log: Vec<u64>,
}

impl RelayState {
    fn has_fired(&self, id: u64) -> bool {
        if id < self.watermark {
            !self.waiting.contains_key(&id) && !self.released_early.contains(&id)
        } else {
            self.fired.contains(&id)
        }
    }

    /// Marks `id` completed and forgets completed ids below the lowest one
    /// still outstanding.
    fn fire(&mut self, id: u64) {
        self.fired.insert(id);

        let outstanding = [
            self.waiting.keys().next().copied(),
            self.released_early.first().copied(),
            self.fired.last().map(|last| last + 1),
        ];
        let low = outstanding.into_iter().flatten().min().unwrap_or(id + 1);
        if low > self.watermark {
            self.watermark = low;
            self.fired = self.fired.split_off(&low);
        }
    }
}

pub struct EventRelay {
    mode: ReplayMode,
    state: Mutex<RelayState>,
}

impl EventRelay {
    pub fn new(mode: ReplayMode) -> Self {
        EventRelay {
            mode,
            state: Mutex::new(RelayState::default()),
        }
    }

    /// Relay replaying a release order recorded earlier.
    pub fn replaying(script: impl IntoIterator<Item = u64>) -> Self {
        EventRelay {
            mode: ReplayMode::Replay,
            state: Mutex::new(RelayState {
                script: script.into_iter().collect(),
                ..Default::default()
            }),
        }
    }

    pub fn mode(&self) -> ReplayMode {
        self.mode
    }

    /// Hands out the next deterministic sequence id.
    pub fn next_request_id(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_request_id;
        state.next_request_id += 1;
        id
    }

    /// Registers `id` for a single resumption.
    ///
    /// The registration happens immediately, not on first poll, so a
    /// checkpoint running before the task is polled still finds it.
    pub fn block_event(&self, id: u64) -> EventWait {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();

        if state.has_fired(id) || state.waiting.contains_key(&id) {
            return EventWait {
                id,
                inner: Err(Error::InvalidArgument(format!(
                    "Request {id} is already registered with the relay"
                ))),
            };
        }

        if state.released_early.remove(&id) {
            state.fire(id);
            let _ = tx.send(());
        } else {
            state.waiting.insert(id, tx);
            state.arrival.push_back(id);
        }

        EventWait { id, inner: Ok(rx) }
    }

    /// Resumes the task registered for `id`, or remembers the release if
    /// nothing is registered yet. Returns false if `id` was already released.
    pub fn release(&self, id: u64) -> bool {
        let sender = {
            let mut state = self.state.lock().unwrap();
            if state.has_fired(id) || state.released_early.contains(&id) {
                return false;
            }
            state.released += 1;
            if state.log.len() < MAX_LOG_LEN {
                state.log.push(id);
            } else {
                warn!("Release log full, dropping request {id}");
            }
            match state.waiting.remove(&id) {
                Some(sender) => {
                    state.arrival.retain(|&a| a != id);
                    state.fire(id);
                    sender
                }
                None => {
                    state.released_early.insert(id);
                    return true;
                }
            }
        };

        debug!("Releasing request {id}");
        let _ = sender.send(());
        true
    }

    /// Releases every request the checkpoint is allowed to release and
    /// returns how many were released.
    ///
    /// Recording releases registered requests in arrival order. Replaying
    /// follows the script for as long as the next scripted request is
    /// registered.
    pub fn checkpoint(&self) -> usize {
        let mut released = 0;
        loop {
            let next = {
                let mut state = self.state.lock().unwrap();
                match self.mode {
                    ReplayMode::Record => state.arrival.front().copied(),
                    ReplayMode::Replay => match state.script.front().copied() {
                        Some(id) if state.waiting.contains_key(&id) => state.script.pop_front(),
                        _ => None,
                    },
                }
            };

            match next {
                Some(id) => {
                    if self.release(id) {
                        released += 1;
                    }
                }
                None => break,
            }
        }
        released
    }

    /// Sequence ids registered and not released yet, ascending.
    pub fn pending(&self) -> Vec<u64> {
        self.state.lock().unwrap().waiting.keys().copied().collect()
    }

    /// Number of releases since the relay was created.
    pub fn released_count(&self) -> u64 {
        self.state.lock().unwrap().released
    }

    /// Releases since the previous call, in order.
    pub fn take_log(&self) -> Vec<u64> {
        std::mem::take(&mut self.state.lock().unwrap().log)
    }
}

/// Resolves once the relay releases its sequence id.
pub struct EventWait {
    id: u64,
    inner: Result<oneshot::Receiver<()>>,
}

impl Future for EventWait {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        match &mut self.inner {
            Ok(rx) => Pin::new(rx).poll(cx).map(|res| {
                res.map_err(|_| {
                    Error::io(
                        format!("Relay dropped request {id}"),
                        std::io::Error::from(std::io::ErrorKind::Interrupted),
                    )
                })
            }),
            Err(_) => {
                let registration = std::mem::replace(
                    &mut self.inner,
                    Err(Error::InvalidArgument(format!(
                        "Request {id} already completed"
                    ))),
                );
                Poll::Ready(registration.map(drop))
            }
        }
    }
}
