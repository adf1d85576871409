// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! JSON event stream of graph state changes.
//!
//! Every [`BlockGraph`](crate::BlockGraph) owns one [`EventMonitor`]; nodes
//! report through a clone of it. Subscribers receive each event serialised
//! once and shared as an `Arc<String>`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum BlockEvent {
    NodeOpened {
        node: String,
        driver: String,
    },
    NodeClosed {
        node: String,
    },
    SnapshotCreated {
        node: String,
        id: String,
        name: String,
    },
    SnapshotDeleted {
        node: String,
        id: String,
        name: String,
    },
    SnapshotReverted {
        node: String,
        snapshot: String,
    },
    BitmapAdded {
        node: String,
        name: String,
        granularity: u32,
        persistent: bool,
    },
    BitmapRemoved {
        node: String,
        name: String,
    },
    BitmapMerged {
        node: String,
        target: String,
        sources: usize,
    },
}

#[derive(Serialize)]
struct Event<'a> {
    timestamp: Duration,
    source: &'a str,
    #[serde(flatten)]
    event: &'a BlockEvent,
}

struct MonitorInner {
    start: Instant,
    broadcast: Mutex<Vec<flume::Sender<Arc<String>>>>,
}

#[derive(Clone)]
pub struct EventMonitor {
    inner: Arc<MonitorInner>,
}

impl Default for EventMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl EventMonitor {
    pub fn new() -> Self {
        EventMonitor {
            inner: Arc::new(MonitorInner {
                start: Instant::now(),
                broadcast: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<Arc<String>> {
        let (tx, rx) = flume::unbounded();
        self.inner.broadcast.lock().unwrap().push(tx);
        rx
    }

    pub fn emit(&self, event: BlockEvent) {
        let mut broadcast = self.inner.broadcast.lock().unwrap();
        if broadcast.is_empty() {
            return;
        }

        let event = Event {
            timestamp: self.inner.start.elapsed(),
            source: "block",
            event: &event,
        };

        match serde_json::to_string(&event) {
            Ok(event) => {
                let event = Arc::new(event);
                broadcast.retain(|tx| tx.send(Arc::clone(&event)).is_ok());
            }
            Err(e) => warn!("Failed to serialise block event: {e}"),
        }
    }
}
