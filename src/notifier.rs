// src/notifier.rs
//! Serial fan-out of agent events to user handlers.
//!
//! Handlers must never run on the event loop: a handler that calls back
//! into the agent would deadlock against the task queue. Each notifier owns
//! a dispatch task that drains an unbounded queue and invokes the current
//! handler one event at a time, so callbacks never overlap.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handler callback type
pub type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Queue + dispatch task for one event kind
pub struct Notifier<T: Send + 'static> {
    tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
    handler: Arc<RwLock<Option<Handler<T>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Notifier<T> {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let handler: Arc<RwLock<Option<Handler<T>>>> = Arc::new(RwLock::new(None));

        let dispatch_handler = handler.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let current = dispatch_handler.read().clone();
                if let Some(handler) = current {
                    handler(event);
                }
            }
        });

        Self {
            tx: Mutex::new(Some(tx)),
            handler,
            task: Mutex::new(Some(task)),
        }
    }

    /// Install or replace the handler
    pub fn set_handler(&self, handler: Handler<T>) {
        *self.handler.write() = Some(handler);
    }

    /// Enqueue an event for dispatch. Never blocks.
    pub fn enqueue(&self, event: T) {
        if let Some(tx) = &*self.tx.lock() {
            let _ = tx.send(event);
        }
    }

    /// Close the notifier. A graceful close delivers every queued event
    /// before returning; an immediate close abandons the queue.
    pub async fn close(&self, graceful: bool) {
        // Dropping the sender ends the dispatch loop once the queue drains
        self.tx.lock().take();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if graceful {
                let _ = task.await;
            } else {
                task.abort();
            }
        }
    }
}

impl<T: Send + 'static> Default for Notifier<T> {
    fn default() -> Self {
        Self::new()
    }
}
