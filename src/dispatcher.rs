// Copyright 2020 Joyent, Inc.

//! Worker threads and deferred deletion.
//!
//! Each worker runs a single-threaded loop draining a queue of posted
//! closures; a closure runs against the worker's own
//! [`ThreadLocalClusterManager`](../cluster_manager/struct.ThreadLocalClusterManager.html)
//! and nothing else, so no worker state is ever shared. The control plane
//! talks to a worker exclusively by posting.
//!
//! Objects that may still be referenced by the event being processed (a
//! drained connection pool, for instance) are handed to the worker's
//! deferred-delete queue instead of being dropped inline; the queue is
//! emptied after the current event returns.

use std::any::Any;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use slog::{debug, trace, warn, Logger};

use crate::cluster_manager::ThreadLocalClusterManager;

/// A closure run on a worker thread against its thread-local manager.
pub type WorkerTask = Box<dyn FnOnce(&mut ThreadLocalClusterManager) + Send>;

enum WorkerMsg {
    Task(WorkerTask),
    Stop,
}

/// Objects parked here survive until the current event completes, then are
/// dropped in arrival order.
#[derive(Clone)]
pub struct DeferredDeleteQueue(Arc<Mutex<Vec<Box<dyn Any + Send>>>>);

impl DeferredDeleteQueue {
    fn new() -> Self {
        DeferredDeleteQueue(Arc::new(Mutex::new(Vec::new())))
    }

    fn push(&self, item: Box<dyn Any + Send>) {
        self.0.lock().unwrap().push(item);
    }

    fn clear(&self) {
        let items = {
            let mut queue = self.0.lock().unwrap();
            std::mem::replace(&mut *queue, Vec::new())
        };
        drop(items);
    }
}

/// The worker-side dispatcher handle available to thread-local code.
#[derive(Clone)]
pub struct Dispatcher {
    deferred: DeferredDeleteQueue,
    log: Logger,
}

impl Dispatcher {
    /// Park an object until the current event has finished processing.
    pub fn deferred_delete(&self, item: Box<dyn Any + Send>) {
        trace!(self.log, "deferring deletion of event-referenced object");
        self.deferred.push(item);
    }
}

/// Control-plane handle used to post work onto one worker. Cheap to clone;
/// the fan-out path keeps one per worker.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: Sender<WorkerMsg>,
    index: usize,
    log: Logger,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Post a closure onto the worker's queue. Posts to a worker that has
    /// already stopped are dropped; that only happens during teardown.
    pub fn post(&self, task: WorkerTask) {
        if self.tx.send(WorkerMsg::Task(task)).is_err() {
            debug!(self.log, "dropping post to stopped worker");
        }
    }
}

/// One worker thread and its queue. Owned by the cluster manager; the
/// matching [`WorkerHandle`](struct.WorkerHandle.html) is what gets captured
/// by fan-out callbacks.
pub struct Worker {
    handle: WorkerHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker. The builder runs first on the new thread to construct
    /// the thread-local manager, after which the queue drains until `stop`.
    pub fn spawn<B>(index: usize, log: Logger, build: B) -> Worker
    where
        B: FnOnce(Dispatcher) -> ThreadLocalClusterManager + Send + 'static,
    {
        let (tx, rx) = channel();
        let thread_log = log.clone();
        let thread = thread::spawn(move || {
            let deferred = DeferredDeleteQueue::new();
            let dispatcher = Dispatcher {
                deferred: deferred.clone(),
                log: thread_log.clone(),
            };
            let mut manager = build(dispatcher);
            debug!(thread_log, "worker started");

            loop {
                match rx.recv() {
                    Ok(WorkerMsg::Task(task)) => {
                        task(&mut manager);
                        deferred.clear();
                    }
                    Ok(WorkerMsg::Stop) | Err(_) => break,
                }
            }

            manager.shutdown();
            deferred.clear();
            debug!(thread_log, "worker stopped");
        });

        Worker {
            handle: WorkerHandle { tx, index, log },
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn post(&self, task: WorkerTask) {
        self.handle.post(task);
    }

    /// Stop the worker and join its thread. Queued work posted before the
    /// stop is still processed.
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            if self.handle.tx.send(WorkerMsg::Stop).is_err() {
                warn!(self.handle.log, "worker queue already closed at stop");
            }
            let _ = thread.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}
