//! Background chunk loader
//!
//! A single worker thread advances the load state machine of chunks handed
//! to it by the selection. Each frame the selection replaces the whole work
//! list, so chunks that fell out of view are never loaded further. The
//! worker pops from the back; submit nearest-last.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crate::chunk::{Chunk, LoadContext};
use crate::core::types::Result;
use crate::store::ChunkStore;

/// Shared handle to a resident chunk
pub type SharedChunk = Arc<Mutex<Chunk>>;

/// Lock a chunk, recovering the data from a panicked holder
pub fn lock_chunk(chunk: &SharedChunk) -> MutexGuard<'_, Chunk> {
    chunk.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct WorkQueue {
    work: Vec<SharedChunk>,
    shutdown: bool,
}

#[derive(Default)]
struct LoaderShared {
    queue: Mutex<WorkQueue>,
    wake: Condvar,
}

impl LoaderShared {
    fn lock(&self) -> MutexGuard<'_, WorkQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ChunkLoader {
    shared: Arc<LoaderShared>,
    thread: Option<JoinHandle<()>>,
}

impl ChunkLoader {
    /// Start the worker thread
    ///
    /// # Arguments
    /// * `store` - Store the chunks are read from
    /// * `leaf_level` - Level whose chunks are persisted
    /// * `max_aggregate_levels` - Coarse chunks further above the leaf level load empty
    pub fn spawn(store: Arc<dyn ChunkStore>, leaf_level: u8, max_aggregate_levels: u8) -> Result<Self> {
        let shared = Arc::new(LoaderShared::default());
        let worker = shared.clone();

        let thread = std::thread::Builder::new()
            .name("chunk-loader".into())
            .spawn(move || run(&worker, store.as_ref(), leaf_level, max_aggregate_levels))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Replace the work list and wake the worker
    pub fn submit(&self, work: Vec<SharedChunk>) {
        let stale = {
            let mut queue = self.shared.lock();
            std::mem::replace(&mut queue.work, work)
        };
        self.shared.wake.notify_one();
        // Dropped outside the lock
        drop(stale);
    }

    /// Chunks still waiting for a load step
    pub fn queued(&self) -> usize {
        self.shared.lock().work.len()
    }

    /// Stop the worker and wait for its current step to finish
    pub fn shutdown(&mut self) {
        {
            let mut queue = self.shared.lock();
            queue.shutdown = true;
            queue.work.clear();
        }
        self.shared.wake.notify_all();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Chunk loader thread panicked");
            }
        }
    }
}

impl Drop for ChunkLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &LoaderShared, store: &dyn ChunkStore, leaf_level: u8, max_aggregate_levels: u8) {
    let ctx = LoadContext {
        store,
        leaf_level,
        max_aggregate_levels,
    };
    log::info!("Chunk loader started");

    loop {
        let chunk = {
            let mut queue = shared.lock();
            loop {
                if queue.shutdown {
                    log::info!("Chunk loader stopped");
                    return;
                }
                if let Some(chunk) = queue.work.pop() {
                    break chunk;
                }
                queue = shared.wake.wait(queue).unwrap_or_else(PoisonError::into_inner);
            }
        };

        lock_chunk(&chunk).background_load(&ctx);
    }
}
