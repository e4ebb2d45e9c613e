//! Byte-moving I/O worker pool.
//!
//! Workers never execute command logic and never hold a data-store
//! reference; they receive protocol-neutral replies over a channel,
//! serialize them to wire bytes and hand the buffers back. When the
//! pending volume is too small to amortize the handoff the pool marks
//! itself inactive and callers serialize inline instead.

use std::sync::mpsc;
use std::thread;

use ember_common::ids::ClientId;
use ember_core::command::CommandReply;

/// One unit of serialization work.
#[derive(Debug)]
pub enum IoJob {
    /// Encode replies destined for one connection.
    EncodeReplies {
        /// Destination connection.
        client: ClientId,
        /// Replies to serialize, in order.
        replies: Vec<CommandReply>,
    },
}

/// One completed unit of serialization work.
#[derive(Debug, PartialEq, Eq)]
pub struct IoResult {
    /// Destination connection.
    pub client: ClientId,
    /// Serialized wire bytes.
    pub bytes: Vec<u8>,
}

/// Fixed pool of serialization workers.
#[derive(Debug)]
pub struct IoWorkerPool {
    senders: Vec<mpsc::Sender<IoJob>>,
    results: mpsc::Receiver<IoResult>,
    handles: Vec<thread::JoinHandle<()>>,
    next_worker: usize,
    active: bool,
}

impl IoWorkerPool {
    /// Spawns `threads` workers. Zero threads yields an inline-only pool.
    #[must_use]
    pub fn new(threads: usize) -> Self {
        let (result_tx, results) = mpsc::channel::<IoResult>();
        let mut senders = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);
        for _ in 0..threads {
            let (sender, receiver) = mpsc::channel::<IoJob>();
            let worker_results = result_tx.clone();
            senders.push(sender);
            handles.push(thread::spawn(move || worker_loop(&receiver, &worker_results)));
        }

        Self {
            senders,
            results,
            handles,
            next_worker: 0,
            active: threads > 0,
        }
    }

    /// Number of spawned workers.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    /// Whether jobs are currently being handed off at all.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Submits one job. Returns `false` when the pool is inactive and the
    /// caller must serialize inline.
    pub fn submit(&mut self, job: IoJob) -> bool {
        if !self.active || self.senders.is_empty() {
            return false;
        }
        let worker = self.next_worker % self.senders.len();
        self.next_worker = self.next_worker.wrapping_add(1);
        self.senders[worker].send(job).is_ok()
    }

    /// Drains every finished result without blocking.
    #[must_use]
    pub fn drain_results(&mut self) -> Vec<IoResult> {
        let mut drained = Vec::new();
        while let Ok(result) = self.results.try_recv() {
            drained.push(result);
        }
        drained
    }

    /// Suspends the handoff while the pending volume is too small to pay
    /// for it, and resumes once it grows again.
    pub fn adjust_for_load(&mut self, pending: usize) {
        if self.handles.is_empty() {
            return;
        }
        self.active = pending >= self.handles.len() * 2;
    }
}

impl Drop for IoWorkerPool {
    fn drop(&mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(jobs: &mpsc::Receiver<IoJob>, results: &mpsc::Sender<IoResult>) {
    for job in jobs {
        match job {
            IoJob::EncodeReplies { client, replies } => {
                let mut bytes = Vec::new();
                for reply in &replies {
                    bytes.extend_from_slice(&reply.to_resp_bytes());
                }
                if results.send(IoResult { client, bytes }).is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{IoJob, IoWorkerPool};
    use ember_core::command::CommandReply;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::time::{Duration, Instant};

    #[rstest]
    fn workers_serialize_replies_off_thread() {
        let mut pool = IoWorkerPool::new(2);
        let submitted = pool.submit(IoJob::EncodeReplies {
            client: 7,
            replies: vec![CommandReply::ok(), CommandReply::Integer(3)],
        });
        assert_that!(submitted, eq(true));

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut results = Vec::new();
        while results.is_empty() && Instant::now() < deadline {
            results = pool.drain_results();
        }
        assert_that!(results.len(), eq(1_usize));
        assert_that!(results[0].client, eq(7_u64));
        assert_that!(&results[0].bytes, eq(&b"+OK\r\n:3\r\n".to_vec()));
    }

    #[rstest]
    fn an_empty_pool_forces_inline_serialization() {
        let mut pool = IoWorkerPool::new(0);
        let submitted = pool.submit(IoJob::EncodeReplies {
            client: 1,
            replies: vec![CommandReply::ok()],
        });
        assert_that!(submitted, eq(false));
    }

    #[rstest]
    fn load_adjustment_suspends_and_resumes_the_handoff() {
        let mut pool = IoWorkerPool::new(2);
        pool.adjust_for_load(1);
        assert_that!(pool.is_active(), eq(false));
        pool.adjust_for_load(16);
        assert_that!(pool.is_active(), eq(true));
    }
}
