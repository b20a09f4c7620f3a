// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Dependency-aware job queue.
//!
//! A job becomes runnable once every job it depends on has completed. Workers pick runnable jobs
//! in the order they became runnable. With zero workers, jobs run on the thread that made them
//! runnable, ie. inside [`ThreadQueue::submit`].
//!
//! Completion is observed through a [`JobHandle`], which blocks in [`JobHandle::wait`] until the
//! job and therefore all of its transitive dependencies are done.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread::JoinHandle;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("job failed: {0}")]
    Failed(String),
    #[error("a job this job depends on failed")]
    DependencyFailed,
    #[error("job panicked")]
    Panicked,
    #[error("job was cancelled before it could run")]
    Cancelled,
    #[error("job output was already taken")]
    Taken,
}

pub type JobResult<T> = Result<T, JobError>;

/// Trait for representing pending work.
pub trait Promise {
    type Output;

    /// Return result of the processing. Blocks if processing is not finished yet.
    fn sync(self) -> JobResult<Self::Output>;

    /// Return true whenever the underlaying processing is done
    fn is_ready(&self) -> bool;
}

/// A [`Promise`] whose output is already available.
pub struct ReadyPromise<T>(T);

impl<T> From<T> for ReadyPromise<T> {
    fn from(value: T) -> Self {
        ReadyPromise(value)
    }
}

impl<T> Promise for ReadyPromise<T> {
    type Output = T;

    fn sync(self) -> JobResult<Self::Output> {
        Ok(self.0)
    }

    fn is_ready(&self) -> bool {
        true
    }
}

type Work<T> = Box<dyn FnOnce() -> JobResult<T> + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    /// Waiting for dependencies
    Waiting,
    /// In the ready queue or running
    Ready,
    Done,
}

struct NodeState {
    status: Status,
    /// Dependencies not completed yet, plus one while the job is being submitted
    pending_deps: usize,
    dep_failed: bool,
    failed: bool,
    dependents: Vec<Arc<dyn Runnable>>,
}

/// Type independent scheduling state of a job.
struct JobNode {
    id: usize,
    state: Mutex<NodeState>,
    done: Condvar,
}

impl JobNode {
    /// Records the completion of one dependency. Returns true if the job became runnable.
    fn dependency_done(&self, ok: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        state.pending_deps -= 1;
        state.dep_failed |= !ok;

        if state.pending_deps == 0 && state.status == Status::Waiting {
            state.status = Status::Ready;
            return true;
        }

        false
    }

    /// Marks the job done, wakes up waiters and returns the jobs depending on it.
    fn complete(&self, ok: bool) -> Vec<Arc<dyn Runnable>> {
        let mut state = self.state.lock().unwrap();
        state.status = Status::Done;
        state.failed = !ok;
        self.done.notify_all();

        std::mem::take(&mut state.dependents)
    }

    fn wait_done(&self) {
        let mut state = self.state.lock().unwrap();
        while state.status != Status::Done {
            state = self.done.wait(state).unwrap();
        }
    }

    fn is_done(&self) -> bool {
        self.state.lock().unwrap().status == Status::Done
    }
}

trait Runnable: Send + Sync {
    fn node(&self) -> &JobNode;

    /// Runs the work, stores its output and returns whether it succeeded.
    fn run(&self) -> bool;

    /// Drops the work without running it.
    fn cancel(&self);
}

struct Job<T> {
    node: JobNode,
    work: Mutex<Option<Work<T>>>,
    output: Mutex<Option<JobResult<T>>>,
}

impl<T: Send + 'static> Runnable for Job<T> {
    fn node(&self) -> &JobNode {
        &self.node
    }

    fn run(&self) -> bool {
        let dep_failed = self.node.state.lock().unwrap().dep_failed;
        let work = self.work.lock().unwrap().take();

        let result = match work {
            Some(_) if dep_failed => Err(JobError::DependencyFailed),
            Some(work) => std::panic::catch_unwind(AssertUnwindSafe(work))
                .unwrap_or(Err(JobError::Panicked)),
            None => Err(JobError::Cancelled),
        };

        let ok = result.is_ok();
        if let Err(e) = &result {
            log::debug!("job {} failed: {e}", self.node.id);
        }

        *self.output.lock().unwrap() = Some(result);
        ok
    }

    fn cancel(&self) {
        self.work.lock().unwrap().take();
        *self.output.lock().unwrap() = Some(Err(JobError::Cancelled));
    }
}

/// Dependency on a submitted job, obtained with [`JobHandle::dep`].
#[derive(Clone)]
pub struct Dep(Arc<dyn Runnable>);

/// Handle to a submitted job.
pub struct JobHandle<T>(Arc<Job<T>>);

impl<T> Clone for JobHandle<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Send + 'static> JobHandle<T> {
    /// Returns true once the job has completed, successfully or not.
    pub fn is_ready(&self) -> bool {
        self.0.node.is_done()
    }

    /// Blocks until the job has completed and returns a copy of its output.
    pub fn wait(&self) -> JobResult<T>
    where
        T: Clone,
    {
        self.0.node.wait_done();
        self.0
            .output
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(Err(JobError::Taken))
    }

    /// Blocks until the job has completed and moves its output out. Only the first call gets
    /// the output, later ones fail with [`JobError::Taken`].
    pub fn take(&self) -> JobResult<T> {
        self.0.node.wait_done();
        self.0
            .output
            .lock()
            .unwrap()
            .take()
            .unwrap_or(Err(JobError::Taken))
    }

    /// Returns a dependency on this job for [`ThreadQueue::submit`].
    pub fn dep(&self) -> Dep {
        Dep(self.0.clone())
    }
}

impl<T: Send + 'static> Promise for JobHandle<T> {
    type Output = T;

    fn sync(self) -> JobResult<T> {
        self.take()
    }

    fn is_ready(&self) -> bool {
        JobHandle::is_ready(self)
    }
}

struct QueueState {
    ready: VecDeque<Arc<dyn Runnable>>,
    stopping: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    work_available: Condvar,
}

impl Shared {
    fn push(&self, job: Arc<dyn Runnable>) {
        log::trace!("job {} is ready", job.node().id);
        self.state.lock().unwrap().ready.push_back(job);
        self.work_available.notify_one();
    }

    fn pop(&self) -> Option<Arc<dyn Runnable>> {
        self.state.lock().unwrap().ready.pop_front()
    }

    fn execute(&self, job: Arc<dyn Runnable>) {
        let ok = job.run();
        for dependent in job.node().complete(ok) {
            if dependent.node().dependency_done(ok) {
                self.push(dependent);
            }
        }
    }

    fn worker_loop(&self) {
        loop {
            let job = {
                let mut state = self.state.lock().unwrap();
                loop {
                    if state.stopping {
                        return;
                    }
                    if let Some(job) = state.ready.pop_front() {
                        break job;
                    }
                    state = self.work_available.wait(state).unwrap();
                }
            };

            self.execute(job);
        }
    }
}

pub struct ThreadQueue {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    next_id: AtomicUsize,
}

impl ThreadQueue {
    /// Creates a queue served by `threads` workers. With 0 workers jobs run inline.
    pub fn new(threads: usize) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                ready: Default::default(),
                stopping: false,
            }),
            work_available: Condvar::new(),
        });

        let mut queue = Self {
            shared,
            workers: Vec::with_capacity(threads),
            next_id: AtomicUsize::new(0),
        };

        for i in 0..threads {
            let shared = Arc::clone(&queue.shared);
            let worker = std::thread::Builder::new()
                .name(format!("owf-worker-{i}"))
                .spawn(move || shared.worker_loop())?;
            queue.workers.push(worker);
        }

        log::debug!("started job queue with {threads} workers");

        Ok(queue)
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Submits `work` to run once all of `deps` have completed. If any of them failed, `work` is
    /// dropped and the job fails with [`JobError::DependencyFailed`].
    pub fn submit<T, F>(&self, deps: impl IntoIterator<Item = Dep>, work: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> JobResult<T> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job = Arc::new(Job {
            node: JobNode {
                id,
                state: Mutex::new(NodeState {
                    status: Status::Waiting,
                    pending_deps: 1,
                    dep_failed: false,
                    failed: false,
                    dependents: Vec::new(),
                }),
                done: Condvar::new(),
            },
            work: Mutex::new(Some(Box::new(work))),
            output: Mutex::new(None),
        });
        let runnable: Arc<dyn Runnable> = job.clone();

        let mut num_deps = 0;
        for Dep(dep) in deps {
            num_deps += 1;
            job.node.state.lock().unwrap().pending_deps += 1;

            let mut dep_state = dep.node().state.lock().unwrap();
            if dep_state.status == Status::Done {
                let ok = !dep_state.failed;
                drop(dep_state);
                job.node.dependency_done(ok);
            } else {
                dep_state.dependents.push(Arc::clone(&runnable));
            }
        }

        log::trace!("submitted job {id} with {num_deps} dependencies");

        // Release the submission guard.
        if job.node.dependency_done(true) {
            self.shared.push(runnable);
        }

        if self.workers.is_empty() {
            while let Some(job) = self.shared.pop() {
                self.shared.execute(job);
            }
        }

        JobHandle(job)
    }
}

impl Drop for ThreadQueue {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().stopping = true;
        self.shared.work_available.notify_all();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("job queue worker panicked");
            }
        }

        // Fail whatever was not run, including jobs that only become ready through that.
        let mut cancelled = 0;
        while let Some(job) = self.shared.pop() {
            job.cancel();
            for dependent in job.node().complete(false) {
                if dependent.node().dependency_done(false) {
                    self.shared.push(dependent);
                }
            }
            cancelled += 1;
        }

        if cancelled > 0 {
            log::warn!("cancelled {cancelled} jobs on job queue shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn inline_queue_runs_on_submit() {
        let queue = ThreadQueue::new(0).unwrap();

        let a = queue.submit([], || Ok(2));
        assert!(a.is_ready());

        let a_clone = a.clone();
        let b = queue.submit([a.dep()], move || Ok(a_clone.wait()? * 10));
        assert!(b.is_ready());
        assert_eq!(b.take(), Ok(20));
        assert_eq!(b.take(), Err(JobError::Taken));
        assert_eq!(a.wait(), Ok(2));
    }

    #[test]
    fn dependents_wait_for_dependencies() {
        let queue = ThreadQueue::new(4).unwrap();
        let (release, gate) = mpsc::channel::<()>();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let order = order.clone();
            queue.submit([], move || {
                gate.recv().map_err(|e| JobError::Failed(e.to_string()))?;
                order.lock().unwrap().push("first");
                Ok(())
            })
        };
        let second = {
            let order = order.clone();
            queue.submit([first.dep()], move || {
                order.lock().unwrap().push("second");
                Ok(())
            })
        };
        let independent = {
            let order = order.clone();
            queue.submit([], move || {
                order.lock().unwrap().push("independent");
                Ok(())
            })
        };

        independent.wait().unwrap();
        assert!(!second.is_ready());

        release.send(()).unwrap();
        second.wait().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["independent", "first", "second"]);
    }

    #[test]
    fn failure_propagates_to_dependents() {
        let queue = ThreadQueue::new(2).unwrap();

        let failing = queue.submit([], || -> JobResult<()> { Err(JobError::Failed("boom".into())) });
        let dependent = queue.submit([failing.dep()], || Ok(1));
        let transitive = queue.submit([dependent.dep()], || Ok(2));

        assert_eq!(failing.wait(), Err(JobError::Failed("boom".into())));
        assert_eq!(transitive.wait(), Err(JobError::DependencyFailed));
        assert_eq!(dependent.sync(), Err(JobError::DependencyFailed));
    }

    #[test]
    fn panicking_job_fails() {
        let queue = ThreadQueue::new(1).unwrap();

        let job = queue.submit([], || -> JobResult<()> { panic!("job panic") });
        assert_eq!(job.wait(), Err(JobError::Panicked));

        // The worker survives.
        assert_eq!(queue.submit([], || Ok(3)).wait(), Ok(3));
    }

    #[test]
    fn drop_cancels_pending_jobs() {
        let queue = ThreadQueue::new(1).unwrap();
        let (release, gate) = mpsc::channel::<()>();

        let blocker = queue.submit([], move || {
            let _ = gate.recv_timeout(Duration::from_millis(200));
            Ok(())
        });
        let queued = queue.submit([], || Ok(()));
        let waiting = queue.submit([queued.dep()], || Ok(()));

        drop(queue);
        drop(release);

        assert_eq!(blocker.wait(), Ok(()));
        assert!(matches!(
            queued.wait(),
            Ok(()) | Err(JobError::Cancelled)
        ));
        assert!(waiting.is_ready());
    }

    #[test]
    fn ready_promise_is_ready() {
        let promise = ReadyPromise::from(5);
        assert!(promise.is_ready());
        assert_eq!(promise.sync(), Ok(5));
    }
}
