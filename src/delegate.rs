//! Delegates hear about the outcome of asynchronous lookups.  The
//! cache only keeps weak references to them: a delegate dropped
//! before its lookup completes simply hears nothing.
//!
//! Callbacks never run on the I/O pool.  They are handed to a
//! [`Deliver`] executor chosen when the cache is built: either a
//! dedicated [`DeliveryThread`], or a [`MainQueue`] that the
//! application drains from its own main (UI) loop.
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// Receives the outcome of asynchronous lookups.  Both callbacks are
/// optional.
pub trait Delegate<I>: Send + Sync {
    /// The image for `url` is available.
    fn did_get_image(&self, _image: &Arc<I>, _url: &str) {}

    /// The image for `url` could not be obtained: the download or the
    /// decode failed, or the depth cap stopped the lookup at the disk.
    fn did_fail_to_get_image(&self, _url: &str) {}
}

/// A callback waiting to be run on the delivery context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs delegate callbacks somewhere other than the I/O pool.
pub trait Deliver: Send + Sync {
    /// Schedules `job`.  Jobs may run in any order.
    fn deliver(&self, job: Job);
}

fn run(job: Job) {
    if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::warn!("delegate callback panicked");
    }
}

/// Runs callbacks, one at a time, on a dedicated thread.  The thread
/// exits once every handle to it has been dropped.
#[derive(Clone, Debug)]
pub struct DeliveryThread {
    sender: flume::Sender<Job>,
}

impl DeliveryThread {
    /// Spawns the delivery thread.
    pub fn spawn() -> std::io::Result<DeliveryThread> {
        let (sender, receiver) = flume::unbounded::<Job>();

        std::thread::Builder::new()
            .name("tjimage-delivery".to_owned())
            .spawn(move || {
                for job in receiver.iter() {
                    run(job);
                }
            })?;

        Ok(DeliveryThread { sender })
    }
}

impl Deliver for DeliveryThread {
    fn deliver(&self, job: Job) {
        // Only fails once the thread is gone, i.e., never while we
        // hold a sender.
        let _ = self.sender.send(job);
    }
}

/// Queues callbacks until the owner of the main loop runs them with
/// [`MainQueue::run_pending`] or [`MainQueue::run_one`].
#[derive(Clone, Debug)]
pub struct MainQueue {
    sender: flume::Sender<Job>,
    receiver: flume::Receiver<Job>,
}

impl Default for MainQueue {
    fn default() -> Self {
        let (sender, receiver) = flume::unbounded();

        MainQueue { sender, receiver }
    }
}

impl MainQueue {
    /// Returns an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every queued callback on the calling thread, without
    /// waiting for more.  Returns the number of callbacks run.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;

        for job in self.receiver.try_iter() {
            run(job);
            count += 1;
        }

        count
    }

    /// Waits up to `timeout` for one callback and runs it.  Returns
    /// whether a callback ran.
    pub fn run_one(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(job) => {
                run(job);
                true
            }
            Err(_) => false,
        }
    }

    /// Returns the number of queued callbacks.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Returns whether no callback is queued.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Deliver for MainQueue {
    fn deliver(&self, job: Job) {
        // We hold the receiver too, so this never fails.
        let _ = self.sender.send(job);
    }
}
