use crossbeam_channel::{Receiver, Sender};
use log::{trace, warn};
use std::sync::Mutex;
use std::thread::{Builder, JoinHandle};

enum Task {
    Run(Box<dyn FnOnce() + Send + 'static>),
    Terminate,
}

/// Fixed-size pool of worker threads that run consumer callbacks off the
/// reader thread.
///
/// One unbounded task queue feeds all workers, so the reader never blocks
/// submitting a delivery no matter how slow user callbacks are. With the
/// default single worker, deliveries to a channel's consumers run strictly in
/// arrival order; larger pools trade that ordering for concurrency.
pub(crate) struct ConsumerWorkPool {
    tx: Sender<Task>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsumerWorkPool {
    pub(crate) fn new(channel_id: u16, size: usize) -> ConsumerWorkPool {
        let size = usize::max(size, 1);
        let (tx, rx) = crossbeam_channel::unbounded::<Task>();
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let rx: Receiver<Task> = rx.clone();
            let handle = Builder::new()
                .name(format!("burrow-consumer-{}-{}", channel_id, i))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        match task {
                            Task::Run(f) => f(),
                            Task::Terminate => break,
                        }
                    }
                    trace!("consumer worker exiting");
                })
                .expect("failed to spawn consumer worker thread");
            workers.push(handle);
        }
        ConsumerWorkPool {
            tx,
            workers: Mutex::new(workers),
        }
    }

    pub(crate) fn submit<F: FnOnce() + Send + 'static>(&self, f: F) {
        if self.tx.send(Task::Run(Box::new(f))).is_err() {
            warn!("dropping task submitted to a consumer pool that has shut down");
        }
    }

    /// Ask every worker to finish. Queued tasks submitted before the shutdown
    /// still run; the terminate sentinels sit behind them in the queue.
    pub(crate) fn shutdown(&self) {
        let workers = self.workers.lock().unwrap();
        for _ in workers.iter() {
            let _ = self.tx.send(Task::Terminate);
        }
    }

    pub(crate) fn join(&self) {
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                warn!("consumer worker panicked while shutting down");
            }
        }
    }
}

impl Drop for ConsumerWorkPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
