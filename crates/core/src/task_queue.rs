use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Runs enqueued tasks in arrival order with at most `concurrency` in flight.
///
/// Tasks start strictly in FIFO order. A failing task only fails its own
/// handle; callers that want fail-fast call [`cancel_pending`](Self::cancel_pending).
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Job>,
    concurrency: usize,
    cancel: Mutex<CancellationToken>,
}

impl TaskQueue {
    /// Must be called from within a Tokio runtime.
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(rx, Arc::new(Semaphore::new(concurrency))));
        Self {
            tx,
            concurrency,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn enqueue<T, Fut>(&self, task: Fut) -> TaskHandle<T>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let token = self
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let job: Job = Box::pin(async move {
            if token.is_cancelled() {
                let _ = done_tx.send(Err(Error::Cancelled));
                return;
            }
            let _ = done_tx.send(task.await);
        });
        // A closed dispatcher drops the job, and the handle reports Cancelled.
        let _ = self.tx.send(job);

        TaskHandle { rx: done_rx }
    }

    /// Resolves every task that has not started yet with [`Error::Cancelled`].
    /// Tasks already running finish normally; later enqueues are unaffected.
    pub fn cancel_pending(&self) {
        let mut token = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        token.cancel();
        *token = CancellationToken::new();
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<Job>, slots: Arc<Semaphore>) {
    while let Some(job) = rx.recv().await {
        let Ok(permit) = slots.clone().acquire_owned().await else {
            break;
        };
        tokio::spawn(async move {
            job.await;
            drop(permit);
        });
    }
}

/// Completion of one enqueued task.
#[must_use = "a task handle does nothing unless awaited"]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or_else(|_| Err(Error::Cancelled)))
    }
}
