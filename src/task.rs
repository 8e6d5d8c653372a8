//! Cancellable background tasks.
//!
//! A [`TaskHandle`] owns a spawned loop and a stop signal. Cancelling (or
//! dropping) the handle wakes every [`CancelToken`] clone, so a loop parked
//! in `select!` on a timer exits without firing again.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Observer side of a stop signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the owning handle is cancelled or dropped.
    pub async fn cancelled(&mut self) {
        // Err means the sender is gone, which counts as cancellation.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

#[derive(Debug)]
pub struct TaskHandle {
    stop_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Spawn `make(token)` on the current tokio runtime.
    pub fn spawn<F, Fut>(make: F) -> Self
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, rx) = watch::channel(false);
        let join = tokio::spawn(make(CancelToken { rx }));
        TaskHandle {
            stop_tx,
            join: Some(join),
        }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.stop_tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancel and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        self.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
