//! A cooperative cancellation token for an in-flight workflow execution.
//!
//! Grounded on the teacher's `execution_handle.rs`: a `tokio::sync::mpsc`
//! channel pair plays the same role as its `cancel_sender`/event-stream
//! split, simplified to a single fire-once signal since this engine has no
//! perpetual/listener-driven workflows to keep alive.

use tokio::sync::watch;

/// Handle given to a caller to request cancellation of a running execution.
#[derive(Clone)]
pub struct CancellationHandle {
    sender: watch::Sender<bool>,
}

/// Token threaded through the scheduler; cheap to clone and check.
#[derive(Clone)]
pub struct CancellationToken {
    receiver: watch::Receiver<bool>,
}

#[must_use]
pub fn pair() -> (CancellationHandle, CancellationToken) {
    let (sender, receiver) = watch::channel(false);
    (CancellationHandle { sender }, CancellationToken { receiver })
}

impl CancellationHandle {
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }
}

impl CancellationToken {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    pub async fn cancelled(&mut self) {
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }
}
