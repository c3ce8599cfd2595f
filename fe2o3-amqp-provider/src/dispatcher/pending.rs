use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::FutureExt;
use pin_project_lite::pin_project;
use tokio::{
    sync::oneshot,
    time::{sleep, Sleep},
};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

pin_project! {
    /// A future that resolves once the dispatcher has completed a command.
    ///
    /// Dropping the future does not withdraw the command; use [`Pending::cancel`] for that.
    pub struct Pending<T> {
        #[pin]
        rx: oneshot::Receiver<Result<T, Error>>,
        token: CancellationToken,
        deadline: Option<Pin<Box<Sleep>>>,
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("cancelled", &self.token.is_cancelled())
            .field("deadline", &self.deadline.as_ref().map(|s| s.deadline()))
            .finish()
    }
}

impl<T> Pending<T> {
    pub(crate) fn new(
        rx: oneshot::Receiver<Result<T, Error>>,
        token: CancellationToken,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            rx,
            token,
            deadline: timeout.map(|duration| Box::pin(sleep(duration))),
        }
    }

    /// Withdraws the command.
    ///
    /// A command the dispatcher has not reached yet completes with [`Error::Cancelled`] and is
    /// never applied. A command that already started runs to completion.
    pub fn cancel(&self) {
        self.token.cancel()
    }

    /// Whether [`Pending::cancel`] has been called
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop waiting after `duration`, replacing any previously configured timeout.
    ///
    /// Timing out only ends the wait. The command is still executed and its result is
    /// discarded.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.deadline = Some(Box::pin(sleep(duration)));
        self
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match this.rx.poll(cx) {
            Poll::Ready(Ok(result)) => return Poll::Ready(result),
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err.into())),
            Poll::Pending => {}
        }

        if let Some(deadline) = this.deadline {
            if deadline.poll_unpin(cx).is_ready() {
                return Poll::Ready(Err(Error::TimedOut));
            }
        }
        Poll::Pending
    }
}
