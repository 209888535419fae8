use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use pin_project_lite::pin_project;
use tokio::time::{Instant, Sleep};

use crate::error::UpstreamFailure;

/// No item arrived within the idle window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no upstream event within {0:?}")]
pub struct IdleElapsed(pub Duration);

impl From<IdleElapsed> for UpstreamFailure {
    fn from(elapsed: IdleElapsed) -> Self {
        UpstreamFailure::transient(elapsed.to_string())
    }
}

pin_project! {
    /// Fails a fallible stream that stays silent for longer than `idle`.
    ///
    /// The timer is re-armed on every item. After the timeout item the stream
    /// is exhausted.
    pub struct IdleTimeout<S> {
        #[pin]
        inner: S,
        #[pin]
        sleep: Sleep,
        idle: Duration,
        finished: bool,
    }
}

impl<S> IdleTimeout<S> {
    pub fn new(inner: S, idle: Duration) -> Self {
        Self {
            inner,
            sleep: tokio::time::sleep(idle),
            idle,
            finished: false,
        }
    }
}

impl<S, T, E> Stream for IdleTimeout<S>
where
    S: Stream<Item = Result<T, E>>,
    E: From<IdleElapsed>,
{
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.finished {
            return Poll::Ready(None);
        }
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(item)) => {
                let deadline = Instant::now() + *this.idle;
                this.sleep.as_mut().reset(deadline);
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                *this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => match this.sleep.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    *this.finished = true;
                    Poll::Ready(Some(Err(E::from(IdleElapsed(*this.idle)))))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
