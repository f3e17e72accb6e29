//! Streams with an externally supplied `size_hint`.
//!
//! We count input records before processing them, and we want that count to
//! survive the trip through our stream adapters so that progress bars know how
//! long they are.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;

/// A [`Stream`] which reports a known size hint, counting it down as items
/// are consumed.
pub struct SizeHintStream<S> {
    stream: S,
    remaining: (usize, Option<usize>),
}

impl<S> Stream for SizeHintStream<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.stream).poll_next(cx);
        if let Poll::Ready(Some(_)) = &polled {
            let (lower, upper) = this.remaining;
            this.remaining = (lower.saturating_sub(1), upper.map(|n| n.saturating_sub(1)));
        }
        polled
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.remaining
    }
}

/// Adds [`WithSizeHintExt::with_size_hint`] to every [`Stream`].
pub trait WithSizeHintExt: Stream + Sized {
    /// Report `size_hint` from now on, instead of the stream's own hint.
    fn with_size_hint(self, size_hint: (usize, Option<usize>)) -> SizeHintStream<Self> {
        SizeHintStream {
            stream: self,
            remaining: size_hint,
        }
    }
}

impl<S> WithSizeHintExt for S where S: Stream {}
