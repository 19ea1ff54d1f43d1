use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
};

use futures::Stream;

use crate::frame::SendFrame;

/// A deque whose consumer can wait asynchronously for the next element.
///
/// Producers push from any thread, a single consumer pops.
/// Once closed, pushes are dropped and the consumer observes `None`.
#[derive(Debug)]
struct AsyncDeque<T> {
    queue: Option<VecDeque<T>>,
    waker: Option<Waker>,
}

impl<T> AsyncDeque<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        if let Some(queue) = &mut self.queue {
            let before = queue.len();
            queue.extend(iter);
            if queue.len() > before {
                if let Some(waker) = self.waker.take() {
                    waker.wake();
                }
            }
        }
    }

    fn poll_pop(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        match &mut self.queue {
            Some(queue) => match queue.pop_front() {
                Some(value) => Poll::Ready(Some(value)),
                None => {
                    self.waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            },
            None => Poll::Ready(None),
        }
    }

    fn len(&self) -> usize {
        self.queue.as_ref().map(VecDeque::len).unwrap_or(0)
    }

    fn close(&mut self) {
        self.queue = None;
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// A shared outbox of frames waiting to be packed by the packet layer.
///
/// It implements [`SendFrame`] for every frame type convertible into `T`,
/// so one queue collects all the control frames of a connection.
/// The packet layer drains it with [`ArcAsyncDeque::drain`],
/// or waits for the next frame with [`ArcAsyncDeque::pop`].
///
/// # Examples
///
/// ```
/// use qbase::util::ArcAsyncDeque;
///
/// let deque = ArcAsyncDeque::new();
/// deque.push_back(1);
/// deque.push_back(2);
/// assert_eq!(deque.drain(), vec![1, 2]);
/// assert!(deque.is_empty());
/// ```
#[derive(Debug)]
pub struct ArcAsyncDeque<T>(Arc<Mutex<AsyncDeque<T>>>);

impl<T> ArcAsyncDeque<T> {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(AsyncDeque {
            queue: Some(VecDeque::with_capacity(8)),
            waker: None,
        })))
    }

    fn lock_guard(&self) -> MutexGuard<'_, AsyncDeque<T>> {
        self.0.lock().unwrap()
    }

    /// Insert an element at the back of the queue,
    /// and wake up the waiting `pop` task if any.
    pub fn push_back(&self, value: T) {
        self.lock_guard().extend([value]);
    }

    /// Take one element from the front of the queue without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.lock_guard().queue.as_mut().and_then(VecDeque::pop_front)
    }

    /// Take all queued elements, in the order they were pushed.
    pub fn drain(&self) -> Vec<T> {
        self.lock_guard()
            .queue
            .as_mut()
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Asynchronously pop the next element in the queue.
    ///
    /// Resolves to `None` once the deque is closed.
    pub fn pop(&self) -> Self {
        self.clone()
    }

    /// Poll pop the next element in the queue.
    ///
    /// # Examples
    ///
    /// ```
    /// use qbase::util::ArcAsyncDeque;
    /// use futures::task::{Poll, noop_waker};
    ///
    /// let waker = noop_waker();
    /// let mut cx = std::task::Context::from_waker(&waker);
    /// let deque = ArcAsyncDeque::new();
    /// assert_eq!(deque.poll_pop(&mut cx), Poll::Pending);
    ///
    /// deque.push_back(1);
    /// assert_eq!(deque.poll_pop(&mut cx), Poll::Ready(Some(1)));
    /// deque.close();
    /// assert_eq!(deque.poll_pop(&mut cx), Poll::Ready(None));
    /// ```
    pub fn poll_pop(&self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.lock_guard().poll_pop(cx)
    }

    pub fn len(&self) -> usize {
        self.lock_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the deque, dropping the queued elements.
    pub fn close(&self) {
        self.lock_guard().close();
    }
}

impl<T> Default for ArcAsyncDeque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ArcAsyncDeque<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Future for ArcAsyncDeque<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.poll_pop(cx)
    }
}

impl<T> Stream for ArcAsyncDeque<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_pop(cx)
    }
}

impl<T, F> SendFrame<F> for ArcAsyncDeque<T>
where
    F: Into<T>,
{
    fn send_frame<I: IntoIterator<Item = F>>(&self, iter: I) {
        self.lock_guard().extend(iter.into_iter().map(Into::into));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DataBlockedFrame, MaxDataFrame, ReliableFrame};

    #[tokio::test]
    async fn test_pop_wakes_on_send_frame() {
        let deque = ArcAsyncDeque::<ReliableFrame>::new();
        let task = tokio::spawn({
            let deque = deque.clone();
            async move { deque.pop().await }
        });
        tokio::task::yield_now().await;
        deque.send_frame([MaxDataFrame { max_data: 8 }]);
        assert_eq!(
            task.await.unwrap(),
            Some(ReliableFrame::MaxData(MaxDataFrame { max_data: 8 }))
        );
    }

    #[test]
    fn test_closed_deque_drops_frames() {
        let deque = ArcAsyncDeque::<ReliableFrame>::new();
        deque.send_frame([DataBlockedFrame { limit: 1 }]);
        deque.close();
        deque.send_frame([DataBlockedFrame { limit: 2 }]);
        assert!(deque.is_empty());
        assert_eq!(deque.try_pop(), None);
    }
}
