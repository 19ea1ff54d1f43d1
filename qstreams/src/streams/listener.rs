use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
};

use qbase::{error::Error, sid::StreamId};

use crate::{StreamError, recv::Reader, send::Writer};

#[derive(Debug, Default)]
struct RawListener {
    // streams opened by peer, in the order they were observed
    bi_streams: VecDeque<(StreamId, (Reader, Writer))>,
    uni_streams: VecDeque<(StreamId, Reader)>,
    bi_wakers: Vec<Waker>,
    uni_wakers: Vec<Waker>,
}

fn register(wakers: &mut Vec<Waker>, waker: &Waker) {
    if !wakers.iter().any(|w| w.will_wake(waker)) {
        wakers.push(waker.clone());
    }
}

impl RawListener {
    fn push_bi_stream(&mut self, sid: StreamId, stream: (Reader, Writer)) {
        self.bi_streams.push_back((sid, stream));
        self.bi_wakers.drain(..).for_each(Waker::wake);
    }

    fn push_uni_stream(&mut self, sid: StreamId, reader: Reader) {
        self.uni_streams.push_back((sid, reader));
        self.uni_wakers.drain(..).for_each(Waker::wake);
    }

    fn poll_accept_bi_stream(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<(StreamId, (Reader, Writer))> {
        match self.bi_streams.pop_front() {
            Some(stream) => Poll::Ready(stream),
            None => {
                register(&mut self.bi_wakers, cx.waker());
                Poll::Pending
            }
        }
    }

    fn poll_accept_uni_stream(&mut self, cx: &mut Context<'_>) -> Poll<(StreamId, Reader)> {
        match self.uni_streams.pop_front() {
            Some(stream) => Poll::Ready(stream),
            None => {
                register(&mut self.uni_wakers, cx.waker());
                Poll::Pending
            }
        }
    }
}

/// The queues of streams opened by peer, waiting to be accepted by the application.
#[derive(Debug, Clone)]
pub(crate) struct ArcListener(Arc<Mutex<Result<RawListener, Error>>>);

impl ArcListener {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(Ok(RawListener::default()))))
    }

    pub(crate) fn guard(&self) -> Result<ListenerGuard<'_>, Error> {
        let guard = self.0.lock().unwrap();
        match guard.as_ref() {
            Ok(_) => Ok(ListenerGuard { inner: guard }),
            Err(e) => Err(e.clone()),
        }
    }

    pub(crate) fn accept_bi_stream(&self) -> AcceptBiStream<'_> {
        AcceptBiStream { inner: self }
    }

    pub(crate) fn accept_uni_stream(&self) -> AcceptUniStream<'_> {
        AcceptUniStream { inner: self }
    }

    pub(crate) fn poll_accept_bi_stream(
        &self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(StreamId, (Reader, Writer)), Error>> {
        match self.0.lock().unwrap().as_mut() {
            Ok(listener) => listener.poll_accept_bi_stream(cx).map(Ok),
            Err(e) => Poll::Ready(Err(e.clone())),
        }
    }

    pub(crate) fn poll_accept_uni_stream(
        &self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(StreamId, Reader), Error>> {
        match self.0.lock().unwrap().as_mut() {
            Ok(listener) => listener.poll_accept_uni_stream(cx).map(Ok),
            Err(e) => Poll::Ready(Err(e.clone())),
        }
    }
}

pub(crate) struct ListenerGuard<'a> {
    inner: MutexGuard<'a, Result<RawListener, Error>>,
}

impl ListenerGuard<'_> {
    fn listener(&mut self) -> &mut RawListener {
        match self.inner.as_mut() {
            Ok(listener) => listener,
            Err(e) => unreachable!("listener is invalid: {e}"),
        }
    }

    pub(crate) fn push_bi_stream(&mut self, sid: StreamId, stream: (Reader, Writer)) {
        self.listener().push_bi_stream(sid, stream);
    }

    pub(crate) fn push_uni_stream(&mut self, sid: StreamId, reader: Reader) {
        self.listener().push_uni_stream(sid, reader);
    }

    /// Wake up all acceptors, the streams never accepted are dropped.
    pub(crate) fn on_conn_error(&mut self, error: &Error) {
        let listener = self.listener();
        listener.bi_wakers.drain(..).for_each(Waker::wake);
        listener.uni_wakers.drain(..).for_each(Waker::wake);
        *self.inner = Err(error.clone());
    }
}

/// Future to accept a bidirectional stream opened by peer,
/// created by [`DataStreams::accept_bi_stream`](crate::DataStreams::accept_bi_stream).
#[derive(Debug)]
pub struct AcceptBiStream<'l> {
    inner: &'l ArcListener,
}

impl Future for AcceptBiStream<'_> {
    type Output = Result<(StreamId, (Reader, Writer)), StreamError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_accept_bi_stream(cx).map_err(StreamError::from)
    }
}

/// Future to accept a unidirectional stream opened by peer,
/// created by [`DataStreams::accept_uni_stream`](crate::DataStreams::accept_uni_stream).
#[derive(Debug)]
pub struct AcceptUniStream<'l> {
    inner: &'l ArcListener,
}

impl Future for AcceptUniStream<'_> {
    type Output = Result<(StreamId, Reader), StreamError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_accept_uni_stream(cx).map_err(StreamError::from)
    }
}
