use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicU8, Ordering},
    },
};

use bytes::Bytes;
use derive_more::{Deref, DerefMut};
use qbase::{
    error::Error,
    frame::StreamFrame,
    sid::{ArcRemoteStreamIds, StreamId},
};

use crate::{FrameQueue, recv::Incoming, send::Outgoing};

bitflags::bitflags! {
    /// The halves of a stream that have not ended yet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Halves: u8 {
        const SENDING   = 1 << 0;
        const RECEIVING = 1 << 1;
    }
}

/// Tracks which halves of a stream are still alive,
/// and reclaims the stream once both of them ended.
///
/// A sending half ends when the peer acknowledged all of its data or its reset,
/// a receiving half ends when the application read all of its data or its reset.
#[derive(Debug, Clone)]
pub(crate) struct IOState {
    sid: StreamId,
    halves: Arc<AtomicU8>,
    reclaimer: Reclaimer,
}

impl IOState {
    fn new(sid: StreamId, halves: Halves, reclaimer: Reclaimer) -> Self {
        Self {
            sid,
            halves: Arc::new(AtomicU8::new(halves.bits())),
            reclaimer,
        }
    }

    pub(crate) fn send_only(sid: StreamId, reclaimer: Reclaimer) -> Self {
        Self::new(sid, Halves::SENDING, reclaimer)
    }

    pub(crate) fn receive_only(sid: StreamId, reclaimer: Reclaimer) -> Self {
        Self::new(sid, Halves::RECEIVING, reclaimer)
    }

    pub(crate) fn bidirection(sid: StreamId, reclaimer: Reclaimer) -> Self {
        Self::new(sid, Halves::SENDING | Halves::RECEIVING, reclaimer)
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.sid
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.halves.load(Ordering::Acquire) == 0
    }

    pub(crate) fn shutdown_send(&self) {
        self.shutdown(Halves::SENDING);
    }

    pub(crate) fn shutdown_receive(&self) {
        self.shutdown(Halves::RECEIVING);
    }

    /// Must be called without holding any lock of the streams.
    fn shutdown(&self, half: Halves) {
        let prev = Halves::from_bits_truncate(self.halves.fetch_and(!half.bits(), Ordering::AcqRel));
        // only the call ending the last alive half reclaims the stream
        if prev == half {
            self.reclaimer.reclaim(self.sid);
        }
    }
}

/// Removes ended streams from the tables, and gives the stream credit back to the peer.
#[derive(Debug, Clone)]
pub(crate) struct Reclaimer {
    output: Weak<Mutex<Result<Output, Error>>>,
    input: Weak<Mutex<Result<Input, Error>>>,
    remote: ArcRemoteStreamIds<FrameQueue>,
}

impl Reclaimer {
    pub(crate) fn new(
        output: &ArcOutput,
        input: &ArcInput,
        remote: ArcRemoteStreamIds<FrameQueue>,
    ) -> Self {
        Self {
            output: Arc::downgrade(&output.0),
            input: Arc::downgrade(&input.0),
            remote,
        }
    }

    fn reclaim(&self, sid: StreamId) {
        if let Some(output) = self.output.upgrade() {
            if let Ok(output) = output.lock().unwrap().as_mut() {
                output.remove(&sid);
            }
        }
        if let Some(input) = self.input.upgrade() {
            if let Ok(input) = input.lock().unwrap().as_mut() {
                input.remove(&sid);
            }
        }
        tracing::debug!("{sid} is reclaimed");
        self.remote.on_end_of_stream(sid);
    }
}

#[derive(Debug, Deref, DerefMut)]
pub(crate) struct Output {
    #[deref]
    #[deref_mut]
    outgoings: BTreeMap<StreamId, (Outgoing, IOState)>,
    // the stream served last, the next round starts after it
    last_sent: Option<StreamId>,
}

type Input = HashMap<StreamId, (Incoming, IOState)>;

/// The sending halves of all alive streams.
///
/// Once the connection fails, the table is replaced by the connection error,
/// later operations observe the error instead.
#[derive(Debug, Clone)]
pub(crate) struct ArcOutput(Arc<Mutex<Result<Output, Error>>>);

impl ArcOutput {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(Ok(Output {
            outgoings: BTreeMap::new(),
            last_sent: None,
        }))))
    }

    pub(crate) fn guard(&self) -> Result<ArcOutputGuard<'_>, Error> {
        let guard = self.0.lock().unwrap();
        match guard.as_ref() {
            Ok(_) => Ok(ArcOutputGuard { inner: guard }),
            Err(e) => Err(e.clone()),
        }
    }
}

pub(crate) struct ArcOutputGuard<'a> {
    inner: MutexGuard<'a, Result<Output, Error>>,
}

impl ArcOutputGuard<'_> {
    fn output(&mut self) -> &mut Output {
        match self.inner.as_mut() {
            Ok(output) => output,
            Err(e) => unreachable!("output is invalid: {e}"),
        }
    }

    pub(crate) fn insert(&mut self, sid: StreamId, outgoing: Outgoing, io_state: IOState) {
        self.output().insert(sid, (outgoing, io_state));
    }

    pub(crate) fn get(&mut self, sid: &StreamId) -> Option<(Outgoing, IOState)> {
        self.output().get(sid).cloned()
    }

    /// Pick up the next STREAM frame, serving the streams in turn.
    ///
    /// The round starts right after the stream served last time and wraps around,
    /// streams with nothing to send are skipped.
    pub(crate) fn next_sendable(&mut self, max_len: usize) -> Option<(StreamFrame, Bytes)> {
        let output = self.output();
        let picked = match output.last_sent {
            Some(last) => output
                .outgoings
                .range((Bound::Excluded(last), Bound::Unbounded))
                .chain(output.outgoings.range(..=last))
                .find_map(|(_, (outgoing, _))| outgoing.pick_up(max_len)),
            None => output
                .outgoings
                .values()
                .find_map(|(outgoing, _)| outgoing.pick_up(max_len)),
        };
        if let Some((frame, _)) = &picked {
            output.last_sent = Some(frame.stream_id());
        }
        picked
    }

    pub(crate) fn on_conn_error(&mut self, error: &Error) {
        self.output()
            .values()
            .for_each(|(outgoing, _)| outgoing.on_conn_error(error));
        *self.inner = Err(error.clone());
    }
}

/// The receiving halves of all alive streams, latched with the connection error like [`ArcOutput`].
#[derive(Debug, Clone)]
pub(crate) struct ArcInput(Arc<Mutex<Result<Input, Error>>>);

impl ArcInput {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(Ok(Input::new()))))
    }

    pub(crate) fn guard(&self) -> Result<ArcInputGuard<'_>, Error> {
        let guard = self.0.lock().unwrap();
        match guard.as_ref() {
            Ok(_) => Ok(ArcInputGuard { inner: guard }),
            Err(e) => Err(e.clone()),
        }
    }
}

pub(crate) struct ArcInputGuard<'a> {
    inner: MutexGuard<'a, Result<Input, Error>>,
}

impl ArcInputGuard<'_> {
    fn input(&mut self) -> &mut Input {
        match self.inner.as_mut() {
            Ok(input) => input,
            Err(e) => unreachable!("input is invalid: {e}"),
        }
    }

    pub(crate) fn insert(&mut self, sid: StreamId, incoming: Incoming, io_state: IOState) {
        self.input().insert(sid, (incoming, io_state));
    }

    pub(crate) fn get(&mut self, sid: &StreamId) -> Option<(Incoming, IOState)> {
        self.input().get(sid).cloned()
    }

    /// Collect the MAX_STREAM_DATA limits waiting to be advertised.
    pub(crate) fn window_updates(&mut self) -> Vec<(StreamId, u64)> {
        self.input()
            .iter()
            .filter_map(|(sid, (incoming, _))| Some((*sid, incoming.take_window_update()?)))
            .collect()
    }

    pub(crate) fn on_conn_error(&mut self, error: &Error) {
        self.input()
            .values()
            .for_each(|(incoming, _)| incoming.on_conn_error(error));
        *self.inner = Err(error.clone());
    }
}
