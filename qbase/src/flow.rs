//! Flow control windows for one scope, a single stream or the whole connection.
//!
//! QUIC employs a limit-based flow control scheme where a receiver advertises the limit of total
//! bytes it is prepared to receive on a given stream or for the entire connection.
//! The sending side of a scope is tracked by [`SendWindow`], the receiving side by [`RecvWindow`].
//! The connection-level windows are shared by every stream,
//! they are wrapped into [`ArcSendController`] and [`ArcRecvController`].

use std::{
    ops::DerefMut,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    task::Waker,
    time::{Duration, Instant},
};

use thiserror::Error;

use crate::{
    error::{Error, ErrorKind},
    frame::{DataBlockedFrame, FrameType, SendFrame},
};

/// Represents an overflow error when the flow control limit is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("flow control limit exceeded by {0} bytes")]
pub struct Overflow(pub u64);

/// The sending half of a flow control scope.
///
/// `max` is the highest limit ever granted by the peer, `sent` is the amount of bytes
/// already accounted against it. `sent <= max` always holds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendWindow {
    sent: u64,
    max: u64,
}

impl SendWindow {
    pub fn new(initial_max: u64) -> Self {
        Self {
            sent: 0,
            max: initial_max,
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn limit(&self) -> u64 {
        self.max
    }

    /// The amount of bytes that may still be sent.
    pub fn available(&self) -> u64 {
        self.max - self.sent
    }

    /// Account `n` bytes as sent, failing if that would exceed the granted limit.
    ///
    /// The window is left untouched on failure.
    pub fn add_bytes_sent(&mut self, n: u64) -> Result<(), Overflow> {
        match self.sent.checked_add(n) {
            Some(sent) if sent <= self.max => {
                self.sent = sent;
                Ok(())
            }
            Some(sent) => Err(Overflow(sent - self.max)),
            None => Err(Overflow(n)),
        }
    }

    /// Raise the limit to `limit`, returns whether the window grew.
    ///
    /// Peers may only grant more credit, a smaller limit is ignored.
    pub fn update_send_window(&mut self, limit: u64) -> bool {
        if limit > self.max {
            self.max = limit;
            true
        } else {
            false
        }
    }
}

/// Decide the next receive window size of an auto-tuning epoch.
///
/// `consumed` bytes have been read by the application within `elapsed` since the epoch started.
/// If more than half of the `window` was consumed in less than the time it takes to consume
/// it at a rate of one window every four round trips, the window is doubled, up to `max_window`.
///
/// The result is never smaller than `window`, and never larger than `max(window, max_window)`.
pub fn tune_window(
    window: u64,
    max_window: u64,
    rtt: Duration,
    elapsed: Duration,
    consumed: u64,
) -> u64 {
    if rtt.is_zero() || window == 0 || consumed <= window / 2 {
        return window;
    }
    let fraction = consumed as f64 / window as f64;
    if elapsed < rtt.mul_f64(4.0 * fraction) {
        window.saturating_mul(2).min(max_window).max(window)
    } else {
        window
    }
}

/// The receiving half of a flow control scope.
///
/// `bytes_read <= highest_received <= max_data` always holds:
/// `max_data` is the limit advertised to the peer, `highest_received` the highest offset
/// the peer has sent within it, and `bytes_read` the amount consumed by the application.
#[derive(Debug, Clone)]
pub struct RecvWindow {
    highest_received: u64,
    bytes_read: u64,
    max_data: u64,
    window_size: u64,
    max_window_size: u64,
    auto_tune: bool,
    // start time and read offset of the current auto-tuning epoch
    epoch: Option<(Instant, u64)>,
    pending: Option<u64>,
}

impl RecvWindow {
    pub fn new(window_size: u64, max_window_size: u64, auto_tune: bool) -> Self {
        Self {
            highest_received: 0,
            bytes_read: 0,
            max_data: window_size,
            window_size,
            max_window_size: max_window_size.max(window_size),
            auto_tune,
            epoch: None,
            pending: None,
        }
    }

    pub fn highest_received(&self) -> u64 {
        self.highest_received
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// The limit currently advertised to the peer.
    pub fn max_data(&self) -> u64 {
        self.max_data
    }

    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    /// Record that the peer sent data up to `offset`, returns how much the highest offset advanced.
    ///
    /// Fails if `offset` exceeds the advertised limit, the window is left untouched then.
    pub fn update_highest_received(&mut self, offset: u64) -> Result<u64, Overflow> {
        if offset > self.max_data {
            return Err(Overflow(offset - self.max_data));
        }
        let delta = offset.saturating_sub(self.highest_received);
        self.highest_received += delta;
        Ok(delta)
    }

    /// Record `delta` more bytes received, for scopes that aggregate other scopes.
    pub fn add_bytes_received(&mut self, delta: u64) -> Result<(), Overflow> {
        let offset = self.highest_received.saturating_add(delta);
        self.update_highest_received(offset).map(|_| ())
    }

    /// Whether the remaining credit of the peer has dropped to half of the window or below.
    pub fn should_update_window(&self) -> bool {
        self.max_data - self.bytes_read <= self.window_size / 2
    }

    /// Record `n` more bytes consumed by the application.
    ///
    /// When a window update is due, the window size is auto-tuned with the smoothed `rtt`,
    /// the limit is raised to `bytes_read + window_size`, and the new limit is returned.
    /// It also stays pending until taken by [`RecvWindow::take_window_update`].
    ///
    /// Reading more than received means the accounting is broken, the window is left untouched
    /// and the excess is returned.
    pub fn add_bytes_read(
        &mut self,
        n: u64,
        rtt: Duration,
        now: Instant,
    ) -> Result<Option<u64>, Overflow> {
        let unread = self.highest_received - self.bytes_read;
        if n > unread {
            return Err(Overflow(n - unread));
        }
        if self.epoch.is_none() {
            self.epoch = Some((now, self.bytes_read));
        }
        self.bytes_read += n;
        if !self.should_update_window() {
            return Ok(None);
        }

        if self.auto_tune {
            if let Some((start, offset)) = self.epoch {
                let elapsed = now.saturating_duration_since(start);
                let consumed = self.bytes_read - offset;
                let tuned =
                    tune_window(self.window_size, self.max_window_size, rtt, elapsed, consumed);
                if tuned > self.window_size {
                    tracing::debug!(
                        "receive window auto-tuned from {} to {tuned}",
                        self.window_size
                    );
                    self.window_size = tuned;
                }
            }
            self.epoch = Some((now, self.bytes_read));
        }

        let max_data = self.bytes_read.saturating_add(self.window_size);
        if max_data > self.max_data {
            self.max_data = max_data;
            self.pending = Some(max_data);
            Ok(Some(max_data))
        } else {
            Ok(None)
        }
    }

    /// Take the limit that is waiting to be advertised to the peer, if any.
    pub fn take_window_update(&mut self) -> Option<u64> {
        self.pending.take()
    }

    /// Grow the window size to at least `min`, bounded by the maximum window size.
    ///
    /// Used to keep the connection window larger than any stream window.
    pub fn ensure_minimum_window(&mut self, min: u64, now: Instant) {
        if min > self.window_size {
            self.window_size = min.min(self.max_window_size);
            self.epoch = Some((now, self.bytes_read));
        }
    }
}

/// The smoothed round trip time estimated by the loss detection of the connection.
///
/// It is written by the packet layer and read by every receive window for auto-tuning.
/// Zero means no estimate yet, which disables window growth.
#[derive(Debug, Clone, Default)]
pub struct ArcRtt(Arc<AtomicU64>);

impl ArcRtt {
    pub fn update(&self, smoothed_rtt: Duration) {
        let nanos = u64::try_from(smoothed_rtt.as_nanos()).unwrap_or(u64::MAX);
        self.0.store(nanos, Ordering::Release);
    }

    pub fn smoothed_rtt(&self) -> Duration {
        Duration::from_nanos(self.0.load(Ordering::Acquire))
    }
}

/// All data sent in STREAM frames counts toward this limit.
#[derive(Debug)]
struct SendController<TX> {
    window: SendWindow,
    wakers: Vec<Waker>,
    // the limit last reported by a DataBlocked frame, reported once per limit
    blocked_at: Option<u64>,
    blocked_tx: TX,
}

/// The connection-level send window shared by every stream.
///
/// A writer reserves credit by holding the [`Credit`] guard,
/// so that two streams can never reserve the same byte of connection-level credit.
#[derive(Debug, Clone)]
pub struct ArcSendController<TX>(Arc<Mutex<Result<SendController<TX>, Error>>>);

impl<TX> ArcSendController<TX>
where
    TX: SendFrame<DataBlockedFrame>,
{
    /// Creates a new `ArcSendController` with the `initial_max_data` the peer granted.
    pub fn new(initial_max_data: u64, blocked_tx: TX) -> Self {
        Self(Arc::new(Mutex::new(Ok(SendController {
            window: SendWindow::new(initial_max_data),
            wakers: Vec::with_capacity(4),
            blocked_at: None,
            blocked_tx,
        }))))
    }

    /// Raise the connection-level limit by a MAX_DATA frame from peer,
    /// and wake up all writers blocked by the connection-level window.
    pub fn update_send_window(&self, limit: u64) {
        let mut guard = self.0.lock().unwrap();
        if let Ok(ctrl) = guard.deref_mut() {
            if ctrl.window.update_send_window(limit) {
                for waker in ctrl.wakers.drain(..) {
                    waker.wake();
                }
            }
        }
    }

    /// The connection-level send window, or the connection error.
    pub fn window(&self) -> Result<SendWindow, Error> {
        match self.0.lock().unwrap().as_ref() {
            Ok(ctrl) => Ok(ctrl.window),
            Err(e) => Err(e.clone()),
        }
    }

    /// Apply for sending data. If the connection has failed, it will return Err directly.
    pub fn credit(&self) -> Result<Credit<'_, TX>, Error> {
        let guard = self.0.lock().unwrap();
        if let Err(e) = guard.as_ref() {
            return Err(e.clone());
        }
        Ok(Credit(guard))
    }

    /// Flow control can only be terminated if the connection encounters an error.
    pub fn on_conn_error(&self, error: &Error) {
        let mut guard = self.0.lock().unwrap();
        if let Ok(ctrl) = guard.deref_mut() {
            for waker in ctrl.wakers.drain(..) {
                waker.wake();
            }
            *guard = Err(error.clone());
        }
    }
}

/// Represents the connection-level credit for sending data,
/// the controller stays locked while it is held.
pub struct Credit<'a, TX>(MutexGuard<'a, Result<SendController<TX>, Error>>);

impl<TX> Credit<'_, TX>
where
    TX: SendFrame<DataBlockedFrame>,
{
    fn ctrl(&mut self) -> &mut SendController<TX> {
        match self.0.deref_mut() {
            Ok(ctrl) => ctrl,
            Err(_) => unreachable!("credit is only issued by a healthy controller"),
        }
    }

    /// Return the amount of data that can be sent.
    pub fn available(&mut self) -> u64 {
        self.ctrl().window.available()
    }

    /// Account `amount` bytes against the connection-level window.
    ///
    /// Posting more than [`Credit::available`] is an internal error,
    /// it is latched into the controller and returned.
    pub fn post_sent(mut self, amount: u64) -> Result<(), Error> {
        let overflow = match self.ctrl().window.add_bytes_sent(amount) {
            Ok(()) => return Ok(()),
            Err(overflow) => overflow,
        };
        let reason = format!("posted {} bytes beyond the connection send window", overflow.0);
        tracing::error!("   Cause by: {reason}");
        let error = Error::with_default_fty(ErrorKind::Internal, reason);
        for waker in self.ctrl().wakers.drain(..) {
            waker.wake();
        }
        *self.0 = Err(error.clone());
        Err(error)
    }

    /// Wait for the window to grow, reporting a DataBlocked frame once per limit.
    pub fn register_blocked(mut self, waker: &Waker) {
        let ctrl = self.ctrl();
        if !ctrl.wakers.iter().any(|w| w.will_wake(waker)) {
            ctrl.wakers.push(waker.clone());
        }
        let limit = ctrl.window.limit();
        if ctrl.blocked_at != Some(limit) {
            ctrl.blocked_at = Some(limit);
            tracing::debug!("connection is blocked by the send window at {limit}");
            ctrl.blocked_tx.send_frame([DataBlockedFrame { limit }]);
        }
    }
}

/// The connection-level receive window shared by every stream.
#[derive(Debug, Clone)]
pub struct ArcRecvController(Arc<Mutex<Result<RecvWindow, Error>>>);

impl ArcRecvController {
    pub fn new(window_size: u64, max_window_size: u64, auto_tune: bool) -> Self {
        Self(Arc::new(Mutex::new(Ok(RecvWindow::new(
            window_size,
            max_window_size,
            auto_tune,
        )))))
    }

    /// Account `delta` bytes of new data received on some stream.
    ///
    /// Only data beyond the highest offset of that stream counts,
    /// so retransmitted data is never accounted twice.
    pub fn on_new_rcvd(&self, frame_type: FrameType, delta: u64) -> Result<(), Error> {
        let mut guard = self.0.lock().unwrap();
        let window = guard.as_mut().map_err(|e| e.clone())?;
        window.add_bytes_received(delta).map_err(|overflow| {
            tracing::error!("   Cause by: connection received data beyond its window");
            Error::new(
                ErrorKind::FlowControl,
                frame_type,
                format!(
                    "connection received {} bytes which exceeds the limit {} by {}",
                    window.highest_received() + delta,
                    window.max_data(),
                    overflow.0
                ),
            )
        })
    }

    /// Account `n` bytes as consumed, returns the new limit if a window update became due.
    ///
    /// Consuming more than received is an internal error, it is latched and returned.
    pub fn on_bytes_read(&self, n: u64, rtt: Duration) -> Result<Option<u64>, Error> {
        if n == 0 {
            return Ok(None);
        }
        let mut guard = self.0.lock().unwrap();
        let window = guard.as_mut().map_err(|e| e.clone())?;
        let overflow = match window.add_bytes_read(n, rtt, Instant::now()) {
            Ok(update) => return Ok(update),
            Err(overflow) => overflow,
        };
        let reason = format!("connection read {} bytes more than it received", overflow.0);
        tracing::error!("   Cause by: {reason}");
        let error = Error::with_default_fty(ErrorKind::Internal, reason);
        *guard = Err(error.clone());
        Err(error)
    }

    /// Grow the connection window size to at least `min`.
    pub fn ensure_minimum_window(&self, min: u64) {
        if let Ok(window) = self.0.lock().unwrap().as_mut() {
            window.ensure_minimum_window(min, Instant::now());
        }
    }

    /// Take the pending MAX_DATA limit, if any.
    pub fn take_window_update(&self) -> Option<u64> {
        self.0.lock().unwrap().as_mut().ok()?.take_window_update()
    }

    /// The limit currently advertised to the peer.
    pub fn max_data(&self) -> Result<u64, Error> {
        match self.0.lock().unwrap().as_ref() {
            Ok(window) => Ok(window.max_data()),
            Err(e) => Err(e.clone()),
        }
    }

    pub fn on_conn_error(&self, error: &Error) {
        let mut guard = self.0.lock().unwrap();
        if guard.is_ok() {
            *guard = Err(error.clone());
        }
    }
}

/// The pair of connection-level flow controllers.
#[derive(Debug, Clone)]
pub struct FlowController<TX> {
    pub sender: ArcSendController<TX>,
    pub recver: ArcRecvController,
}

impl<TX> FlowController<TX>
where
    TX: SendFrame<DataBlockedFrame>,
{
    /// `peer_initial_max_data` is what the peer allows us to send,
    /// `local_initial_max_data` is what we allow the peer to send.
    pub fn new(
        peer_initial_max_data: u64,
        local_initial_max_data: u64,
        local_max_data_window: u64,
        auto_tune: bool,
        blocked_tx: TX,
    ) -> Self {
        Self {
            sender: ArcSendController::new(peer_initial_max_data, blocked_tx),
            recver: ArcRecvController::new(local_initial_max_data, local_max_data_window, auto_tune),
        }
    }

    pub fn on_conn_error(&self, error: &Error) {
        self.sender.on_conn_error(error);
        self.recver.on_conn_error(error);
    }
}
