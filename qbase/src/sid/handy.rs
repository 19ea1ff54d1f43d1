use super::{ControlStreamsConcurrency, Dir};

/// Consistent concurrency strategy increases limits as streams are reclaimed,
/// to keep the number of streams available to the peer constant.
#[derive(Debug)]
pub struct ConsistentConcurrency {
    max_streams: [u64; 2],
}

impl ConsistentConcurrency {
    pub fn new(initial_max_bi: u64, initial_max_uni: u64) -> Self {
        Self {
            max_streams: [initial_max_bi, initial_max_uni],
        }
    }
}

impl ControlStreamsConcurrency for ConsistentConcurrency {
    fn on_accept_streams(&mut self, _dir: Dir, _sid: u64) -> Option<u64> {
        None
    }

    fn on_end_of_stream(&mut self, dir: Dir, _sid: u64) -> Option<u64> {
        let limit = &mut self.max_streams[dir as usize];
        if *limit >= super::MAX_STREAMS_LIMIT {
            return None;
        }
        *limit += 1;
        Some(*limit)
    }

    fn on_streams_blocked(&mut self, _dir: Dir, _max_streams: u64) -> Option<u64> {
        None
    }
}

/// Demand concurrency strategy increases limits whenever the peer reports
/// being blocked by a [`StreamsBlockedFrame`](crate::frame::StreamsBlockedFrame).
#[derive(Debug)]
pub struct DemandConcurrency;

impl ControlStreamsConcurrency for DemandConcurrency {
    fn on_accept_streams(&mut self, _dir: Dir, _sid: u64) -> Option<u64> {
        None
    }

    fn on_end_of_stream(&mut self, _dir: Dir, _sid: u64) -> Option<u64> {
        None
    }

    fn on_streams_blocked(&mut self, _dir: Dir, max_streams: u64) -> Option<u64> {
        (max_streams < super::MAX_STREAMS_LIMIT).then_some(max_streams + 1)
    }
}
