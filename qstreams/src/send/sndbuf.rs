use std::{collections::VecDeque, ops::Range};

use bytes::{BufMut, Bytes, BytesMut};

/// The sending buffer of a stream.
///
/// Data written by the application is queued until the packetizer picks it up.
/// Picked data leaves the buffer, its retransmission is the business of the packet layer,
/// only the acknowledged ranges are still tracked here to tell when everything arrived.
#[derive(Debug, Default)]
pub struct SendBuf {
    written: u64,
    sent: u64,
    unsent: VecDeque<Bytes>,
    // merged, sorted, never adjacent
    acked: Vec<Range<u64>>,
}

impl SendBuf {
    /// The total amount of bytes ever written, the final size once the stream is finished.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// The amount of bytes already handed to the packetizer.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn has_unsent(&self) -> bool {
        self.sent < self.written
    }

    pub fn write(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.written += data.len() as u64;
            self.unsent.push_back(data);
        }
    }

    /// Pick up at most `max_len` bytes of unsent data, with the offset they start at.
    ///
    /// # Example
    ///
    /// ```
    /// # use bytes::Bytes;
    /// # use qstreams::send::SendBuf;
    /// let mut sndbuf = SendBuf::default();
    /// sndbuf.write(Bytes::from("hello "));
    /// sndbuf.write(Bytes::from("world"));
    /// assert_eq!(sndbuf.pick_up(8), Some((0, Bytes::from("hello wo"))));
    /// assert_eq!(sndbuf.pick_up(8), Some((8, Bytes::from("rld"))));
    /// assert_eq!(sndbuf.pick_up(8), None);
    /// ```
    pub fn pick_up(&mut self, max_len: usize) -> Option<(u64, Bytes)> {
        if max_len == 0 {
            return None;
        }
        let front = self.unsent.front_mut()?;
        let data = if front.len() >= max_len {
            let data = front.split_to(max_len);
            if front.is_empty() {
                self.unsent.pop_front();
            }
            data
        } else if self.unsent.len() == 1 {
            self.unsent.pop_front()?
        } else {
            // coalesce the small writes into one frame
            let mut data = BytesMut::with_capacity(max_len);
            while data.len() < max_len {
                let Some(front) = self.unsent.front_mut() else {
                    break;
                };
                let n = front.len().min(max_len - data.len());
                data.put(front.split_to(n));
                if front.is_empty() {
                    self.unsent.pop_front();
                }
            }
            data.freeze()
        };

        let offset = self.sent;
        self.sent += data.len() as u64;
        Some((offset, data))
    }

    /// Record the peer acknowledged the data in `range`.
    pub fn on_data_acked(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        let start = self.acked.partition_point(|r| r.end < range.start);
        let end = self.acked.partition_point(|r| r.start <= range.end);
        if start == end {
            self.acked.insert(start, range);
        } else {
            let merged_start = self.acked[start].start.min(range.start);
            let merged_end = self.acked[end - 1].end.max(range.end);
            self.acked.splice(start..end, [merged_start..merged_end]);
        }
    }

    /// Whether every byte written so far has been acknowledged.
    pub fn is_all_rcvd(&self) -> bool {
        self.written == 0
            || self
                .acked
                .first()
                .is_some_and(|r| r.start == 0 && r.end >= self.written)
    }

    /// Drop all unsent data, used once the stream is reset.
    pub fn clear(&mut self) {
        self.unsent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_up_splits_and_coalesces() {
        let mut sndbuf = SendBuf::default();
        sndbuf.write(Bytes::from("abcdef"));
        assert_eq!(sndbuf.pick_up(4), Some((0, Bytes::from("abcd"))));
        sndbuf.write(Bytes::from("gh"));
        sndbuf.write(Bytes::new());
        sndbuf.write(Bytes::from("ijk"));
        assert_eq!(sndbuf.pick_up(100), Some((4, Bytes::from("efghijk"))));
        assert!(!sndbuf.has_unsent());
        assert_eq!(sndbuf.written(), 11);
        assert_eq!(sndbuf.pick_up(100), None);
    }

    #[test]
    fn test_acked_ranges_merge() {
        let mut sndbuf = SendBuf::default();
        sndbuf.write(Bytes::from(vec![0; 30]));
        sndbuf.on_data_acked(10..20);
        sndbuf.on_data_acked(25..30);
        assert_eq!(sndbuf.acked, vec![10..20, 25..30]);
        assert!(!sndbuf.is_all_rcvd());

        sndbuf.on_data_acked(0..5);
        sndbuf.on_data_acked(0..5);
        assert_eq!(sndbuf.acked, vec![0..5, 10..20, 25..30]);
        sndbuf.on_data_acked(5..25);
        assert_eq!(sndbuf.acked, vec![0..30]);
        assert!(sndbuf.is_all_rcvd());
    }

    #[test]
    fn test_empty_is_all_rcvd() {
        let mut sndbuf = SendBuf::default();
        assert!(sndbuf.is_all_rcvd());
        sndbuf.write(Bytes::from("x"));
        assert!(!sndbuf.is_all_rcvd());
        sndbuf.clear();
        assert_eq!(sndbuf.pick_up(10), None);
    }
}
