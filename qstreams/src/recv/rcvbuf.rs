use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes};

/// A contiguous piece of received data, starting at `offset` of the stream.
#[derive(Debug)]
struct Segment {
    offset: u64,
    data: Bytes,
}

impl Segment {
    fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Reassembles the received fragments of a stream into an ordered byte stream.
///
/// Fragments may arrive out of order, duplicated, or overlapping each other.
/// Only the bytes not stored yet are kept, so every byte of the stream is buffered at most once,
/// and readers only ever see the contiguous data starting at [`RecvBuf::nread`].
#[derive(Debug, Default)]
pub struct RecvBuf {
    nread: u64,
    largest_offset: u64,
    // sorted by offset, never overlapping, all beyond nread
    segments: VecDeque<Segment>,
}

impl RecvBuf {
    /// Returns how many contiguous bytes have been read.
    ///
    /// # Example
    ///
    /// ```
    /// # use bytes::{Bytes, BytesMut};
    /// # use qstreams::recv::RecvBuf;
    /// let mut rcvbuf = RecvBuf::default();
    /// rcvbuf.recv(0, Bytes::from("hello"));
    /// assert_eq!(rcvbuf.nread(), 0);
    ///
    /// let mut dst = BytesMut::new();
    /// rcvbuf.try_read(&mut dst);
    /// assert_eq!(rcvbuf.nread(), 5);
    /// ```
    pub fn nread(&self) -> u64 {
        self.nread
    }

    /// Returns the end of the furthest fragment ever received.
    pub fn largest_offset(&self) -> u64 {
        self.largest_offset
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Store a fragment starting at `offset`, returns how many bytes of it were new.
    ///
    /// Bytes already read, or already buffered by earlier fragments, are discarded.
    /// The fragment must end within the stream offset space, at most 2^62-1,
    /// the receiving half rejects any frame beyond it before buffering.
    ///
    /// # Example
    ///
    /// ```
    /// # use bytes::Bytes;
    /// # use qstreams::recv::RecvBuf;
    /// let mut rcvbuf = RecvBuf::default();
    /// assert_eq!(rcvbuf.recv(4, Bytes::from("quic")), 4);
    /// assert_eq!(rcvbuf.recv(0, Bytes::from("gm-quic")), 4);
    /// assert_eq!(rcvbuf.available(), 8);
    /// ```
    #[tracing::instrument(level = "trace", skip(self, data), ret)]
    pub fn recv(&mut self, offset: u64, data: Bytes) -> u64 {
        let end = offset + data.len() as u64;
        self.largest_offset = self.largest_offset.max(end);
        if end <= self.nread {
            return 0;
        }

        let mut start = offset.max(self.nread);
        let mut data = data.slice((start - offset) as usize..);
        let mut stored = 0;
        let mut idx = self.segments.partition_point(|seg| seg.end() <= start);
        while !data.is_empty() {
            match self.segments.get(idx).map(|seg| (seg.offset, seg.end())) {
                // the head of the fragment is already buffered
                Some((seg_start, seg_end)) if seg_start <= start => {
                    let covered = (seg_end - start).min(data.len() as u64);
                    data.advance(covered as usize);
                    start += covered;
                    idx += 1;
                }
                Some((seg_start, _)) => {
                    let gap = (seg_start - start).min(data.len() as u64);
                    let piece = data.split_to(gap as usize);
                    self.segments.insert(
                        idx,
                        Segment {
                            offset: start,
                            data: piece,
                        },
                    );
                    stored += gap;
                    start += gap;
                    idx += 1;
                }
                None => {
                    stored += data.len() as u64;
                    self.segments.push_back(Segment {
                        offset: start,
                        data: std::mem::take(&mut data),
                    });
                }
            }
        }
        stored
    }

    /// The amount of contiguous bytes ready to be read.
    pub fn available(&self) -> u64 {
        let mut end = self.nread;
        for seg in &self.segments {
            if seg.offset != end {
                break;
            }
            end = seg.end();
        }
        end - self.nread
    }

    pub fn is_readable(&self) -> bool {
        self.segments
            .front()
            .is_some_and(|seg| seg.offset == self.nread)
    }

    /// Copy as much contiguous data as `dst` can take, returns the amount copied.
    #[tracing::instrument(level = "trace", skip(self, dst), ret)]
    pub fn try_read(&mut self, dst: &mut impl BufMut) -> usize {
        let mut read = 0;
        while dst.has_remaining_mut() {
            let Some(seg) = self.segments.front_mut() else {
                break;
            };
            if seg.offset != self.nread {
                break;
            }
            let n = seg.data.len().min(dst.remaining_mut());
            dst.put_slice(&seg.data[..n]);
            seg.data.advance(n);
            seg.offset += n as u64;
            self.nread += n as u64;
            read += n;
            if seg.data.is_empty() {
                self.segments.pop_front();
            }
        }
        read
    }

    /// Drop every buffered fragment, the read offset is kept.
    pub fn clear(&mut self) {
        self.segments.clear();
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    fn read_all(rcvbuf: &mut RecvBuf) -> Vec<u8> {
        let mut dst = BytesMut::new();
        rcvbuf.try_read(&mut dst);
        dst.to_vec()
    }

    #[test]
    fn test_recv_in_order() {
        let mut rcvbuf = RecvBuf::default();
        assert_eq!(rcvbuf.recv(0, Bytes::from("hello")), 5);
        assert_eq!(rcvbuf.recv(5, Bytes::from(" world")), 6);
        assert_eq!(rcvbuf.available(), 11);
        assert_eq!(read_all(&mut rcvbuf), b"hello world");
        assert!(rcvbuf.is_empty());
        assert_eq!(rcvbuf.nread(), 11);
    }

    #[test]
    fn test_recv_out_of_order() {
        let mut rcvbuf = RecvBuf::default();
        assert_eq!(rcvbuf.recv(6, Bytes::from("world")), 5);
        assert!(!rcvbuf.is_readable());
        assert_eq!(rcvbuf.available(), 0);
        assert_eq!(rcvbuf.largest_offset(), 11);

        assert_eq!(rcvbuf.recv(0, Bytes::from("hello ")), 6);
        assert!(rcvbuf.is_readable());
        assert_eq!(read_all(&mut rcvbuf), b"hello world");
    }

    #[test]
    fn test_recv_overlapping() {
        let mut rcvbuf = RecvBuf::default();
        rcvbuf.recv(2, Bytes::from("cd"));
        rcvbuf.recv(6, Bytes::from("gh"));
        // fills both gaps and extends the tail, the overlapped bytes are not stored twice
        assert_eq!(rcvbuf.recv(0, Bytes::from("abcdefghij")), 6);
        assert_eq!(rcvbuf.segments.len(), 5);
        assert_eq!(read_all(&mut rcvbuf), b"abcdefghij");

        // duplicates of read data are discarded
        assert_eq!(rcvbuf.recv(0, Bytes::from("abc")), 0);
        assert_eq!(rcvbuf.recv(8, Bytes::from("ijkl")), 2);
        assert_eq!(read_all(&mut rcvbuf), b"kl");
    }

    #[test]
    fn test_partial_read() {
        let mut rcvbuf = RecvBuf::default();
        rcvbuf.recv(0, Bytes::from("hello world"));
        let mut dst = [0u8; 4];
        let mut slice = &mut dst[..];
        assert_eq!(rcvbuf.try_read(&mut slice), 4);
        assert_eq!(&dst, b"hell");
        assert_eq!(rcvbuf.nread(), 4);
        assert_eq!(rcvbuf.available(), 7);

        rcvbuf.clear();
        assert_eq!(rcvbuf.available(), 0);
        assert_eq!(rcvbuf.nread(), 4);
    }
}
