// Bounded byte window between source delivery and the decoder

mod reader;

pub use reader::BufferReader;

use parking_lot::{Condvar, Mutex};
use spool_core::BufferConfig;
use std::collections::VecDeque;
use std::sync::Arc;

/// Result of a producer push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Push {
    pub accepted: usize,
    /// Free space left after the push
    pub space: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStatus {
    /// Got everything asked for
    Data,
    /// Got less than asked for; more may come
    Short,
    /// Buffer drained and no more bytes will come
    EndOfStream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pull {
    pub data: Vec<u8>,
    pub status: PullStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillLevel {
    /// `available <= low`
    Starved,
    Normal,
    /// `available >= high`; producers should hold off
    Sated,
}

pub(crate) struct State {
    /// Bytes `[base, write)`; everything before `read` is history
    pub(crate) data: VecDeque<u8>,
    pub(crate) base: u64,
    pub(crate) read: u64,
    pub(crate) capacity: usize,
    history: usize,
    low: usize,
    high: usize,
    pub(crate) eos: bool,
    pub(crate) total_len: Option<u64>,
    pub(crate) interrupted: bool,
    pub(crate) closed: bool,
    reposition: Option<u64>,
    generation: u64,
}

impl State {
    pub(crate) fn write(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    pub(crate) fn available(&self) -> usize {
        (self.write() - self.read) as usize
    }

    fn space(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    fn check_end(&mut self) {
        if let Some(total) = self.total_len {
            if self.write() >= total {
                self.eos = true;
            }
        }
    }

    /// Drop history beyond the configured amount
    pub(crate) fn trim_history(&mut self) {
        let behind = (self.read - self.base) as usize;
        if behind > self.history {
            let excess = behind - self.history;
            self.data.drain(..excess);
            self.base += excess as u64;
        }
    }

    pub(crate) fn copy_out(&self, offset: u64, dst: &mut [u8]) -> usize {
        let start = (offset - self.base) as usize;
        let n = dst.len().min(self.data.len().saturating_sub(start));
        for (d, s) in dst[..n].iter_mut().zip(self.data.range(start..start + n)) {
            *d = *s;
        }
        n
    }

    pub(crate) fn reset_to(&mut self, offset: u64) {
        self.data.clear();
        self.base = offset;
        self.read = offset;
        self.eos = self.total_len.map_or(false, |total| offset >= total);
        self.generation += 1;
    }

    pub(crate) fn request_reposition(&mut self, offset: u64) {
        self.reset_to(offset);
        self.reposition = Some(offset);
    }
}

fn append(st: &mut State, cvar: &Condvar, bytes: &[u8]) -> Push {
    if st.closed {
        return Push {
            accepted: 0,
            space: 0,
        };
    }
    let mut accepted = bytes.len().min(st.space());
    if let Some(total) = st.total_len {
        accepted = accepted.min(total.saturating_sub(st.write()) as usize);
    }
    st.data.extend(&bytes[..accepted]);
    st.check_end();
    if accepted > 0 || st.eos {
        cvar.notify_all();
    }
    Push {
        accepted,
        space: st.space(),
    }
}

/// Single-producer single-consumer streaming byte buffer.
///
/// Cursors are absolute track offsets: `read <= write` and
/// `write - read <= capacity` always hold. Clones share the same buffer.
#[derive(Clone)]
pub struct StreamingBuffer {
    inner: Arc<(Mutex<State>, Condvar)>,
}

impl StreamingBuffer {
    pub fn new(config: &BufferConfig) -> Self {
        Self::with_limits(
            config.capacity,
            config.low_watermark,
            config.high_watermark,
            config.history,
        )
    }

    pub fn with_limits(capacity: usize, low: usize, high: usize, history: usize) -> Self {
        let state = State {
            data: VecDeque::with_capacity(capacity.min(1 << 20)),
            base: 0,
            read: 0,
            capacity,
            history,
            low,
            high: high.min(capacity),
            eos: false,
            total_len: None,
            interrupted: false,
            closed: false,
            reposition: None,
            generation: 0,
        };
        Self {
            inner: Arc::new((Mutex::new(state), Condvar::new())),
        }
    }

    pub(crate) fn shared(&self) -> &(Mutex<State>, Condvar) {
        &self.inner
    }

    /// Append at the write cursor, up to the free space
    pub fn push(&self, bytes: &[u8]) -> Push {
        let (lock, cvar) = &*self.inner;
        let mut st = lock.lock();
        append(&mut st, cvar, bytes)
    }

    /// Append only if `offset` is the current write cursor.
    ///
    /// A mismatch means the consumer repositioned the buffer since the
    /// producer last looked; nothing is accepted.
    pub fn push_at(&self, offset: u64, bytes: &[u8]) -> Push {
        let (lock, cvar) = &*self.inner;
        let mut st = lock.lock();
        if st.write() != offset {
            return Push {
                accepted: 0,
                space: st.space(),
            };
        }
        append(&mut st, cvar, bytes)
    }

    /// Take up to `max` bytes without blocking
    pub fn pull(&self, max: usize) -> Pull {
        let (lock, cvar) = &*self.inner;
        let mut st = lock.lock();
        let n = max.min(st.available());
        let mut data = vec![0u8; n];
        let read = st.read;
        st.copy_out(read, &mut data);
        st.read += n as u64;
        st.trim_history();
        if n > 0 {
            cvar.notify_all();
        }

        let status = if st.eos && st.available() == 0 {
            PullStatus::EndOfStream
        } else if n == max {
            PullStatus::Data
        } else {
            PullStatus::Short
        };
        Pull { data, status }
    }

    pub fn available(&self) -> usize {
        self.inner.0.lock().available()
    }

    pub fn space(&self) -> usize {
        self.inner.0.lock().space()
    }

    pub fn capacity(&self) -> usize {
        self.inner.0.lock().capacity
    }

    pub fn watermarks(&self) -> (usize, usize) {
        let st = self.inner.0.lock();
        (st.low, st.high)
    }

    pub fn fill_level(&self) -> FillLevel {
        let st = self.inner.0.lock();
        let available = st.available();
        if available <= st.low {
            FillLevel::Starved
        } else if available >= st.high {
            FillLevel::Sated
        } else {
            FillLevel::Normal
        }
    }

    pub fn write_offset(&self) -> u64 {
        self.inner.0.lock().write()
    }

    pub fn read_offset(&self) -> u64 {
        self.inner.0.lock().read
    }

    /// No more bytes will be pushed
    pub fn mark_end_of_stream(&self) {
        let (lock, cvar) = &*self.inner;
        lock.lock().eos = true;
        cvar.notify_all();
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.inner.0.lock().eos
    }

    /// End of stream reached and every byte consumed
    pub fn is_drained(&self) -> bool {
        let st = self.inner.0.lock();
        st.eos && st.available() == 0
    }

    pub fn set_total_len(&self, total: u64) {
        let (lock, cvar) = &*self.inner;
        let mut st = lock.lock();
        st.total_len = Some(total);
        st.check_end();
        cvar.notify_all();
    }

    pub fn total_len(&self) -> Option<u64> {
        self.inner.0.lock().total_len
    }

    /// Flush everything and restart both cursors at `offset`
    pub fn reset_to(&self, offset: u64) {
        let (lock, cvar) = &*self.inner;
        lock.lock().reset_to(offset);
        cvar.notify_all();
    }

    /// Offset the consumer jumped to outside the buffered window, if any
    pub fn take_reposition(&self) -> Option<u64> {
        self.inner.0.lock().reposition.take()
    }

    /// Number of resets so far
    pub fn generation(&self) -> u64 {
        self.inner.0.lock().generation
    }

    /// Wake a blocked reader with an error; stays set until cleared
    pub fn interrupt(&self) {
        let (lock, cvar) = &*self.inner;
        lock.lock().interrupted = true;
        cvar.notify_all();
    }

    pub fn clear_interrupt(&self) {
        self.inner.0.lock().interrupted = false;
    }

    /// Permanently shut the buffer; readers fail and pushes are dropped
    pub fn close(&self) {
        let (lock, cvar) = &*self.inner;
        let mut st = lock.lock();
        st.closed = true;
        st.data.clear();
        cvar.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.0.lock().closed
    }

    /// Copy of `[offset, offset + len)` if it is still held
    pub fn peek_at(&self, offset: u64, len: usize) -> Option<Vec<u8>> {
        let st = self.inner.0.lock();
        if offset < st.base || offset + len as u64 > st.write() {
            return None;
        }
        let mut data = vec![0u8; len];
        st.copy_out(offset, &mut data);
        Some(data)
    }

    /// Blocking reader positioned at the current read cursor
    pub fn reader(&self) -> BufferReader {
        BufferReader::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(capacity: usize) -> StreamingBuffer {
        StreamingBuffer::with_limits(capacity, capacity / 8, capacity / 2, capacity / 4)
    }

    #[test]
    fn test_push_respects_capacity() {
        let buf = buffer(100);
        let push = buf.push(&[1u8; 150]);
        assert_eq!(push.accepted, 100);
        assert_eq!(push.space, 0);
        assert_eq!(buf.available(), 100);

        let pull = buf.pull(40);
        assert_eq!(pull.data.len(), 40);
        assert_eq!(pull.status, PullStatus::Data);
        assert_eq!(buf.space(), 40);
    }

    #[test]
    fn test_short_versus_end_of_stream() {
        let buf = buffer(100);
        buf.push(b"abc");
        let pull = buf.pull(10);
        assert_eq!(pull.data, b"abc");
        assert_eq!(pull.status, PullStatus::Short);

        assert_eq!(buf.pull(10).status, PullStatus::Short);

        buf.push(b"de");
        buf.mark_end_of_stream();
        let pull = buf.pull(10);
        assert_eq!(pull.data, b"de");
        assert_eq!(pull.status, PullStatus::EndOfStream);
        assert!(buf.is_drained());
    }

    #[test]
    fn test_pull_never_exceeds_pushed() {
        let buf = buffer(64);
        let mut pushed = 0usize;
        let mut pulled = 0usize;
        for round in 0..50usize {
            pushed += buf.push(&vec![round as u8; (round * 7) % 40]).accepted;
            pulled += buf.pull((round * 5) % 30).data.len();
            assert!(pulled <= pushed);
            assert!(buf.available() <= buf.capacity());
            assert_eq!(buf.available(), pushed - pulled);
            assert_eq!(buf.write_offset() - buf.read_offset(), (pushed - pulled) as u64);
        }
    }

    #[test]
    fn test_fill_levels() {
        let buf = StreamingBuffer::with_limits(10_000, 2000, 8000, 0);
        assert_eq!(buf.fill_level(), FillLevel::Starved);
        buf.push(&[0u8; 1500]);
        assert_eq!(buf.fill_level(), FillLevel::Starved);
        buf.push(&[0u8; 1000]);
        assert_eq!(buf.fill_level(), FillLevel::Normal);
        buf.push(&[0u8; 5500]);
        assert_eq!(buf.fill_level(), FillLevel::Sated);
        assert_eq!(buf.watermarks(), (2000, 8000));
    }

    #[test]
    fn test_push_at_rejects_stale_offset() {
        let buf = buffer(100);
        assert_eq!(buf.push_at(0, b"hello").accepted, 5);
        assert_eq!(buf.push_at(0, b"hello").accepted, 0);
        assert_eq!(buf.push_at(9, b"x").accepted, 0);
        assert_eq!(buf.push_at(5, b" world").accepted, 6);

        buf.reset_to(500);
        assert_eq!(buf.push_at(11, b"!").accepted, 0);
        assert_eq!(buf.push_at(500, b"!").accepted, 1);
        assert_eq!(buf.read_offset(), 500);
    }

    #[test]
    fn test_total_len_marks_end() {
        let buf = buffer(100);
        buf.set_total_len(4);
        assert_eq!(buf.push(b"abcdef").accepted, 4);
        assert!(buf.is_end_of_stream());

        buf.reset_to(4);
        assert!(buf.is_end_of_stream());
        buf.reset_to(2);
        assert!(!buf.is_end_of_stream());
    }

    #[test]
    fn test_history_is_bounded() {
        let buf = StreamingBuffer::with_limits(100, 10, 50, 20);
        buf.push(&(0u8..100).collect::<Vec<_>>());
        buf.pull(60);
        assert_eq!(buf.peek_at(40, 5), Some(vec![40, 41, 42, 43, 44]));
        assert_eq!(buf.peek_at(39, 1), None);
        assert_eq!(buf.peek_at(95, 10), None);
    }

    #[test]
    fn test_close_drops_pushes() {
        let buf = buffer(100);
        buf.close();
        assert_eq!(buf.push(b"abc").accepted, 0);
        assert!(buf.is_closed());
    }
}
