// Blocking Read + Seek view of a StreamingBuffer for the decoder thread

use crate::StreamingBuffer;
use spool_core::ByteSource;
use std::io::{self, Read, Seek, SeekFrom};
use std::time::Duration;

/// How long a blocked read sleeps before re-checking its flags
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Consumer side of a [`StreamingBuffer`].
///
/// `read` blocks until bytes arrive, the stream ends, or the buffer is
/// interrupted or closed. Interrupts surface as `ErrorKind::Other` rather than
/// `Interrupted`, which readers would silently retry.
pub struct BufferReader {
    buffer: StreamingBuffer,
    pos: u64,
}

impl BufferReader {
    pub(crate) fn new(buffer: StreamingBuffer) -> Self {
        let pos = buffer.read_offset();
        Self { buffer, pos }
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn buffer(&self) -> &StreamingBuffer {
        &self.buffer
    }
}

impl Read for BufferReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let (lock, cvar) = self.buffer.shared();
        let mut st = lock.lock();
        loop {
            if st.closed {
                return Err(io::Error::new(io::ErrorKind::Other, "buffer closed"));
            }
            if st.interrupted {
                return Err(io::Error::new(io::ErrorKind::Other, "read interrupted"));
            }

            // The window moved under us (reset by a seek elsewhere)
            if self.pos < st.read {
                self.pos = st.read;
            }

            let write = st.write();
            if self.pos < write {
                let n = st.copy_out(self.pos, buf);
                self.pos += n as u64;
                st.read = self.pos;
                st.trim_history();
                cvar.notify_all();
                return Ok(n);
            }

            if st.eos {
                return Ok(0);
            }

            // Skipping forward: everything buffered so far is behind us
            if st.read < write {
                st.read = write;
                st.trim_history();
                cvar.notify_all();
            }

            cvar.wait_for(&mut st, WAIT_SLICE);
        }
    }
}

impl Seek for BufferReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (lock, cvar) = self.buffer.shared();
        let mut st = lock.lock();

        let target = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => offset_by(self.pos, delta)?,
            SeekFrom::End(delta) => {
                let total = st.total_len.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "stream length unknown")
                })?;
                offset_by(total, delta)?
            }
        };

        if target == self.pos {
            return Ok(target);
        }

        let write = st.write();
        let capacity = st.capacity as u64;

        if target >= st.base && target <= write && write - target <= capacity {
            // Inside the retained window, including history
            self.pos = target;
            st.read = target;
            st.trim_history();
        } else if target > write && (st.eos || target - write <= capacity / 2) {
            // Close enough ahead: the bytes are on their way
            self.pos = target;
            st.read = write;
            st.trim_history();
        } else {
            log::debug!(
                "[buffer] reader seek to {} outside window [{}, {}), repositioning",
                target,
                st.base,
                write
            );
            st.request_reposition(target);
            self.pos = target;
        }
        cvar.notify_all();
        Ok(target)
    }
}

fn offset_by(base: u64, delta: i64) -> io::Result<u64> {
    let target = base as i128 + delta as i128;
    if target < 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "seek before start of stream",
        ));
    }
    Ok(target as u64)
}

impl ByteSource for BufferReader {
    fn byte_len(&self) -> Option<u64> {
        self.buffer.total_len()
    }

    fn has_bytes(&self, min: usize) -> bool {
        let st = self.buffer.shared().0.lock();
        if st.closed || st.eos {
            return true;
        }
        st.write().saturating_sub(self.pos) >= min as u64
    }

    fn peek_header(&self, len: usize) -> Option<Vec<u8>> {
        let st = self.buffer.shared().0.lock();
        if st.base != 0 {
            return None;
        }
        let held = st.write().min(len as u64) as usize;
        if held < len && !st.eos {
            return None;
        }
        let mut data = vec![0u8; held];
        st.copy_out(0, &mut data);
        Some(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_read_blocks_until_push() {
        let buf = StreamingBuffer::with_limits(1024, 64, 512, 128);
        let mut reader = buf.reader();

        let producer = buf.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            producer.push(b"late bytes");
        });

        let mut out = [0u8; 32];
        let n = reader.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"late bytes");
        handle.join().unwrap();
    }

    #[test]
    fn test_read_returns_zero_at_end() {
        let buf = StreamingBuffer::with_limits(1024, 64, 512, 128);
        buf.push(b"xyz");
        buf.mark_end_of_stream();

        let mut reader = buf.reader();
        let mut all = Vec::new();
        reader.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"xyz");
        assert!(reader.has_bytes(1 << 20));
    }

    #[test]
    fn test_interrupt_unblocks_reader() {
        let buf = StreamingBuffer::with_limits(1024, 64, 512, 128);
        let mut reader = buf.reader();
        let control = buf.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            control.interrupt();
        });

        let err = reader.read(&mut [0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        handle.join().unwrap();

        buf.clear_interrupt();
        buf.push(b"ok");
        let mut out = [0u8; 2];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"ok");
    }

    #[test]
    fn test_seek_within_history() {
        let buf = StreamingBuffer::with_limits(1024, 64, 512, 128);
        buf.push(&(0u8..200).collect::<Vec<_>>());
        let mut reader = buf.reader();
        let mut out = [0u8; 100];
        reader.read_exact(&mut out).unwrap();

        reader.seek(SeekFrom::Current(-50)).unwrap();
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 50);
        assert_eq!(buf.take_reposition(), None);
    }

    #[test]
    fn test_far_seek_requests_reposition() {
        let buf = StreamingBuffer::with_limits(1024, 64, 512, 128);
        buf.push(&[7u8; 300]);
        let mut reader = buf.reader();

        assert_eq!(reader.seek(SeekFrom::Start(100_000)).unwrap(), 100_000);
        assert_eq!(buf.take_reposition(), Some(100_000));
        assert_eq!(buf.take_reposition(), None);
        assert_eq!(buf.available(), 0);
        assert_eq!(buf.write_offset(), 100_000);

        buf.push_at(100_000, b"far");
        let mut out = [0u8; 3];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"far");
    }

    #[test]
    fn test_short_forward_skip_waits_for_bytes() {
        let buf = StreamingBuffer::with_limits(1024, 64, 512, 128);
        buf.push(&[0u8; 10]);
        let mut reader = buf.reader();
        reader.seek(SeekFrom::Start(20)).unwrap();
        assert_eq!(buf.take_reposition(), None);
        assert!(!reader.has_bytes(1));

        let mut data = vec![0u8; 10];
        data.extend_from_slice(b"hit");
        buf.push(&data);
        let mut out = [0u8; 3];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"hit");
    }

    #[test]
    fn test_seek_from_end_needs_length() {
        let buf = StreamingBuffer::with_limits(1024, 64, 512, 128);
        let mut reader = buf.reader();
        assert!(reader.seek(SeekFrom::End(-4)).is_err());

        buf.set_total_len(100);
        buf.push(&[1u8; 100]);
        assert_eq!(reader.seek(SeekFrom::End(-4)).unwrap(), 96);
    }

    #[test]
    fn test_peek_header() {
        let buf = StreamingBuffer::with_limits(1024, 64, 512, 128);
        let reader = buf.reader();
        buf.push(b"fLa");
        assert_eq!(reader.peek_header(4), None);
        buf.push(b"C....");
        assert_eq!(reader.peek_header(4), Some(b"fLaC".to_vec()));
    }
}
