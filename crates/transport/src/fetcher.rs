// Fetcher contract and the transfer bookkeeping shared by all fetchers

use crossbeam_channel::Sender;
use spool_core::{AudioError, FetchConfig, Result, TrackSource};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What a transfer reports back
#[derive(Debug)]
pub enum FetchEvent {
    /// The source answered; bytes will start at `offset`
    Opened { offset: u64, total_len: Option<u64> },
    Chunk { offset: u64, bytes: Vec<u8> },
    /// The source has no bytes past `end`
    Complete { end: u64 },
    Failed(AudioError),
}

/// An event tagged with the session and transfer that produced it
#[derive(Debug)]
pub struct FetchMessage {
    pub session: u64,
    pub generation: u64,
    pub event: FetchEvent,
}

/// Where a fetcher delivers its events
#[derive(Clone)]
pub struct FetchSink {
    session: u64,
    tx: Sender<FetchMessage>,
}

impl FetchSink {
    pub fn new(session: u64, tx: Sender<FetchMessage>) -> Self {
        Self { session, tx }
    }

    /// Deliver one event; false once the receiving side is gone
    pub fn send(&self, generation: u64, event: FetchEvent) -> bool {
        self.tx
            .send(FetchMessage {
                session: self.session,
                generation,
                event,
            })
            .is_ok()
    }
}

/// Asynchronous byte source for one track.
///
/// Fetchers never retry: failures are reported and the caller decides.
pub trait SourceFetcher: Send {
    /// Begin delivering bytes from `from`, cancelling any running transfer.
    /// Returns the generation tagging this transfer's events.
    fn start(&mut self, from: u64, sink: FetchSink) -> Result<u64>;

    /// Stop the running transfer; late chunks may still arrive
    fn cancel(&mut self);
}

/// Builds fetchers for track sources; injected into the player
pub trait FetcherFactory: Send + Sync {
    fn create(&self, source: &TrackSource) -> Result<Box<dyn SourceFetcher>>;
}

/// Handle given to a transfer thread
pub(crate) struct Transfer {
    generation: u64,
    cancelled: Arc<AtomicBool>,
    sink: FetchSink,
}

impl Transfer {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Send unless cancelled; false means the transfer should stop
    pub fn emit(&self, event: FetchEvent) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.sink.send(self.generation, event)
    }

    /// Read `reader` to its end in `chunk_size` pieces, starting at `offset`
    pub fn pump(
        &self,
        reader: &mut dyn Read,
        mut offset: u64,
        chunk_size: usize,
        on_error: fn(io::Error) -> AudioError,
    ) {
        loop {
            if self.is_cancelled() {
                log::debug!("[fetch] transfer {} cancelled at {}", self.generation, offset);
                return;
            }

            let mut chunk = vec![0u8; chunk_size];
            match read_chunk(reader, &mut chunk) {
                Ok(0) => {
                    self.emit(FetchEvent::Complete { end: offset });
                    return;
                }
                Ok(n) => {
                    chunk.truncate(n);
                    let at = offset;
                    offset += n as u64;
                    if !self.emit(FetchEvent::Chunk { offset: at, bytes: chunk }) {
                        return;
                    }
                }
                Err(e) => {
                    self.emit(FetchEvent::Failed(on_error(e)));
                    return;
                }
            }
        }
    }
}

/// Fill `buf` as far as the reader allows; short only at end of input
fn read_chunk(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if filled > 0 {
                    // Deliver what we have; the error repeats on the next read
                    return Ok(filled);
                }
                return Err(e);
            }
        }
    }
    Ok(filled)
}

/// Generation counter and cancel flag of a fetcher's current transfer
#[derive(Default)]
pub(crate) struct TransferSlot {
    generation: u64,
    current: Option<Arc<AtomicBool>>,
}

impl TransferSlot {
    pub fn begin(&mut self, sink: FetchSink) -> Transfer {
        self.cancel();
        self.generation += 1;
        let cancelled = Arc::new(AtomicBool::new(false));
        self.current = Some(cancelled.clone());
        Transfer {
            generation: self.generation,
            cancelled,
            sink,
        }
    }

    pub fn cancel(&mut self) {
        if let Some(flag) = self.current.take() {
            flag.store(true, Ordering::Release);
        }
    }
}

/// Run `body` on a named transfer thread
pub(crate) fn spawn_transfer<F>(name: &str, transfer: Transfer, body: F) -> Result<u64>
where
    F: FnOnce(Transfer) + Send + 'static,
{
    let generation = transfer.generation();
    std::thread::Builder::new()
        .name(format!("spool-fetch-{}", name))
        .spawn(move || body(transfer))
        .map_err(|e| AudioError::Io(format!("spawn fetch thread: {}", e)))?;
    Ok(generation)
}

/// Chunk size to use for a config, never zero
pub(crate) fn chunk_size(config: &FetchConfig) -> usize {
    config.chunk_size.max(1)
}
