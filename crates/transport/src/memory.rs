// In-memory fetcher

use crate::fetcher::{chunk_size, spawn_transfer, FetchEvent, FetchSink, SourceFetcher, TransferSlot};
use spool_core::{AudioError, FetchConfig, Result};
use std::io::{self, Cursor};
use std::sync::Arc;

pub struct MemoryFetcher {
    data: Arc<[u8]>,
    chunk_size: usize,
    slot: TransferSlot,
}

impl MemoryFetcher {
    pub fn new(data: Arc<[u8]>, config: &FetchConfig) -> Self {
        Self {
            data,
            chunk_size: chunk_size(config),
            slot: TransferSlot::default(),
        }
    }
}

impl SourceFetcher for MemoryFetcher {
    fn start(&mut self, from: u64, sink: FetchSink) -> Result<u64> {
        let transfer = self.slot.begin(sink);
        let data = self.data.clone();
        let chunk_size = self.chunk_size;

        spawn_transfer("memory", transfer, move |transfer| {
            let len = data.len() as u64;
            let start = from.min(len);
            if !transfer.emit(FetchEvent::Opened {
                offset: from,
                total_len: Some(len),
            }) {
                return;
            }
            let mut cursor = Cursor::new(&data[start as usize..]);
            transfer.pump(&mut cursor, start, chunk_size, memory_error);
        })
    }

    fn cancel(&mut self) {
        self.slot.cancel();
    }
}

fn memory_error(err: io::Error) -> AudioError {
    AudioError::Io(err.to_string())
}
