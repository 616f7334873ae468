// Local file fetcher

use crate::fetcher::{chunk_size, spawn_transfer, FetchEvent, FetchSink, SourceFetcher, TransferSlot};
use spool_core::{AudioError, FetchConfig, Result};
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::path::PathBuf;

pub struct FileFetcher {
    path: PathBuf,
    chunk_size: usize,
    slot: TransferSlot,
}

impl FileFetcher {
    pub fn new(path: impl Into<PathBuf>, config: &FetchConfig) -> Self {
        Self {
            path: path.into(),
            chunk_size: chunk_size(config),
            slot: TransferSlot::default(),
        }
    }
}

impl SourceFetcher for FileFetcher {
    fn start(&mut self, from: u64, sink: FetchSink) -> Result<u64> {
        let transfer = self.slot.begin(sink);
        let path = self.path.clone();
        let chunk_size = self.chunk_size;

        spawn_transfer("file", transfer, move |transfer| {
            let opened = File::open(&path).and_then(|mut file| {
                let len = file.metadata()?.len();
                file.seek(SeekFrom::Start(from.min(len)))?;
                Ok((file, len))
            });

            let (mut file, len) = match opened {
                Ok(opened) => opened,
                Err(e) => {
                    log::warn!("[fetch] cannot open {}: {}", path.display(), e);
                    transfer.emit(FetchEvent::Failed(AudioError::PersistentSource(format!(
                        "open {}: {}",
                        path.display(),
                        e
                    ))));
                    return;
                }
            };

            if !transfer.emit(FetchEvent::Opened {
                offset: from,
                total_len: Some(len),
            }) {
                return;
            }
            transfer.pump(&mut file, from.min(len), chunk_size, file_error);
        })
    }

    fn cancel(&mut self) {
        self.slot.cancel();
    }
}

fn file_error(err: io::Error) -> AudioError {
    AudioError::PersistentSource(format!("read failed: {}", err))
}
