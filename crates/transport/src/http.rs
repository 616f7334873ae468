// HTTP fetcher: resumable GET with Range requests

use crate::client::{total_len_of, HttpClient};
use crate::fetcher::{chunk_size, spawn_transfer, FetchEvent, FetchSink, SourceFetcher, TransferSlot};
use spool_core::{AudioError, FetchConfig, Result};
use std::io::{self, Read};

pub struct HttpFetcher {
    client: HttpClient,
    url: String,
    chunk_size: usize,
    slot: TransferSlot,
}

impl HttpFetcher {
    pub fn new(client: HttpClient, url: impl Into<String>, config: &FetchConfig) -> Self {
        Self {
            client,
            url: url.into(),
            chunk_size: chunk_size(config),
            slot: TransferSlot::default(),
        }
    }
}

impl SourceFetcher for HttpFetcher {
    fn start(&mut self, from: u64, sink: FetchSink) -> Result<u64> {
        let transfer = self.slot.begin(sink);
        let client = self.client.clone();
        let url = self.url.clone();
        let chunk_size = self.chunk_size;

        log::info!(
            "[fetch] http transfer {} from byte {}: {}",
            transfer.generation(),
            from,
            url
        );

        spawn_transfer("http", transfer, move |transfer| {
            let response = match client.get_from(&url, from) {
                Ok(response) => response,
                Err(e) => {
                    log::warn!("[fetch] request failed: {}", e);
                    transfer.emit(FetchEvent::Failed(e));
                    return;
                }
            };

            let status = response.status();
            let total_len = total_len_of(&response, from);

            if status == 416 {
                // Nothing at or past `from`
                if transfer.emit(FetchEvent::Opened {
                    offset: from,
                    total_len,
                }) {
                    transfer.emit(FetchEvent::Complete { end: from });
                }
                return;
            }

            let mut reader = response.into_reader();
            if status == 200 && from > 0 {
                // Server ignored the Range header; drop the prefix we already have
                log::debug!("[fetch] server ignored range, skipping {} bytes", from);
                match io::copy(&mut (&mut reader).take(from), &mut io::sink()) {
                    Ok(skipped) if skipped == from => {}
                    Ok(_) => {
                        transfer.emit(FetchEvent::Opened {
                            offset: from,
                            total_len,
                        });
                        transfer.emit(FetchEvent::Complete { end: from });
                        return;
                    }
                    Err(e) => {
                        transfer.emit(FetchEvent::Failed(network_error(e)));
                        return;
                    }
                }
            }

            if !transfer.emit(FetchEvent::Opened {
                offset: from,
                total_len,
            }) {
                return;
            }
            transfer.pump(&mut reader, from, chunk_size, network_error);
        })
    }

    fn cancel(&mut self) {
        self.slot.cancel();
    }
}

fn network_error(err: io::Error) -> AudioError {
    AudioError::TransientNetwork(format!("Download interrupted: {}", err))
}
