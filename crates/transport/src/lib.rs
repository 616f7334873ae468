// Source fetchers: HTTP, local file and memory

pub mod client;
pub mod fetcher;
pub mod file;
pub mod http;
pub mod memory;

pub use client::HttpClient;
pub use fetcher::{FetchEvent, FetchMessage, FetchSink, FetcherFactory, SourceFetcher};
pub use file::FileFetcher;
pub use http::HttpFetcher;
pub use memory::MemoryFetcher;

use spool_core::{FetchConfig, Result, TrackSource};

/// Picks the fetcher matching each source kind
pub struct DefaultFetcherFactory {
    client: HttpClient,
    config: FetchConfig,
}

impl DefaultFetcherFactory {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            client: HttpClient::new(config),
            config: config.clone(),
        }
    }
}

impl FetcherFactory for DefaultFetcherFactory {
    fn create(&self, source: &TrackSource) -> Result<Box<dyn SourceFetcher>> {
        Ok(match source {
            TrackSource::Http(url) => Box::new(HttpFetcher::new(self.client.clone(), url.clone(), &self.config)),
            TrackSource::File(path) => Box::new(FileFetcher::new(path.clone(), &self.config)),
            TrackSource::Memory { data, .. } => Box::new(MemoryFetcher::new(data.clone(), &self.config)),
        })
    }
}
