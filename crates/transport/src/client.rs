// HTTP client configuration and utilities

use spool_core::{AudioError, FetchConfig};
use std::time::Duration;

/// Create a configured HTTP agent with proper timeouts and settings
pub fn create_http_agent(config: &FetchConfig) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(config.connect_timeout())
        .timeout_read(config.read_timeout())
        .timeout_write(Duration::from_secs(30))
        .user_agent(&config.user_agent)
        .redirects(10)
        .build()
}

/// HTTP client wrapper
#[derive(Clone)]
pub struct HttpClient {
    agent: ureq::Agent,
}

impl HttpClient {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            agent: create_http_agent(config),
        }
    }

    /// GET from `start` to the end of the resource.
    ///
    /// A 416 response is returned as `Ok` so the caller can read the total
    /// length from its `Content-Range` header.
    pub fn get_from(&self, url: &str, start: u64) -> Result<ureq::Response, AudioError> {
        let mut request = self.agent.get(url);
        if start > 0 {
            request = request.set("Range", &format!("bytes={}-", start));
        }

        match request.call() {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(416, response)) => Ok(response),
            Err(e) => Err(classify_error(e)),
        }
    }
}

/// Map a ureq failure onto the retry taxonomy.
///
/// Timeouts, throttling and server errors are worth retrying; anything else
/// the server says about the resource is final.
pub fn classify_error(err: ureq::Error) -> AudioError {
    match err {
        ureq::Error::Status(code, response) => {
            let message = format!("HTTP {} for {}", code, response.get_url());
            if code == 408 || code == 429 || code >= 500 {
                AudioError::TransientNetwork(message)
            } else {
                AudioError::PersistentSource(message)
            }
        }
        ureq::Error::Transport(transport) => match transport.kind() {
            ureq::ErrorKind::InvalidUrl | ureq::ErrorKind::UnknownScheme => {
                AudioError::PersistentSource(transport.to_string())
            }
            _ => AudioError::TransientNetwork(transport.to_string()),
        },
    }
}

/// Total length from a `Content-Range` header such as `bytes 0-99/1234`
pub fn parse_total_from_content_range(header: &str) -> Option<u64> {
    header.split('/').last()?.trim().parse::<u64>().ok()
}

/// Total length of the resource behind `response`, given the requested start
pub fn total_len_of(response: &ureq::Response, start: u64) -> Option<u64> {
    if let Some(total) = response
        .header("Content-Range")
        .and_then(parse_total_from_content_range)
    {
        return Some(total);
    }

    let length = response
        .header("Content-Length")
        .and_then(|s| s.trim().parse::<u64>().ok())?;
    match response.status() {
        // Full body regardless of the requested start
        200 => Some(length),
        206 => Some(start + length),
        _ => None,
    }
}
