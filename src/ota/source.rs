use std::time::Duration;

use anyhow::Context;

use crate::error::FetchError;
use crate::BoxFuture;

/// Origin serving firmware images.
pub trait FirmwareSource: Send + Sync {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Box<dyn FirmwareDownload>, FetchError>>;
}

/// An open image download. Dropping it releases the connection.
pub trait FirmwareDownload: Send {
    /// Declared body length. `None` when the origin did not declare one or
    /// answered with an error status.
    fn content_length(&self) -> Option<u64>;

    /// Fill `buf` with the next bytes of the body. `Ok(0)` is end of body.
    fn read_chunk<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize, FetchError>>;
}

pub struct HttpFirmwareSource {
    client: reqwest::Client,
}

impl HttpFirmwareSource {
    /// No timeout means the fetch waits as long as the origin keeps the
    /// connection open.
    pub fn new(timeout: Option<Duration>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("building http client")?;
        Ok(Self { client })
    }
}

impl FirmwareSource for HttpFirmwareSource {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Box<dyn FirmwareDownload>, FetchError>> {
        Box::pin(async move {
            let response = self.client.get(url).send().await.map_err(|e| FetchError::Open {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

            let status = response.status();
            let content_length = if status.is_success() {
                response.content_length()
            } else {
                warn!("ota::source: {} answered {}", url, status);
                None
            };
            debug!(
                "ota::source: opened {} status: {} length: {:?}",
                url, status, content_length
            );

            Ok(Box::new(HttpDownload {
                response,
                content_length,
                pending: Vec::new(),
                offset: 0,
            }) as Box<dyn FirmwareDownload>)
        })
    }
}

struct HttpDownload {
    response: reqwest::Response,
    content_length: Option<u64>,
    /// Network chunk not yet handed to the caller.
    pending: Vec<u8>,
    offset: usize,
}

impl FirmwareDownload for HttpDownload {
    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn read_chunk<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize, FetchError>> {
        Box::pin(async move {
            while self.offset >= self.pending.len() {
                match self.response.chunk().await {
                    Ok(Some(bytes)) => {
                        self.pending = bytes.to_vec();
                        self.offset = 0;
                    }
                    Ok(None) => return Ok(0),
                    Err(e) => return Err(FetchError::Read(e.to_string())),
                }
            }

            let available = &self.pending[self.offset..];
            let n = available.len().min(buf.len());
            buf[..n].copy_from_slice(&available[..n]);
            self.offset += n;
            Ok(n)
        })
    }
}
