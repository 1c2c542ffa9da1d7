use std::collections::HashMap;
use std::sync::Mutex;

use super::lock;
use crate::error::FetchError;
use crate::ota::{FirmwareDownload, FirmwareSource};
use crate::BoxFuture;

/// Network chunk size the simulated origin answers with.
const WIRE_CHUNK: usize = 512;

#[derive(Clone)]
struct Image {
    content_length: Option<u64>,
    body: Vec<u8>,
}

#[derive(Default)]
struct Origin {
    images: HashMap<String, Image>,
    failing_opens: usize,
    opens: usize,
}

/// HTTP origin serving images from memory.
#[derive(Default)]
pub struct SimFirmwareServer {
    origin: Mutex<Origin>,
}

impl SimFirmwareServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, body: Vec<u8>) {
        let length = body.len() as u64;
        self.serve_with_length(url, Some(length), body);
    }

    /// Serve `body` under a declared length that may not match it.
    pub fn serve_with_length(&self, url: &str, content_length: Option<u64>, body: Vec<u8>) {
        lock(&self.origin).images.insert(
            url.to_string(),
            Image {
                content_length,
                body,
            },
        );
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_opens(&self, count: usize) {
        lock(&self.origin).failing_opens = count;
    }

    pub fn opens(&self) -> usize {
        lock(&self.origin).opens
    }
}

impl FirmwareSource for SimFirmwareServer {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Box<dyn FirmwareDownload>, FetchError>> {
        Box::pin(async move {
            let mut origin = lock(&self.origin);
            origin.opens += 1;

            if origin.failing_opens > 0 {
                origin.failing_opens -= 1;
                return Err(FetchError::Open {
                    url: url.to_string(),
                    reason: "connection refused".to_string(),
                });
            }

            let image = origin.images.get(url).cloned().ok_or_else(|| FetchError::Open {
                url: url.to_string(),
                reason: "host unreachable".to_string(),
            })?;

            Ok(Box::new(SimDownload { image, offset: 0 }) as Box<dyn FirmwareDownload>)
        })
    }
}

struct SimDownload {
    image: Image,
    offset: usize,
}

impl FirmwareDownload for SimDownload {
    fn content_length(&self) -> Option<u64> {
        self.image.content_length
    }

    fn read_chunk<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize, FetchError>> {
        Box::pin(async move {
            let rest = &self.image.body[self.offset..];
            let n = rest.len().min(buf.len()).min(WIRE_CHUNK);
            buf[..n].copy_from_slice(&rest[..n]);
            self.offset += n;
            Ok(n)
        })
    }
}
