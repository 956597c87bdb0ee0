use crate::{LoadError, LoadResult};
use cask_base::hashing::{HashMap, HashSet};
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};

/// A response body being streamed from a remote source
pub trait FetchBody: Read + Send {
    /// True if the body starts at the requested offset, false if it starts at byte 0
    fn resumed(&self) -> bool;

    /// Length of this body, which is the remainder of the file when resumed
    fn content_length(&self) -> Option<u64>;
}

/// Fetches remote bundle files. Called from download worker threads.
pub trait Transport: Send + Sync {
    fn open(
        &self,
        url: &str,
        offset: u64,
    ) -> LoadResult<Box<dyn FetchBody>>;
}

struct HttpBody {
    response: reqwest::blocking::Response,
    resumed: bool,
}

impl Read for HttpBody {
    fn read(
        &mut self,
        buf: &mut [u8],
    ) -> std::io::Result<usize> {
        self.response.read(buf)
    }
}

impl FetchBody for HttpBody {
    fn resumed(&self) -> bool {
        self.resumed
    }

    fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }
}

/// Plain HTTP(S) GET, with a `Range: bytes=<offset>-` header when resuming
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new() -> LoadResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("cask/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpTransport { client })
    }
}

impl Transport for HttpTransport {
    fn open(
        &self,
        url: &str,
        offset: u64,
    ) -> LoadResult<Box<dyn FetchBody>> {
        profiling::scope!("HttpTransport::open");
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }

        let response = request.send()?;
        let status = response.status();
        let resumed = if status == reqwest::StatusCode::PARTIAL_CONTENT {
            true
        } else if status == reqwest::StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            return Err(LoadError::RangeNotSatisfiable {
                url: url.to_string(),
                offset,
            });
        } else if status.is_success() {
            if offset > 0 {
                log::debug!("{} does not support range requests, restarting from 0", url);
            }
            false
        } else {
            return Err(LoadError::StringError(format!(
                "GET {} returned {}",
                url, status
            )));
        };

        Ok(Box::new(HttpBody { response, resumed }))
    }
}

#[derive(Default)]
struct MemoryTransportInner {
    files: HashMap<String, Vec<u8>>,
    no_range_support: bool,
    corrupted: HashSet<String>,
    fail_after: HashMap<String, usize>,
    end_after: HashMap<String, usize>,
    requests: Vec<(String, u64)>,
}

struct MemoryBody {
    data: Vec<u8>,
    position: usize,
    fail_at: Option<usize>,
    // Body ends here while still announcing the full length
    end_at: Option<usize>,
    resumed: bool,
}

impl Read for MemoryBody {
    fn read(
        &mut self,
        buf: &mut [u8],
    ) -> std::io::Result<usize> {
        if let Some(fail_at) = self.fail_at {
            if self.position >= fail_at {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset",
                ));
            }
        }

        let end = [self.fail_at, self.end_at]
            .iter()
            .flatten()
            .fold(self.data.len(), |end, x| end.min(*x));
        let count = buf.len().min(end.saturating_sub(self.position));
        buf[..count].copy_from_slice(&self.data[self.position..self.position + count]);
        self.position += count;
        Ok(count)
    }
}

impl FetchBody for MemoryBody {
    fn resumed(&self) -> bool {
        self.resumed
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// In-memory [`Transport`] keyed by url. Clones share state, so a test can keep one to inspect
/// requests after handing another to the manager.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryTransportInner>>,
}

impl MemoryTransport {
    fn lock(&self) -> MutexGuard<MemoryTransportInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(
        &self,
        url: impl Into<String>,
        data: Vec<u8>,
    ) {
        self.lock().files.insert(url.into(), data);
    }

    /// When disabled the transport ignores offsets and always serves the whole file
    pub fn set_range_support(
        &self,
        supported: bool,
    ) {
        self.lock().no_range_support = !supported;
    }

    /// Every response for this url has its bytes flipped
    pub fn corrupt(
        &self,
        url: impl Into<String>,
    ) {
        self.lock().corrupted.insert(url.into());
    }

    /// The next response for this url errors out after `bytes` bytes of the file were sent
    pub fn fail_once_after(
        &self,
        url: impl Into<String>,
        bytes: usize,
    ) {
        self.lock().fail_after.insert(url.into(), bytes);
    }

    /// The next response for this url ends early after `bytes` bytes of the file were sent
    pub fn end_once_after(
        &self,
        url: impl Into<String>,
        bytes: usize,
    ) {
        self.lock().end_after.insert(url.into(), bytes);
    }

    /// (url, offset) of every request made so far
    pub fn requests(&self) -> Vec<(String, u64)> {
        self.lock().requests.clone()
    }
}

impl Transport for MemoryTransport {
    fn open(
        &self,
        url: &str,
        offset: u64,
    ) -> LoadResult<Box<dyn FetchBody>> {
        let mut inner = self.lock();
        inner.requests.push((url.to_string(), offset));

        let mut data = inner
            .files
            .get(url)
            .cloned()
            .ok_or_else(|| LoadError::StringError(format!("GET {} returned 404", url)))?;

        if inner.corrupted.contains(url) {
            for byte in &mut data {
                *byte = !*byte;
            }
        }

        let resumed = offset > 0 && !inner.no_range_support;
        if resumed && offset >= data.len() as u64 {
            return Err(LoadError::RangeNotSatisfiable {
                url: url.to_string(),
                offset,
            });
        }
        let start = if resumed { offset as usize } else { 0 };
        let fail_at = inner
            .fail_after
            .remove(url)
            .map(|bytes| bytes.saturating_sub(start));
        let end_at = inner
            .end_after
            .remove(url)
            .map(|bytes| bytes.saturating_sub(start));

        Ok(Box::new(MemoryBody {
            data: data.split_off(start),
            position: 0,
            fail_at,
            end_at,
            resumed,
        }))
    }
}
