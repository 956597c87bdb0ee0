use crate::bundle_io::{BundleIO, IoEvent, IoRequestId, OpenedBundle};
use crate::LoadError;
use cask_base::hashing::{HashMap, HashSet};
use crossbeam_channel::Sender;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct MemoryStorageInner {
    files: HashMap<PathBuf, Vec<u8>>,
    failing_opens: HashSet<PathBuf>,
    open_count: usize,
    close_count: usize,
    extract_count: HashMap<String, usize>,
}

/// Files and counters shared between a test and the [`MemoryBundleIO`] it hands to the manager
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

impl MemoryStorage {
    fn lock(&self) -> MutexGuard<MemoryStorageInner> {
        // A panicking test thread can poison the lock, the data is still usable
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_file(
        &self,
        path: impl Into<PathBuf>,
        data: Vec<u8>,
    ) {
        self.lock().files.insert(path.into(), data);
    }

    pub fn remove_file(
        &self,
        path: &Path,
    ) {
        self.lock().files.remove(path);
    }

    /// Opens of this path will report an error even if the file exists
    pub fn fail_opens(
        &self,
        path: impl Into<PathBuf>,
    ) {
        self.lock().failing_opens.insert(path.into());
    }

    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }

    pub fn extract_count(
        &self,
        asset_name: &str,
    ) -> usize {
        self.lock()
            .extract_count
            .get(asset_name)
            .copied()
            .unwrap_or(0)
    }
}

/// In-memory [`BundleIO`]. Results are sent as soon as a request is made, so they are observed by
/// tasks on the following tick which keeps state machine tests deterministic.
pub struct MemoryBundleIO {
    storage: MemoryStorage,
    result_tx: Sender<IoEvent>,
}

impl MemoryBundleIO {
    pub fn new(
        storage: MemoryStorage,
        result_tx: Sender<IoEvent>,
    ) -> Self {
        MemoryBundleIO { storage, result_tx }
    }

    fn send(
        &self,
        event: IoEvent,
    ) {
        if self.result_tx.send(event).is_err() {
            log::warn!("IO result receiver dropped");
        }
    }
}

impl BundleIO for MemoryBundleIO {
    fn file_length(
        &self,
        path: &Path,
    ) -> Option<u64> {
        self.storage.lock().files.get(path).map(|x| x.len() as u64)
    }

    fn open_bundle(
        &mut self,
        request: IoRequestId,
        path: &Path,
        is_raw: bool,
    ) {
        let result = {
            let mut inner = self.storage.lock();
            inner.open_count += 1;
            if inner.failing_opens.contains(path) {
                Err(LoadError::StringError(format!("{} could not be opened", path.display())))
            } else {
                match inner.files.get(path) {
                    Some(data) => OpenedBundle::from_bytes(data.clone(), is_raw),
                    None => Err(LoadError::StringError(format!("{} not found", path.display()))),
                }
            }
        };

        self.send(IoEvent::BundleOpened { request, result });
    }

    fn extract_asset(
        &mut self,
        request: IoRequestId,
        bundle: &OpenedBundle,
        asset_name: &str,
    ) {
        *self
            .storage
            .lock()
            .extract_count
            .entry(asset_name.to_string())
            .or_insert(0) += 1;
        self.send(IoEvent::AssetExtracted {
            request,
            result: Ok(bundle.extract(asset_name)),
        });
    }

    fn close_bundle(
        &mut self,
        bundle_name: &str,
        _bundle: OpenedBundle,
    ) {
        log::trace!("memory close_bundle {}", bundle_name);
        self.storage.lock().close_count += 1;
    }
}
