use crate::bundle_io::{io_error_to_load_error, BundleIO, IoEvent, IoRequestId, OpenedBundle};
use crate::LoadResult;
use crossbeam_channel::{Receiver, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

struct DiskBundleIORequestOpen {
    request: IoRequestId,
    path: PathBuf,
    is_raw: bool,
}

struct DiskBundleIORequestExtract {
    request: IoRequestId,
    bundle: OpenedBundle,
    asset_name: String,
}

enum DiskBundleIORequest {
    Open(DiskBundleIORequestOpen),
    Extract(DiskBundleIORequestExtract),
}

fn read_bundle(
    path: &Path,
    is_raw: bool,
) -> LoadResult<OpenedBundle> {
    let data = {
        profiling::scope!("std::fs::read");
        std::fs::read(path).map_err(|e| io_error_to_load_error(path, e))?
    };
    OpenedBundle::from_bytes(data, is_raw)
}

// Thread that tries to take jobs out of the request channel and ends when the finish channel is signalled
struct DiskBundleIOWorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl DiskBundleIOWorkerThread {
    fn new(
        request_rx: Receiver<DiskBundleIORequest>,
        result_tx: Sender<IoEvent>,
        active_request_count: Arc<AtomicUsize>,
        thread_index: usize,
    ) -> LoadResult<Self> {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
        let join_handle = std::thread::Builder::new()
            .name("IO Thread".into())
            .spawn(move || {
                profiling::register_thread!(&format!("DiskBundleIOWorkerThread {}", thread_index));
                loop {
                    crossbeam_channel::select! {
                        recv(request_rx) -> msg => {
                            let event = match msg {
                                Ok(DiskBundleIORequest::Open(msg)) => {
                                    profiling::scope!("DiskBundleIORequest::Open");
                                    log::trace!("Start bundle read {:?} {:?}", msg.request, msg.path);
                                    IoEvent::BundleOpened {
                                        request: msg.request,
                                        result: read_bundle(&msg.path, msg.is_raw),
                                    }
                                }
                                Ok(DiskBundleIORequest::Extract(msg)) => {
                                    profiling::scope!("DiskBundleIORequest::Extract");
                                    log::trace!("Start extract {:?} {}", msg.request, msg.asset_name);
                                    IoEvent::AssetExtracted {
                                        request: msg.request,
                                        result: Ok(msg.bundle.extract(&msg.asset_name)),
                                    }
                                }
                                // Pool is gone
                                Err(_) => return,
                            };

                            if result_tx.send(event).is_err() {
                                log::debug!("IO result receiver dropped, stopping worker {}", thread_index);
                                return;
                            }
                            active_request_count.fetch_sub(1, Ordering::Release);
                        },
                        recv(finish_rx) -> _msg => {
                            return;
                        }
                    }
                }
            })?;

        Ok(DiskBundleIOWorkerThread {
            finish_tx,
            join_handle,
        })
    }
}

// Spans N threads, proxies messages to/from them, and kills the threads when the pool is dropped
struct DiskBundleIOThreadPool {
    worker_threads: Vec<DiskBundleIOWorkerThread>,
    request_tx: Sender<DiskBundleIORequest>,
    active_request_count: Arc<AtomicUsize>,
}

impl DiskBundleIOThreadPool {
    fn new(
        thread_count: usize,
        result_tx: Sender<IoEvent>,
    ) -> LoadResult<Self> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<DiskBundleIORequest>();
        let active_request_count = Arc::new(AtomicUsize::new(0));

        let thread_count = thread_count.max(1);
        let mut worker_threads = Vec::with_capacity(thread_count);
        for thread_index in 0..thread_count {
            let worker = DiskBundleIOWorkerThread::new(
                request_rx.clone(),
                result_tx.clone(),
                active_request_count.clone(),
                thread_index,
            )?;
            worker_threads.push(worker);
        }

        Ok(DiskBundleIOThreadPool {
            request_tx,
            worker_threads,
            active_request_count,
        })
    }

    fn add_request(
        &self,
        request: DiskBundleIORequest,
    ) {
        self.active_request_count.fetch_add(1, Ordering::Release);
        if self.request_tx.send(request).is_err() {
            self.active_request_count.fetch_sub(1, Ordering::Release);
            log::error!("Disk IO worker threads are gone, request dropped");
        }
    }

    fn finish(self) {
        for worker_thread in &self.worker_threads {
            let _ = worker_thread.finish_tx.send(());
        }

        for worker_thread in self.worker_threads {
            if worker_thread.join_handle.join().is_err() {
                log::error!("Disk IO worker thread panicked");
            }
        }
    }
}

/// Reads bundles from the local file system on a small pool of worker threads
pub struct DiskBundleIO {
    thread_pool: Option<DiskBundleIOThreadPool>,
}

impl Drop for DiskBundleIO {
    fn drop(&mut self) {
        if let Some(thread_pool) = self.thread_pool.take() {
            thread_pool.finish();
        }
    }
}

impl DiskBundleIO {
    pub fn new(
        thread_count: usize,
        result_tx: Sender<IoEvent>,
    ) -> LoadResult<Self> {
        let thread_pool = Some(DiskBundleIOThreadPool::new(thread_count, result_tx)?);
        Ok(DiskBundleIO { thread_pool })
    }

    pub fn active_request_count(&self) -> usize {
        self.thread_pool
            .as_ref()
            .map(|x| x.active_request_count.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn add_request(
        &self,
        request: DiskBundleIORequest,
    ) {
        if let Some(thread_pool) = &self.thread_pool {
            thread_pool.add_request(request);
        }
    }
}

impl BundleIO for DiskBundleIO {
    fn file_length(
        &self,
        path: &Path,
    ) -> Option<u64> {
        std::fs::metadata(path)
            .ok()
            .filter(|x| x.is_file())
            .map(|x| x.len())
    }

    fn open_bundle(
        &mut self,
        request: IoRequestId,
        path: &Path,
        is_raw: bool,
    ) {
        log::debug!("open_bundle {:?} {:?}", request, path);
        self.add_request(DiskBundleIORequest::Open(DiskBundleIORequestOpen {
            request,
            path: path.to_path_buf(),
            is_raw,
        }));
    }

    fn extract_asset(
        &mut self,
        request: IoRequestId,
        bundle: &OpenedBundle,
        asset_name: &str,
    ) {
        log::debug!("extract_asset {:?} {}", request, asset_name);
        self.add_request(DiskBundleIORequest::Extract(DiskBundleIORequestExtract {
            request,
            bundle: bundle.clone(),
            asset_name: asset_name.to_string(),
        }));
    }

    fn close_bundle(
        &mut self,
        bundle_name: &str,
        bundle: OpenedBundle,
    ) {
        // Bytes are owned in memory, closing is dropping our reference
        log::debug!("close_bundle {} {:?}", bundle_name, bundle);
        drop(bundle);
    }
}

#[cfg(test)]
mod tests {
    use super::DiskBundleIO;
    use crate::bundle_io::{BundleIO, IoEvent, IoRequestId, OpenedBundle};
    use cask_base::BundleArchiveWriter;
    use std::time::Duration;

    #[test]
    fn open_and_extract_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle1");
        let mut writer = BundleArchiveWriter::default();
        writer.add_asset("A", b"payload".to_vec());
        writer.write_to_file(&path).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        let mut io = DiskBundleIO::new(2, tx).unwrap();
        assert_eq!(io.file_length(&path), Some(std::fs::metadata(&path).unwrap().len()));
        assert_eq!(io.file_length(&dir.path().join("nope")), None);

        io.open_bundle(IoRequestId(1), &path, false);
        let bundle = match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            IoEvent::BundleOpened { request, result } => {
                assert_eq!(request, IoRequestId(1));
                result.unwrap()
            }
            _ => panic!("unexpected event"),
        };
        assert!(matches!(bundle, OpenedBundle::Archive(_)));

        io.extract_asset(IoRequestId(2), &bundle, "A");
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            IoEvent::AssetExtracted { request, result } => {
                assert_eq!(request, IoRequestId(2));
                assert_eq!(&*result.unwrap().unwrap(), b"payload");
            }
            _ => panic!("unexpected event"),
        }

        io.open_bundle(IoRequestId(3), &dir.path().join("missing"), false);
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            IoEvent::BundleOpened { result, .. } => assert!(result.is_err()),
            _ => panic!("unexpected event"),
        }
    }
}
