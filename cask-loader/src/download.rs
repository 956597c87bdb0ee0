use crate::transport::Transport;
use crate::{LoadError, LoadResult};
use cask_base::hashing::{HashMap, HashSet};
use cask_base::ContentChecksum;
use crossbeam_channel::{Receiver, Sender};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

const TRANSFER_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TransferId(pub u64);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum UpdateState {
    Waiting,
    Updating,
    Updated,
    Failed,
}

/// Per-bundle download status, kept after the download task is gone
#[derive(Clone, Debug)]
pub struct UpdateInfo {
    pub bundle: String,
    pub group: String,
    pub state: UpdateState,
    pub downloaded: u64,
    pub total: u64,
}

/// Raw byte counts for one tick of one transfer. Speed/ETA are left to the observer.
#[derive(Clone, Debug)]
pub struct DownloadProgress {
    pub bundle: String,
    pub group: String,
    pub delta: u64,
    pub downloaded: u64,
    pub total: u64,
}

enum DownloadJob {
    Transfer {
        id: TransferId,
        url: String,
        temp_path: PathBuf,
    },
    Verify {
        id: TransferId,
        path: PathBuf,
    },
}

enum DownloadEvent {
    Progress {
        id: TransferId,
        delta: u64,
        downloaded: u64,
    },
    TransferFinished {
        id: TransferId,
        result: LoadResult<u64>,
    },
    Verified {
        id: TransferId,
        result: LoadResult<(u64, String)>,
    },
}

// Streams `url` into `temp_path`, appending to an existing partial file when the source resumes
fn run_transfer(
    transport: &dyn Transport,
    id: TransferId,
    url: &str,
    temp_path: &Path,
    event_tx: &Sender<DownloadEvent>,
) -> LoadResult<u64> {
    let offset = std::fs::metadata(temp_path).map(|x| x.len()).unwrap_or(0);
    let mut body = match transport.open(url, offset) {
        // The partial file is already as long as the source or longer, it cannot be resumed
        Err(LoadError::RangeNotSatisfiable { .. }) => {
            log::debug!("{} rejected resume at byte {}", url, offset);
            transport.open(url, 0)?
        }
        result => result?,
    };

    let (mut file, mut downloaded) = if offset > 0 && body.resumed() {
        log::debug!("Resuming {} at byte {}", url, offset);
        let file = std::fs::OpenOptions::new().append(true).open(temp_path)?;
        (file, offset)
    } else {
        if offset > 0 {
            log::debug!("Restarting {} from byte 0", url);
        }
        if let Some(parent) = temp_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        (std::fs::File::create(temp_path)?, 0)
    };

    let _ = event_tx.send(DownloadEvent::Progress {
        id,
        delta: 0,
        downloaded,
    });

    let body_length = body.content_length();
    let mut received = 0u64;
    let mut buffer = vec![0u8; TRANSFER_CHUNK_SIZE];
    loop {
        let read = body.read(&mut buffer)?;
        if read == 0 {
            break;
        }

        received += read as u64;
        if let Some(body_length) = body_length {
            if received > body_length {
                return Err(LoadError::StringError(format!(
                    "{} sent more than the {} bytes it announced",
                    url, body_length
                )));
            }
        }

        file.write_all(&buffer[..read])?;
        downloaded += read as u64;
        let _ = event_tx.send(DownloadEvent::Progress {
            id,
            delta: read as u64,
            downloaded,
        });
    }

    file.flush()?;
    match body_length {
        // Received bytes stay in the temp file for the next attempt
        Some(body_length) if received < body_length => Err(LoadError::StringError(format!(
            "{} ended after {} of {} bytes",
            url, received, body_length
        ))),
        _ => Ok(downloaded),
    }
}

// Thread that tries to take jobs out of the request channel and ends when the finish channel is signalled
struct DownloadWorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl DownloadWorkerThread {
    fn new(
        transport: Arc<dyn Transport>,
        job_rx: Receiver<DownloadJob>,
        event_tx: Sender<DownloadEvent>,
        thread_index: usize,
    ) -> LoadResult<Self> {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
        let join_handle = std::thread::Builder::new()
            .name("Download Thread".into())
            .spawn(move || {
                profiling::register_thread!(&format!("DownloadWorkerThread {}", thread_index));
                loop {
                    crossbeam_channel::select! {
                        recv(job_rx) -> msg => {
                            let event = match msg {
                                Ok(DownloadJob::Transfer { id, url, temp_path }) => {
                                    profiling::scope!("DownloadJob::Transfer");
                                    log::trace!("Start transfer {:?} {}", id, url);
                                    let result = run_transfer(&*transport, id, &url, &temp_path, &event_tx);
                                    DownloadEvent::TransferFinished { id, result }
                                }
                                Ok(DownloadJob::Verify { id, path }) => {
                                    profiling::scope!("DownloadJob::Verify");
                                    log::trace!("Start verify {:?} {:?}", id, path);
                                    let result = ContentChecksum::of_file(&path).map_err(LoadError::from);
                                    DownloadEvent::Verified { id, result }
                                }
                                Err(_) => return,
                            };

                            if event_tx.send(event).is_err() {
                                return;
                            }
                        },
                        recv(finish_rx) -> _msg => {
                            return;
                        }
                    }
                }
            })?;

        Ok(DownloadWorkerThread {
            finish_tx,
            join_handle,
        })
    }
}

// Spans N threads, proxies messages to/from them, and kills the threads when the pool is dropped
struct DownloadThreadPool {
    worker_threads: Vec<DownloadWorkerThread>,
    job_tx: Sender<DownloadJob>,
}

impl DownloadThreadPool {
    fn new(
        transport: Arc<dyn Transport>,
        thread_count: usize,
        event_tx: Sender<DownloadEvent>,
    ) -> LoadResult<Self> {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<DownloadJob>();

        let thread_count = thread_count.max(1);
        let mut worker_threads = Vec::with_capacity(thread_count);
        for thread_index in 0..thread_count {
            worker_threads.push(DownloadWorkerThread::new(
                transport.clone(),
                job_rx.clone(),
                event_tx.clone(),
                thread_index,
            )?);
        }

        Ok(DownloadThreadPool {
            worker_threads,
            job_tx,
        })
    }

    fn add_job(
        &self,
        job: DownloadJob,
    ) {
        if self.job_tx.send(job).is_err() {
            log::error!("Download worker threads are gone, job dropped");
        }
    }

    fn finish(self) {
        for worker_thread in &self.worker_threads {
            let _ = worker_thread.finish_tx.send(());
        }

        // A worker blocked on a slow transfer is left to finish on its own
        for worker_thread in self.worker_threads {
            if worker_thread.join_handle.is_finished() {
                let _ = worker_thread.join_handle.join();
            }
        }
    }
}

/// Owns the download workers and everything download tasks share: results by transfer id, group
/// pause flags, the progress listener and per-bundle [`UpdateInfo`] records.
pub struct DownloadService {
    thread_pool: Option<DownloadThreadPool>,
    event_rx: Receiver<DownloadEvent>,
    next_transfer_id: u64,
    discard_below: u64,
    progress: HashMap<TransferId, (u64, u64)>,
    transfers: HashMap<TransferId, LoadResult<u64>>,
    verifications: HashMap<TransferId, LoadResult<(u64, String)>>,
    abandoned: HashSet<TransferId>,
    paused_groups: HashSet<String>,
    listener: Option<Box<dyn FnMut(&DownloadProgress)>>,
    update_infos: HashMap<String, UpdateInfo>,
}

impl Drop for DownloadService {
    fn drop(&mut self) {
        if let Some(thread_pool) = self.thread_pool.take() {
            thread_pool.finish();
        }
    }
}

impl DownloadService {
    pub fn new(
        transport: Arc<dyn Transport>,
        thread_count: usize,
    ) -> LoadResult<Self> {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let thread_pool = Some(DownloadThreadPool::new(transport, thread_count, event_tx)?);

        Ok(DownloadService {
            thread_pool,
            event_rx,
            next_transfer_id: 1,
            discard_below: 0,
            progress: Default::default(),
            transfers: Default::default(),
            verifications: Default::default(),
            abandoned: Default::default(),
            paused_groups: Default::default(),
            listener: None,
            update_infos: Default::default(),
        })
    }

    fn allocate_id(&mut self) -> TransferId {
        let id = TransferId(self.next_transfer_id);
        self.next_transfer_id += 1;
        id
    }

    fn add_job(
        &self,
        job: DownloadJob,
    ) {
        if let Some(thread_pool) = &self.thread_pool {
            thread_pool.add_job(job);
        }
    }

    pub fn start_transfer(
        &mut self,
        url: String,
        temp_path: PathBuf,
    ) -> TransferId {
        let id = self.allocate_id();
        log::debug!("start_transfer {:?} {}", id, url);
        self.add_job(DownloadJob::Transfer { id, url, temp_path });
        id
    }

    pub fn start_verify(
        &mut self,
        path: PathBuf,
    ) -> TransferId {
        let id = self.allocate_id();
        self.add_job(DownloadJob::Verify { id, path });
        id
    }

    fn is_discarded(
        &mut self,
        id: TransferId,
        terminal: bool,
    ) -> bool {
        if id.0 < self.discard_below {
            return true;
        }

        if terminal {
            self.abandoned.remove(&id)
        } else {
            self.abandoned.contains(&id)
        }
    }

    #[profiling::function]
    pub fn drain(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            match event {
                DownloadEvent::Progress {
                    id,
                    delta,
                    downloaded,
                } => {
                    if !self.is_discarded(id, false) {
                        let entry = self.progress.entry(id).or_insert((0, 0));
                        entry.0 += delta;
                        entry.1 = downloaded;
                    }
                }
                DownloadEvent::TransferFinished { id, result } => {
                    if !self.is_discarded(id, true) {
                        self.transfers.insert(id, result);
                    }
                }
                DownloadEvent::Verified { id, result } => {
                    if !self.is_discarded(id, true) {
                        self.verifications.insert(id, result);
                    }
                }
            }
        }
    }

    /// Bytes received since the last call and the running total, None if nothing arrived
    pub fn take_progress(
        &mut self,
        id: TransferId,
    ) -> Option<(u64, u64)> {
        self.progress.remove(&id)
    }

    pub fn take_transfer_result(
        &mut self,
        id: TransferId,
    ) -> Option<LoadResult<u64>> {
        self.transfers.remove(&id)
    }

    pub fn take_verify_result(
        &mut self,
        id: TransferId,
    ) -> Option<LoadResult<(u64, String)>> {
        self.verifications.remove(&id)
    }

    /// The job keeps running on its worker but its results are dropped
    pub fn abandon(
        &mut self,
        id: TransferId,
    ) {
        self.progress.remove(&id);
        if self.transfers.remove(&id).is_none() && self.verifications.remove(&id).is_none() {
            self.abandoned.insert(id);
        }
    }

    pub fn reset(&mut self) {
        self.progress.clear();
        self.transfers.clear();
        self.verifications.clear();
        self.abandoned.clear();
        self.update_infos.clear();
        self.discard_below = self.next_transfer_id;
    }

    pub fn pause_group(
        &mut self,
        group: &str,
    ) {
        log::info!("Pausing downloads in group '{}'", group);
        self.paused_groups.insert(group.to_string());
    }

    pub fn resume_group(
        &mut self,
        group: &str,
    ) {
        log::info!("Resuming downloads in group '{}'", group);
        self.paused_groups.remove(group);
    }

    pub fn is_group_paused(
        &self,
        group: &str,
    ) -> bool {
        self.paused_groups.contains(group)
    }

    pub fn set_listener(
        &mut self,
        listener: Option<Box<dyn FnMut(&DownloadProgress)>>,
    ) {
        self.listener = listener;
    }

    pub fn report_progress(
        &mut self,
        progress: DownloadProgress,
    ) {
        if let Some(info) = self.update_infos.get_mut(&progress.bundle) {
            info.downloaded = progress.downloaded;
            info.total = progress.total;
        }

        if let Some(listener) = &mut self.listener {
            listener(&progress);
        }
    }

    pub fn set_update_state(
        &mut self,
        bundle: &str,
        group: &str,
        state: UpdateState,
        total: u64,
    ) {
        let info = self
            .update_infos
            .entry(bundle.to_string())
            .or_insert_with(|| UpdateInfo {
                bundle: bundle.to_string(),
                group: group.to_string(),
                state,
                downloaded: 0,
                total,
            });
        info.state = state;
        info.total = total;
        if state == UpdateState::Updated {
            info.downloaded = total;
        }
    }

    pub fn update_info(
        &self,
        bundle: &str,
    ) -> Option<&UpdateInfo> {
        self.update_infos.get(bundle)
    }

    pub fn update_infos(&self) -> impl Iterator<Item = &UpdateInfo> {
        self.update_infos.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use std::time::{Duration, Instant};

    fn wait_for_transfer(
        service: &mut DownloadService,
        id: TransferId,
    ) -> LoadResult<u64> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            service.drain();
            if let Some(result) = service.take_transfer_result(id) {
                return result;
            }
            assert!(Instant::now() < deadline, "transfer did not finish");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn transfer_resumes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let temp_path = dir.path().join("bundle1.downloading");
        let data: Vec<u8> = (0..1000u32).map(|x| x as u8).collect();
        std::fs::write(&temp_path, &data[..300]).unwrap();

        let transport = MemoryTransport::default();
        transport.insert("http://host/bundle1", data.clone());
        let mut service = DownloadService::new(Arc::new(transport.clone()), 1).unwrap();

        let id = service.start_transfer("http://host/bundle1".to_string(), temp_path.clone());
        assert_eq!(wait_for_transfer(&mut service, id).unwrap(), 1000);
        assert_eq!(std::fs::read(&temp_path).unwrap(), data);
        assert_eq!(transport.requests(), vec![("http://host/bundle1".to_string(), 300)]);

        let (delta, downloaded) = service.take_progress(id).unwrap();
        assert_eq!(delta, 700);
        assert_eq!(downloaded, 1000);
    }

    #[test]
    fn transfer_restarts_without_range_support() {
        let dir = tempfile::tempdir().unwrap();
        let temp_path = dir.path().join("bundle1.downloading");
        std::fs::write(&temp_path, vec![9u8; 50]).unwrap();

        let transport = MemoryTransport::default();
        transport.set_range_support(false);
        transport.insert("http://host/bundle1", vec![1u8; 200]);
        let mut service = DownloadService::new(Arc::new(transport), 1).unwrap();

        let id = service.start_transfer("http://host/bundle1".to_string(), temp_path.clone());
        assert_eq!(wait_for_transfer(&mut service, id).unwrap(), 200);
        assert_eq!(std::fs::read(&temp_path).unwrap(), vec![1u8; 200]);
    }

    #[test]
    fn transfer_restarts_when_resume_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let temp_path = dir.path().join("bundle1.downloading");
        let data: Vec<u8> = (0..1000u32).map(|x| x as u8).collect();
        std::fs::write(&temp_path, vec![9u8; 1000]).unwrap();

        let transport = MemoryTransport::default();
        transport.insert("http://host/bundle1", data.clone());
        let mut service = DownloadService::new(Arc::new(transport.clone()), 1).unwrap();

        let id = service.start_transfer("http://host/bundle1".to_string(), temp_path.clone());
        assert_eq!(wait_for_transfer(&mut service, id).unwrap(), 1000);
        assert_eq!(std::fs::read(&temp_path).unwrap(), data);
        assert_eq!(
            transport.requests(),
            vec![
                ("http://host/bundle1".to_string(), 1000),
                ("http://host/bundle1".to_string(), 0)
            ]
        );
    }

    #[test]
    fn short_body_fails_and_keeps_received_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let temp_path = dir.path().join("bundle1.downloading");
        let transport = MemoryTransport::default();
        transport.insert("http://host/bundle1", vec![4u8; 500]);
        transport.end_once_after("http://host/bundle1", 120);
        let mut service = DownloadService::new(Arc::new(transport.clone()), 1).unwrap();

        let id = service.start_transfer("http://host/bundle1".to_string(), temp_path.clone());
        assert!(wait_for_transfer(&mut service, id).is_err());
        assert_eq!(std::fs::read(&temp_path).unwrap(), vec![4u8; 120]);

        let id = service.start_transfer("http://host/bundle1".to_string(), temp_path.clone());
        assert_eq!(wait_for_transfer(&mut service, id).unwrap(), 500);
        assert_eq!(transport.requests()[1], ("http://host/bundle1".to_string(), 120));
    }

    #[test]
    fn abandoned_results_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::default();
        transport.insert("http://host/a", vec![1u8; 10]);
        let mut service = DownloadService::new(Arc::new(transport), 1).unwrap();

        let abandoned = service.start_transfer("http://host/a".to_string(), dir.path().join("a"));
        service.abandon(abandoned);
        let kept = service.start_transfer("http://host/a".to_string(), dir.path().join("b"));
        assert!(wait_for_transfer(&mut service, kept).is_ok());
        service.drain();
        assert!(service.take_transfer_result(abandoned).is_none());
    }
}
