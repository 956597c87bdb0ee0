use crate::{LoadError, LoadResult};
use cask_base::hashing::HashMap;
use cask_base::BundleArchive;
use crossbeam_channel::Receiver;
use std::path::Path;
use std::sync::Arc;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Ord, PartialOrd)]
pub struct IoRequestId(pub u64);

/// The backing store of a bundle once it has been opened
#[derive(Clone)]
pub enum OpenedBundle {
    Archive(Arc<BundleArchive>),
    Raw(Arc<[u8]>),
}

impl std::fmt::Debug for OpenedBundle {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            OpenedBundle::Archive(archive) => f.debug_tuple("Archive").field(archive).finish(),
            OpenedBundle::Raw(data) => f.debug_tuple("Raw").field(&data.len()).finish(),
        }
    }
}

impl OpenedBundle {
    pub fn from_bytes(
        data: Vec<u8>,
        is_raw: bool,
    ) -> LoadResult<Self> {
        if is_raw {
            Ok(OpenedBundle::Raw(Arc::from(data)))
        } else {
            Ok(OpenedBundle::Archive(Arc::new(BundleArchive::from_bytes(data)?)))
        }
    }

    /// Copies the named asset out of the bundle. A raw bundle holds exactly one asset, so its whole
    /// content is returned regardless of the name.
    pub fn extract(
        &self,
        asset_name: &str,
    ) -> Option<Arc<[u8]>> {
        match self {
            OpenedBundle::Archive(archive) => archive.asset_bytes(asset_name).map(Arc::from),
            OpenedBundle::Raw(data) => Some(data.clone()),
        }
    }
}

pub enum IoEvent {
    BundleOpened {
        request: IoRequestId,
        result: LoadResult<OpenedBundle>,
    },
    AssetExtracted {
        request: IoRequestId,
        result: LoadResult<Option<Arc<[u8]>>>,
    },
}

/// Storage backend used by the bundle state machines. Requests complete asynchronously by sending
/// an [`IoEvent`] on the channel the implementation was created with, results become visible to
/// tasks on the next tick after they arrive.
pub trait BundleIO: Send {
    /// Length of the file at `path`, None if there is no such file
    fn file_length(
        &self,
        path: &Path,
    ) -> Option<u64>;

    fn open_bundle(
        &mut self,
        request: IoRequestId,
        path: &Path,
        is_raw: bool,
    );

    fn extract_asset(
        &mut self,
        request: IoRequestId,
        bundle: &OpenedBundle,
        asset_name: &str,
    );

    fn close_bundle(
        &mut self,
        bundle_name: &str,
        bundle: OpenedBundle,
    );
}

/// Collects completed IO requests on the tick thread so tasks can poll them by request id
pub struct IoResults {
    event_rx: Receiver<IoEvent>,
    next_request_id: u64,
    // Everything below this id belongs to a previous manifest and is dropped on arrival
    discard_below: u64,
    opened: HashMap<IoRequestId, LoadResult<OpenedBundle>>,
    extracted: HashMap<IoRequestId, LoadResult<Option<Arc<[u8]>>>>,
    abandoned: Vec<IoRequestId>,
}

impl IoResults {
    pub fn new(event_rx: Receiver<IoEvent>) -> Self {
        IoResults {
            event_rx,
            next_request_id: 1,
            discard_below: 0,
            opened: Default::default(),
            extracted: Default::default(),
            abandoned: Default::default(),
        }
    }

    pub fn allocate_request(&mut self) -> IoRequestId {
        let request = IoRequestId(self.next_request_id);
        self.next_request_id += 1;
        request
    }

    #[profiling::function]
    pub fn drain(
        &mut self,
        io: &mut dyn BundleIO,
    ) {
        while let Ok(event) = self.event_rx.try_recv() {
            match event {
                IoEvent::BundleOpened { request, result } => {
                    log::trace!("IO bundle opened {:?} ok: {}", request, result.is_ok());
                    if self.take_abandoned(request) {
                        if let Ok(bundle) = result {
                            io.close_bundle("<abandoned>", bundle);
                        }
                    } else {
                        self.opened.insert(request, result);
                    }
                }
                IoEvent::AssetExtracted { request, result } => {
                    log::trace!("IO asset extracted {:?} ok: {}", request, result.is_ok());
                    if !self.take_abandoned(request) {
                        self.extracted.insert(request, result);
                    }
                }
            }
        }
    }

    fn take_abandoned(
        &mut self,
        request: IoRequestId,
    ) -> bool {
        if request.0 < self.discard_below {
            return true;
        }

        if let Some(position) = self.abandoned.iter().position(|x| *x == request) {
            self.abandoned.swap_remove(position);
            true
        } else {
            false
        }
    }

    pub fn take_opened(
        &mut self,
        request: IoRequestId,
    ) -> Option<LoadResult<OpenedBundle>> {
        self.opened.remove(&request)
    }

    pub fn take_extracted(
        &mut self,
        request: IoRequestId,
    ) -> Option<LoadResult<Option<Arc<[u8]>>>> {
        self.extracted.remove(&request)
    }

    /// The result of this request will be dropped (and an opened bundle closed) when it arrives
    pub fn abandon(
        &mut self,
        request: IoRequestId,
        io: &mut dyn BundleIO,
    ) {
        if let Some(result) = self.opened.remove(&request) {
            if let Ok(bundle) = result {
                io.close_bundle("<abandoned>", bundle);
            }
        } else if self.extracted.remove(&request).is_none() {
            self.abandoned.push(request);
        }
    }

    /// Drops every outstanding request, used when the manifest is reloaded
    pub fn reset(
        &mut self,
        io: &mut dyn BundleIO,
    ) {
        for (_, result) in self.opened.drain() {
            if let Ok(bundle) = result {
                io.close_bundle("<reset>", bundle);
            }
        }
        self.extracted.clear();
        self.abandoned.clear();
        self.discard_below = self.next_request_id;
    }
}

pub(crate) fn io_error_to_load_error(
    path: &Path,
    error: std::io::Error,
) -> LoadError {
    LoadError::StringError(format!("{}: {}", path.display(), error))
}
