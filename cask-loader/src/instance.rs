use crate::LoadResult;
use serde::de::DeserializeOwned;
use std::fmt::Formatter;
use std::sync::Arc;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Ord, PartialOrd)]
pub struct InstanceId(pub u64);

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum InstanceKind {
    // Deserializable payload stored in a bundle archive
    Asset,
    // Opaque bytes, the whole bundle file
    Raw,
    Scene,
}

struct AssetInstanceInner {
    id: InstanceId,
    name: String,
    kind: InstanceKind,
    data: Arc<[u8]>,
}

/// A loaded asset. Clones share the same bytes and compare equal, the reverse index in
/// [`ResourceDatabase`](crate::database::ResourceDatabase) is keyed by [`InstanceId`].
#[derive(Clone)]
pub struct AssetInstance {
    inner: Arc<AssetInstanceInner>,
}

impl PartialEq for AssetInstance {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for AssetInstance {}

impl std::fmt::Debug for AssetInstance {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("AssetInstance")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("length", &self.inner.data.len())
            .finish()
    }
}

impl AssetInstance {
    pub(crate) fn new(
        id: InstanceId,
        name: String,
        kind: InstanceKind,
        data: Arc<[u8]>,
    ) -> Self {
        AssetInstance {
            inner: Arc::new(AssetInstanceInner {
                id,
                name,
                kind,
                data,
            }),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> InstanceKind {
        self.inner.kind
    }

    pub fn bytes(&self) -> &[u8] {
        &self.inner.data
    }

    /// Decodes the payload as a bincode-encoded `T`
    pub fn deserialize<T: DeserializeOwned>(&self) -> LoadResult<T> {
        profiling::scope!("AssetInstance::deserialize");
        Ok(bincode::deserialize(&self.inner.data)?)
    }
}
