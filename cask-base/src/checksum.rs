use siphasher::sip128::{Hasher128, SipHasher};
use std::hash::Hasher;
use std::io::Read;
use std::path::Path;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Streaming 128-bit content checksum. The digest is rendered as 32 lowercase hex characters, which
/// is the form stored in [`BundleManifestInfo::checksum`](crate::BundleManifestInfo).
///
/// Feeding the same bytes in different chunk sizes produces the same digest.
pub struct ContentChecksum {
    hasher: SipHasher,
    length: u64,
}

impl Default for ContentChecksum {
    fn default() -> Self {
        ContentChecksum {
            hasher: SipHasher::new(),
            length: 0,
        }
    }
}

impl ContentChecksum {
    pub fn update(
        &mut self,
        data: &[u8],
    ) {
        self.hasher.write(data);
        self.length += data.len() as u64;
    }

    /// Number of bytes fed so far
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn finish(&self) -> String {
        let hash = self.hasher.finish128();
        format!("{:016x}{:016x}", hash.h1, hash.h2)
    }

    pub fn of_bytes(data: &[u8]) -> String {
        let mut checksum = ContentChecksum::default();
        checksum.update(data);
        checksum.finish()
    }

    /// Returns (length, checksum) of everything the reader produces
    pub fn of_reader<R: Read>(mut reader: R) -> std::io::Result<(u64, String)> {
        profiling::scope!("ContentChecksum::of_reader");
        let mut checksum = ContentChecksum::default();
        let mut buffer = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            checksum.update(&buffer[..read]);
        }

        Ok((checksum.length(), checksum.finish()))
    }

    pub fn of_file(path: &Path) -> std::io::Result<(u64, String)> {
        let file = std::fs::File::open(path)?;
        Self::of_reader(std::io::BufReader::new(file))
    }
}
