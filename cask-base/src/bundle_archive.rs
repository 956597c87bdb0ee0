// Bundle archive layout (a block container, little endian)
//
// [4] magic number encoded as u32 (0xCA5CB0B0)
// [4] file tag (b"CASK")
// [4] format version
// [4] block count (n)
// [8] zero, the begin of block 0
// [8*n] ending offset of each block, relative to the start of the data section
// [x] pad to 16 byte offset
// [...] blocks, each beginning at a 16 byte offset
//
// Block 0 is the bincode encoded list of asset names. Block i+1 is the payload of asset i.
// Raw bundles do not use this container, the file is the single asset's bytes.

use crate::hashing::HashMap;
use crate::{BaseError, BaseResult};
use std::convert::TryInto;
use std::io::Write;
use std::ops::Range;
use std::path::Path;

const MAGIC_NUMBER: u32 = 0xCA5CB0B0;
const FILE_TAG: [u8; 4] = *b"CASK";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE_IN_BYTES: usize = 16;
const BLOCK_LENGTH_SIZE_IN_BYTES: usize = 8;
const BLOCK_ALIGNMENT_IN_BYTES: usize = 16;

fn align_up(offset: usize) -> usize {
    ((offset + BLOCK_ALIGNMENT_IN_BYTES - 1) / BLOCK_ALIGNMENT_IN_BYTES) * BLOCK_ALIGNMENT_IN_BYTES
}

// Offsets read from a file may be anything, so these never overflow
fn checked_align_up(offset: u64) -> Option<u64> {
    let alignment = BLOCK_ALIGNMENT_IN_BYTES as u64;
    offset
        .checked_add(alignment - 1)
        .map(|x| (x / alignment) * alignment)
}

fn data_section_offset(block_count: usize) -> usize {
    align_up(HEADER_SIZE_IN_BYTES + (block_count + 1) * BLOCK_LENGTH_SIZE_IN_BYTES)
}

/// Builds a bundle archive. Used by the build pipeline, tools and tests.
#[derive(Default)]
pub struct BundleArchiveWriter {
    assets: Vec<(String, Vec<u8>)>,
}

impl BundleArchiveWriter {
    pub fn add_asset(
        &mut self,
        name: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.assets.push((name.into(), data.into()));
        self
    }

    pub fn write<W: Write>(
        &self,
        mut writer: W,
    ) -> BaseResult<()> {
        let names: Vec<&str> = self.assets.iter().map(|(name, _)| name.as_str()).collect();
        let table = bincode::serialize(&names)?;

        let mut blocks: Vec<&[u8]> = Vec::with_capacity(self.assets.len() + 1);
        blocks.push(&table);
        for (_, data) in &self.assets {
            blocks.push(data);
        }

        //
        // 16 byte header
        //
        writer.write_all(&MAGIC_NUMBER.to_le_bytes())?;
        writer.write_all(&FILE_TAG)?;
        writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
        writer.write_all(&(blocks.len() as u32).to_le_bytes())?;

        //
        // A single u64 zero + N u64 block end positions
        //
        writer.write_all(&0u64.to_le_bytes())?;
        let mut block_begin = 0;
        for block in &blocks {
            let block_end = block_begin + block.len();
            writer.write_all(&(block_end as u64).to_le_bytes())?;
            block_begin = align_up(block_end);
        }

        let table_end = HEADER_SIZE_IN_BYTES + (blocks.len() + 1) * BLOCK_LENGTH_SIZE_IN_BYTES;
        let padding = data_section_offset(blocks.len()) - table_end;
        writer.write_all(&vec![0u8; padding])?;

        for block in &blocks {
            writer.write_all(block)?;
            let padding = align_up(block.len()) - block.len();
            writer.write_all(&vec![0u8; padding])?;
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> BaseResult<Vec<u8>> {
        let mut bytes = Vec::default();
        self.write(&mut bytes)?;
        Ok(bytes)
    }

    pub fn write_to_file(
        &self,
        path: &Path,
    ) -> BaseResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        let mut writer = std::io::BufWriter::new(file);
        self.write(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

/// An opened bundle archive held in memory
pub struct BundleArchive {
    data: Vec<u8>,
    names: Vec<String>,
    blocks: Vec<Range<usize>>,
    lookup: HashMap<String, usize>,
}

impl std::fmt::Debug for BundleArchive {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("BundleArchive")
            .field("data_length", &self.data.len())
            .field("assets", &self.names)
            .finish()
    }
}

impl BundleArchive {
    pub fn from_bytes(data: Vec<u8>) -> BaseResult<BundleArchive> {
        profiling::scope!("BundleArchive::from_bytes");
        if data.len() < HEADER_SIZE_IN_BYTES {
            return Err(BaseError::InvalidArchive("file is smaller than the header".into()));
        }

        let read_u32 = |offset: usize| -> u32 {
            u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap_or([0; 4]))
        };

        if read_u32(0) != MAGIC_NUMBER || data[4..8] != FILE_TAG {
            return Err(BaseError::InvalidArchive("bad magic number".into()));
        }

        let version = read_u32(8);
        if version != FORMAT_VERSION {
            return Err(BaseError::InvalidArchive(format!(
                "unsupported format version {}",
                version
            )));
        }

        let block_count = read_u32(12) as usize;
        if block_count == 0 {
            return Err(BaseError::InvalidArchive("archive has no asset table".into()));
        }

        let data_offset = data_section_offset(block_count);
        if data_offset > data.len() {
            return Err(BaseError::InvalidArchive("block table is truncated".into()));
        }

        let read_u64 = |offset: usize| -> u64 {
            u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap_or([0; 8]))
        };

        let mut blocks = Vec::with_capacity(block_count);
        for index in 0..block_count {
            let size_offset = HEADER_SIZE_IN_BYTES + index * BLOCK_LENGTH_SIZE_IN_BYTES;
            let begin = checked_align_up(read_u64(size_offset));
            let end = read_u64(size_offset + BLOCK_LENGTH_SIZE_IN_BYTES);
            let absolute_end = (data_offset as u64).checked_add(end);
            let block = match (begin, absolute_end) {
                (Some(begin), Some(absolute_end))
                    if begin <= end && absolute_end <= data.len() as u64 =>
                {
                    (data_offset + begin as usize)..(absolute_end as usize)
                }
                _ => {
                    return Err(BaseError::InvalidArchive(format!(
                        "block {} is out of bounds",
                        index
                    )));
                }
            };
            blocks.push(block);
        }

        let names: Vec<String> = bincode::deserialize(&data[blocks[0].clone()])?;
        if names.len() + 1 != block_count {
            return Err(BaseError::InvalidArchive(format!(
                "asset table lists {} assets but there are {} payload blocks",
                names.len(),
                block_count - 1
            )));
        }

        let mut lookup = HashMap::default();
        for (index, name) in names.iter().enumerate() {
            lookup.insert(name.clone(), index + 1);
        }

        Ok(BundleArchive {
            data,
            names,
            blocks,
            lookup,
        })
    }

    pub fn from_file(path: &Path) -> BaseResult<BundleArchive> {
        Self::from_bytes(std::fs::read(path)?)
    }

    pub fn asset_names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(
        &self,
        name: &str,
    ) -> bool {
        self.lookup.contains_key(name)
    }

    pub fn asset_bytes(
        &self,
        name: &str,
    ) -> Option<&[u8]> {
        let block = self.lookup.get(name)?;
        Some(&self.data[self.blocks[*block].clone()])
    }

    /// Size of the archive in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
