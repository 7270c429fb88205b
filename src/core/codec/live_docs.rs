// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashSet;
use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::core::codec::segment_infos::{file_name_from_generation, SegmentCommitInfo};
use crate::core::codec::{read_index_file, write_index_file};
use crate::core::store::{Directory, IOContext};
use crate::core::util::{bits2words, Bits, FixedBitSet};
use crate::error::{ErrorKind::CorruptIndex, Result};

/// Format for live/deleted documents
pub trait LiveDocsFormat: Send + Sync + fmt::Debug {
    /// Creates a new bit set, with all bits set, for the specified size.
    fn new_live_docs(&self, size: usize) -> FixedBitSet {
        FixedBitSet::all_set(size)
    }

    /// Read live docs bits.
    fn read_live_docs(
        &self,
        dir: &dyn Directory,
        info: &SegmentCommitInfo,
        context: &IOContext,
    ) -> Result<FixedBitSet>;

    /// Persist live docs bits. Uses `SegmentCommitInfo::next_write_del_gen` to
    /// determine the generation of the deletes file to write to.
    fn write_live_docs(
        &self,
        bits: &FixedBitSet,
        dir: &dyn Directory,
        info: &SegmentCommitInfo,
        new_del_count: i32,
        context: &IOContext,
    ) -> Result<()>;

    /// Records all files in use by this `SegmentCommitInfo` into the files argument.
    fn files(&self, info: &SegmentCommitInfo, files: &mut HashSet<String>);
}

const EXTENSION: &str = "liv";
const CODEC_NAME: &str = "SedimentLiveDocs";
const VERSION_START: u32 = 0;
const VERSION_CURRENT: u32 = VERSION_START;

/// Live docs as `num_bits` followed by little-endian 64 bit words.
#[derive(Debug, Default, Copy, Clone)]
pub struct BinaryLiveDocsFormat;

impl LiveDocsFormat for BinaryLiveDocsFormat {
    fn read_live_docs(
        &self,
        dir: &dyn Directory,
        info: &SegmentCommitInfo,
        context: &IOContext,
    ) -> Result<FixedBitSet> {
        let gen = info.del_gen();
        let name = file_name_from_generation(&info.info.name, EXTENSION, gen as u64);
        let length = info.info.max_doc() as usize;

        let payload = read_index_file(dir, &name, CODEC_NAME, VERSION_START, VERSION_CURRENT, context)?;
        let mut input = Cursor::new(payload);
        let num_bits = input.read_u32::<LittleEndian>()? as usize;
        if num_bits != length {
            bail!(CorruptIndex(format!(
                "{} holds {} bits but the segment has {} docs",
                name, num_bits, length
            )));
        }
        let num_words = bits2words(length);
        let mut words = Vec::with_capacity(num_words);
        for _ in 0..num_words {
            words.push(input.read_u64::<LittleEndian>()?);
        }
        let bits = FixedBitSet::from_words(words, length)?;

        let deleted = bits.len() - bits.cardinality();
        if deleted != info.del_count() as usize {
            bail!(CorruptIndex(format!(
                "{}: bits.deleted={} info.del_count={}",
                name,
                deleted,
                info.del_count()
            )));
        }
        Ok(bits)
    }

    fn write_live_docs(
        &self,
        bits: &FixedBitSet,
        dir: &dyn Directory,
        info: &SegmentCommitInfo,
        new_del_count: i32,
        context: &IOContext,
    ) -> Result<()> {
        let gen = info.next_write_del_gen();
        let name = file_name_from_generation(&info.info.name, EXTENSION, gen as u64);

        let deleted = bits.len() - bits.cardinality();
        if deleted != (info.del_count() + new_del_count) as usize {
            bail!(CorruptIndex(format!(
                "{}: bits.deleted={}, info.del_count={}, new_del_count={}",
                &name,
                deleted,
                info.del_count(),
                new_del_count
            )));
        }

        let mut payload = Vec::with_capacity(4 + bits.words().len() * 8);
        payload.write_u32::<LittleEndian>(bits.len() as u32)?;
        for word in bits.words() {
            payload.write_u64::<LittleEndian>(*word)?;
        }
        write_index_file(dir, &name, CODEC_NAME, VERSION_CURRENT, &payload, context)
    }

    fn files(&self, info: &SegmentCommitInfo, files: &mut HashSet<String>) {
        if info.has_deletions() {
            files.insert(file_name_from_generation(
                &info.info.name,
                EXTENSION,
                info.del_gen() as u64,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::segment_infos::SegmentInfo;
    use crate::core::codec::DefaultCodec;
    use crate::core::store::RAMDirectory;
    use crate::core::util::random_id;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn commit_info(dir: &Arc<dyn Directory>, max_doc: i32) -> SegmentCommitInfo {
        let info = SegmentInfo::new(
            "_0",
            max_doc,
            Arc::clone(dir),
            false,
            DefaultCodec::shared(),
            HashMap::new(),
            random_id(),
        );
        SegmentCommitInfo::new(Arc::new(info), 0, -1)
    }

    #[test]
    fn test_write_live_docs_under_next_gen() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let info = commit_info(&dir, 70);
        let format = BinaryLiveDocsFormat;

        let mut bits = format.new_live_docs(70);
        bits.clear(3);
        bits.clear(69);
        format.write_live_docs(&bits, dir.as_ref(), &info, 2, &IOContext::Default)?;
        info.advance_del_gen();
        info.set_del_count(2)?;

        let mut files = HashSet::new();
        format.files(&info, &mut files);
        assert!(files.contains("_0_1.liv"));

        let read = format.read_live_docs(dir.as_ref(), &info, &IOContext::READ)?;
        assert_eq!(read, bits);
        Ok(())
    }

    #[test]
    fn test_mismatched_delete_count_is_corrupt() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let info = commit_info(&dir, 10);
        let format = BinaryLiveDocsFormat;
        let mut bits = format.new_live_docs(10);
        bits.clear(1);
        assert!(format
            .write_live_docs(&bits, dir.as_ref(), &info, 2, &IOContext::Default)
            .is_err());
        Ok(())
    }
}
