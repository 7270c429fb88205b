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

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use crate::core::codec::segment_infos::{segment_file_name, strip_segment_name, SegmentInfo};
use crate::core::codec::{
    check_footer, check_header, header_length, read_index_file, write_footer, write_header,
    write_index_file, FOOTER_LENGTH,
};
use crate::core::store::{
    read_file, write_file, Directory, IOContext, IndexInput, IndexOutput, Lock,
};
use crate::error::{
    ErrorKind::{CorruptIndex, UnsupportedOperation},
    Result,
};

/// Encodes/decodes compound files
pub trait CompoundFormat: Send + Sync + fmt::Debug {
    /// Returns a read-only Directory view of the compound files in this segment
    fn get_compound_reader(
        &self,
        dir: Arc<dyn Directory>,
        si: &SegmentInfo,
        ioctx: &IOContext,
    ) -> Result<Arc<dyn Directory>>;

    /// Packs the provided segment's files into a compound format. Every file
    /// referenced by `si` must carry a codec footer.
    fn write(&self, dir: &dyn Directory, si: &SegmentInfo, ioctx: &IOContext) -> Result<()>;

    /// The files `write` produces for `si`.
    fn files(&self, si: &SegmentInfo) -> HashSet<String>;
}

const DATA_EXTENSION: &str = "cfs";
/// Extension of compound file entries
pub const ENTRIES_EXTENSION: &str = "cfe";
const DATA_CODEC: &str = "SedimentCompoundData";
const ENTRY_CODEC: &str = "SedimentCompoundEntries";
const VERSION_START: u32 = 0;
const VERSION_CURRENT: u32 = VERSION_START;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CompoundEntry {
    // file name with the segment name stripped, e.g. ".pst"
    name: String,
    offset: u64,
    length: u64,
}

/// Compound file format
///
/// * `.cfs`: header, the raw bytes of every packed file, footer.
/// * `.cfe`: the entry table, one `(name, offset, length)` per packed file.
#[derive(Debug, Default, Copy, Clone)]
pub struct DefaultCompoundFormat;

impl CompoundFormat for DefaultCompoundFormat {
    fn get_compound_reader(
        &self,
        dir: Arc<dyn Directory>,
        si: &SegmentInfo,
        ioctx: &IOContext,
    ) -> Result<Arc<dyn Directory>> {
        Ok(Arc::new(CompoundDirectory::open(dir, si, ioctx)?))
    }

    fn write(&self, dir: &dyn Directory, si: &SegmentInfo, ioctx: &IOContext) -> Result<()> {
        let data_file = segment_file_name(&si.name, "", DATA_EXTENSION);
        let entries_file = segment_file_name(&si.name, "", ENTRIES_EXTENSION);

        let mut files: Vec<String> = si.files().into_iter().collect();
        files.sort();

        let mut data = Vec::new();
        write_header(&mut data, DATA_CODEC, VERSION_CURRENT)?;
        let mut entries = Vec::with_capacity(files.len());
        for file in &files {
            let bytes = read_file(dir, file, &IOContext::READ_ONCE)?;
            // only files with a valid footer are packed
            check_footer(&bytes)?;
            entries.push(CompoundEntry {
                name: strip_segment_name(file).to_string(),
                offset: data.len() as u64,
                length: bytes.len() as u64,
            });
            data.extend_from_slice(&bytes);
        }
        write_footer(&mut data)?;

        write_file(dir, &data_file, &data, ioctx)?;
        write_index_file(
            dir,
            &entries_file,
            ENTRY_CODEC,
            VERSION_CURRENT,
            &serde_json::to_vec(&entries)?,
            ioctx,
        )
    }

    fn files(&self, si: &SegmentInfo) -> HashSet<String> {
        let mut files = HashSet::with_capacity(2);
        files.insert(segment_file_name(&si.name, "", DATA_EXTENSION));
        files.insert(segment_file_name(&si.name, "", ENTRIES_EXTENSION));
        files
    }
}

/// Read-only view of the files packed in a segment's `.cfs`.
pub struct CompoundDirectory {
    directory: Arc<dyn Directory>,
    segment_name: String,
    data: Arc<Vec<u8>>,
    entries: HashMap<String, CompoundEntry>,
}

impl CompoundDirectory {
    pub fn open(directory: Arc<dyn Directory>, si: &SegmentInfo, ioctx: &IOContext) -> Result<Self> {
        let data_file = segment_file_name(&si.name, "", DATA_EXTENSION);
        let entries_file = segment_file_name(&si.name, "", ENTRIES_EXTENSION);

        let payload = read_index_file(
            directory.as_ref(),
            &entries_file,
            ENTRY_CODEC,
            VERSION_START,
            VERSION_CURRENT,
            ioctx,
        )?;
        let list: Vec<CompoundEntry> = serde_json::from_slice(&payload)?;

        let data = read_file(directory.as_ref(), &data_file, ioctx)?;
        check_header(&data, DATA_CODEC, VERSION_START, VERSION_CURRENT)?;
        check_footer(&data)?;

        let min_offset = header_length(DATA_CODEC) as u64;
        let max_end = (data.len() - FOOTER_LENGTH) as u64;
        let mut entries = HashMap::with_capacity(list.len());
        for entry in list {
            if entry.offset < min_offset || entry.offset + entry.length > max_end {
                bail!(CorruptIndex(format!(
                    "compound entry {} out of bounds in {}",
                    entry.name, data_file
                )));
            }
            if entries.insert(entry.name.clone(), entry).is_some() {
                bail!(CorruptIndex(format!(
                    "duplicate compound entry in {}",
                    entries_file
                )));
            }
        }

        Ok(CompoundDirectory {
            directory,
            segment_name: si.name.clone(),
            data: Arc::new(data),
            entries,
        })
    }

    fn entry(&self, name: &str) -> Result<&CompoundEntry> {
        match self.entries.get(strip_segment_name(name)) {
            Some(e) => Ok(e),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no sub-file {} in compound file of {}", name, self.segment_name),
            )
            .into()),
        }
    }

    fn read_only<T>(&self, op: &str) -> Result<T> {
        bail!(UnsupportedOperation(Cow::Owned(format!(
            "{} on the read-only compound directory of {}",
            op, self.segment_name
        ))))
    }
}

impl Directory for CompoundDirectory {
    fn list_all(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .entries
            .keys()
            .map(|k| format!("{}{}", self.segment_name, k))
            .collect();
        names.sort();
        Ok(names)
    }

    fn file_length(&self, name: &str) -> Result<i64> {
        Ok(self.entry(name)?.length as i64)
    }

    fn create_output(&self, _name: &str, _context: &IOContext) -> Result<Box<dyn IndexOutput>> {
        self.read_only("create_output")
    }

    fn open_input(&self, name: &str, _ctx: &IOContext) -> Result<Box<dyn IndexInput>> {
        let entry = self.entry(name)?;
        Ok(Box::new(SliceInput {
            name: name.to_string(),
            data: Arc::clone(&self.data),
            pos: entry.offset as usize,
            end: (entry.offset + entry.length) as usize,
            len: entry.length,
        }))
    }

    fn delete_file(&self, _name: &str) -> Result<()> {
        self.read_only("delete_file")
    }

    fn sync(&self, _names: &HashSet<String>) -> Result<()> {
        self.read_only("sync")
    }

    fn sync_meta_data(&self) -> Result<()> {
        self.read_only("sync_meta_data")
    }

    fn rename(&self, _source: &str, _dest: &str) -> Result<()> {
        self.read_only("rename")
    }

    fn obtain_lock(&self, _name: &str) -> Result<Box<dyn Lock>> {
        self.read_only("obtain_lock")
    }
}

impl fmt::Display for CompoundDirectory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CompoundDirectory({}, {})", self.segment_name, self.directory)
    }
}

struct SliceInput {
    name: String,
    data: Arc<Vec<u8>>,
    pos: usize,
    end: usize,
    len: u64,
}

impl Read for SliceInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.end - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl IndexInput for SliceInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::DefaultCodec;
    use crate::core::store::RAMDirectory;
    use crate::core::util::random_id;

    #[test]
    fn test_pack_and_read_sub_files() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        write_index_file(dir.as_ref(), "_5.pst", "Test", 0, b"postings", &IOContext::Default)?;
        write_index_file(dir.as_ref(), "_5.fdt", "Test", 0, b"stored", &IOContext::Default)?;
        let si = SegmentInfo::new(
            "_5",
            1,
            Arc::clone(&dir),
            false,
            DefaultCodec::shared(),
            HashMap::new(),
            random_id(),
        );
        let mut files = HashSet::new();
        files.insert("_5.pst".to_string());
        files.insert("_5.fdt".to_string());
        si.set_files(&files)?;

        let format = DefaultCompoundFormat;
        format.write(dir.as_ref(), &si, &IOContext::Default)?;
        for f in format.files(&si) {
            assert!(dir.list_all()?.contains(&f));
        }

        let cfs = format.get_compound_reader(Arc::clone(&dir), &si, &IOContext::READ)?;
        assert_eq!(cfs.list_all()?, vec!["_5.fdt".to_string(), "_5.pst".to_string()]);
        let payload = read_index_file(cfs.as_ref(), "_5.pst", "Test", 0, 0, &IOContext::READ)?;
        assert_eq!(payload, b"postings".to_vec());
        assert!(cfs.open_input("_5.liv", &IOContext::READ).is_err());
        assert!(cfs.delete_file("_5.pst").is_err());
        Ok(())
    }

    #[test]
    fn test_file_without_footer_is_rejected() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        write_file(dir.as_ref(), "_6.pst", b"raw", &IOContext::Default)?;
        let si = SegmentInfo::new(
            "_6",
            1,
            Arc::clone(&dir),
            false,
            DefaultCodec::shared(),
            HashMap::new(),
            random_id(),
        );
        si.add_file("_6.pst")?;
        assert!(DefaultCompoundFormat
            .write(dir.as_ref(), &si, &IOContext::Default)
            .is_err());
        Ok(())
    }
}
