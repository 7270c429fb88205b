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

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::core::codec::segment_infos::{segment_file_name, SegmentInfo};
use crate::core::codec::{read_index_file, write_index_file, Codec};
use crate::core::store::{Directory, IOContext};
use crate::core::util::{id2str, ID_LENGTH};
use crate::error::{
    ErrorKind::{CorruptIndex, IllegalState},
    Result,
};

/// File extension used to store `SegmentInfo`.
pub const SI_EXTENSION: &str = "si";
const SI_CODEC_NAME: &str = "SedimentSegmentInfo";
const VERSION_START: u32 = 0;
const VERSION_CURRENT: u32 = VERSION_START;

/// Expert: Controls the format of the `SegmentInfo` (segment metadata file).
pub trait SegmentInfoFormat: Send + Sync + fmt::Debug {
    /// Read `SegmentInfo` data from a directory.
    fn read(
        &self,
        directory: &Arc<dyn Directory>,
        segment_name: &str,
        segment_id: &[u8; ID_LENGTH],
        codec: &Arc<dyn Codec>,
        context: &IOContext,
    ) -> Result<SegmentInfo>;

    /// Write `SegmentInfo` data. The codec must add its SegmentInfo filename(s)
    /// to `info` before doing i/o.
    fn write(&self, dir: &dyn Directory, info: &SegmentInfo, io_context: &IOContext)
        -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct SegmentInfoData {
    name: String,
    id: String,
    max_doc: i32,
    is_compound_file: bool,
    diagnostics: HashMap<String, String>,
    files: BTreeSet<String>,
}

/// Segment metadata as a checksummed JSON document in `_N.si`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSegmentInfoFormat;

impl SegmentInfoFormat for JsonSegmentInfoFormat {
    fn read(
        &self,
        directory: &Arc<dyn Directory>,
        segment_name: &str,
        segment_id: &[u8; ID_LENGTH],
        codec: &Arc<dyn Codec>,
        context: &IOContext,
    ) -> Result<SegmentInfo> {
        let file_name = segment_file_name(segment_name, "", SI_EXTENSION);
        let payload = read_index_file(
            directory.as_ref(),
            &file_name,
            SI_CODEC_NAME,
            VERSION_START,
            VERSION_CURRENT,
            context,
        )?;
        let data: SegmentInfoData = serde_json::from_slice(&payload)?;
        if data.name != segment_name || data.id != id2str(segment_id) {
            bail!(CorruptIndex(format!(
                "{} belongs to segment {} ({}), expected {} ({})",
                file_name,
                data.name,
                data.id,
                segment_name,
                id2str(segment_id)
            )));
        }
        if data.max_doc < 0 {
            bail!(CorruptIndex(format!(
                "invalid doc count: {} in {}",
                data.max_doc, file_name
            )));
        }
        let info = SegmentInfo::new(
            segment_name,
            data.max_doc,
            Arc::clone(directory),
            data.is_compound_file,
            Arc::clone(codec),
            data.diagnostics,
            *segment_id,
        );
        let files: HashSet<String> = data.files.into_iter().collect();
        info.set_files(&files)?;
        Ok(info)
    }

    fn write(
        &self,
        dir: &dyn Directory,
        info: &SegmentInfo,
        io_context: &IOContext,
    ) -> Result<()> {
        if info.max_doc() < 0 {
            bail!(IllegalState(format!(
                "max_doc of {} is not known yet",
                info.name
            )));
        }
        let file_name = segment_file_name(&info.name, "", SI_EXTENSION);
        info.add_file(&file_name)?;

        let data = SegmentInfoData {
            name: info.name.clone(),
            id: id2str(&info.id),
            max_doc: info.max_doc(),
            is_compound_file: info.is_compound_file(),
            diagnostics: info.diagnostics.clone(),
            files: info.files().into_iter().collect(),
        };
        let payload = serde_json::to_vec(&data)?;
        write_index_file(
            dir,
            &file_name,
            SI_CODEC_NAME,
            VERSION_CURRENT,
            &payload,
            io_context,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::DefaultCodec;
    use crate::core::store::RAMDirectory;
    use crate::core::util::random_id;

    #[test]
    fn test_write_adds_si_file() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let codec = DefaultCodec::shared();
        let mut diagnostics = HashMap::new();
        diagnostics.insert("source".to_string(), "flush".to_string());
        let info = SegmentInfo::new(
            "_3",
            7,
            Arc::clone(&dir),
            true,
            Arc::clone(&codec),
            diagnostics,
            random_id(),
        );
        let format = JsonSegmentInfoFormat;
        format.write(dir.as_ref(), &info, &IOContext::Default)?;
        assert!(info.files().contains("_3.si"));

        let read = format.read(&dir, "_3", &info.id, &codec, &IOContext::READ)?;
        assert_eq!(read.max_doc(), 7);
        assert!(read.is_compound_file());
        assert_eq!(read.files(), info.files());
        assert_eq!(read.diagnostics.get("source").map(String::as_str), Some("flush"));

        // wrong id
        assert!(format
            .read(&dir, "_3", &random_id(), &codec, &IOContext::READ)
            .is_err());
        Ok(())
    }

    #[test]
    fn test_unknown_max_doc_is_rejected() {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let info = SegmentInfo::new(
            "_4",
            -1,
            Arc::clone(&dir),
            false,
            DefaultCodec::shared(),
            HashMap::new(),
            random_id(),
        );
        assert!(JsonSegmentInfoFormat
            .write(dir.as_ref(), &info, &IOContext::Default)
            .is_err());
    }
}
