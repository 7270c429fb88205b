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

mod codec_util;

pub use self::codec_util::*;

mod postings;

pub use self::postings::*;

mod live_docs;

pub use self::live_docs::*;

mod compound;

pub use self::compound::*;

pub mod segment_infos;

pub use self::segment_infos::*;

use std::fmt;
use std::sync::Arc;

/// Encodes/decodes an inverted index segment.
///
/// A codec bundles one implementation of every per-segment format; the
/// writer never touches file bytes itself.
pub trait Codec: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Encodes/decodes postings and stored fields
    fn postings_format(&self) -> &dyn PostingsFormat;

    /// Encodes/decodes segment info file
    fn segment_info_format(&self) -> &dyn SegmentInfoFormat;

    /// Encodes/decodes live docs
    fn live_docs_format(&self) -> &dyn LiveDocsFormat;

    /// Encodes/decodes compound files
    fn compound_format(&self) -> &dyn CompoundFormat;
}

pub const DEFAULT_CODEC_NAME: &str = "Sediment10";

#[derive(Debug, Default)]
pub struct DefaultCodec {
    postings_format: JsonPostingsFormat,
    segment_info_format: JsonSegmentInfoFormat,
    live_docs_format: BinaryLiveDocsFormat,
    compound_format: DefaultCompoundFormat,
}

impl DefaultCodec {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn shared() -> Arc<dyn Codec> {
        Arc::new(DefaultCodec::new())
    }
}

impl Codec for DefaultCodec {
    fn name(&self) -> &str {
        DEFAULT_CODEC_NAME
    }

    fn postings_format(&self) -> &dyn PostingsFormat {
        &self.postings_format
    }

    fn segment_info_format(&self) -> &dyn SegmentInfoFormat {
        &self.segment_info_format
    }

    fn live_docs_format(&self) -> &dyn LiveDocsFormat {
        &self.live_docs_format
    }

    fn compound_format(&self) -> &dyn CompoundFormat {
        &self.compound_format
    }
}
