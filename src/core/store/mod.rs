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

mod directory;

pub use self::directory::*;

mod io;

pub use self::io::*;

mod lock;

pub use self::lock::*;

mod rate_limiter;

pub use self::rate_limiter::*;

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct FlushInfo {
    pub num_docs: u32,
    pub estimated_segment_size: u64,
}

impl FlushInfo {
    pub fn new(num_docs: u32, estimated_segment_size: u64) -> Self {
        FlushInfo {
            num_docs,
            estimated_segment_size,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct MergeInfo {
    pub total_max_doc: u32,
    pub estimated_merge_bytes: u64,
    pub is_external: bool,
    pub merge_max_num_segments: Option<u32>,
}

impl MergeInfo {
    pub fn new(
        total_max_doc: u32,
        estimated_merge_bytes: u64,
        is_external: bool,
        merge_max_num_segments: Option<u32>,
    ) -> Self {
        MergeInfo {
            total_max_doc,
            estimated_merge_bytes,
            is_external,
            merge_max_num_segments,
        }
    }
}

/// IOContext holds additional details on the merge/search context. A IOContext
/// object can never be initialized as None as passed as a parameter to either
/// `Directory#open_input` or `Directory#create_output`
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum IOContext {
    Default,
    Read(bool),
    Flush(FlushInfo),
    Merge(MergeInfo),
}

impl IOContext {
    pub const READ: IOContext = IOContext::Read(false);
    pub const READ_ONCE: IOContext = IOContext::Read(true);

    pub fn is_merge(&self) -> bool {
        match self {
            IOContext::Merge(_) => true,
            _ => false,
        }
    }
}

impl Default for IOContext {
    fn default() -> Self {
        IOContext::Default
    }
}
