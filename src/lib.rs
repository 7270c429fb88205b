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

//! The write path of a segment-based full-text index.
//!
//! `IndexWriter` accepts documents, updates and deletes from many threads at once,
//! buffers them per thread, flushes them into immutable segments in a well defined
//! order, merges segments in the background and reference-counts every file that a
//! commit still needs.

#![recursion_limit = "1024"]
#![allow(clippy::cast_lossless)]
#![allow(clippy::new_without_default)]

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
extern crate rand;
extern crate regex;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;

extern crate arc_swap;
extern crate byteorder;
extern crate crc;
extern crate crossbeam;
extern crate num_cpus;
extern crate thread_local;

pub mod core;
pub mod error;
