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

mod segment_infos;

pub use self::segment_infos::*;

mod segment_info_format;

pub use self::segment_info_format::*;

use regex::Regex;

use crate::core::util::{from_base36, to_base36};
use crate::error::{ErrorKind::IllegalArgument, Result};

// index file names
pub const INDEX_FILE_SEGMENTS: &str = "segments";
pub const INDEX_FILE_PENDING_SEGMENTS: &str = "pending_segments";
pub const INDEX_FILE_OLD_SEGMENT_GEN: &str = "segments.gen";
/// Name of the write lock in the index.
pub const WRITE_LOCK_NAME: &str = "write.lock";

pub const CODEC_FILE_PATTERN: &str = r"^_[a-z0-9]+(_.*)?\..*$";

lazy_static! {
    static ref CODEC_FILE_REGEX: Regex = Regex::new(CODEC_FILE_PATTERN).unwrap();
}

/// Whether `name` looks like a file a codec writes for some segment.
pub fn matches_codec_file_pattern(name: &str) -> bool {
    CODEC_FILE_REGEX.is_match(name)
}

// locates the boundary of the segment name, or None
fn index_of_segment_name(filename: &str) -> Option<usize> {
    // If it is a .liv file, there's an '_' after the first character
    let rest = filename.get(1..)?;
    if let Some(i) = rest.find('_') {
        return Some(i + 1);
    }
    rest.find('.').map(|i| i + 1)
}

/// Strips the segment name out of the given file name.
pub fn strip_segment_name(name: &str) -> &str {
    if let Some(idx) = index_of_segment_name(name) {
        &name[idx..]
    } else {
        name
    }
}

/// Parses the segment name out of the given file name.
/// Returns the segment name only, or filename if it
/// does not contain a '.' and '_'.
pub fn parse_segment_name(filename: &str) -> &str {
    if let Some(idx) = index_of_segment_name(filename) {
        &filename[..idx]
    } else {
        filename
    }
}

/// Removes the extension (anything after the first '.').
pub fn strip_extension(filename: &str) -> &str {
    match filename.find('.') {
        Some(idx) => &filename[..idx],
        None => filename,
    }
}

pub fn segment_file_name(name: &str, suffix: &str, ext: &str) -> String {
    if !ext.is_empty() || !suffix.is_empty() {
        debug_assert!(!ext.starts_with('.'));
        let mut filename = String::with_capacity(name.len() + 2 + suffix.len() + ext.len());
        filename.push_str(name);
        if !suffix.is_empty() {
            filename.push('_');
            filename.push_str(suffix);
        }
        if !ext.is_empty() {
            filename.push('.');
            filename.push_str(ext);
        }
        filename
    } else {
        String::from(name)
    }
}

/// Computes the full file name from base, extension and generation. If the
/// generation is 0, the file name is `base.ext`, otherwise `base_gen.ext`
/// with the generation in base 36.
pub fn file_name_from_generation(base: &str, ext: &str, gen: u64) -> String {
    if gen == 0 {
        segment_file_name(base, "", ext)
    } else {
        let mut res = String::with_capacity(base.len() + 16);
        res.push_str(base);
        res.push('_');
        res += &to_base36(gen);
        if !ext.is_empty() {
            res.push('.');
            res.push_str(ext);
        }
        res
    }
}

/// Returns the generation from this file name,
/// or 0 if there is no generation
pub fn parse_generation(filename: &str) -> Result<u64> {
    if !filename.starts_with('_') {
        bail!(IllegalArgument(format!("{} is not a segment file", filename)));
    }
    let parts: Vec<&str> = strip_extension(filename)[1..].split('_').collect();
    // segment.ext or segment_gen.ext
    if parts.len() == 2 {
        match from_base36(parts[1]) {
            Some(gen) => Ok(gen),
            None => bail!(IllegalArgument(format!("bad generation in {}", filename))),
        }
    } else {
        Ok(0)
    }
}

/// Parse the generation off the segments file name and return it.
pub fn generation_from_segments_file_name(file_name: &str) -> Result<i64> {
    if file_name == INDEX_FILE_SEGMENTS {
        Ok(0)
    } else if file_name.starts_with(INDEX_FILE_SEGMENTS) {
        let gen = file_name
            .get(INDEX_FILE_SEGMENTS.len() + 1..)
            .and_then(from_base36);
        match gen {
            Some(gen) => Ok(gen as i64),
            None => bail!(IllegalArgument(format!(
                "fileName \"{}\" is not a segments file",
                file_name
            ))),
        }
    } else {
        bail!(IllegalArgument(format!(
            "fileName \"{}\" is not a segments file",
            file_name
        )));
    }
}

/// Whether `name` is a committed `segments_N` file.
pub fn is_segments_file(name: &str) -> bool {
    name.starts_with(INDEX_FILE_SEGMENTS) && name != INDEX_FILE_OLD_SEGMENT_GEN
}

/// Get the generation of the most recent commit to the list of index files,
/// or -1 if there is none.
pub fn get_last_commit_generation(files: &[String]) -> i64 {
    let mut max = -1;
    for file in files {
        if is_segments_file(file) {
            if let Ok(gen) = generation_from_segments_file_name(file) {
                if gen > max {
                    max = gen;
                }
            }
        }
    }
    max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() -> Result<()> {
        assert_eq!(segment_file_name("_a", "", "si"), "_a.si");
        assert_eq!(segment_file_name("_a", "Lucene50_0", "doc"), "_a_Lucene50_0.doc");
        assert_eq!(file_name_from_generation("_a", "liv", 0), "_a.liv");
        assert_eq!(file_name_from_generation("_a", "liv", 37), "_a_11.liv");
        assert_eq!(parse_generation("_a_11.liv")?, 37);
        assert_eq!(parse_generation("_a.si")?, 0);
        assert_eq!(parse_segment_name("_a_11.liv"), "_a");
        assert_eq!(parse_segment_name("_a.si"), "_a");
        assert_eq!(strip_segment_name("_a.si"), ".si");
        Ok(())
    }

    #[test]
    fn test_segments_generation() -> Result<()> {
        let name = file_name_from_generation(INDEX_FILE_SEGMENTS, "", 36);
        assert_eq!(name, "segments_10");
        assert_eq!(generation_from_segments_file_name(&name)?, 36);
        assert!(generation_from_segments_file_name("_0.si").is_err());

        let files: Vec<String> = vec!["segments_2", "segments_a", "_0.si", "segments.gen"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(get_last_commit_generation(&files), 10);
        assert_eq!(get_last_commit_generation(&[]), -1);
        Ok(())
    }

    #[test]
    fn test_codec_file_pattern() {
        assert!(matches_codec_file_pattern("_0.si"));
        assert!(matches_codec_file_pattern("_1a_2.liv"));
        assert!(!matches_codec_file_pattern("segments_1"));
        assert!(!matches_codec_file_pattern("write.lock"));
    }
}
