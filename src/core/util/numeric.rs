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

const BASE36_DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub fn to_base36(val: u64) -> String {
    let mut val = val;
    let mut result = Vec::with_capacity(14);
    loop {
        result.push(BASE36_DIGITS[(val % 36) as usize]);
        val /= 36;
        if val == 0 {
            break;
        }
    }
    result.reverse();
    // only ascii digits were pushed
    String::from_utf8_lossy(&result).into_owned()
}

pub fn from_base36(val: &str) -> Option<u64> {
    u64::from_str_radix(val, 36).ok()
}

/// Converts a megabyte budget into bytes, saturating on overflow.
pub fn mb_to_bytes(mb: f64) -> u64 {
    let bytes = mb * 1024.0 * 1024.0;
    if bytes >= ::std::u64::MAX as f64 {
        ::std::u64::MAX
    } else if bytes <= 0.0 {
        0
    } else {
        bytes as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(from_base36(&to_base36(123_456_789)), Some(123_456_789));
        assert_eq!(from_base36("not base36!"), None);
    }
}
