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

use crate::error::Result;

use std::time::Duration;

/// Rate limits IO. Implementations are shared across every output involved in
/// one operation (for example one merge); writers call `pause` whenever they
/// have written more than `min_pause_check_bytes` bytes.
pub trait RateLimiter: Sync + Send {
    /// Sets an updated MB per second rate limit. 0.0 stops the IO entirely.
    fn set_mb_per_sec(&self, mb_per_sec: f64);

    /// The current MB per second rate limit.
    fn mb_per_sec(&self) -> f64;

    /// Pauses, if necessary, to keep the instantaneous IO rate
    /// at or below the target
    fn pause(&self, bytes: u64) -> Result<Duration>;

    /// how many bytes caller should add up itself before invoking `#pause`
    fn min_pause_check_bytes(&self) -> u64;
}
