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

mod merge_policy;

pub use self::merge_policy::*;

mod merge_rate_limiter;

pub use self::merge_rate_limiter::*;

mod merge_scheduler;

pub use self::merge_scheduler::*;

mod merge_state;

pub use self::merge_state::*;

mod segment_merger;

pub use self::segment_merger::*;
