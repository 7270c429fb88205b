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
use std::sync::PoisonError;

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    errors {
        Poisoned {
            description("a thread holding the locked panicked and poisoned the lock")
        }

        IllegalState(desc: String) {
            description(desc)
            display("Illegal state: {}", desc)
        }

        IllegalArgument(desc: String) {
            description(desc)
            display("Illegal argument: {}", desc)
        }

        AlreadyClosed(desc: String) {
            description(desc)
            display("Already closed: {}", desc)
        }

        CorruptIndex(errmsg: String) {
            description(errmsg)
            display("Corrupt Index: {}", errmsg)
        }

        UnsupportedOperation(errmsg: Cow<'static, str>) {
            description(errmsg),
            display("Unsupported Operation: {}", errmsg)
        }

        RuntimeError(errmsg: String) {
            description(errmsg)
            display("Runtime Error: {}", errmsg)
        }

        MergeAborted(errmsg: String) {
            description(errmsg)
            display("Merge aborted: {}", errmsg)
        }

        LockObtainFailed(errmsg: String) {
            description(errmsg)
            display("Lock obtain failed: {}", errmsg)
        }

        /// The in-memory buffer of a writer thread may be corrupt, so every
        /// document buffered since the last flush must be discarded.
        Aborting(errmsg: String) {
            description(errmsg)
            display("Aborting: {}", errmsg)
        }

        /// Fatal to the whole writer, recorded as its tragic event.
        ResourceExhausted(errmsg: String) {
            description(errmsg)
            display("Resource exhausted: {}", errmsg)
        }
    }

    foreign_links {
        FmtError(::std::fmt::Error);
        IoError(::std::io::Error);
        FromUtf8Err(::std::string::FromUtf8Error);
        NumError(::std::num::ParseIntError);
        SerdeJsonError(::serde_json::Error);
    }
}

impl<Guard> From<PoisonError<Guard>> for Error {
    fn from(_: PoisonError<Guard>) -> Error {
        ErrorKind::Poisoned.into()
    }
}

impl Error {
    /// Whether this failure leaves a writer thread's buffered documents unusable.
    pub fn is_aborting(&self) -> bool {
        match self.kind() {
            ErrorKind::Aborting(_) | ErrorKind::ResourceExhausted(_) => true,
            _ => false,
        }
    }

    /// Whether this failure must close the whole writer.
    pub fn is_tragic(&self) -> bool {
        match self.kind() {
            ErrorKind::ResourceExhausted(_) => true,
            _ => false,
        }
    }

    pub fn is_already_closed(&self) -> bool {
        match self.kind() {
            ErrorKind::AlreadyClosed(_) => true,
            _ => false,
        }
    }

    pub fn is_merge_aborted(&self) -> bool {
        match self.kind() {
            ErrorKind::MergeAborted(_) => true,
            _ => false,
        }
    }

    /// A missing file, for callers that treat an already deleted file as success.
    pub fn is_not_found(&self) -> bool {
        match self.kind() {
            ErrorKind::IoError(e) => e.kind() == ::std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_errors() {
        let e: Error = ErrorKind::Aborting("postings".into()).into();
        assert!(e.is_aborting());
        assert!(!e.is_tragic());

        let e: Error = ErrorKind::ResourceExhausted("oom".into()).into();
        assert!(e.is_aborting());
        assert!(e.is_tragic());

        let e: Error = ErrorKind::IllegalArgument("bad field".into()).into();
        assert!(!e.is_aborting());

        let io = ::std::io::Error::new(::std::io::ErrorKind::NotFound, "gone");
        let e: Error = io.into();
        assert!(e.is_not_found());
    }
}
