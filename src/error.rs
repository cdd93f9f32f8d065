// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libscm contributors

use std::fmt;
use std::io;

/// Errors surfaced by `Scm` and `AvlIndex`.
///
/// Mirrors the failure kinds in the original C implementation
/// (resource-acquisition failure, region exhaustion, precondition
/// violations) but as a typed, propagatable `Result` instead of a null
/// handle or a bare `-1` return code.
#[derive(Debug)]
pub enum Error {
    /// `open`/`mmap`/`fstat`/`ftruncate`/flush-on-`close` I/O failure.
    Io(io::Error),
    /// `open` was given a path that is not a regular file.
    NotRegularFile,
    /// The fixed virtual address lies below the current program break; the
    /// region cannot be mapped where persisted pointers expect it.
    AddressUnavailable,
    /// The allocator scanned the whole region without finding a block large
    /// enough for the request.
    RegionExhausted,
    /// `insert` was called with an empty key.
    EmptyKey,
    /// `insert` was called with a key containing an interior NUL byte at
    /// the given byte offset (this would truncate the stored C string).
    InvalidKey(usize),
    /// `Scm::open` was called on a platform without a fixed-address mmap.
    UnsupportedPlatform,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "scm I/O error: {e}"),
            Error::NotRegularFile => write!(f, "backing path is not a regular file"),
            Error::AddressUnavailable => write!(
                f,
                "fixed virtual address 0x{VIRTUAL_ADDRESS:x} is below the program break",
                VIRTUAL_ADDRESS = crate::VIRTUAL_ADDRESS
            ),
            Error::RegionExhausted => write!(f, "scm region exhausted: no block large enough"),
            Error::EmptyKey => write!(f, "key must not be empty"),
            Error::InvalidKey(at) => write!(f, "key contains an interior NUL byte at offset {at}"),
            Error::UnsupportedPlatform => {
                write!(f, "fixed-address scm mapping is only supported on unix")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
