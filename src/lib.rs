// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libscm contributors
//
// A persistent, file-backed word multiset: an ordered associative container
// of string keys with per-key occurrence counts, whose entire state survives
// process exit because all live data resides in a memory-mapped file at a
// fixed virtual address.
//
// Two tightly coupled pieces:
//   - `scm`: a single-file persistent heap, mmapped at a fixed address, with
//     a malloc/free/strdup-style allocator over the mapped region.
//   - `avl`: a persistent AVL multiset of strings, indexed by a root pointer
//     stored at the scm base, with all nodes and keys allocated inside scm.

mod error;
pub use error::Error;

mod scm;
pub use scm::Scm;

mod avl;
pub use avl::AvlIndex;

/// The fixed virtual address every `Scm` region is mapped at.
///
/// Pointers persisted inside the mapped region (the AVL root, node
/// `left`/`right`/`key` pointers) are only valid because every process that
/// opens the same backing file maps it at this exact address.
pub const VIRTUAL_ADDRESS: usize = 0x600000000000;

pub type Result<T> = std::result::Result<T, Error>;

/// Serializes tests that map a region at [`VIRTUAL_ADDRESS`].
///
/// `Scm::open` always maps at the same fixed address, so two `Scm` handles
/// alive at once in the same process (as happens when a test harness runs
/// tests concurrently in threads) would stomp on each other's mapping. Not
/// part of the public contract; only exported for the test binaries in this
/// workspace.
#[doc(hidden)]
pub fn __fixed_address_test_lock() -> &'static std::sync::Mutex<()> {
    static LOCK: std::sync::OnceLock<std::sync::Mutex<()>> = std::sync::OnceLock::new();
    LOCK.get_or_init(|| std::sync::Mutex::new(()))
}
