// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libscm contributors
//
// A persistent AVL multiset of byte strings, indexed by a root pointer
// stored at the owning `Scm`'s base address. Every node and every key is a
// plain SCM allocation, so the whole index survives a close/reopen cycle
// without any separate serialization step.
//
// Ported from `avl.c` (see `examples/original_source/avl.c`); the recursive
// `update`/`delete` shape, the rotation table, and the never-rotate-on-
// duplicate-insert rule all follow the original directly. Two deliberate
// departures from the literal C, both forced by this index's own balance
// and counter invariants rather than by taste:
//
//   - the two-children delete case falls through to the shared rebalance
//     tail instead of returning immediately after the successor recursion,
//     so the node where the structural change actually happened gets its
//     depth and balance rechecked like every other mutated ancestor;
//   - removing a node (as opposed to just decrementing `count`) always
//     decrements both `items` and `unique`, in every 0/1/2-child branch,
//     not only when `count` was already 1 going in.
//
// Node/key frees are deferred until after the parent pointer on the walk
// back to `open`'s caller has been reassigned, following the "safer
// implementation" alternative the design calls out for mid-delete crash
// consistency: a crash before that point leaves the tree exactly as it was
// before `delete` was called, never with a dangling pointer into a freed
// slot.

use std::cmp::Ordering;
use std::mem;
use std::path::Path;
use std::ptr::{self, NonNull};

use crate::error::Error;
use crate::scm::Scm;
use crate::Result;

#[repr(C)]
struct RawNode {
    depth: i32,
    count: u64,
    key: *mut u8,
    left: *mut RawNode,
    right: *mut RawNode,
}

#[repr(C)]
struct Anchor {
    items: u64,
    unique: u64,
    root: *mut RawNode,
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::EmptyKey);
    }
    if let Some(pos) = key.bytes().position(|b| b == 0) {
        return Err(Error::InvalidKey(pos));
    }
    Ok(())
}

unsafe fn node_key_str<'a>(node: *mut RawNode) -> &'a str {
    let cstr = std::ffi::CStr::from_ptr((*node).key as *const std::os::raw::c_char);
    cstr.to_str().expect("scm key is not valid utf-8")
}

#[inline]
fn delta(node: *mut RawNode) -> i32 {
    if node.is_null() {
        -1
    } else {
        unsafe { (*node).depth }
    }
}

#[inline]
fn node_balance(node: *mut RawNode) -> i32 {
    unsafe { delta((*node).left) - delta((*node).right) }
}

#[inline]
fn depth_of(a: *mut RawNode, b: *mut RawNode) -> i32 {
    let (da, db) = (delta(a), delta(b));
    if da > db {
        da + 1
    } else {
        db + 1
    }
}

unsafe fn rotate_right(node: *mut RawNode) -> *mut RawNode {
    let root = (*node).left;
    (*node).left = (*root).right;
    (*root).right = node;
    (*node).depth = depth_of((*node).left, (*node).right);
    (*root).depth = depth_of((*root).left, node);
    root
}

unsafe fn rotate_left(node: *mut RawNode) -> *mut RawNode {
    let root = (*node).right;
    (*node).right = (*root).left;
    (*root).left = node;
    (*node).depth = depth_of((*node).left, (*node).right);
    (*root).depth = depth_of((*root).right, node);
    root
}

unsafe fn rotate_left_right(node: *mut RawNode) -> *mut RawNode {
    (*node).left = rotate_left((*node).left);
    rotate_right(node)
}

unsafe fn rotate_right_left(node: *mut RawNode) -> *mut RawNode {
    (*node).right = rotate_right((*node).right);
    rotate_left(node)
}

/// A persistent, ordered multiset of strings backed by an [`Scm`] region.
///
/// Deliberately not `Send`/`Sync`, for the same reason `Scm` isn't: the
/// backing region has a single-writer, single-thread contract.
pub struct AvlIndex {
    scm: Scm,
    anchor: *mut Anchor,
}

impl AvlIndex {
    /// Opens the AVL index backed by `path`, opening (and possibly
    /// truncating) the underlying [`Scm`] region in the process.
    ///
    /// If the region was already in use, the anchor is recovered from
    /// `scm.base()`; otherwise a fresh, zeroed anchor is allocated there.
    pub fn open(path: impl AsRef<Path>, truncate: bool) -> Result<Self> {
        let scm = Scm::open(path, truncate)?;
        let anchor = if scm.utilized() {
            scm.base().as_ptr() as *mut Anchor
        } else {
            let p = scm.allocate(mem::size_of::<Anchor>())?.as_ptr() as *mut Anchor;
            unsafe { ptr::write_bytes(p as *mut u8, 0, mem::size_of::<Anchor>()) };
            debug_assert_eq!(p as *mut u8, scm.base().as_ptr());
            p
        };
        log::trace!(
            "avl: opened, items={}, unique={}",
            unsafe { (*anchor).items },
            unsafe { (*anchor).unique }
        );
        Ok(Self { scm, anchor })
    }

    /// Flushes and unmaps the underlying region.
    pub fn close(self) -> Result<()> {
        self.scm.close()
    }

    /// Inserts `key`, creating a new node if absent or incrementing its
    /// count if already present. `items` is incremented either way; `unique`
    /// only when a new node is created.
    pub fn insert(&self, key: impl AsRef<str>) -> Result<()> {
        let key = key.as_ref();
        validate_key(key)?;
        let root = unsafe { (*self.anchor).root };
        let root = self.update(root, key)?;
        unsafe { (*self.anchor).root = root };
        Ok(())
    }

    fn update(&self, root: *mut RawNode, key: &str) -> Result<*mut RawNode> {
        if root.is_null() {
            let node_ptr = self.scm.allocate(mem::size_of::<RawNode>())?.as_ptr() as *mut RawNode;
            unsafe { ptr::write_bytes(node_ptr as *mut u8, 0, mem::size_of::<RawNode>()) };
            let key_ptr = self.scm.duplicate_string(key)?;
            unsafe {
                (*node_ptr).count = 1;
                (*node_ptr).key = key_ptr.as_ptr();
                (*self.anchor).items += 1;
                (*self.anchor).unique += 1;
            }
            log::trace!("avl: inserted new key {key:?}");
            return Ok(node_ptr);
        }

        let mut root = root;
        let existing = unsafe { node_key_str(root) };
        match key.cmp(existing) {
            Ordering::Equal => unsafe {
                (*root).count += 1;
                (*self.anchor).items += 1;
            },
            Ordering::Less => {
                let new_left = self.update(unsafe { (*root).left }, key)?;
                unsafe { (*root).left = new_left };
                if node_balance(root).abs() > 1 {
                    let left = unsafe { (*root).left };
                    let left_key = unsafe { node_key_str(left) };
                    root = unsafe {
                        if key.cmp(left_key) == Ordering::Less {
                            rotate_right(root)
                        } else {
                            rotate_left_right(root)
                        }
                    };
                }
            }
            Ordering::Greater => {
                let new_right = self.update(unsafe { (*root).right }, key)?;
                unsafe { (*root).right = new_right };
                if node_balance(root).abs() > 1 {
                    let right = unsafe { (*root).right };
                    let right_key = unsafe { node_key_str(right) };
                    root = unsafe {
                        if key.cmp(right_key) == Ordering::Greater {
                            rotate_left(root)
                        } else {
                            rotate_right_left(root)
                        }
                    };
                }
            }
        }
        unsafe { (*root).depth = depth_of((*root).left, (*root).right) };
        Ok(root)
    }

    /// Deletes one occurrence of `key`. Decrements `count` if it was greater
    /// than one; otherwise removes the node entirely. A key that is not
    /// present is a no-op (logged, not an error) — only an invalid `key`
    /// itself (empty, or containing an interior NUL) is an error.
    pub fn delete(&self, key: impl AsRef<str>) -> Result<()> {
        let key = key.as_ref();
        validate_key(key)?;
        let mut pending_frees: Vec<(*mut u8, *mut RawNode)> = Vec::new();
        let root = unsafe { (*self.anchor).root };
        let root = self.delete_rec(root, key, &mut pending_frees);
        // The anchor's root pointer is reassigned before anything touched
        // by this delete is actually freed — see the module doc comment.
        unsafe { (*self.anchor).root = root };
        for (key_ptr, node_ptr) in pending_frees {
            unsafe {
                self.scm.free(NonNull::new_unchecked(key_ptr));
                self.scm.free(NonNull::new_unchecked(node_ptr as *mut u8));
            }
        }
        Ok(())
    }

    fn delete_rec(
        &self,
        root: *mut RawNode,
        key: &str,
        pending_frees: &mut Vec<(*mut u8, *mut RawNode)>,
    ) -> *mut RawNode {
        if root.is_null() {
            log::debug!("avl: delete of absent key {key:?} is a no-op");
            return root;
        }

        let existing = unsafe { node_key_str(root) };
        match key.cmp(existing) {
            Ordering::Equal => {
                let count = unsafe { (*root).count };
                if count > 1 {
                    unsafe {
                        (*root).count -= 1;
                        (*self.anchor).items -= 1;
                    }
                    return root;
                }

                let left = unsafe { (*root).left };
                let right = unsafe { (*root).right };
                if left.is_null() || right.is_null() {
                    unsafe {
                        (*self.anchor).items -= 1;
                        (*self.anchor).unique -= 1;
                    }
                    pending_frees.push((unsafe { (*root).key }, root));
                    return if left.is_null() { right } else { left };
                }

                // Two children: swap payload with the in-order successor
                // (leftmost node of the right subtree) and recurse to
                // remove that successor from the right subtree. Unlike the
                // original C, this falls through to the shared rebalance
                // tail below instead of returning immediately.
                let mut curr = right;
                unsafe {
                    while !(*curr).left.is_null() {
                        curr = (*curr).left;
                    }
                    mem::swap(&mut (*root).key, &mut (*curr).key);
                    mem::swap(&mut (*root).count, &mut (*curr).count);
                }
                // `curr` now holds the key that used to live at `root`; that
                // is the value the recursive call must search for in the
                // right subtree to find and physically remove `curr`.
                let search_key = unsafe { node_key_str(curr) };
                let new_right = self.delete_rec(right, search_key, pending_frees);
                unsafe { (*root).right = new_right };
            }
            Ordering::Less => {
                let new_left = self.delete_rec(unsafe { (*root).left }, key, pending_frees);
                unsafe { (*root).left = new_left };
            }
            Ordering::Greater => {
                let new_right = self.delete_rec(unsafe { (*root).right }, key, pending_frees);
                unsafe { (*root).right = new_right };
            }
        }

        let mut root = root;
        let bf = node_balance(root);
        if bf > 1 {
            root = unsafe {
                if node_balance((*root).left) >= 0 {
                    rotate_right(root)
                } else {
                    rotate_left_right(root)
                }
            };
        } else if bf < -1 {
            root = unsafe {
                if node_balance((*root).right) <= 0 {
                    rotate_left(root)
                } else {
                    rotate_right_left(root)
                }
            };
        }
        unsafe { (*root).depth = depth_of((*root).left, (*root).right) };
        root
    }

    /// Returns `count(key)`, or 0 if `key` is absent. Pure iterative descent.
    pub fn lookup_count(&self, key: impl AsRef<str>) -> u64 {
        let key = key.as_ref();
        let mut node = unsafe { (*self.anchor).root };
        while !node.is_null() {
            let existing = unsafe { node_key_str(node) };
            match key.cmp(existing) {
                Ordering::Equal => return unsafe { (*node).count },
                Ordering::Less => node = unsafe { (*node).left },
                Ordering::Greater => node = unsafe { (*node).right },
            }
        }
        0
    }

    /// In-order traversal, invoking `f(key, count)` once per node.
    pub fn traverse<F: FnMut(&str, u64)>(&self, mut f: F) {
        fn walk(node: *mut RawNode, f: &mut dyn FnMut(&str, u64)) {
            if node.is_null() {
                return;
            }
            unsafe {
                walk((*node).left, f);
                f(node_key_str(node), (*node).count);
                walk((*node).right, f);
            }
        }
        walk(unsafe { (*self.anchor).root }, &mut f);
    }

    /// Convenience wrapper over [`AvlIndex::traverse`] collecting an owned,
    /// in-order `Vec` of `(key, count)` pairs.
    pub fn iter(&self) -> Vec<(String, u64)> {
        let mut out = Vec::new();
        self.traverse(|k, c| out.push((k.to_string(), c)));
        out
    }

    /// Total occurrences across all keys (Σ `count`).
    pub fn items(&self) -> u64 {
        unsafe { (*self.anchor).items }
    }

    /// Number of distinct keys (node count).
    pub fn unique(&self) -> u64 {
        unsafe { (*self.anchor).unique }
    }
}
