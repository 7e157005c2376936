//! The allocation list: a single authoritative registry of every in-flight
//! [`Request`], so that no failure path can leak a request's chunk buffers
//! or double-free them.
//!
//! The original engine this crate's design is grounded in kept an intrusive
//! linked list of raw pointers (`linked_list.c`'s `struct Node { void *ptr;
//! ... struct Node **children; struct Node *next; }`) guarded by one global
//! mutex. Rust has no safe equivalent of "the pointer is also the
//! identity", so this is a `HashMap` keyed by a monotonically increasing
//! [`RequestId`] instead: the id plays the role the raw pointer used to
//! play, and the `children` slot becomes [`Node::payload`], an arbitrary
//! opaque value the caller can attach to a request. Removing an entry drops
//! its `Node` — and therefore the `Request`'s `Chunk` buffers — exactly
//! once, for free, via `Drop`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::request::Request;

/// Identifies one entry in an [`AllocList`] for as long as it is registered.
pub type RequestId = u64;

/// One outstanding request plus whatever opaque payload the caller attached
/// to it, mirroring the original's per-node `children` slot.
pub struct Node {
    pub request: Request,
    pub payload: Option<Box<dyn Any + Send>>,
}

/// Owns every `Request` the engine has outstanding, indexed by `RequestId`.
#[derive(Default)]
pub struct AllocList {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<RequestId, Node>,
    next_id: RequestId,
}

impl AllocList {
    pub fn new() -> AllocList {
        AllocList::default()
    }

    /// Registers `request` with no payload, returning the id it can later
    /// be looked up or removed by. Ids are never reused within a process
    /// lifetime.
    pub fn insert(&self, request: Request) -> RequestId {
        self.insert_with_payload(request, None)
    }

    /// Registers `request` along with an opaque `payload`.
    pub fn insert_with_payload(
        &self,
        request: Request,
        payload: Option<Box<dyn Any + Send>>,
    ) -> RequestId {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(id, Node { request, payload });
        id
    }

    /// Removes and returns the node registered under `id`, if any.
    pub fn remove(&self, id: RequestId) -> Option<Node> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.remove(&id)
    }

    /// Runs `f` against the request registered under `id` without removing
    /// it, used to mutate a `Request`'s cursor in place between completions.
    pub fn with_request_mut<R>(&self, id: RequestId, f: impl FnOnce(&mut Request) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.get_mut(&id).map(|node| f(&mut node.request))
    }

    /// Number of requests currently outstanding.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every outstanding request, releasing all chunk buffers. Called
    /// once during `Engine::destroy` after every worker has stopped. Logs
    /// how many requests were still outstanding, which should be zero once
    /// every worker has joined.
    pub fn free_all(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let outstanding = inner.entries.len();
        if outstanding > 0 {
            log::warn!("freeing {outstanding} requests still outstanding at shutdown");
        }
        inner.entries.clear();
    }
}
