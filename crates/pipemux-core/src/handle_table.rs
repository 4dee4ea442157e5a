use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};

use crate::dispatcher::Dispatcher;
use crate::error::{CoreError, Result};

/// An opaque reference to a handle-table entry.
///
/// Value 0 is reserved as the invalid sentinel and is never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub const INVALID: Handle = Handle(0);

    pub fn value(self) -> u32 {
        self.0
    }

    pub(crate) fn from_value(value: u32) -> Self {
        Handle(value)
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// The process-wide handle registry.
///
/// Lives for the whole process; every operation takes the one table lock, so
/// multi-handle removal is atomic by construction.
pub struct HandleTable {
    inner: Mutex<TableInner>,
}

struct TableInner {
    entries: HashMap<u32, Dispatcher>,
    next: u32,
}

static TABLE: LazyLock<HandleTable> = LazyLock::new(HandleTable::new);

/// The process-wide table instance.
pub fn table() -> &'static HandleTable {
    &TABLE
}

impl HandleTable {
    fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                entries: HashMap::new(),
                next: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a dispatcher under a fresh handle value.
    ///
    /// # Panics
    ///
    /// Panics if all 2^32 - 1 handle values are live. At that point the
    /// process has leaked handles beyond recovery and cannot continue.
    pub fn insert(&self, dispatcher: Dispatcher) -> Handle {
        let mut inner = self.lock();
        let value = Self::allocate_value(&mut inner);
        inner.entries.insert(value, dispatcher);
        Handle(value)
    }

    /// Insert under `preferred` when that value is free, else allocate.
    ///
    /// Same-process transfers use this so an attachment read back in the
    /// process that wrote it keeps its original handle value.
    pub fn insert_at(&self, preferred: Handle, dispatcher: Dispatcher) -> Handle {
        let mut inner = self.lock();
        let value = if preferred.is_valid() && !inner.entries.contains_key(&preferred.0) {
            preferred.0
        } else {
            Self::allocate_value(&mut inner)
        };
        inner.entries.insert(value, dispatcher);
        Handle(value)
    }

    fn allocate_value(inner: &mut TableInner) -> u32 {
        assert!(
            inner.entries.len() < u32::MAX as usize,
            "handle table exhausted"
        );
        loop {
            inner.next = inner.next.wrapping_add(1);
            if inner.next != 0 && !inner.entries.contains_key(&inner.next) {
                return inner.next;
            }
        }
    }

    /// Clone the dispatcher registered under `handle`.
    pub fn get(&self, handle: Handle) -> Option<Dispatcher> {
        self.lock().entries.get(&handle.0).cloned()
    }

    /// Remove and return the entry under `handle`.
    pub fn remove(&self, handle: Handle) -> Option<Dispatcher> {
        self.lock().entries.remove(&handle.0)
    }

    /// Remove several entries atomically.
    ///
    /// Either every handle is live and distinct and all are removed, or
    /// nothing changes and the call fails. Used to release message
    /// attachments all-or-nothing.
    pub fn remove_all(&self, handles: &[Handle]) -> Result<Vec<Dispatcher>> {
        let mut inner = self.lock();
        for (i, handle) in handles.iter().enumerate() {
            if !inner.entries.contains_key(&handle.0) {
                return Err(CoreError::InvalidHandle);
            }
            if handles[..i].contains(handle) {
                return Err(CoreError::InvalidHandle);
            }
        }
        let mut removed = Vec::with_capacity(handles.len());
        for handle in handles {
            let dispatcher = inner
                .entries
                .remove(&handle.0)
                .ok_or(CoreError::InvalidHandle)?;
            removed.push(dispatcher);
        }
        Ok(removed)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().entries.len()
    }
}
