use std::sync::{Arc, Mutex};

use pipemux_platform::PlatformHandle;

/// A handle-table entry that carries an unmodified platform handle.
///
/// The handle can be taken out exactly once; a second extraction observes the
/// empty slot and fails at the API layer.
#[derive(Debug, Clone)]
pub struct WrapperDispatcher {
    slot: Arc<Mutex<Option<PlatformHandle>>>,
}

impl WrapperDispatcher {
    pub fn new(handle: PlatformHandle) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Take the wrapped handle, leaving the slot empty.
    pub fn take(&self) -> Option<PlatformHandle> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}
