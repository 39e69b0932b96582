use crate::buffer::PlaintextBuffer;
use log::{debug, warn};
use std::collections::HashMap;

/// Tracks every plaintext buffer that has been handed out and not yet sanitized.
///
/// Each process keeps its own registry; entries never cross the process boundary.
/// A buffer leaves the registry only through [`release`](Self::release) or
/// [`sanitize_all`](Self::sanitize_all), both of which wipe it first.
#[derive(Debug, Default)]
pub struct BufferRegistry {
    buffers: HashMap<u64, PlaintextBuffer>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a buffer. Registering the same buffer twice is a no-op.
    pub fn register(&mut self, buffer: &PlaintextBuffer) {
        self.buffers.insert(buffer.id(), buffer.clone());
    }

    /// Sanitizes `buffer` and removes it. Returns `true` if this call performed the wipe.
    pub fn release(&mut self, buffer: &PlaintextBuffer) -> bool {
        let wiped = buffer.sanitize();
        if self.buffers.remove(&buffer.id()).is_none() {
            debug!("registry: released buffer {} was not registered", buffer.id());
        }
        wiped
    }

    /// Sanitizes and drops every tracked buffer, returning how many were still live.
    pub fn sanitize_all(&mut self) -> usize {
        let mut wiped = 0;
        for (id, buffer) in self.buffers.drain() {
            if buffer.sanitize() {
                wiped += 1;
            } else {
                warn!("registry: buffer {} was sanitized but never released", id);
            }
        }
        wiped
    }

    pub fn contains(&self, buffer: &PlaintextBuffer) -> bool {
        self.buffers.contains_key(&buffer.id())
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
