use crate::error::{Result, SecretError};
use crate::memcall::{self, Region};
use log::{debug, warn};
use std::fmt;
use zeroize::Zeroize;

/// Allocation granularity inside the pool.
const SLOT_ALIGN: usize = 16;

fn round_to_slot(len: usize) -> usize {
    len.div_ceil(SLOT_ALIGN) * SLOT_ALIGN
}

/// Handle to a range of bytes stored in a [`ProtectedPool`].
///
/// Slots are not `Clone`: releasing one consumes it, so a range can only be freed once.
#[derive(Debug, PartialEq, Eq)]
pub struct PoolSlot {
    offset: usize,
    len: usize,
}

impl PoolSlot {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn reserved(&self) -> usize {
        round_to_slot(self.len)
    }
}

/// A fixed-capacity region of locked, non-dumpable memory.
///
/// The pool is acquired once when the worker starts and handed to the
/// [`SecretManager`](crate::SecretManager), which owns it for the rest of the
/// process lifetime. Usage is accounted in whole slots so that the manager can
/// detect when key material has left the pool.
pub struct ProtectedPool {
    region: Option<Region>,
    locked: bool,
    // Sorted by offset.
    slots: Vec<(usize, usize)>,
}

impl fmt::Debug for ProtectedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectedPool")
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .field("locked", &self.locked)
            .finish()
    }
}

impl ProtectedPool {
    /// Maps and locks a region of at least `capacity` bytes.
    ///
    /// # Errors
    ///
    /// * `SecretError::Allocation` - `capacity` is zero, or `strict` is set and the
    ///   region could not be locked into RAM
    /// * `SecretError::Memcall` - the mapping itself failed
    pub fn acquire(capacity: usize, strict: bool) -> Result<Self> {
        if capacity == 0 {
            return Err(SecretError::Allocation(
                "protected pool capacity must be greater than zero".into(),
            ));
        }
        let region = memcall::alloc(capacity)?;

        let locked = if cfg!(feature = "no-mlock") {
            debug!("pool: memory locking disabled at build time");
            false
        } else {
            match memcall::lock(&region) {
                Ok(()) => true,
                Err(e) if strict => {
                    if let Err(free_err) = memcall::free(region) {
                        warn!("pool: failed to release unlocked region: {}", free_err);
                    }
                    return Err(SecretError::Allocation(format!(
                        "protected memory is unavailable: {}",
                        e
                    )));
                }
                Err(e) => {
                    warn!("pool: continuing without locked memory: {}", e);
                    false
                }
            }
        };

        debug!(
            "pool: acquired {} bytes of protected memory (locked: {})",
            region.len(),
            locked
        );
        Ok(Self {
            region: Some(region),
            locked,
            slots: Vec::new(),
        })
    }

    /// Whether the backing region is locked into RAM.
    pub fn is_locked(&self) -> bool {
        self.locked && self.region.is_some()
    }

    pub fn capacity(&self) -> usize {
        self.region.as_ref().map_or(0, Region::len)
    }

    /// Bytes currently reserved by live slots.
    pub fn in_use(&self) -> usize {
        self.slots.iter().map(|&(_, reserved)| reserved).sum()
    }

    /// Copies `data` into a fresh slot. The caller remains responsible for wiping `data`.
    pub fn store(&mut self, data: &[u8]) -> Result<PoolSlot> {
        if data.is_empty() {
            return Err(SecretError::Allocation("cannot store an empty value".into()));
        }
        let reserved = round_to_slot(data.len());
        let capacity = self.capacity();
        let region = self
            .region
            .as_mut()
            .ok_or_else(|| SecretError::Lifecycle("protected pool has been released".into()))?;

        // First fit over the gaps between live slots.
        let mut cursor = 0;
        let mut insert_at = self.slots.len();
        for (index, &(offset, len)) in self.slots.iter().enumerate() {
            if offset - cursor >= reserved {
                insert_at = index;
                break;
            }
            cursor = offset + len;
        }
        if insert_at == self.slots.len() && capacity - cursor < reserved {
            return Err(SecretError::Allocation(format!(
                "protected pool exhausted: {} bytes requested, {} of {} in use",
                reserved,
                self.slots.iter().map(|&(_, r)| r).sum::<usize>(),
                capacity
            )));
        }

        region.as_mut_slice()[cursor..cursor + data.len()].copy_from_slice(data);
        self.slots.insert(insert_at, (cursor, reserved));
        Ok(PoolSlot {
            offset: cursor,
            len: data.len(),
        })
    }

    /// Borrows the bytes held by `slot`.
    pub fn read(&self, slot: &PoolSlot) -> Result<&[u8]> {
        let region = self
            .region
            .as_ref()
            .ok_or_else(|| SecretError::Lifecycle("protected pool has been released".into()))?;
        if !self.slots.contains(&(slot.offset, slot.reserved())) {
            return Err(SecretError::Allocation(
                "slot is no longer resident in the protected pool".into(),
            ));
        }
        Ok(&region.as_slice()[slot.offset..slot.offset + slot.len])
    }

    /// Zero-fills and releases `slot`.
    pub fn release(&mut self, slot: PoolSlot) {
        let reserved = slot.reserved();
        if let Some(region) = self.region.as_mut() {
            region.as_mut_slice()[slot.offset..slot.offset + reserved].zeroize();
        }
        self.slots
            .retain(|&(offset, len)| !(offset == slot.offset && len == reserved));
    }

    /// Wipes every slot, unlocks and unmaps the region. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        self.slots.clear();
        let Some(region) = self.region.take() else {
            return Ok(());
        };
        if self.locked {
            if let Err(e) = memcall::unlock(&region) {
                warn!("pool: munlock failed during close: {}", e);
            }
        }
        memcall::free(region)?;
        debug!("pool: released protected memory");
        Ok(())
    }
}

impl Drop for ProtectedPool {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("pool: failed to release protected memory on drop: {}", e);
        }
    }
}
