//! Opaque integer handles for objects living behind the host boundary.
//!
//! A host can only hold on to native objects through plain 64 bit integers.
//! Such an integer may be stale, corrupted or made up, so it must be
//! validated before it is used. Rather than handing out addresses, every
//! object is stored in a [`HandleTable`] and the handle encodes where:
//!
//! ```text
//!   63        48 47        32 31                     0
//!  +------------+------------+------------------------+
//!  |   magic    | generation |         index          |
//!  +------------+------------+------------------------+
//! ```
//!
//! The magic identifies the table, and so the type of object. The
//! generation is bumped whenever an entry is removed, so a handle to a
//! removed object never resolves again, even after its index is reused.
//! Zero is never a valid handle because the magic is never zero.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};

pub type Handle = u64;


//------------ HandleTable ---------------------------------------------------

#[derive(Debug)]
pub struct HandleTable<T> {
    /// The magic tag carried by all handles of this table.
    magic: u16,

    /// Describes the objects, for error messages.
    kind: &'static str,

    inner: RwLock<Entries<T>>,
}

#[derive(Debug)]
struct Entries<T> {
    entries: Vec<Entry<T>>,

    /// Indexes of vacant entries.
    free: Vec<u32>,
}

#[derive(Debug)]
struct Entry<T> {
    generation: u16,
    value: Option<Arc<T>>,
}

impl<T> HandleTable<T> {
    pub fn new(magic: u16, kind: &'static str) -> Self {
        assert!(magic != 0, "handle magic must not be zero");
        HandleTable {
            magic,
            kind,
            inner: RwLock::new(Entries {
                entries: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Stores `value` and returns its handle.
    ///
    /// The handle becomes valid only now, after the value is complete.
    pub fn insert(&self, value: Arc<T>) -> Handle {
        let mut inner = self.inner.write();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.entries.push(Entry {
                    generation: 1,
                    value: None,
                });
                (inner.entries.len() - 1) as u32
            }
        };
        let entry = &mut inner.entries[index as usize];
        entry.value = Some(value);
        self.encode(entry.generation, index)
    }

    /// Resolves a handle to its object.
    pub fn resolve(&self, handle: Handle) -> Result<Arc<T>> {
        let (generation, index) = self.decode(handle)?;
        let inner = self.inner.read();
        match inner.entries.get(index as usize) {
            Some(Entry {
                generation: current,
                value: Some(value),
            }) if *current == generation => Ok(value.clone()),
            _ => Err(self.invalid(handle)),
        }
    }

    /// Removes an object, invalidating its handle.
    ///
    /// Returns the object so the caller decides when to tear it down.
    pub fn remove(&self, handle: Handle) -> Result<Arc<T>> {
        let (generation, index) = self.decode(handle)?;
        let mut inner = self.inner.write();
        let value = match inner.entries.get_mut(index as usize) {
            Some(entry) if entry.generation == generation && entry.value.is_some() => {
                entry.generation = next_generation(entry.generation);
                entry.value.take()
            }
            _ => None,
        };
        match value {
            Some(value) => {
                inner.free.push(index);
                Ok(value)
            }
            None => Err(self.invalid(handle)),
        }
    }

    /// Removes all objects matching `pred`, returning them.
    pub fn remove_where(&self, pred: impl Fn(&T) -> bool) -> Vec<Arc<T>> {
        let mut inner = self.inner.write();
        let mut removed = Vec::new();
        let mut freed = Vec::new();
        for (index, entry) in inner.entries.iter_mut().enumerate() {
            if entry.value.as_deref().is_some_and(&pred) {
                entry.generation = next_generation(entry.generation);
                removed.extend(entry.value.take());
                freed.push(index as u32);
            }
        }
        inner.free.extend(freed);
        removed
    }

    /// Returns the number of live objects.
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.entries.len() - inner.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn encode(&self, generation: u16, index: u32) -> Handle {
        (u64::from(self.magic) << 48) | (u64::from(generation) << 32) | u64::from(index)
    }

    fn decode(&self, handle: Handle) -> Result<(u16, u32)> {
        if (handle >> 48) as u16 != self.magic {
            return Err(self.invalid(handle));
        }
        Ok(((handle >> 32) as u16, handle as u32))
    }

    fn invalid(&self, handle: Handle) -> Error {
        Error::invalid_handle(self.kind, handle)
    }
}

/// Generations start at one and skip zero when wrapping.
fn next_generation(generation: u16) -> u16 {
    match generation.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}


//------------ Tests ---------------------------------------------------------
