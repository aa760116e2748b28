//! Single-buffer bump arena backing all per-run analysis state
//!
//! Every parameter vector created while a run's graph is built (source
//! outputs, operator outputs and limits, histogram storage, per-operator
//! scratch vectors) is carved out of one contiguous backing store. Nothing is
//! ever freed individually; [`Arena::reset`] discards the whole generation at
//! a run boundary.
//!
//! The store holds `Cell<f64>` so that operators can read their upstream
//! inputs and write their own outputs through shared references while the
//! graph is stepped. Allocation needs `&mut Arena`, stepping only `&Arena`,
//! which makes "no allocation during stepping" a compile-time property.
//!
//! Arbitrary values can be placed into the arena with [`Arena::push_object`].
//! Their space is accounted against the same capacity and they are dropped in
//! reverse order of creation on reset, interleaved with any closures
//! registered through [`Arena::push_teardown`].

use crate::error::{A2Error, Result};
use crate::param::ParamVec;
use std::any::Any;
use std::cell::Cell;
use std::marker::PhantomData;

/// Alignment in bytes of every parameter vector created by the arena.
pub const PARAM_VEC_ALIGNMENT: usize = 32;

/// Default arena size used when a configuration does not specify one.
pub const DEFAULT_ARENA_CAPACITY: usize = 4 * 1024 * 1024;

const PARAM_SIZE: usize = std::mem::size_of::<f64>();

/// Largest usable arena size. Parameter vector handles address at most
/// `u32::MAX` elements.
pub const MAX_ARENA_CAPACITY: usize = (u32::MAX as usize).saturating_mul(PARAM_SIZE);

enum Entry {
    Object(Box<dyn Any + Send>),
    Teardown(Box<dyn FnOnce() + Send>),
}

/// Handle to a value stored with [`Arena::push_object`].
///
/// Handles are tied to the arena generation that created them and resolve to
/// `None` after a reset.
pub struct ObjectHandle<T> {
    index: usize,
    generation: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ObjectHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ObjectHandle<T> {}

impl<T> std::fmt::Debug for ObjectHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectHandle({}@gen{})", self.index, self.generation)
    }
}

/// Fixed-capacity bump allocator.
pub struct Arena {
    capacity: usize,
    used: usize,
    generation: u64,
    params: Box<[Cell<f64>]>,
    entries: Vec<Entry>,
}

impl Arena {
    /// Create an arena with `capacity` bytes of backing store, capped at
    /// [`MAX_ARENA_CAPACITY`].
    pub fn new(capacity: usize) -> Self {
        let slots = capacity.min(MAX_ARENA_CAPACITY) / PARAM_SIZE;
        Self {
            capacity: slots * PARAM_SIZE,
            used: 0,
            generation: 0,
            params: (0..slots).map(|_| Cell::new(0.0)).collect(),
            entries: Vec::new(),
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes allocated since the last reset, including alignment padding.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes still available.
    pub fn free(&self) -> usize {
        self.capacity - self.used
    }

    /// Number of resets performed so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Reserve `size` bytes aligned to `align` and return the byte offset.
    ///
    /// `align` must be a power of two.
    pub fn push_size(&mut self, size: usize, align: usize) -> Result<usize> {
        let align = align.max(1);
        if !align.is_power_of_two() {
            return Err(A2Error::Build(format!(
                "alignment {} is not a power of two",
                align
            )));
        }

        let aligned = (self.used + (align - 1)) & !(align - 1);
        let end = aligned
            .checked_add(size)
            .filter(|&end| end <= self.capacity)
            .ok_or(A2Error::OutOfMemory {
                requested: size,
                available: self.capacity.saturating_sub(aligned),
            })?;

        self.used = end;
        Ok(aligned)
    }

    /// Allocate a parameter vector of `size` elements, zero initialized.
    pub fn push_param_vector(&mut self, size: usize) -> Result<ParamVec> {
        self.push_param_vector_filled(size, 0.0)
    }

    /// Allocate a parameter vector of `size` elements set to `value`.
    pub fn push_param_vector_filled(&mut self, size: usize, value: f64) -> Result<ParamVec> {
        let bytes = size
            .checked_mul(PARAM_SIZE)
            .ok_or(A2Error::OutOfMemory {
                requested: usize::MAX,
                available: self.free(),
            })?;
        let offset = self.push_size(bytes, PARAM_VEC_ALIGNMENT)? / PARAM_SIZE;
        let pv = ParamVec::try_from_raw(offset, size).ok_or(A2Error::OutOfMemory {
            requested: bytes,
            available: self.free(),
        })?;
        for cell in self.get(pv) {
            cell.set(value);
        }
        Ok(pv)
    }

    /// Store `value` in the arena. It is dropped on [`Arena::reset`].
    pub fn push_object<T: Any + Send>(&mut self, value: T) -> Result<ObjectHandle<T>> {
        self.push_size(std::mem::size_of::<T>(), std::mem::align_of::<T>())?;
        let index = self.entries.len();
        self.entries.push(Entry::Object(Box::new(value)));
        Ok(ObjectHandle {
            index,
            generation: self.generation,
            _marker: PhantomData,
        })
    }

    /// Register a closure to run when the arena is reset.
    pub fn push_teardown<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.entries.push(Entry::Teardown(Box::new(f)));
    }

    /// Resolve an object handle.
    pub fn object<T: Any>(&self, handle: ObjectHandle<T>) -> Option<&T> {
        if handle.generation != self.generation {
            return None;
        }
        match self.entries.get(handle.index)? {
            Entry::Object(obj) => obj.downcast_ref::<T>(),
            Entry::Teardown(_) => None,
        }
    }

    /// Resolve an object handle mutably.
    pub fn object_mut<T: Any>(&mut self, handle: ObjectHandle<T>) -> Option<&mut T> {
        if handle.generation != self.generation {
            return None;
        }
        match self.entries.get_mut(handle.index)? {
            Entry::Object(obj) => obj.downcast_mut::<T>(),
            Entry::Teardown(_) => None,
        }
    }

    /// Drop all objects and run teardown closures in reverse order, then
    /// rewind the cursor. Previously returned parameter vectors and handles
    /// must not be used afterwards.
    pub fn reset(&mut self) {
        while let Some(entry) = self.entries.pop() {
            match entry {
                Entry::Object(obj) => drop(obj),
                Entry::Teardown(f) => f(),
            }
        }
        self.used = 0;
        self.generation += 1;
    }

    /// View the cells of a parameter vector.
    ///
    /// Panics if `pv` was not allocated from this arena.
    #[inline]
    pub fn get(&self, pv: ParamVec) -> &[Cell<f64>] {
        &self.params[pv.range()]
    }

    /// Copy a parameter vector's values out of the arena.
    pub fn values(&self, pv: ParamVec) -> Vec<f64> {
        self.get(pv).iter().map(Cell::get).collect()
    }

    /// Read a single element.
    #[inline]
    pub fn value(&self, pv: ParamVec, index: usize) -> f64 {
        self.get(pv)[index].get()
    }

    /// Overwrite a parameter vector from a slice of equal length.
    pub fn copy_from(&self, pv: ParamVec, values: &[f64]) {
        for (cell, &v) in self.get(pv).iter().zip(values) {
            cell.set(v);
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.reset();
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .field("generation", &self.generation)
            .field("entries", &self.entries.len())
            .finish()
    }
}
