//! Parameter values, vectors and pipes
//!
//! A parameter is a plain `f64`. Validity is encoded in the value itself: an
//! invalid parameter is a quiet NaN whose payload has [`PARAM_INVALID_BIT`]
//! set. NaNs produced by ordinary arithmetic have an empty payload and count
//! as valid values.

use crate::memory::Arena;
use std::cell::Cell;
use std::fmt::Write as _;
use std::ops::Range;

/// Payload bit marking a NaN as the invalid parameter sentinel.
pub const PARAM_INVALID_BIT: u64 = 1 << 0;

const EXPONENT_MASK: u64 = 0x7ff0_0000_0000_0000;
const QUIET_BIT: u64 = 0x0008_0000_0000_0000;
const PAYLOAD_MASK: u64 = QUIET_BIT - 1;

/// Build a quiet NaN carrying `payload` in its low mantissa bits.
#[inline]
pub fn make_nan(payload: u64) -> f64 {
    f64::from_bits(EXPONENT_MASK | QUIET_BIT | (payload & PAYLOAD_MASK))
}

/// Payload bits of a NaN value. Zero for non-NaN values.
#[inline]
pub fn nan_payload(value: f64) -> u64 {
    if value.is_nan() {
        value.to_bits() & PAYLOAD_MASK
    } else {
        0
    }
}

/// The invalid parameter sentinel.
#[inline]
pub fn invalid_param() -> f64 {
    make_nan(PARAM_INVALID_BIT)
}

#[inline]
pub fn is_param_valid(value: f64) -> bool {
    !(value.is_nan() && (nan_payload(value) & PARAM_INVALID_BIT) != 0)
}

/// Half-open interval `[min, max)` used by filters, conditions and
/// aggregate threshold checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub min: f64,
    pub max: f64,
}

impl Thresholds {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Thresholds that defer to a pipe's declared limits.
    pub const fn unbounded() -> Self {
        Self {
            min: f64::NAN,
            max: f64::NAN,
        }
    }

    #[inline]
    pub fn contains(&self, v: f64) -> bool {
        self.min <= v && v < self.max
    }

    /// Replace unset (NaN) bounds with the given limits.
    pub fn or_limits(self, lower: f64, upper: f64) -> Self {
        Self {
            min: if self.min.is_nan() { lower } else { self.min },
            max: if self.max.is_nan() { upper } else { self.max },
        }
    }
}

/// Fixed-length vector of parameters stored in an [`Arena`].
///
/// This is only a handle; the values live in the arena and are accessed with
/// [`Arena::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamVec {
    offset: u32,
    len: u32,
}

impl ParamVec {
    /// `None` if the vector does not fit the 32-bit handle encoding.
    pub(crate) fn try_from_raw(offset: usize, len: usize) -> Option<Self> {
        let end = offset.checked_add(len)?;
        u32::try_from(end).ok()?;
        Some(Self {
            offset: offset as u32,
            len: len as u32,
        })
    }

    pub fn offset(&self) -> usize {
        self.offset as usize
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn range(&self) -> Range<usize> {
        self.offset()..self.offset() + self.len()
    }

    /// One-element view of this vector, `None` if `index` is out of range.
    pub fn element(&self, index: usize) -> Option<ParamVec> {
        if index < self.len() {
            ParamVec::try_from_raw(self.offset() + index, 1)
        } else {
            None
        }
    }
}

#[inline]
pub fn fill(cells: &[Cell<f64>], value: f64) {
    for c in cells {
        c.set(value);
    }
}

#[inline]
pub fn invalidate_all(cells: &[Cell<f64>]) {
    fill(cells, invalid_param());
}

/// Render a parameter vector for debugging: valid values as numbers, invalid
/// ones with their NaN payload.
pub fn format_param_vector(arena: &Arena, pv: ParamVec) -> String {
    let mut out = format!("pv offset={}, size={}\n", pv.offset(), pv.len());
    for (i, c) in arena.get(pv).iter().enumerate() {
        let v = c.get();
        if is_param_valid(v) {
            let _ = writeln!(out, "  [{:2}] {}", i, v);
        } else {
            let _ = writeln!(out, "  [{:2}] invalid, payload=0x{:x}", i, nan_payload(v));
        }
    }
    out
}

/// One bounded output: values plus per-element lower and upper limits, all
/// of equal length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeVectors {
    pub data: ParamVec,
    pub lower_limits: ParamVec,
    pub upper_limits: ParamVec,
}

impl PipeVectors {
    /// Allocate a pipe of `size` elements, data invalidated, limits filled.
    pub fn push(
        arena: &mut Arena,
        size: usize,
        lower_limit: f64,
        upper_limit: f64,
    ) -> crate::error::Result<Self> {
        Ok(Self {
            data: arena.push_param_vector_filled(size, invalid_param())?,
            lower_limits: arena.push_param_vector_filled(size, lower_limit)?,
            upper_limits: arena.push_param_vector_filled(size, upper_limit)?,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// One-element view of the pipe, used to connect a single parameter.
    pub fn element(&self, index: usize) -> Option<PipeVectors> {
        Some(PipeVectors {
            data: self.data.element(index)?,
            lower_limits: self.lower_limits.element(index)?,
            upper_limits: self.upper_limits.element(index)?,
        })
    }
}
