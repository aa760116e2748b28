//! Single-word data filter
//!
//! A filter is written as up to 32 characters, most significant bit first.
//! Spaces are ignored and shorter patterns are right-aligned, so the missing
//! high positions are don't-care.
//!
//! | Char | Meaning                  |
//! |------|--------------------------|
//! | `0`  | bit must be clear        |
//! | `1`  | bit must be set          |
//! | `X`  | don't care               |
//! | `A`  | address bit (extracted)  |
//! | `D`  | data bit (extracted)     |
//!
//! Case does not matter.

use super::bits::bit_gather;
use crate::error::{A2Error, Result};
use std::fmt;
use std::str::FromStr;

/// Number of bit positions in a filter.
pub const FILTER_SIZE: usize = 32;

/// Match mask/value pair plus the source pattern.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DataFilter {
    /// Pattern characters, index 0 is bit 0.
    filter: [u8; FILTER_SIZE],
    match_mask: u32,
    match_value: u32,
    /// Word index this filter is pinned to, -1 matches any word.
    match_word_index: i32,
}

/// Precomputed extraction metadata for one marker character.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheEntry {
    pub extract_mask: u32,
    pub extract_bits: u8,
    pub need_gather: bool,
    pub extract_shift: u8,
}

impl Default for DataFilter {
    fn default() -> Self {
        Self {
            filter: [b'x'; FILTER_SIZE],
            match_mask: 0,
            match_value: 0,
            match_word_index: -1,
        }
    }
}

impl DataFilter {
    /// Parse a pattern matching any word index.
    pub fn parse(pattern: &str) -> Result<Self> {
        Self::with_word_index(pattern, -1)
    }

    /// Parse a pattern pinned to `word_index` (-1 for any).
    pub fn with_word_index(pattern: &str, word_index: i32) -> Result<Self> {
        let chars: Vec<u8> = pattern
            .bytes()
            .filter(|&c| c != b' ')
            .map(|c| c.to_ascii_lowercase())
            .collect();

        if chars.len() > FILTER_SIZE {
            return Err(A2Error::Filter(format!(
                "maximum filter size of {} exceeded: '{}'",
                FILTER_SIZE, pattern
            )));
        }

        if let Some(bad) = chars
            .iter()
            .find(|c| !matches!(c, b'0' | b'1' | b'x' | b'a' | b'd'))
        {
            return Err(A2Error::Filter(format!(
                "invalid character '{}' in filter '{}'",
                *bad as char, pattern
            )));
        }

        let mut result = DataFilter {
            match_word_index: word_index,
            ..Default::default()
        };

        for (idst, &c) in chars.iter().rev().enumerate() {
            result.filter[idst] = c;
        }

        for (i, &c) in result.filter.iter().enumerate() {
            if c == b'0' || c == b'1' {
                result.match_mask |= 1 << i;
            }
            if c == b'1' {
                result.match_value |= 1 << i;
            }
        }

        Ok(result)
    }

    pub fn match_mask(&self) -> u32 {
        self.match_mask
    }

    pub fn match_value(&self) -> u32 {
        self.match_value
    }

    pub fn match_word_index(&self) -> i32 {
        self.match_word_index
    }

    /// Test `value` against the mask/value pair and the optional word index.
    #[inline]
    pub fn matches(&self, value: u32, word_index: i32) -> bool {
        (self.match_word_index < 0 || self.match_word_index == word_index)
            && (value & self.match_mask) == self.match_value
    }

    /// Build the extraction cache for `marker` ('a' or 'd', any case).
    pub fn cache_entry(&self, marker: char) -> CacheEntry {
        let marker = marker.to_ascii_lowercase() as u8;
        let mut result = CacheEntry::default();
        let mut marker_seen = false;
        let mut gap_seen = false;

        for (i, &c) in self.filter.iter().enumerate() {
            if c == marker {
                if marker_seen && gap_seen {
                    result.need_gather = true;
                }
                result.extract_mask |= 1 << i;
                marker_seen = true;
            } else if marker_seen {
                gap_seen = true;
            }
        }

        result.extract_shift = if result.extract_mask == 0 {
            0
        } else {
            result.extract_mask.trailing_zeros() as u8
        };
        result.extract_bits = result.extract_mask.count_ones() as u8;
        result
    }

    /// Extract the bits marked with `marker`. A match is assumed.
    pub fn extract(&self, value: u32, marker: char) -> u32 {
        extract(&self.cache_entry(marker), value)
    }

    pub fn extract_bits(&self, marker: char) -> u8 {
        self.cache_entry(marker).extract_bits
    }

    pub fn extract_mask(&self, marker: char) -> u32 {
        self.cache_entry(marker).extract_mask
    }

    pub fn extract_shift(&self, marker: char) -> u8 {
        self.cache_entry(marker).extract_shift
    }
}

/// Extract the cached field from `value`. A match is assumed.
#[cfg(all(target_arch = "x86_64", target_feature = "bmi2"))]
#[inline]
pub fn extract(cache: &CacheEntry, value: u32) -> u32 {
    bit_gather(value, cache.extract_mask)
}

/// Extract the cached field from `value`. A match is assumed.
#[cfg(not(all(target_arch = "x86_64", target_feature = "bmi2")))]
#[inline]
pub fn extract(cache: &CacheEntry, value: u32) -> u32 {
    extract_shifted(cache, value)
}

/// Shift first, gather only when the marker bits are not contiguous.
#[inline]
pub fn extract_shifted(cache: &CacheEntry, value: u32) -> u32 {
    let result = (value & cache.extract_mask) >> cache.extract_shift;
    if cache.need_gather {
        bit_gather(result, cache.extract_mask >> cache.extract_shift)
    } else {
        result
    }
}

impl FromStr for DataFilter {
    type Err = A2Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for DataFilter {
    /// MSB-first pattern, grouped in nibbles.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (n, c) in self.filter.iter().rev().enumerate() {
            if n > 0 && n % 4 == 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", (*c as char).to_ascii_uppercase())?;
        }
        Ok(())
    }
}

impl fmt::Debug for DataFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataFilter")
            .field("filter", &self.to_string())
            .field("match_mask", &format_args!("0x{:08x}", self.match_mask))
            .field("match_value", &format_args!("0x{:08x}", self.match_value))
            .field("match_word_index", &self.match_word_index)
            .finish()
    }
}
