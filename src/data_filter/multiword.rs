//! Filter spanning several data words
//!
//! Each subfilter matches one word. The filter is complete once every
//! subfilter has seen a matching word, regardless of arrival order. Extracted
//! fields are concatenated with the first subfilter's bits in the low end.

use super::filter::{extract, CacheEntry, DataFilter};
use crate::error::{A2Error, Result};

/// Maximum number of subfilters in a [`MultiWordFilter`].
pub const MAX_FILTERS: usize = 16;

/// Maximum total address or data bits across all subfilters.
pub const MAX_EXTRACT_BITS: u16 = 64;

/// Selects the address or the data extraction cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheType {
    A,
    D,
}

impl CacheType {
    fn index(self) -> usize {
        match self {
            CacheType::A => 0,
            CacheType::D => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiWordFilter {
    filters: [DataFilter; MAX_FILTERS],
    results: [u32; MAX_FILTERS],
    caches: [[CacheEntry; MAX_FILTERS]; 2],
    filter_count: usize,
    completion_mask: u16,
}

impl Default for MultiWordFilter {
    fn default() -> Self {
        Self {
            filters: [DataFilter::default(); MAX_FILTERS],
            results: [0; MAX_FILTERS],
            caches: [[CacheEntry::default(); MAX_FILTERS]; 2],
            filter_count: 0,
            completion_mask: 0,
        }
    }
}

impl MultiWordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list of subfilters.
    pub fn from_filters(filters: impl IntoIterator<Item = DataFilter>) -> Result<Self> {
        let mut result = Self::new();
        for f in filters {
            result.add_subfilter(f)?;
        }
        Ok(result)
    }

    /// Parse each pattern into a subfilter matching any word index.
    pub fn parse<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let filters = patterns
            .iter()
            .map(|p| DataFilter::parse(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Self::from_filters(filters)
    }

    /// Append a subfilter, returning the new subfilter count.
    pub fn add_subfilter(&mut self, subfilter: DataFilter) -> Result<usize> {
        if self.filter_count >= MAX_FILTERS {
            return Err(A2Error::Filter(format!(
                "filter count exceeded (max {})",
                MAX_FILTERS
            )));
        }

        for (cache_type, marker) in [(CacheType::A, 'a'), (CacheType::D, 'd')] {
            let bits = self.extract_bits(cache_type) + subfilter.extract_bits(marker) as u16;
            if bits > MAX_EXTRACT_BITS {
                return Err(A2Error::Filter(format!(
                    "combined '{}' bits {} exceed {}",
                    marker, bits, MAX_EXTRACT_BITS
                )));
            }
        }

        let i = self.filter_count;
        self.filters[i] = subfilter;
        self.caches[CacheType::A.index()][i] = subfilter.cache_entry('a');
        self.caches[CacheType::D.index()][i] = subfilter.cache_entry('d');
        self.filter_count += 1;
        self.clear_completion();
        Ok(self.filter_count)
    }

    pub fn filter_count(&self) -> usize {
        self.filter_count
    }

    pub fn filters(&self) -> &[DataFilter] {
        &self.filters[..self.filter_count]
    }

    pub fn completion_mask(&self) -> u16 {
        self.completion_mask
    }

    #[inline]
    pub fn clear_completion(&mut self) {
        self.completion_mask = 0;
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.completion_mask.count_ones() as usize == self.filter_count
    }

    /// Offer a word to the first unmatched subfilter that accepts it.
    /// Returns whether the filter is complete afterwards.
    #[inline]
    pub fn process_data(&mut self, data_word: u32, word_index: i32) -> bool {
        for i in 0..self.filter_count {
            let part_mask = 1u16 << i;
            if self.completion_mask & part_mask == 0
                && self.filters[i].matches(data_word, word_index)
            {
                self.results[i] = data_word;
                self.completion_mask |= part_mask;
                break;
            }
        }
        self.is_complete()
    }

    /// Concatenate the extracted fields, first subfilter in the low bits.
    #[inline]
    pub fn extract(&self, cache_type: CacheType) -> u64 {
        let caches = &self.caches[cache_type.index()];
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..self.filter_count {
            let value = extract(&caches[i], self.results[i]) as u64;
            // zero-width fields may sit at bit 64
            result |= value.checked_shl(shift).unwrap_or(0);
            shift += caches[i].extract_bits as u32;
        }
        result
    }

    /// Total number of bits extracted for `cache_type`.
    pub fn extract_bits(&self, cache_type: CacheType) -> u16 {
        self.caches[cache_type.index()][..self.filter_count]
            .iter()
            .map(|c| c.extract_bits as u16)
            .sum()
    }
}
