//! List filter: combine several raw words, then extract
//!
//! The raw input words are sliced (low 16 bits, or all 32 bits) and
//! concatenated into one 64-bit intermediate value, filling from bit 0
//! upwards. The combined value is then split into its low and high 32-bit
//! halves which are fed to an embedded [`MultiWordFilter`] as word 0 and
//! word 1.
//!
//! Repeated application for multi-hit channels is done by the caller using
//! [`ListFilter::word_count`] as the stride.

use super::filter::DataFilter;
use super::multiword::{CacheType, MultiWordFilter};
use crate::error::{A2Error, Result};
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ListFilterFlags: u8 {
        /// Use all 32 bits of each input word instead of the low 16.
        const WORD_SIZE_32 = 1 << 0;
        /// The last input word fills the low bits of the combined value.
        const REVERSE_COMBINE = 1 << 1;
    }
}

/// Max input words when combining 16-bit parts.
pub const MAX_WORDS_16: u8 = 4;
/// Max input words when combining 32-bit parts.
pub const MAX_WORDS_32: u8 = 2;

/// Address/value pair extracted from a combined word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListFilterResult {
    pub address: u64,
    pub value: u64,
    pub matched: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListFilter {
    extraction_filter: MultiWordFilter,
    flags: ListFilterFlags,
    word_count: u8,
}

impl ListFilter {
    /// Create and validate a list filter.
    ///
    /// `filter_strings` holds at most two patterns. The last one is applied
    /// to the low 32 bits of the combined value, the one before it to the
    /// high 32 bits. With no patterns every combined value matches and
    /// nothing is extracted.
    pub fn new<S: AsRef<str>>(
        flags: ListFilterFlags,
        word_count: u8,
        filter_strings: &[S],
    ) -> Result<Self> {
        if filter_strings.len() > 2 {
            return Err(A2Error::ListFilter(format!(
                "at most two filter strings are supported, got {}",
                filter_strings.len()
            )));
        }

        let mut extraction_filter = MultiWordFilter::new();
        for (word_index, pattern) in filter_strings.iter().rev().enumerate() {
            let f = DataFilter::with_word_index(pattern.as_ref(), word_index as i32)?;
            extraction_filter.add_subfilter(f)?;
        }

        let result = Self {
            extraction_filter,
            flags,
            word_count,
        };
        result.validate()?;
        Ok(result)
    }

    /// Check the word count against the part size.
    pub fn validate(&self) -> Result<()> {
        let max = if self.flags.contains(ListFilterFlags::WORD_SIZE_32) {
            MAX_WORDS_32
        } else {
            MAX_WORDS_16
        };

        if self.word_count == 0 || self.word_count > max {
            return Err(A2Error::ListFilter(format!(
                "word count {} out of range 1..={}",
                self.word_count, max
            )));
        }
        Ok(())
    }

    pub fn flags(&self) -> ListFilterFlags {
        self.flags
    }

    /// Number of input words consumed per application.
    pub fn word_count(&self) -> usize {
        self.word_count as usize
    }

    pub fn extraction_filter(&self) -> &MultiWordFilter {
        &self.extraction_filter
    }

    fn part_bits(&self) -> u32 {
        if self.flags.contains(ListFilterFlags::WORD_SIZE_32) {
            32
        } else {
            16
        }
    }

    /// Width of the combined value in bits.
    pub fn combined_bit_count(&self) -> usize {
        self.word_count() * self.part_bits() as usize
    }

    pub fn extract_bits(&self, cache_type: CacheType) -> u16 {
        self.extraction_filter.extract_bits(cache_type)
    }

    /// Concatenate up to `word_count` words of `data` into one value.
    #[inline]
    pub fn combine(&self, data: &[u32]) -> u64 {
        let n = data.len().min(self.word_count());
        let part_bits = self.part_bits();
        let part_mask: u64 = if part_bits == 32 { 0xffff_ffff } else { 0xffff };
        let words = &data[..n];

        let mut result = 0u64;
        if self.flags.contains(ListFilterFlags::REVERSE_COMBINE) {
            for (i, &w) in words.iter().rev().enumerate() {
                result |= (w as u64 & part_mask) << (i as u32 * part_bits);
            }
        } else {
            for (i, &w) in words.iter().enumerate() {
                result |= (w as u64 & part_mask) << (i as u32 * part_bits);
            }
        }
        result
    }

    #[inline]
    fn feed(&mut self, combined: u64) -> bool {
        let filter = &mut self.extraction_filter;
        filter.clear_completion();
        filter.process_data(combined as u32, 0);
        filter.process_data((combined >> 32) as u32, 1)
    }

    /// Run the embedded filter on `combined` and extract one field.
    /// Returns the field and whether the filter matched.
    pub fn extract_from_combined(&mut self, combined: u64, cache_type: CacheType) -> (u64, bool) {
        if self.feed(combined) {
            (self.extraction_filter.extract(cache_type), true)
        } else {
            (0, false)
        }
    }

    /// Combine and extract in one step.
    pub fn combine_and_extract(&mut self, data: &[u32], cache_type: CacheType) -> (u64, bool) {
        let combined = self.combine(data);
        self.extract_from_combined(combined, cache_type)
    }

    /// Extract both address and value from `combined`.
    #[inline]
    pub fn extract_address_and_value_from_combined(&mut self, combined: u64) -> ListFilterResult {
        if self.feed(combined) {
            ListFilterResult {
                address: self.extraction_filter.extract(CacheType::A),
                value: self.extraction_filter.extract(CacheType::D),
                matched: true,
            }
        } else {
            ListFilterResult::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_FILTERS: &[&str] = &[];

    #[test]
    fn test_combine_16_forward() {
        let lf = ListFilter::new(ListFilterFlags::empty(), 4, NO_FILTERS).unwrap();
        let data = [0x0101, 0x2020, 0x0303, 0x4040];
        assert_eq!(lf.combine(&data), 0x4040_0303_2020_0101);
    }

    #[test]
    fn test_combine_16_reversed() {
        let lf = ListFilter::new(ListFilterFlags::REVERSE_COMBINE, 4, NO_FILTERS).unwrap();
        let data = [0x0101, 0x2020, 0x0303, 0x4040];
        assert_eq!(lf.combine(&data), 0x0101_2020_0303_4040);
    }

    #[test]
    fn test_combine_32() {
        let data = [0x0101_2020, 0x0303_4040];
        let lf = ListFilter::new(ListFilterFlags::WORD_SIZE_32, 2, NO_FILTERS).unwrap();
        assert_eq!(lf.combine(&data), 0x0303_4040_0101_2020);

        let lf = ListFilter::new(
            ListFilterFlags::WORD_SIZE_32 | ListFilterFlags::REVERSE_COMBINE,
            2,
            NO_FILTERS,
        )
        .unwrap();
        assert_eq!(lf.combine(&data), 0x0101_2020_0303_4040);
    }

    #[test]
    fn test_combine_ignores_high_halves_of_16_bit_parts() {
        let lf = ListFilter::new(ListFilterFlags::empty(), 2, NO_FILTERS).unwrap();
        assert_eq!(lf.combine(&[0x4321_affe, 0x8765_1001]), 0x1001_affe);
    }

    #[test]
    fn test_combine_and_extract_two_filters() {
        let mut lf = ListFilter::new(
            ListFilterFlags::empty(),
            4,
            &["DDDD DDDD DDDD DDDD DDDD DDDD", "AAAA AAAA AAAA AAAA AAAA AAAA"],
        )
        .unwrap();
        let data = [0x0101, 0x2020, 0x0303, 0x4040];
        assert_eq!(lf.combine_and_extract(&data, CacheType::A), (0x20_0101, true));
        assert_eq!(lf.combine_and_extract(&data, CacheType::D), (0x40_0303, true));
    }

    #[test]
    fn test_address_and_value() {
        let mut lf = ListFilter::new(
            ListFilterFlags::empty(),
            2,
            &["DDDD DDDD DDDD DDDD XXXX XXXX AAAA AAAA"],
        )
        .unwrap();
        let combined = lf.combine(&[0x0001, 0x1111]);
        assert_eq!(combined, 0x1111_0001);
        let r = lf.extract_address_and_value_from_combined(combined);
        assert!(r.matched);
        assert_eq!(r.address, 0x01);
        assert_eq!(r.value, 0x1111);
        assert_eq!(lf.extract_bits(CacheType::A), 8);
        assert_eq!(lf.combined_bit_count(), 32);
    }

    #[test]
    fn test_no_match() {
        let mut lf = ListFilter::new(ListFilterFlags::empty(), 1, &["1111 DDDD"]).unwrap();
        let r = lf.extract_address_and_value_from_combined(0x0012);
        assert!(!r.matched);
        assert_eq!(lf.extract_from_combined(0x00f2, CacheType::D), (0x2, true));
    }

    #[test]
    fn test_validate() {
        assert!(ListFilter::new(ListFilterFlags::empty(), 5, NO_FILTERS).is_err());
        assert!(ListFilter::new(ListFilterFlags::WORD_SIZE_32, 3, NO_FILTERS).is_err());
        assert!(ListFilter::new(ListFilterFlags::empty(), 0, NO_FILTERS).is_err());
        assert!(ListFilter::new(ListFilterFlags::empty(), 1, &["D", "D", "D"]).is_err());
    }
}
