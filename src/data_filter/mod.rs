//! Bit-level pattern matching front end
//!
//! Raw module words are matched and decoded here before any parameter is
//! produced:
//!
//! ```text
//!   raw u32 words
//!        │
//!        ├──► DataFilter        one word, mask/value match + A/D fields
//!        ├──► MultiWordFilter   up to 16 DataFilters, joint completion
//!        └──► ListFilter        2-4 words combined into a u64, then
//!                               a MultiWordFilter on both halves
//! ```

pub mod bits;
pub mod filter;
pub mod listfilter;
pub mod multiword;

pub use filter::{CacheEntry, DataFilter, FILTER_SIZE};
pub use listfilter::{ListFilter, ListFilterFlags, ListFilterResult};
pub use multiword::{CacheType, MultiWordFilter, MAX_FILTERS};
