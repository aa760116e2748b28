//! Handles to sources and operators of a built graph.
//!
//! Both are packed `u32`s: the high 8 bits hold the event index, the low 24
//! bits the insertion index within that event. The insertion index stays
//! stable when operators are reordered by rank.

use std::fmt;

const INDEX_BITS: u32 = 24;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

/// Largest insertion index representable in a handle.
pub const MAX_HANDLE_INDEX: usize = INDEX_MASK as usize;

macro_rules! graph_handle {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub fn new(event: usize, index: usize) -> Self {
                debug_assert!(event <= u8::MAX as usize);
                debug_assert!(index <= MAX_HANDLE_INDEX);
                Self(((event as u32) << INDEX_BITS) | (index as u32 & INDEX_MASK))
            }

            #[inline]
            pub fn event(self) -> usize {
                (self.0 >> INDEX_BITS) as usize
            }

            #[inline]
            pub fn index(self) -> usize {
                (self.0 & INDEX_MASK) as usize
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(
                    f,
                    concat!(stringify!($name), "(event={}, index={})"),
                    self.event(),
                    self.index()
                )
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

graph_handle!(SourceId);
graph_handle!(OperatorId);
