//! Data sources: raw module words to parameter vectors
//!
//! A data source is attached to one module of one event. Every matching word
//! (or word group) yields an address and a data value. The value, plus a
//! uniform dither in `[0, 1)`, is written to `output[address]` if that slot
//! is still invalid in the current event, so the first hit of an address
//! wins.
//!
//! ## Kinds
//!
//! - **Extractor**: a [`MultiWordFilter`] fed word by word. Every
//!   `required_completions`-th completion yields one address/value pair.
//! - **ListFilterExtractor**: a [`ListFilter`] applied `repetitions` times,
//!   each repetition consuming `word_count` words. The repetition number adds
//!   address bits above (default) or below the filter's own address bits.
//! - **MultiHitExtractor**: a single-word [`DataFilter`] keeping several hits
//!   per address, either one array per hit ordinal or one array per address.

use crate::data_filter::{CacheEntry, CacheType, DataFilter, ListFilter, MultiWordFilter};
use crate::error::{A2Error, Result};
use crate::memory::Arena;
use crate::param::{fill, invalidate_all, is_param_valid, ParamVec, PipeVectors};
use bitflags::bitflags;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DataSourceOptions: u8 {
        /// Do not add a random value in [0.0, 1.0) to extracted data values.
        const NO_ADDED_RANDOM = 1 << 1;
        /// The list filter repetition number forms the low address bits
        /// instead of the high ones.
        const REPETITION_CONTRIBUTES_LOW_ADDRESS_BITS = 1 << 2;
    }
}

/// Address bits above this are rejected before allocating outputs.
pub const MAX_ADDRESS_BITS: u32 = 24;

/// Storage layout of a [`MultiHitExtractor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiHitShape {
    /// `max_hits` outputs of `address_count` elements each.
    ArrayPerHit,
    /// `address_count` outputs of `max_hits` elements each.
    ArrayPerAddress,
}

#[derive(Debug)]
pub struct Extractor {
    filter: MultiWordFilter,
    rng: SmallRng,
    required_completions: u32,
    current_completions: u32,
    options: DataSourceOptions,
}

#[derive(Debug)]
pub struct ListFilterExtractor {
    list_filter: ListFilter,
    rng: SmallRng,
    repetitions: u8,
    options: DataSourceOptions,
}

#[derive(Debug)]
pub struct MultiHitExtractor {
    filter: DataFilter,
    cache_a: CacheEntry,
    cache_d: CacheEntry,
    shape: MultiHitShape,
    max_hits: u16,
    rng: SmallRng,
    options: DataSourceOptions,
}

#[derive(Debug)]
pub enum DataSourceKind {
    Extractor(Extractor),
    ListFilterExtractor(ListFilterExtractor),
    MultiHitExtractor(MultiHitExtractor),
}

/// One data source with its output pipes and per-address hit counters.
#[derive(Debug)]
pub struct DataSource {
    pub outputs: Vec<PipeVectors>,
    /// Hits per address, accumulated over the run.
    pub hit_counts: ParamVec,
    pub module_index: u8,
    pub kind: DataSourceKind,
}

#[inline]
fn dither(rng: &mut SmallRng, options: DataSourceOptions) -> f64 {
    if options.contains(DataSourceOptions::NO_ADDED_RANDOM) {
        0.0
    } else {
        rng.gen::<f64>()
    }
}

fn address_count_for_bits(bits: u32) -> Result<usize> {
    if bits > MAX_ADDRESS_BITS {
        return Err(A2Error::Build(format!(
            "{} address bits exceed the maximum of {}",
            bits, MAX_ADDRESS_BITS
        )));
    }
    Ok(1usize << bits)
}

fn data_upper_limit(bits: u16) -> f64 {
    2.0f64.powi(bits as i32)
}

/// Number of address bits needed to encode `repetitions` distinct values.
fn repetition_bits(repetitions: u8) -> u32 {
    match repetitions {
        0 | 1 => 0,
        n => u32::BITS - (n as u32 - 1).leading_zeros(),
    }
}

impl Extractor {
    pub fn filter(&self) -> &MultiWordFilter {
        &self.filter
    }

    pub fn required_completions(&self) -> u32 {
        self.required_completions
    }

    pub fn address_count(&self) -> usize {
        1usize << self.filter.extract_bits(CacheType::A)
    }
}

impl ListFilterExtractor {
    pub fn list_filter(&self) -> &ListFilter {
        &self.list_filter
    }

    pub fn repetitions(&self) -> u8 {
        self.repetitions
    }

    pub fn base_address_bits(&self) -> u32 {
        self.list_filter.extract_bits(CacheType::A) as u32
    }

    pub fn repetition_address_bits(&self) -> u32 {
        repetition_bits(self.repetitions)
    }

    pub fn address_bits(&self) -> u32 {
        self.base_address_bits() + self.repetition_address_bits()
    }

    pub fn address_count(&self) -> usize {
        1usize << self.address_bits()
    }

    #[inline]
    fn compose_address(&self, filter_address: u64, repetition: u64) -> usize {
        let address = if self
            .options
            .contains(DataSourceOptions::REPETITION_CONTRIBUTES_LOW_ADDRESS_BITS)
        {
            (filter_address << self.repetition_address_bits()) | repetition
        } else {
            filter_address | (repetition << self.base_address_bits())
        };
        address as usize
    }
}

impl MultiHitExtractor {
    pub fn shape(&self) -> MultiHitShape {
        self.shape
    }

    pub fn max_hits(&self) -> u16 {
        self.max_hits
    }

    pub fn address_count(&self) -> usize {
        1usize << self.cache_a.extract_bits
    }

    pub fn filter(&self) -> &DataFilter {
        &self.filter
    }
}

impl DataSource {
    /// Create an extractor source with one output sized by the filter's
    /// address bits.
    pub fn extractor(
        arena: &mut Arena,
        filter: MultiWordFilter,
        required_completions: u32,
        rng_seed: u64,
        module_index: u8,
        options: DataSourceOptions,
    ) -> Result<Self> {
        if filter.filter_count() == 0 {
            return Err(A2Error::Build("extractor filter has no subfilters".into()));
        }

        let addr_count = address_count_for_bits(filter.extract_bits(CacheType::A) as u32)?;
        let upper = data_upper_limit(filter.extract_bits(CacheType::D));
        let output = PipeVectors::push(arena, addr_count, 0.0, upper)?;
        let hit_counts = arena.push_param_vector(addr_count)?;

        Ok(Self {
            outputs: vec![output],
            hit_counts,
            module_index,
            kind: DataSourceKind::Extractor(Extractor {
                filter,
                rng: SmallRng::seed_from_u64(rng_seed),
                required_completions: required_completions.max(1),
                current_completions: 0,
                options,
            }),
        })
    }

    /// Create a list filter extractor. Outputs are sized by the filter's
    /// address bits plus the bits needed to number the repetitions.
    pub fn listfilter_extractor(
        arena: &mut Arena,
        list_filter: ListFilter,
        repetitions: u8,
        rng_seed: u64,
        module_index: u8,
        options: DataSourceOptions,
    ) -> Result<Self> {
        list_filter.validate()?;
        let ex = ListFilterExtractor {
            list_filter,
            rng: SmallRng::seed_from_u64(rng_seed),
            repetitions: repetitions.max(1),
            options,
        };

        let addr_count = address_count_for_bits(ex.address_bits())?;
        let upper = data_upper_limit(ex.list_filter.extract_bits(CacheType::D));
        let output = PipeVectors::push(arena, addr_count, 0.0, upper)?;
        let hit_counts = arena.push_param_vector(addr_count)?;

        Ok(Self {
            outputs: vec![output],
            hit_counts,
            module_index,
            kind: DataSourceKind::ListFilterExtractor(ex),
        })
    }

    /// Create a multi-hit extractor on a single-word filter.
    pub fn multihit_extractor(
        arena: &mut Arena,
        filter: DataFilter,
        shape: MultiHitShape,
        max_hits: u16,
        rng_seed: u64,
        module_index: u8,
        options: DataSourceOptions,
    ) -> Result<Self> {
        if max_hits == 0 {
            return Err(A2Error::Build("multi hit extractor needs max_hits > 0".into()));
        }

        let cache_a = filter.cache_entry('a');
        let cache_d = filter.cache_entry('d');
        let addr_count = address_count_for_bits(cache_a.extract_bits as u32)?;
        let upper = data_upper_limit(cache_d.extract_bits as u16);

        let (count, size) = match shape {
            MultiHitShape::ArrayPerHit => (max_hits as usize, addr_count),
            MultiHitShape::ArrayPerAddress => (addr_count, max_hits as usize),
        };
        let outputs = (0..count)
            .map(|_| PipeVectors::push(arena, size, 0.0, upper))
            .collect::<Result<Vec<_>>>()?;
        let hit_counts = arena.push_param_vector(addr_count)?;

        Ok(Self {
            outputs,
            hit_counts,
            module_index,
            kind: DataSourceKind::MultiHitExtractor(MultiHitExtractor {
                filter,
                cache_a,
                cache_d,
                shape,
                max_hits,
                rng: SmallRng::seed_from_u64(rng_seed),
                options,
            }),
        })
    }

    pub fn address_count(&self) -> usize {
        match &self.kind {
            DataSourceKind::Extractor(ex) => ex.address_count(),
            DataSourceKind::ListFilterExtractor(ex) => ex.address_count(),
            DataSourceKind::MultiHitExtractor(ex) => ex.address_count(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            DataSourceKind::Extractor(_) => "extractor",
            DataSourceKind::ListFilterExtractor(_) => "listfilter_extractor",
            DataSourceKind::MultiHitExtractor(_) => "multihit_extractor",
        }
    }

    /// Clear the run-wide hit counters.
    pub fn begin_run(&mut self, arena: &Arena) {
        fill(arena.get(self.hit_counts), 0.0);
    }

    /// Reset per-event state and invalidate all outputs.
    pub fn begin_event(&mut self, arena: &Arena) {
        if let DataSourceKind::Extractor(ex) = &mut self.kind {
            ex.filter.clear_completion();
            ex.current_completions = 0;
        }
        for out in &self.outputs {
            invalidate_all(arena.get(out.data));
        }
    }

    /// Feed one module's words to the source. Returns the number of words
    /// consumed.
    pub fn process_module_data(&mut self, arena: &Arena, data: &[u32]) -> usize {
        let hit_counts = arena.get(self.hit_counts);

        match &mut self.kind {
            DataSourceKind::Extractor(ex) => {
                let output = arena.get(self.outputs[0].data);

                for (word_index, &word) in data.iter().enumerate() {
                    if ex.filter.process_data(word, word_index as i32) {
                        ex.current_completions += 1;

                        if ex.current_completions >= ex.required_completions {
                            ex.current_completions = 0;
                            let address = ex.filter.extract(CacheType::A) as usize;
                            let value = ex.filter.extract(CacheType::D) as f64;
                            debug_assert!(address < output.len());

                            if !is_param_valid(output[address].get()) {
                                output[address].set(value + dither(&mut ex.rng, ex.options));
                                hit_counts[address].set(hit_counts[address].get() + 1.0);
                            }
                        }
                        ex.filter.clear_completion();
                    }
                }
                data.len()
            }

            DataSourceKind::ListFilterExtractor(ex) => {
                let output = arena.get(self.outputs[0].data);
                let word_count = ex.list_filter.word_count();
                let mut consumed = 0;

                for rep in 0..ex.repetitions as u64 {
                    let Some(words) = data.get(consumed..consumed + word_count) else {
                        break;
                    };
                    consumed += word_count;

                    let combined = ex.list_filter.combine(words);
                    let result = ex
                        .list_filter
                        .extract_address_and_value_from_combined(combined);

                    if result.matched {
                        let address = ex.compose_address(result.address, rep);
                        debug_assert!(address < output.len());

                        if !is_param_valid(output[address].get()) {
                            output[address]
                                .set(result.value as f64 + dither(&mut ex.rng, ex.options));
                            hit_counts[address].set(hit_counts[address].get() + 1.0);
                        }
                    }
                }
                consumed
            }

            DataSourceKind::MultiHitExtractor(ex) => {
                for (word_index, &word) in data.iter().enumerate() {
                    if !ex.filter.matches(word, word_index as i32) {
                        continue;
                    }

                    let address = crate::data_filter::filter::extract(&ex.cache_a, word) as usize;
                    let value = crate::data_filter::filter::extract(&ex.cache_d, word) as f64;
                    hit_counts[address].set(hit_counts[address].get() + 1.0);

                    let slot = match ex.shape {
                        MultiHitShape::ArrayPerHit => self
                            .outputs
                            .iter()
                            .map(|out| &arena.get(out.data)[address])
                            .find(|cell| !is_param_valid(cell.get())),
                        MultiHitShape::ArrayPerAddress => arena
                            .get(self.outputs[address].data)
                            .iter()
                            .find(|cell| !is_param_valid(cell.get())),
                    };

                    if let Some(cell) = slot {
                        cell.set(value + dither(&mut ex.rng, ex.options));
                    }
                }
                data.len()
            }
        }
    }
}
