//! Test data builders for sources and small graphs

use a2_engine::data_filter::MultiWordFilter;
use a2_engine::{Arena, DataSource, DataSourceOptions};

/// Builder for single-filter extractor sources
pub struct ExtractorBuilder {
    patterns: Vec<String>,
    module: u8,
    seed: u64,
    options: DataSourceOptions,
    required_completions: u32,
}

impl ExtractorBuilder {
    pub fn new(pattern: &str) -> Self {
        Self {
            patterns: vec![pattern.to_string()],
            module: 0,
            seed: 42,
            options: DataSourceOptions::empty(),
            required_completions: 1,
        }
    }

    pub fn pattern(mut self, pattern: &str) -> Self {
        self.patterns.push(pattern.to_string());
        self
    }

    pub fn module(mut self, module: u8) -> Self {
        self.module = module;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn no_random(mut self) -> Self {
        self.options |= DataSourceOptions::NO_ADDED_RANDOM;
        self
    }

    pub fn required_completions(mut self, n: u32) -> Self {
        self.required_completions = n;
        self
    }

    pub fn build(self, arena: &mut Arena) -> DataSource {
        let filter = MultiWordFilter::parse(&self.patterns[..]).unwrap();
        DataSource::extractor(
            arena,
            filter,
            self.required_completions,
            self.seed,
            self.module,
            self.options,
        )
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extractor_builder() {
        let mut arena = Arena::new(1 << 16);
        let src = ExtractorBuilder::new("AAAA DDDD").module(3).no_random().build(&mut arena);
        assert_eq!(src.module_index, 3);
        assert_eq!(src.address_count(), 16);
    }
}
