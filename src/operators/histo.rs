//! Histogram storage, fill strategies and histogram sinks
//!
//! Bin storage lives in the arena. Counters (entries, underflow, overflow)
//! are plain fields of the histogram descriptor.
//!
//! Two fill strategies produce identical histograms:
//!
//! - [`HistoFillStrategy::Direct`]: bins are incremented while the sink is
//!   stepped.
//! - [`HistoFillStrategy::Batched`]: sinks queue the target bin into a
//!   buffer sized at build time, flushed once at the end of the event.

use super::{Operator, OperatorKind};
use crate::error::{A2Error, Result};
use crate::memory::Arena;
use crate::param::{fill, is_param_valid, ParamVec, PipeVectors};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};

/// Axis binning: `[min, min + range)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Binning {
    pub min: f64,
    pub range: f64,
}

impl Binning {
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min,
            range: max - min,
        }
    }

    pub fn max(&self) -> f64 {
        self.min + self.range
    }
}

/// Result of mapping a coordinate onto an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bin {
    Underflow,
    Overflow,
    Index(usize),
}

/// `floor((x - min) * bin_count / range)` with under/overflow detection.
pub fn get_bin(binning: Binning, bin_count: usize, x: f64) -> Bin {
    if x < binning.min {
        return Bin::Underflow;
    }
    if x >= binning.max() {
        return Bin::Overflow;
    }
    let bin = ((x - binning.min) * bin_count as f64 / binning.range) as usize;
    // rounding right below max can land on bin_count
    Bin::Index(bin.min(bin_count.saturating_sub(1)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoFillStrategy {
    #[default]
    Direct,
    Batched,
}

/// Applies bin increments according to the chosen strategy.
#[derive(Debug)]
pub struct HistoFiller {
    strategy: HistoFillStrategy,
    queue: Vec<ParamVec>,
}

impl HistoFiller {
    pub fn new(strategy: HistoFillStrategy, capacity: usize) -> Self {
        let capacity = match strategy {
            HistoFillStrategy::Direct => 0,
            HistoFillStrategy::Batched => capacity,
        };
        Self {
            strategy,
            queue: Vec::with_capacity(capacity),
        }
    }

    pub fn strategy(&self) -> HistoFillStrategy {
        self.strategy
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Grow the batch buffer. Only called while building.
    pub(crate) fn reserve(&mut self, additional: usize) {
        if self.strategy == HistoFillStrategy::Batched {
            self.queue.reserve_exact(additional);
        }
    }

    #[inline]
    fn increment(&mut self, arena: &Arena, data: ParamVec, bin: usize) {
        let Some(cell) = data.element(bin) else {
            return;
        };
        // a full queue falls back to a direct fill to stay allocation free
        if self.strategy == HistoFillStrategy::Batched && self.queue.len() < self.queue.capacity()
        {
            self.queue.push(cell);
        } else {
            let c = &arena.get(cell)[0];
            c.set(c.get() + 1.0);
        }
    }

    /// Apply all queued increments.
    pub fn flush(&mut self, arena: &Arena) {
        for cell in self.queue.drain(..) {
            let c = &arena.get(cell)[0];
            c.set(c.get() + 1.0);
        }
    }
}

/// One-dimensional histogram.
#[derive(Debug, Clone)]
pub struct H1D {
    pub data: ParamVec,
    pub binning: Binning,
    pub binning_factor: f64,
    pub entry_count: f64,
    pub underflow: f64,
    pub overflow: f64,
}

impl H1D {
    pub fn new(arena: &mut Arena, bins: usize, binning: Binning) -> Result<Self> {
        if bins == 0 || !(binning.range > 0.0) {
            return Err(A2Error::Build(format!(
                "invalid histogram: {} bins over range {}",
                bins, binning.range
            )));
        }
        Ok(Self {
            data: arena.push_param_vector(bins)?,
            binning,
            binning_factor: bins as f64 / binning.range,
            entry_count: 0.0,
            underflow: 0.0,
            overflow: 0.0,
        })
    }

    pub fn bin_count(&self) -> usize {
        self.data.len()
    }

    pub fn get_bin(&self, x: f64) -> Bin {
        get_bin(self.binning, self.bin_count(), x)
    }

    /// Content of the bin `x` falls into, 0 outside the histogram.
    pub fn get_value(&self, arena: &Arena, x: f64) -> f64 {
        match self.get_bin(x) {
            Bin::Index(bin) => arena.value(self.data, bin),
            _ => 0.0,
        }
    }

    pub fn max_value(&self, arena: &Arena) -> f64 {
        arena.get(self.data).iter().map(|c| c.get()).fold(0.0, f64::max)
    }

    /// Lowest bin holding the maximum value.
    pub fn max_bin(&self, arena: &Arena) -> usize {
        let mut best = (0, 0.0);
        for (i, c) in arena.get(self.data).iter().enumerate() {
            if c.get() > best.1 {
                best = (i, c.get());
            }
        }
        best.0
    }

    pub fn clear(&mut self, arena: &Arena) {
        fill(arena.get(self.data), 0.0);
        self.entry_count = 0.0;
        self.underflow = 0.0;
        self.overflow = 0.0;
    }

    /// NaN values are dropped without touching any counter.
    #[inline]
    pub fn fill(&mut self, arena: &Arena, x: f64, filler: &mut HistoFiller) {
        if x.is_nan() {
            return;
        }

        if x < self.binning.min {
            self.underflow += 1.0;
        } else if x >= self.binning.max() {
            self.overflow += 1.0;
        } else {
            let bin = ((x - self.binning.min) * self.binning_factor) as usize;
            filler.increment(arena, self.data, bin.min(self.bin_count() - 1));
            self.entry_count += 1.0;
        }
    }
}

/// Two-dimensional histogram, stored row by row (`y * x_bins + x`).
#[derive(Debug, Clone)]
pub struct H2D {
    pub data: ParamVec,
    pub x_binning: Binning,
    pub y_binning: Binning,
    pub x_bins: usize,
    pub y_bins: usize,
    pub entry_count: f64,
    pub underflow: f64,
    pub overflow: f64,
}

impl H2D {
    pub fn new(
        arena: &mut Arena,
        x_bins: usize,
        y_bins: usize,
        x_binning: Binning,
        y_binning: Binning,
    ) -> Result<Self> {
        if x_bins == 0 || y_bins == 0 || !(x_binning.range > 0.0) || !(y_binning.range > 0.0) {
            return Err(A2Error::Build("invalid 2D histogram binning".into()));
        }
        Ok(Self {
            data: arena.push_param_vector(x_bins * y_bins)?,
            x_binning,
            y_binning,
            x_bins,
            y_bins,
            entry_count: 0.0,
            underflow: 0.0,
            overflow: 0.0,
        })
    }

    pub fn get_value(&self, arena: &Arena, x: f64, y: f64) -> f64 {
        match (
            get_bin(self.x_binning, self.x_bins, x),
            get_bin(self.y_binning, self.y_bins, y),
        ) {
            (Bin::Index(xb), Bin::Index(yb)) => arena.value(self.data, yb * self.x_bins + xb),
            _ => 0.0,
        }
    }

    pub fn clear(&mut self, arena: &Arena) {
        fill(arena.get(self.data), 0.0);
        self.entry_count = 0.0;
        self.underflow = 0.0;
        self.overflow = 0.0;
    }

    #[inline]
    pub fn fill(&mut self, arena: &Arena, x: f64, y: f64, filler: &mut HistoFiller) {
        if x.is_nan() || y.is_nan() {
            return;
        }

        let xb = get_bin(self.x_binning, self.x_bins, x);
        let yb = get_bin(self.y_binning, self.y_bins, y);

        match (xb, yb) {
            (Bin::Index(xb), Bin::Index(yb)) => {
                filler.increment(arena, self.data, yb * self.x_bins + xb);
                self.entry_count += 1.0;
            }
            (Bin::Underflow, _) | (_, Bin::Underflow) => self.underflow += 1.0,
            _ => self.overflow += 1.0,
        }
    }
}

/// One H1D per input element.
#[derive(Debug)]
pub struct H1DSink {
    histos: Vec<H1D>,
}

impl H1DSink {
    pub fn histos(&self) -> &[H1D] {
        &self.histos
    }

    pub(crate) fn begin_run(&mut self, arena: &Arena) {
        for h in &mut self.histos {
            h.clear(arena);
        }
    }

    pub(crate) fn step(&mut self, arena: &Arena, input: &PipeVectors, filler: &mut HistoFiller) {
        for (h, cell) in self.histos.iter_mut().zip(arena.get(input.data)) {
            let v = cell.get();
            if is_param_valid(v) {
                h.fill(arena, v, filler);
            }
        }
    }
}

/// A single H2D fed by two scalar inputs.
#[derive(Debug)]
pub struct H2DSink {
    histo: H2D,
}

impl H2DSink {
    pub fn histo(&self) -> &H2D {
        &self.histo
    }

    pub(crate) fn begin_run(&mut self, arena: &Arena) {
        self.histo.clear(arena);
    }

    pub(crate) fn step(&mut self, arena: &Arena, inputs: &[PipeVectors], filler: &mut HistoFiller) {
        let x = arena.value(inputs[0].data, 0);
        let y = arena.value(inputs[1].data, 0);
        if is_param_valid(x) && is_param_valid(y) {
            self.histo.fill(arena, x, y, filler);
        }
    }
}

impl Operator {
    /// One histogram of `bins` bins per input element. Without an explicit
    /// binning each histogram spans its element's declared limits.
    pub fn h1d_sink(
        arena: &mut Arena,
        input: PipeVectors,
        bins: usize,
        binning: Option<Binning>,
    ) -> Result<Operator> {
        let mut histos = Vec::with_capacity(input.len());
        for i in 0..input.len() {
            let b = binning.unwrap_or_else(|| {
                Binning::new(
                    arena.value(input.lower_limits, i),
                    arena.value(input.upper_limits, i),
                )
            });
            histos.push(H1D::new(arena, bins, b)?);
        }

        Ok(Operator::new(
            OperatorKind::H1DSink(H1DSink { histos }),
            vec![input],
            Vec::new(),
        ))
    }

    pub fn h2d_sink(
        arena: &mut Arena,
        x_input: PipeVectors,
        y_input: PipeVectors,
        bins: (usize, usize),
        x_binning: Option<Binning>,
        y_binning: Option<Binning>,
    ) -> Result<Operator> {
        if x_input.len() != 1 || y_input.len() != 1 {
            return Err(A2Error::Build("h2d sink inputs must be single parameters".into()));
        }
        let limits = |pipe: &PipeVectors| {
            Binning::new(
                arena.value(pipe.lower_limits, 0),
                arena.value(pipe.upper_limits, 0),
            )
        };
        let xb = x_binning.unwrap_or_else(|| limits(&x_input));
        let yb = y_binning.unwrap_or_else(|| limits(&y_input));
        let histo = H2D::new(arena, bins.0, bins.1, xb, yb)?;

        Ok(Operator::new(
            OperatorKind::H2DSink(H2DSink { histo }),
            vec![x_input, y_input],
            Vec::new(),
        ))
    }

    /// Upper bound of bin increments this operator can queue per event.
    pub fn max_fills_per_event(&self) -> usize {
        match &self.kind {
            OperatorKind::H1DSink(s) => s.histos.len(),
            OperatorKind::H2DSink(_) => 1,
            _ => 0,
        }
    }
}

/// Write one histogram, little-endian: `s32` bin count, `f64` min, range,
/// underflow, overflow, then the bin contents.
pub fn write_histo<W: Write>(out: &mut W, arena: &Arena, histo: &H1D) -> io::Result<()> {
    let size = i32::try_from(histo.bin_count())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "histogram too large"))?;
    out.write_all(&size.to_le_bytes())?;
    out.write_all(&histo.binning.min.to_le_bytes())?;
    out.write_all(&histo.binning.range.to_le_bytes())?;
    out.write_all(&histo.underflow.to_le_bytes())?;
    out.write_all(&histo.overflow.to_le_bytes())?;
    for c in arena.get(histo.data) {
        out.write_all(&c.get().to_le_bytes())?;
    }
    Ok(())
}

/// Write an `s32` histogram count followed by each histogram.
pub fn write_histo_list<'a, W, I>(out: &mut W, arena: &Arena, histos: I) -> io::Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a H1D>,
    I::IntoIter: ExactSizeIterator,
{
    let histos = histos.into_iter();
    let count = i32::try_from(histos.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many histograms"))?;
    out.write_all(&count.to_le_bytes())?;
    for h in histos {
        write_histo(out, arena, h)?;
    }
    Ok(())
}
