//! ExportSink: per-event export of input pipes to a file.
//!
//! Formats:
//!
//! - **Full**: every input's values as raw little-endian `f64`, invalid
//!   sentinels included. Sizes are implicit.
//! - **Sparse**: per input a `u16` valid count, that many `u16` indices, then
//!   that many `f64` values. Invalid elements are omitted.
//! - **Csv**: comma separated values of all inputs, one line per event.
//!   Invalid elements are empty fields.
//!
//! With a nonzero compression level the byte stream is written through a
//! zlib encoder: `-1` selects the default level, `1` to `9` the usual
//! speed/size tradeoff. Level `0` writes the file directly.
//!
//! The file is opened in `begin_run` and flushed and closed in `end_run`. An
//! I/O error is recorded in [`ExportSink::last_error`] and turns the sink
//! inert until the next run.

use super::{Operator, OperatorKind};
use crate::error::{A2Error, Result};
use crate::memory::Arena;
use crate::param::{is_param_valid, PipeVectors};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Full,
    Sparse,
    Csv,
}

/// Compression level meaning "write uncompressed".
pub const NO_COMPRESSION: i32 = 0;

enum ExportWriter {
    Plain(BufWriter<File>),
    Zlib(ZlibEncoder<BufWriter<File>>),
}

impl ExportWriter {
    fn open(path: &Path, compression_level: i32) -> io::Result<Self> {
        let out = BufWriter::new(File::create(path)?);
        Ok(match compression_level {
            NO_COMPRESSION => ExportWriter::Plain(out),
            -1 => ExportWriter::Zlib(ZlibEncoder::new(out, Compression::default())),
            level => ExportWriter::Zlib(ZlibEncoder::new(out, Compression::new(level as u32))),
        })
    }

    /// Write any pending compressed data and flush the file.
    fn finish(self) -> io::Result<()> {
        let mut out = match self {
            ExportWriter::Plain(out) => out,
            ExportWriter::Zlib(z) => z.finish()?,
        };
        out.flush()
    }
}

impl std::fmt::Debug for ExportWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportWriter::Plain(_) => f.write_str("Plain"),
            ExportWriter::Zlib(_) => f.write_str("Zlib"),
        }
    }
}

impl Write for ExportWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ExportWriter::Plain(w) => w.write(buf),
            ExportWriter::Zlib(w) => w.write(buf),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            ExportWriter::Plain(w) => w.write_all(buf),
            ExportWriter::Zlib(w) => w.write_all(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ExportWriter::Plain(w) => w.flush(),
            ExportWriter::Zlib(w) => w.flush(),
        }
    }
}

#[derive(Debug)]
pub struct ExportSink {
    path: PathBuf,
    format: ExportFormat,
    compression_level: i32,
    /// The last input is a condition gate rather than data.
    has_condition: bool,
    writer: Option<ExportWriter>,
    last_error: Option<String>,
    events_written: u64,
    timeticks: u64,
}

impl ExportSink {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ExportFormat {
        self.format
    }

    pub fn compression_level(&self) -> i32 {
        self.compression_level
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn events_written(&self) -> u64 {
        self.events_written
    }

    pub fn timeticks(&self) -> u64 {
        self.timeticks
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    fn fail(&mut self, context: &str, err: io::Error) {
        let msg = format!("{} {}: {}", context, self.path.display(), err);
        tracing::warn!("ExportSink disabled: {}", msg);
        self.last_error = Some(msg);
        self.writer = None;
    }

    pub(crate) fn begin_run(&mut self) {
        self.events_written = 0;
        self.timeticks = 0;
        self.last_error = None;

        match ExportWriter::open(&self.path, self.compression_level) {
            Ok(w) => {
                self.writer = Some(w);
                tracing::debug!("ExportSink opened {}", self.path.display());
            }
            Err(e) => self.fail("failed to create", e),
        }
    }

    pub(crate) fn end_run(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finish() {
                self.fail("failed to flush", e);
                return;
            }
            tracing::info!(
                "ExportSink closed {} after {} events",
                self.path.display(),
                self.events_written
            );
        }
    }

    pub(crate) fn timetick(&mut self) {
        self.timeticks += 1;
    }

    pub(crate) fn step(&mut self, arena: &Arena, inputs: &[PipeVectors]) {
        let data_inputs = if self.has_condition {
            let Some((cond, data)) = inputs.split_last() else {
                return;
            };
            if !is_param_valid(arena.value(cond.data, 0)) {
                return;
            }
            data
        } else {
            inputs
        };

        let Some(writer) = self.writer.as_mut() else {
            return;
        };

        let result = match self.format {
            ExportFormat::Full => write_full(writer, arena, data_inputs),
            ExportFormat::Sparse => write_sparse(writer, arena, data_inputs),
            ExportFormat::Csv => write_csv(writer, arena, data_inputs),
        };

        match result {
            Ok(()) => self.events_written += 1,
            Err(e) => self.fail("failed to write", e),
        }
    }
}

fn write_full<W: Write>(out: &mut W, arena: &Arena, inputs: &[PipeVectors]) -> io::Result<()> {
    for input in inputs {
        for c in arena.get(input.data) {
            out.write_all(&c.get().to_le_bytes())?;
        }
    }
    Ok(())
}

fn write_sparse<W: Write>(out: &mut W, arena: &Arena, inputs: &[PipeVectors]) -> io::Result<()> {
    for input in inputs {
        let data = arena.get(input.data);
        let valid = || {
            data.iter()
                .enumerate()
                .filter(|(_, c)| is_param_valid(c.get()))
        };

        let count = valid().count() as u16;
        out.write_all(&count.to_le_bytes())?;
        for (i, _) in valid() {
            out.write_all(&(i as u16).to_le_bytes())?;
        }
        for (_, c) in valid() {
            out.write_all(&c.get().to_le_bytes())?;
        }
    }
    Ok(())
}

fn write_csv<W: Write>(out: &mut W, arena: &Arena, inputs: &[PipeVectors]) -> io::Result<()> {
    let mut first = true;
    for input in inputs {
        for c in arena.get(input.data) {
            if !first {
                out.write_all(b",")?;
            }
            first = false;
            let v = c.get();
            if is_param_valid(v) {
                write!(out, "{}", v)?;
            }
        }
    }
    out.write_all(b"\n")
}

impl Operator {
    /// Export `inputs` to `path`. With a `condition`, events where its first
    /// element is invalid are skipped. `compression_level` is `0` for plain
    /// output, `-1` or `1..=9` for a zlib stream.
    pub fn export_sink(
        _arena: &mut Arena,
        inputs: Vec<PipeVectors>,
        condition: Option<PipeVectors>,
        path: impl Into<PathBuf>,
        format: ExportFormat,
        compression_level: i32,
    ) -> Result<Operator> {
        if inputs.is_empty() {
            return Err(A2Error::Build("export sink needs at least one input".into()));
        }
        if !(-1..=9).contains(&compression_level) {
            return Err(A2Error::Build(format!(
                "export compression level {} out of range (-1..=9)",
                compression_level
            )));
        }
        if format == ExportFormat::Sparse && inputs.iter().any(|p| p.len() > u16::MAX as usize) {
            return Err(A2Error::Build(
                "sparse export inputs must have at most 65535 elements".into(),
            ));
        }
        if condition.is_some_and(|c| c.is_empty()) {
            return Err(A2Error::Build("export sink condition input is empty".into()));
        }

        let has_condition = condition.is_some();
        let mut all_inputs = inputs;
        all_inputs.extend(condition);

        Ok(Operator::new(
            OperatorKind::ExportSink(Box::new(ExportSink {
                path: path.into(),
                format,
                compression_level,
                has_condition,
                writer: None,
                last_error: None,
                events_written: 0,
                timeticks: 0,
            })),
            all_inputs,
            Vec::new(),
        ))
    }
}
