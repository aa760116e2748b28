//! Replay of recorded readout streams
//!
//! A stream is a sequence of little-endian `u32` records:
//!
//! ```text
//!   event_index  module_index  word_count  words[word_count]
//! ```
//!
//! A record with `module_index == END_OF_EVENT` closes the current event.
//! Ticks arriving on the tick channel are turned into [`A2::timetick`] calls
//! between records.

use crate::a2::A2;
use crate::error::{A2Error, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;
use std::io::{self, Read};
use std::thread::JoinHandle;
use std::time::Duration;

/// Module index marking the end of an event.
pub const END_OF_EVENT: u32 = 0xFFFF_FFFF;

/// Counters collected while replaying.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub records: u64,
    pub events: u64,
    pub words: u64,
    pub timeticks: u64,
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<Option<u32>> {
    let mut buf = [0u8; 4];
    match r.read_exact(&mut buf) {
        Ok(()) => Ok(Some(u32::from_le_bytes(buf))),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

fn truncated(what: &str) -> A2Error {
    A2Error::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("truncated record: missing {}", what),
    ))
}

/// Read the next record into `words`. `None` at end of stream.
pub fn read_record<R: Read>(r: &mut R, words: &mut Vec<u32>) -> Result<Option<(u32, u32)>> {
    let Some(event) = read_u32(r)? else {
        return Ok(None);
    };
    let module = read_u32(r)?.ok_or_else(|| truncated("module index"))?;
    let count = read_u32(r)?.ok_or_else(|| truncated("word count"))?;

    words.clear();
    for _ in 0..count {
        words.push(read_u32(r)?.ok_or_else(|| truncated("data word"))?);
    }
    Ok(Some((event, module)))
}

/// Feed a whole stream through `a2`. The run must already be started.
pub fn replay<R: Read>(a2: &mut A2, mut input: R, ticks: &Receiver<()>) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    let mut words = Vec::new();
    let mut open_event: Option<usize> = None;

    while let Some((event, module)) = read_record(&mut input, &mut words)? {
        stats.records += 1;
        while ticks.try_recv().is_ok() {
            a2.timetick();
            stats.timeticks += 1;
        }

        let event = event as usize;
        if open_event.is_some_and(|e| e != event) {
            tracing::warn!("event {} started before event {:?} ended", event, open_event);
            if let Some(prev) = open_event.take() {
                a2.end_event(prev);
                stats.events += 1;
            }
        }

        if open_event.is_none() {
            a2.begin_event(event);
            open_event = Some(event);
        }

        if module == END_OF_EVENT {
            a2.end_event(event);
            open_event = None;
            stats.events += 1;
        } else {
            a2.process_module_data(event, module as usize, &words);
            stats.words += words.len() as u64;
        }
    }

    if let Some(event) = open_event {
        a2.end_event(event);
        stats.events += 1;
    }
    Ok(stats)
}

/// Timer thread sending a tick every `interval` until `stop` fires or the
/// receiver is dropped.
pub struct Ticker {
    ticks: Receiver<()>,
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn spawn(interval: Duration) -> Self {
        let (tick_tx, ticks) = crossbeam_channel::bounded(16);
        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let handle = std::thread::spawn(move || loop {
            crossbeam_channel::select! {
                recv(stop_rx) -> _ => break,
                default(interval) => {
                    if let Err(TrySendError::Disconnected(_)) = tick_tx.try_send(()) {
                        break;
                    }
                }
            }
        });

        Self {
            ticks,
            stop,
            handle: Some(handle),
        }
    }

    pub fn ticks(&self) -> &Receiver<()> {
        &self.ticks
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
