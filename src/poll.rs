//! # Polling Engine
//!
//! One polling cycle over a [`RegisterSet`]:
//!
//! 1. pick the registers whose cached value is older than their staleness window;
//! 2. coalesce the due registers of each batch into one [`ReadSpan`];
//! 3. read every span from the transport, one request at a time;
//! 4. if any read fails, return the error untouched and leave all registers as they were;
//! 5. otherwise decode each due register from its slice, stamping the read time
//!    whether or not decoding succeeds;
//! 6. report the round-trip latency and the paths whose published value changed.
//!
//! A cycle with nothing due returns immediately without touching the transport.

use std::ops::Range;
use std::time::{Duration, Instant};

use crate::coalesce::{coalesce, ReadSpan};
use crate::error::TransportError;
use crate::logging::DiagContext;
use crate::register::{FormattedValue, RegisterSet};
use crate::transport::ModbusTransport;
use crate::util::logging::ThrottleManager;

/// Engine state, observable between and during cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
}

/// A published value changed. `None` means the path became invalid.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueUpdate {
    pub path: String,
    pub value: Option<FormattedValue>,
}

/// Result of one successful cycle.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    /// Total round-trip time of the reads; `None` if nothing was due.
    pub latency: Option<Duration>,
    pub spans: Vec<ReadSpan>,
    pub updates: Vec<ValueUpdate>,
    pub decode_failures: usize,
}

impl CycleOutcome {
    pub fn is_idle(&self) -> bool {
        self.spans.is_empty()
    }
}

/// Counters kept across cycles.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub cycles: u64,
    pub reads: u64,
    pub transport_errors: u64,
    pub decode_errors: u64,
}

struct PendingRead {
    batch: Range<usize>,
    due: Vec<usize>,
    span: ReadSpan,
}

pub struct PollEngine {
    state: PollState,
    stats: PollStats,
    throttle: ThrottleManager,
}

impl Default for PollEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PollEngine {
    pub fn new() -> Self {
        PollEngine {
            state: PollState::Idle,
            stats: PollStats::default(),
            throttle: ThrottleManager::default(),
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn stats(&self) -> PollStats {
        self.stats
    }

    /// Run one cycle over every batch of `set`.
    pub async fn poll(
        &mut self,
        transport: &mut dyn ModbusTransport,
        unit: u8,
        set: &mut RegisterSet,
        now: Instant,
        ctx: &DiagContext,
    ) -> Result<CycleOutcome, TransportError> {
        let pending = Self::plan(set, now);
        if pending.is_empty() {
            return Ok(CycleOutcome::default());
        }

        self.state = PollState::Polling;
        self.stats.cycles += 1;
        let fetched = self.fetch(transport, unit, &pending, ctx).await;
        self.state = PollState::Idle;

        let (words, latencies) = fetched?;
        Ok(self.apply(set, pending, words, latencies, now, ctx))
    }

    /// Due registers per batch and the span covering them.
    fn plan(set: &RegisterSet, now: Instant) -> Vec<PendingRead> {
        set.batches()
            .iter()
            .filter_map(|batch| {
                let regs = set.batch(batch.clone());
                let due: Vec<usize> = regs
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.is_due(now))
                    .map(|(i, _)| i)
                    .collect();
                let span = coalesce(regs, &due)?;
                Some(PendingRead {
                    batch: batch.clone(),
                    due,
                    span,
                })
            })
            .collect()
    }

    async fn fetch(
        &mut self,
        transport: &mut dyn ModbusTransport,
        unit: u8,
        pending: &[PendingRead],
        ctx: &DiagContext,
    ) -> Result<(Vec<Vec<u16>>, Vec<Duration>), TransportError> {
        let mut words = Vec::with_capacity(pending.len());
        let mut latencies = Vec::with_capacity(pending.len());

        for read in pending {
            let started = Instant::now();
            self.stats.reads += 1;
            let result = transport
                .read_input_registers(read.span.start, read.span.count, unit)
                .await;
            let data = match result {
                Ok(data) => data,
                Err(err) => {
                    self.stats.transport_errors += 1;
                    ctx.error(format_args!(
                        "Error reading registers {:#06x}-{:#06x}: {err}",
                        read.span.start,
                        read.span.end().saturating_sub(1)
                    ));
                    return Err(err);
                }
            };
            if data.len() != usize::from(read.span.count) {
                self.stats.transport_errors += 1;
                return Err(TransportError::InvalidResponse(format!(
                    "{} registers for a read of {}",
                    data.len(),
                    read.span.count
                )));
            }
            latencies.push(started.elapsed());
            words.push(data);
        }

        Ok((words, latencies))
    }

    fn apply(
        &mut self,
        set: &mut RegisterSet,
        pending: Vec<PendingRead>,
        words: Vec<Vec<u16>>,
        latencies: Vec<Duration>,
        now: Instant,
        ctx: &DiagContext,
    ) -> CycleOutcome {
        let mut outcome = CycleOutcome {
            latency: Some(latencies.iter().sum()),
            ..CycleOutcome::default()
        };

        for ((read, data), latency) in pending.into_iter().zip(words).zip(latencies) {
            let regs = set.batch_mut(read.batch);
            for i in read.due {
                let reg = &mut regs[i];
                let decoded = reg.decode_words(&data[read.span.offsets(reg)]);

                match &decoded {
                    Ok(_) => self.throttle.clear(&reg.path),
                    Err(err) => {
                        outcome.decode_failures += 1;
                        self.stats.decode_errors += 1;
                        if self.throttle.allow(&reg.path) {
                            ctx.warn(format_args!(
                                "Failed to decode {} at {:#06x}: {err}",
                                reg.path, reg.base
                            ));
                        }
                    }
                }

                if reg.record(now, latency, decoded) && !reg.path.is_empty() {
                    outcome.updates.push(ValueUpdate {
                        path: reg.path.clone(),
                        value: reg.formatted(),
                    });
                }
            }
            outcome.spans.push(read.span);
        }

        outcome
    }
}
