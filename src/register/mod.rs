//! # Register Descriptors
//!
//! A [`Register`] describes one logical meter value: where it lives on the
//! wire, how its words are encoded, how it is scaled and displayed, and the
//! cached state the polling engine keeps for it.
//!
//! Registers are owned by a [`RegisterSet`], an indexed arena held by the
//! device. Only the polling engine mutates the cached state
//! (timestamp, value, validity).

pub mod codec;
pub mod format;

use std::collections::HashMap;
use std::ops::Range;
use std::time::{Duration, Instant};

use crate::coalesce::group_registers;
use crate::error::{DecodeError, EncodeError};

pub use codec::{decode, encode};
pub use format::{DisplayFormat, FormattedValue};

/// Wire encoding of a register.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegisterKind {
    U16,
    S16,
    U32,
    S32,
    U64,
    S64,
    /// IEEE-754 single precision, two words.
    F32,
    /// Packed ASCII, two characters per word, the given number of words.
    Text(u16),
    /// Unsigned 16-bit code translated through a `(raw, index)` table.
    Mapped(&'static [(u16, u16)]),
}

impl RegisterKind {
    /// Number of 16-bit words occupied on the wire.
    pub fn word_count(&self) -> u16 {
        match self {
            RegisterKind::U16 | RegisterKind::S16 | RegisterKind::Mapped(_) => 1,
            RegisterKind::U32 | RegisterKind::S32 | RegisterKind::F32 => 2,
            RegisterKind::U64 | RegisterKind::S64 => 4,
            RegisterKind::Text(words) => *words,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, RegisterKind::Text(_))
    }
}

/// Order in which the words of a multi-word value arrive.
///
/// Bytes inside a word are always big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WordOrder {
    /// Most significant word first.
    #[default]
    BigEndian,
    /// Least significant word first.
    LittleEndian,
}

/// A decoded register value.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterValue {
    Number(f64),
    Text(String),
}

impl RegisterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RegisterValue::Number(v) => Some(*v),
            RegisterValue::Text(_) => None,
        }
    }

    /// The value as a non-negative integral code, if it is one.
    pub fn as_code(&self) -> Option<usize> {
        match self {
            RegisterValue::Number(v) if *v >= 0.0 && v.fract() == 0.0 && *v <= usize::MAX as f64 => {
                Some(*v as usize)
            }
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            RegisterValue::Text(s) => Some(s),
            RegisterValue::Number(_) => None,
        }
    }
}

impl std::fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterValue::Number(v) if v.fract() == 0.0 && v.abs() < 1e15 => write!(f, "{}", *v as i64),
            RegisterValue::Number(v) => write!(f, "{v}"),
            RegisterValue::Text(s) => f.write_str(s),
        }
    }
}

/// Descriptor plus cached state of one logical value.
#[derive(Debug, Clone)]
pub struct Register {
    pub base: u16,
    pub kind: RegisterKind,
    pub word_order: WordOrder,
    /// Publication path, e.g. `/Ac/L1/Voltage`.
    pub path: String,
    /// Divisor applied to the raw value (`raw / scale`).
    pub scale: f64,
    pub format: Option<DisplayFormat>,
    /// Display labels indexed by the decoded code.
    pub labels: Option<&'static [&'static str]>,
    /// Inclusive writable range in logical units.
    pub write_range: Option<(f64, f64)>,
    /// Age after which the cached value is due again.
    pub max_age: Duration,
    last_read: Option<Instant>,
    latency: Option<Duration>,
    value: Option<RegisterValue>,
    error: Option<DecodeError>,
}

impl Register {
    pub fn new(base: u16, kind: RegisterKind, path: impl Into<String>) -> Self {
        Register {
            base,
            kind,
            word_order: WordOrder::BigEndian,
            path: path.into(),
            scale: 1.0,
            format: None,
            labels: None,
            write_range: None,
            max_age: Duration::ZERO,
            last_read: None,
            latency: None,
            value: None,
            error: None,
        }
    }

    pub fn u16(base: u16, path: impl Into<String>) -> Self {
        Self::new(base, RegisterKind::U16, path)
    }

    pub fn s16(base: u16, path: impl Into<String>) -> Self {
        Self::new(base, RegisterKind::S16, path)
    }

    pub fn u32(base: u16, path: impl Into<String>) -> Self {
        Self::new(base, RegisterKind::U32, path)
    }

    pub fn s32(base: u16, path: impl Into<String>) -> Self {
        Self::new(base, RegisterKind::S32, path)
    }

    pub fn u64(base: u16, path: impl Into<String>) -> Self {
        Self::new(base, RegisterKind::U64, path)
    }

    pub fn s64(base: u16, path: impl Into<String>) -> Self {
        Self::new(base, RegisterKind::S64, path)
    }

    pub fn f32(base: u16, path: impl Into<String>) -> Self {
        Self::new(base, RegisterKind::F32, path)
    }

    pub fn text(base: u16, words: u16, path: impl Into<String>) -> Self {
        Self::new(base, RegisterKind::Text(words), path)
    }

    pub fn mapped(base: u16, path: impl Into<String>, map: &'static [(u16, u16)]) -> Self {
        Self::new(base, RegisterKind::Mapped(map), path)
    }

    pub fn little_endian(mut self) -> Self {
        self.word_order = WordOrder::LittleEndian;
        self
    }

    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn format(mut self, precision: u8, unit: &'static str) -> Self {
        self.format = Some(DisplayFormat::new(precision, unit));
        self
    }

    pub fn labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn writable(mut self, min: f64, max: f64) -> Self {
        self.write_range = Some((min, max));
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn word_count(&self) -> u16 {
        self.kind.word_count()
    }

    /// One past the last wire address, widened so `0xFFFF`-adjacent registers don't wrap.
    pub fn end(&self) -> u32 {
        u32::from(self.base) + u32::from(self.word_count())
    }

    pub fn value(&self) -> Option<&RegisterValue> {
        self.value.as_ref()
    }

    /// Why the last read did not produce a value.
    pub fn decode_error(&self) -> Option<&DecodeError> {
        self.error.as_ref()
    }

    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }

    pub fn last_read(&self) -> Option<Instant> {
        self.last_read
    }

    /// Round-trip latency of the read that last refreshed this register.
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// Due when never read or when strictly older than its staleness window.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_read {
            None => true,
            Some(at) => now.saturating_duration_since(at) > self.max_age,
        }
    }

    /// Decode a word slice without touching cached state.
    pub fn decode_words(&self, words: &[u16]) -> Result<RegisterValue, DecodeError> {
        decode(self.kind, self.word_order, self.scale, words)
    }

    /// Validate `value` against the writable range and encode it.
    pub fn encode_value(&self, value: f64) -> Result<Vec<u16>, EncodeError> {
        let (min, max) = self.write_range.ok_or(EncodeError::NotWritable)?;
        if !(min..=max).contains(&value) {
            return Err(EncodeError::OutOfRange { value, min, max });
        }
        encode(self.kind, self.word_order, self.scale, value)
    }

    /// Cached value rendered for publication.
    pub fn formatted(&self) -> Option<FormattedValue> {
        self.value
            .as_ref()
            .map(|v| FormattedValue::render(v, self.format.as_ref(), self.labels))
    }

    /// Record the outcome of one read. The timestamp always advances;
    /// value and validity follow the decode result. Returns true when the
    /// published state (value or validity) changed.
    pub(crate) fn record(
        &mut self,
        now: Instant,
        latency: Duration,
        decoded: Result<RegisterValue, DecodeError>,
    ) -> bool {
        self.last_read = Some(now);
        self.latency = Some(latency);
        let (next, error) = match decoded {
            Ok(value) => (Some(value), None),
            Err(err) => (None, Some(err)),
        };
        let changed = next != self.value;
        self.value = next;
        self.error = error;
        changed
    }

    /// Forget cached state so the register is due on the next cycle.
    pub fn invalidate(&mut self) {
        self.last_read = None;
        self.value = None;
        self.error = None;
    }
}

/// Index of a register inside its [`RegisterSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterId(pub usize);

/// Address-ordered arena of registers, pre-split into read batches.
#[derive(Debug, Clone, Default)]
pub struct RegisterSet {
    regs: Vec<Register>,
    batches: Vec<Range<usize>>,
    by_path: HashMap<String, usize>,
}

impl RegisterSet {
    /// Build the arena. Registers are stably sorted by base address once here;
    /// nothing downstream reorders them.
    pub fn new(mut regs: Vec<Register>) -> Self {
        regs.sort_by_key(|r| r.base);
        let batches = group_registers(&regs);
        let by_path = regs
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.path.is_empty())
            .map(|(i, r)| (r.path.clone(), i))
            .collect();
        RegisterSet {
            regs,
            batches,
            by_path,
        }
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    pub fn get(&self, id: RegisterId) -> Option<&Register> {
        self.regs.get(id.0)
    }

    pub fn find(&self, path: &str) -> Option<RegisterId> {
        self.by_path.get(path).copied().map(RegisterId)
    }

    pub fn by_path(&self, path: &str) -> Option<&Register> {
        self.find(path).and_then(|id| self.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Register> {
        self.regs.iter()
    }

    /// Index ranges of the read batches, in address order.
    pub fn batches(&self) -> &[Range<usize>] {
        &self.batches
    }

    pub fn batch(&self, batch: Range<usize>) -> &[Register] {
        &self.regs[batch]
    }

    pub(crate) fn batch_mut(&mut self, batch: Range<usize>) -> &mut [Register] {
        &mut self.regs[batch]
    }

    pub fn invalidate_all(&mut self) {
        self.regs.iter_mut().for_each(Register::invalidate);
    }
}
