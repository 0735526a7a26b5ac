//! # Meter Error Handling
//!
//! This module defines the error types used across the modmeter-rs crate.
//!
//! The split follows how far a failure is allowed to travel:
//! - [`TransportError`] aborts one polling cycle and is handed to the caller.
//! - [`DecodeError`] stays with one register; the cycle carries on.
//! - [`ProbeError`] lets the caller move on to the next meter family.
//! - [`MeterError::Configuration`] is terminal for one device instance.
//! - [`MeterError::Range`] rejects an inbound write before the transport is touched.

use thiserror::Error;

/// Errors raised by a Modbus transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying socket or serial port failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No response within the transport's timeout.
    #[error("Timed out waiting for response")]
    Timeout,

    /// The device answered with a Modbus exception response.
    #[error("Modbus exception 0x{code:02X} ({}) for function 0x{function:02X}", exception_description(*.code))]
    Exception { function: u8, code: u8 },

    /// RTU frame checksum mismatch.
    #[error("Invalid CRC: expected 0x{expected:04X}, received 0x{received:04X}")]
    Crc { expected: u16, received: u16 },

    /// Response was well formed but did not match the request.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The transport has no open connection.
    #[error("Transport not connected")]
    NotConnected,

    /// Request would exceed the register limit of its function code.
    #[error("Request for {count} registers exceeds limit of {max}")]
    TooManyRegisters { count: usize, max: u16 },
}

/// Per-register decode failures. Never fatal for a polling cycle.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("Word count mismatch: expected {expected}, got {actual}")]
    WordCount { expected: usize, actual: usize },

    #[error("Raw code 0x{0:X} not present in mapping table")]
    UnmappedCode(u64),

    #[error("Text register holds no printable characters")]
    InvalidText,

    #[error("Value is not an integral code")]
    NotNumeric,

    #[error("No value was decoded")]
    Missing,
}

/// Failures while turning a logical value back into register words.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("Register is not writable")]
    NotWritable,

    #[error("Value {value} outside writable range [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },

    #[error("Value {0} cannot be represented by the register encoding")]
    NotRepresentable(f64),

    #[error("Encoding not supported for this register kind")]
    Unsupported,
}

/// Outcome of a failed model probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The identifying register was read but its code is not in the family table.
    #[error("{family}: identifying code {code} not in model table")]
    NoMatch { family: &'static str, code: u64 },

    /// The identifying register could not be read or decoded.
    #[error("{family}: probe read failed: {source}")]
    Transport {
        family: &'static str,
        #[source]
        source: TransportError,
    },

    /// The identifying register was read but did not decode.
    #[error("{family}: identifying register did not decode: {source}")]
    Decode {
        family: &'static str,
        #[source]
        source: DecodeError,
    },
}

/// Represents the different error types that can occur in the crate.
#[derive(Debug, Error)]
pub enum MeterError {
    /// Transport failure; the cycle was aborted and no register state changed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A register could not be decoded.
    #[error("Decode error at {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: DecodeError,
    },

    /// A value could not be encoded for writing.
    #[error("Encode error at {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: EncodeError,
    },

    /// A single family did not recognise the identifying code.
    #[error("Probe mismatch for {family}: code {code}")]
    ProbeMismatch { family: &'static str, code: u64 },

    /// No registered family recognised the device.
    #[error("No meter family matched the device")]
    NoMatch,

    /// Fatal for one device instance: bad phase configuration or failed init write.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Inbound write outside the register's declared range.
    #[error("Value {value} for {path} outside range [{min}, {max}]")]
    Range {
        path: String,
        value: f64,
        min: f64,
        max: f64,
    },

    /// The device acknowledged a write but reads back a different value.
    #[error("Write to {path} not applied: wrote {value}, read back {readback}")]
    WriteRejected {
        path: String,
        value: f64,
        readback: String,
    },

    /// The operation needs an initialised meter.
    #[error("Meter {0} is not active")]
    NotActive(String),

    /// Inbound write names a path this device does not have.
    #[error("Unknown path: {0}")]
    UnknownPath(String),

    /// Inbound write names a path without a writable range.
    #[error("Path is read-only: {0}")]
    ReadOnly(String),

    /// Service configuration file is malformed or inconsistent.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Device settings could not be applied or persisted.
    #[error("Settings error: {0}")]
    Settings(String),

    /// Filesystem failure (configuration, settings).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A catch-all error for uncategorized cases.
    #[error("Other error: {0}")]
    Other(String),
}

impl From<ProbeError> for MeterError {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::NoMatch { family, code } => MeterError::ProbeMismatch { family, code },
            ProbeError::Transport { source, .. } => MeterError::Transport(source),
            ProbeError::Decode { family, source } => MeterError::Decode {
                path: format!("{family} identifying register"),
                source,
            },
        }
    }
}

impl From<serde_json::Error> for MeterError {
    fn from(err: serde_json::Error) -> Self {
        MeterError::Settings(err.to_string())
    }
}

impl MeterError {
    /// True for errors that must stop a device instance for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MeterError::Configuration(_))
    }
}

/// Standard text for Modbus exception codes.
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Server Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Server Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}
