//! Replay of pre-recorded trace streams.
//!
//! The on-disk format is a little-endian, length-prefixed record stream:
//! a `FTRC` magic plus format version, then per event a u32 record length
//! followed by provider GUID, event id, version, opcode, timestamp, process
//! id, thread id, and the raw payload. Replaying the same file through the
//! core twice yields identical output.

use std::io::Write;
use std::path::Path;

use thiserror::Error;

use crate::dispatch::Dispatcher;
use crate::metadata::RawEvent;
use crate::providers::Guid;

pub const TRACE_MAGIC: [u8; 4] = *b"FTRC";
pub const TRACE_VERSION: u16 = 1;

/// Fixed part of each record after the length prefix.
const RECORD_HEAD: usize = 16 + 2 + 1 + 1 + 8 + 4 + 4;

/// Upper bound on a single record, to fail fast on corrupt streams.
const MAX_RECORD_LEN: u32 = 1 << 20;

/// Errors reading a recorded trace.
#[derive(Error, Debug)]
pub enum TraceReadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("not a trace file (bad magic)")]
    BadMagic,

    #[error("unsupported trace version {0}")]
    UnsupportedVersion(u16),

    #[error("truncated record at offset {offset}")]
    TruncatedRecord { offset: usize },

    #[error("record length {len} exceeds limit at offset {offset}")]
    OversizedRecord { len: u32, offset: usize },
}

/// An in-memory trace, ready for iteration. Events borrow their payloads
/// from the backing buffer.
pub struct TraceData {
    bytes: Vec<u8>,
}

impl TraceData {
    /// Read and header-check a trace file.
    pub fn open(path: &Path) -> Result<Self, TraceReadError> {
        Self::from_bytes(std::fs::read(path)?)
    }

    /// Header-check an already loaded trace.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, TraceReadError> {
        if bytes.len() < 6 || bytes[..4] != TRACE_MAGIC {
            return Err(TraceReadError::BadMagic);
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != TRACE_VERSION {
            return Err(TraceReadError::UnsupportedVersion(version));
        }
        Ok(Self { bytes })
    }

    /// Iterate the recorded events in stream order.
    pub fn events(&self) -> EventIter<'_> {
        EventIter {
            data: &self.bytes,
            offset: 6,
        }
    }
}

pub struct EventIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for EventIter<'a> {
    type Item = Result<RawEvent<'a>, TraceReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let offset = self.offset;

        let len_bytes = match self.data.get(offset..offset + 4) {
            Some(b) => b,
            None => {
                self.offset = self.data.len();
                return Some(Err(TraceReadError::TruncatedRecord { offset }));
            }
        };
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        if len > MAX_RECORD_LEN {
            self.offset = self.data.len();
            return Some(Err(TraceReadError::OversizedRecord { len, offset }));
        }
        if (len as usize) < RECORD_HEAD {
            self.offset = self.data.len();
            return Some(Err(TraceReadError::TruncatedRecord { offset }));
        }

        let body = match self.data.get(offset + 4..offset + 4 + len as usize) {
            Some(b) => b,
            None => {
                self.offset = self.data.len();
                return Some(Err(TraceReadError::TruncatedRecord { offset }));
            }
        };
        self.offset = offset + 4 + len as usize;

        let mut guid = [0u8; 16];
        guid.copy_from_slice(&body[..16]);

        Some(Ok(RawEvent {
            provider: Guid::from_bytes(guid),
            id: u16::from_le_bytes([body[16], body[17]]),
            version: body[18],
            opcode: body[19],
            timestamp: u64::from_le_bytes([
                body[20], body[21], body[22], body[23], body[24], body[25], body[26], body[27],
            ]),
            process_id: u32::from_le_bytes([body[28], body[29], body[30], body[31]]),
            thread_id: u32::from_le_bytes([body[32], body[33], body[34], body[35]]),
            payload: &body[RECORD_HEAD..],
        }))
    }
}

/// Feed an entire trace through the dispatcher. Returns the number of events
/// delivered; stops early when `cancelled` reports true.
pub fn replay(
    trace: &TraceData,
    dispatcher: &mut Dispatcher,
    mut cancelled: impl FnMut() -> bool,
) -> Result<u64, TraceReadError> {
    let mut delivered = 0u64;
    for event in trace.events() {
        if cancelled() {
            break;
        }
        let event = event?;
        dispatcher.on_event(&event);
        delivered += 1;
    }
    Ok(delivered)
}

/// Writer for the trace format; the counterpart of [`TraceData`].
pub struct TraceWriter<W: Write> {
    out: W,
}

impl<W: Write> TraceWriter<W> {
    pub fn new(mut out: W) -> std::io::Result<Self> {
        out.write_all(&TRACE_MAGIC)?;
        out.write_all(&TRACE_VERSION.to_le_bytes())?;
        Ok(Self { out })
    }

    pub fn write_event(&mut self, event: &RawEvent<'_>) -> std::io::Result<()> {
        let len = (RECORD_HEAD + event.payload.len()) as u32;
        self.out.write_all(&len.to_le_bytes())?;
        self.out.write_all(&event.provider.to_bytes())?;
        self.out.write_all(&event.id.to_le_bytes())?;
        self.out.write_all(&[event.version, event.opcode])?;
        self.out.write_all(&event.timestamp.to_le_bytes())?;
        self.out.write_all(&event.process_id.to_le_bytes())?;
        self.out.write_all(&event.thread_id.to_le_bytes())?;
        self.out.write_all(event.payload)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
