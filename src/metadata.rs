//! Metadata-driven event field decoding.
//!
//! Providers describe their payloads through schema events; the resolver maps
//! (provider, event id, version) to a field layout and exposes typed lookups
//! over the raw payload bytes. Callers treat a missing layout as "skip event".

use std::collections::HashMap;

use thiserror::Error;

use crate::providers::{self, Guid};

/// One raw event as delivered by the session. The payload is borrowed; the
/// core copies out anything it keeps past the handler call.
#[derive(Debug, Clone, Copy)]
pub struct RawEvent<'a> {
    pub provider: Guid,
    pub id: u16,
    pub version: u8,
    pub opcode: u8,
    pub timestamp: u64,
    pub process_id: u32,
    pub thread_id: u32,
    pub payload: &'a [u8],
}

/// Identity of one event schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventDescriptor {
    pub provider: Guid,
    pub id: u16,
    pub version: u8,
    pub opcode: u8,
}

impl RawEvent<'_> {
    pub fn descriptor(&self) -> EventDescriptor {
        EventDescriptor {
            provider: self.provider,
            id: self.id,
            version: self.version,
            opcode: self.opcode,
        }
    }
}

/// Wire type of one decoded field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldKind {
    U8 = 1,
    U16 = 2,
    U32 = 3,
    U64 = 4,
    /// NUL-terminated single-byte string; must be the last field.
    AnsiString = 5,
}

impl FieldKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::U8),
            2 => Some(Self::U16),
            3 => Some(Self::U32),
            4 => Some(Self::U64),
            5 => Some(Self::AnsiString),
            _ => None,
        }
    }

    fn width(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
            Self::U64 => 8,
            Self::AnsiString => 1,
        }
    }
}

#[derive(Debug, Clone)]
struct FieldDesc {
    name: String,
    kind: FieldKind,
    offset: usize,
}

/// A packed field layout for one event schema.
#[derive(Debug, Clone, Default)]
pub struct EventLayout {
    fields: Vec<FieldDesc>,
    min_size: usize,
}

impl EventLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field at the next packed offset.
    pub fn field(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldDesc {
            name: name.to_string(),
            kind,
            offset: self.min_size,
        });
        self.min_size += kind.width();
        self
    }

    fn find(&self, name: &str) -> Result<&FieldDesc, DecodeError> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| DecodeError::UnknownField {
                name: name.to_string(),
            })
    }
}

/// Errors from the metadata resolver and field readers.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("no layout registered for provider {provider} event {id} v{version}")]
    MissingLayout { provider: Guid, id: u16, version: u8 },

    #[error("field {name} is not part of the event layout")]
    UnknownField { name: String },

    #[error("reading field {name}: payload is {len} bytes")]
    Truncated { name: String, len: usize },

    #[error("malformed schema event: {reason}")]
    BadSchema { reason: &'static str },
}

/// Typed reads over one event's payload, driven by its layout.
pub struct FieldReader<'a> {
    layout: &'a EventLayout,
    payload: &'a [u8],
}

impl FieldReader<'_> {
    fn bytes(&self, name: &str, offset: usize, width: usize) -> Result<&[u8], DecodeError> {
        self.payload
            .get(offset..offset + width)
            .ok_or_else(|| DecodeError::Truncated {
                name: name.to_string(),
                len: self.payload.len(),
            })
    }

    pub fn u8(&self, name: &str) -> Result<u8, DecodeError> {
        let f = self.layout.find(name)?;
        Ok(self.bytes(name, f.offset, 1)?[0])
    }

    pub fn u16(&self, name: &str) -> Result<u16, DecodeError> {
        let f = self.layout.find(name)?;
        let b = self.bytes(name, f.offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&self, name: &str) -> Result<u32, DecodeError> {
        let f = self.layout.find(name)?;
        let b = self.bytes(name, f.offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&self, name: &str) -> Result<u64, DecodeError> {
        let f = self.layout.find(name)?;
        let b = self.bytes(name, f.offset, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn i32(&self, name: &str) -> Result<i32, DecodeError> {
        Ok(self.u32(name)? as i32)
    }

    /// Nonzero u32 as bool.
    pub fn bool32(&self, name: &str) -> Result<bool, DecodeError> {
        Ok(self.u32(name)? != 0)
    }

    /// Read element `index` of a trailing u64 array starting at the field.
    pub fn u64_at(&self, name: &str, index: usize) -> Result<u64, DecodeError> {
        let f = self.layout.find(name)?;
        let b = self.bytes(name, f.offset + index * 8, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    /// NUL-terminated string field, lossy on invalid bytes.
    pub fn ansi_string(&self, name: &str) -> Result<String, DecodeError> {
        let f = self.layout.find(name)?;
        let tail = self
            .payload
            .get(f.offset..)
            .ok_or_else(|| DecodeError::Truncated {
                name: name.to_string(),
                len: self.payload.len(),
            })?;
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
    }
}

/// Resolver from event identity to field layout.
pub struct MetadataResolver {
    layouts: HashMap<(Guid, u16, u8), EventLayout>,
}

impl MetadataResolver {
    /// Empty resolver; layouts arrive via schema events only.
    pub fn new() -> Self {
        Self {
            layouts: HashMap::new(),
        }
    }

    /// Resolver pre-seeded with the layouts the tracked providers are known
    /// to emit, so replay streams without a schema preamble still decode.
    pub fn with_defaults() -> Self {
        use FieldKind::{AnsiString, U32, U64};

        let mut r = Self::new();

        // Runtime presents.
        r.register(
            providers::DXGI_PROVIDER,
            providers::dxgi::PRESENT_START,
            0,
            EventLayout::new()
                .field("pIDXGISwapChain", U64)
                .field("Flags", U32)
                .field("SyncInterval", U32),
        );
        r.register(
            providers::DXGI_PROVIDER,
            providers::dxgi::PRESENT_STOP,
            0,
            EventLayout::new().field("Result", U32),
        );
        r.register(
            providers::DXGI_PROVIDER,
            providers::dxgi::PRESENT_MPO_START,
            0,
            EventLayout::new()
                .field("pIDXGISwapChain", U64)
                .field("Flags", U32)
                .field("SyncInterval", U32),
        );
        r.register(
            providers::DXGI_PROVIDER,
            providers::dxgi::PRESENT_MPO_STOP,
            0,
            EventLayout::new().field("Result", U32),
        );
        r.register(
            providers::D3D9_PROVIDER,
            providers::d3d9::PRESENT_START,
            0,
            EventLayout::new()
                .field("pSwapchain", U64)
                .field("Flags", U32),
        );
        r.register(
            providers::D3D9_PROVIDER,
            providers::d3d9::PRESENT_STOP,
            0,
            EventLayout::new().field("Result", U32),
        );

        // Graphics kernel.
        r.register(
            providers::DXGKRNL_PROVIDER,
            providers::dxgk::BLIT,
            0,
            EventLayout::new()
                .field("hwnd", U64)
                .field("bRedirectedPresent", U32),
        );
        r.register(
            providers::DXGKRNL_PROVIDER,
            providers::dxgk::BLIT_CANCEL,
            0,
            EventLayout::new(),
        );
        r.register(
            providers::DXGKRNL_PROVIDER,
            providers::dxgk::FLIP,
            0,
            EventLayout::new()
                .field("FlipInterval", U32)
                .field("MMIOFlip", U32),
        );
        r.register(
            providers::DXGKRNL_PROVIDER,
            providers::dxgk::FLIP_MPO,
            0,
            EventLayout::new(),
        );
        r.register(
            providers::DXGKRNL_PROVIDER,
            providers::dxgk::INDEPENDENT_FLIP,
            1,
            EventLayout::new()
                .field("SubmitSequence", U32)
                .field("FlipInterval", U32),
        );
        r.register(
            providers::DXGKRNL_PROVIDER,
            providers::dxgk::QUEUE_PACKET_START,
            1,
            EventLayout::new()
                .field("PacketType", U32)
                .field("SubmitSequence", U32)
                .field("hContext", U64)
                .field("bPresent", U32),
        );
        r.register(
            providers::DXGKRNL_PROVIDER,
            providers::dxgk::QUEUE_PACKET_STOP,
            1,
            EventLayout::new().field("SubmitSequence", U32),
        );
        r.register(
            providers::DXGKRNL_PROVIDER,
            providers::dxgk::MMIO_FLIP,
            0,
            EventLayout::new()
                .field("FlipSubmitSequence", U64)
                .field("Flags", U32),
        );
        r.register(
            providers::DXGKRNL_PROVIDER,
            providers::dxgk::MMIO_FLIP_MPO,
            3,
            EventLayout::new()
                .field("FlipSubmitSequence", U64)
                .field("FlipEntryStatusAfterFlipValid", U32)
                .field("FlipEntryStatusAfterFlip", U32),
        );
        r.register(
            providers::DXGKRNL_PROVIDER,
            providers::dxgk::VSYNC_DPC,
            0,
            EventLayout::new().field("FlipFenceId", U64),
        );
        r.register(
            providers::DXGKRNL_PROVIDER,
            providers::dxgk::VSYNC_DPC_MPO,
            2,
            EventLayout::new()
                .field("PlaneCount", U32)
                .field("FlipSubmitSequence", U64),
        );
        r.register(
            providers::DXGKRNL_PROVIDER,
            providers::dxgk::HSYNC_DPC_MPO,
            0,
            EventLayout::new()
                .field("PlaneCount", U32)
                .field("FlipSubmitSequence", U64),
        );
        r.register(
            providers::DXGKRNL_PROVIDER,
            providers::dxgk::PRESENT,
            1,
            EventLayout::new().field("hWindow", U64),
        );
        r.register(
            providers::DXGKRNL_PROVIDER,
            providers::dxgk::PRESENT_HISTORY_START,
            0,
            EventLayout::new()
                .field("Token", U64)
                .field("Model", U32)
                .field("TokenData", U64),
        );
        r.register(
            providers::DXGKRNL_PROVIDER,
            providers::dxgk::PRESENT_HISTORY_DETAILED_START,
            0,
            EventLayout::new().field("Token", U64).field("Model", U32),
        );
        r.register(
            providers::DXGKRNL_PROVIDER,
            providers::dxgk::PRESENT_HISTORY_INFO,
            0,
            EventLayout::new().field("Token", U64),
        );

        // Win32k composition tokens.
        r.register(
            providers::WIN32K_PROVIDER,
            providers::win32k::TOKEN_COMPOSITION_SURFACE_OBJECT,
            0,
            EventLayout::new()
                .field("CompositionSurfaceLuid", U64)
                .field("PresentCount", U64)
                .field("BindId", U64),
        );
        r.register(
            providers::WIN32K_PROVIDER,
            providers::win32k::TOKEN_STATE_CHANGED,
            0,
            EventLayout::new()
                .field("CompositionSurfaceLuid", U64)
                .field("PresentCount", U64)
                .field("BindId", U64)
                .field("NewState", U32)
                .field("IndependentFlip", U32)
                .field("DestWidth", U32)
                .field("DestHeight", U32),
        );

        // Compositor.
        r.register(
            providers::DWM_PROVIDER,
            providers::dwm::GET_PRESENT_HISTORY,
            0,
            EventLayout::new(),
        );
        r.register(
            providers::DWM_PROVIDER,
            providers::dwm::SCHEDULE_PRESENT_START,
            0,
            EventLayout::new(),
        );
        for id in [
            providers::dwm::FLIP_CHAIN_PENDING,
            providers::dwm::FLIP_CHAIN_COMPLETE,
            providers::dwm::FLIP_CHAIN_DIRTY,
        ] {
            r.register(
                providers::DWM_PROVIDER,
                id,
                0,
                EventLayout::new()
                    .field("ulFlipChain", U32)
                    .field("ulSerialNumber", U32)
                    .field("hwnd", U64),
            );
        }

        // NT process start/stop (keyed on opcode; event id is 0).
        r.register(
            providers::NT_PROCESS_PROVIDER,
            0,
            0,
            EventLayout::new()
                .field("ProcessId", U32)
                .field("ImageFileName", AnsiString),
        );

        r
    }

    /// Register (or replace) the layout for one event schema.
    pub fn register(&mut self, provider: Guid, id: u16, version: u8, layout: EventLayout) {
        self.layouts.insert((provider, id, version), layout);
    }

    /// Number of registered layouts.
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// Resolve the layout for an event and wrap its payload for typed reads.
    pub fn reader<'a>(&'a self, event: &RawEvent<'a>) -> Result<FieldReader<'a>, DecodeError> {
        let layout = self
            .layouts
            .get(&(event.provider, event.id, event.version))
            .ok_or(DecodeError::MissingLayout {
                provider: event.provider,
                id: event.id,
                version: event.version,
            })?;
        Ok(FieldReader {
            layout,
            payload: event.payload,
        })
    }

    /// Register a layout carried by a schema event.
    ///
    /// Payload: provider GUID (16), event id u16, version u8, field count u8,
    /// then per field: kind u8, name length u8, name bytes.
    pub fn handle_schema_event(&mut self, event: &RawEvent<'_>) -> Result<(), DecodeError> {
        let data = event.payload;
        if data.len() < 20 {
            return Err(DecodeError::BadSchema {
                reason: "header too short",
            });
        }

        let mut guid = [0u8; 16];
        guid.copy_from_slice(&data[..16]);
        let provider = Guid::from_bytes(guid);
        let id = u16::from_le_bytes([data[16], data[17]]);
        let version = data[18];
        let field_count = data[19] as usize;

        let mut layout = EventLayout::new();
        let mut pos = 20;
        for _ in 0..field_count {
            let (&kind_raw, &name_len) = match (data.get(pos), data.get(pos + 1)) {
                (Some(k), Some(n)) => (k, n),
                _ => {
                    return Err(DecodeError::BadSchema {
                        reason: "truncated field descriptor",
                    })
                }
            };
            let kind = FieldKind::from_u8(kind_raw).ok_or(DecodeError::BadSchema {
                reason: "unknown field kind",
            })?;
            let name_end = pos + 2 + name_len as usize;
            let name_bytes = data.get(pos + 2..name_end).ok_or(DecodeError::BadSchema {
                reason: "truncated field name",
            })?;
            let name = std::str::from_utf8(name_bytes).map_err(|_| DecodeError::BadSchema {
                reason: "field name is not utf-8",
            })?;
            layout = layout.field(name, kind);
            pos = name_end;
        }

        self.register(provider, id, version, layout);
        Ok(())
    }
}

impl Default for MetadataResolver {
    fn default() -> Self {
        Self::with_defaults()
    }
}
