//! Trace provider identities and wire-level enums.
//!
//! Event ids and enum values must match what the providers actually emit;
//! they are fixed by the platform, not by this crate.

use std::fmt;

/// A 128-bit provider GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(pub u128);

impl Guid {
    /// Parse from the 16-byte little-endian wire representation.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_le_bytes(bytes))
    }

    /// The 16-byte little-endian wire representation.
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// DXGI runtime presents.
pub const DXGI_PROVIDER: Guid = Guid(0xCA11C036_0102_4A2D_A6AD_F03CFED5D3C9);
/// D3D9 runtime presents.
pub const D3D9_PROVIDER: Guid = Guid(0x783ACA0A_790E_4D7F_8451_AA850511C6B9);
/// Graphics kernel: flips, blits, queue packets, sync DPCs, present history.
pub const DXGKRNL_PROVIDER: Guid = Guid(0x802EC45A_1E99_4B83_9920_87C98277BA9D);
/// Win32k composition tokens.
pub const WIN32K_PROVIDER: Guid = Guid(0x8C416C79_D49B_4F01_A467_E56D3AA8234C);
/// Desktop compositor (DWM core).
pub const DWM_PROVIDER: Guid = Guid(0x9E9BBA3C_2E38_40CB_99F4_9E8281425164);
/// NT kernel process start/stop.
pub const NT_PROCESS_PROVIDER: Guid = Guid(0x3D6FA8D0_FE05_11D0_9DDA_00C04FD7BA7C);
/// Trace-metadata events carrying event field layouts.
pub const METADATA_PROVIDER: Guid = Guid(0xBBCCF6C1_6CD1_48C4_80FF_839482E37671);

// DXGI event ids.
pub mod dxgi {
    pub const PRESENT_START: u16 = 42;
    pub const PRESENT_STOP: u16 = 43;
    pub const PRESENT_MPO_START: u16 = 55;
    pub const PRESENT_MPO_STOP: u16 = 56;
}

// D3D9 event ids.
pub mod d3d9 {
    pub const PRESENT_START: u16 = 1;
    pub const PRESENT_STOP: u16 = 2;
}

// Graphics kernel event ids.
pub mod dxgk {
    pub const VSYNC_DPC: u16 = 0x0011;
    pub const MMIO_FLIP: u16 = 0x0074;
    pub const BLIT: u16 = 0x00a6;
    pub const FLIP: u16 = 0x00a8;
    pub const PRESENT_HISTORY_START: u16 = 0x00ab;
    pub const PRESENT_HISTORY_INFO: u16 = 0x00ac;
    pub const QUEUE_PACKET_START: u16 = 0x00b2;
    pub const QUEUE_PACKET_STOP: u16 = 0x00b4;
    pub const PRESENT: u16 = 0x00b8;
    pub const PRESENT_HISTORY_DETAILED_START: u16 = 0x00d7;
    pub const FLIP_MPO: u16 = 0x00fc;
    pub const MMIO_FLIP_MPO: u16 = 0x0103;
    pub const INDEPENDENT_FLIP: u16 = 0x010a;
    pub const VSYNC_DPC_MPO: u16 = 0x0111;
    pub const HSYNC_DPC_MPO: u16 = 0x017e;
    pub const BLIT_CANCEL: u16 = 0x01f5;
}

// Win32k event ids.
pub mod win32k {
    pub const TOKEN_COMPOSITION_SURFACE_OBJECT: u16 = 201;
    pub const TOKEN_STATE_CHANGED: u16 = 301;
}

// Compositor event ids.
pub mod dwm {
    pub const SCHEDULE_PRESENT_START: u16 = 15;
    pub const GET_PRESENT_HISTORY: u16 = 64;
    pub const FLIP_CHAIN_PENDING: u16 = 69;
    pub const FLIP_CHAIN_COMPLETE: u16 = 70;
    pub const FLIP_CHAIN_DIRTY: u16 = 101;
}

// NT process opcodes (the process provider keys on opcode, not event id).
pub mod nt_process {
    pub const OPCODE_START: u8 = 1;
    pub const OPCODE_STOP: u8 = 2;
    pub const OPCODE_RUNDOWN_START: u8 = 3;
    pub const OPCODE_RUNDOWN_STOP: u8 = 4;
}

/// DXGI present flag: fullscreen-state probe, never produces work.
pub const DXGI_PRESENT_TEST: u32 = 0x0000_0001;

/// Queue packet types submitted to the graphics kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QueuePacketType {
    RenderCommandBuffer = 0,
    DeferredCommandBuffer = 1,
    SystemCommandBuffer = 2,
    MmioFlipCommandBuffer = 3,
    WaitCommandBuffer = 4,
    SignalCommandBuffer = 5,
    DeviceCommandBuffer = 6,
    SoftwareCommandBuffer = 7,
    PagingCommandBuffer = 8,
}

impl QueuePacketType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::RenderCommandBuffer),
            1 => Some(Self::DeferredCommandBuffer),
            2 => Some(Self::SystemCommandBuffer),
            3 => Some(Self::MmioFlipCommandBuffer),
            4 => Some(Self::WaitCommandBuffer),
            5 => Some(Self::SignalCommandBuffer),
            6 => Some(Self::DeviceCommandBuffer),
            7 => Some(Self::SoftwareCommandBuffer),
            8 => Some(Self::PagingCommandBuffer),
            _ => None,
        }
    }
}

/// Flip entry status reported by multi-plane-overlay flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FlipEntryStatus {
    FlipWaitVSync = 5,
    FlipWaitComplete = 11,
    FlipWaitPassive = 13,
    FlipWaitPost = 14,
    FlipWaitHSync = 15,
}

impl FlipEntryStatus {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            5 => Some(Self::FlipWaitVSync),
            11 => Some(Self::FlipWaitComplete),
            13 => Some(Self::FlipWaitPassive),
            14 => Some(Self::FlipWaitPost),
            15 => Some(Self::FlipWaitHSync),
            _ => None,
        }
    }
}

/// Present-history submission models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PresentModel {
    Uninitialized = 0,
    RedirectedGdi = 1,
    RedirectedFlip = 2,
    RedirectedBlt = 3,
    RedirectedVistaBlt = 4,
    ScreenCaptureFence = 5,
    RedirectedGdiSysmem = 6,
    RedirectedComposition = 7,
    SurfaceComplete = 8,
}

impl PresentModel {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Uninitialized),
            1 => Some(Self::RedirectedGdi),
            2 => Some(Self::RedirectedFlip),
            3 => Some(Self::RedirectedBlt),
            4 => Some(Self::RedirectedVistaBlt),
            5 => Some(Self::ScreenCaptureFence),
            6 => Some(Self::RedirectedGdiSysmem),
            7 => Some(Self::RedirectedComposition),
            8 => Some(Self::SurfaceComplete),
            _ => None,
        }
    }
}

/// Win32k composition token states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TokenState {
    InFrame = 3,
    Confirmed = 4,
    Retired = 5,
    Discarded = 6,
}

impl TokenState {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            3 => Some(Self::InFrame),
            4 => Some(Self::Confirmed),
            5 => Some(Self::Retired),
            6 => Some(Self::Discarded),
            _ => None,
        }
    }
}

/// MMIO flip mode flags (SetVidPnSourceAddress).
pub mod mmio_flip_flags {
    pub const MODE_CHANGE: u32 = 0x1;
    pub const FLIP_IMMEDIATE: u32 = 0x2;
    pub const FLIP_ON_NEXT_VSYNC: u32 = 0x4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_roundtrip() {
        let bytes = DXGKRNL_PROVIDER.to_bytes();
        assert_eq!(Guid::from_bytes(bytes), DXGKRNL_PROVIDER);
    }

    #[test]
    fn test_queue_packet_type_roundtrip() {
        for v in 0..=8u32 {
            let t = QueuePacketType::from_u32(v).expect("valid packet type");
            assert_eq!(t as u32, v);
        }
        assert!(QueuePacketType::from_u32(9).is_none());
    }

    #[test]
    fn test_flip_entry_status_values() {
        assert_eq!(
            FlipEntryStatus::from_u32(5),
            Some(FlipEntryStatus::FlipWaitVSync)
        );
        assert_eq!(
            FlipEntryStatus::from_u32(15),
            Some(FlipEntryStatus::FlipWaitHSync)
        );
        assert!(FlipEntryStatus::from_u32(0).is_none());
    }

    #[test]
    fn test_token_state_rejects_unknown() {
        assert_eq!(TokenState::from_u32(3), Some(TokenState::InFrame));
        assert_eq!(TokenState::from_u32(6), Some(TokenState::Discarded));
        assert!(TokenState::from_u32(7).is_none());
        assert!(TokenState::from_u32(0).is_none());
    }

    #[test]
    fn test_present_model_roundtrip() {
        for v in 0..=8u32 {
            let m = PresentModel::from_u32(v).expect("valid model");
            assert_eq!(m as u32, v);
        }
        assert!(PresentModel::from_u32(9).is_none());
    }
}
