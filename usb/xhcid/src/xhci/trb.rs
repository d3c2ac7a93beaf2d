use std::convert::TryFrom;
use std::fmt;

use crate::usb;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TrbType {
    Reserved,
    /* Transfer */
    Normal,
    SetupStage,
    DataStage,
    StatusStage,
    Isoch,
    Link,
    EventData,
    NoOp,
    /* Command */
    EnableSlot,
    DisableSlot,
    AddressDevice,
    ConfigureEndpoint,
    EvaluateContext,
    ResetEndpoint,
    StopEndpoint,
    SetTrDequeuePointer,
    ResetDevice,
    ForceEvent,
    NegotiateBandwidth,
    SetLatencyToleranceValue,
    GetPortBandwidth,
    ForceHeader,
    NoOpCmd,
    /* Reserved */
    GetExtendedProperty,
    SetExtendedProperty,
    Rsv26,
    Rsv27,
    Rsv28,
    Rsv29,
    Rsv30,
    Rsv31,
    /* Events */
    Transfer,
    CommandCompletion,
    PortStatusChange,
    BandwidthRequest,
    Doorbell,
    HostController,
    DeviceNotification,
    MfindexWrap,
    /* Reserved from 40 to 47, vendor defined from 48 to 63 */
}

const TRB_TYPES: [TrbType; 40] = [
    TrbType::Reserved,
    TrbType::Normal,
    TrbType::SetupStage,
    TrbType::DataStage,
    TrbType::StatusStage,
    TrbType::Isoch,
    TrbType::Link,
    TrbType::EventData,
    TrbType::NoOp,
    TrbType::EnableSlot,
    TrbType::DisableSlot,
    TrbType::AddressDevice,
    TrbType::ConfigureEndpoint,
    TrbType::EvaluateContext,
    TrbType::ResetEndpoint,
    TrbType::StopEndpoint,
    TrbType::SetTrDequeuePointer,
    TrbType::ResetDevice,
    TrbType::ForceEvent,
    TrbType::NegotiateBandwidth,
    TrbType::SetLatencyToleranceValue,
    TrbType::GetPortBandwidth,
    TrbType::ForceHeader,
    TrbType::NoOpCmd,
    TrbType::GetExtendedProperty,
    TrbType::SetExtendedProperty,
    TrbType::Rsv26,
    TrbType::Rsv27,
    TrbType::Rsv28,
    TrbType::Rsv29,
    TrbType::Rsv30,
    TrbType::Rsv31,
    TrbType::Transfer,
    TrbType::CommandCompletion,
    TrbType::PortStatusChange,
    TrbType::BandwidthRequest,
    TrbType::Doorbell,
    TrbType::HostController,
    TrbType::DeviceNotification,
    TrbType::MfindexWrap,
];

impl TryFrom<u8> for TrbType {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, u8> {
        TRB_TYPES.get(usize::from(raw)).copied().ok_or(raw)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TrbCompletionCode {
    Invalid = 0x00,
    Success = 0x01,
    DataBuffer = 0x02,
    BabbleDetected = 0x03,
    UsbTransaction = 0x04,
    Trb = 0x05,
    Stall = 0x06,
    Resource = 0x07,
    Bandwidth = 0x08,
    NoSlotsAvailable = 0x09,
    InvalidStreamType = 0x0A,
    SlotNotEnabled = 0x0B,
    EndpointNotEnabled = 0x0C,
    ShortPacket = 0x0D,
    RingUnderrun = 0x0E,
    RingOverrun = 0x0F,
    VfEventRingFull = 0x10,
    Parameter = 0x11,
    BandwidthOverrun = 0x12,
    ContextState = 0x13,
    NoPingResponse = 0x14,
    EventRingFull = 0x15,
    IncompatibleDevice = 0x16,
    MissedService = 0x17,
    CommandRingStopped = 0x18,
    CommandAborted = 0x19,
    Stopped = 0x1A,
    StoppedLengthInvalid = 0x1B,
    StoppedShortPacket = 0x1C,
    MaxExitLatencyTooLarge = 0x1D,
    Rsv30 = 0x1E,
    IsochBuffer = 0x1F,
    EventLost = 0x20,
    Undefined = 0x21,
    InvalidStreamId = 0x22,
    SecondaryBandwidth = 0x23,
    SplitTransaction = 0x24,
    /* Values from 37 to 191 are reserved */
    /* 192 to 223 are vendor defined errors */
    /* 224 to 255 are vendor defined information */
}

/// A raw completion code as found in bits 24..32 of an event's status word.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CompletionCode(pub u8);

impl CompletionCode {
    /// Success and Short Packet are the only codes that do not fail a request.
    pub fn is_success(self) -> bool {
        self.0 == TrbCompletionCode::Success as u8 || self.0 == TrbCompletionCode::ShortPacket as u8
    }

    pub fn description(self) -> &'static str {
        match self.0 {
            0x02 => "Data Buffer Error",
            0x03 => "Babble Detected Error",
            0x04 => "USB Transaction Error",
            0x05 => "TRB Error",
            0x06 => "Stall Error",
            0x07 => "Resume Error",
            0x08 => "Bandwidth Error",
            0x09 => "No Slots Available",
            0x0A => "Invalid Stream Type",
            0x0B => "Slot Not Enabled",
            0x0C => "Endpoint Not Enabled",
            0x0D => "Short Packet",
            0x0E => "Ring Underrun",
            0x0F => "Ring Overrun",
            0x10 => "VF Event Ring Full",
            0x11 => "Parameter Error",
            0x12 => "Bandwidth Overrun Error",
            0x13 => "Context State Error",
            0x14 => "No Ping Response",
            0x15 => "Event Ring Full",
            0x16 => "Incompatible Device",
            0x17 => "Missed Service Error",
            0x18 => "Command Ring Stopped",
            0x19 => "Command Aborted",
            0x1A => "Stopped",
            0x1B => "Stopped - Length Invalid",
            0x1D => "Max Exit Latency Too Large",
            0x1F => "Isoch Buffer Overrun",
            0x20 => "Event Lost Error",
            0x21 => "Undefined Error",
            0x22 => "Invalid Stream ID",
            0x23 => "Secondary Bandwidth Error",
            0x24 => "Split Transaction Error",
            _ => "???",
        }
    }
}

impl From<TrbCompletionCode> for CompletionCode {
    fn from(code: TrbCompletionCode) -> Self {
        Self(code as u8)
    }
}

impl fmt::Display for CompletionCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Transfer type of a setup stage (TRT).
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferKind {
    NoData,
    Reserved,
    Out,
    In,
}

pub const TRB_STATUS_COMPLETION_CODE_SHIFT: u8 = 24;
pub const TRB_STATUS_TRANSFER_LENGTH_MASK: u32 = 0x00FF_FFFF;
/// TRB Transfer Length of a transfer TRB; TD Size and Interrupter Target sit above it.
pub const TRB_STATUS_TRB_LENGTH_MASK: u32 = 0x0001_FFFF;
/// Largest buffer a single transfer TRB can describe.
pub const TRB_MAX_LENGTH: usize = TRB_STATUS_TRB_LENGTH_MASK as usize;

pub const TRB_CONTROL_CYCLE: u32 = 1 << 0;
pub const TRB_CONTROL_TOGGLE_CYCLE: u32 = 1 << 1;
pub const TRB_CONTROL_ISP: u32 = 1 << 2;
pub const TRB_CONTROL_CHAIN: u32 = 1 << 4;
pub const TRB_CONTROL_IOC: u32 = 1 << 5;
pub const TRB_CONTROL_IDT: u32 = 1 << 6;

pub const TRB_CONTROL_TRB_TYPE_SHIFT: u8 = 10;
pub const TRB_CONTROL_TRB_TYPE_MASK: u32 = 0x0000_FC00;

pub const TRB_CONTROL_ENDPOINT_ID_MASK: u32 = 0x001F_0000;
pub const TRB_CONTROL_ENDPOINT_ID_SHIFT: u8 = 16;

pub const TRB_CONTROL_DIR_IN: u32 = 1 << 16;

pub const TRB_CONTROL_FRAME_ID_SHIFT: u8 = 20;
pub const TRB_CONTROL_FRAME_ID_MASK: u32 = 0x7FF;

/// One 16-byte transfer request block, as a value.
///
/// Builders leave the cycle bit clear; the ring owning the entry decides it.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct Trb {
    pub data: u64,
    pub status: u32,
    pub control: u32,
}

fn ty(kind: TrbType) -> u32 {
    (kind as u32) << TRB_CONTROL_TRB_TYPE_SHIFT
}

fn slot_ep(slot_id: u8, endp_num_xhc: u8) -> u32 {
    assert_eq!(endp_num_xhc & 0x1F, endp_num_xhc);
    (u32::from(slot_id) << 24) | (u32::from(endp_num_xhc) << 16)
}

impl Trb {
    pub fn new(data: u64, status: u32, control: u32) -> Self {
        Self { data, status, control }
    }

    pub fn from_words(words: [u32; 4]) -> Self {
        Self {
            data: u64::from(words[0]) | (u64::from(words[1]) << 32),
            status: words[2],
            control: words[3],
        }
    }

    pub fn words(&self) -> [u32; 4] {
        [self.data as u32, (self.data >> 32) as u32, self.status, self.control]
    }

    pub fn cycle(&self) -> bool {
        self.control & TRB_CONTROL_CYCLE != 0
    }

    pub fn trb_type(&self) -> u8 {
        ((self.control & TRB_CONTROL_TRB_TYPE_MASK) >> TRB_CONTROL_TRB_TYPE_SHIFT) as u8
    }

    pub fn completion_code(&self) -> CompletionCode {
        CompletionCode((self.status >> TRB_STATUS_COMPLETION_CODE_SHIFT) as u8)
    }

    /// Returns the number of bytes that should have been transmitted, but weren't.
    pub fn transfer_length(&self) -> u32 {
        self.status & TRB_STATUS_TRANSFER_LENGTH_MASK
    }

    pub fn event_slot(&self) -> u8 {
        (self.control >> 24) as u8
    }

    pub fn endpoint_id(&self) -> u8 {
        ((self.control & TRB_CONTROL_ENDPOINT_ID_MASK) >> TRB_CONTROL_ENDPOINT_ID_SHIFT) as u8
    }

    /// Address of the TRB an event refers to.
    pub fn event_trb_pointer(&self) -> u64 {
        self.data & !0xF
    }

    pub fn link(ring_base: u64) -> Self {
        Self::new(ring_base, 0, ty(TrbType::Link) | TRB_CONTROL_TOGGLE_CYCLE)
    }

    pub fn noop_command() -> Self {
        Self::new(0, 0, ty(TrbType::NoOpCmd))
    }

    pub fn enable_slot() -> Self {
        Self::new(0, 0, ty(TrbType::EnableSlot))
    }

    pub fn disable_slot(slot_id: u8) -> Self {
        Self::new(0, 0, (u32::from(slot_id) << 24) | ty(TrbType::DisableSlot))
    }

    pub fn address_device(slot_id: u8, input_ctx_ptr: u64) -> Self {
        assert_eq!(input_ctx_ptr & !0xF, input_ctx_ptr, "unaligned input context ptr");
        Self::new(input_ctx_ptr, 0, (u32::from(slot_id) << 24) | ty(TrbType::AddressDevice))
    }

    pub fn configure_endpoint(slot_id: u8, input_ctx_ptr: u64) -> Self {
        assert_eq!(input_ctx_ptr & !0xF, input_ctx_ptr, "unaligned input context ptr");
        Self::new(input_ctx_ptr, 0, (u32::from(slot_id) << 24) | ty(TrbType::ConfigureEndpoint))
    }

    pub fn evaluate_context(slot_id: u8, input_ctx_ptr: u64) -> Self {
        assert_eq!(input_ctx_ptr & !0xF, input_ctx_ptr, "unaligned input context ptr");
        Self::new(input_ctx_ptr, 0, (u32::from(slot_id) << 24) | ty(TrbType::EvaluateContext))
    }

    pub fn reset_endpoint(slot_id: u8, endp_num_xhc: u8) -> Self {
        Self::new(0, 0, slot_ep(slot_id, endp_num_xhc) | ty(TrbType::ResetEndpoint))
    }

    pub fn stop_endpoint(slot_id: u8, endp_num_xhc: u8) -> Self {
        Self::new(0, 0, slot_ep(slot_id, endp_num_xhc) | ty(TrbType::StopEndpoint))
    }

    /// The dequeue pointer has to carry the DCS bit (bit 0).
    pub fn set_tr_dequeue_ptr(slot_id: u8, endp_num_xhc: u8, deque_ptr: u64) -> Self {
        assert_eq!(deque_ptr & !0xE, deque_ptr);
        Self::new(deque_ptr, 0, slot_ep(slot_id, endp_num_xhc) | ty(TrbType::SetTrDequeuePointer))
    }

    pub fn setup(setup: usb::Setup, transfer: TransferKind) -> Self {
        Self::new(
            u64::from_le_bytes(setup.to_bytes()),
            8,
            ((transfer as u32) << 16) | ty(TrbType::SetupStage) | TRB_CONTROL_IDT | TRB_CONTROL_IOC,
        )
    }

    pub fn data(buffer: u64, length: u32, input: bool) -> Self {
        Self::new(
            buffer,
            length & TRB_STATUS_TRB_LENGTH_MASK,
            (u32::from(input) << 16) | ty(TrbType::DataStage) | TRB_CONTROL_IOC,
        )
    }

    pub fn status(input: bool) -> Self {
        Self::new(0, 0, (u32::from(input) << 16) | ty(TrbType::StatusStage) | TRB_CONTROL_IOC)
    }

    pub fn normal(buffer: u64, length: u32) -> Self {
        Self::new(
            buffer,
            length & TRB_STATUS_TRB_LENGTH_MASK,
            ty(TrbType::Normal) | TRB_CONTROL_IOC,
        )
    }

    /// An isochronous TD scheduled for the given 1 ms frame.
    pub fn isoch(buffer: u64, length: u32, frame: u32) -> Self {
        Self::new(
            buffer,
            length & TRB_STATUS_TRB_LENGTH_MASK,
            ty(TrbType::Isoch)
                | ((frame & TRB_CONTROL_FRAME_ID_MASK) << TRB_CONTROL_FRAME_ID_SHIFT)
                | TRB_CONTROL_IOC,
        )
    }
}

impl fmt::Debug for Trb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Trb {{ data: {:>016X}, status: {:>08X}, control: {:>08X} }}",
            self.data, self.status, self.control
        )
    }
}

impl fmt::Display for Trb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({:>016X}, {:>08X}, {:>08X})", self.data, self.status, self.control)
    }
}
