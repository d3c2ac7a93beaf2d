use common::io::{ReadOnly, Reg, RegisterWindow};

/// The memory-mapped Capability Registers of the XHCI
///
/// These are read-only registers that specify the capabilities
/// of the host controller implementation.
///
/// They are used by the driver to determine what subsystems to
/// configure during initialization.
///
/// See XHCI Section 5.3. Table 5-9 describes the offsets of the registers
/// in memory.
pub struct CapabilityRegs<'a> {
    /// CAPLENGTH in the low byte, HCIVERSION in the upper half.
    ///
    /// The operational registers start CAPLENGTH bytes after the base of the window. A value of
    /// all ones means the device no longer decodes its BAR.
    ///
    /// CAPLENGTH and HCIVERSION in XHC Table 5-9. See XHC 5.3.1 and 5.3.2
    pub len: ReadOnly<Reg<'a>>,
    /// The HCI Structural Parameters 1 Register.
    ///
    /// - Bits 0-7 describe the number of device slots supported by this controller
    /// - Bits 8-18 describe the number of interrupters supported by this controller
    /// - Bits 19-23 are reserved
    /// - Bits 24-31 specify the maximum number of ports supported by this controller.
    ///
    /// HCSPARAMS1 in XHC Table 5-9. See 5.3.3
    pub hcs_params1: ReadOnly<Reg<'a>>,
    /// The HCI Structural Parameters 2 Register.
    ///
    /// - Bits 0-3 describe the Isochronus Scheduling Threshold (IST)
    /// - Bits 4-7 describe the Event Ring Segment Table Max (ERST Max).
    /// - Bits 21-25 describe the high order five bits of the maximum number of scratchpad buffers
    /// - Bit 26 is the Scratchpad Restore Buffer (SPR). (See XHC 4.23.2)
    /// - Bits 27-31 describe the low order five bits of the maximum number of scratchpad buffers
    ///
    /// HCSPARAMS2 in XHC Table 5-9. See 5.3.4
    pub hcs_params2: ReadOnly<Reg<'a>>,
    /// HCSPARAMS3 in XHC Table 5-9. See XHC 5.3.5
    pub hcs_params3: ReadOnly<Reg<'a>>,
    /// The HCI Capability Parameters 1 Register.
    ///
    /// - Bit 0 is the 64-bit Address Capability Flag (AC64).
    /// - Bit 2 is the Context Size Flag (CSZ). 0 = 32-byte, 1 = 64-byte Context Data Structures
    /// - Bits 16-31 The xHCI Extended Capabilities Pointer (xECP), in dwords from the base.
    ///
    /// HCCPARAMS1 in XHC Table 5-9. See XHC 5.3.6
    pub hcc_params1: ReadOnly<Reg<'a>>,
    /// The Doorbell Offset Register. Bits 2-31 contain the offset of the doorbell array.
    ///
    /// DBOFF in XHC Table 5-9. See XHC 5.3.7
    pub db_offset: ReadOnly<Reg<'a>>,
    /// The Runtime Register Space Offset. Bits 5-31 contain the offset.
    ///
    /// RTSOFF in XHC Table 5-9. See XHC 5.3.8
    pub rts_offset: ReadOnly<Reg<'a>>,
    /// HCCPARAMS2 in XHC Table 5-9. See XHC 5.3.9
    pub hcc_params2: ReadOnly<Reg<'a>>,
}

/// The mask to use to get the AC64 bit from HCCPARAMS1. See [CapabilityRegs]
pub const HCC_PARAMS1_AC64_BIT: u32 = 1 << HCC_PARAMS1_AC64_SHIFT;
/// The shift to use to get the AC64 bit from HCCPARAMS1. See [CapabilityRegs]
pub const HCC_PARAMS1_AC64_SHIFT: u8 = 0;
/// The mask to use to get the CSZ bit from HCCPARAMS1. See [CapabilityRegs]
pub const HCC_PARAMS1_CSZ_BIT: u32 = 1 << HCC_PARAMS1_CSZ_SHIFT;
/// The shift to use to get the CSZ bit from HCCPARAMS1. See [CapabilityRegs]
pub const HCC_PARAMS1_CSZ_SHIFT: u8 = 2;
/// The mask to use to get the xECP field from HCCPARAMS1. See [CapabilityRegs]
pub const HCC_PARAMS1_XECP_MASK: u32 = 0xFFFF_0000;
/// The shift to use to get the xECP field from HCCPARAMS1. See [CapabilityRegs]
pub const HCC_PARAMS1_XECP_SHIFT: u8 = 16;

/// The mask to get the MaxSlots field from HCSPARAMS1. See [CapabilityRegs]
pub const HCS_PARAMS1_MAX_SLOTS_MASK: u32 = 0x0000_00FF;
/// The shift to get the MaxSlots field from HCSPARAMS1. See [CapabilityRegs]
pub const HCS_PARAMS1_MAX_SLOTS_SHIFT: u8 = 0;
/// The mask to get the MaxIntrs field from HCSPARAMS1. See [CapabilityRegs]
pub const HCS_PARAMS1_MAX_INTRS_MASK: u32 = 0x0007_FF00;
/// The shift to get the MaxIntrs field from HCSPARAMS1. See [CapabilityRegs]
pub const HCS_PARAMS1_MAX_INTRS_SHIFT: u8 = 8;
/// The mask to get the MaxPorts field from HCSPARAMS1. See [CapabilityRegs]
pub const HCS_PARAMS1_MAX_PORTS_MASK: u32 = 0xFF00_0000;
/// The shift to get the MaxPorts field from HCSPARAMS1. See [CapabilityRegs]
pub const HCS_PARAMS1_MAX_PORTS_SHIFT: u8 = 24;

/// The mask to get the Max Scratchpad Buffers (Lo) field from HCSPARAMS2.
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_MASK: u32 = 0xF800_0000;
/// The shift to get the Max Scratchpad Buffers (Lo) field from HCSPARAMS2.
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_SHIFT: u8 = 27;
/// The mask to get the Max Scratchpad Buffers (Hi) field from HCSPARAMS2.
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_MASK: u32 = 0x03E0_0000;
/// The shift to get the Max Scratchpad Buffers (Hi) field from HCSPARAMS2.
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_SHIFT: u8 = 21;

impl<'a> CapabilityRegs<'a> {
    pub fn new(window: &'a dyn RegisterWindow) -> Self {
        let reg = |offset| ReadOnly::new(Reg::new(window, offset));
        Self {
            len: reg(0x00),
            hcs_params1: reg(0x04),
            hcs_params2: reg(0x08),
            hcs_params3: reg(0x0C),
            hcc_params1: reg(0x10),
            db_offset: reg(0x14),
            rts_offset: reg(0x18),
            hcc_params2: reg(0x1C),
        }
    }

    /// Whether the capability registers read as all ones, i.e. the controller is gone.
    pub fn vanished(&self) -> bool {
        self.len.read() == !0
    }

    /// Byte offset of the operational registers.
    pub fn caplength(&self) -> usize {
        (self.len.read() & 0xFF) as usize
    }

    pub fn hci_ver(&self) -> u16 {
        (self.len.read() >> 16) as u16
    }

    pub fn ac64(&self) -> bool {
        self.hcc_params1.readf(HCC_PARAMS1_AC64_BIT)
    }

    /// 1 for 64-byte contexts, 0 for 32-byte ones.
    pub fn csz(&self) -> u32 {
        self.hcc_params1.readf(HCC_PARAMS1_CSZ_BIT) as u32
    }

    pub fn max_slots(&self) -> u8 {
        ((self.hcs_params1.read() & HCS_PARAMS1_MAX_SLOTS_MASK) >> HCS_PARAMS1_MAX_SLOTS_SHIFT)
            as u8
    }

    pub fn max_interrupters(&self) -> u16 {
        ((self.hcs_params1.read() & HCS_PARAMS1_MAX_INTRS_MASK) >> HCS_PARAMS1_MAX_INTRS_SHIFT)
            as u16
    }

    pub fn max_ports(&self) -> u8 {
        ((self.hcs_params1.read() & HCS_PARAMS1_MAX_PORTS_MASK) >> HCS_PARAMS1_MAX_PORTS_SHIFT)
            as u8
    }

    /// The number of scratchpad pages the controller wants, from the two halves in HCSPARAMS2.
    pub fn max_scratchpad_bufs(&self) -> u32 {
        let params = self.hcs_params2.read();
        let lo = (params & HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_MASK)
            >> HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_SHIFT;
        let hi = (params & HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_MASK)
            >> HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_SHIFT;
        hi << 5 | lo
    }

    /// The offset of the first extended capability, in dwords from the base. 0 means none.
    pub fn ext_caps_ptr_in_dwords(&self) -> u16 {
        ((self.hcc_params1.read() & HCC_PARAMS1_XECP_MASK) >> HCC_PARAMS1_XECP_SHIFT) as u16
    }

    pub fn db_offset(&self) -> usize {
        (self.db_offset.read() & !0x3) as usize
    }

    pub fn rts_offset(&self) -> usize {
        (self.rts_offset.read() & !0x1F) as usize
    }
}
