use common::io::{Io, Reg, RegisterWindow};

// RO - read-only
// ROS - read-only sticky
// RW - read/write
// RWS - read/write sticky
// RW1CS - read/write-1-to-clear sticky
// RW1S - read/write-1-to-set
// Sticky register values may preserve values through chip hardware reset

bitflags! {
    pub struct PortFlags: u32 {
        const CCS = 1 << 0; // ROS
        const PED = 1 << 1; // RW1CS
        const RSVD_2 = 1 << 2; // RsvdZ
        const OCA = 1 << 3; // RO
        const PR =  1 << 4; // RW1S
        const PLS_0 = 1 << 5; // RWS
        const PLS_1 = 1 << 6; // RWS
        const PLS_2 = 1 << 7; // RWS
        const PLS_3 = 1 << 8; // RWS
        const PP =  1 << 9; // RWS
        const SPEED_0 =  1 << 10; // ROS
        const SPEED_1 =  1 << 11; // ROS
        const SPEED_2 =  1 << 12; // ROS
        const SPEED_3 =  1 << 13; // ROS
        const PIC_AMB = 1 << 14; // RWS
        const PIC_GRN = 1 << 15; // RWS
        const LWS = 1 << 16; // RW
        const CSC = 1 << 17; // RW1CS
        const PEC = 1 << 18; // RW1CS
        const WRC = 1 << 19; // RW1CS
        const OCC = 1 << 20; // RW1CS
        const PRC = 1 << 21; // RW1CS
        const PLC = 1 << 22; // RW1CS
        const CEC = 1 << 23; // RW1CS
        const CAS = 1 << 24; // RO
        const WCE = 1 << 25; // RWS
        const WDE = 1 << 26; // RWS
        const WOE = 1 << 27; // RWS
        const RSVD_28 = 1 << 28; // RsvdZ
        const RSVD_29 = 1 << 29; // RsvdZ
        const DR =  1 << 30; // RO
        const WPR = 1 << 31; // RW1S

        const PLS = Self::PLS_0.bits | Self::PLS_1.bits | Self::PLS_2.bits | Self::PLS_3.bits;
    }
}

/// Protocol speed ID reported in PORTSC for the default speed mapping. XHC 7.2.2.1.1
pub const PORT_SPEED_LOW: u8 = 2;
pub const PORT_SPEED_HIGH: u8 = 3;

/// One port register set. XHC 5.4.8
pub struct Port<'a> {
    // This has write one to clear fields, do not expose it, handle writes carefully!
    portsc: Reg<'a>,
}

impl<'a> Port<'a> {
    pub fn new(window: &'a dyn RegisterWindow, offset: usize) -> Self {
        Self {
            portsc: Reg::new(window, offset),
        }
    }

    pub fn read(&self) -> u32 {
        self.portsc.read()
    }

    pub fn set_pr(&mut self) {
        let value = (self.flags_preserved() | PortFlags::PR).bits();
        self.portsc.write(value);
    }

    pub fn flags(&self) -> PortFlags {
        PortFlags::from_bits_truncate(self.read())
    }

    // Read only preserved flags
    pub fn flags_preserved(&self) -> PortFlags {
        // RO(S) and RW(S) bits should be preserved
        // RW1S and RW1CS bits should not
        let preserved = PortFlags::CCS
            | PortFlags::OCA
            | PortFlags::PLS
            | PortFlags::PP
            | PortFlags::SPEED_0
            | PortFlags::SPEED_1
            | PortFlags::SPEED_2
            | PortFlags::SPEED_3
            | PortFlags::PIC_AMB
            | PortFlags::PIC_GRN
            | PortFlags::WCE
            | PortFlags::WDE
            | PortFlags::WOE
            | PortFlags::DR;

        self.flags() & preserved
    }
}
