//! SATA primitives and the dword classification table.
//!
//! A primitive is a reserved 32-bit control symbol whose first byte is a K
//! character (K28.3 or K28.5). Everything else on the wire is data.

use core::fmt;

/// A reserved 32-bit link control symbol.
///
/// The discriminant is the literal wire code, so two primitives sharing a
/// code is rejected by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Primitive {
    /// Physical layer alignment, inserted by the PHY and ignored above it.
    Align = 0x7B4A_4ABC,
    /// Idle filler.
    Sync = 0xB5B5_957C,
    /// Transmitter has a frame ready.
    XRdy = 0x5757_B57C,
    /// Receiver is ready for a frame.
    RRdy = 0x4A4A_957C,
    /// Frame received without error.
    ROk = 0x3535_B57C,
    /// Frame received with an error.
    RErr = 0x5656_B57C,
    /// Reception in progress.
    RIp = 0x5555_B57C,
    /// The following dwords are filler standing in for a repeated primitive.
    Cont = 0x9999_AA7C,
    /// Waiting for frame termination.
    Wtrm = 0x5858_B57C,
    /// Start of frame.
    Sof = 0x3737_B57C,
    /// End of frame.
    Eof = 0xD5D5_B57C,
    /// Flow control: pause the frame.
    Hold = 0xD5D5_AA7C,
    /// Flow control: hold acknowledged.
    HoldA = 0x9595_AA7C,
    /// DMA terminate.
    Dmat = 0x3636_B57C,
    /// Partial power management request.
    PmReqP = 0x1717_B57C,
    /// Slumber power management request.
    PmReqS = 0x7575_957C,
    /// Power management acknowledge.
    PmAck = 0x9595_957C,
    /// Power management denial.
    PmNak = 0xF5F5_957C,
}

impl Primitive {
    /// Every entry of the primitive table.
    pub const ALL: [Primitive; 18] = [
        Primitive::Align,
        Primitive::Sync,
        Primitive::XRdy,
        Primitive::RRdy,
        Primitive::ROk,
        Primitive::RErr,
        Primitive::RIp,
        Primitive::Cont,
        Primitive::Wtrm,
        Primitive::Sof,
        Primitive::Eof,
        Primitive::Hold,
        Primitive::HoldA,
        Primitive::Dmat,
        Primitive::PmReqP,
        Primitive::PmReqS,
        Primitive::PmAck,
        Primitive::PmNak,
    ];

    /// The literal wire code.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Looks up the primitive carrying `code`.
    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0x7B4A_4ABC => Primitive::Align,
            0xB5B5_957C => Primitive::Sync,
            0x5757_B57C => Primitive::XRdy,
            0x4A4A_957C => Primitive::RRdy,
            0x3535_B57C => Primitive::ROk,
            0x5656_B57C => Primitive::RErr,
            0x5555_B57C => Primitive::RIp,
            0x9999_AA7C => Primitive::Cont,
            0x5858_B57C => Primitive::Wtrm,
            0x3737_B57C => Primitive::Sof,
            0xD5D5_B57C => Primitive::Eof,
            0xD5D5_AA7C => Primitive::Hold,
            0x9595_AA7C => Primitive::HoldA,
            0x3636_B57C => Primitive::Dmat,
            0x1717_B57C => Primitive::PmReqP,
            0x7575_957C => Primitive::PmReqS,
            0x9595_957C => Primitive::PmAck,
            0xF5F5_957C => Primitive::PmNak,
            _ => return None,
        })
    }

    /// Standard SATA mnemonic.
    pub const fn name(self) -> &'static str {
        match self {
            Primitive::Align => "ALIGN",
            Primitive::Sync => "SYNC",
            Primitive::XRdy => "X_RDY",
            Primitive::RRdy => "R_RDY",
            Primitive::ROk => "R_OK",
            Primitive::RErr => "R_ERR",
            Primitive::RIp => "R_IP",
            Primitive::Cont => "CONT",
            Primitive::Wtrm => "WTRM",
            Primitive::Sof => "SOF",
            Primitive::Eof => "EOF",
            Primitive::Hold => "HOLD",
            Primitive::HoldA => "HOLDA",
            Primitive::Dmat => "DMAT",
            Primitive::PmReqP => "PMREQ_P",
            Primitive::PmReqS => "PMREQ_S",
            Primitive::PmAck => "PMACK",
            Primitive::PmNak => "PMNAK",
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One symbol on the link: either a primitive or a data dword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dword {
    Primitive(Primitive),
    Data(u32),
}

impl Dword {
    /// The 32-bit value transmitted for this symbol.
    pub const fn raw(self) -> u32 {
        match self {
            Dword::Primitive(p) => p.code(),
            Dword::Data(d) => d,
        }
    }

    pub const fn is_data(self) -> bool {
        matches!(self, Dword::Data(_))
    }

    pub const fn primitive(self) -> Option<Primitive> {
        match self {
            Dword::Primitive(p) => Some(p),
            Dword::Data(_) => None,
        }
    }

    /// Whether this symbol is the primitive `p`.
    pub fn is(self, p: Primitive) -> bool {
        self == Dword::Primitive(p)
    }
}

impl From<Primitive> for Dword {
    fn from(p: Primitive) -> Self {
        Dword::Primitive(p)
    }
}

impl fmt::Display for Dword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dword::Primitive(p) => write!(f, "{p}"),
            Dword::Data(d) => write!(f, "{d:08x}"),
        }
    }
}

/// Classifies a raw 32-bit value against the primitive table.
pub const fn classify(raw: u32) -> Dword {
    match Primitive::from_code(raw) {
        Some(p) => Dword::Primitive(p),
        None => Dword::Data(raw),
    }
}
