//! Frame Information Structures.
//!
//! Each FIS is a fixed dword buffer with a table of [`FisField`]s locating
//! its named fields. Values are built with the `with_*` methods and are
//! immutable afterwards.

use alloc::vec::Vec;
use core::fmt;

use log::{debug, warn};
use thiserror::Error;

/// Position of a field inside a FIS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FisField {
    pub word: usize,
    pub offset: u32,
    pub width: u32,
}

impl FisField {
    pub const fn new(word: usize, offset: u32, width: u32) -> Self {
        Self {
            word,
            offset,
            width,
        }
    }

    pub const fn mask(&self) -> u32 {
        (u32::MAX >> (32 - self.width)) << self.offset
    }

    /// Reads the field, zero when `raw` is too short to hold it.
    pub fn get(&self, raw: &[u32]) -> u32 {
        raw.get(self.word)
            .map_or(0, |w| (w & self.mask()) >> self.offset)
    }

    /// Writes the low `width` bits of `value`; other bits are untouched.
    pub fn set(&self, raw: &mut [u32], value: u32) {
        if let Some(w) = raw.get_mut(self.word) {
            *w = (*w & !self.mask()) | ((value << self.offset) & self.mask());
        }
    }
}

/// The type byte shared by every FIS.
pub const FIS_TYPE: FisField = FisField::new(0, 0, 8);

const fn layout_is_valid(fields: &[(&str, FisField)], length: usize) -> bool {
    let mut i = 0;
    while i < fields.len() {
        let a = fields[i].1;
        if a.width == 0 || a.offset + a.width > 32 || a.word >= length {
            return false;
        }
        let mut j = i + 1;
        while j < fields.len() {
            let b = fields[j].1;
            if a.word == b.word && a.mask() & b.mask() != 0 {
                return false;
            }
            j += 1;
        }
        i += 1;
    }
    true
}

trait FieldValue {
    fn from_field(raw: u32) -> Self;
    fn into_field(self) -> u32;
}

impl FieldValue for bool {
    fn from_field(raw: u32) -> Self {
        raw != 0
    }
    fn into_field(self) -> u32 {
        self as u32
    }
}

macro_rules! impl_field_value {
    ($($ty:ty),*) => {
        $(
            impl FieldValue for $ty {
                fn from_field(raw: u32) -> Self {
                    raw as $ty
                }
                fn into_field(self) -> u32 {
                    self as u32
                }
            }
        )*
    };
}

impl_field_value!(u8, u16, u32);

macro_rules! fis_layout {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $fis_type:expr, $len:literal {
            $(
                $(#[$fmeta:meta])*
                $field:ident / $with:ident: $ty:ty = ($word:literal, $offset:literal, $width:literal),
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            raw: [u32; $len],
        }

        impl $name {
            pub const LENGTH: usize = $len;

            pub const FIELDS: &'static [(&'static str, FisField)] = &[
                ("fis_type", FIS_TYPE),
                $((stringify!($field), FisField::new($word, $offset, $width)),)*
            ];

            pub fn new() -> Self {
                let mut raw = [0u32; $len];
                FIS_TYPE.set(&mut raw, $fis_type as u32);
                Self { raw }
            }

            pub fn from_raw(raw: [u32; $len]) -> Self {
                Self { raw }
            }

            pub fn raw(&self) -> &[u32; $len] {
                &self.raw
            }

            pub fn fis_type(&self) -> u8 {
                FIS_TYPE.get(&self.raw) as u8
            }

            /// Looks a field up by name.
            pub fn field(&self, name: &str) -> Option<u32> {
                Self::FIELDS
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, f)| f.get(&self.raw))
            }

            $(
                $(#[$fmeta])*
                pub fn $field(&self) -> $ty {
                    <$ty as FieldValue>::from_field(
                        FisField::new($word, $offset, $width).get(&self.raw),
                    )
                }

                pub fn $with(mut self, value: $ty) -> Self {
                    FisField::new($word, $offset, $width).set(&mut self.raw, value.into_field());
                    self
                }
            )*
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut s = f.debug_struct(stringify!($name));
                $(s.field(stringify!($field), &self.$field());)*
                s.finish()
            }
        }

        const _: () = assert!(layout_is_valid($name::FIELDS, $len));
    };
}

/// Splits a 48-bit LBA into its `lba_lsb`/`lba_msb` halves.
const fn split_lba(lba: u64) -> (u32, u32) {
    ((lba & 0xFF_FFFF) as u32, ((lba >> 24) & 0xFF_FFFF) as u32)
}

const fn join_lba(lsb: u32, msb: u32) -> u64 {
    (lsb as u64) | ((msb as u64) << 24)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FisType {
    RegH2d = 0x27,
    RegD2h = 0x34,
    DmaActivateD2h = 0x39,
    DmaSetup = 0x41,
    Data = 0x46,
    PioSetupD2h = 0x5F,
    SetDeviceBits = 0xA1,
}

impl TryFrom<u8> for FisType {
    type Error = FisError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0x27 => FisType::RegH2d,
            0x34 => FisType::RegD2h,
            0x39 => FisType::DmaActivateD2h,
            0x41 => FisType::DmaSetup,
            0x46 => FisType::Data,
            0x5F => FisType::PioSetupD2h,
            0xA1 => FisType::SetDeviceBits,
            _ => return Err(FisError::UnknownFisType(code)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FisError {
    #[error("unknown FIS type {0:#04x}")]
    UnknownFisType(u8),
    #[error("FIS type {fis_type:#04x} needs {expected} dwords, frame has {actual}")]
    MalformedFrame {
        fis_type: u8,
        expected: usize,
        actual: usize,
    },
    #[error("empty frame")]
    EmptyFrame,
}

fis_layout! {
    /// Register FIS, host to device.
    pub struct RegH2d: FisType::RegH2d, 5 {
        pm_port / with_pm_port: u8 = (0, 8, 4),
        /// Set when the FIS updates the command register.
        c / with_c: bool = (0, 15, 1),
        command / with_command: u8 = (0, 16, 8),
        features_lsb / with_features_lsb: u8 = (0, 24, 8),
        lba_lsb / with_lba_lsb: u32 = (1, 0, 24),
        device / with_device: u8 = (1, 24, 8),
        lba_msb / with_lba_msb: u32 = (2, 0, 24),
        features_msb / with_features_msb: u8 = (2, 24, 8),
        count / with_count: u16 = (3, 0, 16),
        icc / with_icc: u8 = (3, 16, 8),
        control / with_control: u8 = (3, 24, 8),
    }
}

impl RegH2d {
    pub fn lba(&self) -> u64 {
        join_lba(self.lba_lsb(), self.lba_msb())
    }

    pub fn with_lba(self, lba: u64) -> Self {
        let (lsb, msb) = split_lba(lba);
        self.with_lba_lsb(lsb).with_lba_msb(msb)
    }

    pub fn features(&self) -> u16 {
        u16::from_le_bytes([self.features_lsb(), self.features_msb()])
    }

    pub fn with_features(self, features: u16) -> Self {
        let [lsb, msb] = features.to_le_bytes();
        self.with_features_lsb(lsb).with_features_msb(msb)
    }
}

fis_layout! {
    /// Register FIS, device to host.
    pub struct RegD2h: FisType::RegD2h, 5 {
        pm_port / with_pm_port: u8 = (0, 8, 4),
        /// Interrupt.
        i / with_i: bool = (0, 14, 1),
        status / with_status: u8 = (0, 16, 8),
        error / with_error: u8 = (0, 24, 8),
        lba_lsb / with_lba_lsb: u32 = (1, 0, 24),
        device / with_device: u8 = (1, 24, 8),
        lba_msb / with_lba_msb: u32 = (2, 0, 24),
        count / with_count: u16 = (3, 0, 16),
    }
}

impl RegD2h {
    pub fn lba(&self) -> u64 {
        join_lba(self.lba_lsb(), self.lba_msb())
    }

    pub fn with_lba(self, lba: u64) -> Self {
        let (lsb, msb) = split_lba(lba);
        self.with_lba_lsb(lsb).with_lba_msb(msb)
    }
}

fis_layout! {
    /// Sent by the device to request the next burst of write data.
    pub struct DmaActivateD2h: FisType::DmaActivateD2h, 1 {
        pm_port / with_pm_port: u8 = (0, 8, 4),
    }
}

fis_layout! {
    pub struct DmaSetup: FisType::DmaSetup, 7 {
        pm_port / with_pm_port: u8 = (0, 8, 4),
        /// Direction, set for device to host.
        d / with_d: bool = (0, 13, 1),
        i / with_i: bool = (0, 14, 1),
        /// Auto-activate.
        a / with_a: bool = (0, 15, 1),
        buffer_id_lsb / with_buffer_id_lsb: u32 = (1, 0, 32),
        buffer_id_msb / with_buffer_id_msb: u32 = (2, 0, 32),
        buffer_offset / with_buffer_offset: u32 = (4, 0, 32),
        transfer_count / with_transfer_count: u32 = (5, 0, 32),
    }
}

impl DmaSetup {
    pub fn buffer_id(&self) -> u64 {
        u64::from(self.buffer_id_lsb()) | (u64::from(self.buffer_id_msb()) << 32)
    }

    pub fn with_buffer_id(self, id: u64) -> Self {
        self.with_buffer_id_lsb(id as u32)
            .with_buffer_id_msb((id >> 32) as u32)
    }
}

fis_layout! {
    /// First dword of a Data FIS.
    pub struct DataHeader: FisType::Data, 1 {
        pm_port / with_pm_port: u8 = (0, 8, 4),
    }
}

fis_layout! {
    pub struct PioSetupD2h: FisType::PioSetupD2h, 5 {
        pm_port / with_pm_port: u8 = (0, 8, 4),
        d / with_d: bool = (0, 13, 1),
        i / with_i: bool = (0, 14, 1),
        status / with_status: u8 = (0, 16, 8),
        error / with_error: u8 = (0, 24, 8),
        lba_lsb / with_lba_lsb: u32 = (1, 0, 24),
        device / with_device: u8 = (1, 24, 8),
        lba_msb / with_lba_msb: u32 = (2, 0, 24),
        count / with_count: u16 = (3, 0, 16),
        /// Status register value at the end of the transfer.
        e_status / with_e_status: u8 = (3, 24, 8),
        transfer_count / with_transfer_count: u16 = (4, 0, 16),
    }
}

fis_layout! {
    pub struct SetDeviceBits: FisType::SetDeviceBits, 2 {
        pm_port / with_pm_port: u8 = (0, 8, 4),
        i / with_i: bool = (0, 14, 1),
        /// Notification.
        n / with_n: bool = (0, 15, 1),
        status_lo / with_status_lo: u8 = (0, 16, 3),
        status_hi / with_status_hi: u8 = (0, 20, 3),
        error / with_error: u8 = (0, 24, 8),
        protocol_specific / with_protocol_specific: u32 = (1, 0, 32),
    }
}

/// Data FIS: a header dword followed by the payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataFis {
    pub header: DataHeader,
    pub payload: Vec<u32>,
}

impl DataFis {
    pub fn new(payload: Vec<u32>) -> Self {
        Self {
            header: DataHeader::new(),
            payload,
        }
    }

    /// Packs bytes little-endian into dwords, zero padding the last one.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let payload = bytes
            .chunks(4)
            .map(|chunk| {
                let mut word = [0; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                u32::from_le_bytes(word)
            })
            .collect();
        Self::new(payload)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.payload.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fis {
    RegH2d(RegH2d),
    RegD2h(RegD2h),
    DmaActivateD2h(DmaActivateD2h),
    DmaSetup(DmaSetup),
    Data(DataFis),
    PioSetupD2h(PioSetupD2h),
    SetDeviceBits(SetDeviceBits),
    /// Unrecognized type; the frame is kept as received.
    Unknown(Vec<u32>),
}

impl Fis {
    pub fn fis_type(&self) -> Option<FisType> {
        Some(match self {
            Fis::RegH2d(_) => FisType::RegH2d,
            Fis::RegD2h(_) => FisType::RegD2h,
            Fis::DmaActivateD2h(_) => FisType::DmaActivateD2h,
            Fis::DmaSetup(_) => FisType::DmaSetup,
            Fis::Data(_) => FisType::Data,
            Fis::PioSetupD2h(_) => FisType::PioSetupD2h,
            Fis::SetDeviceBits(_) => FisType::SetDeviceBits,
            Fis::Unknown(_) => return None,
        })
    }

    /// Decodes a frame payload. Unknown types decode to [`Fis::Unknown`];
    /// frames shorter than their layout are rejected.
    pub fn decode(frame: &[u32]) -> Result<Self, FisError> {
        let first = *frame.first().ok_or(FisError::EmptyFrame)?;
        let code = FIS_TYPE.get(&[first]) as u8;
        let fis_type = match FisType::try_from(code) {
            Ok(t) => t,
            Err(e) => {
                warn!("{e}, keeping {} raw dwords", frame.len());
                return Ok(Fis::Unknown(frame.to_vec()));
            }
        };

        let fis = match fis_type {
            FisType::RegH2d => Fis::RegH2d(RegH2d::from_raw(header(frame, code)?)),
            FisType::RegD2h => Fis::RegD2h(RegD2h::from_raw(header(frame, code)?)),
            FisType::DmaActivateD2h => {
                Fis::DmaActivateD2h(DmaActivateD2h::from_raw(header(frame, code)?))
            }
            FisType::DmaSetup => Fis::DmaSetup(DmaSetup::from_raw(header(frame, code)?)),
            FisType::Data => Fis::Data(DataFis {
                header: DataHeader::from_raw([first]),
                payload: frame[1..].to_vec(),
            }),
            FisType::PioSetupD2h => Fis::PioSetupD2h(PioSetupD2h::from_raw(header(frame, code)?)),
            FisType::SetDeviceBits => {
                Fis::SetDeviceBits(SetDeviceBits::from_raw(header(frame, code)?))
            }
        };
        Ok(fis)
    }

    pub fn encode(&self) -> Vec<u32> {
        match self {
            Fis::RegH2d(f) => f.raw().to_vec(),
            Fis::RegD2h(f) => f.raw().to_vec(),
            Fis::DmaActivateD2h(f) => f.raw().to_vec(),
            Fis::DmaSetup(f) => f.raw().to_vec(),
            Fis::Data(f) => {
                let mut frame = Vec::with_capacity(1 + f.payload.len());
                frame.extend_from_slice(f.header.raw());
                frame.extend_from_slice(&f.payload);
                frame
            }
            Fis::PioSetupD2h(f) => f.raw().to_vec(),
            Fis::SetDeviceBits(f) => f.raw().to_vec(),
            Fis::Unknown(raw) => raw.clone(),
        }
    }
}

fn header<const N: usize>(frame: &[u32], fis_type: u8) -> Result<[u32; N], FisError> {
    if frame.len() > N {
        debug!("ignoring {} trailing dwords after FIS {fis_type:#04x}", frame.len() - N);
    }
    frame
        .get(..N)
        .and_then(|h| h.try_into().ok())
        .ok_or(FisError::MalformedFrame {
            fis_type,
            expected: N,
            actual: frame.len(),
        })
}

macro_rules! impl_from_fis {
    ($($variant:ident($ty:ty)),*) => {
        $(
            impl From<$ty> for Fis {
                fn from(fis: $ty) -> Self {
                    Fis::$variant(fis)
                }
            }
        )*
    };
}

impl_from_fis!(
    RegH2d(RegH2d),
    RegD2h(RegD2h),
    DmaActivateD2h(DmaActivateD2h),
    DmaSetup(DmaSetup),
    Data(DataFis),
    PioSetupD2h(PioSetupD2h),
    SetDeviceBits(SetDeviceBits)
);
