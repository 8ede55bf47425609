//! ATA command set definitions used over the transport layer.

use alloc::{string::String, vec::Vec};
use core::fmt;

use bitfield_struct::bitfield;

pub const ATA_SECTOR_SIZE: usize = 512;

/// Device register value selecting LBA addressing.
pub const ATA_DEVICE_LBA: u8 = 1 << 6;

pub const ATA_ID_WORDS: usize = 256;
pub const ATA_ID_SERNO: usize = 10;
pub const ATA_ID_SERNO_LEN: usize = 20;
pub const ATA_ID_FW_REV: usize = 23;
pub const ATA_ID_FW_REV_LEN: usize = 8;
pub const ATA_ID_PROD: usize = 27;
pub const ATA_ID_PROD_LEN: usize = 40;
pub const ATA_ID_LBA48_SECTORS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum AtaCommand {
    /// 48-bit LBA DMA read. A count of 0 means 65536 sectors.
    READ_DMA_EXT = 0x25,
    /// 48-bit LBA DMA write. A count of 0 means 65536 sectors.
    WRITE_DMA_EXT = 0x35,
    /// Returns the 512-byte identify block through a DMA data phase.
    IDENTIFY_DEVICE_DMA = 0xEE,
}

impl TryFrom<u8> for AtaCommand {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x25 => Ok(AtaCommand::READ_DMA_EXT),
            0x35 => Ok(AtaCommand::WRITE_DMA_EXT),
            0xEE => Ok(AtaCommand::IDENTIFY_DEVICE_DMA),
            other => Err(other),
        }
    }
}

/// ATA status register.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct AtaStatus {
    /// An error occurred, see the error register.
    pub err: bool,
    #[bits(2)]
    __: u8,
    /// Data request.
    pub drq: bool,
    /// Device seek complete.
    pub dsc: bool,
    /// Device fault.
    pub df: bool,
    /// Device ready.
    pub drdy: bool,
    /// Busy.
    pub bsy: bool,
}

impl AtaStatus {
    /// Status reported by a ready device after a successful command.
    pub fn ready() -> Self {
        Self::new().with_drdy(true).with_dsc(true)
    }

    pub fn is_failed(&self) -> bool {
        self.err() || self.df()
    }
}

/// ATA error register.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct AtaError {
    /// Address mark not found.
    pub amnf: bool,
    /// Track 0 not found.
    pub tk0nf: bool,
    /// Command aborted.
    pub abrt: bool,
    /// Media change request.
    pub mcr: bool,
    /// ID not found.
    pub idnf: bool,
    /// Media changed.
    pub mc: bool,
    /// Uncorrectable data.
    pub unc: bool,
    /// Interface CRC error.
    pub icrc: bool,
}

/// Reads an ATA string. Each word holds two characters, high byte first.
pub fn ata_id_to_string(id: &[u16], ofs: usize, len: usize) -> String {
    let bytes: Vec<u8> = id
        .iter()
        .skip(ofs)
        .take(len / 2)
        .flat_map(|w| w.to_be_bytes())
        .collect();
    String::from_utf8_lossy(&bytes)
        .trim_end_matches([' ', '\0'])
        .into()
}

fn string_to_ata_id(id: &mut [u16], ofs: usize, len: usize, s: &str) {
    let mut bytes = s.bytes().chain(core::iter::repeat(b' '));
    for word in id.iter_mut().skip(ofs).take(len / 2) {
        let hi = bytes.next().unwrap_or(b' ');
        let lo = bytes.next().unwrap_or(b' ');
        *word = u16::from_be_bytes([hi, lo]);
    }
}

/// The 256-word block returned by IDENTIFY DEVICE.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentifyBlock {
    words: [u16; ATA_ID_WORDS],
}

impl IdentifyBlock {
    pub fn from_words(words: [u16; ATA_ID_WORDS]) -> Self {
        Self { words }
    }

    /// Block whose word `i` holds `i`.
    pub fn pattern() -> Self {
        Self {
            words: core::array::from_fn(|i| i as u16),
        }
    }

    /// Parses a little-endian byte image, `None` when it is short.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..ATA_ID_WORDS * 2)?;
        let mut words = [0; ATA_ID_WORDS];
        for (w, b) in words.iter_mut().zip(bytes.chunks_exact(2)) {
            *w = u16::from_le_bytes([b[0], b[1]]);
        }
        Some(Self { words })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    pub fn words(&self) -> &[u16; ATA_ID_WORDS] {
        &self.words
    }

    pub fn model(&self) -> String {
        ata_id_to_string(&self.words, ATA_ID_PROD, ATA_ID_PROD_LEN)
    }

    pub fn serial(&self) -> String {
        ata_id_to_string(&self.words, ATA_ID_SERNO, ATA_ID_SERNO_LEN)
    }

    pub fn firmware_revision(&self) -> String {
        ata_id_to_string(&self.words, ATA_ID_FW_REV, ATA_ID_FW_REV_LEN)
    }

    pub fn lba48_sectors(&self) -> u64 {
        self.words[ATA_ID_LBA48_SECTORS..ATA_ID_LBA48_SECTORS + 4]
            .iter()
            .rev()
            .fold(0, |acc, &w| (acc << 16) | u64::from(w))
    }

    pub fn with_model(mut self, model: &str) -> Self {
        string_to_ata_id(&mut self.words, ATA_ID_PROD, ATA_ID_PROD_LEN, model);
        self
    }

    pub fn with_serial(mut self, serial: &str) -> Self {
        string_to_ata_id(&mut self.words, ATA_ID_SERNO, ATA_ID_SERNO_LEN, serial);
        self
    }

    pub fn with_firmware_revision(mut self, rev: &str) -> Self {
        string_to_ata_id(&mut self.words, ATA_ID_FW_REV, ATA_ID_FW_REV_LEN, rev);
        self
    }

    pub fn with_lba48_sectors(mut self, sectors: u64) -> Self {
        for (i, w) in self.words[ATA_ID_LBA48_SECTORS..ATA_ID_LBA48_SECTORS + 4]
            .iter_mut()
            .enumerate()
        {
            *w = (sectors >> (16 * i)) as u16;
        }
        self
    }
}

impl Default for IdentifyBlock {
    fn default() -> Self {
        Self::pattern()
    }
}

impl fmt::Debug for IdentifyBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentifyBlock")
            .field("model", &self.model())
            .field("serial", &self.serial())
            .field("firmware_revision", &self.firmware_revision())
            .field("lba48_sectors", &self.lba48_sectors())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_register_bits() {
        assert_eq!(AtaStatus::ready().into_bits(), 0x50);
        let failed = AtaStatus::from_bits(0x51);
        assert!(failed.err());
        assert!(failed.is_failed());
        assert!(!AtaStatus::ready().is_failed());
    }

    #[test]
    fn error_register_bits() {
        let e = AtaError::new().with_icrc(true).with_abrt(true);
        assert_eq!(e.into_bits(), 0x84);
    }

    #[test]
    fn commands_decode() {
        assert_eq!(AtaCommand::try_from(0x35), Ok(AtaCommand::WRITE_DMA_EXT));
        assert_eq!(AtaCommand::try_from(0xEC), Err(0xEC));
        assert_eq!(AtaCommand::IDENTIFY_DEVICE_DMA as u8, 0xEE);
    }

    #[test]
    fn identify_strings_are_byte_swapped() {
        let id = IdentifyBlock::pattern()
            .with_model("SIMPLE SATA DRIVE")
            .with_serial("0123456789")
            .with_firmware_revision("1.0");
        assert_eq!(id.model(), "SIMPLE SATA DRIVE");
        assert_eq!(id.serial(), "0123456789");
        assert_eq!(id.firmware_revision(), "1.0");
        assert_eq!(id.words()[ATA_ID_PROD], u16::from_be_bytes(*b"SI"));
        assert_eq!(id.words()[0], 0);
    }

    #[test]
    fn identify_capacity_and_bytes() {
        let id = IdentifyBlock::pattern().with_lba48_sectors(0x0001_0002_0003);
        assert_eq!(id.lba48_sectors(), 0x0001_0002_0003);
        let bytes = id.to_bytes();
        assert_eq!(bytes.len(), 512);
        assert_eq!(IdentifyBlock::from_bytes(&bytes), Some(id));
        assert_eq!(IdentifyBlock::from_bytes(&bytes[..511]), None);
    }
}
