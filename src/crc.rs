//! SATA frame CRC.
//!
//! CRC-32 with the IEEE polynomial, seeded with `0x52325032`, computed
//! MSB-first over whole dwords before scrambling. The per-dword step is a set
//! of 32 XOR parity equations derived from the polynomial at compile time.

use alloc::vec::Vec;

use crate::link::LinkError;

pub const SATA_CRC_POLYNOMIAL: u32 = 0x04C1_1DB7;
pub const SATA_CRC_INIT: u32 = 0x5232_5032;
/// State left in the engine after a frame and its correct trailer.
pub const SATA_CRC_CHECK: u32 = 0x0000_0000;

/// Row `i` selects the bits of `state ^ dword` whose parity is bit `i` of the
/// next state.
const EQUATIONS: [u32; 32] = lfsr_equations(SATA_CRC_POLYNOMIAL);

/// Clocks a single-bit input through 32 shifts of the serial LFSR.
const fn serial_step(mut value: u32, polynomial: u32) -> u32 {
    let mut i = 0;
    while i < 32 {
        value = if value & 0x8000_0000 != 0 {
            (value << 1) ^ polynomial
        } else {
            value << 1
        };
        i += 1;
    }
    value
}

const fn lfsr_equations(polynomial: u32) -> [u32; 32] {
    let mut rows = [0u32; 32];
    let mut input = 0;
    while input < 32 {
        let column = serial_step(1 << input, polynomial);
        let mut out = 0;
        while out < 32 {
            if column & (1 << out) != 0 {
                rows[out] |= 1 << input;
            }
            out += 1;
        }
        input += 1;
    }
    rows
}

/// Next CRC state after absorbing `dword`.
pub const fn next_state(state: u32, dword: u32) -> u32 {
    let x = state ^ dword;
    let mut next = 0;
    let mut i = 0;
    while i < 32 {
        next |= ((x & EQUATIONS[i]).count_ones() & 1) << i;
        i += 1;
    }
    next
}

/// Running CRC over a dword stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcEngine {
    state: u32,
}

impl Default for CrcEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CrcEngine {
    pub const fn new() -> Self {
        Self {
            state: SATA_CRC_INIT,
        }
    }

    pub fn reset(&mut self) {
        self.state = SATA_CRC_INIT;
    }

    pub fn update(&mut self, dword: u32) -> u32 {
        self.state = next_state(self.state, dword);
        self.state
    }

    pub const fn value(&self) -> u32 {
        self.state
    }
}

/// Computes the trailer appended to an outbound frame.
#[derive(Debug, Default, Clone)]
pub struct CrcInserter {
    engine: CrcEngine,
}

impl CrcInserter {
    pub fn reset(&mut self) {
        self.engine.reset();
    }

    /// Feeds one payload dword and passes it through unchanged.
    pub fn push(&mut self, dword: u32) -> u32 {
        self.engine.update(dword);
        dword
    }

    /// The trailer for everything pushed since the last reset.
    pub fn trailer(&self) -> u32 {
        self.engine.value()
    }

    /// Returns `payload` followed by its CRC trailer.
    #[allow(dead_code)]
    pub fn insert(payload: &[u32]) -> Vec<u32> {
        let mut inserter = Self::default();
        let mut frame: Vec<u32> = payload.iter().map(|&d| inserter.push(d)).collect();
        frame.push(inserter.trailer());
        frame
    }
}

/// Verifies inbound frames, trailer included.
#[derive(Debug, Default, Clone)]
pub struct CrcChecker {
    engine: CrcEngine,
    seen: usize,
}

impl CrcChecker {
    pub fn reset(&mut self) {
        self.engine.reset();
        self.seen = 0;
    }

    pub fn push(&mut self, dword: u32) {
        self.engine.update(dword);
        self.seen += 1;
    }

    /// Result for everything pushed since the last reset, the last dword
    /// being the trailer.
    pub fn finish(&self) -> Result<(), LinkError> {
        if self.seen == 0 {
            return Err(LinkError::MalformedFrame);
        }
        if self.engine.value() != SATA_CRC_CHECK {
            return Err(LinkError::Crc);
        }
        Ok(())
    }

    /// Checks a complete frame and returns its payload with the trailer
    /// stripped.
    #[allow(dead_code)]
    pub fn check(frame: &[u32]) -> Result<&[u32], LinkError> {
        let (&trailer, payload) = frame.split_last().ok_or(LinkError::MalformedFrame)?;
        let mut engine = CrcEngine::new();
        for &d in payload {
            engine.update(d);
        }
        if engine.value() != trailer {
            return Err(LinkError::Crc);
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrambler::Scrambler;
    use alloc::vec;

    fn bitwise(frame: &[u32]) -> u32 {
        frame.iter().fold(SATA_CRC_INIT, |crc, &d| {
            serial_step(crc ^ d, SATA_CRC_POLYNOMIAL)
        })
    }

    fn pseudo_random(len: usize) -> Vec<u32> {
        let mut s = Scrambler::new();
        (0..len).map(|_| s.scramble(0)).collect()
    }

    #[test]
    fn parallel_equations_match_serial_lfsr() {
        for len in [0, 1, 5, 64, 257] {
            let frame = pseudo_random(len);
            let mut engine = CrcEngine::new();
            for &d in &frame {
                engine.update(d);
            }
            assert_eq!(engine.value(), bitwise(&frame));
        }
    }

    #[test]
    fn known_vector() {
        assert_eq!(CrcEngine::new().value(), 0x5232_5032);
        let mut engine = CrcEngine::new();
        assert_eq!(engine.update(0x0030_8027), 0x11E3_53FD);
    }

    #[test]
    fn inserted_frames_check_clean() {
        for len in [1, 2, 17, 512] {
            let payload = pseudo_random(len);
            let frame = CrcInserter::insert(&payload);
            assert_eq!(CrcChecker::check(&frame), Ok(&payload[..]));

            let mut checker = CrcChecker::default();
            frame.iter().for_each(|&d| checker.push(d));
            assert_eq!(checker.finish(), Ok(()));
        }
    }

    #[test]
    fn every_single_bit_flip_is_detected() {
        let payload = pseudo_random(9);
        let frame = CrcInserter::insert(&payload);
        for word in 0..frame.len() - 1 {
            for bit in 0..32 {
                let mut corrupted = frame.clone();
                corrupted[word] ^= 1 << bit;
                assert_eq!(CrcChecker::check(&corrupted), Err(LinkError::Crc));
            }
        }
    }

    #[test]
    fn empty_frame_is_malformed() {
        assert_eq!(CrcChecker::check(&[]), Err(LinkError::MalformedFrame));
        assert_eq!(CrcChecker::default().finish(), Err(LinkError::MalformedFrame));
    }

    #[test]
    fn trailer_only_frame() {
        let frame = CrcInserter::insert(&[]);
        assert_eq!(frame, vec![SATA_CRC_INIT]);
        assert_eq!(CrcChecker::check(&frame), Ok(&[][..]));
    }
}
