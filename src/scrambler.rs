//! SATA data scrambler.
//!
//! Parallel form of the `x^16 + x^15 + x^13 + x^4 + 1` LFSR: a 16-bit
//! context yields 32 output bits per dword, and the high half of each output
//! becomes the next context.

pub const SCRAMBLER_SEED: u16 = 0xF0F6;

/// Output bit `i` is the parity of `context & SCRAMBLER_TAPS[i]`.
const SCRAMBLER_TAPS: [u16; 32] = [
    0xA011, 0xE033, 0x6077, 0xC0EE, 0x21CD, 0x439A, 0x8734, 0xAE79, //
    0xFCE3, 0x59D7, 0xB3AE, 0xC74D, 0x2E8B, 0x5D16, 0xBA2C, 0xD449, //
    0x0883, 0x1106, 0x220C, 0x4418, 0x8830, 0xB071, 0xC0F3, 0x21F7, //
    0x43EE, 0x87DC, 0xAFA9, 0xFF43, 0x5E97, 0xBD2E, 0xDA4D, 0x148B, //
];

const fn expand(context: u16) -> u32 {
    let mut value = 0;
    let mut i = 0;
    while i < 32 {
        value |= ((context & SCRAMBLER_TAPS[i]).count_ones() & 1) << i;
        i += 1;
    }
    value
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scrambler {
    context: u16,
}

impl Default for Scrambler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scrambler {
    pub const fn new() -> Self {
        Self {
            context: SCRAMBLER_SEED,
        }
    }

    pub fn reset(&mut self) {
        self.context = SCRAMBLER_SEED;
    }

    /// Current whitening word.
    pub const fn value(&self) -> u32 {
        expand(self.context)
    }

    pub fn advance(&mut self) {
        self.context = (self.value() >> 16) as u16;
    }

    /// XORs `dword` with the current word and advances. Descrambling is the
    /// same operation.
    pub fn scramble(&mut self, dword: u32) -> u32 {
        let out = dword ^ self.value();
        self.advance();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serial Galois form of the same polynomial, seeded with all ones.
    fn serial(words: usize) -> alloc::vec::Vec<u32> {
        let mut lfsr: u16 = 0xFFFF;
        (0..words)
            .map(|_| {
                let mut w = 0u32;
                for bit in 0..32 {
                    let out = lfsr >> 15;
                    w |= u32::from(out) << bit;
                    lfsr <<= 1;
                    if out != 0 {
                        lfsr ^= 0xA011;
                    }
                }
                w
            })
            .collect()
    }

    #[test]
    fn first_words_of_sequence() {
        let mut s = Scrambler::new();
        let expected = [0xC2D2_768D, 0x1F26_B368, 0xA508_436C, 0x3452_D354];
        for e in expected {
            assert_eq!(s.value(), e);
            s.advance();
        }
    }

    #[test]
    fn parallel_form_matches_serial_lfsr() {
        let mut s = Scrambler::new();
        for w in serial(300) {
            assert_eq!(s.scramble(0), w);
        }
    }

    #[test]
    fn value_does_not_advance() {
        let s = Scrambler::new();
        assert_eq!(s.value(), s.value());
    }

    #[test]
    fn lockstep_descramble_restores_data() {
        let mut tx = Scrambler::new();
        let mut rx = Scrambler::new();
        let data = [0, 0xFFFF_FFFF, 0xB5B5_957C, 0x1234_5678, 7];
        for _ in 0..2 {
            for &d in &data {
                let wire = tx.scramble(d);
                assert_eq!(rx.scramble(wire), d);
            }
            tx.reset();
            rx.reset();
            assert_eq!(tx, Scrambler::new());
        }
    }
}
