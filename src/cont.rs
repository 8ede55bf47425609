//! CONT run-length coding of repeated primitives.
//!
//! A run of three or more identical primitives is sent as the primitive
//! twice, `CONT`, then scrambled data filler until the run ends. Before the
//! next symbol the repeated primitive is sent once more so the receiver can
//! close the run. ALIGN is transparent in both directions.

use crate::{
    primitive::{Dword, Primitive},
    scrambler::Scrambler,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContState {
    /// Last symbol differs from the one before it.
    #[default]
    Idle,
    /// The same primitive was sent twice in a row.
    RepeatDetected,
    /// `CONT` was sent, filler stands in for the repeated primitive.
    EmittingFiller,
}

/// Encoder result for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContOutput {
    pub dword: Dword,
    /// False when the input was held back and must be offered again.
    pub consumed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ContEncoder {
    state: ContState,
    last: Option<Dword>,
    filler: Scrambler,
}

impl ContEncoder {
    #[allow(dead_code)]
    pub fn state(&self) -> ContState {
        self.state
    }

    pub fn encode(&mut self, input: Dword) -> ContOutput {
        if input.is(Primitive::Align) {
            return Self::pass(input);
        }

        let repeated = !input.is_data() && self.last == Some(input);
        if repeated {
            let dword = match self.state {
                ContState::Idle => {
                    self.state = ContState::RepeatDetected;
                    input
                }
                ContState::RepeatDetected => {
                    self.state = ContState::EmittingFiller;
                    Dword::Primitive(Primitive::Cont)
                }
                ContState::EmittingFiller => Dword::Data(self.filler.scramble(0)),
            };
            return Self::pass(dword);
        }

        if self.state == ContState::EmittingFiller {
            if let Some(last) = self.last {
                self.state = ContState::Idle;
                return ContOutput {
                    dword: last,
                    consumed: false,
                };
            }
        }

        self.state = ContState::Idle;
        self.last = Some(input);
        Self::pass(input)
    }

    fn pass(dword: Dword) -> ContOutput {
        ContOutput {
            dword,
            consumed: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContDecoder {
    last_primitive: Option<Primitive>,
    absorbing: bool,
}

impl ContDecoder {
    /// Whether filler following a `CONT` is currently being absorbed.
    #[allow(dead_code)]
    pub fn absorbing(&self) -> bool {
        self.absorbing
    }

    /// Expands one received symbol. `None` is returned for the repeated
    /// primitive that closes a run.
    pub fn decode(&mut self, input: Dword) -> Option<Dword> {
        match input {
            Dword::Primitive(Primitive::Align) => Some(input),
            Dword::Primitive(Primitive::Cont) => {
                self.absorbing = true;
                self.last_primitive.map(Dword::Primitive)
            }
            Dword::Data(_) if self.absorbing => self.last_primitive.map(Dword::Primitive),
            Dword::Primitive(p) if self.absorbing => {
                self.absorbing = false;
                if self.last_primitive == Some(p) {
                    return None;
                }
                self.last_primitive = Some(p);
                Some(input)
            }
            Dword::Primitive(p) => {
                self.last_primitive = Some(p);
                Some(input)
            }
            Dword::Data(_) => Some(input),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    use Primitive::*;

    fn p(p: Primitive) -> Dword {
        Dword::Primitive(p)
    }

    fn encode_all(seq: &[Dword]) -> Vec<Dword> {
        let mut enc = ContEncoder::default();
        let mut wire = Vec::new();
        for &d in seq {
            loop {
                let out = enc.encode(d);
                wire.push(out.dword);
                if out.consumed {
                    break;
                }
            }
        }
        wire
    }

    fn decode_all(wire: &[Dword]) -> Vec<Dword> {
        let mut dec = ContDecoder::default();
        wire.iter().filter_map(|&d| dec.decode(d)).collect()
    }

    #[test]
    fn short_runs_pass_through() {
        let seq = [p(Sync), p(Sync), p(XRdy), Dword::Data(5), Dword::Data(5)];
        assert_eq!(encode_all(&seq), seq);
    }

    #[test]
    fn long_run_becomes_cont_and_filler() {
        let seq = [p(Sync); 6];
        let wire = encode_all(&seq);
        assert_eq!(&wire[..3], &[p(Sync), p(Sync), p(Cont)]);
        assert!(wire[3..].iter().all(|d| d.is_data()));
        assert_eq!(wire.len(), 6);
        assert_eq!(decode_all(&wire), seq);
    }

    #[test]
    fn run_is_closed_before_next_symbol() {
        let seq = [p(Hold), p(Hold), p(Hold), p(Hold), Dword::Data(0xB5B5_957C)];
        let wire = encode_all(&seq);
        assert_eq!(wire[4], p(Hold));
        assert_eq!(wire[5], Dword::Data(0xB5B5_957C));
        assert_eq!(decode_all(&wire), seq);
    }

    #[test]
    fn round_trip_mixed_traffic() {
        let mut seq = Vec::new();
        seq.extend([p(Sync); 10]);
        seq.extend([p(XRdy); 4]);
        seq.push(p(Sof));
        seq.extend((0..8).map(Dword::Data));
        seq.extend([p(Hold); 3]);
        seq.extend([Dword::Data(9); 3]);
        seq.push(p(Eof));
        seq.extend([p(Wtrm); 5]);
        seq.extend([p(Sync); 2]);
        seq.extend([p(ROk); 7]);
        assert_eq!(decode_all(&encode_all(&seq)), seq);
    }

    #[test]
    fn align_does_not_break_a_run() {
        let seq = [p(Sync), p(Sync), p(Align), p(Sync), p(Sync), p(RRdy)];
        let wire = encode_all(&seq);
        assert_eq!(wire[2], p(Align));
        assert_eq!(wire[3], p(Cont));
        assert_eq!(decode_all(&wire), seq);
    }

    #[test]
    fn encoder_states_follow_the_run() {
        let mut enc = ContEncoder::default();
        assert_eq!(enc.state(), ContState::Idle);
        enc.encode(p(Sync));
        assert_eq!(enc.state(), ContState::Idle);
        enc.encode(p(Sync));
        assert_eq!(enc.state(), ContState::RepeatDetected);
        assert_eq!(enc.encode(p(Sync)).dword, p(Cont));
        assert_eq!(enc.state(), ContState::EmittingFiller);

        let close = enc.encode(p(XRdy));
        assert_eq!(
            close,
            ContOutput {
                dword: p(Sync),
                consumed: false
            }
        );
        assert_eq!(enc.state(), ContState::Idle);
        assert!(enc.encode(p(XRdy)).consumed);
    }

    #[test]
    fn decoder_accepts_runs_closed_without_repeat() {
        let mut dec = ContDecoder::default();
        assert_eq!(dec.decode(p(Sync)), Some(p(Sync)));
        assert_eq!(dec.decode(p(Cont)), Some(p(Sync)));
        assert!(dec.absorbing());
        assert_eq!(dec.decode(Dword::Data(0x1234)), Some(p(Sync)));
        assert_eq!(dec.decode(p(XRdy)), Some(p(XRdy)));
        assert!(!dec.absorbing());
    }

    #[test]
    fn cont_without_history_yields_nothing() {
        let mut dec = ContDecoder::default();
        assert_eq!(dec.decode(p(Cont)), None);
        assert_eq!(dec.decode(Dword::Data(1)), None);
    }
}
