//! SATA link layer.
//!
//! Frames outbound payloads between `SOF` and `EOF` with a CRC trailer and
//! scrambling, negotiates each transfer with `X_RDY`/`R_RDY`, and applies
//! `HOLD`/`HOLDA` flow control. Advances one symbol per [`LinkLayer::step`].

use alloc::{collections::VecDeque, vec::Vec};
use core::mem;

use log::{debug, trace, warn};
use thiserror::Error;

use crate::{
    cont::{ContDecoder, ContEncoder},
    crc::{CrcChecker, CrcInserter},
    primitive::{Dword, Primitive},
    scrambler::Scrambler,
};

/// Which end of the link an instance drives. The device wins when both ends
/// request the link at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Device,
}

/// Link states. `H2d*` states transmit a frame and `D2h*` states receive
/// one, whichever end the instance sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    H2dReady,
    H2dSof,
    H2dCopy,
    H2dEof,
    H2dWtrm,
    D2hReady,
    D2hCopy,
    D2hEof,
    D2hWtrm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("frame CRC mismatch")]
    Crc,
    #[error("frame rejected by peer")]
    Rejected,
    #[error("frame aborted by SYNC")]
    Aborted,
    #[error("frame shorter than its CRC trailer")]
    MalformedFrame,
}

/// An inbound frame, delivered even when it failed its checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub payload: Vec<u32>,
    pub status: Result<(), LinkError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    FrameReceived(ReceivedFrame),
    /// The oldest submitted frame was terminated by the peer.
    FrameSent(Result<(), LinkError>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkOutput {
    pub tx: Dword,
    pub event: Option<LinkEvent>,
}

pub struct LinkLayer {
    role: Role,
    state: LinkState,

    outbound: VecDeque<Vec<u32>>,
    tx_pos: usize,
    tx_crc: CrcInserter,
    tx_scrambler: Scrambler,
    source_ready: bool,

    rx_frame: Vec<u32>,
    rx_crc: CrcChecker,
    rx_scrambler: Scrambler,
    rx_status: Result<(), LinkError>,
    sink_ready: bool,

    cont_tx: ContEncoder,
    cont_rx: ContDecoder,
}

impl LinkLayer {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: LinkState::Idle,
            outbound: VecDeque::new(),
            tx_pos: 0,
            tx_crc: CrcInserter::default(),
            tx_scrambler: Scrambler::new(),
            source_ready: true,
            rx_frame: Vec::new(),
            rx_crc: CrcChecker::default(),
            rx_scrambler: Scrambler::new(),
            rx_status: Ok(()),
            sink_ready: true,
            cont_tx: ContEncoder::default(),
            cont_rx: ContDecoder::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Queues a payload for transmission. Frames go out in submission order.
    pub fn submit(&mut self, payload: Vec<u32>) {
        self.outbound.push_back(payload);
    }

    /// Frames submitted and not yet terminated.
    pub fn pending(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_idle(&self) -> bool {
        self.state == LinkState::Idle && self.outbound.is_empty()
    }

    /// Drops every queued frame and returns to `Idle`. A frame in flight in
    /// either direction is cut off: the peer sees `SYNC` and aborts it.
    pub fn reset(&mut self) {
        if !self.is_idle() {
            warn!(
                "resetting link in {:?} with {} frames queued",
                self.state,
                self.outbound.len()
            );
        }
        self.outbound.clear();
        self.tx_pos = 0;
        self.rx_frame.clear();
        self.rx_status = Ok(());
        self.goto(LinkState::Idle);
    }

    /// When false, an outbound frame in progress is paused with `HOLD`.
    pub fn set_source_ready(&mut self, ready: bool) {
        self.source_ready = ready;
    }

    /// When false, the peer is asked to pause an inbound frame with `HOLD`.
    pub fn set_sink_ready(&mut self, ready: bool) {
        self.sink_ready = ready;
    }

    /// Consumes the symbol received this tick and produces the one to send.
    pub fn step(&mut self, rx: Option<Dword>) -> LinkOutput {
        let rx = rx
            .and_then(|d| self.cont_rx.decode(d))
            .filter(|d| !d.is(Primitive::Align));

        let candidate = self.transmit(rx);
        let out = self.cont_tx.encode(candidate);
        let sent = out.consumed.then_some(candidate);
        let event = self.advance(rx, sent);

        LinkOutput { tx: out.dword, event }
    }

    fn transmit(&self, rx: Option<Dword>) -> Dword {
        let rx_is = |p| rx.is_some_and(|d| d.is(p));
        let p = match self.state {
            LinkState::Idle if rx_is(Primitive::PmReqP) || rx_is(Primitive::PmReqS) => {
                Primitive::PmNak
            }
            LinkState::Idle => Primitive::Sync,
            LinkState::H2dReady => Primitive::XRdy,
            LinkState::H2dSof => Primitive::Sof,
            LinkState::H2dCopy if rx_is(Primitive::Hold) => Primitive::HoldA,
            LinkState::H2dCopy if !self.source_ready => Primitive::Hold,
            LinkState::H2dCopy => return Dword::Data(self.tx_word() ^ self.tx_scrambler.value()),
            LinkState::H2dEof => Primitive::Eof,
            LinkState::H2dWtrm => Primitive::Wtrm,
            LinkState::D2hReady => Primitive::RRdy,
            LinkState::D2hCopy if rx_is(Primitive::Hold) => Primitive::HoldA,
            LinkState::D2hCopy if !self.sink_ready => Primitive::Hold,
            LinkState::D2hCopy | LinkState::D2hEof => Primitive::RIp,
            LinkState::D2hWtrm if self.rx_status.is_ok() => Primitive::ROk,
            LinkState::D2hWtrm => Primitive::RErr,
        };
        Dword::Primitive(p)
    }

    /// Payload dword at the current position, or the trailer past the end.
    fn tx_word(&self) -> u32 {
        self.outbound
            .front()
            .and_then(|frame| frame.get(self.tx_pos))
            .copied()
            .unwrap_or_else(|| self.tx_crc.trailer())
    }

    fn advance(&mut self, rx: Option<Dword>, sent: Option<Dword>) -> Option<LinkEvent> {
        let rx_is = |p| rx.is_some_and(|d| d.is(p));
        match self.state {
            LinkState::Idle => {
                if rx_is(Primitive::XRdy) && (self.role == Role::Host || self.outbound.is_empty()) {
                    self.goto(LinkState::D2hReady);
                } else if sent.is_some() && !self.outbound.is_empty() {
                    self.goto(LinkState::H2dReady);
                }
            }
            LinkState::H2dReady => {
                if rx_is(Primitive::RRdy) {
                    self.goto(LinkState::H2dSof);
                } else if rx_is(Primitive::XRdy) && self.role == Role::Host {
                    debug!("host backing off for device transmission");
                    self.goto(LinkState::D2hReady);
                }
            }
            LinkState::H2dSof => {
                if sent.is_some() {
                    self.tx_pos = 0;
                    self.tx_crc.reset();
                    self.tx_scrambler.reset();
                    self.goto(LinkState::H2dCopy);
                }
            }
            LinkState::H2dCopy => {
                if rx_is(Primitive::Sync) {
                    return self.finish_tx(Err(LinkError::Aborted));
                }
                if sent.is_some_and(Dword::is_data) {
                    let len = self.outbound.front().map_or(0, Vec::len);
                    if self.tx_pos < len {
                        let word = self.tx_word();
                        self.tx_crc.push(word);
                    }
                    self.tx_scrambler.advance();
                    self.tx_pos += 1;
                    if self.tx_pos > len {
                        self.goto(LinkState::H2dEof);
                    }
                }
            }
            LinkState::H2dEof => {
                if sent.is_some() {
                    self.goto(LinkState::H2dWtrm);
                }
            }
            LinkState::H2dWtrm => {
                if rx_is(Primitive::ROk) {
                    return self.finish_tx(Ok(()));
                } else if rx_is(Primitive::RErr) {
                    return self.finish_tx(Err(LinkError::Rejected));
                } else if rx_is(Primitive::Sync) {
                    return self.finish_tx(Err(LinkError::Aborted));
                }
            }
            LinkState::D2hReady => {
                if rx_is(Primitive::Sof) {
                    self.rx_frame.clear();
                    self.rx_crc.reset();
                    self.rx_scrambler.reset();
                    self.goto(LinkState::D2hCopy);
                } else if rx_is(Primitive::Sync) {
                    self.goto(LinkState::Idle);
                }
            }
            LinkState::D2hCopy => match rx {
                Some(Dword::Data(d)) => {
                    let d = self.rx_scrambler.scramble(d);
                    self.rx_crc.push(d);
                    self.rx_frame.push(d);
                }
                Some(Dword::Primitive(Primitive::Eof)) => {
                    self.rx_status = self.rx_crc.finish();
                    self.rx_frame.pop();
                    self.goto(LinkState::D2hEof);
                }
                Some(Dword::Primitive(Primitive::Sync)) => {
                    warn!("inbound frame aborted after {} dwords", self.rx_frame.len());
                    self.goto(LinkState::Idle);
                    return Some(LinkEvent::FrameReceived(ReceivedFrame {
                        payload: mem::take(&mut self.rx_frame),
                        status: Err(LinkError::Aborted),
                    }));
                }
                _ => {}
            },
            LinkState::D2hEof => {
                self.goto(LinkState::D2hWtrm);
                let frame = ReceivedFrame {
                    payload: mem::take(&mut self.rx_frame),
                    status: self.rx_status,
                };
                match frame.status {
                    Ok(()) => debug!("received frame of {} dwords", frame.payload.len()),
                    Err(e) => warn!("received frame of {} dwords: {e}", frame.payload.len()),
                }
                return Some(LinkEvent::FrameReceived(frame));
            }
            LinkState::D2hWtrm => {
                if rx_is(Primitive::Sync) {
                    self.rx_status = Ok(());
                    self.goto(LinkState::Idle);
                }
            }
        }
        None
    }

    fn finish_tx(&mut self, result: Result<(), LinkError>) -> Option<LinkEvent> {
        let len = self.outbound.pop_front().map_or(0, |f| f.len());
        match result {
            Ok(()) => debug!("sent frame of {len} dwords"),
            Err(e) => warn!("frame of {len} dwords failed: {e}"),
        }
        self.goto(LinkState::Idle);
        Some(LinkEvent::FrameSent(result))
    }

    fn goto(&mut self, next: LinkState) {
        trace!("{:?} link: {:?} -> {:?}", self.role, self.state, next);
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    /// Two link layers wired back to back with one tick of latency.
    struct Wire {
        host: LinkLayer,
        device: LinkLayer,
        to_host: Option<Dword>,
        to_device: Option<Dword>,
        host_events: Vec<LinkEvent>,
        device_events: Vec<LinkEvent>,
        device_wire: Vec<Dword>,
    }

    impl Wire {
        fn new() -> Self {
            Self {
                host: LinkLayer::new(Role::Host),
                device: LinkLayer::new(Role::Device),
                to_host: None,
                to_device: None,
                host_events: Vec::new(),
                device_events: Vec::new(),
                device_wire: Vec::new(),
            }
        }

        fn tick(&mut self) {
            let h = self.host.step(self.to_host.take());
            let d = self.device.step(self.to_device.take());
            self.to_device = Some(h.tx);
            self.to_host = Some(d.tx);
            self.device_wire.push(h.tx);
            self.host_events.extend(h.event);
            self.device_events.extend(d.event);
        }

        fn run(&mut self, ticks: usize) {
            for _ in 0..ticks {
                self.tick();
            }
        }

        fn run_until_idle(&mut self) {
            for _ in 0..10_000 {
                self.tick();
                if self.host.is_idle() && self.device.is_idle() {
                    self.run(4);
                    return;
                }
            }
            panic!("link never went idle");
        }
    }

    fn payload(len: u32) -> Vec<u32> {
        (0..len).map(|i| i.wrapping_mul(0x0101_0101) ^ 0xB5B5_957C).collect()
    }

    #[test]
    fn idle_links_exchange_sync() {
        let mut wire = Wire::new();
        wire.run(8);
        assert_eq!(wire.host.state(), LinkState::Idle);
        assert_eq!(wire.device_wire[..2], [Dword::Primitive(Primitive::Sync); 2]);
        assert_eq!(wire.device_wire[2], Dword::Primitive(Primitive::Cont));
    }

    #[test]
    fn host_frame_is_delivered() {
        let mut wire = Wire::new();
        wire.run(5);
        wire.host.submit(payload(20));
        wire.run_until_idle();

        assert_eq!(wire.host_events, vec![LinkEvent::FrameSent(Ok(()))]);
        assert_eq!(
            wire.device_events,
            vec![LinkEvent::FrameReceived(ReceivedFrame {
                payload: payload(20),
                status: Ok(()),
            })]
        );
    }

    #[test]
    fn frame_is_scrambled_on_the_wire() {
        let mut wire = Wire::new();
        wire.host.submit(vec![0; 4]);
        wire.run_until_idle();
        let sof = wire
            .device_wire
            .iter()
            .position(|d| d.is(Primitive::Sof))
            .unwrap();
        assert_eq!(wire.device_wire[sof + 1], Dword::Data(0xC2D2_768D));
        assert_eq!(wire.device_wire[sof + 2], Dword::Data(0x1F26_B368));
    }

    #[test]
    fn frames_in_both_directions() {
        let mut wire = Wire::new();
        wire.host.submit(payload(3));
        wire.device.submit(payload(7));
        wire.run_until_idle();

        assert_eq!(wire.host_events.len(), 2);
        assert_eq!(wire.device_events.len(), 2);
        // The device wins arbitration.
        assert_eq!(
            wire.host_events[0],
            LinkEvent::FrameReceived(ReceivedFrame {
                payload: payload(7),
                status: Ok(()),
            })
        );
        assert_eq!(wire.host_events[1], LinkEvent::FrameSent(Ok(())));
    }

    #[test]
    fn corrupted_frame_is_delivered_flagged_and_rejected() {
        let mut wire = Wire::new();
        wire.host.submit(payload(8));
        let mut corrupted = false;
        for _ in 0..200 {
            let h = wire.host.step(wire.to_host.take());
            let d = wire.device.step(wire.to_device.take());
            let mut tx = h.tx;
            if let (false, Dword::Data(v)) = (corrupted, tx) {
                if wire.host.state() == LinkState::H2dCopy {
                    tx = Dword::Data(v ^ 0x10);
                    corrupted = true;
                }
            }
            wire.to_device = Some(tx);
            wire.to_host = Some(d.tx);
            wire.host_events.extend(h.event);
            wire.device_events.extend(d.event);
        }

        assert!(corrupted);
        assert_eq!(wire.host_events, vec![LinkEvent::FrameSent(Err(LinkError::Rejected))]);
        match &wire.device_events[..] {
            [LinkEvent::FrameReceived(frame)] => {
                assert_eq!(frame.status, Err(LinkError::Crc));
                assert_eq!(frame.payload.len(), 8);
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert!(wire.host.is_idle());
    }

    #[test]
    fn sender_hold_loses_no_data() {
        let mut wire = Wire::new();
        wire.host.submit(payload(64));
        for t in 0..2000 {
            wire.host.set_source_ready(!(30..60).contains(&t) && t % 7 != 3);
            wire.tick();
        }
        assert!(wire.device_wire.contains(&Dword::Primitive(Primitive::Hold)));
        assert_eq!(wire.host_events, vec![LinkEvent::FrameSent(Ok(()))]);
        assert_eq!(
            wire.device_events,
            vec![LinkEvent::FrameReceived(ReceivedFrame {
                payload: payload(64),
                status: Ok(()),
            })]
        );
    }

    #[test]
    fn receiver_hold_loses_no_data() {
        let mut wire = Wire::new();
        wire.device.submit(payload(64));
        let mut saw_holda = false;
        for t in 0..2000 {
            wire.host.set_sink_ready(!(25..50).contains(&t) && t % 5 != 0);
            wire.tick();
            saw_holda |= wire.to_host == Some(Dword::Primitive(Primitive::HoldA));
        }
        assert!(saw_holda);
        assert_eq!(wire.device_events, vec![LinkEvent::FrameSent(Ok(()))]);
        assert_eq!(
            wire.host_events,
            vec![LinkEvent::FrameReceived(ReceivedFrame {
                payload: payload(64),
                status: Ok(()),
            })]
        );
    }

    #[test]
    fn several_frames_go_out_in_order() {
        let mut wire = Wire::new();
        for len in [1, 2, 3] {
            wire.host.submit(payload(len));
        }
        wire.run_until_idle();
        let received: Vec<usize> = wire
            .device_events
            .iter()
            .map(|e| match e {
                LinkEvent::FrameReceived(f) => f.payload.len(),
                LinkEvent::FrameSent(_) => usize::MAX,
            })
            .collect();
        assert_eq!(received, vec![1, 2, 3]);
        assert_eq!(wire.host_events.len(), 3);
    }

    #[test]
    fn sync_mid_frame_aborts_reception() {
        let mut link = LinkLayer::new(Role::Device);
        link.step(Some(Primitive::XRdy.into()));
        assert_eq!(link.state(), LinkState::D2hReady);
        link.step(Some(Primitive::Sof.into()));
        link.step(Some(Dword::Data(1)));
        let out = link.step(Some(Primitive::Sync.into()));
        assert_eq!(link.state(), LinkState::Idle);
        assert!(matches!(
            out.event,
            Some(LinkEvent::FrameReceived(ReceivedFrame {
                status: Err(LinkError::Aborted),
                ..
            }))
        ));
    }

    #[test]
    fn reset_cuts_off_inbound_frame() {
        let mut wire = Wire::new();
        wire.device.submit(payload(200));
        wire.device.submit(payload(3));
        wire.run(40);
        assert_eq!(wire.host.state(), LinkState::D2hCopy);

        wire.host.reset();
        assert!(wire.host.is_idle());
        wire.run_until_idle();

        assert_eq!(
            wire.device_events,
            vec![LinkEvent::FrameSent(Err(LinkError::Aborted)), LinkEvent::FrameSent(Ok(()))]
        );
        assert_eq!(
            wire.host_events,
            vec![LinkEvent::FrameReceived(ReceivedFrame {
                payload: payload(3),
                status: Ok(()),
            })]
        );
    }

    #[test]
    fn reset_drops_queued_frames() {
        let mut wire = Wire::new();
        wire.host.submit(payload(4));
        wire.host.submit(payload(4));
        wire.host.reset();
        assert_eq!(wire.host.pending(), 0);
        wire.run(50);
        assert!(wire.device_events.is_empty());
    }

    #[test]
    fn empty_frame_is_malformed() {
        let mut link = LinkLayer::new(Role::Device);
        link.step(Some(Primitive::XRdy.into()));
        link.step(Some(Primitive::Sof.into()));
        link.step(Some(Primitive::Eof.into()));
        let out = link.step(None);
        assert!(matches!(
            out.event,
            Some(LinkEvent::FrameReceived(ReceivedFrame {
                status: Err(LinkError::MalformedFrame),
                ..
            }))
        ));
        assert_eq!(link.step(None).tx, Dword::Primitive(Primitive::RErr));
    }

    #[test]
    fn power_management_requests_are_refused() {
        let mut link = LinkLayer::new(Role::Host);
        let out = link.step(Some(Primitive::PmReqP.into()));
        assert_eq!(out.tx, Dword::Primitive(Primitive::PmNak));
        assert_eq!(link.state(), LinkState::Idle);
    }
}
