//! Physical layer boundary.
//!
//! The stack above exchanges one [`Dword`] per tick through a [`Phy`]. This
//! module also carries the 8b/10b character view of those dwords, the
//! out-of-band bring-up sequence, and [`Cable`], which wires a host straight
//! into a [`Drive`] with optional fault injection in either direction.

use alloc::{boxed::Box, collections::VecDeque};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    device::{BlockDevice, Drive},
    primitive::{Dword, Primitive, classify},
};

/// D10.2 pattern the host sends while waiting for the device's ALIGNs.
pub const D10_2: u32 = 0x4A4A_4A4A;

/// Largest number of ticks [`Cable::connect`] gives the OOB handshake.
pub const OOB_MAX_TICKS: usize = 1024;

pub trait Phy {
    /// Transmits one dword. Called exactly once per tick.
    fn send(&mut self, dword: Dword);

    /// Returns the dword received this tick, if any.
    fn try_receive(&mut self) -> Option<Dword>;
}

/// A dword as it crosses the 8b/10b boundary. Bit `n` of `charisk` marks
/// byte `n` as a control character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhyWord {
    pub data: u32,
    pub charisk: u8,
}

impl PhyWord {
    pub const fn data(data: u32) -> Self {
        Self { data, charisk: 0 }
    }

    pub fn decode(self) -> Dword {
        if self.charisk == 0 {
            return Dword::Data(self.data);
        }
        match classify(self.data) {
            Dword::Data(raw) => {
                warn!("unknown control word {raw:#010x} (charisk {:#06b})", self.charisk);
                Dword::Data(raw)
            }
            dword => dword,
        }
    }
}

impl From<Dword> for PhyWord {
    fn from(dword: Dword) -> Self {
        match dword {
            Dword::Primitive(p) => Self {
                data: p.code(),
                charisk: 0b0001,
            },
            Dword::Data(data) => Self::data(data),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobSignal {
    ComReset,
    ComInit,
    ComWake,
}

/// What a lane carries during one tick of bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    Idle,
    Oob(OobSignal),
    Word(PhyWord),
}

impl From<Primitive> for Line {
    fn from(p: Primitive) -> Self {
        Line::Word(Dword::from(p).into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobState {
    /// Host issuing COMRESET, device waiting for it.
    Reset,
    /// Host waiting for COMINIT, device issuing it.
    Init,
    /// Host issuing COMWAKE until answered, device waiting for it.
    Wake,
    /// Device answering COMWAKE.
    WakeReply,
    /// Host sending D10.2, device sending ALIGN.
    AwaitAlign,
    /// Host answering with ALIGN until the device starts link traffic.
    SendAlign,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PhyError {
    #[error("OOB handshake stalled in {state:?}")]
    OobTimeout { state: OobState },
}

/// Out-of-band bring-up for one end of the cable.
#[derive(Debug)]
pub struct Oob {
    host: bool,
    state: OobState,
}

impl Oob {
    pub fn host() -> Self {
        Self {
            host: true,
            state: OobState::Reset,
        }
    }

    pub fn device() -> Self {
        Self {
            host: false,
            state: OobState::Reset,
        }
    }

    pub fn state(&self) -> OobState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == OobState::Ready
    }

    /// Consumes what the peer sent last tick, returns what to send this one.
    /// Once ready the link layer owns the lane and this returns
    /// [`Line::Idle`].
    pub fn step(&mut self, rx: Line) -> Line {
        let (next, tx) = if self.host {
            self.host_step(rx)
        } else {
            self.device_step(rx)
        };
        if next != self.state {
            debug!(
                "{} OOB {:?} -> {next:?}",
                if self.host { "host" } else { "device" },
                self.state
            );
            self.state = next;
        }
        tx
    }

    fn host_step(&self, rx: Line) -> (OobState, Line) {
        use OobState::*;
        match self.state {
            Reset => (Init, Line::Oob(OobSignal::ComReset)),
            Init if rx == Line::Oob(OobSignal::ComInit) => (Wake, Line::Oob(OobSignal::ComWake)),
            Init => (Init, Line::Idle),
            Wake if rx == Line::Oob(OobSignal::ComWake) => {
                (AwaitAlign, Line::Word(PhyWord::data(D10_2)))
            }
            Wake => (Wake, Line::Oob(OobSignal::ComWake)),
            AwaitAlign if rx == Line::from(Primitive::Align) => {
                (SendAlign, Primitive::Align.into())
            }
            AwaitAlign => (AwaitAlign, Line::Word(PhyWord::data(D10_2))),
            SendAlign => match rx {
                Line::Word(word)
                    if matches!(word.decode(), Dword::Primitive(p) if p != Primitive::Align) =>
                {
                    (Ready, Line::Idle)
                }
                _ => (SendAlign, Primitive::Align.into()),
            },
            WakeReply | Ready => (Ready, Line::Idle),
        }
    }

    fn device_step(&self, rx: Line) -> (OobState, Line) {
        use OobState::*;
        match self.state {
            Reset if rx == Line::Oob(OobSignal::ComReset) => (Init, Line::Idle),
            Reset => (Reset, Line::Idle),
            Init => (Wake, Line::Oob(OobSignal::ComInit)),
            Wake if rx == Line::Oob(OobSignal::ComWake) => (WakeReply, Line::Idle),
            Wake => (Wake, Line::Idle),
            WakeReply => (AwaitAlign, Line::Oob(OobSignal::ComWake)),
            AwaitAlign if rx == Line::from(Primitive::Align) => (Ready, Line::Idle),
            AwaitAlign => (AwaitAlign, Primitive::Align.into()),
            SendAlign | Ready => (Ready, Line::Idle),
        }
    }
}

/// Rewrites a word in flight.
pub type Injector = Box<dyn FnMut(PhyWord) -> PhyWord>;

/// Host end of a simulated cable with a [`Drive`] on the other end.
///
/// Every [`Phy::send`] clocks the drive once; its reply is read back on the
/// following tick.
pub struct Cable<B> {
    drive: Drive<B>,
    inbound: VecDeque<PhyWord>,
    host_to_device: Option<Injector>,
    device_to_host: Option<Injector>,
}

impl<B: BlockDevice> Cable<B> {
    /// A cable whose lanes are already trained.
    pub fn new(drive: Drive<B>) -> Self {
        Self {
            drive,
            inbound: VecDeque::new(),
            host_to_device: None,
            device_to_host: None,
        }
    }

    /// Runs the OOB handshake before handing the lanes to the link layer.
    pub fn connect(drive: Drive<B>) -> Result<Self, PhyError> {
        let mut host = Oob::host();
        let mut device = Oob::device();
        let (mut to_host, mut to_device) = (Line::Idle, Line::Idle);
        let mut cable = Self::new(drive);

        for tick in 0..OOB_MAX_TICKS {
            let h = host.step(to_host);
            let d = if device.is_ready() {
                // The drive's link layer takes over and starts with SYNC.
                Line::Word(cable.drive.step(None).into())
            } else {
                device.step(to_device)
            };
            if host.is_ready() {
                info!("link up after {tick} ticks");
                if let Line::Word(word) = d {
                    cable.inbound.push_back(word);
                }
                return Ok(cable);
            }
            to_device = h;
            to_host = d;
        }

        let state = if host.is_ready() { device.state() } else { host.state() };
        Err(PhyError::OobTimeout { state })
    }

    pub fn with_host_to_device(mut self, f: impl FnMut(PhyWord) -> PhyWord + 'static) -> Self {
        self.host_to_device = Some(Box::new(f));
        self
    }

    pub fn with_device_to_host(mut self, f: impl FnMut(PhyWord) -> PhyWord + 'static) -> Self {
        self.device_to_host = Some(Box::new(f));
        self
    }

    pub fn drive(&self) -> &Drive<B> {
        &self.drive
    }

    pub fn drive_mut(&mut self) -> &mut Drive<B> {
        &mut self.drive
    }
}

impl<B: BlockDevice> Phy for Cable<B> {
    fn send(&mut self, dword: Dword) {
        let mut word = PhyWord::from(dword);
        if let Some(inject) = self.host_to_device.as_mut() {
            word = inject(word);
        }
        let mut reply = PhyWord::from(self.drive.step(Some(word.decode())));
        if let Some(inject) = self.device_to_host.as_mut() {
            reply = inject(reply);
        }
        self.inbound.push_back(reply);
    }

    fn try_receive(&mut self) -> Option<Dword> {
        self.inbound.pop_front().map(PhyWord::decode)
    }
}

/// Injector flipping `mask` in data dword `dword` of frame `frame`, both
/// counted from zero. Frames are counted by SOF; every data word between SOF
/// and EOF counts, the FIS header and CRC trailer included.
#[derive(Debug, Clone)]
pub struct BitFlip {
    frame: usize,
    dword: usize,
    mask: u32,
    frames_seen: usize,
    dwords_seen: usize,
    in_frame: bool,
}

impl BitFlip {
    pub fn new(frame: usize, dword: usize, mask: u32) -> Self {
        Self {
            frame,
            dword,
            mask,
            frames_seen: 0,
            dwords_seen: 0,
            in_frame: false,
        }
    }

    pub fn apply(&mut self, mut word: PhyWord) -> PhyWord {
        match word.decode() {
            Dword::Primitive(Primitive::Sof) => {
                self.in_frame = true;
                self.dwords_seen = 0;
            }
            Dword::Primitive(Primitive::Eof) if self.in_frame => {
                self.in_frame = false;
                self.frames_seen += 1;
            }
            Dword::Data(_) if self.in_frame => {
                if self.frames_seen == self.frame && self.dwords_seen == self.dword {
                    debug!("flipping {:#010x} in frame {}", self.mask, self.frame);
                    word.data ^= self.mask;
                }
                self.dwords_seen += 1;
            }
            _ => {}
        }
        word
    }

    /// Turns this flip into a closure for [`Cable::with_host_to_device`].
    pub fn into_injector(mut self) -> impl FnMut(PhyWord) -> PhyWord + 'static {
        move |word| self.apply(word)
    }
}
