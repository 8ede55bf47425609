//! Host command layer: whole ATA commands on top of the transport.

use alloc::{collections::VecDeque, vec::Vec};

use log::{debug, error, info, trace, warn};
use thiserror::Error;

use crate::{
    ata::{ATA_SECTOR_SIZE, AtaStatus, IdentifyBlock},
    fis::{DataFis, Fis, FisError, RegD2h, RegH2d},
    link::Role,
    phy::Phy,
    transport::{ReceivedFis, RequestKind, TransportEvent, TransportLayer, TransportRequest},
};

pub const DEFAULT_MAX_TICKS_PER_STATE: u64 = 100_000;

/// Largest Data FIS payload a write sends, in dwords.
pub const MAX_DMA_DWORDS: usize = 2048;

/// How many `max_ticks_per_state` periods an abandoned command may take to
/// drain.
pub const DRAIN_WAITS: u64 = 16;

/// One past the highest 48-bit LBA.
pub const LBA48_LIMIT: u64 = 1 << 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandConfig {
    /// Ticks to wait for each expected event before giving up.
    pub max_ticks_per_state: u64,
    pub max_dma_dwords: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            max_ticks_per_state: DEFAULT_MAX_TICKS_PER_STATE,
            max_dma_dwords: MAX_DMA_DWORDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: RequestKind,
    pub sector: u64,
    pub count: u16,
    /// Write payload, empty otherwise.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Written,
    Read(Vec<u8>),
    Identified(IdentifyBlock),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Failure {
    #[error("device rejected a frame")]
    Rejected,
    #[error("device reported status {status:#04x} error {error:#04x}")]
    Status { status: u8, error: u8 },
    #[error("expected {expected} bytes, received {received}")]
    Incomplete { expected: usize, received: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CmdError {
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("inbound frame failed its CRC check")]
    CrcError,
    #[error("no {awaiting} within {ticks} ticks")]
    CommandTimeout { awaiting: &'static str, ticks: u64 },
    #[error("command failed: {0}")]
    CommandFailed(#[from] Failure),
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FisError),
}

/// Issues one command at a time and clocks the [`Phy`] until it completes.
pub struct CommandLayer<P> {
    phy: P,
    transport: TransportLayer,
    config: CommandConfig,
    backlog: VecDeque<TransportEvent>,
    /// A command FIS went out and its closing RegD2H has not been seen.
    open: bool,
}

impl<P: Phy> CommandLayer<P> {
    pub fn new(phy: P, config: CommandConfig) -> Self {
        Self {
            phy,
            transport: TransportLayer::new(Role::Host),
            config,
            backlog: VecDeque::new(),
            open: false,
        }
    }

    pub fn phy(&self) -> &P {
        &self.phy
    }

    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    pub fn transport_mut(&mut self) -> &mut TransportLayer {
        &mut self.transport
    }

    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    /// Writes `data`, which must hold exactly `count` sectors, at `sector`.
    pub fn write(&mut self, sector: u64, count: u16, data: &[u8]) -> Result<(), CmdError> {
        validate(sector, count)?;
        if data.len() != usize::from(count) * ATA_SECTOR_SIZE {
            return Err(CmdError::InvalidRequest("data length does not match sector count"));
        }
        let result = self.write_dma(sector, count, data);
        self.settle(result)
    }

    pub fn read(&mut self, sector: u64, count: u16) -> Result<Vec<u8>, CmdError> {
        validate(sector, count)?;
        let result = self
            .issue(RequestKind::Read, sector, count)
            .and_then(|()| self.receive_data(usize::from(count) * ATA_SECTOR_SIZE));
        self.settle(result)
    }

    pub fn identify(&mut self) -> Result<IdentifyBlock, CmdError> {
        let result = self
            .issue(RequestKind::Identify, 0, 1)
            .and_then(|()| self.receive_data(ATA_SECTOR_SIZE));
        let bytes = self.settle(result)?;
        IdentifyBlock::from_bytes(&bytes).ok_or(CmdError::CommandFailed(Failure::Incomplete {
            expected: ATA_SECTOR_SIZE,
            received: bytes.len(),
        }))
    }

    pub fn submit(&mut self, command: &Command) -> Result<Completion, CmdError> {
        match command.kind {
            RequestKind::Write => self
                .write(command.sector, command.count, &command.data)
                .map(|()| Completion::Written),
            RequestKind::Read => self.read(command.sector, command.count).map(Completion::Read),
            RequestKind::Identify => self.identify().map(Completion::Identified),
        }
    }

    /// Clocks the stack once.
    pub fn tick(&mut self) -> Option<TransportEvent> {
        let rx = self.phy.try_receive();
        let out = self.transport.step(rx);
        self.phy.send(out.tx);
        out.event
    }

    /// Abandons the command when it failed before its closing status.
    fn settle<T>(&mut self, result: Result<T, CmdError>) -> Result<T, CmdError> {
        if result.is_err() && self.open {
            self.abandon();
        }
        result
    }

    /// Cuts off whatever the unfinished command left on the link and waits
    /// out the drive's reply to it, so the next command starts clean.
    fn abandon(&mut self) {
        warn!("abandoning unfinished command");
        self.transport.reset();
        self.backlog.clear();

        let quiet_limit = self.config.max_ticks_per_state;
        let mut quiet = 0;
        for _ in 0..quiet_limit.saturating_mul(DRAIN_WAITS) {
            match self.tick() {
                Some(TransportEvent::Received(ReceivedFis {
                    fis: Fis::RegD2h(_),
                    ..
                })) => {
                    debug!("drained closing status");
                    break;
                }
                Some(event) => {
                    trace!("draining {event:?}");
                    quiet = 0;
                }
                None if self.transport.link().is_idle() => {
                    quiet += 1;
                    if quiet >= quiet_limit {
                        break;
                    }
                }
                None => quiet = 0,
            }
        }
        self.open = false;
    }

    fn next_event(&mut self, awaiting: &'static str) -> Result<TransportEvent, CmdError> {
        if let Some(event) = self.backlog.pop_front() {
            return Ok(event);
        }
        let ticks = self.config.max_ticks_per_state;
        for _ in 0..ticks {
            if let Some(event) = self.tick() {
                return Ok(event);
            }
        }
        error!("timed out waiting for {awaiting}");
        Err(CmdError::CommandTimeout { awaiting, ticks })
    }

    /// Sends the command FIS and waits for the device to accept it.
    fn issue(&mut self, kind: RequestKind, sector: u64, count: u16) -> Result<(), CmdError> {
        let request = TransportRequest {
            kind,
            address: sector,
            length: count,
        };
        debug!("issuing {request:?}");
        self.transport.send(RegH2d::from(&request));
        self.open = true;

        let mut held = Vec::new();
        let result = loop {
            match self.next_event("command acknowledgement") {
                Ok(TransportEvent::Sent(Ok(()))) => break Ok(()),
                Ok(TransportEvent::Sent(Err(e))) => {
                    warn!("command FIS not accepted: {e}");
                    break Err(Failure::Rejected.into());
                }
                Ok(event) => held.push(event),
                Err(e) => break Err(e),
            }
        };
        self.backlog.extend(held);
        result
    }

    fn write_dma(&mut self, sector: u64, count: u16, data: &[u8]) -> Result<(), CmdError> {
        self.issue(RequestKind::Write, sector, count)?;

        let chunk = self.config.max_dma_dwords.max(1) * 4;
        let mut offset = 0;
        let mut rejected = false;
        loop {
            match self.next_event("DMA activate or status")? {
                TransportEvent::Received(ReceivedFis {
                    fis: Fis::DmaActivateD2h(_),
                    status: Ok(()),
                }) if offset < data.len() => {
                    let end = (offset + chunk).min(data.len());
                    debug!("sending bytes {offset}..{end}");
                    self.transport.send(DataFis::from_bytes(&data[offset..end]));
                    offset = end;
                }
                TransportEvent::Received(ReceivedFis {
                    fis: Fis::RegD2h(d2h),
                    status,
                }) => {
                    self.open = false;
                    status.map_err(|_| CmdError::CrcError)?;
                    check_status(&d2h)?;
                    if rejected {
                        return Err(Failure::Rejected.into());
                    }
                    if offset < data.len() {
                        return Err(Failure::Incomplete {
                            expected: data.len(),
                            received: offset,
                        }
                        .into());
                    }
                    info!("wrote {count} sectors at {sector:#x}");
                    return Ok(());
                }
                TransportEvent::Received(ReceivedFis { status: Err(e), .. })
                | TransportEvent::Malformed { status: Err(e), .. } => {
                    warn!("frame from drive failed during write: {e}");
                    return Err(CmdError::CrcError);
                }
                TransportEvent::Sent(Err(e)) => {
                    warn!("data FIS not accepted: {e}");
                    rejected = true;
                }
                TransportEvent::Sent(Ok(())) => {}
                other => warn!("ignoring {other:?} during write"),
            }
        }
    }

    /// Collects Data FIS payloads up to the closing status.
    fn receive_data(&mut self, expected: usize) -> Result<Vec<u8>, CmdError> {
        let mut data = Vec::with_capacity(expected);
        let mut corrupted = false;
        loop {
            match self.next_event("data or status")? {
                TransportEvent::Received(ReceivedFis {
                    fis: Fis::Data(fis),
                    status,
                }) => {
                    corrupted |= status.is_err();
                    data.extend(fis.to_bytes());
                }
                TransportEvent::Received(ReceivedFis {
                    fis: Fis::RegD2h(d2h),
                    status,
                }) => {
                    self.open = false;
                    if corrupted || status.is_err() {
                        warn!("discarding {} bytes of corrupted read data", data.len());
                        return Err(CmdError::CrcError);
                    }
                    check_status(&d2h)?;
                    if data.len() < expected {
                        return Err(Failure::Incomplete {
                            expected,
                            received: data.len(),
                        }
                        .into());
                    }
                    data.truncate(expected);
                    return Ok(data);
                }
                TransportEvent::Received(ReceivedFis { status: Err(e), .. })
                | TransportEvent::Malformed { status: Err(e), .. } => {
                    warn!("frame from drive failed during read: {e}");
                    corrupted = true;
                }
                TransportEvent::Malformed { error, .. } => return Err(error.into()),
                TransportEvent::Sent(_) => {}
                other => warn!("ignoring {other:?} during read"),
            }
        }
    }
}

fn validate(sector: u64, count: u16) -> Result<(), CmdError> {
    if count == 0 {
        return Err(CmdError::InvalidRequest("sector count must be non-zero"));
    }
    if sector >= LBA48_LIMIT || sector + u64::from(count) > LBA48_LIMIT {
        return Err(CmdError::InvalidRequest("sector range exceeds 48-bit LBA"));
    }
    Ok(())
}

fn check_status(d2h: &RegD2h) -> Result<(), CmdError> {
    let status = AtaStatus::from_bits(d2h.status());
    if status.is_failed() {
        error!("device status {:#04x} error {:#04x}", d2h.status(), d2h.error());
        return Err(Failure::Status {
            status: d2h.status(),
            error: d2h.error(),
        }
        .into());
    }
    Ok(())
}
