//! Transport layer: FIS values in, link frames out, and back.

use log::{trace, warn};

use crate::{
    ata::{ATA_DEVICE_LBA, AtaCommand},
    fis::{Fis, FisError, RegH2d},
    link::{LinkError, LinkEvent, LinkLayer, Role},
    primitive::Dword,
};

/// A decoded inbound FIS and the link's verdict on its frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFis {
    pub fis: Fis,
    pub status: Result<(), LinkError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Received(ReceivedFis),
    /// A frame arrived that does not hold a whole FIS.
    Malformed {
        error: FisError,
        status: Result<(), LinkError>,
    },
    /// The oldest queued FIS was terminated by the peer.
    Sent(Result<(), LinkError>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOutput {
    pub tx: Dword,
    pub event: Option<TransportEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Write,
    Read,
    Identify,
}

impl RequestKind {
    pub fn command(self) -> AtaCommand {
        match self {
            RequestKind::Write => AtaCommand::WRITE_DMA_EXT,
            RequestKind::Read => AtaCommand::READ_DMA_EXT,
            RequestKind::Identify => AtaCommand::IDENTIFY_DEVICE_DMA,
        }
    }
}

/// A transfer in sector units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportRequest {
    pub kind: RequestKind,
    pub address: u64,
    pub length: u16,
}

impl From<&TransportRequest> for RegH2d {
    fn from(request: &TransportRequest) -> Self {
        RegH2d::new()
            .with_c(true)
            .with_command(request.kind.command() as u8)
            .with_lba(request.address)
            .with_device(ATA_DEVICE_LBA)
            .with_count(request.length)
    }
}

pub struct TransportLayer {
    link: LinkLayer,
}

impl TransportLayer {
    pub fn new(role: Role) -> Self {
        Self {
            link: LinkLayer::new(role),
        }
    }

    pub fn link(&self) -> &LinkLayer {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut LinkLayer {
        &mut self.link
    }

    /// Queues a FIS behind any already waiting.
    pub fn send(&mut self, fis: impl Into<Fis>) {
        let fis = fis.into();
        trace!("queueing {:?}", fis.fis_type());
        self.link.submit(fis.encode());
    }

    /// Discards every queued FIS and cuts off any frame in flight.
    pub fn reset(&mut self) {
        self.link.reset();
    }

    pub fn step(&mut self, rx: Option<Dword>) -> TransportOutput {
        let out = self.link.step(rx);
        let event = out.event.map(|event| match event {
            LinkEvent::FrameReceived(frame) => match Fis::decode(&frame.payload) {
                Ok(fis) => TransportEvent::Received(ReceivedFis {
                    fis,
                    status: frame.status,
                }),
                Err(error) => {
                    warn!("dropping frame of {} dwords: {error}", frame.payload.len());
                    TransportEvent::Malformed {
                        error,
                        status: frame.status,
                    }
                }
            },
            LinkEvent::FrameSent(result) => TransportEvent::Sent(result),
        });
        TransportOutput { tx: out.tx, event }
    }
}
