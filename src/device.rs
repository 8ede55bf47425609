//! Device side of the stack: the backing store and a reference drive that
//! services commands from it.

use alloc::{vec, vec::Vec};
use core::ops::Range;

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    ata::{ATA_SECTOR_SIZE, AtaCommand, AtaError, AtaStatus, IdentifyBlock},
    fis::{DataFis, DmaActivateD2h, Fis, RegD2h, RegH2d},
    link::{LinkError, Role},
    primitive::Dword,
    transport::{ReceivedFis, TransportEvent, TransportLayer},
};

/// Largest Data FIS the drive sends, in dwords.
pub const DRIVE_MAX_DMA_DWORDS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("access {addr:#x}+{length:#x} is outside the allocated region")]
    OutOfRange { addr: u64, length: usize },
    #[error("no region allocated")]
    NotAllocated,
}

/// Byte-addressed storage behind a drive.
pub trait BlockDevice {
    /// Backs `[base, base + length)` with zeroed storage.
    fn allocate(&mut self, base: u64, length: usize);

    fn read(&self, addr: u64, length: usize) -> Result<Vec<u8>, DeviceError>;

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), DeviceError>;
}

/// A [`BlockDevice`] held in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryDevice {
    base: u64,
    mem: Option<Vec<u8>>,
}

impl MemoryDevice {
    pub fn new(base: u64, length: usize) -> Self {
        let mut dev = Self::default();
        dev.allocate(base, length);
        dev
    }

    fn range(&self, addr: u64, length: usize) -> Result<Range<usize>, DeviceError> {
        let mem = self.mem.as_ref().ok_or(DeviceError::NotAllocated)?;
        let out_of_range = DeviceError::OutOfRange { addr, length };
        let start = addr
            .checked_sub(self.base)
            .and_then(|off| usize::try_from(off).ok())
            .ok_or(out_of_range)?;
        let end = start.checked_add(length).ok_or(out_of_range)?;
        if end > mem.len() {
            return Err(out_of_range);
        }
        Ok(start..end)
    }
}

impl BlockDevice for MemoryDevice {
    fn allocate(&mut self, base: u64, length: usize) {
        self.base = base;
        self.mem = Some(vec![0; length]);
    }

    fn read(&self, addr: u64, length: usize) -> Result<Vec<u8>, DeviceError> {
        let range = self.range(addr, length)?;
        Ok(self.mem.as_ref().map_or_else(Vec::new, |mem| mem[range].to_vec()))
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), DeviceError> {
        let range = self.range(addr, data.len())?;
        if let Some(mem) = self.mem.as_mut() {
            mem[range].copy_from_slice(data);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub max_dma_dwords: usize,
    pub identify: IdentifyBlock,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            max_dma_dwords: DRIVE_MAX_DMA_DWORDS,
            identify: IdentifyBlock::pattern(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Idle,
    Write { addr: u64, remaining: usize },
}

/// Reference drive answering WRITE DMA EXT, READ DMA EXT and IDENTIFY DEVICE
/// DMA out of a [`BlockDevice`].
///
/// A write whose Data FIS fails its CRC is aborted with ICRC and the frame is
/// discarded; data from earlier frames of the same command stays written.
pub struct Drive<B> {
    transport: TransportLayer,
    device: B,
    config: DriveConfig,
    pending: Pending,
}

impl<B: BlockDevice> Drive<B> {
    pub fn new(device: B, config: DriveConfig) -> Self {
        Self {
            transport: TransportLayer::new(Role::Device),
            device,
            config,
            pending: Pending::Idle,
        }
    }

    pub fn device(&self) -> &B {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut B {
        &mut self.device
    }

    pub fn transport_mut(&mut self) -> &mut TransportLayer {
        &mut self.transport
    }

    /// Whether a command is waiting for more data from the host.
    pub fn is_busy(&self) -> bool {
        self.pending != Pending::Idle
    }

    pub fn step(&mut self, rx: Option<Dword>) -> Dword {
        let out = self.transport.step(rx);
        if let Some(event) = out.event {
            self.handle(event);
        }
        out.tx
    }

    fn handle(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Received(ReceivedFis { fis, status: Ok(()) }) => match fis {
                Fis::RegH2d(cmd) if cmd.c() => self.execute(cmd),
                Fis::RegH2d(_) => debug!("ignoring control register update"),
                Fis::Data(data) => self.write_data(data),
                other => warn!("unexpected {:?} from host", other.fis_type()),
            },
            TransportEvent::Received(ReceivedFis { status: Err(e), .. })
            | TransportEvent::Malformed { status: Err(e), .. } => self.frame_failed(e),
            TransportEvent::Malformed { error, .. } => {
                warn!("malformed FIS from host: {error}");
                self.abort(AtaError::new().with_abrt(true));
            }
            TransportEvent::Sent(Err(e)) => warn!("host rejected FIS: {e}"),
            TransportEvent::Sent(Ok(())) => {}
        }
    }

    fn frame_failed(&mut self, error: LinkError) {
        warn!("frame from host failed: {error}");
        if let Pending::Write { .. } = self.pending {
            self.abort(AtaError::new().with_icrc(true).with_abrt(true));
        }
    }

    fn execute(&mut self, cmd: RegH2d) {
        if self.is_busy() {
            warn!("new command abandons unfinished write");
            self.pending = Pending::Idle;
        }

        let Ok(command) = AtaCommand::try_from(cmd.command()) else {
            warn!("unsupported command {:#04x}", cmd.command());
            self.abort(AtaError::new().with_abrt(true));
            return;
        };

        let count = match cmd.count() {
            0 => 0x1_0000,
            n => usize::from(n),
        };
        let addr = cmd.lba() * ATA_SECTOR_SIZE as u64;
        let length = count * ATA_SECTOR_SIZE;
        debug!("{command:?} lba {:#x} count {count}", cmd.lba());

        match command {
            AtaCommand::WRITE_DMA_EXT => {
                self.pending = Pending::Write {
                    addr,
                    remaining: length,
                };
                self.transport.send(DmaActivateD2h::new());
            }
            AtaCommand::READ_DMA_EXT => match self.device.read(addr, length) {
                Ok(bytes) => {
                    self.send_data(&bytes);
                    self.complete();
                }
                Err(e) => {
                    warn!("read failed: {e}");
                    self.abort(AtaError::new().with_idnf(true).with_abrt(true));
                }
            },
            AtaCommand::IDENTIFY_DEVICE_DMA => {
                let bytes = self.config.identify.to_bytes();
                self.send_data(&bytes);
                self.complete();
            }
        }
    }

    fn write_data(&mut self, data: DataFis) {
        let Pending::Write { addr, remaining } = self.pending else {
            warn!("Data FIS with no write pending");
            return;
        };

        let bytes = data.to_bytes();
        if bytes.len() > remaining {
            warn!("host sent {} bytes, {remaining} expected", bytes.len());
        }
        let take = bytes.len().min(remaining);
        if let Err(e) = self.device.write(addr, &bytes[..take]) {
            warn!("write failed: {e}");
            self.abort(AtaError::new().with_idnf(true).with_abrt(true));
            return;
        }

        let remaining = remaining - take;
        if remaining == 0 {
            info!("write complete");
            self.complete();
        } else {
            self.pending = Pending::Write {
                addr: addr + take as u64,
                remaining,
            };
            self.transport.send(DmaActivateD2h::new());
        }
    }

    fn send_data(&mut self, bytes: &[u8]) {
        let chunk = self.config.max_dma_dwords.max(1) * 4;
        for part in bytes.chunks(chunk) {
            self.transport.send(DataFis::from_bytes(part));
        }
    }

    fn complete(&mut self) {
        self.pending = Pending::Idle;
        self.send_status(AtaStatus::ready(), AtaError::new());
    }

    fn abort(&mut self, error: AtaError) {
        self.pending = Pending::Idle;
        self.send_status(AtaStatus::ready().with_err(true), error);
    }

    fn send_status(&mut self, status: AtaStatus, error: AtaError) {
        self.transport.send(
            RegD2h::new()
                .with_i(true)
                .with_status(status.into_bits())
                .with_error(error.into_bits()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_device_bounds() {
        let mut dev = MemoryDevice::new(0x1000, 16);
        dev.write(0x1004, &[1, 2, 3]).unwrap();
        assert_eq!(dev.read(0x1003, 5).unwrap(), [0, 1, 2, 3, 0]);
        assert_eq!(
            dev.read(0xFFF, 1),
            Err(DeviceError::OutOfRange {
                addr: 0xFFF,
                length: 1
            })
        );
        assert!(dev.write(0x100E, &[0; 3]).is_err());
        assert!(dev.read(0x1010, 0).is_ok());
        assert_eq!(
            MemoryDevice::default().read(0, 1),
            Err(DeviceError::NotAllocated)
        );
    }

    #[test]
    fn allocate_resets_contents() {
        let mut dev = MemoryDevice::new(0, 4);
        dev.write(0, &[9; 4]).unwrap();
        dev.allocate(0, 8);
        assert_eq!(dev.read(0, 8).unwrap(), [0; 8]);
    }

    #[test]
    fn drive_aborts_unsupported_command() {
        let mut drive = Drive::new(MemoryDevice::new(0, 4096), DriveConfig::default());
        drive.handle(TransportEvent::Received(ReceivedFis {
            fis: RegH2d::new().with_c(true).with_command(0xEC).into(),
            status: Ok(()),
        }));
        assert_eq!(drive.transport.link().pending(), 1);
        assert!(!drive.is_busy());
    }

    #[test]
    fn drive_tracks_write_progress() {
        let mut drive = Drive::new(MemoryDevice::new(0, 4096), DriveConfig::default());
        drive.handle(TransportEvent::Received(ReceivedFis {
            fis: RegH2d::new()
                .with_c(true)
                .with_command(0x35)
                .with_lba(1)
                .with_count(2)
                .into(),
            status: Ok(()),
        }));
        assert!(drive.is_busy());

        drive.handle(TransportEvent::Received(ReceivedFis {
            fis: DataFis::from_bytes(&[7; 512]).into(),
            status: Ok(()),
        }));
        assert!(drive.is_busy());
        assert_eq!(drive.device().read(512, 512).unwrap(), [7; 512]);

        drive.handle(TransportEvent::Received(ReceivedFis {
            fis: DataFis::from_bytes(&[8; 512]).into(),
            status: Err(LinkError::Crc),
        }));
        assert!(!drive.is_busy());
        assert_eq!(drive.device().read(1024, 512).unwrap(), [0; 512]);
        // DMA activate twice, then the aborting status.
        assert_eq!(drive.transport.link().pending(), 3);
    }
}
