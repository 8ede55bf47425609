#![no_std]

extern crate alloc;

pub mod ata;
pub mod command;
mod cont;
mod crc;
pub mod device;
pub mod fis;
pub mod link;
pub mod phy;
pub mod primitive;
mod scrambler;
pub mod transport;

pub use command::{CmdError, CommandConfig, CommandLayer};
pub use device::{BlockDevice, Drive, DriveConfig, MemoryDevice};
pub use fis::Fis;
pub use link::{LinkLayer, Role};
pub use phy::{Cable, Phy};
pub use primitive::{Dword, Primitive};
