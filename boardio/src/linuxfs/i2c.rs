//! i2c-dev character devices.
//!
//! `/dev/i2c-N` is opened once per handle and bound to the device address
//! with `I2C_SLAVE`. Plain reads and writes go through the file; combined
//! transactions use `I2C_RDWR`, and the SMBus calls with no plain I2C
//! equivalent use `I2C_SMBUS`. What the adapter supports is queried once
//! with `I2C_FUNCS` when the handle opens.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bitflags::bitflags;

use super::{LinuxHandle, Root};
use crate::config::{I2cConfig, IoConfig};
use crate::context::Context;
use crate::error::{BusError, Error, Result};
use crate::identity::Identity;
use crate::io::i2c::I2c;
use crate::io::transfer::{RawTransfer, RegisterTransfer, SMBUS_BLOCK_MAX};
use crate::provider::I2cProvider;
use crate::tracing::prelude::*;

const I2C_SLAVE: u32 = 0x0703;
const I2C_FUNCS: u32 = 0x0705;
const I2C_RDWR: u32 = 0x0707;
const I2C_SMBUS: u32 = 0x0720;

const I2C_M_RD: u16 = 0x0001;

const I2C_SMBUS_WRITE: u8 = 0;
const I2C_SMBUS_PROC_CALL: u32 = 4;
const I2C_SMBUS_BLOCK_PROC_CALL: u32 = 7;

bitflags! {
    /// Adapter capabilities reported by `I2C_FUNCS`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Functionality: u32 {
        const I2C = 0x0000_0001;
        const TEN_BIT_ADDR = 0x0000_0002;
        const PROTOCOL_MANGLING = 0x0000_0004;
        const SMBUS_PEC = 0x0000_0008;
        const NOSTART = 0x0000_0010;
        const SLAVE = 0x0000_0020;
        const SMBUS_BLOCK_PROC_CALL = 0x0000_8000;
        const SMBUS_QUICK = 0x0001_0000;
        const SMBUS_READ_BYTE = 0x0002_0000;
        const SMBUS_WRITE_BYTE = 0x0004_0000;
        const SMBUS_READ_BYTE_DATA = 0x0008_0000;
        const SMBUS_WRITE_BYTE_DATA = 0x0010_0000;
        const SMBUS_READ_WORD_DATA = 0x0020_0000;
        const SMBUS_WRITE_WORD_DATA = 0x0040_0000;
        const SMBUS_PROC_CALL = 0x0080_0000;
        const SMBUS_READ_BLOCK_DATA = 0x0100_0000;
        const SMBUS_WRITE_BLOCK_DATA = 0x0200_0000;
        const SMBUS_READ_I2C_BLOCK = 0x0400_0000;
        const SMBUS_WRITE_I2C_BLOCK = 0x0800_0000;
        const SMBUS_HOST_NOTIFY = 0x1000_0000;
    }
}

// Kernel ABI from <linux/i2c.h> and <linux/i2c-dev.h>.

#[repr(C)]
struct I2cMsg {
    addr: u16,
    flags: u16,
    len: u16,
    buf: *mut u8,
}

#[repr(C)]
struct I2cRdwrIoctlData {
    msgs: *mut I2cMsg,
    nmsgs: u32,
}

#[repr(C)]
union I2cSmbusData {
    word: u16,
    // Length byte, up to 32 data bytes, one spare for PEC.
    block: [u8; SMBUS_BLOCK_MAX + 2],
}

#[repr(C)]
struct I2cSmbusIoctlData {
    read_write: u8,
    command: u8,
    size: u32,
    data: *mut I2cSmbusData,
}

/// An open i2c-dev file bound to one device address.
#[derive(Debug)]
struct Bus {
    file: File,
    address: u16,
    functionality: Functionality,
}

impl Bus {
    fn open(path: PathBuf, address: u16) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        let fd = file.as_raw_fd();

        // SAFETY: fd is an open descriptor owned by `file`; I2C_SLAVE takes
        // the address by value.
        let rc = unsafe { libc::ioctl(fd, I2C_SLAVE as libc::c_ulong, address as libc::c_ulong) };
        if rc < 0 {
            return Err(Error::bus(
                &path.display().to_string(),
                "select device",
                BusError::from_os(io::Error::last_os_error(), address),
            ));
        }

        let mut funcs: libc::c_ulong = 0;
        // SAFETY: I2C_FUNCS writes one unsigned long through the pointer,
        // which points at a live local.
        let rc = unsafe { libc::ioctl(fd, I2C_FUNCS as libc::c_ulong, &mut funcs as *mut libc::c_ulong) };
        let functionality = if rc < 0 {
            debug!(path = %path.display(), "I2C_FUNCS failed; assuming plain I2C");
            Functionality::I2C
        } else {
            Functionality::from_bits_truncate(funcs as u32)
        };

        Ok(Self {
            file,
            address,
            functionality,
        })
    }

    fn os_error(&self) -> BusError {
        BusError::from_os(io::Error::last_os_error(), self.address)
    }

    fn write(&mut self, data: &[u8]) -> std::result::Result<(), BusError> {
        let written = self
            .file
            .write(data)
            .map_err(|e| BusError::from_os(e, self.address))?;
        if written != data.len() {
            return Err(BusError::ShortWrite {
                expected: data.len(),
                actual: written,
            });
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, BusError> {
        self.file
            .read(buf)
            .map_err(|e| BusError::from_os(e, self.address))
    }

    /// Write then read with a repeated start. Falls back to two separate
    /// transfers when the adapter cannot combine messages.
    fn write_read(&mut self, write: &[u8], read: &mut [u8]) -> std::result::Result<usize, BusError> {
        if write.is_empty() {
            return self.read(read);
        }
        if !self.functionality.contains(Functionality::I2C) {
            self.write(write)?;
            return self.read(read);
        }

        let too_long = |_| BusError::Os(io::Error::from_raw_os_error(libc::EINVAL));
        let write_len = u16::try_from(write.len()).map_err(too_long)?;
        let read_len = u16::try_from(read.len()).map_err(too_long)?;

        // The kernel never writes through a write message's buffer.
        let mut outgoing = write.to_vec();
        let mut msgs = [
            I2cMsg {
                addr: self.address,
                flags: 0,
                len: write_len,
                buf: outgoing.as_mut_ptr(),
            },
            I2cMsg {
                addr: self.address,
                flags: I2C_M_RD,
                len: read_len,
                buf: read.as_mut_ptr(),
            },
        ];
        let mut data = I2cRdwrIoctlData {
            msgs: msgs.as_mut_ptr(),
            nmsgs: msgs.len() as u32,
        };

        // SAFETY: both messages point at buffers that outlive the call, with
        // lengths matching the buffers.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                I2C_RDWR as libc::c_ulong,
                &mut data as *mut I2cRdwrIoctlData,
            )
        };
        if rc < 0 {
            return Err(self.os_error());
        }
        Ok(read.len())
    }

    fn smbus(
        &mut self,
        read_write: u8,
        command: u8,
        size: u32,
        data: &mut I2cSmbusData,
    ) -> std::result::Result<(), BusError> {
        let mut args = I2cSmbusIoctlData {
            read_write,
            command,
            size,
            data: data as *mut I2cSmbusData,
        };
        // SAFETY: `args.data` points at a live union large enough for any
        // SMBus transaction.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                I2C_SMBUS as libc::c_ulong,
                &mut args as *mut I2cSmbusIoctlData,
            )
        };
        if rc < 0 {
            return Err(match self.os_error() {
                // The adapter acknowledged the address but not the command.
                BusError::Os(e) if e.raw_os_error() == Some(libc::EPROTO) => {
                    BusError::CommandRejected(command)
                }
                other => other,
            });
        }
        Ok(())
    }

    fn require(&self, needed: Functionality) -> std::result::Result<(), BusError> {
        if self.functionality.contains(needed) {
            Ok(())
        } else {
            Err(BusError::NotSupported)
        }
    }

    fn process_call(&mut self, register: u8, value: u16) -> std::result::Result<u16, BusError> {
        self.require(Functionality::SMBUS_PROC_CALL)?;
        let mut data = I2cSmbusData { word: value };
        self.smbus(I2C_SMBUS_WRITE, register, I2C_SMBUS_PROC_CALL, &mut data)?;
        // SAFETY: the kernel stores the reply word in `word`.
        Ok(unsafe { data.word })
    }

    fn block_process_call(
        &mut self,
        register: u8,
        payload: &[u8],
    ) -> std::result::Result<Vec<u8>, BusError> {
        self.require(Functionality::SMBUS_BLOCK_PROC_CALL)?;
        let mut block = [0u8; SMBUS_BLOCK_MAX + 2];
        block[0] = payload.len() as u8;
        block[1..=payload.len()].copy_from_slice(payload);
        let mut data = I2cSmbusData { block };
        self.smbus(I2C_SMBUS_WRITE, register, I2C_SMBUS_BLOCK_PROC_CALL, &mut data)?;

        // SAFETY: the kernel stores the reply block, length first, in `block`.
        let reply = unsafe { data.block };
        let count = usize::from(reply[0]);
        if count > SMBUS_BLOCK_MAX {
            return Err(BusError::BlockLength(count));
        }
        Ok(reply[1..=count].to_vec())
    }
}

#[derive(Debug)]
pub struct LinuxFsI2c {
    handle: LinuxHandle,
    config: I2cConfig,
    bus: Mutex<Bus>,
}

impl LinuxFsI2c {
    fn bus(&self) -> Result<MutexGuard<'_, Bus>> {
        self.handle.ensure_live()?;
        Ok(self.bus.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Capabilities of the adapter this device sits on.
    pub fn functionality(&self) -> Functionality {
        self.bus
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .functionality
    }

    // The file closes when the handle drops.
    fn teardown(&self) -> Result<()> {
        Ok(())
    }
}

super::linux_io!(LinuxFsI2c, I2c);

impl RawTransfer for LinuxFsI2c {
    fn write_bytes(&self, data: &[u8]) -> Result<()> {
        self.bus()?
            .write(data)
            .map_err(|e| Error::bus(self.handle.id(), "write", e))
    }

    fn read_bytes(&self, buf: &mut [u8]) -> Result<usize> {
        self.bus()?
            .read(buf)
            .map_err(|e| Error::bus(self.handle.id(), "read", e))
    }
}

impl RegisterTransfer for LinuxFsI2c {
    fn write_register_bytes(&self, register: u8, data: &[u8]) -> Result<()> {
        let mut framed = Vec::with_capacity(data.len() + 1);
        framed.push(register);
        framed.extend_from_slice(data);
        self.bus()?
            .write(&framed)
            .map_err(|e| Error::bus(self.handle.id(), "write register", e))
    }

    fn read_register_bytes(&self, register: u8, buf: &mut [u8]) -> Result<usize> {
        self.bus()?
            .write_read(&[register], buf)
            .map_err(|e| Error::bus(self.handle.id(), "read register", e))
    }
}

impl I2c for LinuxFsI2c {
    fn config(&self) -> &I2cConfig {
        &self.config
    }

    fn write_read(&self, write: &[u8], read: &mut [u8]) -> Result<usize> {
        self.bus()?
            .write_read(write, read)
            .map_err(|e| Error::bus(self.handle.id(), "write read", e))
    }

    fn process_call(&self, register: u8, value: u16) -> Result<u16> {
        self.bus()?
            .process_call(register, value)
            .map_err(|e| Error::bus(self.handle.id(), "process call", e))
    }

    fn block_process_call_unchecked(&self, register: u8, data: &[u8]) -> Result<Vec<u8>> {
        self.bus()?
            .block_process_call(register, data)
            .map_err(|e| Error::bus(self.handle.id(), "block process call", e))
    }
}

pub struct LinuxFsI2cProvider {
    identity: Identity,
    root: Root,
}

super::linux_provider!(
    LinuxFsI2cProvider,
    "linuxfs-i2c",
    "Linux i2c-dev",
    super::KEY_I2C_PATH,
    super::DEFAULT_I2C_PATH
);

impl LinuxFsI2cProvider {
    /// Character device of bus `bus`.
    pub fn device_path(&self, bus: u32) -> PathBuf {
        self.root().join(format!("i2c-{}", bus))
    }
}

impl I2cProvider for LinuxFsI2cProvider {
    fn create(&self, _ctx: &Context, config: I2cConfig) -> Result<Arc<dyn I2c>> {
        let bus = Bus::open(self.device_path(config.bus), config.device)?;
        debug!(
            id = %config.base.id,
            bus = config.bus,
            device = config.device,
            functionality = ?bus.functionality,
            "I2C device opened"
        );
        Ok(Arc::new(LinuxFsI2c {
            handle: LinuxHandle::new(config.identity(), self.identity.id()),
            config,
            bus: Mutex::new(bus),
        }))
    }
}
