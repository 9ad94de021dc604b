//! Serial ports.

use std::sync::atomic::{AtomicBool, Ordering};

use super::transfer::RawTransfer;
use crate::config::SerialConfig;
use crate::error::{Error, Result};

/// A byte stream over a serial line.
///
/// Streams start closed. Reads and writes on a closed stream fail with
/// [`Error::NotOpen`]; `open` and `close` are idempotent.
pub trait Serial: RawTransfer {
    fn config(&self) -> &SerialConfig;

    fn open(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Bytes received and not yet read.
    fn available(&self) -> Result<usize>;

    /// Block until everything written has been transmitted.
    fn drain(&self) -> Result<()>;
}

/// Open/closed flag for stream handles.
#[derive(Debug, Default)]
pub struct StreamState {
    open: AtomicBool,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the stream open; returns false if it already was.
    pub fn open(&self) -> bool {
        !self.open.swap(true, Ordering::AcqRel)
    }

    /// Mark the stream closed; returns false if it already was.
    pub fn close(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn ensure_open(&self, id: &str) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::NotOpen { id: id.to_string() })
        }
    }
}
