//! Synthetic floppy channel for small host⇄guest messages.
//!
//! The channel is a fixed-size floppy image on the slot directory, attached
//! to the guest at registration. The image is split in half: the first half
//! carries host→guest messages, the second guest→host. Each half starts
//! with a little-endian length word; the payload bytes themselves are opaque
//! to the supervisor.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use vbox_core::error::{Result, VboxError};

/// Standard 1.44 MiB floppy geometry; anything else confuses the guest's
/// floppy driver.
pub const FLOPPY_IMAGE_SIZE: u64 = 1_474_560;

const HALF_SIZE: u64 = FLOPPY_IMAGE_SIZE / 2;
const HEADER_SIZE: u64 = 4;

/// Maximum payload one direction of the channel can carry.
pub const FLOPPY_PAYLOAD_CAPACITY: usize = (HALF_SIZE - HEADER_SIZE) as usize;

/// Owned handle on the floppy image backing the channel.
pub struct FloppyChannel {
    path: PathBuf,
}

impl FloppyChannel {
    /// Create the zero-filled image backing the channel.
    ///
    /// An existing image is reused as-is so an in-flight message survives a
    /// wrapper restart.
    pub fn create(path: &Path) -> Result<Self> {
        if !path.exists() {
            let file = File::create(path)
                .map_err(|err| VboxError::FloppyCreate(format!("{}: {}", path.display(), err)))?;
            file.set_len(FLOPPY_IMAGE_SIZE)
                .map_err(|err| VboxError::FloppyCreate(format!("{}: {}", path.display(), err)))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a host→guest message into the first half of the image.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        if data.len() > FLOPPY_PAYLOAD_CAPACITY {
            return Err(VboxError::FloppyCreate(format!(
                "message of {} bytes exceeds the floppy capacity of {} bytes",
                data.len(),
                FLOPPY_PAYLOAD_CAPACITY
            )));
        }
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&(data.len() as u32).to_le_bytes())?;
        file.write_all(data)?;
        file.flush()?;
        Ok(data.len())
    }

    /// Read the pending guest→host message from the second half of the
    /// image. An empty message means the guest has nothing to say.
    pub fn receive(&self) -> Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(HALF_SIZE))?;

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        let length = (u32::from_le_bytes(header) as usize).min(FLOPPY_PAYLOAD_CAPACITY);

        let mut payload = vec![0u8; length];
        file.read_exact(&mut payload)?;
        Ok(payload)
    }
}

impl crate::VboxVm {
    /// Read the pending guest→host blob. Only available when floppy IO was
    /// enabled and the medium was successfully created.
    pub fn read_floppy(&self) -> Result<Vec<u8>> {
        match (&self.floppy, self.descriptor.enable_floppyio) {
            (Some(channel), true) => channel.receive(),
            _ => Err(VboxError::NotFound("floppy channel".into())),
        }
    }

    /// Queue a host→guest blob, returning the byte count written.
    pub fn write_floppy(&self, data: &[u8]) -> Result<usize> {
        match (&self.floppy, self.descriptor.enable_floppyio) {
            (Some(channel), true) => channel.send(data),
            _ => Err(VboxError::NotFound("floppy channel".into())),
        }
    }
}
