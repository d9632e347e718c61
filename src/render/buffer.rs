use std::{cell::Cell, rc::Rc};

use crate::{
    Error, Result,
    context::GpuState,
    error::ResourceKind,
    gpu::{BufferTarget, RawBuffer},
    resources::registry::{RawHandle, Registration},
};

/// A device buffer holding vertex, index or uniform data.
#[derive(Debug)]
pub struct Buffer {
    registration: Registration,
    raw: Cell<RawBuffer>,
    target: BufferTarget,
    byte_length: Cell<usize>,
    version: Cell<u32>,
    label: String,
}

impl Buffer {
    pub fn new(state: &Rc<GpuState>, target: BufferTarget, data: &[u8], label: &str) -> Result<Self> {
        let raw = state
            .gpu()
            .create_buffer(target, data, label)
            .ok_or_else(|| Error::creation(ResourceKind::Buffer, label))?;
        Ok(Self {
            registration: Registration::new(state, RawHandle::Buffer(raw), label),
            raw: Cell::new(raw),
            target,
            byte_length: Cell::new(data.len()),
            version: Cell::new(0),
            label: label.to_string(),
        })
    }

    pub fn raw(&self) -> Result<RawBuffer> {
        self.registration.ensure_live()?;
        Ok(self.raw.get())
    }

    pub fn target(&self) -> BufferTarget {
        self.target
    }

    pub fn byte_length(&self) -> usize {
        self.byte_length.get()
    }

    /// Bumped by every write.
    pub fn version(&self) -> u32 {
        self.version.get()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Replaces the whole contents. A larger payload reallocates the device buffer.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let raw = self.raw()?;
        let state = self.registration.state();
        if data.len() > self.byte_length.get() {
            let grown = state
                .gpu()
                .create_buffer(self.target, data, &self.label)
                .ok_or_else(|| Error::creation(ResourceKind::Buffer, self.label.as_str()))?;
            state
                .registry()
                .replace(self.registration.id(), RawHandle::Buffer(grown));
            state.gpu().delete_buffer(raw);
            self.raw.set(grown);
            log::trace!("buffer `{}` grew to {} bytes", self.label, data.len());
        } else {
            state.gpu().write_buffer(raw, 0, data);
        }
        self.byte_length.set(data.len().max(self.byte_length.get()));
        self.version.set(self.version.get().wrapping_add(1));
        Ok(())
    }

    /// Overwrites `data.len()` bytes starting at `offset`.
    pub fn write_sub_data(&self, offset: usize, data: &[u8]) -> Result<()> {
        let raw = self.raw()?;
        if offset + data.len() > self.byte_length.get() {
            return Err(Error::OutOfBounds(format!(
                "{} bytes at offset {} exceed buffer `{}` of {} bytes",
                data.len(),
                offset,
                self.label,
                self.byte_length.get()
            )));
        }
        self.registration
            .state()
            .gpu()
            .write_buffer(raw, offset as u64, data);
        self.version.set(self.version.get().wrapping_add(1));
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        self.registration.is_disposed()
    }

    pub fn dispose(&self) {
        self.registration.dispose();
    }
}
