// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The memory-mapping contract used to make packet buffers device visible.

use thiserror::Error;

/// The direction data moves through a mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DmaDirection {
    /// The device reads the buffer.
    ToDevice,
    /// The device writes the buffer.
    FromDevice,
}

/// An error mapping a buffer.
#[allow(missing_docs)] // self-explanatory fields
#[derive(Debug, Error)]
pub enum MapError {
    #[error("no IOVA space for {len:#x} bytes")]
    OutOfSpace { len: usize },
    #[error("buffer of {len:#x} bytes cannot be mapped")]
    InvalidLength { len: usize },
}

/// Maps host buffers into device address space.
pub trait DmaMapper: Send + Sync {
    /// Maps `data` and returns its device address.
    ///
    /// For [`DmaDirection::ToDevice`] the device must observe the contents of
    /// `data` at the time of the call.
    fn map(&self, data: &[u8], direction: DmaDirection) -> Result<u64, MapError>;

    /// Unmaps a mapping returned by [`Self::map`].
    ///
    /// For [`DmaDirection::FromDevice`], the bytes the device wrote are copied
    /// into `data` before the mapping is released.
    fn unmap(&self, addr: u64, data: &mut [u8], direction: DmaDirection);
}
