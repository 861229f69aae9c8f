// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Packets and the buffers they are chained from.

use crate::error::TransferError;
use crate::mapping::DmaDirection;
use crate::mapping::DmaMapper;
use crate::mapping::MapError;
use crate::ring::CompletionCode;

/// One contiguous piece of a packet.
///
/// A buffer either owns its bytes, in which case the engine maps it at
/// transmit time and unmaps it on completion, or refers to a range that is
/// already device visible.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    len: usize,
    addr: Option<u64>,
    engine_mapped: bool,
    actual_len: u32,
}

impl Buffer {
    /// Creates a buffer owning `data`.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            len: data.len(),
            data,
            addr: None,
            engine_mapped: false,
            actual_len: 0,
        }
    }

    /// Creates a zero-filled buffer for the device to write into.
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    /// Creates a buffer for an already mapped device address range.
    pub fn external(addr: u64, len: usize) -> Self {
        Self {
            data: Vec::new(),
            len,
            addr: Some(addr),
            engine_mapped: false,
            actual_len: 0,
        }
    }

    /// The buffer length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the buffer is zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The owned bytes. Empty for external buffers.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The valid prefix of the owned bytes after a receive completes.
    pub fn received(&self) -> &[u8] {
        let n = (self.actual_len as usize).min(self.data.len());
        &self.data[..n]
    }

    /// Consumes the buffer, returning the owned bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// The device address, if the buffer is mapped.
    pub fn addr(&self) -> Option<u64> {
        self.addr
    }

    /// The number of bytes the device reported transferring.
    pub fn actual_len(&self) -> u32 {
        self.actual_len
    }

    pub(crate) fn set_actual_len(&mut self, len: u32) {
        self.actual_len = len;
    }

    pub(crate) fn is_engine_mapped(&self) -> bool {
        self.engine_mapped
    }

    /// Maps the buffer if it has no device address yet.
    pub(crate) fn map(
        &mut self,
        mapper: &dyn DmaMapper,
        direction: DmaDirection,
    ) -> Result<(), MapError> {
        if self.addr.is_some() {
            return Ok(());
        }
        let addr = mapper.map(&self.data, direction)?;
        self.addr = Some(addr);
        self.engine_mapped = true;
        Ok(())
    }

    /// Releases a mapping made by [`Self::map`]. External ranges are left
    /// untouched.
    pub(crate) fn unmap(&mut self, mapper: &dyn DmaMapper, direction: DmaDirection) {
        if !self.is_engine_mapped() {
            return;
        }
        if let Some(addr) = self.addr.take() {
            mapper.unmap(addr, &mut self.data, direction);
        }
        self.engine_mapped = false;
    }
}

/// The completion state of a packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketStatus {
    /// Not yet completed.
    Pending,
    /// Transferred.
    Success,
    /// The hardware reported an error.
    Error(CompletionCode),
    /// Discarded by a channel reset before completing.
    Flushed,
}

impl PacketStatus {
    /// Converts a delivered packet's status into a transfer result. A packet
    /// that never completed counts as flushed.
    pub fn to_result(self) -> Result<(), TransferError> {
        match self {
            PacketStatus::Success => Ok(()),
            PacketStatus::Error(code) => Err(TransferError::Completion(code)),
            PacketStatus::Pending | PacketStatus::Flushed => Err(TransferError::Flushed),
        }
    }

    pub(crate) fn from_code(code: CompletionCode) -> Self {
        match code {
            CompletionCode::Success => PacketStatus::Success,
            CompletionCode::Aborted => PacketStatus::Flushed,
            code => PacketStatus::Error(code),
        }
    }
}

/// An ordered chain of buffers transferred as one unit.
#[derive(Debug)]
pub struct Packet {
    buffers: Vec<Buffer>,
    status: PacketStatus,
    tag: u64,
}

impl Packet {
    /// Creates a packet from a chain of buffers.
    pub fn new(buffers: Vec<Buffer>) -> Self {
        Self {
            buffers,
            status: PacketStatus::Pending,
            tag: 0,
        }
    }

    /// Creates a single-buffer packet.
    pub fn single(buffer: Buffer) -> Self {
        Self::new(vec![buffer])
    }

    /// Sets a caller-defined tag that travels with the packet.
    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    /// The tag set with [`Self::with_tag`], or 0.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// The completion state.
    pub fn status(&self) -> PacketStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: PacketStatus) {
        self.status = status;
    }

    /// The buffers in chain order.
    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub(crate) fn buffers_mut(&mut self) -> &mut [Buffer] {
        &mut self.buffers
    }

    /// Consumes the packet, returning its buffers.
    pub fn into_buffers(self) -> Vec<Buffer> {
        self.buffers
    }

    /// Total length of all buffers.
    pub fn len(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum()
    }

    /// Returns true if the packet carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes the device reported transferring.
    pub fn actual_len(&self) -> usize {
        self.buffers.iter().map(|b| b.actual_len() as usize).sum()
    }

    pub(crate) fn unmap(&mut self, mapper: &dyn DmaMapper, direction: DmaDirection) {
        for buffer in &mut self.buffers {
            buffer.unmap(mapper, direction);
        }
    }
}
