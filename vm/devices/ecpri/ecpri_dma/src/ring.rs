// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The ring transport contract.
//!
//! A ring transport owns the hardware transfer rings. The engine drives it
//! through [`RingTransport`] and receives interrupt-time completions through a
//! [`RingEventSink`] registered at channel allocation.

use bitfield_struct::bitfield;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A hardware channel number.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl ChannelId {
    /// Sentinel for "no channel", used in static channel tables.
    pub const INVALID: Self = Self(u32::MAX);

    /// Returns true unless this is [`Self::INVALID`].
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "ch{}", self.0)
        } else {
            f.write_str("ch-invalid")
        }
    }
}

/// The transfer direction of a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Host memory is read by the device (transmit).
    Source,
    /// Host memory is written by the device (receive).
    Destination,
}

/// How completions are reported.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NotifyMode {
    /// Completions are signaled through the channel's [`RingEventSink`].
    Irq,
    /// Completions accumulate until [`RingTransport::poll`] is called.
    Poll,
}

/// Interrupt moderation for a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Moderation {
    /// Interrupt coalescing timer in microseconds, 0 to disable.
    pub timer_us: u16,
    /// Number of completions to coalesce, 0 to disable.
    pub packet_count: u8,
}

/// Parameters for allocating a channel.
#[derive(Debug, Clone)]
pub struct ChannelParams {
    /// Transfer direction.
    pub direction: Direction,
    /// Number of descriptors the ring holds.
    pub ring_len: usize,
    /// Interrupt moderation.
    pub moderation: Moderation,
    /// No completion events are generated for this channel.
    pub eventless: bool,
    /// Notification mode the channel starts in.
    pub initial_mode: NotifyMode,
}

/// Control bits of a [`Descriptor`].
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct DescriptorFlags {
    /// More descriptors of the same packet follow.
    pub chain: bool,
    /// Last descriptor of a packet.
    pub eot: bool,
    /// Interrupt on end of this buffer.
    pub ieob: bool,
    /// Interrupt on end of transfer.
    pub ieot: bool,
    /// Block the event interrupt for this descriptor.
    pub bei: bool,
    #[bits(11)]
    __: u16,
}

/// One transfer descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Device address of the buffer.
    pub addr: u64,
    /// Buffer length in bytes.
    pub len: u32,
    /// Control bits.
    pub flags: DescriptorFlags,
    /// Opaque value returned in the matching [`RingCompletion`].
    pub cookie: u64,
}

/// Hardware completion status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompletionCode {
    /// The transfer finished.
    Success,
    /// The device wrote more data than the buffer holds.
    Overflow,
    /// The descriptor was discarded by a channel reset.
    Aborted,
    /// A device-specific error code.
    Hardware(u16),
}

/// A completion reported by the ring.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingCompletion {
    /// The cookie of the completed descriptor.
    pub cookie: u64,
    /// Bytes actually transferred.
    pub len: u32,
    /// Completion status.
    pub code: CompletionCode,
    /// This completion is for the last descriptor of a packet.
    pub eot: bool,
}

/// Receives completions in interrupt-equivalent context.
pub trait RingEventSink: Send + Sync {
    /// Called once per completion while the channel is in IRQ mode.
    fn on_completion(&self, completion: RingCompletion);
}

/// An error from the ring transport.
#[allow(missing_docs)] // self-explanatory variants
#[derive(Debug, Error)]
pub enum RingError {
    #[error("no hardware channel available for {0}")]
    NoChannel(ChannelId),
    #[error("ring full: {requested} requested, {available} available")]
    RingFull { requested: usize, available: usize },
    #[error("channel {0} is not allocated")]
    NotAllocated(ChannelId),
    #[error("channel {channel} cannot {op} in its current state")]
    InvalidState { channel: ChannelId, op: &'static str },
    #[error("channel {channel} hardware error {code:#x}")]
    Hardware { channel: ChannelId, code: u32 },
}

/// A hardware ring transfer primitive.
///
/// Implementations must never call a [`RingEventSink`] from within a call made
/// through this trait; the engine holds endpoint locks across these calls.
pub trait RingTransport: Send + Sync {
    /// Allocates channel `id` and registers `sink` for its completions.
    fn allocate(
        &self,
        id: ChannelId,
        params: &ChannelParams,
        sink: Arc<dyn RingEventSink>,
    ) -> Result<(), RingError>;
    /// Enables an allocated or disabled channel.
    fn enable(&self, id: ChannelId) -> Result<(), RingError>;
    /// Starts processing descriptors.
    fn start(&self, id: ChannelId) -> Result<(), RingError>;
    /// Stops processing descriptors. Queued descriptors are kept.
    fn stop(&self, id: ChannelId) -> Result<(), RingError>;
    /// Disables an enabled or stopped channel.
    fn disable(&self, id: ChannelId) -> Result<(), RingError>;
    /// Releases the channel. The sink is dropped.
    fn deallocate(&self, id: ChannelId) -> Result<(), RingError>;
    /// Discards every queued descriptor and pending completion.
    fn reset(&self, id: ChannelId) -> Result<(), RingError>;

    /// Queues `descriptors` as one batch: either all are queued or none are.
    ///
    /// If `commit` is set the doorbell is rung after queueing.
    fn queue_transfer(
        &self,
        id: ChannelId,
        descriptors: &[Descriptor],
        commit: bool,
    ) -> Result<(), RingError>;

    /// Makes every queued descriptor visible to the hardware.
    fn ring_doorbell(&self, id: ChannelId) -> Result<(), RingError>;

    /// Appends up to `budget` completions to `out`, returning the number
    /// appended.
    fn poll(
        &self,
        id: ChannelId,
        budget: usize,
        out: &mut Vec<RingCompletion>,
    ) -> Result<usize, RingError>;

    /// Switches between interrupt and polled completion reporting.
    fn set_notification_mode(&self, id: ChannelId, mode: NotifyMode) -> Result<(), RingError>;

    /// Reads channel scratch register `index`.
    fn read_scratch(&self, id: ChannelId, index: usize) -> Result<u32, RingError>;
    /// Writes channel scratch register `index`.
    fn write_scratch(&self, id: ChannelId, index: usize, value: u32) -> Result<(), RingError>;
}
