// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Endpoint state shared by the lifecycle and data-path code.

use crate::channel::ChannelManager;
use crate::channel::ChannelState;
use crate::mapping::DmaDirection;
use crate::mapping::DmaMapper;
use crate::packet::Packet;
use crate::packet::PacketStatus;
use crate::ring::ChannelId;
use crate::ring::Direction;
use crate::ring::Moderation;
use crate::ring::NotifyMode;
use crate::ring::RingCompletion;
use crate::ring::RingEventSink;
use crate::ring::RingTransport;
use crate::work::ScheduleFlag;
use crate::work::WorkQueue;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use slab::Slab;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

/// How a multi-buffer packet is signaled to the hardware.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// Buffers are chained; only the last one raises an event.
    #[default]
    Packet,
    /// Every buffer raises an event; only the last one ends the packet.
    Streaming,
}

/// Parameters for a new endpoint. Unset values come from the engine's
/// hardware configuration.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Transfer direction.
    pub direction: Direction,
    /// How chained buffers are signaled.
    pub stream_mode: StreamMode,
    /// Maximum tracked packets.
    pub ring_len: Option<usize>,
    /// Maximum buffers per packet.
    pub max_chain: Option<usize>,
    /// Interrupt moderation.
    pub moderation: Option<Moderation>,
    /// Notification mode after allocation.
    pub initial_mode: NotifyMode,
    /// See [`Self::eventless`].
    pub eventless: bool,
    /// See [`Self::exception`].
    pub exception: bool,
}

impl EndpointConfig {
    /// Returns a packet-mode IRQ configuration with hardware defaults.
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            stream_mode: StreamMode::Packet,
            ring_len: None,
            max_chain: None,
            moderation: None,
            initial_mode: NotifyMode::Irq,
            eventless: false,
            exception: false,
        }
    }

    /// Sets the ring length.
    pub fn with_ring_len(mut self, ring_len: usize) -> Self {
        self.ring_len = Some(ring_len);
        self
    }

    /// Sets the maximum chain length.
    pub fn with_max_chain(mut self, max_chain: usize) -> Self {
        self.max_chain = Some(max_chain);
        self
    }

    /// Sets the interrupt moderation.
    pub fn with_moderation(mut self, moderation: Moderation) -> Self {
        self.moderation = Some(moderation);
        self
    }

    /// Sets the stream mode.
    pub fn with_stream_mode(mut self, stream_mode: StreamMode) -> Self {
        self.stream_mode = stream_mode;
        self
    }

    /// Sets the initial notification mode.
    pub fn with_mode(mut self, mode: NotifyMode) -> Self {
        self.initial_mode = mode;
        self
    }

    /// The endpoint generates no completion events and tracks no packets.
    pub fn eventless(mut self) -> Self {
        self.eventless = true;
        self
    }

    /// The endpoint receives traffic that could not be routed elsewhere.
    pub fn exception(mut self) -> Self {
        self.exception = true;
        self
    }
}

/// Receives completion notifications for an endpoint.
///
/// Both methods run in worker context, never with endpoint locks held.
pub trait EndpointClient: Send + Sync {
    /// Packets whose transfers finished, in submission order. Also receives
    /// packets flushed by a reset.
    fn complete(&self, endpoint: &Endpoint, packets: Vec<Packet>) {
        let _ = (endpoint, packets);
    }

    /// Received packets are ready to be collected with `rx_poll`. Only sent
    /// while the endpoint is in IRQ mode.
    fn rx_ready(&self, endpoint: &Endpoint) {
        let _ = endpoint;
    }
}

/// Tracks one queued packet until its completion is delivered.
pub(crate) struct OutstandingPacket {
    pub packet: Packet,
    pub status: PacketStatus,
    pub done: bool,
}

pub(crate) struct EndpointState {
    pub lifecycle: ChannelState,
    pub mode: NotifyMode,
    pub valid: bool,
    pub disconnecting: bool,
    /// Arena of in-flight wrappers. The key is the descriptor cookie.
    pub wrappers: Slab<OutstandingPacket>,
    pub outstanding: VecDeque<usize>,
    pub completed: VecDeque<usize>,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub queued: AtomicU64,
    pub completed: AtomicU64,
    pub flushed: AtomicU64,
    pub rejected: AtomicU64,
    pub interrupts: AtomicU64,
    pub recycled: AtomicU64,
}

impl Counters {
    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// A snapshot of endpoint statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Packets accepted by `transmit`.
    pub queued: u64,
    /// Packets delivered back to the client.
    pub completed: u64,
    /// Packets returned by a reset.
    pub flushed: u64,
    /// Transmit calls rejected for lack of ring space.
    pub rejected: u64,
    /// Completion events received from the ring.
    pub interrupts: u64,
    /// Wrapper slots returned to the arena.
    pub recycled: u64,
    /// Packets currently queued to the ring.
    pub outstanding: usize,
    /// Packets completed and waiting for `rx_poll`.
    pub completed_pending: usize,
}

/// One direction of a hardware channel.
pub struct Endpoint {
    pub(crate) id: ChannelId,
    pub(crate) direction: Direction,
    pub(crate) stream_mode: StreamMode,
    pub(crate) ring_len: usize,
    pub(crate) max_chain: usize,
    pub(crate) eventless: bool,
    pub(crate) exception: bool,
    pub(crate) cache_high_water: usize,
    pub(crate) ring: Arc<dyn RingTransport>,
    pub(crate) mapper: Arc<dyn DmaMapper>,
    pub(crate) work_queue: Arc<WorkQueue>,
    pub(crate) manager: Arc<ChannelManager>,
    pub(crate) state: Mutex<EndpointState>,
    pub(crate) eot_ready: AtomicU32,
    pub(crate) scheduled: ScheduleFlag,
    pub(crate) client: Mutex<Option<Arc<dyn EndpointClient>>>,
    pub(crate) counters: Counters,
    pub(crate) this: Weak<Endpoint>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("ring_len", &self.ring_len)
            .finish()
    }
}

impl Endpoint {
    /// The hardware channel.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// The transfer direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// How chained buffers are signaled.
    pub fn stream_mode(&self) -> StreamMode {
        self.stream_mode
    }

    /// The maximum number of packets tracked at once.
    pub fn ring_len(&self) -> usize {
        self.ring_len
    }

    /// The maximum number of buffers per packet.
    pub fn max_chain(&self) -> usize {
        self.max_chain
    }

    /// Returns true if the endpoint tracks no packets.
    pub fn is_eventless(&self) -> bool {
        self.eventless
    }

    /// Returns true for the exception path endpoint.
    pub fn is_exception(&self) -> bool {
        self.exception
    }

    /// Returns true while transmits are accepted.
    pub fn is_valid(&self) -> bool {
        let state = self.state.lock();
        state.valid && !state.disconnecting
    }

    /// The current lifecycle state.
    pub fn lifecycle(&self) -> ChannelState {
        self.state.lock().lifecycle
    }

    /// Packets queued to the ring and not yet completed.
    pub fn outstanding_count(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Packets completed but not yet collected.
    pub fn completed_count(&self) -> usize {
        self.state.lock().completed.len()
    }

    /// Sets the client that receives completion notifications.
    pub fn set_client(&self, client: Arc<dyn EndpointClient>) {
        *self.client.lock() = Some(client);
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> EndpointStats {
        let (outstanding, completed_pending) = {
            let state = self.state.lock();
            (state.outstanding.len(), state.completed.len())
        };
        let c = &self.counters;
        EndpointStats {
            queued: c.queued.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            flushed: c.flushed.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            interrupts: c.interrupts.load(Ordering::Relaxed),
            recycled: c.recycled.load(Ordering::Relaxed),
            outstanding,
            completed_pending,
        }
    }

    pub(crate) fn dma_direction(&self) -> DmaDirection {
        match self.direction {
            Direction::Source => DmaDirection::ToDevice,
            Direction::Destination => DmaDirection::FromDevice,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock()
    }

    pub(crate) fn client(&self) -> Option<Arc<dyn EndpointClient>> {
        self.client.lock().clone()
    }

    /// Removes a wrapper from the arena, releasing its buffer mappings.
    pub(crate) fn retire(&self, state: &mut EndpointState, key: usize) -> Packet {
        let OutstandingPacket {
            mut packet,
            status,
            done: _,
        } = state.wrappers.remove(key);
        packet.unmap(self.mapper.as_ref(), self.dma_direction());
        packet.set_status(status);
        self.counters.recycled.fetch_add(1, Ordering::Relaxed);
        packet
    }

    /// Frees arena storage that grew past the cache high-water mark once it
    /// drains.
    pub(crate) fn trim_wrapper_cache(&self, state: &mut EndpointState) {
        if state.wrappers.is_empty() && state.wrappers.capacity() > self.cache_high_water {
            state.wrappers.shrink_to_fit();
            tracing::trace!(channel = %self.id, "wrapper cache trimmed");
        }
    }

    /// Recounts completed-but-undelivered packets. Call with the state lock
    /// held.
    pub(crate) fn recount_eot_ready(&self, state: &EndpointState) -> u32 {
        let done = state
            .outstanding
            .iter()
            .take_while(|&&key| state.wrappers[key].done)
            .count()
            + state.completed.len();
        self.eot_ready.store(done as u32, Ordering::Release);
        done as u32
    }
}

/// Forwards interrupt-time completions to the endpoint without keeping it
/// alive.
pub(crate) struct EndpointSink {
    pub endpoint: Weak<Endpoint>,
}

impl RingEventSink for EndpointSink {
    fn on_completion(&self, completion: RingCompletion) {
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.on_completion(completion);
        }
    }
}

pub(crate) fn new_state(mode: NotifyMode, ring_len: usize, cache_high_water: usize) -> EndpointState {
    EndpointState {
        lifecycle: ChannelState::Allocated,
        mode,
        valid: false,
        disconnecting: false,
        wrappers: Slab::with_capacity(ring_len.min(cache_high_water.max(1))),
        outstanding: VecDeque::with_capacity(ring_len),
        completed: VecDeque::new(),
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if self.state.get_mut().lifecycle != ChannelState::Deallocated {
            tracing::error!(channel = %self.id, "leaking channel");
        }
    }
}
