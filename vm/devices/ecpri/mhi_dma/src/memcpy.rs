// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-function memcpy contexts.
//!
//! Each context owns a synchronous endpoint pair and, for the physical
//! function, an asynchronous pair. A copy is a destination descriptor posted
//! ahead of a source descriptor on a linked pair of channels; the hardware
//! moves the bytes and completes the destination side.
//!
//! State is split across three lock domains, always taken in the order
//! general, sync, async. The copy paths take only their own domain. Teardown
//! decisions take all three. Async submission also holds the queue guard,
//! ordered before the async lock, so that recovery of the async pair excludes
//! other submitters without holding the async lock itself.

use crate::function::FunctionIndex;
use crate::setup::ChannelArena;
use ecpri_dma::Backoff;
use ecpri_dma::Buffer;
use ecpri_dma::ChannelId;
use ecpri_dma::ChannelState;
use ecpri_dma::ConfigError;
use ecpri_dma::DmaEngine;
use ecpri_dma::DmaError;
use ecpri_dma::Direction;
use ecpri_dma::Endpoint;
use ecpri_dma::EndpointClient;
use ecpri_dma::EndpointConfig;
use ecpri_dma::NotifyMode;
use ecpri_dma::Packet;
use ecpri_dma::PollResult;
use ecpri_dma::StateError;
use ecpri_dma::TransferError;
use ecpri_dma::Work;
use ecpri_dma::WorkQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

/// Completion callback for [`MemcpyContext::async_memcpy`]. Any caller state
/// travels in the closure.
pub type MemcpyCallback = Box<dyn FnOnce(Result<(), DmaError>) + Send>;

/// Bounds on the blocking loops of a synchronous copy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemcpyLimits {
    /// Waits for another sync copy on the same function to finish before
    /// failing with [`DmaError::Busy`].
    pub acquire_attempts: u32,
    /// Waits for the copy to complete before failing with
    /// [`TransferError::Timeout`].
    pub wait_attempts: u32,
}

impl Default for MemcpyLimits {
    fn default() -> Self {
        Self {
            acquire_attempts: 1000,
            wait_attempts: 2000,
        }
    }
}

/// A snapshot of memcpy context counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemcpyStats {
    /// Outstanding [`MemcpyContext::enable`] references.
    pub ref_count: u32,
    /// Sync copies posted and not yet reaped.
    pub sync_pending: u32,
    /// Async copies whose callback has not run.
    pub async_pending: u32,
    /// Sync copies posted to the hardware.
    pub sync_total: u64,
    /// Async copies accepted.
    pub async_total: u64,
    /// The last reference is gone and no new copies are accepted.
    pub destroy_pending: bool,
}

struct General {
    ref_count: u32,
}

struct SyncState {
    /// A sync copy owns the pair.
    busy: bool,
    /// Sync copies posted and not yet reaped, including timed out ones.
    pending: u32,
    next_tag: u64,
    total: u64,
}

struct PendingCopy {
    tag: u64,
    callback: MemcpyCallback,
}

type Finished = (MemcpyCallback, Result<(), TransferError>);

struct AsyncState {
    copies: VecDeque<PendingCopy>,
    /// Virtual function copies accepted whose callback has not run.
    deferred: u32,
    /// The async pair is being recovered. Callbacks are held in `held`
    /// until both endpoints run again.
    recovering: bool,
    held: Vec<Finished>,
    next_tag: u64,
    total: u64,
}

impl AsyncState {
    fn pending(&self) -> u32 {
        (self.copies.len() + self.held.len()) as u32 + self.deferred
    }
}

struct AsyncPair {
    src: Arc<Endpoint>,
    dest: Arc<Endpoint>,
}

/// The memcpy state of one function.
pub struct MemcpyContext {
    index: FunctionIndex,
    sync_src: Arc<Endpoint>,
    sync_dest: Arc<Endpoint>,
    async_pair: Option<AsyncPair>,
    general: Mutex<General>,
    sync_state: Mutex<SyncState>,
    /// Held across async submission and recovery of the async pair.
    async_queue: Mutex<()>,
    async_state: Mutex<AsyncState>,
    /// Set while the reference count is non-zero.
    active: AtomicBool,
    destroy_pending: AtomicBool,
    arena: Mutex<Option<ChannelArena>>,
    work_queue: Arc<WorkQueue>,
    max_len: u64,
    limits: MemcpyLimits,
}

struct AsyncClient {
    context: Weak<MemcpyContext>,
}

impl EndpointClient for AsyncClient {
    fn complete(&self, _endpoint: &Endpoint, packets: Vec<Packet>) {
        if let Some(context) = self.context.upgrade() {
            context.complete_async(packets);
        }
    }

    fn rx_ready(&self, endpoint: &Endpoint) {
        if let Some(context) = self.context.upgrade() {
            context.collect_async(endpoint);
        }
    }
}

/// Runs a virtual function's async callback after its copy has already
/// finished synchronously.
struct CallbackWork {
    context: Arc<MemcpyContext>,
    callback: Mutex<Option<MemcpyCallback>>,
}

impl Work for CallbackWork {
    fn run(self: Arc<Self>) {
        if let Some(callback) = self.callback.lock().take() {
            callback(Ok(()));
        }
        let mut state = self.context.async_state.lock();
        state.deferred = state.deferred.saturating_sub(1);
    }
}

fn open(
    arena: &mut ChannelArena,
    engine: &DmaEngine,
    id: ChannelId,
    config: EndpointConfig,
) -> Result<Arc<Endpoint>, DmaError> {
    let endpoint = arena.allocate(engine, id, config)?;
    arena.enable(&endpoint)?;
    Ok(endpoint)
}

type Endpoints = (Arc<Endpoint>, Arc<Endpoint>, Option<AsyncPair>);

fn open_all(
    arena: &mut ChannelArena,
    engine: &DmaEngine,
    index: FunctionIndex,
) -> Result<Endpoints, DmaError> {
    let channels = index.channels();
    let ring_len = engine.config().memcpy_ring_len;
    let src_config = || {
        EndpointConfig::new(Direction::Source)
            .eventless()
            .with_ring_len(ring_len)
            .with_max_chain(1)
    };
    let dest_config = |mode| {
        EndpointConfig::new(Direction::Destination)
            .with_ring_len(ring_len)
            .with_max_chain(1)
            .with_mode(mode)
    };
    let sync_src = open(arena, engine, channels.sync_src, src_config())?;
    let sync_dest = open(arena, engine, channels.sync_dest, dest_config(NotifyMode::Poll))?;
    let async_pair = if index.is_physical() {
        let src = open(arena, engine, channels.async_src, src_config())?;
        let dest = open(arena, engine, channels.async_dest, dest_config(NotifyMode::Irq))?;
        Some(AsyncPair { src, dest })
    } else {
        None
    };
    Ok((sync_src, sync_dest, async_pair))
}

impl MemcpyContext {
    /// Allocates and enables the function's memcpy endpoints. On failure
    /// everything allocated so far is torn down again.
    pub fn init(
        engine: &DmaEngine,
        index: FunctionIndex,
        limits: MemcpyLimits,
    ) -> Result<Arc<Self>, DmaError> {
        let mut arena = ChannelArena::new();
        let (sync_src, sync_dest, async_pair) = match open_all(&mut arena, engine, index) {
            Ok(endpoints) => endpoints,
            Err(err) => {
                tracing::error!(
                    function = index.get(),
                    error = &err as &dyn std::error::Error,
                    "failed to initialize memcpy channels"
                );
                arena.destroy();
                return Err(err);
            }
        };

        let context = Arc::new(Self {
            index,
            sync_src,
            sync_dest,
            async_pair,
            general: Mutex::new(General { ref_count: 0 }),
            sync_state: Mutex::new(SyncState {
                busy: false,
                pending: 0,
                next_tag: 1,
                total: 0,
            }),
            async_queue: Mutex::new(()),
            async_state: Mutex::new(AsyncState {
                copies: VecDeque::new(),
                deferred: 0,
                recovering: false,
                held: Vec::new(),
                next_tag: 1,
                total: 0,
            }),
            active: AtomicBool::new(false),
            destroy_pending: AtomicBool::new(false),
            arena: Mutex::new(Some(arena)),
            work_queue: engine.work_queue().clone(),
            max_len: engine.config().max_single_packet_size,
            limits,
        });
        if let Some(pair) = &context.async_pair {
            pair.dest.set_client(Arc::new(AsyncClient {
                context: Arc::downgrade(&context),
            }));
        }
        tracing::info!(
            function = index.get(),
            async_path = context.async_pair.is_some(),
            "memcpy context initialized"
        );
        Ok(context)
    }

    /// The function this context belongs to.
    pub fn index(&self) -> FunctionIndex {
        self.index
    }

    fn endpoints(&self) -> Vec<&Arc<Endpoint>> {
        let mut endpoints = vec![&self.sync_src, &self.sync_dest];
        if let Some(pair) = &self.async_pair {
            endpoints.push(&pair.src);
            endpoints.push(&pair.dest);
        }
        endpoints
    }

    /// Takes a reference. The first reference starts the endpoints. Returns
    /// the new reference count.
    pub fn enable(&self) -> Result<u32, DmaError> {
        let mut general = self.general.lock();
        if self.destroy_pending.load(Ordering::Acquire) {
            return Err(StateError::DestroyPending.into());
        }
        if general.ref_count == 0 {
            let endpoints = self.endpoints();
            for (i, endpoint) in endpoints.iter().enumerate() {
                if let Err(err) = endpoint.start() {
                    for started in endpoints[..i].iter().rev() {
                        if let Err(err) = started.stop() {
                            tracing::error!(
                                channel = %started.id(),
                                error = &err as &dyn std::error::Error,
                                "failed to stop memcpy channel"
                            );
                        }
                    }
                    return Err(err);
                }
            }
            self.active.store(true, Ordering::Release);
            tracing::info!(function = self.index.get(), "memcpy enabled");
        }
        general.ref_count += 1;
        Ok(general.ref_count)
    }

    /// Drops a reference. The last reference stops the endpoints and marks
    /// the context for destruction.
    ///
    /// Fails with [`DmaError::Busy`], changing nothing, while any copy is
    /// pending. Returns the new reference count.
    pub fn disable(&self) -> Result<u32, DmaError> {
        let mut general = self.general.lock();
        let mut sync = self.sync_state.lock();
        let _queue = self.async_queue.lock();
        let async_state = self.async_state.lock();
        if general.ref_count == 0 {
            return Err(StateError::NotEnabled.into());
        }
        if !sync.busy && sync.pending > 0 {
            self.reap_stale_sync(&mut sync);
        }
        if sync.busy || sync.pending > 0 || async_state.pending() > 0 {
            tracing::debug!(
                function = self.index.get(),
                sync_pending = sync.pending,
                async_pending = async_state.pending(),
                "memcpy disable deferred"
            );
            return Err(DmaError::Busy);
        }
        general.ref_count -= 1;
        if general.ref_count == 0 {
            self.active.store(false, Ordering::Release);
            self.destroy_pending.store(true, Ordering::Release);
            for endpoint in self.endpoints().into_iter().rev() {
                if let Err(err) = endpoint.stop() {
                    tracing::error!(
                        channel = %endpoint.id(),
                        error = &err as &dyn std::error::Error,
                        "failed to stop memcpy channel"
                    );
                }
            }
            tracing::info!(function = self.index.get(), "memcpy disabled");
        }
        Ok(general.ref_count)
    }

    /// Tears down the endpoints in reverse order of creation. Valid only once
    /// the last reference is dropped and nothing is pending.
    pub fn destroy(&self) -> Result<(), DmaError> {
        let arena = {
            let _general = self.general.lock();
            let sync = self.sync_state.lock();
            let async_state = self.async_state.lock();
            if !self.destroy_pending.load(Ordering::Acquire) {
                return Err(StateError::DestroyNotPending.into());
            }
            if sync.pending > 0 || async_state.pending() > 0 {
                return Err(DmaError::Busy);
            }
            self.arena.lock().take()
        };
        // Reset may call back into the async client, so no context locks here.
        let arena = arena.ok_or(StateError::NotInitialized)?;
        arena.destroy();
        tracing::info!(function = self.index.get(), "memcpy context destroyed");
        Ok(())
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> MemcpyStats {
        let general = self.general.lock();
        let sync = self.sync_state.lock();
        let async_state = self.async_state.lock();
        MemcpyStats {
            ref_count: general.ref_count,
            sync_pending: sync.pending,
            async_pending: async_state.pending(),
            sync_total: sync.total,
            async_total: async_state.total,
            destroy_pending: self.destroy_pending.load(Ordering::Acquire),
        }
    }

    fn check_copy(&self, dest: u64, src: u64, len: u64) -> Result<(), ConfigError> {
        if len == 0 {
            return Err(ConfigError::ZeroLengthCopy);
        }
        if len > self.max_len {
            return Err(ConfigError::CopyTooLarge {
                len,
                max: self.max_len,
            });
        }
        let src_end = src.checked_add(len).ok_or(ConfigError::InvalidParameter {
            name: "src",
            value: src,
        })?;
        let dest_end = dest.checked_add(len).ok_or(ConfigError::InvalidParameter {
            name: "dest",
            value: dest,
        })?;
        if src < dest_end && dest < src_end {
            return Err(ConfigError::OverlappingCopy { dest, src, len });
        }
        Ok(())
    }

    fn check_accepting(&self) -> Result<(), StateError> {
        if self.destroy_pending.load(Ordering::Acquire) {
            return Err(StateError::DestroyPending);
        }
        if !self.active.load(Ordering::Acquire) {
            return Err(StateError::NotEnabled);
        }
        Ok(())
    }

    /// Discards every descriptor on a copy pair after one half of a copy
    /// could not be queued. Both endpoints are stopped before either is reset
    /// so that no stale source descriptor survives to pair with a later
    /// destination. Returns true once both run again.
    ///
    /// The caller must keep other submitters off the pair.
    fn recover(&self, src: &Endpoint, dest: &Endpoint) -> bool {
        let r = (|| -> Result<(), DmaError> {
            for endpoint in [dest, src] {
                if endpoint.lifecycle() == ChannelState::Started {
                    endpoint.stop()?;
                }
            }
            src.reset()?;
            dest.reset()?;
            src.start()?;
            dest.start()
        })();
        match r {
            Ok(()) => {
                tracing::debug!(
                    function = self.index.get(),
                    src = %src.id(),
                    dest = %dest.id(),
                    "memcpy pair recovered"
                );
                true
            }
            Err(err) => {
                tracing::error!(
                    function = self.index.get(),
                    src = %src.id(),
                    dest = %dest.id(),
                    error = &err as &dyn std::error::Error,
                    "failed to recover memcpy pair"
                );
                false
            }
        }
    }

    /// Copies `len` bytes from device address `src` to `dest`, blocking until
    /// the copy completes.
    ///
    /// At most one sync copy per function is in flight. Invalid ranges are
    /// rejected before any ring access.
    pub fn sync_memcpy(&self, dest: u64, src: u64, len: u64) -> Result<(), DmaError> {
        self.check_copy(dest, src, len)?;
        self.sync_copy(dest, src, len)
    }

    fn sync_copy(&self, dest: u64, src: u64, len: u64) -> Result<(), DmaError> {
        let tag = self.acquire_sync()?;
        let r = self.sync_transfer(tag, dest, src, len as usize);
        self.sync_state.lock().busy = false;
        r
    }

    fn acquire_sync(&self) -> Result<u64, DmaError> {
        let mut backoff = Backoff::new(self.limits.acquire_attempts);
        loop {
            {
                let mut sync = self.sync_state.lock();
                self.check_accepting()?;
                if !sync.busy {
                    sync.busy = true;
                    sync.pending += 1;
                    let tag = sync.next_tag;
                    sync.next_tag += 1;
                    return Ok(tag);
                }
            }
            if !backoff.back_off() {
                tracing::debug!(function = self.index.get(), "sync memcpy contended");
                return Err(DmaError::Busy);
            }
        }
    }

    fn sync_transfer(&self, tag: u64, dest: u64, src: u64, len: usize) -> Result<(), DmaError> {
        let dest_packet = Packet::single(Buffer::external(dest, len)).with_tag(tag);
        if let Err(err) = self.sync_dest.transmit(vec![dest_packet], true) {
            let mut sync = self.sync_state.lock();
            sync.pending = sync.pending.saturating_sub(1);
            return Err(err.into());
        }
        self.sync_state.lock().total += 1;

        let src_packet = Packet::single(Buffer::external(src, len));
        if let Err(err) = self.sync_src.transmit(vec![src_packet], true) {
            tracing::warn!(
                function = self.index.get(),
                error = &err as &dyn std::error::Error,
                "failed to queue sync memcpy source"
            );
            // The reset flushes this copy and every stale one.
            if self.recover(&self.sync_src, &self.sync_dest) {
                self.sync_state.lock().pending = 0;
            }
            return Err(err.into());
        }

        let mut backoff = Backoff::new(self.limits.wait_attempts);
        let mut packets = Vec::with_capacity(1);
        loop {
            self.sync_dest.rx_poll(1, &mut packets)?;
            for packet in packets.drain(..) {
                {
                    let mut sync = self.sync_state.lock();
                    sync.pending = sync.pending.saturating_sub(1);
                }
                if packet.tag() == tag {
                    return packet.status().to_result().map_err(Into::into);
                }
                tracing::debug!(tag = packet.tag(), "reaped stale sync memcpy");
            }
            if !backoff.back_off() {
                tracing::warn!(function = self.index.get(), tag, "sync memcpy timed out");
                return Err(TransferError::Timeout.into());
            }
        }
    }

    /// Collects completions of timed out sync copies.
    fn reap_stale_sync(&self, sync: &mut SyncState) {
        let mut packets = Vec::new();
        loop {
            match self
                .sync_dest
                .rx_poll(self.sync_dest.ring_len(), &mut packets)
            {
                Ok(PollResult::Ready(_)) => {}
                Ok(PollResult::Empty) => break,
                Err(err) => {
                    tracing::warn!(
                        channel = %self.sync_dest.id(),
                        error = &err as &dyn std::error::Error,
                        "failed to reap sync memcpy"
                    );
                    break;
                }
            }
        }
        if !packets.is_empty() {
            tracing::debug!(count = packets.len(), "reaped stale sync memcpy");
        }
        sync.pending = sync.pending.saturating_sub(packets.len() as u32);
    }

    /// Starts a copy of `len` bytes from `src` to `dest` and returns. The
    /// callback runs from the work queue once the copy finishes.
    ///
    /// Virtual functions have no async channels: the copy runs synchronously
    /// and only the callback is deferred. If that copy fails the error is
    /// returned and the callback is dropped without running.
    pub fn async_memcpy(
        self: &Arc<Self>,
        dest: u64,
        src: u64,
        len: u64,
        callback: MemcpyCallback,
    ) -> Result<(), DmaError> {
        self.check_copy(dest, src, len)?;
        match &self.async_pair {
            Some(pair) => self.queue_async(pair, dest, src, len as usize, callback),
            None => self.deferred_async(dest, src, len, callback),
        }
    }

    fn queue_async(
        &self,
        pair: &AsyncPair,
        dest: u64,
        src: u64,
        len: usize,
        callback: MemcpyCallback,
    ) -> Result<(), DmaError> {
        let queue = self.async_queue.lock();
        let mut state = self.async_state.lock();
        self.check_accepting()?;
        let tag = state.next_tag;
        state.next_tag += 1;

        let dest_packet = Packet::single(Buffer::external(dest, len)).with_tag(tag);
        pair.dest.transmit(vec![dest_packet], true)?;
        let src_packet = Packet::single(Buffer::external(src, len));
        if let Err(err) = pair.src.transmit(vec![src_packet], true) {
            tracing::warn!(
                function = self.index.get(),
                error = &err as &dyn std::error::Error,
                "failed to queue async memcpy source"
            );
            // The dest reset completes queued copies through the async
            // client, which needs the async lock.
            state.recovering = true;
            drop(state);
            self.recover(&pair.src, &pair.dest);
            let held = {
                let mut state = self.async_state.lock();
                state.recovering = false;
                std::mem::take(&mut state.held)
            };
            drop(queue);
            for (callback, result) in held {
                callback(result.map_err(DmaError::from));
            }
            return Err(err.into());
        }
        state.copies.push_back(PendingCopy { tag, callback });
        state.total += 1;
        Ok(())
    }

    fn deferred_async(
        self: &Arc<Self>,
        dest: u64,
        src: u64,
        len: u64,
        callback: MemcpyCallback,
    ) -> Result<(), DmaError> {
        {
            let mut state = self.async_state.lock();
            self.check_accepting()?;
            state.deferred += 1;
        }
        if let Err(err) = self.sync_copy(dest, src, len) {
            let mut state = self.async_state.lock();
            state.deferred = state.deferred.saturating_sub(1);
            return Err(err);
        }
        self.async_state.lock().total += 1;
        self.work_queue.schedule(Arc::new(CallbackWork {
            context: self.clone(),
            callback: Mutex::new(Some(callback)),
        }));
        Ok(())
    }

    fn collect_async(&self, dest: &Endpoint) {
        let mut packets = Vec::new();
        loop {
            match dest.rx_poll(dest.ring_len(), &mut packets) {
                Ok(PollResult::Ready(_)) => {}
                Ok(PollResult::Empty) => break,
                Err(err) => {
                    tracing::error!(
                        channel = %dest.id(),
                        error = &err as &dyn std::error::Error,
                        "failed to collect async memcpy completions"
                    );
                    break;
                }
            }
        }
        self.complete_async(packets);
    }

    fn complete_async(&self, packets: Vec<Packet>) {
        let done = {
            let mut state = self.async_state.lock();
            let mut done = Vec::with_capacity(packets.len());
            for packet in packets {
                let i = state.copies.iter().position(|c| c.tag == packet.tag());
                let Some(copy) = i.and_then(|i| state.copies.remove(i)) else {
                    tracing::debug!(tag = packet.tag(), "dropping orphaned async memcpy");
                    continue;
                };
                done.push((copy.callback, packet.status().to_result()));
            }
            if state.recovering {
                state.held.append(&mut done);
            }
            done
        };
        for (callback, result) in done {
            callback(result.map_err(DmaError::from));
        }
    }
}
