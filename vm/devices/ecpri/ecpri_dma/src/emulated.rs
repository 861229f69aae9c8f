// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A software implementation of the ring transport and memory mapping
//! contracts.
//!
//! [`EmulatedRing`] behaves like the hardware as far as the engine can tell:
//! descriptors become visible on the doorbell, run only while the channel is
//! started, and complete in ring order. Source channels either copy into a
//! linked destination channel (a memcpy pair) or transmit onto a "wire" that
//! tests inspect with [`EmulatedRing::transmitted`]. Destination channels
//! receive frames injected with [`EmulatedRing::inject_rx`].
//!
//! Hardware runs only when [`EmulatedRing::process`] or
//! [`RingTransport::poll`] is called. Sinks are only called from `process`,
//! so the caller decides where interrupt-time work happens.

use crate::mapping::DmaDirection;
use crate::mapping::DmaMapper;
use crate::mapping::MapError;
use crate::ring::ChannelId;
use crate::ring::ChannelParams;
use crate::ring::CompletionCode;
use crate::ring::Descriptor;
use crate::ring::Direction;
use crate::ring::NotifyMode;
use crate::ring::RingCompletion;
use crate::ring::RingError;
use crate::ring::RingEventSink;
use crate::ring::RingTransport;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

const PAGE_SIZE: usize = 4096;
/// Device address of the first byte of emulated memory.
const MEMORY_BASE: u64 = 0x1000_0000;
/// Scratch registers per channel.
pub const SCRATCH_REGISTERS: usize = 4;
/// Descriptor slots per ring entry.
const DESCRIPTORS_PER_ENTRY: usize = 8;
/// Completion code for a descriptor that points outside emulated memory.
pub const HW_ERROR_BAD_ADDRESS: u16 = 0x10;

/// An access outside of an allocated range of emulated memory.
#[derive(Debug, Error)]
#[error("access of {len:#x} bytes at {addr:#x} is out of range")]
#[allow(missing_docs)] // self-explanatory fields
pub struct AccessError {
    pub addr: u64,
    pub len: usize,
}

struct MemoryState {
    bytes: Vec<u8>,
    /// One bit per page, set if allocated.
    pages: Vec<u64>,
}

/// Device-visible memory with a page allocator.
pub struct EmulatedMemory {
    state: Mutex<MemoryState>,
}

impl EmulatedMemory {
    /// Creates `size` bytes of memory. `size` must be a multiple of 4KB.
    pub fn new(size: usize) -> Self {
        assert_eq!(size % PAGE_SIZE, 0);
        let page_count = size / PAGE_SIZE;
        Self {
            state: Mutex::new(MemoryState {
                bytes: vec![0; size],
                pages: vec![0; page_count.div_ceil(64)],
            }),
        }
    }

    /// Allocates a page-aligned range of at least `len` bytes.
    pub fn alloc(&self, len: usize) -> Option<u64> {
        let count = len.max(1).div_ceil(PAGE_SIZE);
        let mut state = self.state.lock();
        let page_count = state.bytes.len() / PAGE_SIZE;

        // Find a contiguous free range by scanning the page bitmap.
        let mut i = 0;
        let mut contig = 0;
        while contig < count && i < page_count {
            if state.pages[i / 64] & (1 << (i % 64)) != 0 {
                contig = 0;
            } else {
                contig += 1;
            }
            i += 1;
        }
        if contig < count {
            return None;
        }
        let start = i - contig;
        for j in start..i {
            state.pages[j / 64] |= 1 << (j % 64);
        }
        Some(MEMORY_BASE + (start * PAGE_SIZE) as u64)
    }

    /// Frees a range returned by [`Self::alloc`].
    pub fn free(&self, addr: u64, len: usize) {
        let count = len.max(1).div_ceil(PAGE_SIZE);
        let start = (addr - MEMORY_BASE) as usize / PAGE_SIZE;
        let mut state = self.state.lock();
        for j in start..start + count {
            state.pages[j / 64] &= !(1 << (j % 64));
        }
    }

    /// The number of allocated pages.
    pub fn allocated_pages(&self) -> usize {
        let state = self.state.lock();
        state.pages.iter().map(|w| w.count_ones() as usize).sum()
    }

    fn range(&self, bytes: &[u8], addr: u64, len: usize) -> Result<usize, AccessError> {
        let err = AccessError { addr, len };
        let offset = addr.checked_sub(MEMORY_BASE).ok_or(AccessError { addr, len })? as usize;
        match offset.checked_add(len) {
            Some(end) if end <= bytes.len() => Ok(offset),
            _ => Err(err),
        }
    }

    /// Copies `data.len()` bytes at `addr` into `data`.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), AccessError> {
        let state = self.state.lock();
        let offset = self.range(&state.bytes, addr, data.len())?;
        data.copy_from_slice(&state.bytes[offset..offset + data.len()]);
        Ok(())
    }

    /// Copies `data` to `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), AccessError> {
        let mut state = self.state.lock();
        let offset = self.range(&state.bytes, addr, data.len())?;
        state.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// A [`DmaMapper`] that bounces buffers through [`EmulatedMemory`].
pub struct EmulatedMapper {
    memory: Arc<EmulatedMemory>,
    mapped: AtomicUsize,
    /// Map calls to allow before failing one.
    fail_after: Mutex<Option<usize>>,
}

impl EmulatedMapper {
    /// Creates a mapper allocating from `memory`.
    pub fn new(memory: Arc<EmulatedMemory>) -> Self {
        Self {
            memory,
            mapped: AtomicUsize::new(0),
            fail_after: Mutex::new(None),
        }
    }

    /// Makes the map call after the next `n` successful ones fail.
    pub fn fail_after(&self, n: usize) {
        *self.fail_after.lock() = Some(n);
    }

    /// The number of live mappings.
    pub fn mapped(&self) -> usize {
        self.mapped.load(Ordering::SeqCst)
    }
}

impl DmaMapper for EmulatedMapper {
    fn map(&self, data: &[u8], direction: DmaDirection) -> Result<u64, MapError> {
        {
            let mut fail_after = self.fail_after.lock();
            match *fail_after {
                Some(0) => {
                    *fail_after = None;
                    return Err(MapError::OutOfSpace { len: data.len() });
                }
                Some(ref mut n) => *n -= 1,
                None => {}
            }
        }
        let addr = self
            .memory
            .alloc(data.len())
            .ok_or(MapError::OutOfSpace { len: data.len() })?;
        let contents = match direction {
            DmaDirection::ToDevice => data.to_vec(),
            DmaDirection::FromDevice => vec![0; data.len()],
        };
        if self.memory.write(addr, &contents).is_err() {
            self.memory.free(addr, data.len());
            return Err(MapError::InvalidLength { len: data.len() });
        }
        self.mapped.fetch_add(1, Ordering::SeqCst);
        Ok(addr)
    }

    fn unmap(&self, addr: u64, data: &mut [u8], direction: DmaDirection) {
        if direction == DmaDirection::FromDevice {
            if let Err(err) = self.memory.read(addr, data) {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to copy back device data"
                );
            }
        }
        self.memory.free(addr, data.len());
        self.mapped.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum HwState {
    Allocated,
    Enabled,
    Running,
    Stopped,
    Disabled,
}

struct EmulatedChannel {
    params: ChannelParams,
    sink: Arc<dyn RingEventSink>,
    hw: HwState,
    mode: NotifyMode,
    paused: bool,
    /// Queued but not yet made visible by the doorbell.
    queued: Vec<Descriptor>,
    /// Visible to the hardware.
    posted: VecDeque<Descriptor>,
    completions: VecDeque<RingCompletion>,
    scratch: [u32; SCRATCH_REGISTERS],
    link: Option<ChannelId>,
    rx_frames: VecDeque<Vec<u8>>,
    frame: Vec<u8>,
    transmitted: Vec<Vec<u8>>,
    doorbells: usize,
}

impl EmulatedChannel {
    fn runnable(&self) -> bool {
        self.hw == HwState::Running && !self.paused
    }

    fn complete(&mut self, desc: &Descriptor, len: u32, code: CompletionCode) {
        let flags = desc.flags;
        if flags.bei() {
            return;
        }
        if code != CompletionCode::Success || flags.ieob() || (flags.eot() && flags.ieot()) {
            self.completions.push_back(RingCompletion {
                cookie: desc.cookie,
                len,
                code,
                eot: flags.eot(),
            });
        }
    }

    fn capacity(&self) -> usize {
        self.params.ring_len * DESCRIPTORS_PER_ENTRY
    }
}

#[derive(Default)]
struct RingState {
    channels: BTreeMap<ChannelId, EmulatedChannel>,
    fail_allocate: BTreeSet<ChannelId>,
    fail_queue: usize,
}

/// A software [`RingTransport`].
pub struct EmulatedRing {
    memory: Arc<EmulatedMemory>,
    state: Mutex<RingState>,
    ops: AtomicUsize,
}

impl EmulatedRing {
    /// Creates a ring whose descriptors address `memory`.
    pub fn new(memory: Arc<EmulatedMemory>) -> Self {
        Self {
            memory,
            state: Default::default(),
            ops: AtomicUsize::new(0),
        }
    }

    /// The memory descriptors address.
    pub fn memory(&self) -> &Arc<EmulatedMemory> {
        &self.memory
    }

    /// The number of [`RingTransport`] calls made so far.
    pub fn op_count(&self) -> usize {
        self.ops.load(Ordering::SeqCst)
    }

    /// Connects a source channel to a destination channel: each source
    /// descriptor is copied into the next posted destination descriptor.
    pub fn link_memcpy(&self, source: ChannelId, destination: ChannelId) {
        if let Some(channel) = self.state.lock().channels.get_mut(&source) {
            channel.link = Some(destination);
        }
    }

    /// Queues a frame for delivery to a destination channel.
    pub fn inject_rx(&self, id: ChannelId, data: Vec<u8>) {
        if let Some(channel) = self.state.lock().channels.get_mut(&id) {
            channel.rx_frames.push_back(data);
        }
    }

    /// Frames transmitted by an unlinked source channel.
    pub fn transmitted(&self, id: ChannelId) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .channels
            .get(&id)
            .map(|c| c.transmitted.clone())
            .unwrap_or_default()
    }

    /// Stops the hardware from consuming descriptors on a channel.
    pub fn set_paused(&self, id: ChannelId, paused: bool) {
        if let Some(channel) = self.state.lock().channels.get_mut(&id) {
            channel.paused = paused;
        }
    }

    /// Makes allocation of `id` fail.
    pub fn fail_allocate(&self, id: ChannelId) {
        self.state.lock().fail_allocate.insert(id);
    }

    /// Makes the next `n` transfer queue calls fail.
    pub fn fail_queue_transfers(&self, n: usize) {
        self.state.lock().fail_queue = n;
    }

    /// Returns true if `id` is allocated.
    pub fn is_allocated(&self, id: ChannelId) -> bool {
        self.state.lock().channels.contains_key(&id)
    }

    /// Returns true if `id` has been started and not stopped since.
    pub fn is_running(&self, id: ChannelId) -> bool {
        self.state
            .lock()
            .channels
            .get(&id)
            .is_some_and(|c| c.hw == HwState::Running)
    }

    /// The notification mode last set on `id`.
    pub fn mode(&self, id: ChannelId) -> Option<NotifyMode> {
        self.state.lock().channels.get(&id).map(|c| c.mode)
    }

    /// The number of doorbells rung on `id`.
    pub fn doorbells(&self, id: ChannelId) -> usize {
        self.state
            .lock()
            .channels
            .get(&id)
            .map_or(0, |c| c.doorbells)
    }

    /// Descriptors queued or posted and not yet consumed.
    pub fn pending_descriptors(&self, id: ChannelId) -> usize {
        self.state
            .lock()
            .channels
            .get(&id)
            .map_or(0, |c| c.queued.len() + c.posted.len())
    }

    /// Runs the hardware for every channel, then delivers completions of IRQ
    /// mode channels to their sinks. Returns the number delivered.
    pub fn process(&self) -> usize {
        let deliveries = {
            let mut state = self.state.lock();
            let ids: Vec<ChannelId> = state.channels.keys().copied().collect();
            for id in ids {
                self.run(&mut state, id);
            }
            let mut deliveries = Vec::new();
            for channel in state.channels.values_mut() {
                if channel.mode == NotifyMode::Irq {
                    for completion in channel.completions.drain(..) {
                        deliveries.push((channel.sink.clone(), completion));
                    }
                }
            }
            deliveries
        };
        let n = deliveries.len();
        for (sink, completion) in deliveries {
            sink.on_completion(completion);
        }
        n
    }

    fn run(&self, state: &mut RingState, id: ChannelId) {
        let Some(channel) = state.channels.get(&id) else {
            return;
        };
        match channel.params.direction {
            Direction::Source => self.run_source(state, id),
            Direction::Destination => self.run_destination(state, id),
        }
    }

    fn run_source(&self, state: &mut RingState, id: ChannelId) {
        let Some(channel) = state.channels.get_mut(&id) else {
            return;
        };
        if !channel.runnable() {
            return;
        }
        let link = channel.link;
        let mut posted = std::mem::take(&mut channel.posted);
        while let Some(desc) = posted.front().copied() {
            let mut data = vec![0; desc.len as usize];
            let code = match self.memory.read(desc.addr, &mut data) {
                Ok(()) => CompletionCode::Success,
                Err(_) => CompletionCode::Hardware(HW_ERROR_BAD_ADDRESS),
            };
            if let Some(dest_id) = link {
                let Some(dest) = state
                    .channels
                    .get_mut(&dest_id)
                    .filter(|dest| dest.runnable())
                else {
                    break;
                };
                let Some(dest_desc) = dest.posted.pop_front() else {
                    break;
                };
                let n = data.len().min(dest_desc.len as usize);
                let dest_code = if code != CompletionCode::Success {
                    code
                } else if self.memory.write(dest_desc.addr, &data[..n]).is_err() {
                    CompletionCode::Hardware(HW_ERROR_BAD_ADDRESS)
                } else if n < data.len() {
                    CompletionCode::Overflow
                } else {
                    CompletionCode::Success
                };
                dest.complete(&dest_desc, n as u32, dest_code);
            }
            posted.pop_front();
            let Some(channel) = state.channels.get_mut(&id) else {
                return;
            };
            channel.complete(&desc, desc.len, code);
            if link.is_none() {
                channel.frame.extend_from_slice(&data);
                if desc.flags.eot() {
                    let frame = std::mem::take(&mut channel.frame);
                    channel.transmitted.push(frame);
                }
            }
        }
        if let Some(channel) = state.channels.get_mut(&id) {
            channel.posted = posted;
        }
    }

    fn run_destination(&self, state: &mut RingState, id: ChannelId) {
        let Some(channel) = state.channels.get_mut(&id) else {
            return;
        };
        if !channel.runnable() {
            return;
        }
        while !channel.posted.is_empty() {
            let Some(frame) = channel.rx_frames.pop_front() else {
                break;
            };
            let mut offset = 0;
            while let Some(desc) = channel.posted.pop_front() {
                let n = (frame.len() - offset).min(desc.len as usize);
                let last = desc.flags.eot();
                let code = if self.memory.write(desc.addr, &frame[offset..offset + n]).is_err() {
                    CompletionCode::Hardware(HW_ERROR_BAD_ADDRESS)
                } else if last && offset + n < frame.len() {
                    CompletionCode::Overflow
                } else {
                    CompletionCode::Success
                };
                offset += n;
                channel.complete(&desc, n as u32, code);
                if last {
                    break;
                }
            }
        }
    }

    fn count(&self) {
        self.ops.fetch_add(1, Ordering::SeqCst);
    }

    fn with_channel<T>(
        &self,
        id: ChannelId,
        f: impl FnOnce(&mut EmulatedChannel) -> Result<T, RingError>,
    ) -> Result<T, RingError> {
        self.count();
        let mut state = self.state.lock();
        let channel = state
            .channels
            .get_mut(&id)
            .ok_or(RingError::NotAllocated(id))?;
        f(channel)
    }

    fn transition(
        &self,
        id: ChannelId,
        op: &'static str,
        from: &[HwState],
        to: HwState,
    ) -> Result<(), RingError> {
        self.with_channel(id, |channel| {
            if !from.contains(&channel.hw) {
                return Err(RingError::InvalidState { channel: id, op });
            }
            channel.hw = to;
            Ok(())
        })
    }
}

impl RingTransport for EmulatedRing {
    fn allocate(
        &self,
        id: ChannelId,
        params: &ChannelParams,
        sink: Arc<dyn RingEventSink>,
    ) -> Result<(), RingError> {
        self.count();
        let mut state = self.state.lock();
        if state.fail_allocate.contains(&id) || state.channels.contains_key(&id) {
            return Err(RingError::NoChannel(id));
        }
        state.channels.insert(
            id,
            EmulatedChannel {
                params: params.clone(),
                sink,
                hw: HwState::Allocated,
                mode: params.initial_mode,
                paused: false,
                queued: Vec::new(),
                posted: VecDeque::new(),
                completions: VecDeque::new(),
                scratch: [0; SCRATCH_REGISTERS],
                link: None,
                rx_frames: VecDeque::new(),
                frame: Vec::new(),
                transmitted: Vec::new(),
                doorbells: 0,
            },
        );
        Ok(())
    }

    fn enable(&self, id: ChannelId) -> Result<(), RingError> {
        self.transition(
            id,
            "enable",
            &[HwState::Allocated, HwState::Disabled],
            HwState::Enabled,
        )
    }

    fn start(&self, id: ChannelId) -> Result<(), RingError> {
        self.transition(
            id,
            "start",
            &[HwState::Enabled, HwState::Stopped],
            HwState::Running,
        )
    }

    fn stop(&self, id: ChannelId) -> Result<(), RingError> {
        self.transition(id, "stop", &[HwState::Running], HwState::Stopped)
    }

    fn disable(&self, id: ChannelId) -> Result<(), RingError> {
        self.transition(
            id,
            "disable",
            &[HwState::Enabled, HwState::Stopped],
            HwState::Disabled,
        )
    }

    fn deallocate(&self, id: ChannelId) -> Result<(), RingError> {
        self.count();
        self.state
            .lock()
            .channels
            .remove(&id)
            .map(drop)
            .ok_or(RingError::NotAllocated(id))
    }

    fn reset(&self, id: ChannelId) -> Result<(), RingError> {
        self.with_channel(id, |channel| {
            channel.queued.clear();
            channel.posted.clear();
            channel.completions.clear();
            channel.frame.clear();
            Ok(())
        })
    }

    fn queue_transfer(
        &self,
        id: ChannelId,
        descriptors: &[Descriptor],
        commit: bool,
    ) -> Result<(), RingError> {
        self.count();
        let mut state = self.state.lock();
        if state.fail_queue > 0 {
            state.fail_queue -= 1;
            return Err(RingError::Hardware {
                channel: id,
                code: 1,
            });
        }
        let channel = state
            .channels
            .get_mut(&id)
            .ok_or(RingError::NotAllocated(id))?;
        if matches!(channel.hw, HwState::Allocated | HwState::Disabled) {
            return Err(RingError::InvalidState {
                channel: id,
                op: "queue",
            });
        }
        let used = channel.queued.len() + channel.posted.len();
        let available = channel.capacity().saturating_sub(used);
        if descriptors.len() > available {
            return Err(RingError::RingFull {
                requested: descriptors.len(),
                available,
            });
        }
        channel.queued.extend_from_slice(descriptors);
        if commit {
            channel.posted.extend(channel.queued.drain(..));
            channel.doorbells += 1;
        }
        Ok(())
    }

    fn ring_doorbell(&self, id: ChannelId) -> Result<(), RingError> {
        self.with_channel(id, |channel| {
            channel.posted.extend(channel.queued.drain(..));
            channel.doorbells += 1;
            Ok(())
        })
    }

    fn poll(
        &self,
        id: ChannelId,
        budget: usize,
        out: &mut Vec<RingCompletion>,
    ) -> Result<usize, RingError> {
        self.count();
        let mut state = self.state.lock();
        if !state.channels.contains_key(&id) {
            return Err(RingError::NotAllocated(id));
        }
        let sources: Vec<ChannelId> = state
            .channels
            .iter()
            .filter(|(_, c)| c.link == Some(id))
            .map(|(&source, _)| source)
            .collect();
        for source in sources {
            self.run(&mut state, source);
        }
        self.run(&mut state, id);
        let channel = state
            .channels
            .get_mut(&id)
            .ok_or(RingError::NotAllocated(id))?;
        let n = budget.min(channel.completions.len());
        out.extend(channel.completions.drain(..n));
        Ok(n)
    }

    fn set_notification_mode(&self, id: ChannelId, mode: NotifyMode) -> Result<(), RingError> {
        self.with_channel(id, |channel| {
            channel.mode = mode;
            Ok(())
        })
    }

    fn read_scratch(&self, id: ChannelId, index: usize) -> Result<u32, RingError> {
        self.with_channel(id, |channel| {
            channel
                .scratch
                .get(index)
                .copied()
                .ok_or(RingError::InvalidState {
                    channel: id,
                    op: "read scratch",
                })
        })
    }

    fn write_scratch(&self, id: ChannelId, index: usize, value: u32) -> Result<(), RingError> {
        self.with_channel(id, |channel| {
            let reg = channel
                .scratch
                .get_mut(index)
                .ok_or(RingError::InvalidState {
                    channel: id,
                    op: "write scratch",
                })?;
            *reg = value;
            Ok(())
        })
    }
}
