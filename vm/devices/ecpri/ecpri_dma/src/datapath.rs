// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The endpoint data path: transmit, receive polling, doorbell commits,
//! notification mode changes, and deferred completion dispatch.
//!
//! Completions reach an endpoint in one of two ways. In IRQ mode the ring
//! calls [`Endpoint::on_completion`] from interrupt-equivalent context, which
//! only marks the packet done and schedules the endpoint's worker. In POLL mode
//! the caller pulls completions through [`Endpoint::rx_poll`].

use crate::channel::ChannelState;
use crate::endpoint::Counters;
use crate::endpoint::Endpoint;
use crate::endpoint::EndpointState;
use crate::endpoint::OutstandingPacket;
use crate::endpoint::StreamMode;
use crate::error::ConfigError;
use crate::error::DmaError;
use crate::error::ErrorKind;
use crate::error::ResourceError;
use crate::error::StateError;
use crate::packet::Packet;
use crate::packet::PacketStatus;
use crate::ring::CompletionCode;
use crate::ring::Descriptor;
use crate::ring::DescriptorFlags;
use crate::ring::Direction;
use crate::ring::NotifyMode;
use crate::ring::RingCompletion;
use crate::work::Work;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

/// Bits of a descriptor cookie holding the buffer index within its packet.
const COOKIE_INDEX_BITS: u32 = 8;

/// The longest buffer chain a packet may have.
pub const MAX_CHAIN_LEN: usize = 1 << COOKIE_INDEX_BITS;

fn cookie(key: usize, index: usize) -> u64 {
    ((key as u64) << COOKIE_INDEX_BITS) | index as u64
}

fn cookie_parts(cookie: u64) -> (usize, usize) {
    (
        (cookie >> COOKIE_INDEX_BITS) as usize,
        (cookie & ((1 << COOKIE_INDEX_BITS) - 1)) as usize,
    )
}

/// A failed transmit. Carries back every packet the call did not queue, in
/// submission order.
#[derive(Debug, Error)]
#[error("transmit failed")]
pub struct TransmitError {
    /// Why the call failed.
    #[source]
    pub error: DmaError,
    /// The packets handed back to the caller.
    pub packets: Vec<Packet>,
}

impl TransmitError {
    /// The kind of the underlying error.
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

impl From<TransmitError> for DmaError {
    fn from(err: TransmitError) -> Self {
        err.error
    }
}

/// The result of [`Endpoint::rx_poll`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PollResult {
    /// Nothing was ready.
    Empty,
    /// This many packets were appended to the output.
    Ready(usize),
}

impl PollResult {
    /// The number of packets returned.
    pub fn count(&self) -> usize {
        match *self {
            PollResult::Empty => 0,
            PollResult::Ready(n) => n,
        }
    }
}

impl Endpoint {
    /// Queues `packets` to the ring as one batch.
    ///
    /// The batch is validated up front: a packet with too many buffers, or a
    /// batch that does not fit in the remaining ring space, fails the whole
    /// call without queueing anything. If mapping or the ring fails partway,
    /// the packets of this call that were already set up are unwound. In every
    /// failure case all packets are returned in the error.
    ///
    /// If `commit` is set, the doorbell is rung once the batch is queued.
    pub fn transmit(&self, packets: Vec<Packet>, commit: bool) -> Result<(), TransmitError> {
        let mut state = self.lock();
        if let Err(error) = self.check_transmit(&state, &packets) {
            if matches!(error, DmaError::Resource(ResourceError::RingFull { .. })) {
                Counters::add(&self.counters.rejected, 1);
            }
            return Err(TransmitError { error, packets });
        }
        if packets.is_empty() {
            if commit {
                if let Err(err) = self.ring.ring_doorbell(self.id) {
                    return Err(TransmitError {
                        error: err.into(),
                        packets,
                    });
                }
            }
            return Ok(());
        }
        let n = packets.len();
        if self.eventless {
            self.transmit_eventless(packets, commit)?;
        } else {
            self.transmit_tracked(&mut state, packets, commit)?;
        }
        Counters::add(&self.counters.queued, n);
        tracing::trace!(channel = %self.id, count = n, commit, "packets queued");
        Ok(())
    }

    fn check_transmit(&self, state: &EndpointState, packets: &[Packet]) -> Result<(), DmaError> {
        if state.disconnecting {
            return Err(StateError::Disconnecting.into());
        }
        if !state.valid {
            return Err(StateError::NotValid.into());
        }
        for packet in packets {
            let len = packet.buffers().len();
            if len == 0 {
                return Err(ConfigError::EmptyPacket.into());
            }
            if len > self.max_chain {
                return Err(ConfigError::ChainTooLong {
                    len,
                    max: self.max_chain,
                }
                .into());
            }
            if let Some(buffer) = packet
                .buffers()
                .iter()
                .find(|b| u32::try_from(b.len()).is_err())
            {
                return Err(ConfigError::InvalidParameter {
                    name: "buffer_len",
                    value: buffer.len() as u64,
                }
                .into());
            }
            if self.eventless && packet.buffers().iter().any(|b| b.addr().is_none()) {
                // Nothing would ever unmap these.
                return Err(ConfigError::Unsupported.into());
            }
        }
        if !self.eventless {
            let used = state.outstanding.len() + state.completed.len();
            let available = self.ring_len - used;
            if packets.len() > available {
                return Err(ResourceError::RingFull {
                    requested: packets.len(),
                    available,
                }
                .into());
            }
        }
        Ok(())
    }

    fn descriptors(
        &self,
        packet: &Packet,
        key: Option<usize>,
        descriptors: &mut Vec<Descriptor>,
    ) {
        let last = packet.buffers().len() - 1;
        for (index, buffer) in packet.buffers().iter().enumerate() {
            let eot = index == last;
            let flags = DescriptorFlags::new()
                .with_chain(!eot)
                .with_eot(eot)
                .with_ieot(eot && key.is_some())
                .with_ieob(self.stream_mode == StreamMode::Streaming && key.is_some())
                .with_bei(key.is_none());
            descriptors.push(Descriptor {
                addr: buffer.addr().unwrap_or_default(),
                len: buffer.len() as u32,
                flags,
                cookie: key.map_or(0, |key| cookie(key, index)),
            });
        }
    }

    fn transmit_eventless(&self, packets: Vec<Packet>, commit: bool) -> Result<(), TransmitError> {
        let mut descriptors = Vec::new();
        for packet in &packets {
            self.descriptors(packet, None, &mut descriptors);
        }
        if let Err(err) = self.ring.queue_transfer(self.id, &descriptors, commit) {
            return Err(TransmitError {
                error: err.into(),
                packets,
            });
        }
        Ok(())
    }

    fn transmit_tracked(
        &self,
        state: &mut EndpointState,
        packets: Vec<Packet>,
        commit: bool,
    ) -> Result<(), TransmitError> {
        let direction = self.dma_direction();
        let mut keys = Vec::with_capacity(packets.len());
        let mut descriptors = Vec::new();
        let mut packets = packets.into_iter();
        let mut failed = None;
        for mut packet in packets.by_ref() {
            let mut mapped = Ok(());
            for buffer in packet.buffers_mut() {
                mapped = buffer.map(self.mapper.as_ref(), direction);
                if mapped.is_err() {
                    break;
                }
            }
            if let Err(err) = mapped {
                packet.unmap(self.mapper.as_ref(), direction);
                failed = Some((DmaError::from(ResourceError::Map(err)), packet));
                break;
            }
            let entry = state.wrappers.vacant_entry();
            let key = entry.key();
            self.descriptors(&packet, Some(key), &mut descriptors);
            entry.insert(OutstandingPacket {
                packet,
                status: PacketStatus::Pending,
                done: false,
            });
            state.outstanding.push_back(key);
            keys.push(key);
        }

        let error = match failed {
            Some((error, packet)) => Some((error, Some(packet))),
            None => self
                .ring
                .queue_transfer(self.id, &descriptors, commit)
                .err()
                .map(|err| (DmaError::from(err), None)),
        };
        let Some((error, failed_packet)) = error else {
            return Ok(());
        };

        // Unwind only what this call set up, newest first.
        let mut returned = Vec::with_capacity(keys.len() + packets.len() + 1);
        for &key in keys.iter().rev() {
            let popped = state.outstanding.pop_back();
            debug_assert_eq!(popped, Some(key));
            returned.push(self.retire(state, key));
        }
        returned.reverse();
        returned.extend(failed_packet);
        returned.extend(packets);
        self.trim_wrapper_cache(state);
        tracing::debug!(
            channel = %self.id,
            unwound = keys.len(),
            error = &error as &dyn std::error::Error,
            "transmit failed"
        );
        Err(TransmitError {
            error,
            packets: returned,
        })
    }

    /// Collects up to `budget` completed packets into `out`, oldest first.
    ///
    /// Packets are counted by end-of-transfer completions, not buffers.
    /// Returns [`PollResult::Empty`] when nothing is ready.
    pub fn rx_poll(&self, budget: usize, out: &mut Vec<Packet>) -> Result<PollResult, DmaError> {
        if budget == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "budget",
                value: 0,
            }
            .into());
        }
        if self.eventless {
            return Err(ConfigError::Unsupported.into());
        }
        let mut state = self.lock();
        if state.lifecycle == ChannelState::Deallocated {
            return Err(StateError::NotValid.into());
        }
        self.collect_done(&mut state);
        let mut completions = Vec::new();
        while state.completed.len() < budget && !state.outstanding.is_empty() {
            // A packet may produce one completion per buffer.
            let want = (budget - state.completed.len()) * self.max_chain;
            completions.clear();
            if self.ring.poll(self.id, want, &mut completions)? == 0 {
                break;
            }
            for completion in completions.drain(..) {
                self.apply_completion(&mut state, completion);
            }
            self.collect_done(&mut state);
        }

        let count = budget.min(state.completed.len());
        out.reserve(count);
        for _ in 0..count {
            let Some(key) = state.completed.pop_front() else {
                break;
            };
            out.push(self.retire(&mut state, key));
        }
        self.recount_eot_ready(&state);
        self.trim_wrapper_cache(&mut state);
        drop(state);

        if count == 0 {
            return Ok(PollResult::Empty);
        }
        Counters::add(&self.counters.completed, count);
        tracing::trace!(channel = %self.id, count, "rx poll");
        Ok(PollResult::Ready(count))
    }

    /// Rings the doorbell for descriptors queued without `commit`.
    pub fn commit(&self) -> Result<(), DmaError> {
        let state = self.lock();
        if state.lifecycle == ChannelState::Deallocated {
            return Err(StateError::NotValid.into());
        }
        self.ring.ring_doorbell(self.id)?;
        Ok(())
    }

    /// Switches between interrupt and polling notification.
    ///
    /// In POLL mode no completion callbacks are delivered. Switching back to
    /// IRQ schedules delivery of anything that completed in the meantime.
    pub fn set_mode(&self, mode: NotifyMode) -> Result<(), DmaError> {
        if self.eventless {
            return Err(ConfigError::Unsupported.into());
        }
        let rearm = {
            let mut state = self.lock();
            if state.lifecycle == ChannelState::Deallocated {
                return Err(StateError::NotValid.into());
            }
            if state.mode == mode {
                return Ok(());
            }
            self.ring.set_notification_mode(self.id, mode)?;
            state.mode = mode;
            mode == NotifyMode::Irq && self.recount_eot_ready(&state) > 0
        };
        tracing::trace!(channel = %self.id, ?mode, "notification mode");
        if rearm {
            self.schedule_worker();
        }
        Ok(())
    }

    /// The current notification mode.
    pub fn get_mode(&self) -> NotifyMode {
        self.lock().mode
    }

    /// Handles an interrupt-time completion from the ring.
    pub(crate) fn on_completion(&self, completion: RingCompletion) {
        Counters::add(&self.counters.interrupts, 1);
        let schedule = {
            let mut state = self.lock();
            let eot = self.apply_completion(&mut state, completion);
            if eot {
                self.eot_ready.fetch_add(1, Ordering::AcqRel);
            }
            eot && state.mode == NotifyMode::Irq
        };
        if schedule {
            self.schedule_worker();
        }
    }

    fn schedule_worker(&self) {
        if let Some(this) = self.this.upgrade() {
            self.scheduled.schedule(&self.work_queue, this);
        }
    }

    /// Records a completion against its wrapper. Returns true if it ended a
    /// packet.
    fn apply_completion(&self, state: &mut EndpointState, completion: RingCompletion) -> bool {
        let (key, index) = cookie_parts(completion.cookie);
        let Some(wrapper) = state.wrappers.get_mut(key).filter(|w| !w.done) else {
            tracing::warn!(
                channel = %self.id,
                cookie = completion.cookie,
                "completion for unknown packet"
            );
            return false;
        };
        if let Some(buffer) = wrapper.packet.buffers_mut().get_mut(index) {
            buffer.set_actual_len(completion.len);
        }
        if completion.code != CompletionCode::Success
            && !matches!(wrapper.status, PacketStatus::Error(_))
        {
            wrapper.status = PacketStatus::from_code(completion.code);
        }
        if completion.eot {
            wrapper.done = true;
            if wrapper.status == PacketStatus::Pending {
                wrapper.status = PacketStatus::Success;
            }
        }
        completion.eot
    }

    /// Moves the done prefix of the outstanding list to the completed list.
    fn collect_done(&self, state: &mut EndpointState) {
        while let Some(&key) = state.outstanding.front() {
            if !state.wrappers[key].done {
                break;
            }
            state.outstanding.pop_front();
            state.completed.push_back(key);
        }
    }

    fn dispatch_tx(&self) {
        let packets = {
            let mut state = self.lock();
            if state.mode == NotifyMode::Poll {
                return;
            }
            let mut ready = self.recount_eot_ready(&state);
            let mut keys: Vec<usize> = state.completed.drain(..).collect();
            ready = ready.saturating_sub(keys.len() as u32);
            while ready > 0 {
                let Some(&key) = state.outstanding.front() else {
                    break;
                };
                if !state.wrappers[key].done {
                    break;
                }
                state.outstanding.pop_front();
                keys.push(key);
                ready -= 1;
            }
            let packets: Vec<Packet> = keys
                .into_iter()
                .map(|key| self.retire(&mut state, key))
                .collect();
            self.recount_eot_ready(&state);
            self.trim_wrapper_cache(&mut state);
            packets
        };
        if packets.is_empty() {
            return;
        }
        Counters::add(&self.counters.completed, packets.len());
        tracing::trace!(channel = %self.id, count = packets.len(), "tx complete");
        if let Some(client) = self.client() {
            client.complete(self, packets);
        }
    }

    fn dispatch_rx(&self) {
        let ready = {
            let mut state = self.lock();
            if state.mode == NotifyMode::Poll {
                return;
            }
            self.collect_done(&mut state);
            self.recount_eot_ready(&state) > 0
        };
        if ready {
            if let Some(client) = self.client() {
                client.rx_ready(self);
            }
        }
    }
}

impl Work for Endpoint {
    fn run(self: Arc<Self>) {
        self.scheduled.clear();
        match self.direction {
            Direction::Source => self.dispatch_tx(),
            Direction::Destination => self.dispatch_rx(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::cookie;
    use super::cookie_parts;

    #[test]
    fn cookie_round_trip() {
        assert_eq!(cookie_parts(cookie(0, 0)), (0, 0));
        assert_eq!(cookie_parts(cookie(513, 7)), (513, 7));
    }
}
