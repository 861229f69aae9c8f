// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Channel allocation and the endpoint lifecycle state machine.
//!
//! ```text
//! allocate -> Allocated -> enable -> Enabled -> start -> Started
//!                                       ^                 |   ^
//!                                       |               stop  start
//!                                       |                 v   |
//!                       Disabled <-- disable ---------- Stopped
//!                          |
//!                      deallocate -> Deallocated
//! ```
//!
//! `disable` is also valid from `Enabled`, `deallocate` from `Allocated`, and
//! `reset` from any stopped state.

use crate::config::EngineConfig;
use crate::config::HwConfig;
use crate::datapath::MAX_CHAIN_LEN;
use crate::endpoint::new_state;
use crate::endpoint::Counters;
use crate::endpoint::Endpoint;
use crate::endpoint::EndpointConfig;
use crate::endpoint::EndpointSink;
use crate::error::ConfigError;
use crate::error::DmaError;
use crate::error::ResourceError;
use crate::error::StateError;
use crate::mapping::DmaMapper;
use crate::packet::PacketStatus;
use crate::ring::ChannelId;
use crate::ring::ChannelParams;
use crate::ring::RingTransport;
use crate::work::ScheduleFlag;
use crate::work::WorkQueue;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::sync::Weak;

/// The lifecycle state of an endpoint.
#[allow(missing_docs)] // self-explanatory variants
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Allocated,
    Enabled,
    Started,
    Stopped,
    Disabled,
    Deallocated,
}

/// Tracks which hardware channels are in use, in allocation order.
#[derive(Default)]
pub struct ChannelManager {
    channels: Mutex<Vec<(ChannelId, Weak<Endpoint>)>>,
}

impl ChannelManager {
    fn release(&self, id: ChannelId) {
        let mut channels = self.channels.lock();
        if let Some(i) = channels.iter().position(|(c, _)| *c == id) {
            channels.remove(i);
        }
    }

    fn live(&self) -> Vec<Arc<Endpoint>> {
        self.channels
            .lock()
            .iter()
            .filter_map(|(_, ep)| ep.upgrade())
            .collect()
    }
}

/// The DMA engine: owns the collaborators and the channel registry.
///
/// Constructed once at startup; every endpoint is allocated through it.
pub struct DmaEngine {
    config: HwConfig,
    ring: Arc<dyn RingTransport>,
    mapper: Arc<dyn DmaMapper>,
    work_queue: Arc<WorkQueue>,
    channels: Arc<ChannelManager>,
}

impl DmaEngine {
    /// Resolves the hardware configuration and creates the engine.
    pub fn new(
        config: &EngineConfig,
        ring: Arc<dyn RingTransport>,
        mapper: Arc<dyn DmaMapper>,
        work_queue: Arc<WorkQueue>,
    ) -> Result<Arc<Self>, DmaError> {
        let config = config.resolve()?;
        tracing::info!(
            version = config.version.name(),
            channels = config.channel_count,
            max_chain = config.max_chain_len,
            "dma engine initialized"
        );
        Ok(Arc::new(Self {
            config,
            ring,
            mapper,
            work_queue,
            channels: Default::default(),
        }))
    }

    /// The resolved hardware configuration.
    pub fn config(&self) -> &HwConfig {
        &self.config
    }

    /// The queue completion work is deferred to.
    pub fn work_queue(&self) -> &Arc<WorkQueue> {
        &self.work_queue
    }

    /// The mapper used for engine-owned buffers.
    pub fn mapper(&self) -> &Arc<dyn DmaMapper> {
        &self.mapper
    }

    /// Allocates hardware channel `id` as a new endpoint.
    pub fn allocate(
        &self,
        id: ChannelId,
        config: EndpointConfig,
    ) -> Result<Arc<Endpoint>, DmaError> {
        if !id.is_valid() || id.0 >= self.config.channel_count {
            return Err(ConfigError::InvalidChannel(id).into());
        }
        let ring_len = config.ring_len.unwrap_or(self.config.default_ring_len);
        if ring_len == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "ring_len",
                value: 0,
            }
            .into());
        }
        let max_chain = config.max_chain.unwrap_or(self.config.max_chain_len);
        if max_chain == 0 || max_chain > self.config.max_chain_len.min(MAX_CHAIN_LEN) {
            return Err(ConfigError::InvalidParameter {
                name: "max_chain",
                value: max_chain as u64,
            }
            .into());
        }
        let moderation = config
            .moderation
            .unwrap_or(self.config.default_moderation);

        let mut channels = self.channels.channels.lock();
        if channels.iter().any(|(c, _)| *c == id) {
            return Err(ResourceError::ChannelInUse(id).into());
        }

        let endpoint = Arc::new_cyclic(|this| Endpoint {
            id,
            direction: config.direction,
            stream_mode: config.stream_mode,
            ring_len,
            max_chain,
            eventless: config.eventless,
            exception: config.exception,
            cache_high_water: self.config.wrapper_cache_high_water,
            ring: self.ring.clone(),
            mapper: self.mapper.clone(),
            work_queue: self.work_queue.clone(),
            manager: self.channels.clone(),
            state: Mutex::new(new_state(
                config.initial_mode,
                ring_len,
                self.config.wrapper_cache_high_water,
            )),
            eot_ready: AtomicU32::new(0),
            scheduled: ScheduleFlag::default(),
            client: Mutex::new(None),
            counters: Counters::default(),
            this: this.clone(),
        });

        let params = ChannelParams {
            direction: config.direction,
            ring_len,
            moderation,
            eventless: config.eventless,
            initial_mode: config.initial_mode,
        };
        let sink = Arc::new(EndpointSink {
            endpoint: Arc::downgrade(&endpoint),
        });
        if let Err(err) = self.ring.allocate(id, &params, sink) {
            endpoint.lock().lifecycle = ChannelState::Deallocated;
            return Err(err.into());
        }
        channels.push((id, Arc::downgrade(&endpoint)));
        tracing::debug!(
            channel = %id,
            direction = ?config.direction,
            ring_len,
            max_chain,
            eventless = config.eventless,
            "channel allocated"
        );
        Ok(endpoint)
    }

    /// Returns the live endpoint for `id`, if allocated.
    pub fn endpoint(&self, id: ChannelId) -> Option<Arc<Endpoint>> {
        self.channels
            .channels
            .lock()
            .iter()
            .find(|(c, _)| *c == id)
            .and_then(|(_, ep)| ep.upgrade())
    }

    /// The allocated channels, in allocation order.
    pub fn allocated_channels(&self) -> Vec<ChannelId> {
        self.channels.channels.lock().iter().map(|(c, _)| *c).collect()
    }

    /// Tears down every endpoint still allocated, newest first.
    pub fn shutdown(&self) {
        for endpoint in self.channels.live().into_iter().rev() {
            if let Err(err) = endpoint.release() {
                tracing::error!(
                    channel = %endpoint.id(),
                    error = &err as &dyn std::error::Error,
                    "failed to release channel"
                );
            }
        }
    }
}

impl Endpoint {
    fn check_state(
        &self,
        actual: ChannelState,
        expected: &'static str,
        ok: impl Fn(ChannelState) -> bool,
    ) -> Result<(), DmaError> {
        if ok(actual) {
            Ok(())
        } else {
            Err(StateError::Lifecycle {
                channel: self.id,
                expected,
                actual,
            }
            .into())
        }
    }

    /// Enables the channel.
    pub fn enable(&self) -> Result<(), DmaError> {
        let mut state = self.lock();
        self.check_state(state.lifecycle, "allocated or disabled", |s| {
            matches!(s, ChannelState::Allocated | ChannelState::Disabled)
        })?;
        self.ring.enable(self.id)?;
        state.lifecycle = ChannelState::Enabled;
        tracing::debug!(channel = %self.id, "channel enabled");
        Ok(())
    }

    /// Starts the channel. Transmits are accepted afterwards.
    pub fn start(&self) -> Result<(), DmaError> {
        let mut state = self.lock();
        self.check_state(state.lifecycle, "enabled or stopped", |s| {
            matches!(s, ChannelState::Enabled | ChannelState::Stopped)
        })?;
        if state.disconnecting {
            return Err(StateError::Disconnecting.into());
        }
        self.ring.start(self.id)?;
        state.lifecycle = ChannelState::Started;
        state.valid = true;
        tracing::debug!(channel = %self.id, "channel started");
        Ok(())
    }

    /// Stops the channel. In-flight packets may still complete.
    pub fn stop(&self) -> Result<(), DmaError> {
        let mut state = self.lock();
        self.check_state(state.lifecycle, "started", |s| s == ChannelState::Started)?;
        self.ring.stop(self.id)?;
        state.lifecycle = ChannelState::Stopped;
        state.valid = false;
        tracing::debug!(channel = %self.id, "channel stopped");
        Ok(())
    }

    /// Disables the channel.
    pub fn disable(&self) -> Result<(), DmaError> {
        let mut state = self.lock();
        self.check_state(state.lifecycle, "enabled or stopped", |s| {
            matches!(s, ChannelState::Enabled | ChannelState::Stopped)
        })?;
        self.ring.disable(self.id)?;
        state.lifecycle = ChannelState::Disabled;
        tracing::debug!(channel = %self.id, "channel disabled");
        Ok(())
    }

    /// Releases the hardware channel.
    ///
    /// Fails with [`DmaError::Busy`] while packets are still tracked.
    pub fn deallocate(&self) -> Result<(), DmaError> {
        {
            let mut state = self.lock();
            self.check_state(state.lifecycle, "allocated or disabled", |s| {
                matches!(s, ChannelState::Allocated | ChannelState::Disabled)
            })?;
            if !state.outstanding.is_empty() || !state.completed.is_empty() {
                return Err(DmaError::Busy);
            }
            self.ring.deallocate(self.id)?;
            state.lifecycle = ChannelState::Deallocated;
            state.valid = false;
        }
        self.manager.release(self.id);
        // Drop the client to break any reference cycle through it.
        self.client.lock().take();
        tracing::debug!(channel = %self.id, "channel deallocated");
        Ok(())
    }

    /// Resets the ring, returning every tracked packet to the client with
    /// [`PacketStatus::Flushed`].
    pub fn reset(&self) -> Result<(), DmaError> {
        let flushed = {
            let mut state = self.lock();
            self.check_state(state.lifecycle, "enabled, stopped or disabled", |s| {
                matches!(
                    s,
                    ChannelState::Enabled | ChannelState::Stopped | ChannelState::Disabled
                )
            })?;
            self.ring.reset(self.id)?;
            let mut keys: Vec<usize> = state.completed.drain(..).collect();
            keys.extend(state.outstanding.drain(..));
            let mut flushed = Vec::with_capacity(keys.len());
            for key in keys {
                state.wrappers[key].status = PacketStatus::Flushed;
                flushed.push(self.retire(&mut state, key));
            }
            self.recount_eot_ready(&state);
            self.trim_wrapper_cache(&mut state);
            flushed
        };
        tracing::debug!(channel = %self.id, flushed = flushed.len(), "channel reset");
        if !flushed.is_empty() {
            Counters::add(&self.counters.flushed, flushed.len());
            match self.client() {
                Some(client) => client.complete(self, flushed),
                None => drop(flushed),
            }
        }
        Ok(())
    }

    /// Marks the endpoint as disconnecting: no new transmits are accepted and
    /// the channel is stopped if running.
    pub fn disconnect(&self) -> Result<(), DmaError> {
        let mut state = self.lock();
        if state.lifecycle == ChannelState::Deallocated {
            return Err(StateError::Lifecycle {
                channel: self.id,
                expected: "allocated",
                actual: state.lifecycle,
            }
            .into());
        }
        state.disconnecting = true;
        state.valid = false;
        if state.lifecycle == ChannelState::Started {
            self.ring.stop(self.id)?;
            state.lifecycle = ChannelState::Stopped;
        }
        tracing::debug!(channel = %self.id, "channel disconnecting");
        Ok(())
    }

    /// Reads a channel scratch register.
    pub fn read_scratch(&self, index: usize) -> Result<u32, DmaError> {
        let state = self.lock();
        if state.lifecycle == ChannelState::Deallocated {
            return Err(StateError::NotValid.into());
        }
        Ok(self.ring.read_scratch(self.id, index)?)
    }

    /// Writes a channel scratch register.
    pub fn write_scratch(&self, index: usize, value: u32) -> Result<(), DmaError> {
        let state = self.lock();
        if state.lifecycle == ChannelState::Deallocated {
            return Err(StateError::NotValid.into());
        }
        self.ring.write_scratch(self.id, index, value)?;
        Ok(())
    }

    /// Walks the endpoint back to deallocated from whatever state it is in,
    /// flushing any tracked packets.
    pub fn release(&self) -> Result<(), DmaError> {
        let lifecycle = self.lifecycle();
        if lifecycle == ChannelState::Deallocated {
            return Ok(());
        }
        if lifecycle == ChannelState::Started {
            self.stop()?;
        }
        if lifecycle != ChannelState::Allocated {
            self.reset()?;
        }
        if matches!(self.lifecycle(), ChannelState::Enabled | ChannelState::Stopped) {
            self.disable()?;
        }
        self.deallocate()
    }
}
