// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The interface exposed to the upstream MHI bus driver.

use crate::function::Function;
use crate::function::FunctionIndex;
use crate::function::FUNCTION_COUNT;
use crate::memcpy::MemcpyCallback;
use crate::memcpy::MemcpyContext;
use crate::memcpy::MemcpyLimits;
use crate::memcpy::MemcpyStats;
use crate::setup::ChannelArena;
use bitfield_struct::bitfield;
use ecpri_dma::ChannelId;
use ecpri_dma::Direction;
use ecpri_dma::DmaEngine;
use ecpri_dma::DmaError;
use ecpri_dma::Endpoint;
use ecpri_dma::EndpointConfig;
use ecpri_dma::NotifyMode;
use ecpri_dma::StateError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Scratch register holding the MHI channel configuration.
pub const MHI_SCRATCH_INDEX: usize = 0;

/// The MHI channel configuration word written to scratch register 0.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct MhiChannelScratch {
    /// Doorbell mode.
    #[bits(2)]
    pub doorbell_mode: u8,
    /// Polling configuration.
    #[bits(5)]
    pub polling_configuration: u8,
    /// Burst mode.
    #[bits(2)]
    pub burst_mode: u8,
    /// Out-of-buffer moderation threshold.
    #[bits(16)]
    pub oob_moderation_threshold: u16,
    #[bits(7)]
    __: u8,
}

/// Parameters for [`MhiDma::connect_endpoint`].
#[derive(Debug, Clone)]
pub struct MhiChannelConfig {
    /// The hardware channel to allocate.
    pub channel: ChannelId,
    /// Transfer direction.
    pub direction: Direction,
    /// Ring length, or the hardware default.
    pub ring_len: Option<usize>,
    /// Initial notification mode.
    pub mode: NotifyMode,
    /// Written to [`MHI_SCRATCH_INDEX`] before the channel starts.
    pub scratch: MhiChannelScratch,
}

/// A connected MHI channel. Pass it back to
/// [`MhiDma::disconnect_endpoint`] to release the channel.
#[derive(Debug)]
pub struct MhiChannelHandle {
    function: Function,
    endpoint: Arc<Endpoint>,
}

impl MhiChannelHandle {
    /// The function the channel belongs to.
    pub fn function(&self) -> Function {
        self.function
    }

    /// The connected endpoint.
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }
}

/// Bring-up state of one function.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FunctionState {
    /// Known, waiting for the hardware to become ready.
    Initialized,
    /// The hardware is ready; the function may be started.
    Ready,
    /// Channels may be connected.
    Started,
}

impl FunctionState {
    fn name(&self) -> &'static str {
        match self {
            FunctionState::Initialized => "initialized",
            FunctionState::Ready => "ready",
            FunctionState::Started => "started",
        }
    }
}

struct FunctionEntry {
    state: FunctionState,
    channels: Vec<Arc<Endpoint>>,
}

/// Called once when the hardware finishes bring-up.
pub type ReadyCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct MhiState {
    ready: bool,
    ready_callback: Option<ReadyCallback>,
    functions: BTreeMap<FunctionIndex, FunctionEntry>,
}

/// The MHI DMA layer: per-function bring-up, channel connections and memcpy
/// contexts over one [`DmaEngine`].
pub struct MhiDma {
    engine: Arc<DmaEngine>,
    limits: MemcpyLimits,
    state: Mutex<MhiState>,
    contexts: Mutex<Vec<Option<Arc<MemcpyContext>>>>,
}

impl MhiDma {
    /// Creates the layer over `engine`. `limits` applies to every memcpy
    /// context.
    pub fn new(engine: Arc<DmaEngine>, limits: MemcpyLimits) -> Self {
        Self {
            engine,
            limits,
            state: Default::default(),
            contexts: Mutex::new(vec![None; FUNCTION_COUNT]),
        }
    }

    /// The underlying engine.
    pub fn engine(&self) -> &Arc<DmaEngine> {
        &self.engine
    }

    /// Registers the callback run when bring-up completes.
    pub fn register_ready_callback(&self, callback: ReadyCallback) -> Result<(), DmaError> {
        let mut state = self.state.lock();
        if state.ready {
            return Err(StateError::AlreadyReady.into());
        }
        if state.ready_callback.is_some() {
            return Err(StateError::Duplicate("ready callback registered").into());
        }
        state.ready_callback = Some(callback);
        Ok(())
    }

    /// Marks bring-up complete: every initialized function becomes ready and
    /// the ready callback runs.
    pub fn notify_ready(&self) -> Result<(), DmaError> {
        let callback = {
            let mut state = self.state.lock();
            if state.ready {
                return Err(StateError::Duplicate("ready").into());
            }
            state.ready = true;
            for entry in state.functions.values_mut() {
                if entry.state == FunctionState::Initialized {
                    entry.state = FunctionState::Ready;
                }
            }
            state.ready_callback.take()
        };
        tracing::info!("mhi dma ready");
        if let Some(callback) = callback {
            callback();
        }
        Ok(())
    }

    /// Returns the bring-up state of `function`.
    pub fn function_state(&self, function: Function) -> Result<FunctionState, DmaError> {
        let index = function.index()?;
        self.state
            .lock()
            .functions
            .get(&index)
            .map(|entry| entry.state)
            .ok_or_else(|| StateError::NotInitialized.into())
    }

    /// Registers `function`. It starts out ready if bring-up has already
    /// completed.
    pub fn init(&self, function: Function) -> Result<FunctionState, DmaError> {
        let index = function.index()?;
        let mut state = self.state.lock();
        if let Some(entry) = state.functions.get(&index) {
            return Err(StateError::Duplicate(entry.state.name()).into());
        }
        let initial = if state.ready {
            FunctionState::Ready
        } else {
            FunctionState::Initialized
        };
        state.functions.insert(
            index,
            FunctionEntry {
                state: initial,
                channels: Vec::new(),
            },
        );
        tracing::info!(%function, state = initial.name(), "function initialized");
        Ok(initial)
    }

    /// Starts a ready function.
    pub fn start(&self, function: Function) -> Result<(), DmaError> {
        let index = function.index()?;
        let mut state = self.state.lock();
        let entry = state
            .functions
            .get_mut(&index)
            .ok_or(StateError::NotInitialized)?;
        if entry.state != FunctionState::Ready {
            return Err(StateError::Wrong {
                expected: FunctionState::Ready.name(),
                actual: entry.state.name(),
            }
            .into());
        }
        entry.state = FunctionState::Started;
        tracing::info!(%function, "function started");
        Ok(())
    }

    /// Allocates and starts an MHI channel for a started function.
    pub fn connect_endpoint(
        &self,
        function: Function,
        config: MhiChannelConfig,
    ) -> Result<MhiChannelHandle, DmaError> {
        let index = function.index()?;
        let mut state = self.state.lock();
        let entry = state
            .functions
            .get_mut(&index)
            .ok_or(StateError::NotInitialized)?;
        if entry.state != FunctionState::Started {
            return Err(StateError::Wrong {
                expected: FunctionState::Started.name(),
                actual: entry.state.name(),
            }
            .into());
        }

        let mut endpoint_config = EndpointConfig::new(config.direction).with_mode(config.mode);
        if let Some(ring_len) = config.ring_len {
            endpoint_config = endpoint_config.with_ring_len(ring_len);
        }
        let mut arena = ChannelArena::new();
        let result = (|| -> Result<Arc<Endpoint>, DmaError> {
            let endpoint = arena.allocate(&self.engine, config.channel, endpoint_config)?;
            arena.enable(&endpoint)?;
            endpoint.write_scratch(MHI_SCRATCH_INDEX, config.scratch.into())?;
            arena.start(&endpoint)?;
            Ok(endpoint)
        })();
        match result {
            Ok(endpoint) => {
                arena.forget();
                entry.channels.push(endpoint.clone());
                tracing::debug!(%function, channel = %config.channel, "mhi channel connected");
                Ok(MhiChannelHandle { function, endpoint })
            }
            Err(err) => {
                arena.destroy();
                Err(err)
            }
        }
    }

    /// Disconnects and releases a channel returned by
    /// [`Self::connect_endpoint`].
    pub fn disconnect_endpoint(&self, handle: MhiChannelHandle) -> Result<(), DmaError> {
        let index = handle.function.index()?;
        if let Some(entry) = self.state.lock().functions.get_mut(&index) {
            entry
                .channels
                .retain(|endpoint| !Arc::ptr_eq(endpoint, &handle.endpoint));
        }
        Self::close(&handle.endpoint)
    }

    fn close(endpoint: &Endpoint) -> Result<(), DmaError> {
        endpoint.disconnect()?;
        endpoint.release()?;
        tracing::debug!(channel = %endpoint.id(), "mhi channel disconnected");
        Ok(())
    }

    /// Forgets a function, releasing any channels still connected. Its
    /// memcpy context is destroyed too if it has been fully disabled.
    ///
    /// The memcpy context goes first. If its teardown fails the function and
    /// its channels are left as they were.
    pub fn destroy(&self, function: Function) -> Result<(), DmaError> {
        let index = function.index()?;
        if !self.state.lock().functions.contains_key(&index) {
            return Err(StateError::NotInitialized.into());
        }
        if let Some(context) = self.context(index) {
            if context.stats().destroy_pending {
                self.memcpy_destroy(function)?;
            } else {
                tracing::warn!(%function, "memcpy context still enabled");
            }
        }
        let entry = self
            .state
            .lock()
            .functions
            .remove(&index)
            .ok_or(StateError::NotInitialized)?;
        for endpoint in entry.channels.iter().rev() {
            if let Err(err) = Self::close(endpoint) {
                tracing::error!(
                    %function,
                    channel = %endpoint.id(),
                    error = &err as &dyn std::error::Error,
                    "failed to release mhi channel"
                );
            }
        }
        tracing::info!(%function, "function destroyed");
        Ok(())
    }

    pub(crate) fn context(&self, index: FunctionIndex) -> Option<Arc<MemcpyContext>> {
        self.contexts.lock()[index.get()].clone()
    }

    fn memcpy(&self, function: Function) -> Result<Arc<MemcpyContext>, DmaError> {
        let index = function.index()?;
        self.context(index)
            .ok_or_else(|| StateError::NotInitialized.into())
    }

    /// Creates the memcpy context for `function`. Succeeds without doing
    /// anything if it already exists.
    pub fn memcpy_init(&self, function: Function) -> Result<(), DmaError> {
        let index = function.index()?;
        let mut contexts = self.contexts.lock();
        let slot = &mut contexts[index.get()];
        if slot.is_some() {
            return Ok(());
        }
        *slot = Some(MemcpyContext::init(&self.engine, index, self.limits)?);
        Ok(())
    }

    /// See [`MemcpyContext::enable`].
    pub fn memcpy_enable(&self, function: Function) -> Result<u32, DmaError> {
        self.memcpy(function)?.enable()
    }

    /// See [`MemcpyContext::disable`].
    pub fn memcpy_disable(&self, function: Function) -> Result<u32, DmaError> {
        self.memcpy(function)?.disable()
    }

    /// See [`MemcpyContext::sync_memcpy`].
    pub fn sync_memcpy(
        &self,
        function: Function,
        dest: u64,
        src: u64,
        len: u64,
    ) -> Result<(), DmaError> {
        self.memcpy(function)?.sync_memcpy(dest, src, len)
    }

    /// See [`MemcpyContext::async_memcpy`].
    pub fn async_memcpy(
        &self,
        function: Function,
        dest: u64,
        src: u64,
        len: u64,
        callback: MemcpyCallback,
    ) -> Result<(), DmaError> {
        self.memcpy(function)?
            .async_memcpy(dest, src, len, callback)
    }

    /// Returns the memcpy counters of `function`.
    pub fn memcpy_stats(&self, function: Function) -> Result<MemcpyStats, DmaError> {
        Ok(self.memcpy(function)?.stats())
    }

    /// Tears down the memcpy context of `function` and frees it.
    pub fn memcpy_destroy(&self, function: Function) -> Result<(), DmaError> {
        let index = function.index()?;
        let context = self.memcpy(function)?;
        context.destroy()?;
        let mut contexts = self.contexts.lock();
        let slot = &mut contexts[index.get()];
        if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, &context)) {
            *slot = None;
        }
        Ok(())
    }
}
