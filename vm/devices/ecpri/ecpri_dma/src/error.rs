// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types returned by the DMA engine.
//!
//! Every fallible operation returns exactly one [`DmaError`], whose variant is
//! the error kind. The detail enums carry the specifics for diagnostics.

use crate::channel::ChannelState;
use crate::mapping::MapError;
use crate::ring::ChannelId;
use crate::ring::CompletionCode;
use crate::ring::RingError;
use thiserror::Error;

/// An error from the DMA engine or a layer built on it.
#[derive(Debug, Error)]
pub enum DmaError {
    /// The request or configuration is invalid.
    #[error("invalid configuration")]
    Config(#[source] ConfigError),
    /// A hardware or software resource is exhausted.
    #[error("out of resources")]
    Resource(#[source] ResourceError),
    /// The operation is not valid in the current lifecycle state.
    #[error("invalid state")]
    State(#[source] StateError),
    /// Transfers are still pending; the caller may retry later.
    #[error("transfers pending")]
    Busy,
    /// The ring transport rejected or failed a transfer.
    #[error("transfer failed")]
    Transfer(#[source] TransferError),
}

/// The kind of a [`DmaError`], without its details.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`DmaError::Config`].
    Config,
    /// See [`DmaError::Resource`].
    Resource,
    /// See [`DmaError::State`].
    State,
    /// See [`DmaError::Busy`].
    Busy,
    /// See [`DmaError::Transfer`].
    Transfer,
}

impl DmaError {
    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DmaError::Config(_) => ErrorKind::Config,
            DmaError::Resource(_) => ErrorKind::Resource,
            DmaError::State(_) => ErrorKind::State,
            DmaError::Busy => ErrorKind::Busy,
            DmaError::Transfer(_) => ErrorKind::Transfer,
        }
    }
}

/// Details of [`DmaError::Config`].
#[allow(missing_docs)] // self-explanatory variants
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid function {function_type} vf id {vf_id}")]
    InvalidFunction {
        function_type: &'static str,
        vf_id: u32,
    },
    #[error("channel {0} is out of range")]
    InvalidChannel(ChannelId),
    #[error("hardware version {0} is not supported")]
    UnsupportedVersion(&'static str),
    #[error("hardware version {version} has no value for {field}")]
    MissingField {
        version: &'static str,
        field: &'static str,
    },
    #[error("invalid parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: u64 },
    #[error("packet has {len} buffers, endpoint limit is {max}")]
    ChainTooLong { len: usize, max: usize },
    #[error("packet has no buffers")]
    EmptyPacket,
    #[error("copy of {len:#x} bytes exceeds the maximum of {max:#x}")]
    CopyTooLarge { len: u64, max: u64 },
    #[error("zero-length copy")]
    ZeroLengthCopy,
    #[error("source {src:#x} and destination {dest:#x} overlap for {len:#x} bytes")]
    OverlappingCopy { dest: u64, src: u64, len: u64 },
    #[error("operation not supported on this endpoint")]
    Unsupported,
}

/// Details of [`DmaError::Resource`].
#[allow(missing_docs)] // self-explanatory variants
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("no free hardware channel for {0}")]
    NoChannel(ChannelId),
    #[error("channel {0} is already allocated")]
    ChannelInUse(ChannelId),
    #[error("ring full: {requested} requested, {available} available")]
    RingFull { requested: usize, available: usize },
    #[error("failed to map buffer")]
    Map(#[source] MapError),
}

/// Details of [`DmaError::State`].
#[allow(missing_docs)] // self-explanatory variants
#[derive(Debug, Error)]
pub enum StateError {
    #[error("channel {channel} is {actual:?}, operation requires {expected}")]
    Lifecycle {
        channel: ChannelId,
        expected: &'static str,
        actual: ChannelState,
    },
    #[error("endpoint is not valid for transfers")]
    NotValid,
    #[error("endpoint disconnect in progress")]
    Disconnecting,
    #[error("already in state {0}")]
    Duplicate(&'static str),
    #[error("state is {actual}, operation requires {expected}")]
    Wrong {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("teardown is pending")]
    DestroyPending,
    #[error("teardown has not been requested")]
    DestroyNotPending,
    #[error("not initialized")]
    NotInitialized,
    #[error("not enabled")]
    NotEnabled,
    #[error("already ready")]
    AlreadyReady,
}

/// Details of [`DmaError::Transfer`].
#[allow(missing_docs)] // self-explanatory variants
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("ring transport error")]
    Ring(#[source] RingError),
    #[error("transfer completed with {0:?}")]
    Completion(CompletionCode),
    #[error("transfer flushed before completion")]
    Flushed,
    #[error("timed out waiting for completion")]
    Timeout,
}

impl From<ConfigError> for DmaError {
    fn from(err: ConfigError) -> Self {
        DmaError::Config(err)
    }
}

impl From<ResourceError> for DmaError {
    fn from(err: ResourceError) -> Self {
        DmaError::Resource(err)
    }
}

impl From<StateError> for DmaError {
    fn from(err: StateError) -> Self {
        DmaError::State(err)
    }
}

impl From<TransferError> for DmaError {
    fn from(err: TransferError) -> Self {
        DmaError::Transfer(err)
    }
}

impl From<RingError> for DmaError {
    fn from(err: RingError) -> Self {
        match err {
            RingError::NoChannel(id) => ResourceError::NoChannel(id).into(),
            RingError::RingFull {
                requested,
                available,
            } => ResourceError::RingFull {
                requested,
                available,
            }
            .into(),
            err => TransferError::Ring(err).into(),
        }
    }
}
