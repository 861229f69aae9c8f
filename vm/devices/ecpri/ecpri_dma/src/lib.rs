// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A DMA data-path engine for eCPRI hardware transfer rings.
//!
//! The engine manages hardware channels ("endpoints") on top of a
//! [`RingTransport`], tracks in-flight and completed packets, and switches
//! between interrupt-driven and polled completion notification. Completion
//! callbacks are deferred to a [`WorkQueue`] that the integrator drains.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod channel;
mod config;
mod datapath;
pub mod emulated;
mod endpoint;
mod error;
mod exception;
mod mapping;
mod packet;
mod ring;
mod work;

pub use backoff::Backoff;
pub use channel::ChannelState;
pub use channel::DmaEngine;
pub use config::ConfigField;
pub use config::ConfigOverrides;
pub use config::ConfigRegistry;
pub use config::EngineConfig;
pub use config::HwConfig;
pub use config::HwVersion;
pub use datapath::PollResult;
pub use datapath::TransmitError;
pub use datapath::MAX_CHAIN_LEN;
pub use endpoint::Endpoint;
pub use endpoint::EndpointClient;
pub use endpoint::EndpointConfig;
pub use endpoint::EndpointStats;
pub use endpoint::StreamMode;
pub use error::ConfigError;
pub use error::DmaError;
pub use error::ErrorKind;
pub use error::ResourceError;
pub use error::StateError;
pub use error::TransferError;
pub use exception::ExceptionPath;
pub use exception::ExceptionStats;
pub use mapping::DmaDirection;
pub use mapping::DmaMapper;
pub use mapping::MapError;
pub use packet::Buffer;
pub use packet::Packet;
pub use packet::PacketStatus;
pub use ring::ChannelId;
pub use ring::ChannelParams;
pub use ring::CompletionCode;
pub use ring::Descriptor;
pub use ring::DescriptorFlags;
pub use ring::Direction;
pub use ring::Moderation;
pub use ring::NotifyMode;
pub use ring::RingCompletion;
pub use ring::RingError;
pub use ring::RingEventSink;
pub use ring::RingTransport;
pub use work::ScheduleFlag;
pub use work::Work;
pub use work::WorkQueue;
