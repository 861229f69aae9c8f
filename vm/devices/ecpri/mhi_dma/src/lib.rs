// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MHI virtual function support on top of the eCPRI DMA engine.
//!
//! The physical function and each virtual function get a memcpy context on a
//! fixed set of hardware channels, plus MHI channel connections that the
//! upstream bus driver brings up per function.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod function;
mod memcpy;
mod setup;

pub use client::FunctionState;
pub use client::MhiChannelConfig;
pub use client::MhiChannelHandle;
pub use client::MhiChannelScratch;
pub use client::MhiDma;
pub use client::ReadyCallback;
pub use client::MHI_SCRATCH_INDEX;
pub use function::Function;
pub use function::FunctionChannels;
pub use function::FunctionIndex;
pub use function::FunctionType;
pub use function::FUNCTION_COUNT;
pub use function::MAX_VIRTUAL_FUNCTIONS;
pub use memcpy::MemcpyCallback;
pub use memcpy::MemcpyContext;
pub use memcpy::MemcpyLimits;
pub use memcpy::MemcpyStats;

#[cfg(test)]
mod tests;
