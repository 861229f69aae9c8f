// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Function indices and the static channel assignment table.

use ecpri_dma::ChannelId;
use ecpri_dma::ConfigError;
use std::fmt;

/// The number of virtual functions the hardware supports.
pub const MAX_VIRTUAL_FUNCTIONS: u32 = 8;

/// The number of function indices: the physical function plus every virtual
/// function.
pub const FUNCTION_COUNT: usize = MAX_VIRTUAL_FUNCTIONS as usize + 1;

/// Whether a function is the physical function or a virtual one.
#[allow(missing_docs)] // self-explanatory variants
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FunctionType {
    Physical,
    Virtual,
}

impl FunctionType {
    /// The type as used in errors.
    pub fn name(&self) -> &'static str {
        match self {
            FunctionType::Physical => "physical",
            FunctionType::Virtual => "virtual",
        }
    }
}

/// A physical or virtual function, as named by the upstream bus driver.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Function {
    /// Physical or virtual.
    pub function_type: FunctionType,
    /// The virtual function number. Always 0 for the physical function.
    pub vf_id: u32,
}

impl Function {
    /// The physical function.
    pub const PHYSICAL: Self = Self {
        function_type: FunctionType::Physical,
        vf_id: 0,
    };

    /// Virtual function `vf_id`. Not validated until [`Self::index`].
    pub fn virtual_function(vf_id: u32) -> Self {
        Self {
            function_type: FunctionType::Virtual,
            vf_id,
        }
    }

    /// Resolves the function index, validating the vf id.
    pub fn index(&self) -> Result<FunctionIndex, ConfigError> {
        let valid = match self.function_type {
            FunctionType::Physical => self.vf_id == 0,
            FunctionType::Virtual => self.vf_id < MAX_VIRTUAL_FUNCTIONS,
        };
        if !valid {
            return Err(ConfigError::InvalidFunction {
                function_type: self.function_type.name(),
                vf_id: self.vf_id,
            });
        }
        Ok(match self.function_type {
            FunctionType::Physical => FunctionIndex(0),
            FunctionType::Virtual => FunctionIndex(self.vf_id as usize + 1),
        })
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.function_type {
            FunctionType::Physical => f.write_str("pf"),
            FunctionType::Virtual => write!(f, "vf{}", self.vf_id),
        }
    }
}

/// A small integer identifying a function: 0 for the physical function,
/// `vf_id + 1` for virtual functions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionIndex(usize);

impl FunctionIndex {
    /// The index as a table offset.
    pub fn get(&self) -> usize {
        self.0
    }

    /// Returns true for the physical function.
    pub fn is_physical(&self) -> bool {
        self.0 == 0
    }

    /// The hardware channels reserved for this function's memcpy endpoints.
    pub fn channels(&self) -> &'static FunctionChannels {
        &FUNCTION_CHANNELS[self.0]
    }
}

/// Memcpy channel assignment for one function.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)] // self-explanatory fields
pub struct FunctionChannels {
    pub sync_src: ChannelId,
    pub sync_dest: ChannelId,
    /// [`ChannelId::INVALID`] for virtual functions, which have no async path.
    pub async_src: ChannelId,
    pub async_dest: ChannelId,
}

const fn vf_channels(vf_id: u32) -> FunctionChannels {
    FunctionChannels {
        sync_src: ChannelId(4 + 2 * vf_id),
        sync_dest: ChannelId(5 + 2 * vf_id),
        async_src: ChannelId::INVALID,
        async_dest: ChannelId::INVALID,
    }
}

static FUNCTION_CHANNELS: [FunctionChannels; FUNCTION_COUNT] = [
    FunctionChannels {
        sync_src: ChannelId(0),
        sync_dest: ChannelId(1),
        async_src: ChannelId(2),
        async_dest: ChannelId(3),
    },
    vf_channels(0),
    vf_channels(1),
    vf_channels(2),
    vf_channels(3),
    vf_channels(4),
    vf_channels(5),
    vf_channels(6),
    vf_channels(7),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices() {
        assert_eq!(Function::PHYSICAL.index().unwrap().get(), 0);
        assert!(Function::PHYSICAL.index().unwrap().is_physical());
        assert_eq!(Function::virtual_function(0).index().unwrap().get(), 1);
        assert_eq!(Function::virtual_function(7).index().unwrap().get(), 8);
    }

    #[test]
    fn invalid_functions() {
        assert!(Function::virtual_function(MAX_VIRTUAL_FUNCTIONS)
            .index()
            .is_err());
        let bad_pf = Function {
            function_type: FunctionType::Physical,
            vf_id: 1,
        };
        assert!(matches!(
            bad_pf.index(),
            Err(ConfigError::InvalidFunction { vf_id: 1, .. })
        ));
    }

    #[test]
    fn channel_table_is_disjoint() {
        let mut seen = Vec::new();
        for (i, channels) in FUNCTION_CHANNELS.iter().enumerate() {
            let ids = [
                channels.sync_src,
                channels.sync_dest,
                channels.async_src,
                channels.async_dest,
            ];
            for id in ids.into_iter().filter(|id| id.is_valid()) {
                assert!(!seen.contains(&id), "{id} reused");
                seen.push(id);
            }
            assert_eq!(channels.async_src.is_valid(), i == 0);
        }
        assert_eq!(seen.len(), 4 + 2 * MAX_VIRTUAL_FUNCTIONS as usize);
    }
}
