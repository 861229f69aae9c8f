// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use ecpri_dma::ChannelId;
use ecpri_dma::DmaEngine;
use ecpri_dma::DmaError;
use ecpri_dma::Endpoint;
use ecpri_dma::EndpointConfig;
use std::sync::Arc;

/// A list of completed channel setup steps.
///
/// Each successful step is recorded. [`Self::destroy`] undoes them newest
/// first, so a setup that fails partway can be unwound exactly, and a later
/// teardown runs in strict reverse order of setup.
///
/// If the arena is dropped without calling `destroy` or `forget`, the
/// channels leak.
#[derive(Default)]
pub(crate) struct ChannelArena {
    steps: Vec<Step>,
}

enum Step {
    Allocated(Arc<Endpoint>),
    Enabled(Arc<Endpoint>),
    Started(Arc<Endpoint>),
}

impl ChannelArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(
        &mut self,
        engine: &DmaEngine,
        id: ChannelId,
        config: EndpointConfig,
    ) -> Result<Arc<Endpoint>, DmaError> {
        let endpoint = engine.allocate(id, config)?;
        self.steps.push(Step::Allocated(endpoint.clone()));
        Ok(endpoint)
    }

    pub fn enable(&mut self, endpoint: &Arc<Endpoint>) -> Result<(), DmaError> {
        endpoint.enable()?;
        self.steps.push(Step::Enabled(endpoint.clone()));
        Ok(())
    }

    pub fn start(&mut self, endpoint: &Arc<Endpoint>) -> Result<(), DmaError> {
        endpoint.start()?;
        self.steps.push(Step::Started(endpoint.clone()));
        Ok(())
    }

    /// Keeps everything set up so far; the caller now owns teardown.
    pub fn forget(mut self) {
        self.steps.clear();
    }

    /// Undoes every recorded step, newest first. Failures are logged and the
    /// remaining steps still run.
    pub fn destroy(mut self) {
        for step in self.steps.drain(..).rev() {
            let (endpoint, r) = match step {
                Step::Started(endpoint) => {
                    let r = endpoint.stop();
                    (endpoint, r)
                }
                Step::Enabled(endpoint) => {
                    // Flush anything still posted so the channel can be freed.
                    let r = endpoint.reset().and_then(|()| endpoint.disable());
                    (endpoint, r)
                }
                Step::Allocated(endpoint) => {
                    let r = endpoint.deallocate();
                    (endpoint, r)
                }
            };
            if let Err(err) = r {
                tracing::error!(
                    channel = %endpoint.id(),
                    error = &err as &dyn std::error::Error,
                    "failed to tear down channel"
                );
            }
        }
    }
}

impl Drop for ChannelArena {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            tracing::error!("leaking channels");
        }
    }
}
