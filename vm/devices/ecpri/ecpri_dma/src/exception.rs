// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The exception path: a receive endpoint for traffic that could not be
//! routed anywhere else.
//!
//! The endpoint starts in IRQ mode with a pool of receive buffers posted. On
//! the first notification the drain work switches it to POLL, collects up to
//! a budget of packets, logs and frees them, and posts exactly as many fresh
//! buffers. It keeps rescheduling itself until a poll comes back empty, then
//! returns the endpoint to IRQ mode.

use crate::channel::ChannelState;
use crate::channel::DmaEngine;
use crate::endpoint::Endpoint;
use crate::endpoint::EndpointClient;
use crate::endpoint::EndpointConfig;
use crate::error::DmaError;
use crate::packet::Buffer;
use crate::packet::Packet;
use crate::ring::ChannelId;
use crate::ring::Direction;
use crate::ring::NotifyMode;
use crate::work::ScheduleFlag;
use crate::work::Work;
use crate::work::WorkQueue;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

/// Exception path statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionStats {
    /// Packets received and discarded.
    pub drained: u64,
    /// Buffers posted to replace drained ones.
    pub replenished: u64,
    /// Drained buffers that could not be reposted.
    pub replenish_failures: u64,
    /// Drain passes, including the final empty one.
    pub polls: u64,
}

#[derive(Default)]
struct Counters {
    drained: AtomicU64,
    replenished: AtomicU64,
    replenish_failures: AtomicU64,
    polls: AtomicU64,
}

struct Drain {
    endpoint: Arc<Endpoint>,
    work_queue: Arc<WorkQueue>,
    scheduled: ScheduleFlag,
    budget: usize,
    buffer_size: usize,
    counters: Counters,
    this: Weak<Drain>,
}

/// Endpoint client that kicks the drain work. Holds the drain weakly since
/// the drain owns the endpoint.
struct DrainClient {
    drain: Weak<Drain>,
}

impl EndpointClient for DrainClient {
    fn rx_ready(&self, _endpoint: &Endpoint) {
        if let Some(drain) = self.drain.upgrade() {
            drain.schedule();
        }
    }
}

impl Drain {
    fn schedule(&self) {
        if let Some(this) = self.this.upgrade() {
            self.scheduled.schedule(&self.work_queue, this);
        }
    }

    fn post(&self, count: usize) -> usize {
        let mut posted = 0;
        for _ in 0..count {
            let packet = Packet::single(Buffer::zeroed(self.buffer_size));
            match self.endpoint.transmit(vec![packet], false) {
                Ok(()) => posted += 1,
                Err(err) => {
                    self.counters
                        .replenish_failures
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        channel = %self.endpoint.id(),
                        error = &err as &dyn std::error::Error,
                        "failed to replenish exception buffer"
                    );
                }
            }
        }
        if posted > 0 {
            if let Err(err) = self.endpoint.commit() {
                tracing::warn!(
                    channel = %self.endpoint.id(),
                    error = &err as &dyn std::error::Error,
                    "failed to commit exception buffers"
                );
            }
        }
        posted
    }

    fn drain(&self) -> Result<usize, DmaError> {
        let id = self.endpoint.id();
        self.endpoint.set_mode(NotifyMode::Poll)?;
        self.counters.polls.fetch_add(1, Ordering::Relaxed);
        let mut packets = Vec::with_capacity(self.budget);
        let n = self.endpoint.rx_poll(self.budget, &mut packets)?.count();
        if n == 0 {
            self.endpoint.set_mode(NotifyMode::Irq)?;
            return Ok(0);
        }
        for packet in packets {
            let len = packet.actual_len();
            let head = packet
                .buffers()
                .first()
                .map(|b| &b.received()[..b.received().len().min(16)])
                .unwrap_or_default();
            tracing::warn!(
                channel = %id,
                len,
                status = ?packet.status(),
                head = ?head,
                "dropping exception packet"
            );
        }
        self.counters
            .drained
            .fetch_add(n as u64, Ordering::Relaxed);
        let posted = self.post(n);
        self.counters
            .replenished
            .fetch_add(posted as u64, Ordering::Relaxed);
        self.schedule();
        Ok(n)
    }
}

impl Work for Drain {
    fn run(self: Arc<Self>) {
        self.scheduled.clear();
        if let Err(err) = self.drain() {
            tracing::error!(
                channel = %self.endpoint.id(),
                error = &err as &dyn std::error::Error,
                "exception drain failed"
            );
        }
    }
}

/// The exception endpoint and its drain loop.
pub struct ExceptionPath {
    drain: Arc<Drain>,
}

impl ExceptionPath {
    /// Allocates and starts the exception endpoint on `channel` and posts the
    /// initial receive pool.
    pub fn start(engine: &DmaEngine, channel: ChannelId) -> Result<Self, DmaError> {
        let config = engine.config();
        let pool_size = config.exception_pool_size;
        let endpoint = engine.allocate(
            channel,
            EndpointConfig::new(Direction::Destination)
                .exception()
                .with_ring_len(pool_size)
                .with_mode(NotifyMode::Irq),
        )?;
        let drain = Arc::new_cyclic(|this| Drain {
            endpoint: endpoint.clone(),
            work_queue: engine.work_queue().clone(),
            scheduled: ScheduleFlag::default(),
            budget: config.exception_budget,
            buffer_size: config.exception_buffer_size,
            counters: Counters::default(),
            this: this.clone(),
        });
        endpoint.set_client(Arc::new(DrainClient {
            drain: Arc::downgrade(&drain),
        }));

        let result = (|| -> Result<(), DmaError> {
            endpoint.enable()?;
            endpoint.start()?;
            let packets = (0..pool_size)
                .map(|_| Packet::single(Buffer::zeroed(config.exception_buffer_size)))
                .collect();
            endpoint.transmit(packets, true)?;
            Ok(())
        })();
        if let Err(err) = result {
            if let Err(unwind) = endpoint.release() {
                tracing::error!(
                    channel = %channel,
                    error = &unwind as &dyn std::error::Error,
                    "failed to release exception channel"
                );
            }
            return Err(err);
        }
        tracing::info!(channel = %channel, pool_size, "exception path started");
        Ok(Self { drain })
    }

    /// The receive endpoint being drained.
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.drain.endpoint
    }

    /// Runs one drain pass on the calling thread. Returns the number of
    /// packets drained.
    pub fn poll_once(&self) -> Result<usize, DmaError> {
        self.drain.drain()
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> ExceptionStats {
        let c = &self.drain.counters;
        ExceptionStats {
            drained: c.drained.load(Ordering::Relaxed),
            replenished: c.replenished.load(Ordering::Relaxed),
            replenish_failures: c.replenish_failures.load(Ordering::Relaxed),
            polls: c.polls.load(Ordering::Relaxed),
        }
    }

    /// Disconnects the endpoint, flushes the posted pool and releases the
    /// channel.
    pub fn stop(&self) -> Result<(), DmaError> {
        let endpoint = &self.drain.endpoint;
        if endpoint.lifecycle() == ChannelState::Deallocated {
            return Ok(());
        }
        endpoint.disconnect()?;
        endpoint.release()?;
        tracing::info!(channel = %endpoint.id(), "exception path stopped");
        Ok(())
    }
}

impl Drop for ExceptionPath {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::error!(
                channel = %self.drain.endpoint.id(),
                error = &err as &dyn std::error::Error,
                "failed to stop exception path"
            );
        }
    }
}
