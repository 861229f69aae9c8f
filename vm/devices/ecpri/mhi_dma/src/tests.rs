// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::Function;
use crate::FunctionState;
use crate::MemcpyLimits;
use crate::MemcpyStats;
use crate::MhiChannelConfig;
use crate::MhiChannelScratch;
use crate::MhiDma;
use crate::MHI_SCRATCH_INDEX;
use ecpri_dma::emulated::EmulatedMapper;
use ecpri_dma::emulated::EmulatedMemory;
use ecpri_dma::emulated::EmulatedRing;
use ecpri_dma::ChannelId;
use ecpri_dma::ConfigError;
use ecpri_dma::Direction;
use ecpri_dma::DmaEngine;
use ecpri_dma::DmaError;
use ecpri_dma::EngineConfig;
use ecpri_dma::ErrorKind;
use ecpri_dma::HwVersion;
use ecpri_dma::NotifyMode;
use ecpri_dma::StateError;
use ecpri_dma::TransferError;
use ecpri_dma::WorkQueue;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "trace".into()),
            )
            .init();
    });
}

struct Harness {
    memory: Arc<EmulatedMemory>,
    ring: Arc<EmulatedRing>,
    work: Arc<WorkQueue>,
    engine: Arc<DmaEngine>,
    mhi: MhiDma,
}

impl Harness {
    fn new() -> Self {
        Self::with_limits(MemcpyLimits::default())
    }

    fn with_limits(limits: MemcpyLimits) -> Self {
        init_tracing();
        let memory = Arc::new(EmulatedMemory::new(256 * 4096));
        let ring = Arc::new(EmulatedRing::new(memory.clone()));
        let mapper = Arc::new(EmulatedMapper::new(memory.clone()));
        let work = Arc::new(WorkQueue::new());
        let engine = DmaEngine::new(
            &EngineConfig::new(HwVersion::V2_0),
            ring.clone(),
            mapper,
            work.clone(),
        )
        .unwrap();
        let mhi = MhiDma::new(engine.clone(), limits);
        Self {
            memory,
            ring,
            work,
            engine,
            mhi,
        }
    }

    /// Initializes the memcpy context and wires its channel pairs together.
    fn memcpy_init(&self, function: Function) {
        self.mhi.memcpy_init(function).unwrap();
        let channels = function.index().unwrap().channels();
        self.ring.link_memcpy(channels.sync_src, channels.sync_dest);
        if channels.async_src.is_valid() {
            self.ring.link_memcpy(channels.async_src, channels.async_dest);
        }
    }

    /// Allocates a source range filled with a pattern and an empty
    /// destination range.
    fn ranges(&self, len: usize, seed: u8) -> (u64, u64) {
        let src = self.memory.alloc(len).unwrap();
        let dest = self.memory.alloc(len).unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_add(seed)).collect();
        self.memory.write(src, &data).unwrap();
        (dest, src)
    }

    fn same(&self, dest: u64, src: u64, len: usize) -> bool {
        let mut a = vec![0; len];
        let mut b = vec![0; len];
        self.memory.read(dest, &mut a).unwrap();
        self.memory.read(src, &mut b).unwrap();
        a == b
    }

    fn stats(&self, function: Function) -> MemcpyStats {
        self.mhi.memcpy_stats(function).unwrap()
    }

    fn run(&self) {
        self.ring.process();
        self.work.run_pending();
    }
}

type Results = Arc<Mutex<Vec<Result<(), DmaError>>>>;

fn recorder() -> (Results, impl Fn() -> crate::MemcpyCallback) {
    let results: Results = Default::default();
    let r = results.clone();
    let make = move || -> crate::MemcpyCallback {
        let r = r.clone();
        Box::new(move |result| r.lock().push(result))
    };
    (results, make)
}

const PF: Function = Function::PHYSICAL;

#[test]
fn init_is_idempotent() {
    let h = Harness::new();
    h.mhi.memcpy_init(PF).unwrap();
    let ops = h.ring.op_count();
    h.mhi.memcpy_init(PF).unwrap();
    assert_eq!(h.ring.op_count(), ops);
    assert_eq!(
        h.engine.allocated_channels(),
        vec![ChannelId(0), ChannelId(1), ChannelId(2), ChannelId(3)]
    );

    let vf = Function::virtual_function(3);
    h.mhi.memcpy_init(vf).unwrap();
    h.mhi.memcpy_init(vf).unwrap();
    assert_eq!(h.engine.allocated_channels().len(), 6);
    assert!(h.ring.is_allocated(ChannelId(10)));
    assert!(h.ring.is_allocated(ChannelId(11)));
}

#[test]
fn init_rolls_back_on_failure() {
    let h = Harness::new();
    h.ring.fail_allocate(ChannelId(3));
    let err = h.mhi.memcpy_init(PF).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
    for id in 0..4 {
        assert!(!h.ring.is_allocated(ChannelId(id)));
    }
    assert!(h.engine.allocated_channels().is_empty());
    assert!(matches!(
        h.mhi.memcpy_stats(PF),
        Err(DmaError::State(StateError::NotInitialized))
    ));
}

#[test]
fn invalid_function_rejected() {
    let h = Harness::new();
    let err = h.mhi.memcpy_init(Function::virtual_function(8)).unwrap_err();
    assert!(matches!(
        err,
        DmaError::Config(ConfigError::InvalidFunction { vf_id: 8, .. })
    ));
}

#[test]
fn enable_disable_destroy_scenario() {
    let h = Harness::new();
    h.memcpy_init(PF);
    let ids: Vec<ChannelId> = (0..4).map(ChannelId).collect();
    assert_eq!(h.stats(PF).ref_count, 0);
    assert!(ids.iter().all(|&id| !h.ring.is_running(id)));

    assert_eq!(h.mhi.memcpy_enable(PF).unwrap(), 1);
    assert!(ids.iter().all(|&id| h.ring.is_running(id)));

    let ops = h.ring.op_count();
    assert_eq!(h.mhi.memcpy_enable(PF).unwrap(), 2);
    assert_eq!(h.ring.op_count(), ops);

    assert_eq!(h.mhi.memcpy_disable(PF).unwrap(), 1);
    assert!(ids.iter().all(|&id| h.ring.is_running(id)));
    assert!(!h.stats(PF).destroy_pending);

    assert_eq!(h.mhi.memcpy_disable(PF).unwrap(), 0);
    assert!(ids.iter().all(|&id| !h.ring.is_running(id)));
    assert!(h.stats(PF).destroy_pending);

    assert!(matches!(
        h.mhi.memcpy_enable(PF),
        Err(DmaError::State(StateError::DestroyPending))
    ));

    h.mhi.memcpy_destroy(PF).unwrap();
    assert!(ids.iter().all(|&id| !h.ring.is_allocated(id)));
    assert!(h.engine.allocated_channels().is_empty());
    assert!(matches!(
        h.mhi.memcpy_stats(PF),
        Err(DmaError::State(StateError::NotInitialized))
    ));

    // A fresh context can be created afterwards.
    h.memcpy_init(PF);
    assert_eq!(h.stats(PF), MemcpyStats::default());
}

#[test]
fn destroy_requires_disable() {
    let h = Harness::new();
    h.memcpy_init(PF);
    h.mhi.memcpy_enable(PF).unwrap();
    assert!(matches!(
        h.mhi.memcpy_destroy(PF),
        Err(DmaError::State(StateError::DestroyNotPending))
    ));
    assert!(matches!(
        h.mhi.memcpy_disable(Function::virtual_function(0)),
        Err(DmaError::State(StateError::NotInitialized))
    ));
}

#[test]
fn disable_without_enable() {
    let h = Harness::new();
    h.memcpy_init(PF);
    assert!(matches!(
        h.mhi.memcpy_disable(PF),
        Err(DmaError::State(StateError::NotEnabled))
    ));
}

#[test]
fn sync_copy() {
    let h = Harness::new();
    h.memcpy_init(PF);
    h.mhi.memcpy_enable(PF).unwrap();
    let (dest, src) = h.ranges(3000, 7);
    h.mhi.sync_memcpy(PF, dest, src, 3000).unwrap();
    assert!(h.same(dest, src, 3000));

    let (dest, src) = h.ranges(64, 99);
    h.mhi.sync_memcpy(PF, dest, src, 64).unwrap();
    assert!(h.same(dest, src, 64));

    let stats = h.stats(PF);
    assert_eq!(stats.sync_total, 2);
    assert_eq!(stats.sync_pending, 0);
}

#[test]
fn sync_copy_requires_enable() {
    let h = Harness::new();
    h.memcpy_init(PF);
    let (dest, src) = h.ranges(16, 0);
    assert!(matches!(
        h.mhi.sync_memcpy(PF, dest, src, 16),
        Err(DmaError::State(StateError::NotEnabled))
    ));
}

#[test]
fn invalid_copies_touch_no_ring() {
    let h = Harness::new();
    h.memcpy_init(PF);
    h.mhi.memcpy_enable(PF).unwrap();
    let max = h.engine.config().max_single_packet_size;
    let (dest, src) = h.ranges(64, 0);
    let ops = h.ring.op_count();

    assert!(matches!(
        h.mhi.sync_memcpy(PF, dest, src, max + 1),
        Err(DmaError::Config(ConfigError::CopyTooLarge { .. }))
    ));
    assert!(matches!(
        h.mhi.sync_memcpy(PF, src + 8, src, 16),
        Err(DmaError::Config(ConfigError::OverlappingCopy { .. }))
    ));
    assert!(matches!(
        h.mhi.sync_memcpy(PF, src, src + 15, 16),
        Err(DmaError::Config(ConfigError::OverlappingCopy { .. }))
    ));
    assert!(matches!(
        h.mhi.sync_memcpy(PF, dest, src, 0),
        Err(DmaError::Config(ConfigError::ZeroLengthCopy))
    ));
    let (_, make) = recorder();
    assert_eq!(
        h.mhi
            .async_memcpy(PF, dest, dest, 8, make())
            .unwrap_err()
            .kind(),
        ErrorKind::Config
    );
    assert_eq!(h.ring.op_count(), ops);

    // Adjacent ranges do not overlap.
    h.mhi.sync_memcpy(PF, src + 16, src, 16).unwrap();
}

#[test]
fn sync_timeout_is_reaped() {
    let h = Harness::with_limits(MemcpyLimits {
        acquire_attempts: 4,
        wait_attempts: 4,
    });
    h.memcpy_init(PF);
    h.mhi.memcpy_enable(PF).unwrap();
    let sync_src = PF.index().unwrap().channels().sync_src;
    let (dest, src) = h.ranges(128, 3);

    h.ring.set_paused(sync_src, true);
    let err = h.mhi.sync_memcpy(PF, dest, src, 128).unwrap_err();
    assert!(matches!(err, DmaError::Transfer(TransferError::Timeout)));
    assert_eq!(h.stats(PF).sync_pending, 1);

    // The timed out copy is still in flight.
    assert!(matches!(h.mhi.memcpy_disable(PF), Err(DmaError::Busy)));
    let stats = h.stats(PF);
    assert_eq!(stats.ref_count, 1);
    assert_eq!(stats.sync_pending, 1);
    assert!(!stats.destroy_pending);

    h.ring.set_paused(sync_src, false);
    assert_eq!(h.mhi.memcpy_disable(PF).unwrap(), 0);
    assert_eq!(h.stats(PF).sync_pending, 0);
    assert!(h.same(dest, src, 128));
    h.mhi.memcpy_destroy(PF).unwrap();
}

#[test]
fn stale_sync_completion_skipped() {
    let h = Harness::with_limits(MemcpyLimits {
        acquire_attempts: 4,
        wait_attempts: 4,
    });
    h.memcpy_init(PF);
    h.mhi.memcpy_enable(PF).unwrap();
    let sync_src = PF.index().unwrap().channels().sync_src;

    let (dest, src) = h.ranges(32, 1);
    h.ring.set_paused(sync_src, true);
    h.mhi.sync_memcpy(PF, dest, src, 32).unwrap_err();
    h.ring.set_paused(sync_src, false);

    // The next copy collects the stale completion first.
    let (dest2, src2) = h.ranges(32, 50);
    h.mhi.sync_memcpy(PF, dest2, src2, 32).unwrap();
    assert!(h.same(dest, src, 32));
    assert!(h.same(dest2, src2, 32));
    let stats = h.stats(PF);
    assert_eq!(stats.sync_pending, 0);
    assert_eq!(stats.sync_total, 2);
}

#[test]
fn sync_ring_failure_releases_pair() {
    let h = Harness::new();
    h.memcpy_init(PF);
    h.mhi.memcpy_enable(PF).unwrap();
    let (dest, src) = h.ranges(32, 9);
    h.ring.fail_queue_transfers(1);
    let err = h.mhi.sync_memcpy(PF, dest, src, 32).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transfer);
    assert_eq!(h.stats(PF).sync_pending, 0);

    h.mhi.sync_memcpy(PF, dest, src, 32).unwrap();
    assert!(h.same(dest, src, 32));
}

#[test]
fn sync_source_failure_flushes_stale_copy() {
    let h = Harness::with_limits(MemcpyLimits {
        acquire_attempts: 4,
        wait_attempts: 4,
    });
    h.memcpy_init(PF);
    h.mhi.memcpy_enable(PF).unwrap();
    let sync_src = PF.index().unwrap().channels().sync_src;
    let (dest_a, src_a) = h.ranges(64, 1);
    let (dest_b, src_b) = h.ranges(64, 80);
    let (dest_c, src_c) = h.ranges(64, 160);

    // Copy A times out with its source descriptor still posted.
    h.ring.set_paused(sync_src, true);
    assert!(matches!(
        h.mhi.sync_memcpy(PF, dest_a, src_a, 64),
        Err(DmaError::Transfer(TransferError::Timeout))
    ));
    assert_eq!(h.ring.pending_descriptors(sync_src), 1);

    // Copy B cannot queue its source half.
    h.engine.endpoint(sync_src).unwrap().stop().unwrap();
    let err = h.mhi.sync_memcpy(PF, dest_b, src_b, 64).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert_eq!(h.stats(PF).sync_pending, 0);
    assert_eq!(h.ring.pending_descriptors(sync_src), 0);
    assert!(h.ring.is_running(sync_src));

    h.ring.set_paused(sync_src, false);
    h.mhi.sync_memcpy(PF, dest_c, src_c, 64).unwrap();
    assert!(h.same(dest_c, src_c, 64));
    assert!(!h.same(dest_a, src_a, 64));
    assert!(!h.same(dest_b, src_b, 64));
    assert_eq!(h.mhi.memcpy_disable(PF).unwrap(), 0);
}

#[test]
fn sync_copies_serialize_across_threads() {
    let h = Harness::with_limits(MemcpyLimits {
        acquire_attempts: 100_000,
        wait_attempts: 2000,
    });
    h.memcpy_init(PF);
    h.mhi.memcpy_enable(PF).unwrap();
    let copies: Vec<Vec<(u64, u64)>> = (0..2u8)
        .map(|t| (0..8u8).map(|i| h.ranges(256, t * 64 + i)).collect())
        .collect();

    std::thread::scope(|s| {
        for ranges in &copies {
            let h = &h;
            s.spawn(move || {
                for &(dest, src) in ranges {
                    h.mhi.sync_memcpy(PF, dest, src, 256).unwrap();
                }
            });
        }
    });

    for &(dest, src) in copies.iter().flatten() {
        assert!(h.same(dest, src, 256));
    }
    let stats = h.stats(PF);
    assert_eq!(stats.sync_total, 16);
    assert_eq!(stats.sync_pending, 0);
}

#[test]
fn contended_sync_copy_is_busy() {
    let h = Harness::with_limits(MemcpyLimits {
        acquire_attempts: 4,
        wait_attempts: 100_000,
    });
    h.memcpy_init(PF);
    h.mhi.memcpy_enable(PF).unwrap();
    let sync_src = PF.index().unwrap().channels().sync_src;
    let (dest, src) = h.ranges(64, 5);
    let (dest2, src2) = h.ranges(64, 70);

    h.ring.set_paused(sync_src, true);
    std::thread::scope(|s| {
        let first = s.spawn(|| h.mhi.sync_memcpy(PF, dest, src, 64));
        while h.stats(PF).sync_pending == 0 {
            std::thread::yield_now();
        }
        assert!(matches!(
            h.mhi.sync_memcpy(PF, dest2, src2, 64),
            Err(DmaError::Busy)
        ));
        h.ring.set_paused(sync_src, false);
        first.join().unwrap().unwrap();
    });
    assert!(h.same(dest, src, 64));
    assert!(!h.same(dest2, src2, 64));

    h.mhi.sync_memcpy(PF, dest2, src2, 64).unwrap();
    assert!(h.same(dest2, src2, 64));
    assert_eq!(h.stats(PF).sync_total, 2);
}

#[test]
fn pf_async_copy() {
    let h = Harness::new();
    h.memcpy_init(PF);
    h.mhi.memcpy_enable(PF).unwrap();
    let (results, make) = recorder();
    let (dest, src) = h.ranges(512, 11);
    let (dest2, src2) = h.ranges(256, 40);
    h.mhi.async_memcpy(PF, dest, src, 512, make()).unwrap();
    h.mhi.async_memcpy(PF, dest2, src2, 256, make()).unwrap();
    assert!(results.lock().is_empty());
    assert_eq!(h.stats(PF).async_pending, 2);

    // Disable is refused while copies are pending.
    assert!(matches!(h.mhi.memcpy_disable(PF), Err(DmaError::Busy)));
    let stats = h.stats(PF);
    assert_eq!(stats.ref_count, 1);
    assert_eq!(stats.async_pending, 2);
    assert!(h.ring.is_running(ChannelId(3)));

    h.run();
    let results = std::mem::take(&mut *results.lock());
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_ok()));
    assert!(h.same(dest, src, 512));
    assert!(h.same(dest2, src2, 256));

    let stats = h.stats(PF);
    assert_eq!(stats.async_pending, 0);
    assert_eq!(stats.async_total, 2);
    assert_eq!(h.mhi.memcpy_disable(PF).unwrap(), 0);
    h.mhi.memcpy_destroy(PF).unwrap();
}

#[test]
fn async_source_failure_flushes_pair() {
    let h = Harness::new();
    h.memcpy_init(PF);
    h.mhi.memcpy_enable(PF).unwrap();
    let channels = PF.index().unwrap().channels();
    let (results, make) = recorder();
    let (dest_a, src_a) = h.ranges(64, 1);
    let (dest_b, src_b) = h.ranges(64, 80);
    let (dest_c, src_c) = h.ranges(64, 160);

    h.mhi.async_memcpy(PF, dest_a, src_a, 64, make()).unwrap();
    // Copy B cannot queue its source half.
    h.engine
        .endpoint(channels.async_src)
        .unwrap()
        .stop()
        .unwrap();
    let err = h
        .mhi
        .async_memcpy(PF, dest_b, src_b, 64, make())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    // Copy A was flushed along with the pair.
    assert_eq!(results.lock().len(), 1);
    assert!(matches!(
        results.lock()[0],
        Err(DmaError::Transfer(TransferError::Flushed))
    ));
    assert_eq!(h.stats(PF).async_pending, 0);
    for id in [channels.async_src, channels.async_dest] {
        assert!(h.ring.is_running(id));
        assert_eq!(h.ring.pending_descriptors(id), 0);
    }

    h.mhi.async_memcpy(PF, dest_c, src_c, 64, make()).unwrap();
    h.run();
    let results = std::mem::take(&mut *results.lock());
    assert_eq!(results.len(), 2);
    assert!(results[1].is_ok());
    assert!(h.same(dest_c, src_c, 64));
    assert!(!h.same(dest_a, src_a, 64));
    assert!(!h.same(dest_b, src_b, 64));

    let stats = h.stats(PF);
    assert_eq!(stats.async_pending, 0);
    assert_eq!(stats.async_total, 2);
    assert_eq!(h.mhi.memcpy_disable(PF).unwrap(), 0);
}

#[test]
fn vf_async_copy_runs_synchronously() {
    let h = Harness::new();
    let vf = Function::virtual_function(1);
    h.memcpy_init(vf);
    h.mhi.memcpy_enable(vf).unwrap();
    let (results, make) = recorder();
    let (dest, src) = h.ranges(200, 21);

    h.mhi.async_memcpy(vf, dest, src, 200, make()).unwrap();
    // The data has moved but the callback waits for the worker.
    assert!(h.same(dest, src, 200));
    assert!(results.lock().is_empty());
    assert_eq!(h.stats(vf).async_pending, 1);
    assert!(matches!(h.mhi.memcpy_disable(vf), Err(DmaError::Busy)));

    assert_eq!(h.work.run_pending(), 1);
    assert_eq!(results.lock().len(), 1);
    assert!(results.lock()[0].is_ok());
    let stats = h.stats(vf);
    assert_eq!(stats.async_pending, 0);
    assert_eq!(stats.async_total, 1);
    assert_eq!(stats.sync_total, 1);
    assert_eq!(h.mhi.memcpy_disable(vf).unwrap(), 0);
}

#[test]
fn vf_async_copy_is_pending_while_in_flight() {
    let h = Harness::with_limits(MemcpyLimits {
        acquire_attempts: 4,
        wait_attempts: 100_000,
    });
    let vf = Function::virtual_function(5);
    h.memcpy_init(vf);
    h.mhi.memcpy_enable(vf).unwrap();
    let sync_src = vf.index().unwrap().channels().sync_src;
    let (results, make) = recorder();
    let (dest, src) = h.ranges(64, 3);

    h.ring.set_paused(sync_src, true);
    std::thread::scope(|s| {
        let callback = make();
        let copy = s.spawn(|| h.mhi.async_memcpy(vf, dest, src, 64, callback));
        while h.stats(vf).sync_pending == 0 {
            std::thread::yield_now();
        }
        assert_eq!(h.stats(vf).async_pending, 1);
        assert!(matches!(h.mhi.memcpy_disable(vf), Err(DmaError::Busy)));
        h.ring.set_paused(sync_src, false);
        copy.join().unwrap().unwrap();
    });

    // The callback is still owed, so teardown stays blocked.
    assert_eq!(h.stats(vf).async_pending, 1);
    assert!(matches!(h.mhi.memcpy_disable(vf), Err(DmaError::Busy)));
    assert_eq!(h.work.run_pending(), 1);
    assert!(results.lock()[0].is_ok());
    assert_eq!(h.stats(vf).async_pending, 0);
    assert_eq!(h.mhi.memcpy_disable(vf).unwrap(), 0);
}

#[test]
fn vf_async_failure_skips_callback() {
    let h = Harness::new();
    let vf = Function::virtual_function(2);
    h.memcpy_init(vf);
    h.mhi.memcpy_enable(vf).unwrap();
    let (results, make) = recorder();
    let (dest, src) = h.ranges(16, 0);
    h.ring.fail_queue_transfers(1);
    h.mhi.async_memcpy(vf, dest, src, 16, make()).unwrap_err();
    assert_eq!(h.work.run_pending(), 0);
    assert!(results.lock().is_empty());
    assert_eq!(h.stats(vf).async_pending, 0);
}

#[test]
fn function_bring_up() {
    let h = Harness::new();
    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    h.mhi
        .register_ready_callback(Box::new(move || f.store(true, Ordering::SeqCst)))
        .unwrap();
    assert!(matches!(
        h.mhi.register_ready_callback(Box::new(|| {})),
        Err(DmaError::State(StateError::Duplicate(_)))
    ));

    let vf = Function::virtual_function(0);
    assert_eq!(h.mhi.init(PF).unwrap(), FunctionState::Initialized);
    assert!(matches!(
        h.mhi.start(PF),
        Err(DmaError::State(StateError::Wrong { .. }))
    ));

    h.mhi.notify_ready().unwrap();
    assert!(fired.load(Ordering::SeqCst));
    assert_eq!(h.mhi.function_state(PF).unwrap(), FunctionState::Ready);
    assert!(matches!(
        h.mhi.register_ready_callback(Box::new(|| {})),
        Err(DmaError::State(StateError::AlreadyReady))
    ));
    assert!(matches!(
        h.mhi.init(PF),
        Err(DmaError::State(StateError::Duplicate(_)))
    ));

    // Functions initialized after bring-up start out ready.
    assert_eq!(h.mhi.init(vf).unwrap(), FunctionState::Ready);
    h.mhi.start(PF).unwrap();
    assert_eq!(h.mhi.function_state(PF).unwrap(), FunctionState::Started);
    assert!(matches!(
        h.mhi.start(PF),
        Err(DmaError::State(StateError::Wrong { .. }))
    ));
    assert!(matches!(
        h.mhi.start(Function::virtual_function(5)),
        Err(DmaError::State(StateError::NotInitialized))
    ));
}

fn channel_config(channel: u32, scratch: MhiChannelScratch) -> MhiChannelConfig {
    MhiChannelConfig {
        channel: ChannelId(channel),
        direction: Direction::Destination,
        ring_len: Some(8),
        mode: NotifyMode::Irq,
        scratch,
    }
}

#[test]
fn connect_and_disconnect() {
    let h = Harness::new();
    h.mhi.notify_ready().unwrap();
    h.mhi.init(PF).unwrap();
    let scratch = MhiChannelScratch::new()
        .with_doorbell_mode(1)
        .with_polling_configuration(0x1f)
        .with_burst_mode(2)
        .with_oob_moderation_threshold(0x1234);
    assert_eq!(u32::from(scratch), 1 | (0x1f << 2) | (2 << 7) | (0x1234 << 9));

    // Not started yet.
    assert!(matches!(
        h.mhi.connect_endpoint(PF, channel_config(20, scratch)),
        Err(DmaError::State(StateError::Wrong { .. }))
    ));
    h.mhi.start(PF).unwrap();

    let handle = h.mhi.connect_endpoint(PF, channel_config(20, scratch)).unwrap();
    assert_eq!(handle.function(), PF);
    assert!(h.ring.is_running(ChannelId(20)));
    assert_eq!(
        handle.endpoint().read_scratch(MHI_SCRATCH_INDEX).unwrap(),
        u32::from(scratch)
    );

    h.mhi.disconnect_endpoint(handle).unwrap();
    assert!(!h.ring.is_allocated(ChannelId(20)));
    assert!(h.engine.allocated_channels().is_empty());
}

#[test]
fn connect_failure_unwinds() {
    let h = Harness::new();
    h.mhi.notify_ready().unwrap();
    h.mhi.init(PF).unwrap();
    h.mhi.start(PF).unwrap();
    h.ring.fail_allocate(ChannelId(21));
    let err = h
        .mhi
        .connect_endpoint(PF, channel_config(21, MhiChannelScratch::new()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert!(h.engine.allocated_channels().is_empty());

    let err = h
        .mhi
        .connect_endpoint(PF, channel_config(99, MhiChannelScratch::new()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn destroy_releases_everything() {
    let h = Harness::new();
    let vf = Function::virtual_function(0);
    h.mhi.notify_ready().unwrap();
    h.mhi.init(vf).unwrap();
    h.mhi.start(vf).unwrap();
    let first = h
        .mhi
        .connect_endpoint(vf, channel_config(20, MhiChannelScratch::new()))
        .unwrap();
    let _second = h
        .mhi
        .connect_endpoint(vf, channel_config(21, MhiChannelScratch::new()))
        .unwrap();
    h.mhi.disconnect_endpoint(first).unwrap();

    h.memcpy_init(vf);
    h.mhi.memcpy_enable(vf).unwrap();
    h.mhi.memcpy_disable(vf).unwrap();

    h.mhi.destroy(vf).unwrap();
    assert!(h.engine.allocated_channels().is_empty());
    assert!(!h.ring.is_allocated(ChannelId(21)));
    assert!(matches!(
        h.mhi.function_state(vf),
        Err(DmaError::State(StateError::NotInitialized))
    ));
    assert!(matches!(
        h.mhi.memcpy_stats(vf),
        Err(DmaError::State(StateError::NotInitialized))
    ));
}

#[test]
fn destroy_failure_keeps_function() {
    let h = Harness::new();
    let vf = Function::virtual_function(4);
    h.mhi.notify_ready().unwrap();
    h.mhi.init(vf).unwrap();
    h.mhi.start(vf).unwrap();
    let handle = h
        .mhi
        .connect_endpoint(vf, channel_config(30, MhiChannelScratch::new()))
        .unwrap();
    h.memcpy_init(vf);
    h.mhi.memcpy_enable(vf).unwrap();
    h.mhi.memcpy_disable(vf).unwrap();

    // Tear the context down directly, leaving its slot behind.
    let context = h.mhi.context(vf.index().unwrap()).unwrap();
    context.destroy().unwrap();

    assert!(matches!(
        h.mhi.destroy(vf),
        Err(DmaError::State(StateError::NotInitialized))
    ));
    assert_eq!(h.mhi.function_state(vf).unwrap(), FunctionState::Started);
    assert!(h.ring.is_running(ChannelId(30)));
    h.mhi.disconnect_endpoint(handle).unwrap();
    assert!(!h.ring.is_allocated(ChannelId(30)));
}
