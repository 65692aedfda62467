use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use areadet_core::buffer::OwnedBuffer;
use areadet_core::callback::FrameCallback;
use areadet_core::error::BoxError;
use areadet_core::frame::FrameInfo;
use areadet_core::geometry::FrameDim;
use areadet_core::task_pool::TaskPoolHandle;

/// 脱离通知调用之后的一帧
///
/// OWNED 帧是零拷贝保留 (引用计数 +1)，MAPPED 帧是一次拷贝。
#[derive(Debug, Clone)]
pub struct SavedFrame {
    pub acq_id: u64,
    pub acq_frame_nb: u64,
    pub frame_dim: FrameDim,
    pub timestamp: Duration,
    pub valid: bool,
    pub data: OwnedBuffer,
}

/// 外部的帧消费者 (写盘、压缩、网络发送)，在任务池线程上运行
pub trait FrameConsumer: Send + Sync + 'static {
    fn consume(&self, frame: SavedFrame) -> anyhow::Result<()>;
}

impl<F> FrameConsumer for F
where
    F: Fn(SavedFrame) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn consume(&self, frame: SavedFrame) -> anyhow::Result<()> {
        self(frame)
    }
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    saved: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SavingStats {
    pub queued: u64,
    pub saved: u64,
    pub failed: u64,
}

/// 把每一帧交给任务池里的 FrameConsumer 的观察者
///
/// 通知路径上只做保留/拷贝和入队，从不阻塞。
pub struct SavingObserver {
    pool: TaskPoolHandle,
    consumer: Arc<dyn FrameConsumer>,
    counters: Arc<Counters>,
}

impl SavingObserver {
    pub fn new(pool: TaskPoolHandle, consumer: impl FrameConsumer) -> Self {
        Self {
            pool,
            consumer: Arc::new(consumer),
            counters: Arc::default(),
        }
    }

    pub fn stats(&self) -> SavingStats {
        SavingStats {
            queued: self.counters.queued.load(Ordering::Acquire),
            saved: self.counters.saved.load(Ordering::Acquire),
            failed: self.counters.failed.load(Ordering::Acquire),
        }
    }
}

impl FrameCallback for SavingObserver {
    fn new_frame_ready(&self, frame: &FrameInfo<'_>) -> Result<bool, BoxError> {
        let saved = SavedFrame {
            acq_id: frame.acq_id,
            acq_frame_nb: frame.acq_frame_nb,
            frame_dim: frame.frame_dim,
            timestamp: frame.timestamp,
            valid: frame.is_valid(),
            data: frame.buffer.to_owned_buffer(),
        };

        let consumer = self.consumer.clone();
        let counters = self.counters.clone();
        self.pool.submit(move || {
            let nb = saved.acq_frame_nb;
            match consumer.consume(saved) {
                Ok(()) => {
                    counters.saved.fetch_add(1, Ordering::AcqRel);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::AcqRel);
                    tracing::warn!(target: "areadet::saving", "Frame {} not saved: {:#}", nb, e);
                }
            }
        })?;
        self.counters.queued.fetch_add(1, Ordering::AcqRel);
        Ok(true)
    }
}

impl std::fmt::Debug for SavingObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SavingObserver")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(all(test, feature = "simulation"))]
mod tests {
    use super::*;
    use crate::backend::open_simulation;
    use crate::runtime::Runtime;
    use anyhow::bail;
    use areadet_core::prelude::*;
    use areadet_simulation::SimConfig;
    use std::sync::Mutex;

    fn run(ownership: OwnerTag) -> anyhow::Result<(SavingStats, Vec<(u64, bool)>)> {
        let rt = Runtime::new(TaskPoolConfig::new().workers(2))?;
        let hw = open_simulation("sim:0", SimConfig::default().ownership(ownership))?;
        let frames = Arc::new(Mutex::new(Vec::new()));

        let sink = frames.clone();
        let observer = Arc::new(SavingObserver::new(rt.pool(), move |frame: SavedFrame| -> anyhow::Result<()> {
            if frame.acq_frame_nb == 3 {
                bail!("simulated write error");
            }
            let unique = frame.data.ref_count() == 1;
            sink.lock().unwrap().push((frame.acq_frame_nb, unique));
            Ok(())
        }));
        hw.register_frame_callback(observer.clone());

        hw.arm(
            &AcqConfig::new()
                .nb_frames(5)
                .nb_buffers(2)
                .exp_time(1e-4)
                .frame_dim(FrameDim::new(16, 16, PixelType::Bpp16)),
        )?;
        hw.start_acq()?;
        hw.wait_acq_end();
        rt.wait();

        let mut frames = frames.lock().unwrap().clone();
        frames.sort();
        Ok((observer.stats(), frames))
    }

    #[test]
    fn every_frame_reaches_the_consumer() -> anyhow::Result<()> {
        for ownership in [OwnerTag::Mapped, OwnerTag::Owned] {
            let (stats, frames) = run(ownership)?;
            assert_eq!(
                stats,
                SavingStats {
                    queued: 5,
                    saved: 4,
                    failed: 1
                }
            );
            let numbers: Vec<u64> = frames.iter().map(|(nb, _)| *nb).collect();
            assert_eq!(numbers, vec![0, 1, 2, 4]);
        }
        Ok(())
    }

    #[test]
    fn mapped_frames_are_copied() -> anyhow::Result<()> {
        let (_, frames) = run(OwnerTag::Mapped)?;
        assert!(frames.iter().all(|(_, unique)| *unique));
        Ok(())
    }
}
