use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use areadet_core::buffer::OwnerTag;
use areadet_core::buffer_mgr::{Delivery, FrameSink};
use areadet_core::device::DeviceHandle;
use areadet_core::error::{DetectorError, Result};
use areadet_core::geometry::FrameDim;
use areadet_core::status::DetStatus;
use areadet_core::traits::{AcqDriver, AcqParams, ResetLevel};

use crate::device::SimDevice;

// 曝光/延迟期间检查停止标志的间隔
const STOP_POLL: Duration = Duration::from_millis(5);

/// 待触发的故障注入
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultInjection {
    /// 下一次 start 被拒绝
    pub reject_next_start: bool,
    /// 下一次采集在读出这一帧时报告硬件错误
    pub fault_at_frame: Option<u64>,
}

/// Prepare 阶段锁定的参数和模拟 DMA 区域
struct Prepared {
    params: AcqParams,
    // 按 u64 分配保证对齐，交付时以字节视图出现
    region: Vec<u64>,
}

struct SimRun {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// 模拟采集驱动，每次 start 启动一个 "areadet-sim-acq" 线程
pub struct SimAcq {
    dev: Arc<DeviceHandle<SimDevice>>,
    prepared: Mutex<Option<Prepared>>,
    runs: Mutex<Vec<SimRun>>,
    faults: Mutex<FaultInjection>,
    det_status: Arc<AtomicU32>,
}

impl SimAcq {
    pub fn new(dev: Arc<DeviceHandle<SimDevice>>) -> Self {
        Self {
            dev,
            prepared: Mutex::new(None),
            runs: Mutex::new(Vec::new()),
            faults: Mutex::new(FaultInjection::default()),
            det_status: Arc::new(AtomicU32::new(DetStatus::IDLE.bits())),
        }
    }

    pub fn inject(&self, faults: FaultInjection) {
        tracing::debug!(target: "areadet::sim", "fault injection armed: {:?}", faults);
        *self.faults.lock() = faults;
    }

    /// 回收已经退出的采集线程
    fn reap(runs: &mut Vec<SimRun>) {
        let mut i = 0;
        while i < runs.len() {
            if runs[i].thread.is_finished() {
                let run = runs.swap_remove(i);
                if run.thread.join().is_err() {
                    tracing::error!(target: "areadet::sim", "acquisition thread panicked");
                }
            } else {
                i += 1;
            }
        }
    }

    fn signal_stop(&self) {
        for run in self.runs.lock().iter() {
            run.stop.store(true, Ordering::Release);
        }
    }
}

impl AcqDriver for SimAcq {
    fn prepare(&self, params: &AcqParams) -> Result<()> {
        {
            // 校验寄存器与锁定参数一致
            let dev = self.dev.acq_lock()?;
            if dev.regs.nb_frames != params.nb_frames || dev.regs.bin != params.bin {
                return Err(DetectorError::DeviceFault(format!(
                    "sim:{} registers out of sync with armed parameters",
                    dev.board()
                )));
            }
        }

        let region = match params.ownership {
            OwnerTag::Mapped => {
                let bytes = params.nb_buffers * params.frame_dim.mem_size();
                vec![0u64; bytes.div_ceil(8)]
            }
            OwnerTag::Owned => Vec::new(),
        };
        *self.prepared.lock() = Some(Prepared {
            params: params.clone(),
            region,
        });
        Ok(())
    }

    fn start(&self, sink: FrameSink) -> Result<()> {
        let faults = std::mem::take(&mut *self.faults.lock());
        if faults.reject_next_start {
            return Err(DetectorError::DeviceFault(
                "simulated start rejection".into(),
            ));
        }
        let prepared = self
            .prepared
            .lock()
            .take()
            .ok_or_else(|| DetectorError::DeviceFault("start without prepare".into()))?;
        // 确认设备仍然打开
        drop(self.dev.acq_lock()?);

        let stop = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            sink,
            params: prepared.params,
            region: prepared.region,
            stop: stop.clone(),
            det_status: self.det_status.clone(),
            fault_at_frame: faults.fault_at_frame,
        };
        let thread = thread::Builder::new()
            .name("areadet-sim-acq".into())
            .spawn(move || worker.run())?;

        let mut runs = self.runs.lock();
        Self::reap(&mut runs);
        runs.push(SimRun { stop, thread });
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.signal_stop();
        Ok(())
    }

    fn reset(&self, level: ResetLevel) -> Result<()> {
        self.signal_stop();
        self.prepared.lock().take();
        if level == ResetLevel::Hard {
            *self.faults.lock() = FaultInjection::default();
            self.dev.acq_lock()?.power_cycle();
            tracing::info!(target: "areadet::sim", "{} power cycled", self.dev.id());
        }
        Ok(())
    }

    fn det_status(&self) -> DetStatus {
        DetStatus::from_bits_truncate(self.det_status.load(Ordering::Acquire))
    }
}

impl Drop for SimAcq {
    fn drop(&mut self) {
        self.signal_stop();
        let current = thread::current().id();
        for run in self.runs.get_mut().drain(..) {
            // 最后一个 HwInterface 引用可能在采集线程上释放
            if run.thread.thread().id() == current {
                continue;
            }
            let _ = run.thread.join();
        }
    }
}

impl std::fmt::Debug for SimAcq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimAcq")
            .field("device", &self.dev.id())
            .field("det_status", &self.det_status())
            .finish()
    }
}

/// 采集线程的全部状态
struct Worker {
    sink: FrameSink,
    params: AcqParams,
    region: Vec<u64>,
    stop: Arc<AtomicBool>,
    det_status: Arc<AtomicU32>,
    fault_at_frame: Option<u64>,
}

impl Worker {
    fn run(mut self) {
        let acq_id = self.sink.acq_id();
        tracing::debug!(
            target: "areadet::sim",
            "acquisition {} thread running: {} frames of {}",
            acq_id,
            self.params.nb_frames,
            self.params.frame_dim
        );

        let exposure = Duration::from_secs_f64(self.params.exp_time);
        let latency = Duration::from_secs_f64(self.params.lat_time);

        for frame_nb in 0..self.params.nb_frames {
            self.set_status(DetStatus::EXPOSURE | DetStatus::SHUTTER_OPEN);
            if !self.sleep(exposure) {
                break;
            }

            if self.fault_at_frame == Some(frame_nb) {
                self.sink
                    .device_fault(format!("simulated readout failure at frame {}", frame_nb));
                break;
            }

            self.set_status(DetStatus::READOUT);
            if self.deliver(frame_nb) == Delivery::Stop {
                break;
            }

            self.set_status(DetStatus::LATENCY);
            if !self.sleep(latency) {
                break;
            }
        }

        self.set_status(DetStatus::IDLE);
        tracing::debug!(target: "areadet::sim", "acquisition {} thread exits", acq_id);
    }

    fn deliver(&mut self, frame_nb: u64) -> Delivery {
        let dim = self.params.frame_dim;
        match self.params.ownership {
            OwnerTag::Mapped => {
                let frame_bytes = dim.mem_size();
                let slot = (frame_nb % self.params.nb_buffers as u64) as usize;
                let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.region);
                let frame = &mut bytes[slot * frame_bytes..(slot + 1) * frame_bytes];
                fill_frame(frame, &dim, frame_nb);
                self.sink.mapped_frame_ready(frame)
            }
            OwnerTag::Owned => self.sink.owned_frame_ready(|buf| {
                fill_frame(buf, &dim, frame_nb);
                buf.len()
            }),
        }
    }

    fn set_status(&self, status: DetStatus) {
        self.det_status.store(status.bits(), Ordering::Release);
    }

    /// 可被 stop 打断的等待，被打断时返回 false
    fn sleep(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.stop.load(Ordering::Acquire) || !self.sink.is_active() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(STOP_POLL));
        }
    }
}

/// 生成可识别的测试图案：像素值 = 帧号 + 列号
pub fn fill_frame(buf: &mut [u8], dim: &FrameDim, frame_nb: u64) {
    let depth = dim.depth();
    let width = u64::from(dim.width().max(1));
    for (i, px) in buf.chunks_exact_mut(depth).enumerate() {
        let value = (frame_nb + i as u64 % width).to_le_bytes();
        px.copy_from_slice(&value[..depth]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use areadet_core::pixel_format::PixelType;

    #[test]
    fn pattern_encodes_frame_and_column() {
        let dim = FrameDim::new(4, 2, PixelType::Bpp16);
        let mut buf = vec![0u8; dim.mem_size()];
        fill_frame(&mut buf, &dim, 10);

        let pixels: Vec<u16> = buf
            .chunks_exact(2)
            .map(|px| u16::from_le_bytes([px[0], px[1]]))
            .collect();
        assert_eq!(pixels, [10, 11, 12, 13, 10, 11, 12, 13]);
    }
}
