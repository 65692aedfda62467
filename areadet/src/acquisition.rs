use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use areadet_core::builder::AcqConfig;
use areadet_core::callback::{frame_callback, CallbackId};
use areadet_core::frame::FrameSummary;
use areadet_core::interface::HwInterface;
use areadet_core::status::AcqState;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 一次完整采集的结果
#[derive(Debug, Clone)]
pub struct AcqReport {
    pub acq_id: u64,
    pub end_state: AcqState,
    /// 按 acq_frame_nb 递增排列
    pub frames: Vec<FrameSummary>,
    pub observer_faults: u64,
    pub elapsed: Duration,
}

impl AcqReport {
    pub fn nb_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn nb_invalid(&self) -> usize {
        self.frames.iter().filter(|f| !f.valid).count()
    }
}

/// 配置、启动并等待一次采集结束的辅助工具
///
/// ```no_run
/// # fn main() -> anyhow::Result<()> {
/// use areadet::prelude::*;
///
/// let hw = areadet::open_detector("sim:0")?;
/// let report = Acquisition::new(&hw)
///     .config(AcqConfig::new().nb_frames(3).nb_buffers(10))
///     .timeout(std::time::Duration::from_secs(5))
///     .run()?;
/// println!("{} frames", report.nb_frames());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Acquisition<'a> {
    hw: &'a HwInterface,
    config: AcqConfig,
    timeout: Option<Duration>,
}

impl<'a> Acquisition<'a> {
    pub fn new(hw: &'a HwInterface) -> Self {
        Self {
            hw,
            config: AcqConfig::default(),
            timeout: None,
        }
    }

    pub fn config(mut self, config: AcqConfig) -> Self {
        self.config = config;
        self
    }

    /// 超时后停止采集并返回错误
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn run(self) -> Result<AcqReport> {
        let (tx, rx) = unbounded();
        let id = self.hw.register_frame_callback(frame_callback(move |frame| {
            // 接收端已经退出时丢弃即可
            let _ = tx.send(frame.summary());
            Ok(true)
        }));
        let _guard = Registration { hw: self.hw, id };

        self.hw
            .arm(&self.config)
            .with_context(|| format!("Failed to arm {}", self.hw.name()))?;

        let started = Instant::now();
        self.hw
            .start_acq()
            .with_context(|| format!("Failed to start acquisition on {}", self.hw.name()))?;
        let acq_id = self.hw.status().acq_id;
        tracing::info!(target: "areadet::acq", "Acquisition {} started on {}", acq_id, self.hw.name());

        let mut frames = Vec::new();
        let end_state = self.collect(&rx, started, &mut frames)?;
        frames.extend(rx.try_iter());
        frames.retain(|f| f.acq_id == acq_id);
        frames.sort_by_key(|f| f.acq_frame_nb);

        let status = self.hw.status();
        if end_state == AcqState::Fault {
            let reason = status
                .last_error
                .map(|e| e.message)
                .unwrap_or_else(|| "unknown error".to_string());
            bail!(
                "Acquisition {} on {} ended in fault after {} frames: {}",
                acq_id,
                self.hw.name(),
                frames.len(),
                reason
            );
        }

        Ok(AcqReport {
            acq_id,
            end_state,
            frames,
            observer_faults: status.observer_faults,
            elapsed: started.elapsed(),
        })
    }

    fn collect(
        &self,
        rx: &Receiver<FrameSummary>,
        started: Instant,
        frames: &mut Vec<FrameSummary>,
    ) -> Result<AcqState> {
        loop {
            let state = self.hw.state();
            if state != AcqState::Running {
                return Ok(state);
            }

            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    self.hw.stop_acq();
                    bail!(
                        "Acquisition on {} timed out after {:?} ({} frames received)",
                        self.hw.name(),
                        timeout,
                        frames.len()
                    );
                }
            }

            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(frame) => frames.push(frame),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(self.hw.state()),
            }
        }
    }
}

/// 离开作用域时注销观察者
struct Registration<'a> {
    hw: &'a HwInterface,
    id: CallbackId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.hw.unregister_frame_callback(self.id) {
            tracing::warn!(target: "areadet::acq", "Failed to unregister {}: {}", self.id, e);
        }
    }
}
