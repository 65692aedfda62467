use std::fmt;
use std::time::{Instant, SystemTime};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{DetectorError, ErrorKind};
use crate::frame::FrameSummary;

/// 采集生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum AcqState {
    Ready,
    Armed,
    Running,
    Fault,
}

impl fmt::Display for AcqState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

bitflags! {
    /// 探测器硬件当前所处的阶段，由驱动报告
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DetStatus: u32 {
        const WAIT_FOR_TRIGGER = 1 << 0;
        const SHUTTER_OPEN     = 1 << 1;
        const EXPOSURE         = 1 << 2;
        const SHUTTER_CLOSE    = 1 << 3;
        const CHARGE_SHIFT     = 1 << 4;
        const READOUT          = 1 << 5;
        const LATENCY          = 1 << 6;
    }
}

impl DetStatus {
    /// 空集合即空闲
    pub const IDLE: DetStatus = DetStatus::empty();

    pub fn is_idle(&self) -> bool {
        self.is_empty()
    }
}

/// 最近一次错误 (类别 + 描述)
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&DetectorError> for ErrorRecord {
    fn from(err: &DetectorError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// 状态查询结果
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub acq: AcqState,
    pub det: DetStatus,
    /// 当前 (或最近一次) 采集编号
    pub acq_id: u64,
    pub running_since: Option<SystemTime>,
    pub last_error: Option<ErrorRecord>,
    /// Fault 之后依然保留最后一帧的信息
    pub last_frame: Option<FrameSummary>,
    /// 本次采集已送达的帧数
    pub nb_acquired_frames: u64,
    /// 本次采集中观察者出错的次数
    pub observer_faults: u64,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<acq={}, det={:?}, acq_id={}, nb_acquired_frames={}",
            self.acq, self.det, self.acq_id, self.nb_acquired_frames
        )?;
        if let Some(err) = &self.last_error {
            write!(f, ", last_error={:?}: {}", err.kind, err.message)?;
        }
        f.write_str(">")
    }
}

#[derive(Debug)]
pub(crate) struct StatusInner {
    pub(crate) acq: AcqState,
    pub(crate) acq_id: u64,
    pub(crate) running_since: Option<SystemTime>,
    pub(crate) started_at: Option<Instant>,
    pub(crate) last_error: Option<ErrorRecord>,
    pub(crate) last_frame: Option<FrameSummary>,
    pub(crate) nb_acquired_frames: u64,
    pub(crate) observer_faults: u64,
}

/// 状态机的共享状态
///
/// 锁只在读写字段时短暂持有，从不跨越驱动命令或观察者回调，
/// 所以观察者可以在回调里安全地查询状态。
#[derive(Debug)]
pub(crate) struct StateCell {
    inner: Mutex<StatusInner>,
    changed: Condvar,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(StatusInner {
                acq: AcqState::Ready,
                acq_id: 0,
                running_since: None,
                started_at: None,
                last_error: None,
                last_frame: None,
                nb_acquired_frames: 0,
                observer_faults: 0,
            }),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.inner.lock()
    }

    pub(crate) fn state(&self) -> AcqState {
        self.inner.lock().acq
    }

    /// 切换状态并唤醒等待者
    pub(crate) fn transition(&self, inner: &mut StatusInner, to: AcqState) {
        if inner.acq != to {
            tracing::info!(target: "areadet::hw", "acq state {} -> {}", inner.acq, to);
        }
        inner.acq = to;
        if to != AcqState::Running {
            inner.running_since = None;
        }
        self.changed.notify_all();
    }

    /// 阻塞直到状态离开 Running
    pub(crate) fn wait_while_running(&self) -> AcqState {
        let mut inner = self.inner.lock();
        while inner.acq == AcqState::Running {
            self.changed.wait(&mut inner);
        }
        inner.acq
    }

    pub(crate) fn snapshot(&self, det: DetStatus) -> Status {
        let inner = self.inner.lock();
        Status {
            acq: inner.acq,
            det,
            acq_id: inner.acq_id,
            running_since: inner.running_since,
            last_error: inner.last_error.clone(),
            last_frame: inner.last_frame,
            nb_acquired_frames: inner.nb_acquired_frames,
            observer_faults: inner.observer_faults,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn det_status_flags_compose() {
        let det = DetStatus::EXPOSURE | DetStatus::SHUTTER_OPEN;
        assert!(det.contains(DetStatus::EXPOSURE));
        assert!(!det.is_idle());
        assert!(DetStatus::IDLE.is_idle());
    }

    #[test]
    fn wait_while_running_wakes_on_transition() {
        let cell = Arc::new(StateCell::new());
        {
            let mut inner = cell.lock();
            cell.transition(&mut inner, AcqState::Running);
        }

        let waiter = {
            let cell = cell.clone();
            thread::spawn(move || cell.wait_while_running())
        };

        thread::sleep(Duration::from_millis(20));
        {
            let mut inner = cell.lock();
            cell.transition(&mut inner, AcqState::Ready);
        }
        assert_eq!(waiter.join().ok(), Some(AcqState::Ready));
    }

    #[test]
    fn error_record_keeps_kind_and_message() {
        let err = DetectorError::DeviceFault("start rejected".into());
        let rec = ErrorRecord::from(&err);
        assert_eq!(rec.kind, ErrorKind::DeviceFault);
        assert_eq!(rec.message, "Device fault: start rejected");
    }
}
