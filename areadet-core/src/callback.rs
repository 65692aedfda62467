use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{BoxError, DetectorError, Result};
use crate::frame::FrameInfo;

/// 观察者注册编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}

/// 帧就绪观察者
///
/// 在驱动的投递线程上同步调用，不能阻塞 (尤其是 I/O)。
/// 耗时工作应提交给 `TaskPool`。
pub trait FrameCallback: Send + Sync {
    /// 返回 `Ok(false)` 请求停止本次采集 (建议性)。
    /// 返回错误或 panic 都会在通知边界被捕获，记为 ObserverFault。
    fn new_frame_ready(&self, frame: &FrameInfo<'_>) -> std::result::Result<bool, BoxError>;
}

impl<F> FrameCallback for F
where
    F: Fn(&FrameInfo<'_>) -> std::result::Result<bool, BoxError> + Send + Sync,
{
    fn new_frame_ready(&self, frame: &FrameInfo<'_>) -> std::result::Result<bool, BoxError> {
        self(frame)
    }
}

/// 用闭包创建观察者，省去类型标注
pub fn frame_callback<F>(f: F) -> Arc<dyn FrameCallback>
where
    F: Fn(&FrameInfo<'_>) -> std::result::Result<bool, BoxError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// 一次观察者故障的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverFault {
    pub callback_id: CallbackId,
    pub acq_id: u64,
    pub acq_frame_nb: u64,
    pub message: String,
}

impl fmt::Display for ObserverFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed on frame {} (acq {}): {}",
            self.callback_id, self.acq_frame_nb, self.acq_id, self.message
        )
    }
}

impl From<&ObserverFault> for DetectorError {
    fn from(fault: &ObserverFault) -> Self {
        DetectorError::ObserverFault(fault.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    Continue,
    Stop,
}

/// 观察者故障处理器，决定采集是否继续
pub trait FaultHandler: Send + Sync {
    fn observer_fault(&self, fault: &ObserverFault) -> FaultAction;
}

impl<F> FaultHandler for F
where
    F: Fn(&ObserverFault) -> FaultAction + Send + Sync,
{
    fn observer_fault(&self, fault: &ObserverFault) -> FaultAction {
        self(fault)
    }
}

/// 采集结束的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCause {
    /// 某个观察者返回了 false
    ObserverRequest,
    /// 故障处理器要求停止
    FaultHandler,
    /// 已送达配置的帧数
    FrameCountReached,
    /// 驱动在投递期间报告了硬件错误
    DeviceFault(String),
}

/// 一帧通知完成后的汇总
#[derive(Debug, Default)]
pub(crate) struct DispatchOutcome {
    pub(crate) stop: Option<StopCause>,
    pub(crate) faults: Vec<ObserverFault>,
}

type Entry = (CallbackId, Arc<dyn FrameCallback>);

/// 观察者注册表 + 扇出
#[derive(Default)]
pub(crate) struct CallbackList {
    next_id: AtomicU64,
    entries: RwLock<Vec<Entry>>,
    fault_handler: RwLock<Option<Arc<dyn FaultHandler>>>,
}

impl CallbackList {
    pub(crate) fn register(&self, cb: Arc<dyn FrameCallback>) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.entries.write().push((id, cb));
        tracing::debug!(target: "areadet::buffer", "Frame callback registered: {}", id);
        id
    }

    pub(crate) fn unregister(&self, id: CallbackId) -> Result<()> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(cb_id, _)| *cb_id != id);
        if entries.len() == before {
            return Err(DetectorError::invalid_param(
                "callback_id",
                format!("{} is not registered", id),
            ));
        }
        tracing::debug!(target: "areadet::buffer", "Frame callback unregistered: {}", id);
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn set_fault_handler(&self, handler: Option<Arc<dyn FaultHandler>>) {
        *self.fault_handler.write() = handler;
    }

    /// 把一帧同步送给每个观察者
    ///
    /// 每帧开始时拍一次快照，不持锁调用观察者：
    /// 回调内部注销自己或别人不会死锁，并从下一帧开始生效。
    pub(crate) fn dispatch(&self, frame: &FrameInfo<'_>) -> DispatchOutcome {
        let observers: Vec<Entry> = self.entries.read().clone();
        let mut outcome = DispatchOutcome::default();

        for (id, cb) in observers {
            let message = match panic::catch_unwind(AssertUnwindSafe(|| cb.new_frame_ready(frame)))
            {
                Ok(Ok(true)) => continue,
                Ok(Ok(false)) => {
                    tracing::debug!(
                        target: "areadet::buffer",
                        "{} requested stop at frame {}", id, frame.acq_frame_nb
                    );
                    outcome.stop.get_or_insert(StopCause::ObserverRequest);
                    continue;
                }
                Ok(Err(err)) => err.to_string(),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };

            let fault = ObserverFault {
                callback_id: id,
                acq_id: frame.acq_id,
                acq_frame_nb: frame.acq_frame_nb,
                message,
            };
            tracing::warn!(target: "areadet::buffer", "Observer fault: {}", fault);

            if self.handle_fault(&fault) == FaultAction::Stop {
                outcome.stop.get_or_insert(StopCause::FaultHandler);
            }
            outcome.faults.push(fault);
        }

        outcome
    }

    fn handle_fault(&self, fault: &ObserverFault) -> FaultAction {
        let handler = self.fault_handler.read().clone();
        let Some(handler) = handler else {
            return FaultAction::Continue;
        };
        // 处理器本身也在投递线程上，同样不能让 panic 穿过边界
        match panic::catch_unwind(AssertUnwindSafe(|| handler.observer_fault(fault))) {
            Ok(action) => action,
            Err(payload) => {
                tracing::error!(
                    target: "areadet::buffer",
                    "Fault handler panicked: {}", panic_message(payload.as_ref())
                );
                FaultAction::Continue
            }
        }
    }
}

impl fmt::Debug for CallbackList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackList")
            .field("observers", &self.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
