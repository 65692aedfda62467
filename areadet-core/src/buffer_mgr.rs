use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::buffer::{FrameBuffer, OwnedBuffer, OwnerTag};
use crate::callback::{
    CallbackId, CallbackList, DispatchOutcome, FaultHandler, FrameCallback, StopCause,
};
use crate::error::{DetectorError, Result};
use crate::frame::FrameInfo;
use crate::geometry::FrameDim;
use crate::status::{AcqState, ErrorRecord, StateCell};
use crate::traits::{AcqParams, BufferCtrl};

/// 默认的帧缓冲内存预算 (1 GiB)
pub const DEFAULT_MAX_BUFFER_MEMORY: usize = 1 << 30;

/// 采集结束时回调给 HwInterface 的钩子 (acq_id, 原因)
pub(crate) type StopHook = Box<dyn Fn(u64, StopCause) + Send + Sync>;

/// 驱动投递一帧后的反馈
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// 继续采集
    Continue,
    /// 本次采集已结束 (帧数已满、被停止或被观察者要求停止)，驱动应停止出帧
    Stop,
}

#[derive(Debug)]
struct BufferConfig {
    /// 用户显式设置的帧几何
    requested: Option<FrameDim>,
    /// 最近一次 arm 锁定的帧几何
    effective: Option<FrameDim>,
    nb_buffers: usize,
}

/// Buffer Manager：缓冲池 + 帧就绪通知
///
/// 每个 HwInterface 一个，通过 `Arc` 共享给驱动 (`FrameSink`) 和能力集合。
pub struct BufferCtrlMgr {
    ownership: OwnerTag,
    max_memory: usize,
    state: Arc<StateCell>,
    config: Mutex<BufferConfig>,
    callbacks: CallbackList,
    // arm 时预分配，start 时移交给 RunState
    armed_pool: Mutex<Vec<OwnedBuffer>>,
    run: Mutex<Option<Arc<RunState>>>,
    on_stop: StopHook,
}

impl BufferCtrlMgr {
    pub(crate) fn new(
        ownership: OwnerTag,
        max_memory: usize,
        state: Arc<StateCell>,
        on_stop: StopHook,
    ) -> Self {
        Self {
            ownership,
            max_memory,
            state,
            config: Mutex::new(BufferConfig {
                requested: None,
                effective: None,
                nb_buffers: 1,
            }),
            callbacks: CallbackList::default(),
            armed_pool: Mutex::new(Vec::new()),
            run: Mutex::new(None),
            on_stop,
        }
    }

    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// 设置观察者故障处理器，`None` 恢复默认 (继续采集)
    pub fn set_fault_handler(&self, handler: Option<Arc<dyn FaultHandler>>) {
        self.callbacks.set_fault_handler(handler);
    }

    pub fn nb_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    /// 按给定帧几何计算内存预算内的缓冲区上限
    pub fn max_nb_buffers_for(&self, dim: &FrameDim) -> usize {
        match dim.mem_size() {
            0 => 0,
            size => self.max_memory / size,
        }
    }

    pub(crate) fn requested_frame_dim(&self) -> Option<FrameDim> {
        self.config.lock().requested
    }

    fn ensure_ready(&self, op: &'static str) -> Result<()> {
        let state = self.state.state();
        if state != AcqState::Ready {
            return Err(DetectorError::InvalidState { op, state });
        }
        Ok(())
    }

    /// Ready -> Armed 时锁定几何，OWNED 模式下预分配整个缓冲池
    pub(crate) fn prepare(&self, params: &AcqParams) -> Result<()> {
        let mem_size = params.frame_dim.mem_size();
        let mut pool = self.armed_pool.lock();
        pool.clear();
        if self.ownership == OwnerTag::Owned {
            pool.extend((0..params.nb_buffers).map(|_| OwnedBuffer::zeroed(mem_size)));
        }
        {
            let mut config = self.config.lock();
            config.effective = Some(params.frame_dim);
            config.nb_buffers = params.nb_buffers;
        }

        tracing::info!(
            target: "areadet::buffer",
            "Buffer pool prepared: {} x {} ({})",
            params.nb_buffers,
            params.frame_dim,
            self.ownership
        );
        Ok(())
    }

    /// Armed -> Ready，释放预分配的缓冲池
    pub(crate) fn disarm(&self) {
        self.armed_pool.lock().clear();
    }

    /// 开始一次采集，返回交给驱动的 FrameSink
    pub(crate) fn begin_run(
        self: &Arc<Self>,
        acq_id: u64,
        params: &AcqParams,
        started_at: Instant,
    ) -> FrameSink {
        let mut pool = std::mem::take(&mut *self.armed_pool.lock());
        if self.ownership == OwnerTag::Owned && pool.len() != params.nb_buffers {
            let mem_size = params.frame_dim.mem_size();
            pool = (0..params.nb_buffers)
                .map(|_| OwnedBuffer::zeroed(mem_size))
                .collect();
        }

        let run = Arc::new(RunState {
            acq_id,
            nb_frames: params.nb_frames,
            frame_dim: params.frame_dim,
            nb_buffers: params.nb_buffers,
            started_at,
            active: AtomicBool::new(true),
            slots: Mutex::new(RunSlots { next_seq: 0, pool }),
        });
        if let Some(old) = self.run.lock().replace(run.clone()) {
            old.deactivate();
        }

        tracing::debug!(target: "areadet::buffer", "Run {} begins", acq_id);
        FrameSink {
            mgr: self.clone(),
            run,
        }
    }

    /// 结束当前采集，之后到达的帧都被丢弃
    pub(crate) fn end_run(&self) {
        if let Some(run) = self.run.lock().take() {
            if run.deactivate() {
                tracing::debug!(target: "areadet::buffer", "Run {} ended", run.acq_id);
            }
        }
    }

    /// 通知之后更新状态，返回是否需要结束本次采集
    fn record(
        &self,
        run: &RunState,
        info: &FrameInfo<'_>,
        outcome: DispatchOutcome,
    ) -> Option<StopCause> {
        {
            let mut st = self.state.lock();
            // 旧采集的迟到帧不能污染新采集的统计
            if st.acq_id == run.acq_id {
                st.nb_acquired_frames = info.acq_frame_nb + 1;
                st.last_frame = Some(info.summary());
                st.observer_faults += outcome.faults.len() as u64;
                if let Some(fault) = outcome.faults.last() {
                    st.last_error = Some(ErrorRecord::from(&DetectorError::from(fault)));
                }
            }
        }

        outcome.stop.or_else(|| {
            (info.acq_frame_nb + 1 >= run.nb_frames).then_some(StopCause::FrameCountReached)
        })
    }
}

impl BufferCtrl for BufferCtrlMgr {
    fn set_frame_dim(&self, dim: FrameDim) -> Result<()> {
        self.ensure_ready("set_frame_dim")?;
        dim.validate()?;
        let mut config = self.config.lock();
        config.requested = Some(dim);
        config.effective = None;
        tracing::debug!(target: "areadet::buffer", "Frame dim set to {}", dim);
        Ok(())
    }

    fn frame_dim(&self) -> Option<FrameDim> {
        let config = self.config.lock();
        config.effective.or(config.requested)
    }

    fn set_nb_buffers(&self, nb_buffers: usize) -> Result<()> {
        self.ensure_ready("set_nb_buffers")?;
        if nb_buffers == 0 {
            return Err(DetectorError::invalid_param(
                "nb_buffers",
                "at least one buffer is required",
            ));
        }
        if let Some(dim) = self.frame_dim() {
            let max = self.max_nb_buffers_for(&dim);
            if nb_buffers > max {
                return Err(DetectorError::invalid_param(
                    "nb_buffers",
                    format!("{} exceeds maximum {} for {}", nb_buffers, max, dim),
                ));
            }
        }
        self.config.lock().nb_buffers = nb_buffers;
        Ok(())
    }

    fn nb_buffers(&self) -> usize {
        self.config.lock().nb_buffers
    }

    fn max_nb_buffers(&self) -> Result<usize> {
        let dim = self
            .frame_dim()
            .ok_or_else(|| DetectorError::invalid_param("frame_dim", "not configured"))?;
        Ok(self.max_nb_buffers_for(&dim))
    }

    fn ownership(&self) -> OwnerTag {
        self.ownership
    }

    fn register_frame_callback(&self, cb: Arc<dyn FrameCallback>) -> CallbackId {
        self.callbacks.register(cb)
    }

    fn unregister_frame_callback(&self, id: CallbackId) -> Result<()> {
        self.callbacks.unregister(id)
    }
}

impl fmt::Debug for BufferCtrlMgr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferCtrlMgr")
            .field("ownership", &self.ownership)
            .field("config", &*self.config.lock())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

struct RunSlots {
    next_seq: u64,
    pool: Vec<OwnedBuffer>,
}

/// 一次采集的运行状态
struct RunState {
    acq_id: u64,
    nb_frames: u64,
    frame_dim: FrameDim,
    nb_buffers: usize,
    started_at: Instant,
    active: AtomicBool,
    // 同时充当投递锁：多个投递线程时保证帧按序号通知
    slots: Mutex<RunSlots>,
}

impl RunState {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// 返回 true 表示本次调用真正结束了采集
    fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }
}

/// 驱动进入通知协议的唯一入口
///
/// 每次 start 生成一个新的 FrameSink。采集结束 (停止、帧数已满、故障) 之后，
/// 旧 FrameSink 送来的帧全部被丢弃，不会串到下一次采集。
#[derive(Clone)]
pub struct FrameSink {
    mgr: Arc<BufferCtrlMgr>,
    run: Arc<RunState>,
}

impl FrameSink {
    pub fn acq_id(&self) -> u64 {
        self.run.acq_id
    }

    pub fn frame_dim(&self) -> FrameDim {
        self.run.frame_dim
    }

    pub fn nb_buffers(&self) -> usize {
        self.run.nb_buffers
    }

    pub fn nb_frames(&self) -> u64 {
        self.run.nb_frames
    }

    pub fn ownership(&self) -> OwnerTag {
        self.mgr.ownership
    }

    pub fn is_active(&self) -> bool {
        self.run.is_active()
    }

    /// 下一帧的序号
    pub fn next_frame_nb(&self) -> u64 {
        self.run.slots.lock().next_seq
    }

    /// 投递一帧驱动内存 (MAPPED)
    ///
    /// `data` 只在本次调用内被借用。超出一帧大小的部分被忽略，
    /// 不足一帧时照常通知，但 `is_valid()` 为 false。
    pub fn mapped_frame_ready(&self, data: &[u8]) -> Delivery {
        let payload = &data[..data.len().min(self.run.frame_dim.mem_size())];

        let mut slots = self.run.slots.lock();
        let Some(seq) = self.claim(&mut slots) else {
            return Delivery::Stop;
        };
        let info = self.frame_info(seq, FrameBuffer::Mapped(payload), payload.len());
        let cause = self.notify(&info);
        self.finish(slots, cause)
    }

    /// 投递一帧到当前槽位的 OWNED 缓冲区
    ///
    /// `fill` 把像素写入槽位，返回写入的字节数。
    pub fn owned_frame_ready<F>(&self, fill: F) -> Delivery
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let mut slots = self.run.slots.lock();
        let Some(seq) = self.claim(&mut slots) else {
            return Delivery::Stop;
        };

        let nb_slots = slots.pool.len() as u64;
        if nb_slots == 0 {
            drop(slots);
            self.device_fault("OWNED delivery without a buffer pool");
            return Delivery::Stop;
        }
        let slot = &mut slots.pool[(seq % nb_slots) as usize];
        let (data, realloc) = slot.writable();
        if realloc {
            tracing::debug!(
                target: "areadet::buffer",
                "Slot {} still retained, allocated a fresh block", seq % nb_slots
            );
        }
        let valid_bytes = fill(data).min(data.len());

        let info = self.frame_info(seq, FrameBuffer::Owned(slot), valid_bytes);
        let cause = self.notify(&info);
        self.finish(slots, cause)
    }

    /// 分配下一个序号，采集已结束时返回 None
    fn claim(&self, slots: &mut RunSlots) -> Option<u64> {
        if !self.run.is_active() || slots.next_seq >= self.run.nb_frames {
            tracing::debug!(
                target: "areadet::buffer",
                "Frame discarded, run {} is over", self.run.acq_id
            );
            return None;
        }
        let seq = slots.next_seq;
        slots.next_seq += 1;
        Some(seq)
    }

    fn frame_info<'b>(
        &self,
        seq: u64,
        buffer: FrameBuffer<'b>,
        valid_bytes: usize,
    ) -> FrameInfo<'b> {
        let info = FrameInfo {
            acq_frame_nb: seq,
            frame_dim: self.run.frame_dim,
            buffer,
            acq_id: self.run.acq_id,
            timestamp: self.run.started_at.elapsed(),
            valid_bytes,
        };
        if !info.is_valid() {
            tracing::warn!(
                target: "areadet::buffer",
                "Truncated frame {}: {} of {} bytes",
                seq,
                valid_bytes,
                self.run.frame_dim.mem_size()
            );
        }
        info
    }

    fn notify(&self, info: &FrameInfo<'_>) -> Option<StopCause> {
        tracing::debug!(target: "areadet::buffer", "Frame ready: {}", info);
        let outcome = self.mgr.callbacks.dispatch(info);
        self.mgr.record(&self.run, info, outcome)
    }

    fn finish(
        &self,
        slots: MutexGuard<'_, RunSlots>,
        cause: Option<StopCause>,
    ) -> Delivery {
        let Some(cause) = cause else {
            return Delivery::Continue;
        };
        // 在投递锁内关闭，保证之后的帧不再通知
        let ended = self.run.deactivate();
        drop(slots);
        if ended {
            tracing::debug!(
                target: "areadet::buffer",
                "Run {} ends: {:?}", self.run.acq_id, cause
            );
            (self.mgr.on_stop)(self.run.acq_id, cause);
        }
        Delivery::Stop
    }

    /// 驱动报告硬件错误，结束本次采集并让接口进入 Fault
    pub fn device_fault(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(
            target: "areadet::buffer",
            "Device fault during run {}: {}", self.run.acq_id, message
        );
        if self.run.deactivate() {
            (self.mgr.on_stop)(self.run.acq_id, StopCause::DeviceFault(message));
        }
    }
}

impl fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSink")
            .field("acq_id", &self.run.acq_id)
            .field("frame_dim", &self.run.frame_dim)
            .field("nb_frames", &self.run.nb_frames)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::frame_callback;
    use crate::error::ErrorKind;
    use crate::geometry::Bin;
    use crate::pixel_format::PixelType;
    use crate::traits::TrigMode;

    fn params(nb_frames: u64, nb_buffers: usize) -> AcqParams {
        AcqParams {
            frame_dim: FrameDim::new(4, 4, PixelType::Bpp16),
            nb_buffers,
            nb_frames,
            exp_time: 0.01,
            lat_time: 0.0,
            bin: Bin::ONE,
            trig_mode: TrigMode::IntTrig,
            ownership: OwnerTag::Owned,
        }
    }

    type Stops = Arc<Mutex<Vec<(u64, StopCause)>>>;

    fn manager(ownership: OwnerTag) -> (Arc<BufferCtrlMgr>, Stops) {
        let stops: Stops = Arc::default();
        let sink = stops.clone();
        let mgr = BufferCtrlMgr::new(
            ownership,
            DEFAULT_MAX_BUFFER_MEMORY,
            Arc::new(StateCell::new()),
            Box::new(move |acq_id, cause| sink.lock().push((acq_id, cause))),
        );
        (Arc::new(mgr), stops)
    }

    fn start(mgr: &Arc<BufferCtrlMgr>, acq_id: u64, p: &AcqParams) -> FrameSink {
        {
            let mut st = mgr.state.lock();
            st.acq_id = acq_id;
            mgr.state.transition(&mut st, AcqState::Running);
        }
        mgr.prepare(p).unwrap();
        mgr.begin_run(acq_id, p, Instant::now())
    }

    #[test]
    fn setters_require_ready() {
        let (mgr, _) = manager(OwnerTag::Mapped);
        mgr.set_nb_buffers(4).unwrap();
        assert!(mgr.set_nb_buffers(0).is_err());

        {
            let mut st = mgr.state.lock();
            mgr.state.transition(&mut st, AcqState::Armed);
        }
        let err = mgr.set_nb_buffers(8).unwrap_err();
        assert!(matches!(
            err,
            DetectorError::InvalidState { state: AcqState::Armed, .. }
        ));
        assert_eq!(mgr.nb_buffers(), 4);

        // 状态检查先于参数检查
        for err in [
            mgr.set_nb_buffers(0).unwrap_err(),
            mgr.set_frame_dim(FrameDim::new(0, 0, PixelType::Bpp16)).unwrap_err(),
        ] {
            assert_eq!(err.kind(), ErrorKind::InvalidState);
        }
    }

    #[test]
    fn max_nb_buffers_follows_memory_budget() {
        let state = Arc::new(StateCell::new());
        let mgr = BufferCtrlMgr::new(OwnerTag::Owned, 1000, state, Box::new(|_, _| {}));
        assert!(mgr.max_nb_buffers().is_err());

        mgr.set_frame_dim(FrameDim::new(10, 10, PixelType::Bpp16)).unwrap();
        assert_eq!(mgr.max_nb_buffers().unwrap(), 5);
        assert!(mgr.set_nb_buffers(6).is_err());
    }

    #[test]
    fn frames_are_numbered_and_run_self_stops() {
        let (mgr, stops) = manager(OwnerTag::Mapped);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        mgr.register_frame_callback(frame_callback(move |frame| {
            log.lock().push(frame.acq_frame_nb);
            Ok(true)
        }));

        let sink = start(&mgr, 1, &params(3, 2));
        let dma = vec![0u8; 32];
        assert_eq!(sink.mapped_frame_ready(&dma), Delivery::Continue);
        assert_eq!(sink.mapped_frame_ready(&dma), Delivery::Continue);
        assert_eq!(sink.mapped_frame_ready(&dma), Delivery::Stop);
        // 帧数已满，之后的帧被丢弃
        assert_eq!(sink.mapped_frame_ready(&dma), Delivery::Stop);

        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert_eq!(*stops.lock(), vec![(1, StopCause::FrameCountReached)]);
        assert_eq!(mgr.state.lock().nb_acquired_frames, 3);
    }

    #[test]
    fn retained_slot_is_not_overwritten() {
        let (mgr, _) = manager(OwnerTag::Owned);
        let kept = Arc::new(Mutex::new(Vec::new()));
        let store = kept.clone();
        mgr.register_frame_callback(frame_callback(move |frame| {
            store.lock().extend(frame.buffer.retain());
            Ok(true)
        }));

        // 2 个槽位，4 帧：槽位复用时原来的数据仍被持有
        let sink = start(&mgr, 1, &params(4, 2));
        for value in 0..4u8 {
            sink.owned_frame_ready(|buf| {
                buf.fill(value);
                buf.len()
            });
        }

        let kept = kept.lock();
        assert_eq!(kept.len(), 4);
        for (value, buf) in kept.iter().enumerate() {
            assert!(buf.data().iter().all(|&b| b == value as u8));
        }
        assert!(!kept[0].same_block(&kept[2]));
    }

    #[test]
    fn ended_run_discards_late_frames() {
        let (mgr, stops) = manager(OwnerTag::Mapped);
        let sink = start(&mgr, 7, &params(10, 1));
        let dma = vec![0u8; 32];
        sink.mapped_frame_ready(&dma);

        mgr.end_run();
        assert!(!sink.is_active());
        assert_eq!(sink.mapped_frame_ready(&dma), Delivery::Stop);
        assert_eq!(mgr.state.lock().nb_acquired_frames, 1);
        // 外部停止不触发结束钩子
        assert!(stops.lock().is_empty());
    }

    #[test]
    fn short_payload_is_flagged_invalid() {
        let (mgr, _) = manager(OwnerTag::Mapped);
        let valid = Arc::new(Mutex::new(Vec::new()));
        let log = valid.clone();
        mgr.register_frame_callback(frame_callback(move |frame| {
            log.lock().push(frame.is_valid());
            Ok(true)
        }));

        let sink = start(&mgr, 1, &params(2, 1));
        sink.mapped_frame_ready(&[0u8; 10]);
        sink.mapped_frame_ready(&[0u8; 64]);
        assert_eq!(*valid.lock(), vec![false, true]);
    }

    #[test]
    fn device_fault_ends_run_once() {
        let (mgr, stops) = manager(OwnerTag::Mapped);
        let sink = start(&mgr, 3, &params(10, 1));
        sink.device_fault("fifo overrun");
        sink.device_fault("again");
        assert_eq!(
            *stops.lock(),
            vec![(3, StopCause::DeviceFault("fifo overrun".into()))]
        );
    }
}
