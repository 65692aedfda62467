use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;

use crate::buffer::OwnerTag;
use crate::buffer_mgr::{BufferCtrlMgr, DEFAULT_MAX_BUFFER_MEMORY};
use crate::builder::AcqConfig;
use crate::callback::{CallbackId, FaultHandler, FrameCallback, StopCause};
use crate::error::{DetectorError, Result};
use crate::geometry::{Bin, FrameDim};
use crate::guarded::{GuardedBin, GuardedDetInfo, GuardedSync};
use crate::status::{AcqState, ErrorRecord, StateCell, Status};
use crate::traits::{
    AcqDriver, AcqParams, BinCtrl, BufferCtrl, Capabilities, Capability, CapabilityObj,
    CapabilitySet, DetInfoCtrl, ResetLevel, SyncCtrl,
};

/// 探测器的统一控制入口：能力集合 + 采集状态机
///
/// 克隆代价很低 (共享同一个内部状态)，可以交给观察者或其它控制线程。
///
/// ```text
///            arm / prepare_acq          start_acq
///   Ready ─────────────────────> Armed ──────────> Running
///     ^  <──── stop_acq ─────────┘                   │
///     └──────── stop_acq / 帧数已满 / soft reset ────┘
///   Fault ── hard reset ──> Ready
/// ```
#[derive(Clone)]
pub struct HwInterface {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    // 串行化 arm/start/stop/reset 以及采集结束钩子
    ctrl: Mutex<()>,
    state: Arc<StateCell>,
    caps: CapabilitySet,
    buffer: Arc<BufferCtrlMgr>,
    det_info: Arc<dyn DetInfoCtrl>,
    sync: Arc<dyn SyncCtrl>,
    bin: Option<Arc<dyn BinCtrl>>,
    driver: Arc<dyn AcqDriver>,
    next_acq_id: AtomicU64,
    armed: Mutex<Option<AcqParams>>,
}

impl HwInterface {
    pub fn builder(name: impl Into<String>, driver: Arc<dyn AcqDriver>) -> HwInterfaceBuilder {
        HwInterfaceBuilder {
            name: name.into(),
            driver,
            ownership: OwnerTag::Mapped,
            max_buffer_memory: DEFAULT_MAX_BUFFER_MEMORY,
            det_info: None,
            sync: None,
            bin: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 不阻止接口释放的弱句柄
    pub fn downgrade(&self) -> WeakHwInterface {
        WeakHwInterface {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // --- 能力查询 ---

    /// 不支持的能力返回 `None`
    pub fn capability<C: Capability + ?Sized>(&self) -> Option<Arc<C>> {
        self.inner.caps.get::<C>()
    }

    /// 不支持的能力返回 `Unsupported`
    pub fn require<C: Capability + ?Sized>(&self) -> Result<Arc<C>> {
        self.capability::<C>()
            .ok_or(DetectorError::Unsupported(C::KIND))
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.caps.supported()
    }

    /// Buffer Manager 总是存在
    pub fn buffer(&self) -> &Arc<BufferCtrlMgr> {
        &self.inner.buffer
    }

    /// 注册帧观察者
    ///
    /// 接口持有观察者。观察者若持有 `HwInterface` 的克隆会形成引用环，
    /// 接口、驱动和设备句柄都不会被释放；需要回查接口时改用 `downgrade()` 得到的弱句柄。
    pub fn register_frame_callback(&self, cb: Arc<dyn FrameCallback>) -> CallbackId {
        self.inner.buffer.register_frame_callback(cb)
    }

    pub fn unregister_frame_callback(&self, id: CallbackId) -> Result<()> {
        self.inner.buffer.unregister_frame_callback(id)
    }

    pub fn set_fault_handler(&self, handler: Option<Arc<dyn FaultHandler>>) {
        self.inner.buffer.set_fault_handler(handler);
    }

    // --- 状态机 ---

    /// 用设备当前的参数进入 Armed
    pub fn prepare_acq(&self) -> Result<()> {
        self.arm(&AcqConfig::default())
    }

    /// 校验并应用 `config`，Ready -> Armed
    ///
    /// 参数校验全部通过之后才开始应用。被拒绝时状态保持 Ready，之前的设置不变。
    pub fn arm(&self, config: &AcqConfig) -> Result<()> {
        let _ctrl = self.inner.ctrl.lock();
        self.inner.arm_locked(config)
    }

    /// 开始采集。在 Ready 状态下会先用当前参数 arm
    pub fn start_acq(&self) -> Result<()> {
        let _ctrl = self.inner.ctrl.lock();
        self.inner.start_locked()
    }

    /// 停止采集，总是成功，不等待驱动静止
    pub fn stop_acq(&self) {
        let _ctrl = self.inner.ctrl.lock();
        match self.inner.state.state() {
            AcqState::Running => self.inner.halt_locked("stop_acq"),
            AcqState::Armed => self.inner.disarm_locked(),
            AcqState::Ready | AcqState::Fault => {}
        }
    }

    /// Soft 不能离开 Fault，Hard 是离开 Fault 的唯一方式
    pub fn reset(&self, level: ResetLevel) -> Result<()> {
        let _ctrl = self.inner.ctrl.lock();
        self.inner.reset_locked(level)
    }

    pub fn state(&self) -> AcqState {
        self.inner.state.state()
    }

    pub fn status(&self) -> Status {
        self.inner.state.snapshot(self.inner.driver.det_status())
    }

    pub fn nb_acquired_frames(&self) -> u64 {
        self.inner.state.lock().nb_acquired_frames
    }

    /// 阻塞直到当前采集结束，返回结束后的状态
    ///
    /// 不能在观察者回调里调用：投递线程被阻塞后采集永远不会结束。
    pub fn wait_acq_end(&self) -> AcqState {
        self.inner.state.wait_while_running()
    }

    /// 导出当前配置与状态，便于调试或持久化
    #[cfg(feature = "serialize")]
    pub fn export_state(&self) -> Result<serde_json::Value> {
        use serde_json::json;

        let status = self.status();
        let buffer = &self.inner.buffer;
        let caps: Vec<_> = crate::traits::CapabilityKind::ALL
            .into_iter()
            .filter(|kind| self.inner.caps.contains(*kind))
            .collect();

        Ok(json!({
            "name": self.inner.name,
            "acq": status.acq,
            "acq_id": status.acq_id,
            "nb_acquired_frames": status.nb_acquired_frames,
            "observer_faults": status.observer_faults,
            "capabilities": caps,
            "frame_dim": buffer.frame_dim(),
            "nb_buffers": buffer.nb_buffers(),
            "ownership": buffer.ownership(),
            "exp_time": self.inner.sync.exp_time()?,
            "nb_frames": self.inner.sync.nb_frames()?,
            "last_error": status.last_error,
            "last_frame": status.last_frame,
        }))
    }
}

impl fmt::Debug for HwInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwInterface")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("caps", &self.inner.caps)
            .finish()
    }
}

/// `HwInterface` 的弱引用，供观察者回查状态
#[derive(Clone)]
pub struct WeakHwInterface {
    inner: Weak<Inner>,
}

impl WeakHwInterface {
    /// 接口已经释放时返回 `None`
    pub fn upgrade(&self) -> Option<HwInterface> {
        self.inner.upgrade().map(|inner| HwInterface { inner })
    }
}

impl fmt::Debug for WeakHwInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(hw) => f.debug_tuple("WeakHwInterface").field(&hw.name()).finish(),
            None => f.write_str("WeakHwInterface(<dropped>)"),
        }
    }
}

impl Inner {
    fn record_error(&self, err: &DetectorError) {
        self.state.lock().last_error = Some(ErrorRecord::from(err));
    }

    fn enter_fault(&self, err: &DetectorError) {
        tracing::error!(target: "areadet::hw", "{}: {}", self.name, err);
        let mut st = self.state.lock();
        st.last_error = Some(ErrorRecord::from(err));
        self.state.transition(&mut st, AcqState::Fault);
    }

    fn arm_locked(&self, config: &AcqConfig) -> Result<()> {
        let state = self.state.state();
        if state != AcqState::Ready {
            return Err(DetectorError::InvalidState { op: "arm", state });
        }

        let params = match self.resolve(config).and_then(|p| {
            self.driver.check(&p)?;
            Ok(p)
        }) {
            Ok(params) => params,
            Err(err) => {
                tracing::warn!(target: "areadet::hw", "{}: arm rejected: {}", self.name, err);
                self.record_error(&err);
                return Err(err);
            }
        };

        if let Err(err) = self.apply(config, &params) {
            match err {
                DetectorError::DeviceFault(_) => self.enter_fault(&err),
                _ => self.record_error(&err),
            }
            return Err(err);
        }

        *self.armed.lock() = Some(params);
        let mut st = self.state.lock();
        self.state.transition(&mut st, AcqState::Armed);
        Ok(())
    }

    /// 补全并校验参数，不产生任何副作用
    fn resolve(&self, config: &AcqConfig) -> Result<AcqParams> {
        let bin = match (config.bin, &self.bin) {
            (Some(bin), Some(ctrl)) => {
                ctrl.check_bin(bin)?;
                bin
            }
            (Some(bin), None) if bin.is_one() => bin,
            (Some(bin), None) => {
                return Err(DetectorError::invalid_param(
                    "bin",
                    format!("{} requested but binning is not supported", bin),
                ))
            }
            (None, Some(ctrl)) => ctrl.bin()?,
            (None, None) => Bin::ONE,
        };

        let ranges = self.sync.valid_ranges();
        let exp_time = match config.exp_time {
            Some(secs) => {
                ranges.check_exp_time(secs)?;
                secs
            }
            None => self.sync.exp_time()?,
        };
        let lat_time = match config.lat_time {
            Some(secs) => {
                ranges.check_lat_time(secs)?;
                secs
            }
            None => self.sync.lat_time()?,
        };
        let trig_mode = match config.trig_mode {
            Some(mode) if !self.sync.check_trig_mode(mode) => {
                return Err(DetectorError::invalid_param(
                    "trig_mode",
                    format!("{:?} not supported", mode),
                ))
            }
            Some(mode) => mode,
            None => self.sync.trig_mode()?,
        };
        let nb_frames = match config.nb_frames {
            Some(n) => n,
            None => self.sync.nb_frames()?,
        };

        let image_type = self.det_info.curr_image_type()?;
        let max_dim = FrameDim {
            size: self.det_info.max_image_size()?,
            pixel_type: image_type,
        } / bin;
        let frame_dim = config
            .frame_dim
            .or_else(|| self.buffer.requested_frame_dim())
            .unwrap_or(max_dim);
        frame_dim.validate()?;
        if !frame_dim.size.fits_in(&max_dim.size) {
            return Err(DetectorError::invalid_param(
                "frame_dim",
                format!("{} exceeds {} at bin {}", frame_dim, max_dim, bin),
            ));
        }
        if frame_dim.pixel_type != image_type {
            return Err(DetectorError::invalid_param(
                "frame_dim",
                format!(
                    "pixel type {} differs from detector image type {}",
                    frame_dim.pixel_type, image_type
                ),
            ));
        }

        let nb_buffers = config.nb_buffers.unwrap_or_else(|| self.buffer.nb_buffers());
        let max_buffers = self.buffer.max_nb_buffers_for(&frame_dim);
        if nb_buffers == 0 || nb_buffers > max_buffers {
            return Err(DetectorError::invalid_param(
                "nb_buffers",
                format!(
                    "{} outside [1, {}] for {}",
                    nb_buffers, max_buffers, frame_dim
                ),
            ));
        }

        Ok(AcqParams {
            frame_dim,
            nb_buffers,
            nb_frames,
            exp_time,
            lat_time,
            bin,
            trig_mode,
            ownership: self.buffer.ownership(),
        })
    }

    fn apply(&self, config: &AcqConfig, params: &AcqParams) -> Result<()> {
        if let Some(ctrl) = &self.bin {
            if ctrl.bin()? != params.bin {
                ctrl.set_bin(params.bin)?;
            }
        }
        self.sync.set_exp_time(params.exp_time)?;
        self.sync.set_lat_time(params.lat_time)?;
        self.sync.set_trig_mode(params.trig_mode)?;
        self.sync.set_nb_frames(params.nb_frames)?;
        if let Some(dim) = config.frame_dim {
            self.buffer.set_frame_dim(dim)?;
        }

        self.driver.prepare(params)?;
        self.buffer.prepare(params)?;
        tracing::info!(
            target: "areadet::hw",
            "{}: armed {} frames of {}, {} buffers, exp {}s, bin {}",
            self.name,
            params.nb_frames,
            params.frame_dim,
            params.nb_buffers,
            params.exp_time,
            params.bin
        );
        Ok(())
    }

    fn start_locked(&self) -> Result<()> {
        match self.state.state() {
            AcqState::Ready => self.arm_locked(&AcqConfig::default())?,
            AcqState::Armed => {}
            state => return Err(DetectorError::InvalidState { op: "start_acq", state }),
        }
        let params = self
            .armed
            .lock()
            .take()
            .ok_or(DetectorError::InvalidState {
                op: "start_acq",
                state: AcqState::Ready,
            })?;

        let acq_id = self.next_acq_id.fetch_add(1, Ordering::Relaxed) + 1;
        let started_at = Instant::now();
        {
            let mut st = self.state.lock();
            st.acq_id = acq_id;
            st.nb_acquired_frames = 0;
            st.observer_faults = 0;
            st.last_frame = None;
            st.started_at = Some(started_at);
            self.state.transition(&mut st, AcqState::Running);
            st.running_since = Some(SystemTime::now());
        }
        tracing::info!(target: "areadet::hw", "{}: acquisition {} started", self.name, acq_id);

        if params.nb_frames == 0 {
            self.buffer.disarm();
            let mut st = self.state.lock();
            self.state.transition(&mut st, AcqState::Ready);
            return Ok(());
        }

        let sink = self.buffer.begin_run(acq_id, &params, started_at);
        if let Err(err) = self.driver.start(sink) {
            self.buffer.end_run();
            let err = match err {
                DetectorError::DeviceFault(_) => err,
                other => DetectorError::DeviceFault(other.to_string()),
            };
            self.enter_fault(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Running -> Ready，驱动停止失败只记录
    fn halt_locked(&self, op: &str) {
        self.buffer.end_run();
        if let Err(err) = self.driver.stop() {
            tracing::warn!(target: "areadet::hw", "{}: {} failed: {}", self.name, op, err);
            self.record_error(&err);
        }
        let mut st = self.state.lock();
        tracing::info!(
            target: "areadet::hw",
            "{}: acquisition {} stopped after {} frames",
            self.name,
            st.acq_id,
            st.nb_acquired_frames
        );
        self.state.transition(&mut st, AcqState::Ready);
    }

    fn disarm_locked(&self) {
        self.armed.lock().take();
        self.buffer.disarm();
        let mut st = self.state.lock();
        self.state.transition(&mut st, AcqState::Ready);
    }

    fn reset_locked(&self, level: ResetLevel) -> Result<()> {
        let state = self.state.state();
        if state == AcqState::Fault && level == ResetLevel::Soft {
            return Err(DetectorError::DeviceFault(
                "soft reset cannot clear a fault, hard reset required".into(),
            ));
        }

        match state {
            AcqState::Running => self.halt_locked("reset"),
            AcqState::Armed => self.disarm_locked(),
            AcqState::Ready | AcqState::Fault => {}
        }

        if let Err(err) = self.driver.reset(level) {
            self.enter_fault(&err);
            return Err(err);
        }

        tracing::info!(target: "areadet::hw", "{}: {:?} reset done", self.name, level);
        let mut st = self.state.lock();
        if level == ResetLevel::Hard {
            st.last_error = None;
        }
        self.state.transition(&mut st, AcqState::Ready);
        Ok(())
    }

    /// 投递线程上的采集结束钩子
    fn on_run_end(&self, acq_id: u64, cause: StopCause) {
        let _ctrl = self.ctrl.lock();
        {
            let st = self.state.lock();
            // 控制线程已经先一步停止了这次采集
            if st.acq != AcqState::Running || st.acq_id != acq_id {
                return;
            }
        }

        self.buffer.end_run();
        let stopped = self.driver.stop();

        match cause {
            StopCause::DeviceFault(message) => {
                self.enter_fault(&DetectorError::DeviceFault(message));
            }
            cause => {
                if let Err(err) = stopped {
                    tracing::warn!(target: "areadet::hw", "{}: driver stop failed: {}", self.name, err);
                    self.record_error(&err);
                }
                let mut st = self.state.lock();
                tracing::info!(
                    target: "areadet::hw",
                    "{}: acquisition {} finished ({:?}), {} frames",
                    self.name,
                    acq_id,
                    cause,
                    st.nb_acquired_frames
                );
                self.state.transition(&mut st, AcqState::Ready);
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.state.state() == AcqState::Running {
            self.buffer.end_run();
            if let Err(err) = self.driver.stop() {
                tracing::warn!(target: "areadet::hw", "{}: stop on drop failed: {}", self.name, err);
            }
        }
    }
}

/// HwInterface 的构建器
///
/// DetInfo 和 Sync 是必需的能力，Buffer 由核心自动提供，Bin 可选。
pub struct HwInterfaceBuilder {
    name: String,
    driver: Arc<dyn AcqDriver>,
    ownership: OwnerTag,
    max_buffer_memory: usize,
    det_info: Option<Arc<dyn DetInfoCtrl>>,
    sync: Option<Arc<dyn SyncCtrl>>,
    bin: Option<Arc<dyn BinCtrl>>,
}

impl HwInterfaceBuilder {
    /// 驱动交付帧的方式，默认 MAPPED
    pub fn ownership(mut self, ownership: OwnerTag) -> Self {
        self.ownership = ownership;
        self
    }

    pub fn max_buffer_memory(mut self, bytes: usize) -> Self {
        self.max_buffer_memory = bytes;
        self
    }

    pub fn det_info(mut self, ctrl: Arc<dyn DetInfoCtrl>) -> Self {
        self.det_info = Some(ctrl);
        self
    }

    pub fn sync(mut self, ctrl: Arc<dyn SyncCtrl>) -> Self {
        self.sync = Some(ctrl);
        self
    }

    pub fn bin(mut self, ctrl: Arc<dyn BinCtrl>) -> Self {
        self.bin = Some(ctrl);
        self
    }

    pub fn build(self) -> Result<HwInterface> {
        let det_info = self
            .det_info
            .ok_or(DetectorError::Unsupported(<dyn DetInfoCtrl as Capability>::KIND))?;
        let sync = self
            .sync
            .ok_or(DetectorError::Unsupported(<dyn SyncCtrl as Capability>::KIND))?;
        let state = Arc::new(StateCell::new());
        let (name, driver, bin) = (self.name, self.driver, self.bin);
        let (ownership, max_memory) = (self.ownership, self.max_buffer_memory);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let hook = weak.clone();
            let buffer = Arc::new(BufferCtrlMgr::new(
                ownership,
                max_memory,
                state.clone(),
                Box::new(move |acq_id, cause| {
                    if let Some(inner) = hook.upgrade() {
                        inner.on_run_end(acq_id, cause);
                    }
                }),
            ));

            // 对外的能力对象在 Ready 之外拒绝写操作，状态机内部直接使用设备族对象
            let mut caps = CapabilitySet::new();
            caps.insert(CapabilityObj::DetInfo(Arc::new(GuardedDetInfo::new(
                det_info.clone(),
                state.clone(),
            ))));
            caps.insert(CapabilityObj::Buffer(buffer.clone()));
            caps.insert(CapabilityObj::Sync(Arc::new(GuardedSync::new(
                sync.clone(),
                state.clone(),
            ))));
            if let Some(bin) = &bin {
                caps.insert(CapabilityObj::Bin(Arc::new(GuardedBin::new(
                    bin.clone(),
                    state.clone(),
                ))));
            }

            Inner {
                name,
                ctrl: Mutex::new(()),
                state,
                caps,
                buffer,
                det_info,
                sync,
                bin,
                driver,
                next_acq_id: AtomicU64::new(0),
                armed: Mutex::new(None),
            }
        });

        tracing::info!(
            target: "areadet::hw",
            "{}: interface ready, capabilities {:?}",
            inner.name,
            inner.caps
        );
        Ok(HwInterface { inner })
    }
}

impl fmt::Debug for HwInterfaceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwInterfaceBuilder")
            .field("name", &self.name)
            .field("ownership", &self.ownership)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_mgr::{Delivery, FrameSink};
    use crate::callback::{frame_callback, FaultAction, ObserverFault};
    use crate::error::ErrorKind;
    use crate::geometry::Size;
    use crate::pixel_format::PixelType;
    use crate::traits::{CapabilityKind, TrigMode, ValidRanges};

    /// 测试线程扮演投递线程
    #[derive(Default)]
    struct ManualDriver {
        sink: Mutex<Option<FrameSink>>,
        reject_start: Mutex<bool>,
        resets: Mutex<Vec<ResetLevel>>,
    }

    impl ManualDriver {
        fn sink(&self) -> FrameSink {
            self.sink.lock().clone().expect("driver started")
        }

        fn push(&self) -> Delivery {
            let sink = self.sink();
            let data = vec![0u8; sink.frame_dim().mem_size()];
            sink.mapped_frame_ready(&data)
        }
    }

    impl AcqDriver for ManualDriver {
        fn prepare(&self, _params: &AcqParams) -> Result<()> {
            Ok(())
        }

        fn start(&self, sink: FrameSink) -> Result<()> {
            if *self.reject_start.lock() {
                return Err(DetectorError::DeviceFault("start rejected".into()));
            }
            *self.sink.lock() = Some(sink);
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            Ok(())
        }

        fn reset(&self, level: ResetLevel) -> Result<()> {
            self.resets.lock().push(level);
            Ok(())
        }
    }

    struct Info;

    impl DetInfoCtrl for Info {
        fn max_image_size(&self) -> Result<Size> {
            Ok(Size::new(64, 32))
        }
        fn curr_image_type(&self) -> Result<PixelType> {
            Ok(PixelType::Bpp16)
        }
        fn pixel_size(&self) -> Result<f64> {
            Ok(15.0)
        }
        fn detector_type(&self) -> Result<String> {
            Ok("Manual".into())
        }
        fn detector_model(&self) -> Result<String> {
            Ok("M-1".into())
        }
    }

    #[derive(Default)]
    struct Timing {
        exp: Mutex<f64>,
        nb_frames: Mutex<u64>,
    }

    impl SyncCtrl for Timing {
        fn set_exp_time(&self, secs: f64) -> Result<()> {
            *self.exp.lock() = secs;
            Ok(())
        }
        fn exp_time(&self) -> Result<f64> {
            Ok(*self.exp.lock())
        }
        fn set_lat_time(&self, _secs: f64) -> Result<()> {
            Ok(())
        }
        fn lat_time(&self) -> Result<f64> {
            Ok(0.0)
        }
        fn set_nb_frames(&self, nb_frames: u64) -> Result<()> {
            *self.nb_frames.lock() = nb_frames;
            Ok(())
        }
        fn nb_frames(&self) -> Result<u64> {
            Ok(*self.nb_frames.lock())
        }
        fn valid_ranges(&self) -> ValidRanges {
            ValidRanges {
                min_exp_time: 0.0,
                max_exp_time: 10.0,
                min_lat_time: 0.0,
                max_lat_time: 1.0,
            }
        }
        fn set_trig_mode(&self, _mode: TrigMode) -> Result<()> {
            Ok(())
        }
        fn trig_mode(&self) -> Result<TrigMode> {
            Ok(TrigMode::IntTrig)
        }
    }

    fn interface() -> (HwInterface, Arc<ManualDriver>) {
        let driver = Arc::new(ManualDriver::default());
        let hw = HwInterface::builder("manual", driver.clone())
            .det_info(Arc::new(Info))
            .sync(Arc::new(Timing::default()))
            .build()
            .unwrap();
        (hw, driver)
    }

    #[test]
    fn missing_mandatory_capability_is_rejected() {
        let err = HwInterface::builder("bare", Arc::new(ManualDriver::default()))
            .det_info(Arc::new(Info))
            .build()
            .unwrap_err();
        assert!(matches!(err, DetectorError::Unsupported(CapabilityKind::Sync)));
    }

    #[test]
    fn absent_capability_is_explicit() {
        let (hw, _) = interface();
        assert!(hw.capability::<dyn BinCtrl>().is_none());
        assert!(matches!(
            hw.require::<dyn BinCtrl>(),
            Err(DetectorError::Unsupported(CapabilityKind::Bin))
        ));
        assert!(hw.capability::<dyn BufferCtrl>().is_some());
        assert!(hw.capabilities().contains(Capabilities::BUFFER | Capabilities::SYNC));
    }

    #[test]
    fn run_completes_and_returns_to_ready() {
        let (hw, driver) = interface();
        hw.arm(&AcqConfig::new().nb_frames(2).nb_buffers(3)).unwrap();
        assert_eq!(hw.state(), AcqState::Armed);
        // 未指定时帧几何为全帧
        assert_eq!(
            hw.buffer().frame_dim(),
            Some(FrameDim::new(64, 32, PixelType::Bpp16))
        );

        hw.start_acq().unwrap();
        assert_eq!(hw.state(), AcqState::Running);
        assert!(hw.status().running_since.is_some());

        assert_eq!(driver.push(), Delivery::Continue);
        assert_eq!(driver.push(), Delivery::Stop);
        assert_eq!(hw.state(), AcqState::Ready);
        assert_eq!(hw.nb_acquired_frames(), 2);
        assert_eq!(hw.status().last_frame.map(|f| f.acq_frame_nb), Some(1));
    }

    #[test]
    fn rejected_parameter_leaves_everything_untouched() {
        let (hw, _) = interface();
        hw.arm(&AcqConfig::new().exp_time(0.5).nb_frames(1)).unwrap();
        hw.stop_acq();
        assert_eq!(hw.state(), AcqState::Ready);

        // exp_time 合法，但 bin 不被支持：整组参数都不生效
        let err = hw
            .arm(&AcqConfig::new().exp_time(2.0).bin(Bin::square(2)))
            .unwrap_err();
        assert!(matches!(err, DetectorError::InvalidParameter { param: "bin", .. }));
        assert_eq!(hw.state(), AcqState::Ready);
        let sync = hw.require::<dyn SyncCtrl>().unwrap();
        assert_eq!(sync.exp_time().unwrap(), 0.5);

        let err = hw
            .arm(&AcqConfig::new().frame_dim(FrameDim::new(128, 32, PixelType::Bpp16)))
            .unwrap_err();
        assert!(matches!(err, DetectorError::InvalidParameter { param: "frame_dim", .. }));
    }

    #[test]
    fn configuration_is_locked_outside_ready() {
        let (hw, _) = interface();
        hw.arm(&AcqConfig::new().nb_frames(5)).unwrap();
        let err = hw.buffer().set_nb_buffers(4).unwrap_err();
        assert!(matches!(err, DetectorError::InvalidState { state: AcqState::Armed, .. }));
        assert!(matches!(
            hw.arm(&AcqConfig::new()),
            Err(DetectorError::InvalidState { .. })
        ));
    }

    #[test]
    fn stop_discards_in_flight_frames_and_restart_renumbers() {
        let (hw, driver) = interface();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        hw.register_frame_callback(frame_callback(move |frame| {
            log.lock().push((frame.acq_id, frame.acq_frame_nb));
            Ok(true)
        }));

        hw.arm(&AcqConfig::new().nb_frames(10)).unwrap();
        hw.start_acq().unwrap();
        driver.push();
        driver.push();
        let old_sink = driver.sink();

        hw.stop_acq();
        assert_eq!(hw.state(), AcqState::Ready);
        let data = vec![0u8; old_sink.frame_dim().mem_size()];
        assert_eq!(old_sink.mapped_frame_ready(&data), Delivery::Stop);

        hw.start_acq().unwrap();
        driver.push();
        assert_eq!(*seen.lock(), vec![(1, 0), (1, 1), (2, 0)]);
        assert_eq!(hw.nb_acquired_frames(), 1);
    }

    #[test]
    fn zero_frames_completes_immediately() {
        let (hw, driver) = interface();
        hw.arm(&AcqConfig::new().nb_frames(0)).unwrap();
        hw.start_acq().unwrap();
        assert_eq!(hw.state(), AcqState::Ready);
        assert!(driver.sink.lock().is_none());
    }

    #[test]
    fn observer_stop_request_ends_run() {
        let (hw, driver) = interface();
        hw.register_frame_callback(frame_callback(|frame| Ok(frame.acq_frame_nb < 1)));
        hw.arm(&AcqConfig::new().nb_frames(100)).unwrap();
        hw.start_acq().unwrap();

        assert_eq!(driver.push(), Delivery::Continue);
        assert_eq!(driver.push(), Delivery::Stop);
        assert_eq!(hw.state(), AcqState::Ready);
        assert_eq!(hw.nb_acquired_frames(), 2);
    }

    #[test]
    fn observer_faults_are_counted_not_propagated() {
        let (hw, driver) = interface();
        hw.register_frame_callback(frame_callback(|_| Err("cannot save".into())));
        hw.arm(&AcqConfig::new().nb_frames(3)).unwrap();
        hw.start_acq().unwrap();
        for _ in 0..3 {
            driver.push();
        }

        let status = hw.status();
        assert_eq!(status.acq, AcqState::Ready);
        assert_eq!(status.observer_faults, 3);
        assert_eq!(
            status.last_error.map(|e| e.kind),
            Some(ErrorKind::ObserverFault)
        );
    }

    #[test]
    fn fault_handler_stop_ends_run() {
        let (hw, driver) = interface();
        hw.register_frame_callback(frame_callback(|_| panic!("observer bug")));
        hw.set_fault_handler(Some(Arc::new(|_: &ObserverFault| FaultAction::Stop)));
        hw.arm(&AcqConfig::new().nb_frames(10)).unwrap();
        hw.start_acq().unwrap();

        assert_eq!(driver.push(), Delivery::Stop);
        assert_eq!(hw.state(), AcqState::Ready);
    }

    #[test]
    fn rejected_start_faults_until_hard_reset() {
        let (hw, driver) = interface();
        *driver.reject_start.lock() = true;
        hw.arm(&AcqConfig::new().nb_frames(1)).unwrap();
        assert!(matches!(hw.start_acq(), Err(DetectorError::DeviceFault(_))));
        assert_eq!(hw.state(), AcqState::Fault);
        assert!(matches!(
            hw.start_acq(),
            Err(DetectorError::InvalidState { state: AcqState::Fault, .. })
        ));

        assert!(matches!(
            hw.reset(ResetLevel::Soft),
            Err(DetectorError::DeviceFault(_))
        ));
        assert_eq!(hw.state(), AcqState::Fault);
        assert!(hw.status().last_error.is_some());

        hw.reset(ResetLevel::Hard).unwrap();
        assert_eq!(hw.state(), AcqState::Ready);
        assert!(hw.status().last_error.is_none());
        assert_eq!(*driver.resets.lock(), vec![ResetLevel::Hard]);
    }

    #[test]
    fn device_fault_during_delivery_enters_fault() {
        let (hw, driver) = interface();
        hw.arm(&AcqConfig::new().nb_frames(10)).unwrap();
        hw.start_acq().unwrap();
        driver.push();
        driver.sink().device_fault("link lost");

        let status = hw.status();
        assert_eq!(status.acq, AcqState::Fault);
        assert_eq!(status.last_error.map(|e| e.kind), Some(ErrorKind::DeviceFault));
        // 最后一帧的信息保留下来
        assert_eq!(status.last_frame.map(|f| f.acq_frame_nb), Some(0));
    }

    #[test]
    fn soft_reset_stops_running_acquisition() {
        let (hw, driver) = interface();
        hw.arm(&AcqConfig::new().nb_frames(10)).unwrap();
        hw.start_acq().unwrap();
        hw.reset(ResetLevel::Soft).unwrap();
        assert_eq!(hw.state(), AcqState::Ready);
        assert_eq!(driver.push(), Delivery::Stop);
    }

    #[test]
    fn observer_may_query_status_during_delivery() {
        let (hw, driver) = interface();
        let weak = hw.downgrade();
        let states = Arc::new(Mutex::new(Vec::new()));
        let log = states.clone();
        hw.register_frame_callback(frame_callback(move |_| {
            if let Some(hw) = weak.upgrade() {
                log.lock().push(hw.status().acq);
            }
            Ok(true)
        }));
        hw.arm(&AcqConfig::new().nb_frames(1)).unwrap();
        hw.start_acq().unwrap();
        driver.push();
        assert_eq!(*states.lock(), vec![AcqState::Running]);
    }

    #[test]
    fn weak_observer_handle_does_not_keep_interface_alive() {
        let (hw, driver) = interface();
        let weak = hw.downgrade();
        hw.register_frame_callback(frame_callback({
            let weak = weak.clone();
            move |_| Ok(weak.upgrade().is_some())
        }));
        hw.arm(&AcqConfig::new().nb_frames(2)).unwrap();
        hw.start_acq().unwrap();
        driver.push();
        assert_eq!(hw.nb_acquired_frames(), 1);

        drop(hw);
        assert!(weak.upgrade().is_none());
        // 接口释放后驱动不再有活动的采集
        assert!(!driver.sink().is_active());
    }

    #[cfg(feature = "serialize")]
    #[test]
    fn export_state_reports_configuration() {
        let (hw, _) = interface();
        hw.arm(&AcqConfig::new().nb_frames(4).nb_buffers(2)).unwrap();
        let state = hw.export_state().unwrap();
        assert_eq!(state["acq"], "Armed");
        assert_eq!(state["nb_buffers"], 2);
        assert_eq!(state["ownership"], "Mapped");
        assert_eq!(state["capabilities"].as_array().map(|a| a.len()), Some(3));
    }
}
