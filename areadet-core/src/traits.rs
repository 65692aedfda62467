use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::buffer::OwnerTag;
use crate::buffer_mgr::FrameSink;
use crate::callback::{CallbackId, FrameCallback};
use crate::error::{DetectorError, Result};
use crate::geometry::{Bin, FrameDim, Size};
use crate::pixel_format::PixelType;
use crate::status::DetStatus;

// --- 能力种类 (封闭集合) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum CapabilityKind {
    DetInfo,
    Buffer,
    Sync,
    Bin,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 4] = [Self::DetInfo, Self::Buffer, Self::Sync, Self::Bin];

    pub const fn flag(&self) -> Capabilities {
        match self {
            Self::DetInfo => Capabilities::DET_INFO,
            Self::Buffer => Capabilities::BUFFER,
            Self::Sync => Capabilities::SYNC,
            Self::Bin => Capabilities::BIN,
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

bitflags! {
    /// 设备支持的能力集合
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        const DET_INFO = 1 << 0;
        const BUFFER   = 1 << 1;
        const SYNC     = 1 << 2;
        const BIN      = 1 << 3;
    }
}

// --- 同步参数 ---

/// 触发模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum TrigMode {
    /// 内部触发，start 之后按曝光+延迟时间连续出帧
    #[default]
    IntTrig,
    /// 一个外部脉冲触发整个序列
    ExtTrigSingle,
    /// 每个外部脉冲触发一帧
    ExtTrigMult,
    /// 外部门控信号决定曝光
    ExtGate,
}

/// 曝光/延迟时间的硬件允许范围 (秒)
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ValidRanges {
    pub min_exp_time: f64,
    pub max_exp_time: f64,
    pub min_lat_time: f64,
    pub max_lat_time: f64,
}

impl ValidRanges {
    pub fn check_exp_time(&self, secs: f64) -> Result<()> {
        if !(self.min_exp_time..=self.max_exp_time).contains(&secs) {
            return Err(DetectorError::invalid_param(
                "exp_time",
                format!(
                    "{}s outside [{}, {}]",
                    secs, self.min_exp_time, self.max_exp_time
                ),
            ));
        }
        Ok(())
    }

    pub fn check_lat_time(&self, secs: f64) -> Result<()> {
        if !(self.min_lat_time..=self.max_lat_time).contains(&secs) {
            return Err(DetectorError::invalid_param(
                "lat_time",
                format!(
                    "{}s outside [{}, {}]",
                    secs, self.min_lat_time, self.max_lat_time
                ),
            ));
        }
        Ok(())
    }
}

// --- 能力 Trait (每个设备族各自实现) ---

/// 探测器基本信息
pub trait DetInfoCtrl: Send + Sync {
    fn max_image_size(&self) -> Result<Size>;
    fn curr_image_type(&self) -> Result<PixelType>;

    fn set_curr_image_type(&self, pixel_type: PixelType) -> Result<()> {
        if pixel_type == self.curr_image_type()? {
            return Ok(());
        }
        Err(DetectorError::invalid_param(
            "image_type",
            format!("{} not supported by this detector", pixel_type),
        ))
    }

    fn def_image_type(&self) -> Result<PixelType> {
        self.curr_image_type()
    }

    /// 像素尺寸 (微米)
    fn pixel_size(&self) -> Result<f64>;
    fn detector_type(&self) -> Result<String>;
    fn detector_model(&self) -> Result<String>;
}

/// 帧缓冲区控制 (核心实现见 `BufferCtrlMgr`)
pub trait BufferCtrl: Send + Sync {
    /// 仅在 Ready 状态下允许
    fn set_frame_dim(&self, dim: FrameDim) -> Result<()>;
    fn frame_dim(&self) -> Option<FrameDim>;

    /// 仅在 Ready 状态下允许
    fn set_nb_buffers(&self, nb_buffers: usize) -> Result<()>;
    fn nb_buffers(&self) -> usize;

    /// 在内存预算内按当前帧几何最多能分配的缓冲区数
    fn max_nb_buffers(&self) -> Result<usize>;

    fn ownership(&self) -> OwnerTag;

    fn register_frame_callback(&self, cb: Arc<dyn FrameCallback>) -> CallbackId;
    fn unregister_frame_callback(&self, id: CallbackId) -> Result<()>;
}

/// 曝光/帧数/触发控制
pub trait SyncCtrl: Send + Sync {
    fn set_exp_time(&self, secs: f64) -> Result<()>;
    fn exp_time(&self) -> Result<f64>;

    fn set_lat_time(&self, secs: f64) -> Result<()>;
    fn lat_time(&self) -> Result<f64>;

    /// 本次采集的帧数，0 表示 start 之后立即结束
    fn set_nb_frames(&self, nb_frames: u64) -> Result<()>;
    fn nb_frames(&self) -> Result<u64>;

    fn valid_ranges(&self) -> ValidRanges;

    fn check_trig_mode(&self, mode: TrigMode) -> bool {
        mode == TrigMode::IntTrig
    }
    fn set_trig_mode(&self, mode: TrigMode) -> Result<()>;
    fn trig_mode(&self) -> Result<TrigMode>;
}

/// 硬件 Binning
pub trait BinCtrl: Send + Sync {
    /// 不支持的因子返回 InvalidParameter，当前 Binning 保持不变
    fn set_bin(&self, bin: Bin) -> Result<()>;
    fn bin(&self) -> Result<Bin>;
    fn check_bin(&self, bin: Bin) -> Result<()>;
}

// --- 类型化查询 ---

/// 把能力 Trait 对象映射回它在集合中的标签
///
/// 用法：`hw.capability::<dyn BinCtrl>()`
pub trait Capability: Send + Sync + 'static {
    const KIND: CapabilityKind;

    fn select(set: &CapabilitySet) -> Option<Arc<Self>>;
}

/// 能力对象 (标签 + 实例)
#[derive(Clone)]
pub enum CapabilityObj {
    DetInfo(Arc<dyn DetInfoCtrl>),
    Buffer(Arc<dyn BufferCtrl>),
    Sync(Arc<dyn SyncCtrl>),
    Bin(Arc<dyn BinCtrl>),
}

impl CapabilityObj {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::DetInfo(_) => CapabilityKind::DetInfo,
            Self::Buffer(_) => CapabilityKind::Buffer,
            Self::Sync(_) => CapabilityKind::Sync,
            Self::Bin(_) => CapabilityKind::Bin,
        }
    }
}

impl fmt::Debug for CapabilityObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilityObj({})", self.kind())
    }
}

/// 能力标签 -> 可选实例
#[derive(Clone, Default)]
pub struct CapabilitySet {
    objs: BTreeMap<CapabilityKind, CapabilityObj>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同一标签重复插入时后者覆盖前者
    pub fn insert(&mut self, obj: CapabilityObj) {
        self.objs.insert(obj.kind(), obj);
    }

    pub fn get<C: Capability + ?Sized>(&self) -> Option<Arc<C>> {
        C::select(self)
    }

    pub fn contains(&self, kind: CapabilityKind) -> bool {
        self.objs.contains_key(&kind)
    }

    pub fn supported(&self) -> Capabilities {
        self.objs
            .keys()
            .fold(Capabilities::empty(), |acc, kind| acc | kind.flag())
    }

    fn entry(&self, kind: CapabilityKind) -> Option<&CapabilityObj> {
        self.objs.get(&kind)
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.objs.keys()).finish()
    }
}

impl Capability for dyn DetInfoCtrl {
    const KIND: CapabilityKind = CapabilityKind::DetInfo;

    fn select(set: &CapabilitySet) -> Option<Arc<Self>> {
        match set.entry(Self::KIND)? {
            CapabilityObj::DetInfo(obj) => Some(obj.clone()),
            _ => None,
        }
    }
}

impl Capability for dyn BufferCtrl {
    const KIND: CapabilityKind = CapabilityKind::Buffer;

    fn select(set: &CapabilitySet) -> Option<Arc<Self>> {
        match set.entry(Self::KIND)? {
            CapabilityObj::Buffer(obj) => Some(obj.clone()),
            _ => None,
        }
    }
}

impl Capability for dyn SyncCtrl {
    const KIND: CapabilityKind = CapabilityKind::Sync;

    fn select(set: &CapabilitySet) -> Option<Arc<Self>> {
        match set.entry(Self::KIND)? {
            CapabilityObj::Sync(obj) => Some(obj.clone()),
            _ => None,
        }
    }
}

impl Capability for dyn BinCtrl {
    const KIND: CapabilityKind = CapabilityKind::Bin;

    fn select(set: &CapabilitySet) -> Option<Arc<Self>> {
        match set.entry(Self::KIND)? {
            CapabilityObj::Bin(obj) => Some(obj.clone()),
            _ => None,
        }
    }
}

// --- 驱动适配层 (厂商相关，核心之外实现) ---

/// 复位级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ResetLevel {
    /// 停止采集、清空状态，不能清除 Fault
    Soft,
    /// 重新初始化硬件，唯一能离开 Fault 的方式
    Hard,
}

/// 锁定后的完整采集参数 (Ready -> Armed 时生成)
#[derive(Debug, Clone, PartialEq)]
pub struct AcqParams {
    pub frame_dim: FrameDim,
    pub nb_buffers: usize,
    pub nb_frames: u64,
    pub exp_time: f64,
    pub lat_time: f64,
    pub bin: Bin,
    pub trig_mode: TrigMode,
    pub ownership: OwnerTag,
}

/// 设备族的采集驱动
///
/// 所有方法都在控制线程上、持有接口控制锁时调用，
/// 因此不能等待帧投递线程 (投递线程在采集结束时也需要这把锁)，
/// 也不能在 `start` 内部同步投递帧。
pub trait AcqDriver: Send + Sync {
    /// 在应用任何参数之前做的设备相关校验，失败时不产生副作用
    fn check(&self, _params: &AcqParams) -> Result<()> {
        Ok(())
    }

    /// 应用并锁定采集参数，分配 DMA/映射内存
    fn prepare(&self, params: &AcqParams) -> Result<()>;

    /// 启动采集。驱动通过 `sink` 把完成的帧送入通知协议
    fn start(&self, sink: FrameSink) -> Result<()>;

    /// 请求停止，立即返回，不等待硬件静止
    fn stop(&self) -> Result<()>;

    fn reset(&self, level: ResetLevel) -> Result<()>;

    fn det_status(&self) -> DetStatus {
        DetStatus::IDLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedBin(Bin);

    impl BinCtrl for FixedBin {
        fn set_bin(&self, bin: Bin) -> Result<()> {
            self.check_bin(bin)
        }

        fn bin(&self) -> Result<Bin> {
            Ok(self.0)
        }

        fn check_bin(&self, bin: Bin) -> Result<()> {
            if bin == self.0 {
                Ok(())
            } else {
                Err(DetectorError::invalid_param("bin", "fixed"))
            }
        }
    }

    #[test]
    fn typed_lookup_returns_explicit_absence() {
        let mut set = CapabilitySet::new();
        assert!(set.get::<dyn BinCtrl>().is_none());
        assert!(set.get::<dyn SyncCtrl>().is_none());

        set.insert(CapabilityObj::Bin(Arc::new(FixedBin(Bin::square(2)))));
        let bin = set.get::<dyn BinCtrl>().expect("bin registered");
        assert_eq!(bin.bin().unwrap(), Bin::square(2));
        assert!(set.get::<dyn DetInfoCtrl>().is_none());
        assert_eq!(set.supported(), Capabilities::BIN);
        assert_eq!(<dyn BinCtrl as Capability>::KIND, CapabilityKind::Bin);
    }

    #[test]
    fn valid_ranges_reject_out_of_range_exposure() {
        let ranges = ValidRanges {
            min_exp_time: 1e-6,
            max_exp_time: 10.0,
            min_lat_time: 0.0,
            max_lat_time: 1.0,
        };
        assert!(ranges.check_exp_time(0.5).is_ok());
        assert!(ranges.check_exp_time(20.0).is_err());
        assert!(ranges.check_lat_time(-1.0).is_err());
    }
}
