use areadet_core::buffer::OwnerTag;
use areadet_core::geometry::{Bin, Size};
use areadet_core::pixel_format::PixelType;
use areadet_core::traits::{TrigMode, ValidRanges};

/// 模拟探测器的静态特性
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialize",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct SimConfig {
    pub model: String,
    pub max_size: Size,
    /// 可选的像素类型，第一个是默认值
    pub image_types: Vec<PixelType>,
    /// 像素尺寸 (微米)
    pub pixel_size: f64,
    /// 每个方向上允许的 Binning 因子
    pub bins: Vec<u32>,
    pub trig_modes: Vec<TrigMode>,
    pub ranges: ValidRanges,
    /// 帧交付方式：MAPPED 模拟 DMA 区域，OWNED 使用引用计数缓冲池
    pub ownership: OwnerTag,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            model: "SIM-2K".to_string(),
            max_size: Size::new(2048, 2048),
            image_types: vec![PixelType::Bpp16, PixelType::Bpp32],
            pixel_size: 14.0,
            bins: vec![1, 2, 4, 8],
            trig_modes: vec![TrigMode::IntTrig, TrigMode::ExtTrigMult],
            ranges: ValidRanges {
                min_exp_time: 1e-6,
                max_exp_time: 3600.0,
                min_lat_time: 0.0,
                max_lat_time: 10.0,
            },
            ownership: OwnerTag::Mapped,
        }
    }
}

impl SimConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn max_size(mut self, width: u32, height: u32) -> Self {
        self.max_size = Size::new(width, height);
        self
    }

    pub fn image_types(mut self, types: Vec<PixelType>) -> Self {
        self.image_types = types;
        self
    }

    pub fn bins(mut self, bins: Vec<u32>) -> Self {
        self.bins = bins;
        self
    }

    pub fn ownership(mut self, ownership: OwnerTag) -> Self {
        self.ownership = ownership;
        self
    }

    pub fn ranges(mut self, ranges: ValidRanges) -> Self {
        self.ranges = ranges;
        self
    }

    pub fn supports_bin(&self, bin: Bin) -> bool {
        self.bins.contains(&bin.x) && self.bins.contains(&bin.y)
    }

    pub fn default_image_type(&self) -> PixelType {
        self.image_types.first().copied().unwrap_or(PixelType::Bpp16)
    }
}
