use crate::geometry::{Bin, FrameDim};
use crate::traits::TrigMode;

/// 一次采集的参数请求
///
/// 未设置的字段沿用设备当前值 (帧几何默认为 全帧 / Binning)。
/// 所有字段在 arm 时一次性校验，任何一项被拒绝都不会应用其它项。
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(
    feature = "serialize",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct AcqConfig {
    pub nb_buffers: Option<usize>,
    pub frame_dim: Option<FrameDim>,
    pub nb_frames: Option<u64>,
    /// 曝光时间 (秒)
    pub exp_time: Option<f64>,
    /// 帧间延迟 (秒)
    pub lat_time: Option<f64>,
    pub bin: Option<Bin>,
    pub trig_mode: Option<TrigMode>,
}

impl AcqConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nb_buffers(mut self, n: usize) -> Self {
        self.nb_buffers = Some(n);
        self
    }

    pub fn frame_dim(mut self, dim: FrameDim) -> Self {
        self.frame_dim = Some(dim);
        self
    }

    pub fn nb_frames(mut self, n: u64) -> Self {
        self.nb_frames = Some(n);
        self
    }

    pub fn exp_time(mut self, secs: f64) -> Self {
        self.exp_time = Some(secs);
        self
    }

    pub fn lat_time(mut self, secs: f64) -> Self {
        self.lat_time = Some(secs);
        self
    }

    pub fn bin(mut self, bin: Bin) -> Self {
        self.bin = Some(bin);
        self
    }

    pub fn trig_mode(mut self, mode: TrigMode) -> Self {
        self.trig_mode = Some(mode);
        self
    }
}

#[cfg(all(test, feature = "serialize"))]
mod tests {
    use super::*;
    use crate::pixel_format::PixelType;

    #[test]
    fn partial_json_keeps_unset_fields_empty() -> anyhow::Result<()> {
        let cfg: AcqConfig = serde_json::from_str(r#"{"nb_frames": 3, "exp_time": 0.1}"#)?;
        assert_eq!(cfg, AcqConfig::new().nb_frames(3).exp_time(0.1));
        assert!(cfg.bin.is_none());

        let back: AcqConfig = serde_json::from_value(serde_json::to_value(&cfg)?)?;
        assert_eq!(back, cfg);
        Ok(())
    }

    #[test]
    fn builder_chains() {
        let cfg = AcqConfig::new()
            .nb_buffers(10)
            .frame_dim(FrameDim::new(1024, 1024, PixelType::Bpp16))
            .bin(Bin::square(2))
            .trig_mode(TrigMode::ExtTrigMult);
        assert_eq!(cfg.nb_buffers, Some(10));
        assert_eq!(cfg.bin, Some(Bin::square(2)));
        assert!(cfg.nb_frames.is_none());
    }
}
