use std::sync::Arc;

use areadet_core::device::DeviceHandle;
use areadet_core::error::{DetectorError, Result};
use areadet_core::geometry::{Bin, Size};
use areadet_core::pixel_format::PixelType;
use areadet_core::traits::{BinCtrl, DetInfoCtrl, SyncCtrl, TrigMode, ValidRanges};

use crate::config::SimConfig;
use crate::device::{SimDevice, FAMILY};

// 三个能力对象共享同一个设备句柄，每条命令都在采集锁内完成

// --- 1. 探测器信息 (DetInfo) ---
#[derive(Debug)]
pub struct SimDetInfo {
    dev: Arc<DeviceHandle<SimDevice>>,
}

impl SimDetInfo {
    pub fn new(dev: Arc<DeviceHandle<SimDevice>>) -> Self {
        Self { dev }
    }
}

impl DetInfoCtrl for SimDetInfo {
    fn max_image_size(&self) -> Result<Size> {
        Ok(self.dev.acq_lock()?.config.max_size)
    }

    fn curr_image_type(&self) -> Result<PixelType> {
        Ok(self.dev.acq_lock()?.regs.image_type)
    }

    fn set_curr_image_type(&self, pixel_type: PixelType) -> Result<()> {
        let mut dev = self.dev.acq_lock()?;
        if !dev.config.image_types.contains(&pixel_type) {
            return Err(DetectorError::invalid_param(
                "image_type",
                format!("{} not in {:?}", pixel_type, dev.config.image_types),
            ));
        }
        dev.regs.image_type = pixel_type;
        Ok(())
    }

    fn def_image_type(&self) -> Result<PixelType> {
        Ok(self.dev.acq_lock()?.config.default_image_type())
    }

    fn pixel_size(&self) -> Result<f64> {
        Ok(self.dev.acq_lock()?.config.pixel_size)
    }

    fn detector_type(&self) -> Result<String> {
        Ok(FAMILY.to_string())
    }

    fn detector_model(&self) -> Result<String> {
        Ok(self.dev.acq_lock()?.config.model.clone())
    }
}

// --- 2. 同步控制 (Sync) ---
#[derive(Debug)]
pub struct SimSync {
    dev: Arc<DeviceHandle<SimDevice>>,
}

impl SimSync {
    pub fn new(dev: Arc<DeviceHandle<SimDevice>>) -> Self {
        Self { dev }
    }
}

impl SyncCtrl for SimSync {
    fn set_exp_time(&self, secs: f64) -> Result<()> {
        let mut dev = self.dev.acq_lock()?;
        dev.config.ranges.check_exp_time(secs)?;
        dev.regs.exp_time = secs;
        Ok(())
    }

    fn exp_time(&self) -> Result<f64> {
        Ok(self.dev.acq_lock()?.regs.exp_time)
    }

    fn set_lat_time(&self, secs: f64) -> Result<()> {
        let mut dev = self.dev.acq_lock()?;
        dev.config.ranges.check_lat_time(secs)?;
        dev.regs.lat_time = secs;
        Ok(())
    }

    fn lat_time(&self) -> Result<f64> {
        Ok(self.dev.acq_lock()?.regs.lat_time)
    }

    fn set_nb_frames(&self, nb_frames: u64) -> Result<()> {
        self.dev.acq_lock()?.regs.nb_frames = nb_frames;
        Ok(())
    }

    fn nb_frames(&self) -> Result<u64> {
        Ok(self.dev.acq_lock()?.regs.nb_frames)
    }

    fn valid_ranges(&self) -> ValidRanges {
        match self.dev.acq_lock() {
            Ok(dev) => dev.config.ranges,
            // 设备已关闭：返回空区间，任何曝光设置都会被拒绝
            Err(_) => ValidRanges {
                min_exp_time: 0.0,
                max_exp_time: 0.0,
                min_lat_time: 0.0,
                max_lat_time: 0.0,
            },
        }
    }

    fn check_trig_mode(&self, mode: TrigMode) -> bool {
        self.dev
            .acq_lock()
            .map(|dev| dev.config.trig_modes.contains(&mode))
            .unwrap_or(false)
    }

    fn set_trig_mode(&self, mode: TrigMode) -> Result<()> {
        let mut dev = self.dev.acq_lock()?;
        if !dev.config.trig_modes.contains(&mode) {
            return Err(DetectorError::invalid_param(
                "trig_mode",
                format!("{:?} not supported", mode),
            ));
        }
        dev.regs.trig_mode = mode;
        Ok(())
    }

    fn trig_mode(&self) -> Result<TrigMode> {
        Ok(self.dev.acq_lock()?.regs.trig_mode)
    }
}

// --- 3. Binning ---
#[derive(Debug)]
pub struct SimBin {
    dev: Arc<DeviceHandle<SimDevice>>,
}

impl SimBin {
    pub fn new(dev: Arc<DeviceHandle<SimDevice>>) -> Self {
        Self { dev }
    }
}

impl BinCtrl for SimBin {
    fn set_bin(&self, bin: Bin) -> Result<()> {
        let mut dev = self.dev.acq_lock()?;
        check(&dev.config, bin)?;
        dev.regs.bin = bin;
        tracing::debug!(target: "areadet::sim", "bin set to {}", bin);
        Ok(())
    }

    fn bin(&self) -> Result<Bin> {
        Ok(self.dev.acq_lock()?.regs.bin)
    }

    fn check_bin(&self, bin: Bin) -> Result<()> {
        check(&self.dev.acq_lock()?.config, bin)
    }
}

fn check(config: &SimConfig, bin: Bin) -> Result<()> {
    if config.supports_bin(bin) {
        return Ok(());
    }
    Err(DetectorError::invalid_param(
        "bin",
        format!("{} not in {:?}", bin, config.bins),
    ))
}
