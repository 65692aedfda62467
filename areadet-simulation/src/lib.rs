#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod acq;
pub mod config;
pub mod controls;
pub mod device;

use std::sync::Arc;

use areadet_core::device::DeviceHandle;
use areadet_core::error::Result;
use areadet_core::interface::HwInterface;

pub use acq::{FaultInjection, SimAcq};
pub use config::SimConfig;
pub use controls::{SimBin, SimDetInfo, SimSync};
pub use device::{list_devices, SimDevice};

/// 打开的模拟探测器：设备句柄 + 控制接口 + 故障注入入口
#[derive(Debug)]
pub struct SimCamera {
    hw: HwInterface,
    device: Arc<DeviceHandle<SimDevice>>,
    acq: Arc<SimAcq>,
}

impl SimCamera {
    pub fn hw(&self) -> &HwInterface {
        &self.hw
    }

    pub fn device(&self) -> &Arc<DeviceHandle<SimDevice>> {
        &self.device
    }

    /// 为下一次采集安排一次故障
    pub fn inject(&self, faults: FaultInjection) {
        self.acq.inject(faults);
    }

    pub fn into_hw(self) -> HwInterface {
        self.hw
    }
}

/// 打开 `sim:0` .. `sim:3` 中的一块模拟板卡
pub fn open(id: &str, config: SimConfig) -> Result<SimCamera> {
    let ownership = config.ownership;
    let device = Arc::new(device::open_device(id, config)?);
    let acq = Arc::new(SimAcq::new(device.clone()));

    let hw = HwInterface::builder(device.id(), acq.clone())
        .ownership(ownership)
        .det_info(Arc::new(SimDetInfo::new(device.clone())))
        .sync(Arc::new(SimSync::new(device.clone())))
        .bin(Arc::new(SimBin::new(device.clone())))
        .build()?;

    tracing::info!(
        target: "areadet::sim",
        "Simulated detector {} opened ({})",
        device.id(),
        ownership
    );
    Ok(SimCamera { hw, device, acq })
}
