use areadet_core::device::{DeviceHandle, DeviceInfo, RawDevice};
use areadet_core::error::Result;
use areadet_core::geometry::Bin;
use areadet_core::pixel_format::PixelType;
use areadet_core::traits::TrigMode;

use crate::config::SimConfig;

/// 模拟设备族名
pub const FAMILY: &str = "Simulation";

/// 可用的模拟板卡数量 (sim:0 .. sim:3)
pub const NB_BOARDS: u32 = 4;

/// 设备寄存器，只能在采集锁内读写
#[derive(Debug, Clone, PartialEq)]
pub struct Registers {
    pub exp_time: f64,
    pub lat_time: f64,
    pub nb_frames: u64,
    pub trig_mode: TrigMode,
    pub bin: Bin,
    pub image_type: PixelType,
}

impl Registers {
    fn power_on(config: &SimConfig) -> Self {
        Self {
            exp_time: 0.01,
            lat_time: 0.0,
            nb_frames: 1,
            trig_mode: TrigMode::IntTrig,
            bin: Bin::ONE,
            image_type: config.default_image_type(),
        }
    }
}

/// 一块模拟板卡
#[derive(Debug)]
pub struct SimDevice {
    board: u32,
    pub(crate) config: SimConfig,
    pub(crate) regs: Registers,
}

impl SimDevice {
    pub fn board(&self) -> u32 {
        self.board
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    /// 硬复位：寄存器回到上电值
    pub(crate) fn power_cycle(&mut self) {
        self.regs = Registers::power_on(&self.config);
    }
}

impl RawDevice for SimDevice {
    fn info(&self) -> DeviceInfo {
        device_info(self.board, &self.config.model)
    }

    fn close(&mut self) {
        tracing::debug!(target: "areadet::sim", "sim:{} released", self.board);
    }
}

fn device_info(board: u32, model: &str) -> DeviceInfo {
    DeviceInfo {
        id: format!("sim:{}", board),
        model: model.to_string(),
        family: FAMILY.to_string(),
        board,
    }
}

/// 枚举可用的模拟设备
pub fn list_devices(config: &SimConfig) -> Vec<DeviceInfo> {
    (0..NB_BOARDS)
        .map(|board| device_info(board, &config.model))
        .collect()
}

fn parse_id(id: &str) -> Option<u32> {
    let board = id.strip_prefix("sim:")?.parse::<u32>().ok()?;
    (board < NB_BOARDS).then_some(board)
}

/// 打开一块模拟板卡，未知 ID 返回 DeviceNotFound
pub fn open_device(id: &str, config: SimConfig) -> Result<DeviceHandle<SimDevice>> {
    DeviceHandle::open(id, |id| {
        let board = parse_id(id)?;
        Some(SimDevice {
            board,
            regs: Registers::power_on(&config),
            config,
        })
    })
}
