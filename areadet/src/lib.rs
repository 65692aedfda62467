//! 面阵探测器采集控制
//!
//! 在 `areadet-core` 的能力接口之上提供设备族选择、任务池运行时、
//! 保存观察者和一次性采集辅助工具。

pub mod acquisition;
pub mod backend;
pub mod runtime;
pub mod saving;

pub use acquisition::{AcqReport, Acquisition};
pub use backend::{list_devices, open_detector, BackendType};
pub use runtime::Runtime;
pub use saving::{FrameConsumer, SavedFrame, SavingObserver, SavingStats};

pub use areadet_core as core;
#[cfg(feature = "simulation")]
pub use areadet_simulation as simulation;

/// 预置模块，用户可以通过 `use areadet::prelude::*;` 导入常用项
pub mod prelude {
    pub use areadet_core::prelude::*;

    pub use crate::acquisition::{AcqReport, Acquisition};
    pub use crate::backend::{list_devices, open_detector};
    pub use crate::runtime::Runtime;
    pub use crate::saving::{FrameConsumer, SavedFrame, SavingObserver};
}
