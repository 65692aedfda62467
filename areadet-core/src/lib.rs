// 开启一些 Clippy 检查，保证代码质量
#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

// 模块定义
pub mod buffer;
pub mod buffer_mgr;
pub mod builder;
pub mod callback;
pub mod device;
pub mod error;
pub mod frame;
pub mod geometry;
mod guarded;
pub mod interface;
pub mod pixel_format;
pub mod status;
pub mod task_pool;
pub mod traits;

// 方便用户使用的 Prelude
pub mod prelude {
    pub use crate::buffer::{FrameBuffer, OwnedBuffer, OwnerTag};
    pub use crate::buffer_mgr::{BufferCtrlMgr, Delivery, FrameSink};
    pub use crate::builder::AcqConfig;
    pub use crate::callback::{
        frame_callback, CallbackId, FaultAction, FaultHandler, FrameCallback, ObserverFault,
        StopCause,
    };
    pub use crate::device::{AcqLock, DeviceHandle, DeviceInfo, RawDevice};
    pub use crate::error::{BoxError, DetectorError, ErrorKind, Result};
    pub use crate::frame::{FrameInfo, FrameSummary};
    pub use crate::geometry::{Bin, FrameDim, Size};
    pub use crate::interface::{HwInterface, HwInterfaceBuilder, WeakHwInterface};
    pub use crate::pixel_format::PixelType;
    pub use crate::status::{AcqState, DetStatus, Status};
    pub use crate::task_pool::{TaskPool, TaskPoolConfig, TaskPoolHandle};
    pub use crate::traits::{
        AcqDriver, AcqParams, BinCtrl, BufferCtrl, CapabilityKind, DetInfoCtrl, ResetLevel,
        SyncCtrl, TrigMode, ValidRanges,
    };
}

// 重新导出依赖中的关键类型，避免用户版本冲突
pub use bytemuck;

// 版本与构建信息常量
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
