use thiserror::Error;

use crate::status::AcqState;
use crate::traits::CapabilityKind;

#[derive(Error, Debug)]
pub enum DetectorError {
    /// 配置值被拒绝，之前的设置保持不变
    #[error("Invalid parameter `{param}`: {reason}")]
    InvalidParameter { param: &'static str, reason: String },

    /// 当前生命周期状态不允许该操作
    #[error("Operation `{op}` not permitted in state {state}")]
    InvalidState { op: &'static str, state: AcqState },

    /// 硬件/驱动报告的错误，会把接口切换到 Fault 状态
    #[error("Device fault: {0}")]
    DeviceFault(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// 观察者在通知期间出错 (只记录，不传播到驱动线程)
    #[error("Observer fault: {0}")]
    ObserverFault(String),

    #[error("Capability not supported by this detector: {0}")]
    Unsupported(CapabilityKind),

    /// 任务池已关闭，不再接受新任务
    #[error("Task pool is shut down")]
    PoolShutdown,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 错误类别，可复制，保存在 Status 中
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    InvalidParameter,
    InvalidState,
    DeviceFault,
    DeviceNotFound,
    ObserverFault,
    Unsupported,
    PoolShutdown,
    Io,
}

impl DetectorError {
    pub fn invalid_param(param: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            param,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::DeviceFault(_) => ErrorKind::DeviceFault,
            Self::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            Self::ObserverFault(_) => ErrorKind::ObserverFault,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::PoolShutdown => ErrorKind::PoolShutdown,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, DetectorError>;

/// 观察者回调返回的错误类型
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
