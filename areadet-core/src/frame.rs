use std::fmt;
use std::time::Duration;

use crate::buffer::{FrameBuffer, OwnerTag};
use crate::geometry::FrameDim;
use crate::pixel_format::PixelType;

/// 帧就绪通知的载荷
///
/// 由 Buffer Manager 在帧完成的瞬间创建，对观察者只读。
/// 生命周期 'a 绑定到本次通知，实现零拷贝。
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo<'a> {
    /// 本次采集内的帧序号，从 0 开始连续递增
    pub acq_frame_nb: u64,

    /// 帧几何 (宽、高、像素类型)
    pub frame_dim: FrameDim,

    /// 像素数据
    pub buffer: FrameBuffer<'a>,

    /// 采集编号，每次 start 递增，用于区分停止后仍在途中的旧帧
    pub acq_id: u64,

    /// 相对采集开始的时间
    pub timestamp: Duration,

    /// 实际有效的字节数
    pub valid_bytes: usize,
}

impl<'a> FrameInfo<'a> {
    pub fn sequence_number(&self) -> u64 {
        self.acq_frame_nb
    }

    pub fn width(&self) -> u32 {
        self.frame_dim.width()
    }

    pub fn height(&self) -> u32 {
        self.frame_dim.height()
    }

    pub fn pixel_type(&self) -> PixelType {
        self.frame_dim.pixel_type
    }

    pub fn owner(&self) -> OwnerTag {
        self.buffer.owner()
    }

    /// 驱动送来的数据是否覆盖完整一帧
    pub fn is_valid(&self) -> bool {
        self.valid_bytes >= self.frame_dim.mem_size()
    }

    /// 脱离缓冲区的摘要，可以保存在 Status 里
    pub fn summary(&self) -> FrameSummary {
        FrameSummary {
            acq_id: self.acq_id,
            acq_frame_nb: self.acq_frame_nb,
            frame_dim: self.frame_dim,
            owner: self.owner(),
            timestamp: self.timestamp,
            valid: self.is_valid(),
        }
    }
}

impl fmt::Display for FrameInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<acq_id={}, acq_frame_nb={}, frame_dim={}, owner={}, timestamp={:?}, valid_bytes={}>",
            self.acq_id,
            self.acq_frame_nb,
            self.frame_dim,
            self.owner(),
            self.timestamp,
            self.valid_bytes
        )
    }
}

/// FrameInfo 的不含数据的副本
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub struct FrameSummary {
    pub acq_id: u64,
    pub acq_frame_nb: u64,
    pub frame_dim: FrameDim,
    pub owner: OwnerTag,
    pub timestamp: Duration,
    pub valid: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_follows_payload_length() {
        let dim = FrameDim::new(4, 2, PixelType::Bpp16);
        let full = [0u8; 16];
        let info = FrameInfo {
            acq_frame_nb: 3,
            frame_dim: dim,
            buffer: FrameBuffer::Mapped(&full),
            acq_id: 1,
            timestamp: Duration::from_millis(5),
            valid_bytes: full.len(),
        };
        assert!(info.is_valid());
        assert_eq!(info.summary().acq_frame_nb, 3);
        assert_eq!(info.summary().owner, OwnerTag::Mapped);

        let short = FrameInfo {
            valid_bytes: 10,
            ..info
        };
        assert!(!short.is_valid());
    }
}
