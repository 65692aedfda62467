use std::fmt;
use std::sync::Arc;

use crate::error::{DetectorError, Result};

/// 帧缓冲区的所有权标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum OwnerTag {
    /// 内存属于驱动/DMA 映射，消费者不能释放，也不能在通知返回后继续持有
    Mapped,
    /// 内存自带引用计数，计数归零时释放
    Owned,
}

impl fmt::Display for OwnerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mapped => f.write_str("MAPPED"),
            Self::Owned => f.write_str("OWNED"),
        }
    }
}

/// 带原子引用计数的帧内存块
///
/// `retain()` 相当于 ref()，`unref()` (或直接 drop) 相当于 unref()。
/// 最后一个持有者释放时内存被回收。
#[derive(Clone)]
pub struct OwnedBuffer {
    block: Arc<Vec<u8>>,
}

impl OwnedBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self {
            block: Arc::new(vec![0u8; len]),
        }
    }

    /// 深拷贝一段数据 (用于把 MAPPED 帧带出通知调用)
    pub fn copy_from(data: &[u8]) -> Self {
        Self {
            block: Arc::new(data.to_vec()),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.block
    }

    pub fn byte_len(&self) -> usize {
        self.block.len()
    }

    /// 增加引用计数，返回新的持有者
    pub fn retain(&self) -> OwnedBuffer {
        self.clone()
    }

    /// 释放当前持有者
    pub fn unref(self) {
        drop(self)
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.block)
    }

    /// 判断两个持有者是否指向同一块内存
    pub fn same_block(&self, other: &OwnedBuffer) -> bool {
        Arc::ptr_eq(&self.block, &other.block)
    }

    /// 获取可写视图。
    /// 如果还有消费者持有这块内存，就给槽位换一块新的，被持有的数据保持不变。
    /// 返回值的第二项表示是否发生了重新分配。
    pub(crate) fn writable(&mut self) -> (&mut [u8], bool) {
        let len = self.block.len();
        let realloc = Arc::get_mut(&mut self.block).is_none();
        if realloc {
            self.block = Arc::new(vec![0u8; len]);
        }
        // 此时引用唯一，make_mut 不会拷贝
        (Arc::make_mut(&mut self.block).as_mut_slice(), realloc)
    }
}

impl fmt::Debug for OwnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedBuffer")
            .field("len", &self.block.len())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// 交给观察者的帧缓冲区
///
/// 生命周期 'a 绑定到一次通知调用。MAPPED 视图无法逃逸出回调，
/// 需要保留数据的消费者必须 `retain()` (OWNED) 或 `to_owned_buffer()` (拷贝)。
#[derive(Debug, Clone, Copy)]
pub enum FrameBuffer<'a> {
    Mapped(&'a [u8]),
    Owned(&'a OwnedBuffer),
}

impl<'a> FrameBuffer<'a> {
    pub fn owner(&self) -> OwnerTag {
        match self {
            Self::Mapped(_) => OwnerTag::Mapped,
            Self::Owned(_) => OwnerTag::Owned,
        }
    }

    pub fn data(&self) -> &'a [u8] {
        match *self {
            Self::Mapped(data) => data,
            Self::Owned(buf) => buf.data(),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.data().len()
    }

    /// ref(): 只有 OWNED 缓冲区可以被保留
    pub fn retain(&self) -> Option<OwnedBuffer> {
        match self {
            Self::Mapped(_) => None,
            Self::Owned(buf) => Some(buf.retain()),
        }
    }

    /// 保留 OWNED 缓冲区 (零拷贝)，或拷贝 MAPPED 缓冲区
    pub fn to_owned_buffer(&self) -> OwnedBuffer {
        match self {
            Self::Mapped(data) => OwnedBuffer::copy_from(data),
            Self::Owned(buf) => buf.retain(),
        }
    }

    /// 按像素类型查看数据，例如 `as_pixels::<u16>()`
    pub fn as_pixels<T: bytemuck::Pod>(&self) -> Result<&'a [T]> {
        bytemuck::try_cast_slice(self.data())
            .map_err(|e| DetectorError::invalid_param("pixel_view", format!("{:?}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retain_increments_and_unref_releases() {
        let buf = OwnedBuffer::zeroed(64);
        assert_eq!(buf.ref_count(), 1);

        let view = FrameBuffer::Owned(&buf);
        let kept = view.retain().expect("owned buffers can be retained");
        assert_eq!(buf.ref_count(), 2);
        assert!(kept.same_block(&buf));

        kept.unref();
        assert_eq!(buf.ref_count(), 1);
    }

    #[test]
    fn mapped_view_cannot_be_retained() {
        let dma = vec![7u8; 32];
        let view = FrameBuffer::Mapped(&dma);
        assert_eq!(view.owner(), OwnerTag::Mapped);
        assert!(view.retain().is_none());

        let copy = view.to_owned_buffer();
        assert_eq!(copy.data(), dma.as_slice());
        assert_eq!(copy.ref_count(), 1);
    }

    #[test]
    fn writable_reallocates_when_retained() {
        let mut slot = OwnedBuffer::zeroed(4);
        slot.writable().0.copy_from_slice(&[1, 2, 3, 4]);

        let held = slot.retain();
        let (data, realloc) = slot.writable();
        assert!(realloc);
        data.copy_from_slice(&[9, 9, 9, 9]);

        // 被保留的帧数据不会被下一帧覆盖
        assert_eq!(held.data(), &[1, 2, 3, 4]);
        assert_eq!(slot.data(), &[9, 9, 9, 9]);

        drop(held);
        let (_, realloc) = slot.writable();
        assert!(!realloc);
    }

    #[test]
    fn pixel_view_rejects_odd_length() {
        let raw = [0u8; 3];
        let view = FrameBuffer::Mapped(&raw);
        assert!(view.as_pixels::<u16>().is_err());
        assert_eq!(view.as_pixels::<u8>().map(|p| p.len()).ok(), Some(3));
    }
}
