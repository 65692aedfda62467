use std::fmt;
use std::ops::Div;

use crate::error::{DetectorError, Result};
use crate::pixel_format::PixelType;

/// 图像尺寸 (像素)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub const fn nb_pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// 是否能放进 `other` 之内
    pub const fn fits_in(&self, other: &Size) -> bool {
        self.width <= other.width && self.height <= other.height
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// 硬件 Binning 因子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Bin {
    pub x: u32,
    pub y: u32,
}

impl Bin {
    pub const ONE: Bin = Bin { x: 1, y: 1 };

    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// 对称 Binning (x == y)
    pub const fn square(factor: u32) -> Self {
        Self {
            x: factor,
            y: factor,
        }
    }

    pub const fn is_one(&self) -> bool {
        self.x == 1 && self.y == 1
    }
}

impl Default for Bin {
    fn default() -> Self {
        Self::ONE
    }
}

impl fmt::Display for Bin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.x, self.y)
    }
}

/// 帧几何：尺寸 + 像素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameDim {
    pub size: Size,
    pub pixel_type: PixelType,
}

impl FrameDim {
    pub const fn new(width: u32, height: u32, pixel_type: PixelType) -> Self {
        Self {
            size: Size::new(width, height),
            pixel_type,
        }
    }

    pub const fn width(&self) -> u32 {
        self.size.width
    }

    pub const fn height(&self) -> u32 {
        self.size.height
    }

    pub const fn depth(&self) -> usize {
        self.pixel_type.depth()
    }

    /// 一帧所需的字节数
    pub const fn mem_size(&self) -> usize {
        self.size.nb_pixels() * self.pixel_type.depth()
    }

    pub fn validate(&self) -> Result<()> {
        if self.size.is_empty() {
            return Err(DetectorError::invalid_param(
                "frame_dim",
                format!("empty frame size {}", self.size),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for FrameDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}x{}x{}>", self.size.width, self.size.height, self.pixel_type)
    }
}

/// 有效帧几何 = 全帧 / Binning (向下取整)
impl Div<Bin> for FrameDim {
    type Output = FrameDim;

    fn div(self, bin: Bin) -> FrameDim {
        FrameDim {
            size: Size::new(
                self.size.width / bin.x.max(1),
                self.size.height / bin.y.max(1),
            ),
            pixel_type: self.pixel_type,
        }
    }
}
