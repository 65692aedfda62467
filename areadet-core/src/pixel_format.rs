use std::fmt::{self, Display};

/// 探测器输出的像素类型
///
/// 科学相机几乎都输出单通道整数像素，位深由 ADC 决定 (10/12/14/16 bit)，
/// 但在内存中总是按字节对齐存放。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum PixelType {
    Bpp8,
    Bpp8S,
    Bpp10,
    Bpp10S,
    Bpp12,
    Bpp12S,
    Bpp14,
    Bpp14S,
    Bpp16,
    Bpp16S,
    Bpp32,
    Bpp32S,
    Float,
}

impl PixelType {
    /// 每像素在内存中占用的字节数
    pub const fn depth(&self) -> usize {
        match self {
            Self::Bpp8 | Self::Bpp8S => 1,
            Self::Bpp10
            | Self::Bpp10S
            | Self::Bpp12
            | Self::Bpp12S
            | Self::Bpp14
            | Self::Bpp14S
            | Self::Bpp16
            | Self::Bpp16S => 2,
            Self::Bpp32 | Self::Bpp32S | Self::Float => 4,
        }
    }

    /// ADC 有效位数
    pub const fn bits(&self) -> u32 {
        match self {
            Self::Bpp8 | Self::Bpp8S => 8,
            Self::Bpp10 | Self::Bpp10S => 10,
            Self::Bpp12 | Self::Bpp12S => 12,
            Self::Bpp14 | Self::Bpp14S => 14,
            Self::Bpp16 | Self::Bpp16S => 16,
            Self::Bpp32 | Self::Bpp32S | Self::Float => 32,
        }
    }

    pub const fn is_signed(&self) -> bool {
        matches!(
            self,
            Self::Bpp8S
                | Self::Bpp10S
                | Self::Bpp12S
                | Self::Bpp14S
                | Self::Bpp16S
                | Self::Bpp32S
                | Self::Float
        )
    }
}

impl Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bpp8 => "UINT8",
            Self::Bpp8S => "INT8",
            Self::Bpp10 => "UINT10",
            Self::Bpp10S => "INT10",
            Self::Bpp12 => "UINT12",
            Self::Bpp12S => "INT12",
            Self::Bpp14 => "UINT14",
            Self::Bpp14S => "INT14",
            Self::Bpp16 => "UINT16",
            Self::Bpp16S => "INT16",
            Self::Bpp32 => "UINT32",
            Self::Bpp32S => "INT32",
            Self::Float => "FLOAT",
        };
        f.write_str(name)
    }
}
