use crate::backend::TextureFormat;
use crate::translator::NativeTexture;

/// 阴影输出的像素格式
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum RenderTargetFormat {
    /// 1 字节，可见为 255
    #[default]
    Ru8,
    /// 2 字节 IEEE half
    Rf16,
    /// 4 字节 float
    Rf32,
}

impl RenderTargetFormat {
    #[inline]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            RenderTargetFormat::Ru8 => 1,
            RenderTargetFormat::Rf16 => 2,
            RenderTargetFormat::Rf32 => 4,
        }
    }

    #[inline]
    pub fn texture_format(self) -> TextureFormat {
        match self {
            RenderTargetFormat::Ru8 => TextureFormat::R8Unorm,
            RenderTargetFormat::Rf16 => TextureFormat::R16Float,
            RenderTargetFormat::Rf32 => TextureFormat::R32Float,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RenderTargetData {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) format: RenderTargetFormat,
    /// 宿主提供的纹理，渲染结果会拷贝进去
    pub(crate) gpu_texture: Option<NativeTexture>,
}

impl RenderTargetData {
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn format(&self) -> RenderTargetFormat {
        self.format
    }

    #[inline]
    pub fn gpu_texture(&self) -> Option<NativeTexture> {
        self.gpu_texture
    }

    #[inline]
    pub fn byte_size(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_size_follows_format() {
        let mut rt = RenderTargetData::default();
        assert!(!rt.is_valid());
        rt.width = 3;
        rt.height = 5;
        rt.format = RenderTargetFormat::Rf16;
        assert_eq!(rt.byte_size(), 30);
        assert_eq!(rt.format().texture_format().bytes_per_pixel(), 2);
    }
}
