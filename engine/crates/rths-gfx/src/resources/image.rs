use ash::vk;
use vk_mem::Alloc;

use crate::{
    error::{GfxError, GfxResult, VkResultExt},
    foundation::debug_messenger::DebugType,
    gfx::Gfx,
};

/// Image 来源枚举
pub enum ImageSource {
    /// 由 VMA 分配的 Image
    Allocated(vk_mem::Allocation),
    /// 外部 Image（例如宿主引擎的 render target），不管理其内存生命周期
    External,
}

/// 2D image 以及它的 view
///
/// 阴影输出只有单个 mip 以及单个 layer
///
/// # Destroy
/// 需要手动调用 [`GfxImage2D::destroy`]
pub struct GfxImage2D {
    handle: vk::Image,
    view: vk::ImageView,
    source: ImageSource,

    extent: vk::Extent2D,
    format: vk::Format,

    name: String,
}
// new & init
impl GfxImage2D {
    pub fn new(
        gfx: &Gfx,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        debug_name: &str,
    ) -> GfxResult<Self> {
        let concurrent_families = gfx.concurrent_families();
        let mut image_ci = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        if !concurrent_families.is_empty() {
            image_ci = image_ci.sharing_mode(vk::SharingMode::CONCURRENT).queue_family_indices(&concurrent_families);
        }
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };

        let allocator = gfx.allocator();
        let (image, mut alloc) = unsafe { allocator.create_image(&image_ci, &alloc_ci) }.map_err(|result| {
            GfxError::Allocation(format!("image {} ({}x{}): {}", debug_name, extent.width, extent.height, result))
        })?;

        let view = match Self::create_view(gfx, image, format) {
            Ok(view) => view,
            Err(e) => {
                unsafe { allocator.destroy_image(image, &mut alloc) };
                return Err(e);
            }
        };

        let image = Self {
            handle: image,
            view,
            source: ImageSource::Allocated(alloc),
            extent,
            format,
            name: debug_name.to_string(),
        };
        gfx.gfx_device().set_debug_name(&image, debug_name);
        Ok(image)
    }

    /// 包装一个外部 image，只为其创建 view
    pub fn import(
        gfx: &Gfx,
        image: vk::Image,
        extent: vk::Extent2D,
        format: vk::Format,
        debug_name: &str,
    ) -> GfxResult<Self> {
        let view = Self::create_view(gfx, image, format)?;
        Ok(Self {
            handle: image,
            view,
            source: ImageSource::External,
            extent,
            format,
            name: debug_name.to_string(),
        })
    }

    fn create_view(gfx: &Gfx, image: vk::Image, format: vk::Format) -> GfxResult<vk::ImageView> {
        let view_ci = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(Self::subresource_range());
        unsafe { gfx.gfx_device().create_image_view(&view_ci, None) }.vk_context("vkCreateImageView")
    }
}
// getter
impl GfxImage2D {
    #[inline]
    pub fn width(&self) -> u32 {
        self.extent.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.extent.height
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn subresource_range() -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    #[inline]
    pub fn subresource_layers() -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        }
    }
}
impl DebugType for GfxImage2D {
    fn debug_type_name() -> &'static str {
        "GfxImage2D"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}
// destroy
impl GfxImage2D {
    pub fn destroy(mut self, gfx: &Gfx) {
        log::debug!("Destroying GfxImage2D: {}", self.name);

        unsafe {
            gfx.gfx_device().destroy_image_view(self.view, None);
        }
        match &mut self.source {
            ImageSource::External => (),
            ImageSource::Allocated(allocation) => unsafe { gfx.allocator().destroy_image(self.handle, allocation) },
        }
        self.handle = vk::Image::null();
    }
}
impl Drop for GfxImage2D {
    fn drop(&mut self) {
        use ash::vk::Handle;
        debug_assert!(self.handle.is_null(), "GfxImage2D {} must be destroyed before being dropped.", self.name);
    }
}
