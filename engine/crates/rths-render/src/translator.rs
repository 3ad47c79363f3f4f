//! 宿主资源到引擎资源的转换
//!
//! 宿主给出的是不透明的原生句柄，在 Vulkan 后端上是 `VkBuffer` / `VkImage` 的 raw handle，
//! 在 soft 后端上是 [`crate::backend::soft::SoftDevice`] 注册的宿主资源。

use std::collections::{HashMap, HashSet};

use itertools::Itertools;

use crate::backend::{BackendKind, BufferId, DeviceResult, ResourceRef, RtDevice, TextureFormat, TextureId};

/// 宿主的 GPU buffer
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NativeBuffer {
    pub raw: u64,
    pub size: u64,
}

/// 宿主的 2D 纹理
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NativeTexture {
    pub raw: u64,
    pub width: u32,
    pub height: u32,
}

/// 缓存导入过的宿主资源，同一个原生句柄只导入一次
pub struct ResourceTranslator {
    kind: BackendKind,
    buffers: HashMap<NativeBuffer, BufferId>,
    textures: HashMap<(NativeTexture, TextureFormat), TextureId>,
}

impl ResourceTranslator {
    pub fn new(device: &dyn RtDevice) -> Self {
        let kind = device.kind();
        log::info!("resource translator attached to {:?} backend", kind);
        Self {
            kind,
            buffers: HashMap::new(),
            textures: HashMap::new(),
        }
    }

    /// 当前的图形后端
    #[inline]
    pub fn backend(&self) -> BackendKind {
        self.kind
    }

    pub fn buffer(&mut self, device: &mut dyn RtDevice, native: NativeBuffer) -> DeviceResult<BufferId> {
        if let Some(id) = self.buffers.get(&native) {
            return Ok(*id);
        }
        let id = device.import_buffer(native)?;
        log::debug!("imported native buffer {:#x} ({} bytes)", native.raw, native.size);
        self.buffers.insert(native, id);
        Ok(id)
    }

    pub fn texture(
        &mut self,
        device: &mut dyn RtDevice,
        native: NativeTexture,
        format: TextureFormat,
    ) -> DeviceResult<TextureId> {
        if let Some(id) = self.textures.get(&(native, format)) {
            return Ok(*id);
        }
        let id = device.import_texture(native, format)?;
        log::debug!("imported native texture {:#x} ({}x{})", native.raw, native.width, native.height);
        self.textures.insert((native, format), id);
        Ok(id)
    }

    /// 导入过的资源数量
    #[inline]
    pub fn len(&self) -> usize {
        self.buffers.len() + self.textures.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.textures.is_empty()
    }

    /// 移除 `native` 的缓存，返回的 id 需要在最后一次使用之后销毁
    pub fn forget_buffer(&mut self, native: NativeBuffer) -> Option<BufferId> {
        self.buffers.remove(&native)
    }

    /// 移除 `native` 以任意格式导入的缓存
    pub fn forget_texture(&mut self, native: NativeTexture) -> Vec<TextureId> {
        let keys = self.textures.keys().filter(|(t, _)| *t == native).copied().collect_vec();
        keys.into_iter().filter_map(|key| self.textures.remove(&key)).collect()
    }

    /// 移除宿主已经不再引用的原生资源，返回需要销毁的包装对象
    ///
    /// 宿主释放原生资源之后，驱动可能把同一个 raw handle 分配给新的资源
    pub fn evict_unused(
        &mut self,
        live_buffers: &HashSet<NativeBuffer>,
        live_textures: &HashSet<NativeTexture>,
    ) -> Vec<ResourceRef> {
        let stale_buffers = self.buffers.keys().filter(|b| !live_buffers.contains(b)).copied().collect_vec();
        let stale_textures =
            self.textures.keys().map(|(t, _)| *t).filter(|t| !live_textures.contains(t)).unique().collect_vec();

        let mut evicted = Vec::new();
        for native in stale_buffers {
            log::debug!("evict native buffer {:#x}", native.raw);
            evicted.extend(self.forget_buffer(native).map(ResourceRef::Buffer));
        }
        for native in stale_textures {
            log::debug!("evict native texture {:#x}", native.raw);
            evicted.extend(self.forget_texture(native).into_iter().map(ResourceRef::Texture));
        }
        evicted
    }

    /// 释放导入产生的包装对象，宿主的资源本身不受影响
    ///
    /// 调用前需要保证没有 GPU 工作还在使用它们
    pub fn clear(&mut self, device: &mut dyn RtDevice) {
        for (_, id) in self.buffers.drain() {
            device.destroy_buffer(id);
        }
        for (_, id) in self.textures.drain() {
            device.destroy_texture(id);
        }
    }

    /// 设备重置之后旧的 id 全部失效，直接丢弃
    pub fn forget_all(&mut self) {
        self.buffers.clear();
        self.textures.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::SoftDevice;

    #[test]
    fn test_import_is_cached() {
        let soft = SoftDevice::new(256);
        let native = soft.register_native_buffer(&[0u8; 48]);
        let mut device: Box<dyn RtDevice> = Box::new(soft.clone());
        let mut translator = ResourceTranslator::new(device.as_ref());
        assert_eq!(translator.backend(), BackendKind::Soft);

        let a = translator.buffer(device.as_mut(), native).unwrap();
        let b = translator.buffer(device.as_mut(), native).unwrap();
        assert_eq!(a, b);

        let bogus = NativeBuffer { raw: 0xdead, size: 4 };
        assert!(translator.buffer(device.as_mut(), bogus).is_err());
    }

    #[test]
    fn test_unreferenced_imports_are_evicted() {
        let soft = SoftDevice::new(256);
        let kept = soft.register_native_buffer(&[0u8; 12]);
        let dropped = soft.register_native_buffer(&[0u8; 12]);
        let texture = soft.register_native_texture(4, 4, TextureFormat::R8Unorm);
        let mut device: Box<dyn RtDevice> = Box::new(soft.clone());
        let mut translator = ResourceTranslator::new(device.as_ref());

        let kept_id = translator.buffer(device.as_mut(), kept).unwrap();
        let dropped_id = translator.buffer(device.as_mut(), dropped).unwrap();
        let texture_id = translator.texture(device.as_mut(), texture, TextureFormat::R8Unorm).unwrap();
        assert_eq!(translator.len(), 3);

        let evicted = translator.evict_unused(&HashSet::from([kept]), &HashSet::new());
        assert_eq!(evicted.len(), 2);
        assert!(evicted.contains(&ResourceRef::Buffer(dropped_id)));
        assert!(evicted.contains(&ResourceRef::Texture(texture_id)));
        assert_eq!(translator.len(), 1);

        // 仍被引用的资源继续使用缓存
        assert_eq!(translator.buffer(device.as_mut(), kept).unwrap(), kept_id);
        assert!(translator.forget_buffer(kept).is_some());
        assert!(translator.is_empty());
    }
}
