//! 引擎的入口
//!
//! [`RthsContext`] 持有设备与所有组件，宿主通过它创建 renderer、组装场景、渲染。
//! 宿主数据通过 [`RthsContext::world`] 返回的 [`World`] 设置，可以在其他线程中进行。

use crossbeam_channel::Receiver;
use glam::{Mat4, Vec3};
use itertools::Itertools;
use slotmap::SlotMap;

use crate::backend::soft::SoftDevice;
use crate::backend::{BackendKind, DeviceError, DeviceStatus, FencePoint, QueueKind, RtDevice};
use crate::config::{BackendChoice, EngineConfig};
use crate::error::{RthsError, RthsResult};
use crate::error_log::ReportExt;
use crate::frame::{FrameOutcome, FramePhase, PurgeList};
use crate::handles::{InstanceHandle, RenderTargetHandle, RendererHandle};
use crate::host::{Camera, GeometryEntry, Light, ReleaseEvent, RenderFlags, SceneData, World};
use crate::record_cache::{self, RecordCache};
use crate::renderer::{FrameContext, Renderer};
use crate::scheduler::Scheduler;
use crate::translator::{NativeTexture, ResourceTranslator};

pub struct RthsContext {
    config: EngineConfig,
    device: Box<dyn RtDevice>,

    world: World,
    events: Receiver<ReleaseEvent>,

    scheduler: Scheduler,
    translator: ResourceTranslator,
    records: RecordCache,
    purge: PurgeList,
    renderers: SlotMap<RendererHandle, Renderer>,

    _profiler: tracy_client::Client,
}

// new & init
impl RthsContext {
    /// 按配置创建设备，环境不支持硬件光追时返回 [`RthsError::Unsupported`]
    pub fn new(config: EngineConfig) -> RthsResult<Self> {
        let device: Box<dyn RtDevice> = match config.backend {
            BackendChoice::Soft => Box::new(SoftDevice::new(config.soft_row_pitch_alignment)),
            BackendChoice::Vulkan => Self::create_vulkan_device(&config)?,
        };
        Self::with_device(config, device)
    }

    #[cfg(feature = "vulkan")]
    fn create_vulkan_device(config: &EngineConfig) -> RthsResult<Box<dyn RtDevice>> {
        match crate::backend::vulkan::VulkanDevice::new(config) {
            Ok(device) => Ok(Box::new(device)),
            Err(DeviceError::Unsupported(msg)) => Err(RthsError::Unsupported(msg)).reported(),
            Err(e) => Err(RthsError::from(e)).reported(),
        }
    }

    #[cfg(not(feature = "vulkan"))]
    fn create_vulkan_device(_config: &EngineConfig) -> RthsResult<Box<dyn RtDevice>> {
        Err(RthsError::Unsupported("built without the vulkan feature".to_string())).reported()
    }

    /// 使用外部创建的设备
    pub fn with_device(config: EngineConfig, device: Box<dyn RtDevice>) -> RthsResult<Self> {
        if !device.caps().ray_tracing {
            return Err(RthsError::Unsupported(format!("{:?} device has no ray tracing support", device.kind())))
                .reported();
        }
        let _profiler = tracy_client::Client::start();

        let scheduler = Scheduler::new(device.caps().texture_row_pitch_alignment);
        let translator = ResourceTranslator::new(device.as_ref());
        let (world, events) = World::new();
        log::info!("rths context created on {:?} backend", device.kind());

        Ok(Self {
            config,
            device,
            world,
            events,
            scheduler,
            translator,
            records: RecordCache::new(),
            purge: PurgeList::new(),
            renderers: SlotMap::with_key(),
            _profiler,
        })
    }
}

// getters
impl RthsContext {
    /// 宿主数据，可以 clone 之后交给其他线程
    #[inline]
    pub fn world(&self) -> &World {
        &self.world
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn backend(&self) -> BackendKind {
        self.device.kind()
    }

    #[inline]
    pub fn renderer(&self, handle: RendererHandle) -> Option<&Renderer> {
        self.renderers.get(handle)
    }

    #[inline]
    pub fn phase(&self, handle: RendererHandle) -> Option<FramePhase> {
        self.renderers.get(handle).map(|r| r.phase())
    }

    #[inline]
    pub fn outcome(&self, handle: RendererHandle) -> Option<FrameOutcome> {
        self.renderers.get(handle).and_then(|r| r.outcome())
    }

    /// 等待 purge 的资源数量
    #[inline]
    pub fn pending_purge(&self) -> usize {
        self.purge.len()
    }

    /// 缓存中导入过的宿主资源数量
    #[inline]
    pub fn imported_resources(&self) -> usize {
        self.translator.len()
    }
}

// renderer
impl RthsContext {
    pub fn create_renderer(&mut self) -> RendererHandle {
        let handle = self.renderers.insert(Renderer::new(self.config.shader_table_capacity));
        log::info!("create renderer {:?}", handle);
        handle
    }

    /// renderer 的 GPU 资源在 fence 完成之后销毁
    pub fn release_renderer(&mut self, handle: RendererHandle) {
        if let Some(renderer) = self.renderers.remove(handle) {
            log::info!("release renderer {:?}", handle);
            renderer.release(&self.scheduler, &mut self.purge);
        }
    }

    pub fn set_render_target(&mut self, handle: RendererHandle, target: Option<RenderTargetHandle>) {
        if let Some(renderer) = self.renderers.get_mut(handle) {
            renderer.set_render_target(target, &self.scheduler, &mut self.purge);
        }
    }
}

// 场景组装，无效的 renderer 句柄都是 no-op
impl RthsContext {
    pub fn begin_scene(&mut self, handle: RendererHandle) {
        if let Some(renderer) = self.renderers.get_mut(handle) {
            renderer.begin_scene();
        }
    }

    pub fn end_scene(&mut self, handle: RendererHandle) {
        if let Some(renderer) = self.renderers.get_mut(handle) {
            renderer.end_scene();
        }
    }

    pub fn set_camera(&mut self, handle: RendererHandle, position: Vec3, view: Mat4, proj: Mat4) {
        self.with_scene(handle, |scene| scene.camera = Camera { position, view, proj });
    }

    pub fn add_directional_light(&mut self, handle: RendererHandle, direction: Vec3) {
        self.add_light(handle, Light::Directional { direction });
    }

    /// `spot_angle` 为整个圆锥的角度，单位为度
    pub fn add_spot_light(&mut self, handle: RendererHandle, position: Vec3, direction: Vec3, range: f32, spot_angle: f32) {
        self.add_light(
            handle,
            Light::Spot {
                position,
                direction,
                range,
                spot_angle,
            },
        );
    }

    pub fn add_point_light(&mut self, handle: RendererHandle, position: Vec3, range: f32) {
        self.add_light(handle, Light::Point { position, range });
    }

    pub fn add_reverse_point_light(&mut self, handle: RendererHandle, position: Vec3, range: f32) {
        self.add_light(handle, Light::ReversePoint { position, range });
    }

    pub fn add_geometry(&mut self, handle: RendererHandle, instance: InstanceHandle, mask: u8) {
        self.with_scene(handle, |scene| scene.geometries.push(GeometryEntry { instance, mask }));
    }

    pub fn set_render_flags(&mut self, handle: RendererHandle, flags: RenderFlags) {
        self.with_scene(handle, |scene| scene.flags = flags);
    }

    pub fn set_shadow_ray_offset(&mut self, handle: RendererHandle, offset: f32) {
        self.with_scene(handle, |scene| scene.shadow_ray_offset = offset);
    }

    pub fn set_self_shadow_threshold(&mut self, handle: RendererHandle, threshold: f32) {
        self.with_scene(handle, |scene| scene.self_shadow_threshold = threshold);
    }

    /// 超过 `max_lights` 的灯光被丢弃
    fn add_light(&mut self, handle: RendererHandle, light: Light) {
        let max_lights = self.config.max_lights as usize;
        self.with_scene(handle, |scene| {
            if scene.lights.len() >= max_lights {
                log::warn!("light limit {} reached, {:?} dropped", max_lights, light);
                return;
            }
            scene.lights.push(light);
        });
    }

    fn with_scene(&mut self, handle: RendererHandle, f: impl FnOnce(&mut SceneData)) {
        if let Some(renderer) = self.renderers.get_mut(handle) {
            f(renderer.scene_mut());
        }
    }
}

// 执行
impl RthsContext {
    /// 提交一帧，需要调用 [`RthsContext::finish`] 等待结果
    pub fn render(&mut self, handle: RendererHandle) -> RthsResult<()> {
        let _span = tracy_client::span!("RthsContext::render");
        self.prepare_frame().and_then(|_| self.with_renderer(handle, |renderer, cx| renderer.render(cx))).reported()
    }

    /// 阻塞直到这一帧完成，没有进行中的帧时什么也不做
    pub fn finish(&mut self, handle: RendererHandle) -> RthsResult<()> {
        let _span = tracy_client::span!("RthsContext::finish");
        self.with_renderer(handle, |renderer, cx| renderer.finish(cx)).reported()
    }

    /// 把最近一次完成的帧的输出写入 `dst`，还没有输出时返回 false
    ///
    /// 如果有进行中的帧，会先等待它完成
    pub fn readback_render_target(&mut self, handle: RendererHandle, dst: &mut Vec<u8>) -> RthsResult<bool> {
        self.with_renderer(handle, |renderer, cx| {
            if renderer.phase().in_flight() {
                renderer.finish(cx)?;
            }
            Ok(renderer.readback(dst))
        })
        .reported()
    }

    /// 引擎内部的输出纹理，宿主可以直接采样
    pub fn render_texture(&self, handle: RendererHandle) -> Option<NativeTexture> {
        self.renderers.get(handle).and_then(|r| r.render_texture(self.device.as_ref()))
    }

    /// 渲染并等待所有设置了 render target 的 renderer，返回遇到的第一个错误
    pub fn render_all(&mut self) -> RthsResult<()> {
        let _span = tracy_client::span!("RthsContext::render_all");
        let handles = self
            .renderers
            .iter()
            .filter(|(_, r)| r.render_target().is_some())
            .map(|(h, _)| h)
            .collect_vec();

        let mut first_error = None;
        for handle in handles {
            if let Err(e) = self.render(handle).and_then(|_| self.finish(handle)) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// 帧的钩子
impl RthsContext {
    /// 处理宿主的 release，释放 fence 已经完成的临时资源
    pub fn on_frame_begin(&mut self) -> RthsResult<()> {
        let _span = tracy_client::span!("RthsContext::on_frame_begin");
        self.prepare_frame()
            .map(|_| {
                let released: usize = self
                    .renderers
                    .values_mut()
                    .map(|r| r.release_transients(self.device.as_mut(), &mut self.scheduler))
                    .sum();
                if released > 0 {
                    log::debug!("released {} transient resources", released);
                }
            })
            .reported()
    }

    /// 销毁 purge list 中 fence 已经完成的资源
    pub fn on_frame_end(&mut self) -> RthsResult<()> {
        let _span = tracy_client::span!("RthsContext::on_frame_end");
        self.scheduler
            .refresh(self.device.as_mut())
            .map(|_| {
                let purged = self.purge.release_retired(self.device.as_mut(), &mut self.scheduler);
                if purged > 0 {
                    log::debug!("purged {} resources, {} pending", purged, self.purge.len());
                }
            })
            .map_err(RthsError::from)
            .reported()
    }
}

// tools
impl RthsContext {
    /// 检查设备状态，处理宿主的 release
    fn prepare_frame(&mut self) -> RthsResult<()> {
        if self.device.check_device()? == DeviceStatus::Reset {
            self.reset_device_state();
        }
        self.scheduler.refresh(self.device.as_mut())?;
        self.drain_release_events();
        self.evict_native_resources();
        Ok(())
    }

    /// 宿主不再引用的原生资源在最后一次使用之后销毁包装对象
    fn evict_native_resources(&mut self) {
        if self.translator.is_empty() {
            return;
        }
        let (buffers, textures) = self.world.lock().native_resources();
        let evicted = self.translator.evict_unused(&buffers, &textures);
        if !evicted.is_empty() {
            log::debug!("evicted {} imported resources", evicted.len());
            record_cache::retire(evicted, self.device.as_mut(), &mut self.scheduler, &mut self.purge);
        }
    }

    /// 设备重建之后，所有 GPU 资源都已经不存在
    fn reset_device_state(&mut self) {
        log::warn!("device was recreated, dropping all gpu state");
        self.scheduler.reset(self.device.caps().texture_row_pitch_alignment);
        self.translator.forget_all();
        self.records.forget_all();
        self.purge.forget_all();
        for renderer in self.renderers.values_mut() {
            renderer.forget_device();
        }
    }

    fn drain_release_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                ReleaseEvent::Mesh(mesh) => {
                    self.records.invalidate_mesh(mesh, self.device.as_mut(), &mut self.scheduler, &mut self.purge)
                }
                ReleaseEvent::Instance(instance) => self.records.invalidate_instance(
                    instance,
                    self.device.as_mut(),
                    &mut self.scheduler,
                    &mut self.purge,
                ),
                ReleaseEvent::RenderTarget(target) => {
                    for renderer in self.renderers.values_mut().filter(|r| r.render_target() == Some(target)) {
                        log::debug!("render target {:?} released while attached", target);
                        renderer.set_render_target(None, &self.scheduler, &mut self.purge);
                    }
                }
            }
        }
    }

    fn with_renderer<T>(
        &mut self,
        handle: RendererHandle,
        f: impl FnOnce(&mut Renderer, &mut FrameContext) -> RthsResult<T>,
    ) -> RthsResult<T> {
        let renderer = self
            .renderers
            .get_mut(handle)
            .ok_or_else(|| RthsError::contract(format!("renderer {:?} does not exist", handle)))?;
        let mut cx = FrameContext {
            device: self.device.as_mut(),
            scheduler: &mut self.scheduler,
            translator: &mut self.translator,
            records: &mut self.records,
            purge: &mut self.purge,
            world: &self.world,
        };
        f(renderer, &mut cx)
    }

    /// 等待两个 queue 上已经提交的所有工作
    fn wait_idle(&mut self) -> Result<(), DeviceError> {
        for queue in QueueKind::ALL {
            let value = self.scheduler.submitted(queue);
            if value > 0 {
                self.scheduler.wait_for(self.device.as_mut(), FencePoint { queue, value })?;
            }
        }
        Ok(())
    }
}

impl Drop for RthsContext {
    fn drop(&mut self) {
        let _span = tracy_client::span!("RthsContext::drop");
        for (_, renderer) in self.renderers.drain() {
            renderer.release(&self.scheduler, &mut self.purge);
        }
        self.records.release_all(&self.scheduler, &mut self.purge);

        match self.wait_idle() {
            Ok(()) => {
                self.purge.release_retired(self.device.as_mut(), &mut self.scheduler);
                self.translator.clear(self.device.as_mut());
            }
            Err(e) => {
                log::error!("device error while destroying the context: {}", e);
                self.purge.forget_all();
                self.translator.forget_all();
            }
        }
        log::info!("rths context destroyed");
    }
}
