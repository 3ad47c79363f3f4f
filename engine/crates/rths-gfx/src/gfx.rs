use std::mem::ManuallyDrop;
use std::rc::Rc;

use ash::vk;
use itertools::Itertools;

use crate::{
    commands::command_queue::{GfxCommandQueue, GfxQueueFamily},
    error::GfxResult,
    foundation::{
        debug_messenger::GfxDebugMsger, device::GfxDevice, instance::GfxInstance,
        physical_device::GfxPhysicalDevice, vmem_allocator::GfxMemAllocator,
    },
};

/// 创建 [`Gfx`] 所需的参数
#[derive(Clone, Debug)]
pub struct GfxCreateInfo {
    pub app_name: String,
    /// 开启 validation layer 以及 debug utils
    pub enable_validation: bool,
    /// 存在多张光追显卡时，优先选择独立显卡
    pub prefer_discrete_gpu: bool,
}

impl Default for GfxCreateInfo {
    fn default() -> Self {
        Self {
            app_name: "rths".to_string(),
            enable_validation: cfg!(debug_assertions),
            prefer_discrete_gpu: true,
        }
    }
}

/// Vulkan 图形上下文
///
/// 管理实例、设备、队列以及内存分配器。由调用者显式持有并传递，
/// 所有 GFX 资源都通过它创建和销毁。
///
/// # 队列
/// - compute queue：加速结构构建与光追 dispatch
/// - transfer queue：上传与回读；没有专用 transfer family 时，
///   会在 compute family 中再取一个 queue，仍然不行则与 compute queue 共用
///
/// # 初始化流程
/// ```ignore
/// let gfx = Gfx::new(&GfxCreateInfo::default())?;
/// let device = gfx.gfx_device();
/// // 使用...
/// drop(gfx);
/// ```
pub struct Gfx {
    /// vk 基础函数的接口
    ///
    /// 在 drop 之后，会卸载 dll，因此需要确保该字段最后 drop
    _vk_entry: ash::Entry,
    instance: ManuallyDrop<GfxInstance>,
    debug_msger: Option<GfxDebugMsger>,
    physical_device: GfxPhysicalDevice,
    gfx_device: Rc<GfxDevice>,
    vm_allocator: ManuallyDrop<GfxMemAllocator>,

    compute_queue: GfxCommandQueue,
    transfer_queue: GfxCommandQueue,
}

// 创建与销毁
impl Gfx {
    const ENGINE_NAME: &'static str = "rths";

    pub fn new(create_info: &GfxCreateInfo) -> GfxResult<Self> {
        let _span = tracy_client::span!("Gfx::new");

        let vk_entry = unsafe { ash::Entry::load()? };
        let instance =
            GfxInstance::new(&vk_entry, &create_info.app_name, Self::ENGINE_NAME, create_info.enable_validation)?;

        let debug_msger = if instance.debug_utils_enabled {
            match GfxDebugMsger::new(&vk_entry, &instance.ash_instance) {
                Ok(msger) => Some(msger),
                Err(e) => {
                    log::warn!("failed to create debug messenger: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let physical_device = match GfxPhysicalDevice::pick(&instance.ash_instance, create_info.prefer_discrete_gpu) {
            Ok(pdevice) => pdevice,
            Err(e) => {
                drop(debug_msger);
                instance.destroy();
                return Err(e);
            }
        };

        let queue_plan = QueuePlan::new(&physical_device);
        let queue_priorities = [1.0_f32; 2];
        let queue_cis = queue_plan
            .families()
            .iter()
            .map(|(family_index, count)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(*family_index)
                    .queue_priorities(&queue_priorities[..*count as usize])
            })
            .collect_vec();

        let gfx_device =
            match GfxDevice::new(&instance.ash_instance, physical_device.vk_handle, &queue_cis, debug_msger.is_some())
            {
                Ok(device) => Rc::new(device),
                Err(e) => {
                    drop(debug_msger);
                    instance.destroy();
                    return Err(e);
                }
            };

        let vm_allocator =
            match GfxMemAllocator::new(&instance.ash_instance, physical_device.vk_handle, &gfx_device.device) {
                Ok(allocator) => allocator,
                Err(e) => {
                    gfx_device.destroy();
                    drop(debug_msger);
                    instance.destroy();
                    return Err(e);
                }
            };

        let make_queue = |family: &GfxQueueFamily, queue_index: u32, name: &str| {
            let queue = GfxCommandQueue {
                vk_queue: unsafe { gfx_device.get_device_queue(family.queue_family_index, queue_index) },
                queue_family: family.clone(),
                gfx_device: gfx_device.clone(),
            };
            gfx_device.set_debug_name(&queue, name);
            queue
        };
        let compute_queue = make_queue(physical_device.compute_queue_family(), 0, "compute");
        let transfer_queue =
            make_queue(physical_device.transfer_queue_family(), queue_plan.transfer_queue_index, "transfer");

        log::info!(
            "gfx created: compute family {}, transfer family {} (queue {})",
            compute_queue.queue_family.queue_family_index,
            transfer_queue.queue_family.queue_family_index,
            queue_plan.transfer_queue_index
        );

        Ok(Self {
            _vk_entry: vk_entry,
            instance: ManuallyDrop::new(instance),
            debug_msger,
            physical_device,
            gfx_device,
            vm_allocator: ManuallyDrop::new(vm_allocator),
            compute_queue,
            transfer_queue,
        })
    }
}

impl Drop for Gfx {
    fn drop(&mut self) {
        let _span = tracy_client::span!("Gfx::drop");
        if let Err(e) = self.gfx_device.wait_idle() {
            log::error!("wait idle before gfx destroy failed: {}", e);
        }
        unsafe {
            // vma 需要在 device 之前销毁
            ManuallyDrop::drop(&mut self.vm_allocator);
        }
        self.gfx_device.destroy();
        self.debug_msger.take();
        unsafe {
            ManuallyDrop::take(&mut self.instance).destroy();
        }
    }
}

/// 每个 queue family 需要创建多少个 queue
struct QueuePlan {
    compute_family: u32,
    transfer_family: u32,
    /// transfer queue 在其 family 中的索引
    transfer_queue_index: u32,
}

impl QueuePlan {
    fn new(pdevice: &GfxPhysicalDevice) -> Self {
        let compute = pdevice.compute_queue_family();
        let transfer = pdevice.transfer_queue_family();
        let transfer_queue_index =
            if compute.queue_family_index == transfer.queue_family_index && compute.queue_count >= 2 { 1 } else { 0 };
        Self {
            compute_family: compute.queue_family_index,
            transfer_family: transfer.queue_family_index,
            transfer_queue_index,
        }
    }

    /// (family index, queue count)
    fn families(&self) -> Vec<(u32, u32)> {
        if self.compute_family == self.transfer_family {
            vec![(self.compute_family, self.transfer_queue_index + 1)]
        } else {
            vec![(self.compute_family, 1), (self.transfer_family, 1)]
        }
    }
}

// getter
impl Gfx {
    #[inline]
    pub fn instance(&self) -> &GfxInstance {
        &self.instance
    }

    #[inline]
    pub fn gfx_device(&self) -> &Rc<GfxDevice> {
        &self.gfx_device
    }

    #[inline]
    pub fn allocator(&self) -> &GfxMemAllocator {
        &self.vm_allocator
    }

    #[inline]
    pub fn physical_device(&self) -> &GfxPhysicalDevice {
        &self.physical_device
    }

    #[inline]
    pub fn compute_queue(&self) -> &GfxCommandQueue {
        &self.compute_queue
    }

    #[inline]
    pub fn transfer_queue(&self) -> &GfxCommandQueue {
        &self.transfer_queue
    }

    /// compute queue 和 transfer queue 是否是同一个 vk::Queue
    #[inline]
    pub fn queues_shared(&self) -> bool {
        self.compute_queue.vk_queue == self.transfer_queue.vk_queue
    }

    /// 资源在两个 queue family 之间共享时所需的 family 列表
    ///
    /// 两个 queue 属于同一个 family 时为空，资源使用 EXCLUSIVE 模式
    pub fn concurrent_families(&self) -> Vec<u32> {
        let compute = self.compute_queue.queue_family.queue_family_index;
        let transfer = self.transfer_queue.queue_family.queue_family_index;
        if compute == transfer { vec![] } else { vec![compute, transfer] }
    }

    #[inline]
    pub fn rt_pipeline_props(&self) -> &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'static> {
        self.physical_device.rt_pipeline_props()
    }
}

// tools
impl Gfx {
    #[inline]
    pub fn wait_idle(&self) -> GfxResult<()> {
        self.gfx_device.wait_idle()
    }
}
