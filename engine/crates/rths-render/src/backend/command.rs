use itertools::Itertools;

use crate::backend::{AccelId, BufferId, TextureId};
use crate::host::IndexFormat;
use crate::resource_state::ResourceState;

/// 可以被 barrier 和 fence 跟踪的资源
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceRef {
    Buffer(BufferId),
    Texture(TextureId),
    Accel(AccelId),
}

impl From<BufferId> for ResourceRef {
    fn from(id: BufferId) -> Self {
        ResourceRef::Buffer(id)
    }
}

impl From<TextureId> for ResourceRef {
    fn from(id: TextureId) -> Self {
        ResourceRef::Texture(id)
    }
}

impl From<AccelId> for ResourceRef {
    fn from(id: AccelId) -> Self {
        ResourceRef::Accel(id)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub resource: ResourceRef,
    pub before: ResourceState,
    pub after: ResourceState,
}

/// 加速结构的构建输入
#[derive(Clone, Debug, PartialEq)]
pub enum AccelGeometry {
    /// position 为 float3
    Triangles {
        vertices: BufferId,
        vertex_offset: u64,
        vertex_stride: u64,
        vertex_count: u32,
        indices: BufferId,
        index_offset: u64,
        index_format: IndexFormat,
        index_count: u32,
    },
    /// buffer 中连续存放的 [`crate::gpu_types::TlasInstance`]
    Instances { instances: BufferId, offset: u64, count: u32 },
}

impl AccelGeometry {
    pub fn buffers(&self) -> Vec<BufferId> {
        match self {
            AccelGeometry::Triangles { vertices, indices, .. } => vec![*vertices, *indices],
            AccelGeometry::Instances { instances, .. } => vec![*instances],
        }
    }

    #[inline]
    pub fn primitive_count(&self) -> u32 {
        match self {
            AccelGeometry::Triangles { index_count, .. } => index_count / 3,
            AccelGeometry::Instances { count, .. } => *count,
        }
    }
}

/// shader table 中的一段区域
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct SbtRegion {
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TraceRaysDesc {
    pub tlas: AccelId,
    pub output: TextureId,
    pub constants: BufferId,
    pub shader_table: BufferId,
    pub raygen: SbtRegion,
    pub miss: SbtRegion,
    pub hit: SbtRegion,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum GpuCommand {
    CopyBuffer {
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    },
    /// buffer 中每行占 `row_pitch` 字节
    CopyBufferToTexture {
        src: BufferId,
        src_offset: u64,
        row_pitch: u64,
        dst: TextureId,
    },
    CopyTextureToBuffer {
        src: TextureId,
        dst: BufferId,
        dst_offset: u64,
        row_pitch: u64,
    },
    /// 两个纹理的尺寸与格式需要一致
    CopyTexture { src: TextureId, dst: TextureId },
    Barrier(Vec<Transition>),
    BuildAcceleration {
        dst: AccelId,
        geometry: AccelGeometry,
        scratch: BufferId,
        scratch_offset: u64,
    },
    TraceRays(TraceRaysDesc),
}

/// 提交到某个 queue 的一组命令
#[derive(Clone, Debug, Default)]
pub struct CommandList {
    label: String,
    commands: Vec<GpuCommand>,
    /// 命令没有直接出现，但 GPU 会访问的资源，例如被 TLAS 引用的 BLAS
    indirect_refs: Vec<ResourceRef>,
}

// new & init
impl CommandList {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }
}

// 录制
impl CommandList {
    #[inline]
    pub fn push(&mut self, command: GpuCommand) {
        self.commands.push(command);
    }

    /// 空的 barrier 不会被录制
    #[inline]
    pub fn barrier(&mut self, transitions: Vec<Transition>) {
        if !transitions.is_empty() {
            self.commands.push(GpuCommand::Barrier(transitions));
        }
    }

    #[inline]
    pub fn reference(&mut self, resource: impl Into<ResourceRef>) {
        self.indirect_refs.push(resource.into());
    }
}

// getters
impl CommandList {
    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    #[inline]
    pub fn indirect_refs(&self) -> &[ResourceRef] {
        &self.indirect_refs
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// 列表中所有的 barrier
    pub fn transitions(&self) -> impl DoubleEndedIterator<Item = &Transition> {
        self.commands.iter().flat_map(|cmd| match cmd {
            GpuCommand::Barrier(transitions) => transitions.as_slice(),
            _ => &[][..],
        })
    }

    /// 列表访问的所有资源，去重
    pub fn resources(&self) -> Vec<ResourceRef> {
        let mut refs = Vec::new();
        for cmd in &self.commands {
            match cmd {
                GpuCommand::CopyBuffer { src, dst, .. } => {
                    refs.push(ResourceRef::Buffer(*src));
                    refs.push(ResourceRef::Buffer(*dst));
                }
                GpuCommand::CopyBufferToTexture { src, dst, .. } => {
                    refs.push(ResourceRef::Buffer(*src));
                    refs.push(ResourceRef::Texture(*dst));
                }
                GpuCommand::CopyTextureToBuffer { src, dst, .. } => {
                    refs.push(ResourceRef::Texture(*src));
                    refs.push(ResourceRef::Buffer(*dst));
                }
                GpuCommand::CopyTexture { src, dst } => {
                    refs.push(ResourceRef::Texture(*src));
                    refs.push(ResourceRef::Texture(*dst));
                }
                GpuCommand::Barrier(transitions) => refs.extend(transitions.iter().map(|t| t.resource)),
                GpuCommand::BuildAcceleration {
                    dst, geometry, scratch, ..
                } => {
                    refs.push(ResourceRef::Accel(*dst));
                    refs.push(ResourceRef::Buffer(*scratch));
                    refs.extend(geometry.buffers().into_iter().map(ResourceRef::Buffer));
                }
                GpuCommand::TraceRays(desc) => {
                    refs.push(ResourceRef::Accel(desc.tlas));
                    refs.push(ResourceRef::Texture(desc.output));
                    refs.push(ResourceRef::Buffer(desc.constants));
                    refs.push(ResourceRef::Buffer(desc.shader_table));
                }
            }
        }
        refs.extend(self.indirect_refs.iter().copied());
        refs.into_iter().unique().collect_vec()
    }
}

#[cfg(test)]
mod tests {
    use slotmap::KeyData;

    use super::*;

    #[test]
    fn test_resources_are_deduplicated() {
        let a = BufferId::from(KeyData::from_ffi(1));
        let b = BufferId::from(KeyData::from_ffi(2));
        let mut list = CommandList::new("copy");
        list.barrier(vec![]);
        assert!(list.is_empty());

        list.barrier(vec![Transition {
            resource: a.into(),
            before: ResourceState::Undefined,
            after: ResourceState::CopySrc,
        }]);
        list.push(GpuCommand::CopyBuffer {
            src: a,
            src_offset: 0,
            dst: b,
            dst_offset: 0,
            size: 16,
        });
        list.reference(b);

        assert_eq!(list.resources(), vec![ResourceRef::Buffer(a), ResourceRef::Buffer(b)]);
        assert_eq!(list.transitions().count(), 1);
    }
}
