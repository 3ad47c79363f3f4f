use std::sync::Arc;

use glam::{Mat4, Vec3};

use crate::deformer::strongest_influences;
use crate::error::{RthsError, RthsResult};
use crate::translator::NativeBuffer;

/// 单个骨骼影响
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BoneWeight {
    pub weight: f32,
    pub index: u32,
}

/// 每个顶点最多 4 个骨骼影响，weight 需要按降序排列
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BoneWeight4 {
    pub weight: [f32; 4],
    pub index: [u32; 4],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    pub fn from_stride(stride: u32) -> Option<Self> {
        match stride {
            2 => Some(IndexFormat::U16),
            4 => Some(IndexFormat::U32),
            _ => None,
        }
    }

    #[inline]
    pub fn stride(self) -> u32 {
        match self {
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

/// 顶点与索引在 buffer 中的排布
///
/// position 是位于每个顶点 `vertex_offset` 字节处的 float3
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MeshLayout {
    pub vertex_stride: u32,
    pub vertex_count: u32,
    pub vertex_offset: u32,
    pub index_format: IndexFormat,
    pub index_count: u32,
    pub index_offset: u32,
}

impl Default for MeshLayout {
    fn default() -> Self {
        Self {
            vertex_stride: 12,
            vertex_count: 0,
            vertex_offset: 0,
            index_format: IndexFormat::U32,
            index_count: 0,
            index_offset: 0,
        }
    }
}

impl MeshLayout {
    /// 检查 layout 是否能放进给定大小的 buffer 中
    pub fn check(&self, vertex_bytes: usize, index_bytes: usize) -> RthsResult<()> {
        let position_end = self.vertex_offset.checked_add(12);
        if self.vertex_stride < 12 || position_end.is_none_or(|end| end > self.vertex_stride) {
            return Err(RthsError::contract(format!(
                "vertex stride {} with offset {} cannot hold a float3 position",
                self.vertex_stride, self.vertex_offset
            )));
        }
        if self.index_count % 3 != 0 {
            return Err(RthsError::contract(format!("index count {} is not a multiple of 3", self.index_count)));
        }
        let vertex_end = self.vertex_count as usize * self.vertex_stride as usize;
        let index_end = self.index_offset as usize + self.index_count as usize * self.index_format.stride() as usize;
        if vertex_end > vertex_bytes || index_end > index_bytes {
            return Err(RthsError::contract(format!(
                "mesh layout needs {} vertex bytes and {} index bytes, got {} and {}",
                vertex_end, index_end, vertex_bytes, index_bytes
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

/// mesh 的顶点、索引数据来源
#[derive(Clone, Debug, Default)]
pub enum MeshSource {
    #[default]
    None,
    /// CPU 内存中的数据，渲染时上传
    Cpu { vertices: Arc<[u8]>, indices: Arc<[u8]> },
    /// 宿主的 GPU buffer
    Gpu { vertices: NativeBuffer, indices: NativeBuffer },
}

#[derive(Clone, Debug, Default)]
pub struct SkinData {
    /// 每个顶点保留的骨骼数量
    pub bone_counts: Vec<u8>,
    /// 所有顶点的骨骼影响，按顶点顺序紧密排列
    pub weights: Vec<BoneWeight>,
    pub bindposes: Vec<Mat4>,
}

impl SkinData {
    #[inline]
    pub fn valid(&self) -> bool {
        !self.bone_counts.is_empty() && !self.weights.is_empty() && !self.bindposes.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct BlendshapeFrame {
    pub delta: Vec<Vec3>,
    pub weight: f32,
}

#[derive(Clone, Debug, Default)]
pub struct BlendshapeData {
    pub frames: Vec<BlendshapeFrame>,
}

/// 一个 mesh 资源
///
/// 大块数据都放在 `Arc` 中，渲染时拍快照的开销很小
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub(crate) source: MeshSource,
    pub(crate) layout: MeshLayout,
    pub(crate) skin: Arc<SkinData>,
    pub(crate) blendshapes: Arc<Vec<BlendshapeData>>,

    /// 每次几何数据变化都会增加，record cache 据此判断是否需要重建 BLAS
    pub(crate) geometry_version: u64,
}

// getters
impl MeshData {
    #[inline]
    pub fn source(&self) -> &MeshSource {
        &self.source
    }

    #[inline]
    pub fn layout(&self) -> &MeshLayout {
        &self.layout
    }

    #[inline]
    pub fn skin(&self) -> &SkinData {
        &self.skin
    }

    #[inline]
    pub fn blendshapes(&self) -> &[BlendshapeData] {
        &self.blendshapes
    }

    #[inline]
    pub fn geometry_version(&self) -> u64 {
        self.geometry_version
    }

    /// 是否需要 deformer 处理
    #[inline]
    pub fn is_deformable(&self) -> bool {
        self.skin.valid() || !self.blendshapes.is_empty()
    }
}

// setters
impl MeshData {
    pub(crate) fn set_cpu_buffers(&mut self, vertices: &[u8], indices: &[u8], layout: MeshLayout) -> RthsResult<()> {
        layout.check(vertices.len(), indices.len())?;
        self.source = MeshSource::Cpu {
            vertices: Arc::from(vertices),
            indices: Arc::from(indices),
        };
        self.layout = layout;
        self.geometry_version += 1;
        Ok(())
    }

    pub(crate) fn set_gpu_buffers(
        &mut self,
        vertices: NativeBuffer,
        indices: NativeBuffer,
        layout: MeshLayout,
    ) -> RthsResult<()> {
        layout.check(buffer_len(vertices), buffer_len(indices))?;
        self.source = MeshSource::Gpu { vertices, indices };
        self.layout = layout;
        self.geometry_version += 1;
        Ok(())
    }

    pub(crate) fn set_skin_bindposes(&mut self, bindposes: &[Mat4]) {
        Arc::make_mut(&mut self.skin).bindposes = bindposes.to_vec();
        self.geometry_version += 1;
    }

    /// 每个顶点只保留权重最大的 [`crate::deformer::MAX_INFLUENCES`] 个骨骼影响
    ///
    /// `bone_counts` 之和需要等于 `weights` 的长度
    pub(crate) fn set_skin_weights(&mut self, bone_counts: &[u8], weights: &[BoneWeight]) -> RthsResult<()> {
        let total: usize = bone_counts.iter().map(|c| *c as usize).sum();
        if total != weights.len() {
            return Err(RthsError::contract(format!(
                "bone counts add up to {} influences, got {} weights",
                total,
                weights.len()
            )));
        }

        let skin = Arc::make_mut(&mut self.skin);
        skin.bone_counts.clear();
        skin.weights.clear();
        let mut rest = weights;
        for count in bone_counts {
            let (vertex, tail) = rest.split_at(*count as usize);
            rest = tail;
            let kept = strongest_influences(vertex.iter());
            skin.bone_counts.push(kept.len() as u8);
            skin.weights.extend(kept);
        }
        self.geometry_version += 1;
        Ok(())
    }

    /// 把每个顶点固定 4 个的骨骼影响压缩成紧密排列的形式
    ///
    /// weight 需要按降序排列，遇到第一个非正的 weight 就停止
    pub(crate) fn set_skin_weights4(&mut self, weights4: &[BoneWeight4]) {
        let skin = Arc::make_mut(&mut self.skin);
        skin.bone_counts.clear();
        skin.weights.clear();
        skin.weights.reserve(weights4.len() * 4);
        for w4 in weights4 {
            let mut count = 0u8;
            for (weight, index) in w4.weight.iter().zip(w4.index.iter()) {
                if *weight <= 0.0 {
                    break;
                }
                skin.weights.push(BoneWeight {
                    weight: *weight,
                    index: *index,
                });
                count += 1;
            }
            skin.bone_counts.push(count);
        }
        skin.weights.shrink_to_fit();
        self.geometry_version += 1;
    }

    pub(crate) fn set_blendshape_count(&mut self, count: usize) {
        Arc::make_mut(&mut self.blendshapes).resize_with(count, BlendshapeData::default);
        self.geometry_version += 1;
    }

    /// `index` 最多比当前数量大 1，此时会新增一个 blendshape
    pub(crate) fn add_blendshape_frame(&mut self, index: usize, delta: &[Vec3], weight: f32) -> RthsResult<()> {
        let vertex_count = self.layout.vertex_count as usize;
        if delta.len() < vertex_count {
            return Err(RthsError::contract(format!(
                "blendshape frame has {} deltas, mesh has {} vertices",
                delta.len(),
                vertex_count
            )));
        }
        let blendshapes = Arc::make_mut(&mut self.blendshapes);
        if index > blendshapes.len() {
            return Err(RthsError::contract(format!(
                "blendshape index {} skips past the current count {}",
                index,
                blendshapes.len()
            )));
        }
        if index == blendshapes.len() {
            blendshapes.push(BlendshapeData::default());
        }
        blendshapes[index].frames.push(BlendshapeFrame {
            delta: delta[..vertex_count].to_vec(),
            weight,
        });
        self.geometry_version += 1;
        Ok(())
    }
}

fn buffer_len(buffer: NativeBuffer) -> usize {
    usize::try_from(buffer.size).unwrap_or(usize::MAX)
}

// tools
impl MeshData {
    /// 从顶点数据中解析出 position
    pub fn read_positions(layout: &MeshLayout, vertices: &[u8]) -> Vec<Vec3> {
        (0..layout.vertex_count as usize)
            .map(|i| {
                let start = i * layout.vertex_stride as usize + layout.vertex_offset as usize;
                vertices
                    .get(start..start + 12)
                    .map(|bytes| Vec3::from_array(bytemuck::pod_read_unaligned::<[f32; 3]>(bytes)))
                    .unwrap_or(Vec3::ZERO)
            })
            .collect()
    }

    /// 从索引数据中解析出三角形索引，全部转成 u32
    pub fn read_indices(layout: &MeshLayout, indices: &[u8]) -> Vec<u32> {
        let stride = layout.index_format.stride() as usize;
        (0..layout.index_count as usize)
            .map(|i| {
                let start = layout.index_offset as usize + i * stride;
                match layout.index_format {
                    IndexFormat::U16 => indices
                        .get(start..start + 2)
                        .map(|b| bytemuck::pod_read_unaligned::<u16>(b) as u32)
                        .unwrap_or(0),
                    IndexFormat::U32 => {
                        indices.get(start..start + 4).map(bytemuck::pod_read_unaligned::<u32>).unwrap_or(0)
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bw4(weight: [f32; 4]) -> BoneWeight4 {
        BoneWeight4 {
            weight,
            index: [0, 1, 2, 3],
        }
    }

    #[test]
    fn test_skin_weights4_compaction() {
        let mut mesh = MeshData::default();
        mesh.set_skin_weights4(&[
            bw4([1.0, 0.0, 0.0, 0.0]),
            bw4([0.5, 0.3, 0.2, 0.0]),
            bw4([0.4, 0.3, 0.2, 0.1]),
            bw4([0.0, 0.0, 0.0, 0.0]),
        ]);

        assert_eq!(mesh.skin().bone_counts, vec![1, 3, 4, 0]);
        let total: usize = mesh.skin().bone_counts.iter().map(|c| *c as usize).sum();
        assert_eq!(mesh.skin().weights.len(), total);
        assert_eq!(mesh.skin().weights[1], BoneWeight { weight: 0.5, index: 0 });
        assert_eq!(mesh.skin().weights[3], BoneWeight { weight: 0.2, index: 2 });
    }

    #[test]
    fn test_skin_weights4_stops_at_first_non_positive() {
        let mut mesh = MeshData::default();
        // 未排序的输入：第二个 weight 为 0，后面的正数不会被保留
        mesh.set_skin_weights4(&[bw4([0.6, 0.0, 0.4, 0.0])]);
        assert_eq!(mesh.skin().bone_counts, vec![1]);
        assert_eq!(mesh.skin().weights.len(), 1);
    }

    #[test]
    fn test_blendshape_index_gap_rejected() {
        let mut mesh = MeshData::default();
        mesh.layout.vertex_count = 2;
        let delta = [Vec3::X, Vec3::Y];

        assert!(mesh.add_blendshape_frame(0, &delta, 100.0).is_ok());
        assert!(mesh.add_blendshape_frame(0, &delta, 50.0).is_ok());
        assert!(mesh.add_blendshape_frame(1, &delta, 100.0).is_ok());
        assert!(matches!(mesh.add_blendshape_frame(3, &delta, 100.0), Err(RthsError::ContractViolation(_))));

        assert_eq!(mesh.blendshapes().len(), 2);
        assert_eq!(mesh.blendshapes()[0].frames.len(), 2);
    }

    #[test]
    fn test_skin_weights_keep_four_strongest() {
        let mut mesh = MeshData::default();
        let weights = [
            BoneWeight { weight: 1.0, index: 7 },
            BoneWeight { weight: 0.1, index: 0 },
            BoneWeight { weight: 0.3, index: 1 },
            BoneWeight { weight: 0.2, index: 2 },
            BoneWeight { weight: 0.05, index: 3 },
            BoneWeight { weight: 0.35, index: 4 },
        ];
        mesh.set_skin_weights(&[1, 5], &weights).unwrap();

        assert_eq!(mesh.skin().bone_counts, vec![1, 4]);
        let indices: Vec<u32> = mesh.skin().weights.iter().map(|w| w.index).collect();
        assert_eq!(indices, vec![7, 4, 1, 2, 0]);
    }

    #[test]
    fn test_skin_weights_count_mismatch_rejected() {
        let mut mesh = MeshData::default();
        mesh.set_skin_weights(&[1], &[BoneWeight { weight: 1.0, index: 0 }]).unwrap();
        let version = mesh.geometry_version();

        let weights = [BoneWeight { weight: 0.5, index: 0 }; 3];
        assert!(matches!(mesh.set_skin_weights(&[2, 2], &weights), Err(RthsError::ContractViolation(_))));
        assert!(matches!(mesh.set_skin_weights(&[1], &weights), Err(RthsError::ContractViolation(_))));

        // 失败时保持原来的数据
        assert_eq!(mesh.skin().bone_counts, vec![1]);
        assert_eq!(mesh.geometry_version(), version);
    }

    #[test]
    fn test_layout_offset_overflow_rejected() {
        let layout = MeshLayout {
            vertex_stride: 16,
            vertex_offset: u32::MAX - 4,
            vertex_count: 1,
            ..Default::default()
        };
        assert!(matches!(layout.check(1024, 1024), Err(RthsError::ContractViolation(_))));
    }

    #[test]
    fn test_gpu_buffers_are_checked_against_their_size() {
        let mut mesh = MeshData::default();
        let layout = MeshLayout {
            vertex_count: 3,
            index_format: IndexFormat::U16,
            index_count: 3,
            ..Default::default()
        };
        let vertices = NativeBuffer { raw: 1, size: 24 };
        let indices = NativeBuffer { raw: 2, size: 6 };
        assert!(mesh.set_gpu_buffers(vertices, indices, layout).is_err());
        assert!(matches!(mesh.source(), MeshSource::None));

        let vertices = NativeBuffer { raw: 1, size: 36 };
        assert!(mesh.set_gpu_buffers(vertices, indices, layout).is_ok());
        assert_eq!(mesh.geometry_version(), 1);
    }

    #[test]
    fn test_read_positions_and_indices() {
        let layout = MeshLayout {
            vertex_stride: 16,
            vertex_count: 2,
            vertex_offset: 4,
            index_format: IndexFormat::U16,
            index_count: 3,
            index_offset: 2,
        };
        let mut vertices = vec![0u8; 32];
        vertices[4..16].copy_from_slice(bytemuck::cast_slice(&[1.0f32, 2.0, 3.0]));
        vertices[20..32].copy_from_slice(bytemuck::cast_slice(&[4.0f32, 5.0, 6.0]));
        let indices: Vec<u8> = bytemuck::cast_slice(&[9u16, 0, 1, 1]).to_vec();

        assert_eq!(MeshData::read_positions(&layout, &vertices), vec![Vec3::new(1.0, 2.0, 3.0), Vec3::new(4.0, 5.0, 6.0)]);
        assert_eq!(MeshData::read_indices(&layout, &indices), vec![0, 1, 1]);
        assert!(layout.check(vertices.len(), indices.len()).is_ok());
        assert!(layout.check(16, indices.len()).is_err());
    }
}
