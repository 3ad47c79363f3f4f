//! 蒙皮与 blendshape
//!
//! 输出只依赖 mesh 与 instance 的数据，相同的输入得到逐位相同的结果。

use glam::{Mat4, Vec3};
use itertools::Itertools;
use rayon::prelude::*;

use crate::host::{BlendshapeData, BoneWeight, MeshData, MeshInstanceData};

/// 每个顶点最多使用的骨骼数量
pub const MAX_INFLUENCES: usize = 4;

/// deformer 的输出
#[derive(Clone, Debug, PartialEq)]
pub struct Deformed {
    pub positions: Vec<Vec3>,
    /// 蒙皮之后顶点已经位于世界空间，TLAS 中使用单位变换
    pub world_space: bool,
}

/// 对 `base` 中的顶点依次应用 blendshape 与蒙皮
pub fn deform(mesh: &MeshData, instance: &MeshInstanceData, base: &[Vec3], clamp_weights: bool) -> Deformed {
    let _span = tracy_client::span!("deform");
    let vertex_count = mesh.layout().vertex_count as usize;
    let mut positions = base.iter().copied().take(vertex_count).collect_vec();
    positions.resize(vertex_count, Vec3::ZERO);

    for (blendshape, weight) in mesh.blendshapes().iter().zip(instance.blendshape_weights()) {
        apply_blendshape(&mut positions, blendshape, *weight, clamp_weights);
    }

    let skin = mesh.skin();
    let world_space = skin.valid() && !instance.bones().is_empty();
    if world_space {
        let matrices = instance
            .bones()
            .iter()
            .zip(skin.bindposes.iter().chain(std::iter::repeat(&Mat4::IDENTITY)))
            .map(|(bone, bindpose)| *bone * *bindpose)
            .collect_vec();

        // 每个顶点的骨骼影响在 weights 中的起始位置
        let offsets = skin
            .bone_counts
            .iter()
            .scan(0usize, |acc, c| {
                let start = *acc;
                *acc += *c as usize;
                Some(start)
            })
            .collect_vec();

        positions.par_iter_mut().enumerate().for_each(|(vi, p)| {
            let (Some(start), Some(count)) = (offsets.get(vi), skin.bone_counts.get(vi)) else {
                return;
            };
            let influences = skin.weights.iter().skip(*start).take(*count as usize);
            let mut skinned = Vec3::ZERO;
            let mut total = 0.0;
            for w in strongest_influences(influences) {
                if let Some(m) = matrices.get(w.index as usize) {
                    skinned += m.transform_point3(*p) * w.weight;
                    total += w.weight;
                }
            }
            // 保留下来的 weight 之和不一定为 1
            if total > 0.0 {
                *p = skinned / total;
            }
        });
    }

    Deformed { positions, world_space }
}

/// 权重最大的 [`MAX_INFLUENCES`] 个正的骨骼影响，weight 相同时按骨骼序号排序
pub(crate) fn strongest_influences<'a>(influences: impl Iterator<Item = &'a BoneWeight>) -> Vec<BoneWeight> {
    influences
        .filter(|w| w.weight > 0.0)
        .copied()
        .sorted_by(|a, b| b.weight.total_cmp(&a.weight).then(a.index.cmp(&b.index)))
        .take(MAX_INFLUENCES)
        .collect_vec()
}

/// 按 weight 在相邻的两帧之间插值
fn apply_blendshape(positions: &mut [Vec3], blendshape: &BlendshapeData, weight: f32, clamp: bool) {
    let frames = &blendshape.frames;
    let Some(last) = frames.last() else {
        return;
    };
    let weight = if clamp { weight.clamp(0.0, last.weight) } else { weight };
    if weight == 0.0 {
        return;
    }

    // 第一帧之前从 0 开始插值，最后一帧之后沿最后一段外推
    let hi = frames.iter().position(|f| weight <= f.weight).unwrap_or(frames.len() - 1);
    let lo = hi.checked_sub(1).map(|i| &frames[i]);
    let upper_frame = &frames[hi];
    let w0 = lo.map_or(0.0, |f| f.weight);
    let span = upper_frame.weight - w0;
    if span == 0.0 {
        return;
    }
    let t = (weight - w0) / span;

    for (i, p) in positions.iter_mut().enumerate() {
        let a = lo.and_then(|f| f.delta.get(i)).copied().unwrap_or(Vec3::ZERO);
        let b = upper_frame.delta.get(i).copied().unwrap_or(Vec3::ZERO);
        *p += a + (b - a) * t;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::MeshHandle;
    use crate::host::{BoneWeight4, MeshLayout};

    fn mesh_with_vertices(count: u32) -> MeshData {
        let mut mesh = MeshData::default();
        mesh.layout = MeshLayout {
            vertex_count: count,
            ..Default::default()
        };
        mesh
    }

    #[test]
    fn test_blendshape_interpolates_between_frames() {
        let mut mesh = mesh_with_vertices(1);
        mesh.add_blendshape_frame(0, &[Vec3::X], 50.0).unwrap();
        mesh.add_blendshape_frame(0, &[Vec3::X * 3.0], 100.0).unwrap();

        let mut inst = MeshInstanceData::new(MeshHandle::default());
        let base = [Vec3::ZERO];

        inst.set_blendshape_weights(&[25.0]);
        assert_eq!(deform(&mesh, &inst, &base, false).positions, vec![Vec3::X * 0.5]);

        inst.set_blendshape_weights(&[75.0]);
        assert_eq!(deform(&mesh, &inst, &base, false).positions, vec![Vec3::X * 2.0]);

        // 超出最后一帧时外推，clamp 之后停在最后一帧
        inst.set_blendshape_weights(&[150.0]);
        assert_eq!(deform(&mesh, &inst, &base, false).positions, vec![Vec3::X * 5.0]);
        assert_eq!(deform(&mesh, &inst, &base, true).positions, vec![Vec3::X * 3.0]);
    }

    #[test]
    fn test_single_frame_scales_linearly() {
        let mut mesh = mesh_with_vertices(2);
        mesh.add_blendshape_frame(0, &[Vec3::Y, Vec3::Z], 100.0).unwrap();
        let mut inst = MeshInstanceData::new(MeshHandle::default());
        inst.set_blendshape_weights(&[50.0]);
        let out = deform(&mesh, &inst, &[Vec3::ONE, Vec3::ZERO], false);
        assert_eq!(out.positions, vec![Vec3::new(1.0, 1.5, 1.0), Vec3::new(0.0, 0.0, 0.5)]);
        assert!(!out.world_space);
    }

    #[test]
    fn test_skinning_blends_bones() {
        let mut mesh = mesh_with_vertices(2);
        mesh.set_skin_bindposes(&[Mat4::IDENTITY, Mat4::IDENTITY]);
        mesh.set_skin_weights4(&[
            BoneWeight4 {
                weight: [1.0, 0.0, 0.0, 0.0],
                index: [0, 0, 0, 0],
            },
            BoneWeight4 {
                weight: [0.5, 0.5, 0.0, 0.0],
                index: [0, 1, 0, 0],
            },
        ]);
        let mut inst = MeshInstanceData::new(MeshHandle::default());
        inst.set_bones(&[Mat4::from_translation(Vec3::X * 2.0), Mat4::from_translation(Vec3::Y * 4.0)]);

        let base = [Vec3::ZERO, Vec3::ZERO];
        let out = deform(&mesh, &inst, &base, false);
        assert!(out.world_space);
        assert_eq!(out.positions, vec![Vec3::new(2.0, 0.0, 0.0), Vec3::new(1.0, 2.0, 0.0)]);

        // 相同的输入得到相同的输出
        assert_eq!(deform(&mesh, &inst, &base, false), out);
    }

    fn skinned_single_vertex(bone_count: usize, weights: &[BoneWeight]) -> (MeshData, MeshInstanceData) {
        let mut mesh = mesh_with_vertices(1);
        mesh.set_skin_bindposes(&vec![Mat4::IDENTITY; bone_count]);
        mesh.set_skin_weights(&[weights.len() as u8], weights).unwrap();
        let mut inst = MeshInstanceData::new(MeshHandle::default());
        inst.set_bones(&vec![Mat4::IDENTITY; bone_count]);
        (mesh, inst)
    }

    #[test]
    fn test_identity_pose_with_five_influences_keeps_vertex() {
        let weights = (0..5).map(|i| BoneWeight { weight: 0.2, index: i }).collect_vec();
        let (mesh, inst) = skinned_single_vertex(5, &weights);
        assert_eq!(mesh.skin().bone_counts, vec![4]);

        let out = deform(&mesh, &inst, &[Vec3::new(10.0, 0.0, 0.0)], false);
        assert!(out.positions[0].abs_diff_eq(Vec3::new(10.0, 0.0, 0.0), 1e-5));
    }

    #[test]
    fn test_partial_weights_are_renormalized() {
        let weights = [BoneWeight { weight: 0.25, index: 0 }, BoneWeight { weight: 0.25, index: 1 }];
        let (mesh, mut inst) = skinned_single_vertex(2, &weights);
        inst.set_bones(&[Mat4::from_translation(Vec3::X * 2.0), Mat4::from_translation(Vec3::Y * 4.0)]);

        let out = deform(&mesh, &inst, &[Vec3::ZERO], false);
        assert!(out.positions[0].abs_diff_eq(Vec3::new(1.0, 2.0, 0.0), 1e-5));
    }

    #[test]
    fn test_strongest_influences_are_kept() {
        let weights = [
            BoneWeight { weight: 0.05, index: 0 },
            BoneWeight { weight: 0.3, index: 1 },
            BoneWeight { weight: 0.0, index: 2 },
            BoneWeight { weight: 0.2, index: 3 },
            BoneWeight { weight: 0.25, index: 4 },
            BoneWeight { weight: 0.2, index: 5 },
        ];
        let kept = strongest_influences(weights.iter()).iter().map(|w| w.index).collect_vec();
        assert_eq!(kept, vec![1, 4, 3, 5]);
    }
}
