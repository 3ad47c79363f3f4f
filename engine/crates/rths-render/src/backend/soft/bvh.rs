//! CPU 上的 BVH，BLAS 与 TLAS 共用

use glam::{Mat4, Vec3};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Aabb = Aabb {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    pub fn from_points(points: &[Vec3]) -> Self {
        points.iter().fold(Self::EMPTY, |aabb, p| aabb.grow(*p))
    }

    #[inline]
    pub fn grow(self, p: Vec3) -> Self {
        Self {
            min: self.min.min(p),
            max: self.max.max(p),
        }
    }

    #[inline]
    pub fn union(self, other: Aabb) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    #[inline]
    pub fn centroid(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// 经过仿射变换之后的包围盒
    pub fn transformed(&self, m: &Mat4) -> Self {
        if self.is_empty() {
            return *self;
        }
        let mut out = Self::EMPTY;
        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            out = out.grow(m.transform_point3(corner));
        }
        out
    }

    /// slab test，返回进入包围盒时的 t
    pub fn intersect(&self, ray: &Ray, t_max: f32) -> Option<f32> {
        let inv = ray.direction.recip();
        let t0 = (self.min - ray.origin) * inv;
        let t1 = (self.max - ray.origin) * inv;
        let near = t0.min(t1).max_element().max(ray.t_min);
        let far = t0.max(t1).min_element().min(t_max);
        if near <= far { Some(near) } else { None }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    /// 不需要归一化
    pub direction: Vec3,
    pub t_min: f32,
    pub t_max: f32,
}

impl Ray {
    #[inline]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// 变换到另一个空间，t 的含义保持不变
    #[inline]
    pub fn transformed(&self, m: &Mat4) -> Self {
        Self {
            origin: m.transform_point3(self.origin),
            direction: m.transform_vector3(self.direction),
            ..*self
        }
    }
}

/// 三角形求交的结果
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TriangleHit {
    pub t: f32,
    /// 从射线起点看过去，顶点是否为逆时针
    pub front_face: bool,
}

/// Möller–Trumbore
pub fn intersect_triangle(ray: &Ray, v0: Vec3, v1: Vec3, v2: Vec3, t_max: f32) -> Option<TriangleHit> {
    let e1 = v1 - v0;
    let e2 = v2 - v0;
    let p = ray.direction.cross(e2);
    let det = e1.dot(p);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = ray.origin - v0;
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = ray.direction.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv_det;
    if t < ray.t_min || t > t_max {
        return None;
    }
    // det > 0 表示法线 e1 x e2 朝向射线起点
    Some(TriangleHit { t, front_face: det > 0.0 })
}

/// 遍历时对每个候选图元的处理结果
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Visit {
    Miss,
    /// 接受这次相交，之后只寻找更近的
    Hit(f32),
    /// 结束遍历
    Terminate,
}

#[derive(Debug, Clone)]
enum BvhNode {
    Leaf { aabb: Aabb, items: Vec<u32> },
    Internal { aabb: Aabb, left: Box<BvhNode>, right: Box<BvhNode> },
}

impl BvhNode {
    #[inline]
    fn aabb(&self) -> &Aabb {
        match self {
            BvhNode::Leaf { aabb, .. } | BvhNode::Internal { aabb, .. } => aabb,
        }
    }
}

const LEAF_SIZE: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct Bvh {
    root: Option<BvhNode>,
}

impl Bvh {
    /// 按包围盒中心在最长轴上的中位数划分
    pub fn build(bounds: &[Aabb]) -> Self {
        let mut items: Vec<(u32, Aabb, Vec3)> = bounds
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty())
            .map(|(i, b)| (i as u32, *b, b.centroid()))
            .collect();
        let root = if items.is_empty() { None } else { Some(build_node(&mut items)) };
        Self { root }
    }

    pub fn bounds(&self) -> Aabb {
        self.root.as_ref().map(|n| *n.aabb()).unwrap_or(Aabb::EMPTY)
    }

    /// 按从近到远的顺序访问射线可能命中的图元
    ///
    /// `visit` 收到图元下标和当前的 t_max
    pub fn traverse(&self, ray: &Ray, mut visit: impl FnMut(u32, f32) -> Visit) {
        let mut t_max = ray.t_max;
        if let Some(root) = &self.root {
            traverse_node(root, ray, &mut t_max, &mut visit);
        }
    }
}

/// 返回 false 表示需要终止遍历
fn traverse_node(node: &BvhNode, ray: &Ray, t_max: &mut f32, visit: &mut impl FnMut(u32, f32) -> Visit) -> bool {
    if node.aabb().intersect(ray, *t_max).is_none() {
        return true;
    }
    match node {
        BvhNode::Leaf { items, .. } => {
            for item in items {
                match visit(*item, *t_max) {
                    Visit::Miss => {}
                    Visit::Hit(t) => *t_max = t_max.min(t),
                    Visit::Terminate => return false,
                }
            }
            true
        }
        BvhNode::Internal { left, right, .. } => {
            let lt = left.aabb().intersect(ray, *t_max);
            let rt = right.aabb().intersect(ray, *t_max);
            let (first, second) = match (lt, rt) {
                (Some(l), Some(r)) if r < l => (right, left),
                _ => (left, right),
            };
            traverse_node(first, ray, t_max, visit) && traverse_node(second, ray, t_max, visit)
        }
    }
}

fn build_node(items: &mut [(u32, Aabb, Vec3)]) -> BvhNode {
    let aabb = items.iter().fold(Aabb::EMPTY, |acc, (_, b, _)| acc.union(*b));
    if items.len() <= LEAF_SIZE {
        return BvhNode::Leaf {
            aabb,
            items: items.iter().map(|(i, _, _)| *i).collect(),
        };
    }

    let centroids = items.iter().fold(Aabb::EMPTY, |acc, (_, _, c)| acc.grow(*c));
    let extent = centroids.max - centroids.min;
    let axis = if extent.x >= extent.y && extent.x >= extent.z {
        0
    } else if extent.y >= extent.z {
        1
    } else {
        2
    };

    // 下标作为第二关键字，保证构建结果是确定的
    items.sort_by(|a, b| a.2[axis].total_cmp(&b.2[axis]).then(a.0.cmp(&b.0)));
    let mid = items.len() / 2;
    let (left, right) = items.split_at_mut(mid);
    BvhNode::Internal {
        aabb,
        left: Box::new(build_node(left)),
        right: Box::new(build_node(right)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ray(origin: Vec3, direction: Vec3) -> Ray {
        Ray {
            origin,
            direction,
            t_min: 0.0,
            t_max: f32::INFINITY,
        }
    }

    #[test]
    fn test_triangle_facing() {
        let (v0, v1, v2) = (Vec3::new(-1.0, -1.0, 0.0), Vec3::new(1.0, -1.0, 0.0), Vec3::new(0.0, 1.0, 0.0));
        // 从 +z 看过去是逆时针
        let hit = intersect_triangle(&ray(Vec3::Z * 2.0, -Vec3::Z), v0, v1, v2, f32::INFINITY).unwrap();
        assert!(hit.front_face);
        assert!((hit.t - 2.0).abs() < 1e-6);

        let back = intersect_triangle(&ray(-Vec3::Z * 2.0, Vec3::Z), v0, v1, v2, f32::INFINITY).unwrap();
        assert!(!back.front_face);

        assert!(intersect_triangle(&ray(Vec3::new(5.0, 0.0, 2.0), -Vec3::Z), v0, v1, v2, f32::INFINITY).is_none());
        assert!(intersect_triangle(&ray(Vec3::Z * 2.0, -Vec3::Z), v0, v1, v2, 1.0).is_none());
    }

    #[test]
    fn test_closest_hit_traversal() {
        // 沿 z 轴排列的单位盒子
        let bounds: Vec<Aabb> = (0..20)
            .map(|i| Aabb {
                min: Vec3::new(-0.5, -0.5, i as f32),
                max: Vec3::new(0.5, 0.5, i as f32 + 0.5),
            })
            .collect();
        let bvh = Bvh::build(&bounds);
        assert_eq!(bvh.bounds().max.z, 19.5);

        let r = ray(Vec3::new(0.0, 0.0, 30.0), -Vec3::Z);
        let mut closest = None;
        bvh.traverse(&r, |i, t_max| {
            let t = 30.0 - (i as f32 + 0.5);
            if t < t_max {
                closest = Some(i);
                Visit::Hit(t)
            } else {
                Visit::Miss
            }
        });
        assert_eq!(closest, Some(19));

        let mut visited = 0;
        bvh.traverse(&r, |_, _| {
            visited += 1;
            Visit::Terminate
        });
        assert_eq!(visited, 1);
    }

    #[test]
    fn test_transformed_bounds() {
        let aabb = Aabb::from_points(&[Vec3::ZERO, Vec3::ONE]);
        let moved = aabb.transformed(&Mat4::from_translation(Vec3::new(2.0, 0.0, 0.0)));
        assert_eq!(moved.min, Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(moved.max, Vec3::new(3.0, 1.0, 1.0));
        assert!(Aabb::EMPTY.is_empty());
    }
}
