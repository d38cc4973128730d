//! Triangle mesh handling for the normalization stage.
//!
//! - `decode`: raw service output (GLB, binary STL, OBJ) into an [`IndexedMesh`].
//! - `normalize`: center and rescale to the category's print size.
//! - `stl`: binary STL export.

pub mod decode;
pub mod normalize;
pub mod stl;

pub use decode::{decode_mesh, MeshFormat};
pub use normalize::{normalize, NormalizeReport};

/// Indexed triangle mesh in model units.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexedMesh {
    pub vertices: Vec<[f64; 3]>,
    pub faces: Vec<[u32; 3]>,
}

impl IndexedMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(vertices: usize, faces: usize) -> Self {
        Self {
            vertices: Vec::with_capacity(vertices),
            faces: Vec::with_capacity(faces),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Append another mesh, re-basing its indices.
    pub fn append(&mut self, other: IndexedMesh) {
        let base = self.vertices.len() as u32;
        self.vertices.extend(other.vertices);
        self.faces
            .extend(other.faces.into_iter().map(|[a, b, c]| [a + base, b + base, c + base]));
    }

    pub fn bounds(&self) -> Option<Aabb> {
        let mut iter = self.vertices.iter();
        let first = *iter.next()?;
        let mut aabb = Aabb {
            min: first,
            max: first,
        };
        for v in iter {
            for axis in 0..3 {
                aabb.min[axis] = aabb.min[axis].min(v[axis]);
                aabb.max[axis] = aabb.max[axis].max(v[axis]);
            }
        }
        Some(aabb)
    }

    /// True when every edge, after welding coincident vertices, is shared by
    /// exactly two faces.
    pub fn is_watertight(&self) -> bool {
        use std::collections::HashMap;

        if self.faces.is_empty() {
            return false;
        }
        let mut welded: HashMap<[i64; 3], u32> = HashMap::new();
        let remap: Vec<u32> = self
            .vertices
            .iter()
            .map(|v| {
                let key = [quantize(v[0]), quantize(v[1]), quantize(v[2])];
                let next = welded.len() as u32;
                *welded.entry(key).or_insert(next)
            })
            .collect();

        let mut edges: HashMap<(u32, u32), u32> = HashMap::new();
        for face in &self.faces {
            let f = [
                remap[face[0] as usize],
                remap[face[1] as usize],
                remap[face[2] as usize],
            ];
            if f[0] == f[1] || f[1] == f[2] || f[0] == f[2] {
                continue;
            }
            for (a, b) in [(f[0], f[1]), (f[1], f[2]), (f[2], f[0])] {
                *edges.entry((a.min(b), a.max(b))).or_insert(0) += 1;
            }
        }
        !edges.is_empty() && edges.values().all(|&n| n == 2)
    }
}

fn quantize(x: f64) -> i64 {
    (x * 1e6).round() as i64
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Aabb {
    pub fn extents(&self) -> [f64; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    pub fn center(&self) -> [f64; 3] {
        [
            (self.max[0] + self.min[0]) * 0.5,
            (self.max[1] + self.min[1]) * 0.5,
            (self.max[2] + self.min[2]) * 0.5,
        ]
    }

    pub fn longest_axis(&self) -> f64 {
        let e = self.extents();
        e[0].max(e[1]).max(e[2])
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::IndexedMesh;

    /// Axis-aligned cube with each side split into `n` x `n` quads.
    pub fn subdivided_cube(min: f64, max: f64, n: u32) -> IndexedMesh {
        let mut mesh = IndexedMesh::new();
        let step = (max - min) / n as f64;
        // (fixed axis, fixed value, u axis, v axis, flip winding)
        let sides = [
            (0usize, min, 1usize, 2usize, true),
            (0, max, 1, 2, false),
            (1, min, 2, 0, true),
            (1, max, 2, 0, false),
            (2, min, 0, 1, true),
            (2, max, 0, 1, false),
        ];
        for (axis, value, u, v, flip) in sides {
            let base = mesh.vertices.len() as u32;
            for i in 0..=n {
                for j in 0..=n {
                    let mut p = [0.0; 3];
                    p[axis] = value;
                    p[u] = min + step * i as f64;
                    p[v] = min + step * j as f64;
                    mesh.vertices.push(p);
                }
            }
            let idx = |i: u32, j: u32| base + i * (n + 1) + j;
            for i in 0..n {
                for j in 0..n {
                    let (a, b, c, d) = (idx(i, j), idx(i + 1, j), idx(i + 1, j + 1), idx(i, j + 1));
                    if flip {
                        mesh.faces.push([a, c, b]);
                        mesh.faces.push([a, d, c]);
                    } else {
                        mesh.faces.push([a, b, c]);
                        mesh.faces.push([a, c, d]);
                    }
                }
            }
        }
        mesh
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::subdivided_cube;
    use super::*;

    #[test]
    fn bounds_of_unit_cube() {
        let mesh = subdivided_cube(-0.5, 0.5, 1);
        let b = mesh.bounds().unwrap();
        assert_eq!(b.min, [-0.5, -0.5, -0.5]);
        assert_eq!(b.max, [0.5, 0.5, 0.5]);
        assert_eq!(b.center(), [0.0, 0.0, 0.0]);
        assert_eq!(b.longest_axis(), 1.0);
        assert!(IndexedMesh::new().bounds().is_none());
    }

    #[test]
    fn closed_cube_is_watertight_even_with_split_seams() {
        let mesh = subdivided_cube(0.0, 2.0, 3);
        assert_eq!(mesh.faces.len(), 6 * 3 * 3 * 2);
        assert!(mesh.is_watertight());
    }

    #[test]
    fn cube_missing_a_face_is_open() {
        let mut mesh = subdivided_cube(0.0, 1.0, 2);
        mesh.faces.truncate(mesh.faces.len() - 2);
        assert!(!mesh.is_watertight());
        assert!(!IndexedMesh::new().is_watertight());
    }

    #[test]
    fn append_rebases_indices() {
        let mut a = subdivided_cube(0.0, 1.0, 1);
        let b = subdivided_cube(2.0, 3.0, 1);
        let verts = a.vertices.len() as u32;
        a.append(b);
        assert_eq!(a.faces.len(), 24);
        assert!(a.faces[12..].iter().all(|f| f.iter().all(|&i| i >= verts)));
    }
}
