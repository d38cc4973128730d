//! Binary STL export.
//!
//! ```text
//! UINT8[80]    – Header (ignored by readers)
//! UINT32       – Number of triangles
//! foreach triangle
//!     REAL32[3] – Unit normal
//!     REAL32[3] – Vertex 1
//!     REAL32[3] – Vertex 2
//!     REAL32[3] – Vertex 3
//!     UINT16    – Attribute byte count (0)
//! end
//! ```

use super::IndexedMesh;

pub const HEADER_SIZE: usize = 80;
pub const TRIANGLE_SIZE: usize = 50;

/// Exact file size for `triangles` facets.
pub fn binary_stl_len(triangles: usize) -> usize {
    HEADER_SIZE + 4 + triangles * TRIANGLE_SIZE
}

/// Triangle count declared in a binary STL, if the header is present.
pub fn declared_triangles(bytes: &[u8]) -> Option<u32> {
    bytes
        .get(HEADER_SIZE..HEADER_SIZE + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn write_binary_stl(mesh: &IndexedMesh) -> Vec<u8> {
    let mut out = Vec::with_capacity(binary_stl_len(mesh.faces.len()));

    let mut header = [b' '; HEADER_SIZE];
    let text = b"printforge binary STL (mm)";
    header[..text.len()].copy_from_slice(text);
    out.extend_from_slice(&header);
    out.extend_from_slice(&(mesh.faces.len() as u32).to_le_bytes());

    for &[i0, i1, i2] in &mesh.faces {
        let v0 = mesh.vertices[i0 as usize];
        let v1 = mesh.vertices[i1 as usize];
        let v2 = mesh.vertices[i2 as usize];
        for c in unit_normal(v0, v1, v2) {
            out.extend_from_slice(&(c as f32).to_le_bytes());
        }
        for v in [v0, v1, v2] {
            for c in v {
                out.extend_from_slice(&(c as f32).to_le_bytes());
            }
        }
        out.extend_from_slice(&0u16.to_le_bytes());
    }
    out
}

fn unit_normal(a: [f64; 3], b: [f64; 3], c: [f64; 3]) -> [f64; 3] {
    let e1 = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let e2 = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
    let n = [
        e1[1] * e2[2] - e1[2] * e2[1],
        e1[2] * e2[0] - e1[0] * e2[2],
        e1[0] * e2[1] - e1[1] * e2[0],
    ];
    let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
    if len > f64::EPSILON {
        [n[0] / len, n[1] / len, n[2] / len]
    } else {
        [0.0, 0.0, 0.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> IndexedMesh {
        IndexedMesh {
            vertices: vec![[0.0, 0.0, 0.0], [2.0, 0.0, 0.0], [0.0, 2.0, 0.0]],
            faces: vec![[0, 1, 2]],
        }
    }

    #[test]
    fn layout_matches_binary_stl() {
        let bytes = write_binary_stl(&triangle());
        assert_eq!(bytes.len(), 134);
        assert_eq!(bytes.len(), binary_stl_len(1));
        assert_eq!(declared_triangles(&bytes), Some(1));
        assert!(bytes.starts_with(b"printforge"));

        let f = |at: usize| f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        // normal of a CCW triangle in the XY plane is +Z
        assert_eq!((f(84), f(88), f(92)), (0.0, 0.0, 1.0));
        // second vertex
        assert_eq!((f(108), f(112), f(116)), (2.0, 0.0, 0.0));
        assert_eq!(&bytes[132..134], &[0, 0]);
    }

    #[test]
    fn degenerate_face_gets_zero_normal() {
        assert_eq!(
            unit_normal([0.0; 3], [1.0, 1.0, 1.0], [2.0, 2.0, 2.0]),
            [0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn declared_triangles_needs_header() {
        assert_eq!(declared_triangles(&[0u8; 40]), None);
    }
}
