//! Decoders for the mesh formats reconstruction services return.
//!
//! Binary glTF is what image-to-3D services usually produce; binary/ASCII STL
//! and OBJ are accepted as well. Only geometry is read: textures, normals and
//! the scene graph are ignored, and every triangle primitive of every mesh is
//! concatenated into one indexed mesh.

use super::IndexedMesh;
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

const GLB_MAGIC: &[u8; 4] = b"glTF";
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;

const STL_HEADER: usize = 80;
const STL_TRIANGLE: usize = 50;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("unrecognized mesh format")]
    UnknownFormat,
    #[error("truncated {format} data: {detail}")]
    Truncated { format: &'static str, detail: String },
    #[error("invalid glTF: {0}")]
    Gltf(String),
    #[error("invalid OBJ at line {line}: {detail}")]
    Obj { line: usize, detail: String },
    #[error("mesh contains no triangles")]
    Empty,
    #[error("mesh has zero extent")]
    Degenerate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshFormat {
    Glb,
    StlBinary,
    StlAscii,
    Obj,
}

impl MeshFormat {
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.len() >= 12 && &bytes[..4] == GLB_MAGIC {
            return Some(MeshFormat::Glb);
        }
        if bytes.len() >= STL_HEADER + 4 {
            let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
            if count
                .checked_mul(STL_TRIANGLE)
                .and_then(|n| n.checked_add(STL_HEADER + 4))
                == Some(bytes.len())
            {
                return Some(MeshFormat::StlBinary);
            }
        }
        let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]);
        let trimmed = head.trim_start();
        if trimmed.starts_with("solid") && head.contains("facet") {
            return Some(MeshFormat::StlAscii);
        }
        if head
            .lines()
            .any(|l| l.starts_with("v ") || l.starts_with("o ") || l.starts_with("mtllib"))
        {
            return Some(MeshFormat::Obj);
        }
        None
    }
}

/// Decode whatever the reconstruction service returned.
pub fn decode_mesh(bytes: &[u8]) -> Result<(IndexedMesh, MeshFormat), MeshError> {
    let format = MeshFormat::sniff(bytes).ok_or(MeshError::UnknownFormat)?;
    let mesh = match format {
        MeshFormat::Glb => decode_glb(bytes)?,
        MeshFormat::StlBinary => decode_stl_binary(bytes)?,
        MeshFormat::StlAscii => decode_stl_ascii(bytes)?,
        MeshFormat::Obj => decode_obj(bytes)?,
    };
    if mesh.is_empty() {
        return Err(MeshError::Empty);
    }
    Ok((mesh, format))
}

fn le_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn le_f32(bytes: &[u8], at: usize) -> Option<f32> {
    bytes
        .get(at..at + 4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GltfDoc {
    #[serde(default)]
    meshes: Vec<GltfMesh>,
    #[serde(default)]
    accessors: Vec<Accessor>,
    #[serde(default)]
    buffer_views: Vec<BufferView>,
    #[serde(default)]
    extensions_required: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GltfMesh {
    #[serde(default)]
    primitives: Vec<Primitive>,
}

#[derive(Debug, Deserialize)]
struct Primitive {
    attributes: HashMap<String, usize>,
    indices: Option<usize>,
    mode: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Accessor {
    buffer_view: Option<usize>,
    #[serde(default)]
    byte_offset: usize,
    component_type: u32,
    count: usize,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BufferView {
    buffer: usize,
    #[serde(default)]
    byte_offset: usize,
    byte_length: usize,
    byte_stride: Option<usize>,
}

fn decode_glb(bytes: &[u8]) -> Result<IndexedMesh, MeshError> {
    let truncated = |detail: &str| MeshError::Truncated {
        format: "glb",
        detail: detail.to_string(),
    };
    let declared = le_u32(bytes, 8).ok_or_else(|| truncated("header"))? as usize;
    let end = declared.min(bytes.len());

    let mut json: Option<&[u8]> = None;
    let mut bin: Option<&[u8]> = None;
    let mut at = 12;
    while at + 8 <= end {
        let len = le_u32(bytes, at).ok_or_else(|| truncated("chunk header"))? as usize;
        let kind = le_u32(bytes, at + 4).ok_or_else(|| truncated("chunk header"))?;
        let data = bytes
            .get(at + 8..at + 8 + len)
            .ok_or_else(|| truncated("chunk body"))?;
        match kind {
            CHUNK_JSON if json.is_none() => json = Some(data),
            CHUNK_BIN if bin.is_none() => bin = Some(data),
            _ => {}
        }
        at += 8 + len;
    }

    let json = json.ok_or_else(|| MeshError::Gltf("missing JSON chunk".into()))?;
    let doc: GltfDoc =
        serde_json::from_slice(json).map_err(|e| MeshError::Gltf(format!("bad JSON chunk: {}", e)))?;
    if let Some(ext) = doc.extensions_required.first() {
        return Err(MeshError::Gltf(format!("unsupported required extension {}", ext)));
    }
    let bin = bin.unwrap_or(&[]);

    let mut out = IndexedMesh::new();
    for mesh in &doc.meshes {
        for prim in &mesh.primitives {
            let mode = prim.mode.unwrap_or(4);
            if !matches!(mode, 4..=6) {
                continue;
            }
            let pos = *prim
                .attributes
                .get("POSITION")
                .ok_or_else(|| MeshError::Gltf("primitive without POSITION".into()))?;
            let positions = read_positions(&doc, bin, pos)?;
            let count = positions.len() as u32;
            let indices = match prim.indices {
                Some(idx) => read_indices(&doc, bin, idx)?,
                None => (0..count).collect(),
            };
            if let Some(bad) = indices.iter().find(|&&i| i >= count) {
                return Err(MeshError::Gltf(format!("index {} out of range", bad)));
            }
            let faces = assemble(mode, &indices);
            out.append(IndexedMesh {
                vertices: positions,
                faces,
            });
        }
    }
    Ok(out)
}

fn assemble(mode: u32, idx: &[u32]) -> Vec<[u32; 3]> {
    match mode {
        5 => (2..idx.len())
            .map(|i| {
                if i % 2 == 0 {
                    [idx[i - 2], idx[i - 1], idx[i]]
                } else {
                    [idx[i - 1], idx[i - 2], idx[i]]
                }
            })
            .collect(),
        6 => (2..idx.len()).map(|i| [idx[0], idx[i - 1], idx[i]]).collect(),
        _ => idx.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect(),
    }
}

/// Slice of the BIN chunk an accessor reads from, plus its element stride.
fn accessor_span<'a>(
    doc: &GltfDoc,
    bin: &'a [u8],
    accessor: &Accessor,
    element: usize,
) -> Result<(&'a [u8], usize), MeshError> {
    let view_idx = accessor
        .buffer_view
        .ok_or_else(|| MeshError::Gltf("sparse/empty accessors are not supported".into()))?;
    let view = doc
        .buffer_views
        .get(view_idx)
        .ok_or_else(|| MeshError::Gltf(format!("bufferView {} missing", view_idx)))?;
    if view.buffer != 0 {
        return Err(MeshError::Gltf("external buffers are not supported".into()));
    }
    let exceeds = || MeshError::Truncated {
        format: "glb",
        detail: format!("bufferView {} exceeds BIN chunk", view_idx),
    };
    let end = view.byte_offset.checked_add(view.byte_length).ok_or_else(exceeds)?;
    let data = bin.get(view.byte_offset..end).ok_or_else(exceeds)?;
    let stride = view.byte_stride.unwrap_or(element);
    let overruns = || MeshError::Truncated {
        format: "glb",
        detail: format!("accessor overruns bufferView {}", view_idx),
    };
    let span = match accessor.count.checked_sub(1) {
        None => Some(0),
        Some(last) => stride.checked_mul(last).and_then(|n| n.checked_add(element)),
    };
    let needed = span
        .and_then(|n| n.checked_add(accessor.byte_offset))
        .ok_or_else(overruns)?;
    if needed > data.len() {
        return Err(overruns());
    }
    Ok((&data[accessor.byte_offset..], stride))
}

fn read_positions(doc: &GltfDoc, bin: &[u8], idx: usize) -> Result<Vec<[f64; 3]>, MeshError> {
    let acc = doc
        .accessors
        .get(idx)
        .ok_or_else(|| MeshError::Gltf(format!("accessor {} missing", idx)))?;
    if acc.kind != "VEC3" || acc.component_type != 5126 {
        return Err(MeshError::Gltf("POSITION must be float VEC3".into()));
    }
    let (data, stride) = accessor_span(doc, bin, acc, 12)?;
    Ok((0..acc.count)
        .map(|i| {
            let at = i * stride;
            [
                le_f32(data, at).unwrap_or_default() as f64,
                le_f32(data, at + 4).unwrap_or_default() as f64,
                le_f32(data, at + 8).unwrap_or_default() as f64,
            ]
        })
        .collect())
}

fn read_indices(doc: &GltfDoc, bin: &[u8], idx: usize) -> Result<Vec<u32>, MeshError> {
    let acc = doc
        .accessors
        .get(idx)
        .ok_or_else(|| MeshError::Gltf(format!("accessor {} missing", idx)))?;
    if acc.kind != "SCALAR" {
        return Err(MeshError::Gltf("indices must be SCALAR".into()));
    }
    let size = match acc.component_type {
        5121 => 1,
        5123 => 2,
        5125 => 4,
        other => return Err(MeshError::Gltf(format!("unsupported index type {}", other))),
    };
    let (data, stride) = accessor_span(doc, bin, acc, size)?;
    Ok((0..acc.count)
        .map(|i| {
            let at = i * stride;
            match size {
                1 => data[at] as u32,
                2 => u16::from_le_bytes([data[at], data[at + 1]]) as u32,
                _ => u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]),
            }
        })
        .collect())
}

fn decode_stl_binary(bytes: &[u8]) -> Result<IndexedMesh, MeshError> {
    let count = le_u32(bytes, STL_HEADER).ok_or(MeshError::Truncated {
        format: "stl",
        detail: "header".into(),
    })? as usize;
    let mut mesh = IndexedMesh::with_capacity(count * 3, count);
    for i in 0..count {
        let at = STL_HEADER + 4 + i * STL_TRIANGLE;
        let base = mesh.vertices.len() as u32;
        for v in 0..3 {
            // skip the 12-byte normal
            let p = at + 12 + v * 12;
            let read = |o: usize| {
                le_f32(bytes, p + o).ok_or_else(|| MeshError::Truncated {
                    format: "stl",
                    detail: format!("triangle {}", i),
                })
            };
            mesh.vertices
                .push([read(0)? as f64, read(4)? as f64, read(8)? as f64]);
        }
        mesh.faces.push([base, base + 1, base + 2]);
    }
    Ok(mesh)
}

fn decode_stl_ascii(bytes: &[u8]) -> Result<IndexedMesh, MeshError> {
    let text = String::from_utf8_lossy(bytes);
    let mut mesh = IndexedMesh::new();
    let mut pending: Vec<[f64; 3]> = Vec::with_capacity(3);
    for (n, line) in text.lines().enumerate() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("vertex") => {
                let coords: Vec<f64> = parts.filter_map(|p| p.parse().ok()).collect();
                if coords.len() != 3 {
                    return Err(MeshError::Truncated {
                        format: "stl",
                        detail: format!("bad vertex at line {}", n + 1),
                    });
                }
                pending.push([coords[0], coords[1], coords[2]]);
            }
            Some("endfacet") => {
                if pending.len() == 3 {
                    let base = mesh.vertices.len() as u32;
                    mesh.vertices.append(&mut pending);
                    mesh.faces.push([base, base + 1, base + 2]);
                }
                pending.clear();
            }
            _ => {}
        }
    }
    Ok(mesh)
}

fn decode_obj(bytes: &[u8]) -> Result<IndexedMesh, MeshError> {
    let text = String::from_utf8_lossy(bytes);
    let mut mesh = IndexedMesh::new();
    for (n, line) in text.lines().enumerate() {
        let line_no = n + 1;
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("v") => {
                let coords: Vec<f64> = parts.take(3).filter_map(|p| p.parse().ok()).collect();
                if coords.len() != 3 {
                    return Err(MeshError::Obj {
                        line: line_no,
                        detail: "vertex needs three coordinates".into(),
                    });
                }
                mesh.vertices.push([coords[0], coords[1], coords[2]]);
            }
            Some("f") => {
                let count = mesh.vertices.len() as i64;
                let mut poly = Vec::with_capacity(4);
                for token in parts {
                    let raw = token.split('/').next().unwrap_or_default();
                    let idx: i64 = raw.parse().map_err(|_| MeshError::Obj {
                        line: line_no,
                        detail: format!("bad face index {:?}", token),
                    })?;
                    // OBJ is 1-based; negative indices count back from the end
                    let resolved = if idx < 0 { count + idx } else { idx - 1 };
                    if resolved < 0 || resolved >= count {
                        return Err(MeshError::Obj {
                            line: line_no,
                            detail: format!("face index {} out of range", idx),
                        });
                    }
                    poly.push(resolved as u32);
                }
                if poly.len() < 3 {
                    return Err(MeshError::Obj {
                        line: line_no,
                        detail: "face needs at least three vertices".into(),
                    });
                }
                for i in 1..poly.len() - 1 {
                    mesh.faces.push([poly[0], poly[i], poly[i + 1]]);
                }
            }
            _ => {}
        }
    }
    Ok(mesh)
}


#[cfg(test)]
mod tests {
    use super::glb_fixture::{encode_glb, pack_glb};
    use super::*;
    use serde_json::json;
    use crate::mesh::fixtures::subdivided_cube;
    use crate::mesh::stl::write_binary_stl;

    #[test]
    fn decodes_glb_geometry() {
        let cube = subdivided_cube(-1.0, 1.0, 2);
        let glb = encode_glb(&cube);
        let (mesh, format) = decode_mesh(&glb).unwrap();
        assert_eq!(format, MeshFormat::Glb);
        assert_eq!(mesh.vertices.len(), cube.vertices.len());
        assert_eq!(mesh.faces, cube.faces);
        assert!(mesh.is_watertight());
    }

    #[test]
    fn glb_with_required_extension_is_rejected() {
        let mut glb = encode_glb(&subdivided_cube(0.0, 1.0, 1));
        let needle = b"\"asset\"";
        let pos = glb.windows(needle.len()).position(|w| w == needle).unwrap();
        // overwrite the asset key in place to keep chunk lengths intact
        let replacement = b"\"extensionsRequired\":[\"KHR_draco_mesh_compression\"],\"x\"";
        assert!(replacement.len() > needle.len());
        let json_len = le_u32(&glb, 12).unwrap() as usize;
        let json_start = 20;
        let mut json = glb[json_start..json_start + json_len].to_vec();
        let rel = pos - json_start;
        json.splice(rel..rel + needle.len(), replacement.iter().copied());
        while json.len() % 4 != 0 {
            json.push(b' ');
        }
        let bin_part = glb[json_start + json_len..].to_vec();
        let total = 12 + 8 + json.len() + bin_part.len();
        glb.truncate(12);
        glb[8..12].copy_from_slice(&(total as u32).to_le_bytes());
        glb.extend_from_slice(&(json.len() as u32).to_le_bytes());
        glb.extend_from_slice(&CHUNK_JSON.to_le_bytes());
        glb.extend_from_slice(&json);
        glb.extend_from_slice(&bin_part);

        let err = decode_mesh(&glb).unwrap_err();
        assert!(matches!(err, MeshError::Gltf(msg) if msg.contains("draco")));
    }

    fn single_triangle_doc(view: serde_json::Value, accessor: serde_json::Value) -> serde_json::Value {
        json!({
            "asset": {"version": "2.0"},
            "buffers": [{"byteLength": 36}],
            "bufferViews": [view],
            "accessors": [accessor],
            "meshes": [{"primitives": [{"attributes": {"POSITION": 0}}]}]
        })
    }

    #[test]
    fn oversized_offsets_are_truncation_errors() {
        let bin = vec![0u8; 36];
        let position = json!({"bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3"});
        let cases = [
            single_triangle_doc(
                json!({"buffer": 0, "byteOffset": u64::MAX, "byteLength": 36}),
                position.clone(),
            ),
            single_triangle_doc(
                json!({"buffer": 0, "byteOffset": 0, "byteLength": 36}),
                json!({"bufferView": 0, "byteOffset": u64::MAX - 4, "componentType": 5126, "count": 3, "type": "VEC3"}),
            ),
            single_triangle_doc(
                json!({"buffer": 0, "byteOffset": 0, "byteLength": 36, "byteStride": u64::MAX / 2}),
                position.clone(),
            ),
        ];
        for doc in cases {
            let glb = pack_glb(&doc, bin.clone());
            let err = decode_mesh(&glb).unwrap_err();
            assert!(matches!(err, MeshError::Truncated { format: "glb", .. }), "{:?}", err);
        }

        // the same layout with sane offsets decodes
        let doc = single_triangle_doc(json!({"buffer": 0, "byteOffset": 0, "byteLength": 36}), position);
        let (mesh, _) = decode_mesh(&pack_glb(&doc, bin)).unwrap();
        assert_eq!(mesh.faces, vec![[0, 1, 2]]);
    }

    #[test]
    fn decodes_binary_stl() {
        let cube = subdivided_cube(0.0, 1.0, 1);
        let stl = write_binary_stl(&cube);
        let (mesh, format) = decode_mesh(&stl).unwrap();
        assert_eq!(format, MeshFormat::StlBinary);
        assert_eq!(mesh.faces.len(), 12);
        assert!(mesh.is_watertight());
    }

    #[test]
    fn decodes_ascii_stl() {
        let text = "solid t\n facet normal 0 0 1\n  outer loop\n   vertex 0 0 0\n   vertex 1 0 0\n   vertex 0 1 0\n  endloop\n endfacet\nendsolid t\n";
        let (mesh, format) = decode_mesh(text.as_bytes()).unwrap();
        assert_eq!(format, MeshFormat::StlAscii);
        assert_eq!(mesh.faces.len(), 1);
        assert_eq!(mesh.vertices[1], [1.0, 0.0, 0.0]);
    }

    #[test]
    fn decodes_obj_with_quads_and_texture_refs() {
        let text = "o quad\nv 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nvt 0 0\nf 1/1 2/1 3/1 4/1\nf -4 -3 -2\n";
        let (mesh, format) = decode_mesh(text.as_bytes()).unwrap();
        assert_eq!(format, MeshFormat::Obj);
        assert_eq!(mesh.faces, vec![[0, 1, 2], [0, 2, 3], [0, 1, 2]]);
    }

    #[test]
    fn obj_out_of_range_index_is_an_error() {
        let err = decode_mesh(b"v 0 0 0\nv 1 0 0\nf 1 2 3\n").unwrap_err();
        assert!(matches!(err, MeshError::Obj { line: 3, .. }));
    }

    #[test]
    fn garbage_is_unknown() {
        assert!(matches!(
            decode_mesh(b"<html>502 Bad Gateway</html>"),
            Err(MeshError::UnknownFormat)
        ));
    }
}
