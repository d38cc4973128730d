use super::decode::MeshError;
use super::IndexedMesh;
use serde::Serialize;

/// Diagnostics from one normalization pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizeReport {
    pub original_extents: [f64; 3],
    pub new_extents: [f64; 3],
    pub scale_factor: f64,
    pub target_size_mm: f64,
    pub vertex_count: usize,
    pub face_count: usize,
    pub watertight: bool,
}

/// Center the bounding box on the origin and scale uniformly so the longest
/// axis equals `target_size_mm`.
pub fn normalize(mesh: &mut IndexedMesh, target_size_mm: f64) -> Result<NormalizeReport, MeshError> {
    if mesh.is_empty() {
        return Err(MeshError::Empty);
    }
    let before = mesh.bounds().ok_or(MeshError::Empty)?;
    let longest = before.longest_axis();
    if !longest.is_finite() || longest <= f64::EPSILON {
        return Err(MeshError::Degenerate);
    }

    let center = before.center();
    let scale = target_size_mm / longest;
    for v in &mut mesh.vertices {
        for axis in 0..3 {
            v[axis] = (v[axis] - center[axis]) * scale;
        }
    }

    let after = mesh.bounds().ok_or(MeshError::Empty)?;
    Ok(NormalizeReport {
        original_extents: before.extents(),
        new_extents: after.extents(),
        scale_factor: scale,
        target_size_mm,
        vertex_count: mesh.vertices.len(),
        face_count: mesh.faces.len(),
        watertight: mesh.is_watertight(),
    })
}
