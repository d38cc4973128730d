//! Final check before an artifact is handed to a customer.
use crate::mesh::stl::{binary_stl_len, declared_triangles};
use serde::Serialize;

/// Anything smaller almost certainly encodes empty or degenerate geometry.
pub const DEFAULT_MIN_FILE_BYTES: u64 = 10 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityGate {
    pub min_file_bytes: u64,
    pub require_watertight: bool,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            min_file_bytes: DEFAULT_MIN_FILE_BYTES,
            require_watertight: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityReport {
    pub passed: bool,
    pub size: u64,
    pub reason: Option<String>,
}

impl QualityReport {
    fn pass(size: u64) -> Self {
        Self {
            passed: true,
            size,
            reason: None,
        }
    }

    fn reject(size: u64, reason: String) -> Self {
        Self {
            passed: false,
            size,
            reason: Some(reason),
        }
    }
}

impl QualityGate {
    pub fn new(min_file_bytes: u64, require_watertight: bool) -> Self {
        Self {
            min_file_bytes,
            require_watertight,
        }
    }

    /// Inspect a finished binary STL.
    pub fn check(&self, stl: &[u8], watertight: bool) -> QualityReport {
        let size = stl.len() as u64;
        if size < self.min_file_bytes {
            return QualityReport::reject(
                size,
                format!("file is {} bytes, minimum is {}", size, self.min_file_bytes),
            );
        }
        match declared_triangles(stl) {
            Some(n) if binary_stl_len(n as usize) as u64 == size && n > 0 => {}
            Some(n) => {
                return QualityReport::reject(
                    size,
                    format!("declared {} triangles but file holds {} bytes", n, size),
                )
            }
            None => return QualityReport::reject(size, "missing STL header".into()),
        }
        if self.require_watertight && !watertight {
            return QualityReport::reject(size, "mesh is not watertight".into());
        }
        QualityReport::pass(size)
    }
}
