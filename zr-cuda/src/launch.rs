use std::collections::HashMap;
use std::sync::RwLock;

use cudarc::driver::{CudaFunction, LaunchConfig};

use crate::error::{CudaError, CudaResult};
use crate::kernels::Kernel;
use crate::util::ceil_div;

/// Reductions run with a fixed block capacity instead of the occupancy-derived one, so the
/// partial-result buffer size is independent of the device.
pub const REDUCE_BLOCK: u32 = 256;

/// The logical problem shape of a launch, in elements.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LaunchShape {
    D1(usize),
    D2 { rows: usize, columns: usize },
    D3 { rows: usize, columns: usize, depth: usize },
}

impl LaunchShape {
    pub fn is_empty(self) -> bool {
        match self {
            LaunchShape::D1(size) => size == 0,
            LaunchShape::D2 { rows, columns } => rows == 0 || columns == 0,
            LaunchShape::D3 { rows, columns, depth } => rows == 0 || columns == 0 || depth == 0,
        }
    }

    fn dimensionality(self) -> u8 {
        match self {
            LaunchShape::D1(_) => 1,
            LaunchShape::D2 { .. } => 2,
            LaunchShape::D3 { .. } => 3,
        }
    }
}

/// The occupancy-derived block edge for one (kernel, dimensionality) pair.
#[derive(Debug, Copy, Clone)]
struct BlockEdge {
    edge: u32,
    #[allow(dead_code)]
    min_grid_size: u32,
}

/// Derives grid/block launch configurations from a kernel's occupancy characteristics.
///
/// The occupancy query runs once per (kernel, dimensionality); the derived block edge is cached
/// and only the grid size varies with the problem shape afterwards. Planning is idempotent, so
/// concurrent readers are served under a shared lock and a racing first computation is harmless.
#[derive(Debug)]
pub struct LaunchPlanner {
    cache: RwLock<HashMap<(Kernel, u8), BlockEdge>>,
}

impl LaunchPlanner {
    pub fn new() -> LaunchPlanner {
        LaunchPlanner {
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Derive the launch configuration for `kernel` over `shape`.
    ///
    /// 1D uses the occupancy block size directly; 2D and 3D split it evenly across the axes by
    /// square/cube root. The caller must not launch an empty shape, see [LaunchShape::is_empty].
    pub fn plan(&self, kernel: Kernel, function: &CudaFunction, shape: LaunchShape) -> CudaResult<LaunchConfig> {
        assert!(!shape.is_empty(), "Cannot plan a launch for empty shape {:?}", shape);

        let edge = self.block_edge(kernel, function, shape.dimensionality())?.edge;

        let config = match shape {
            LaunchShape::D1(size) => LaunchConfig {
                grid_dim: (ceil_div(size as u32, edge), 1, 1),
                block_dim: (edge, 1, 1),
                shared_mem_bytes: 0,
            },
            LaunchShape::D2 { rows, columns } => LaunchConfig {
                grid_dim: (ceil_div(rows as u32, edge), ceil_div(columns as u32, edge), 1),
                block_dim: (edge, edge, 1),
                shared_mem_bytes: 0,
            },
            LaunchShape::D3 { rows, columns, depth } => LaunchConfig {
                grid_dim: (
                    ceil_div(rows as u32, edge),
                    ceil_div(columns as u32, edge),
                    ceil_div(depth as u32, edge),
                ),
                block_dim: (edge, edge, edge),
                shared_mem_bytes: 0,
            },
        };
        Ok(config)
    }

    /// The fixed-block configuration used by the tree reductions, `partials` blocks of
    /// [REDUCE_BLOCK] lanes.
    pub fn reduction(partials: u32) -> LaunchConfig {
        LaunchConfig {
            grid_dim: (partials, 1, 1),
            block_dim: (REDUCE_BLOCK, 1, 1),
            shared_mem_bytes: 0,
        }
    }

    fn block_edge(&self, kernel: Kernel, function: &CudaFunction, dimensionality: u8) -> CudaResult<BlockEdge> {
        let key = (kernel, dimensionality);

        if let Some(&edge) = self.cache.read().unwrap().get(&key) {
            return Ok(edge);
        }

        extern "C" fn no_dynamic_smem(_block_size: std::ffi::c_int) -> usize {
            0
        }

        let (min_grid_size, block_size) = function
            .occupancy_max_potential_block_size(no_dynamic_smem, 0, 0, None)
            .map_err(|source| CudaError::KernelLaunchConfiguration {
                kernel: kernel.name(),
                source,
            })?;

        let edge = BlockEdge {
            edge: split_block_size(block_size as u32, dimensionality),
            min_grid_size: min_grid_size as u32,
        };

        // a concurrent writer may have raced us to the same result, last write wins
        self.cache.write().unwrap().insert(key, edge);
        Ok(edge)
    }
}

/// Split an occupancy block size evenly over `dimensionality` axes, truncating to an integer.
fn split_block_size(block_size: u32, dimensionality: u8) -> u32 {
    let edge = match dimensionality {
        1 => block_size,
        2 => (block_size as f64).sqrt() as u32,
        3 => (block_size as f64).cbrt() as u32,
        _ => unreachable!("Launch shapes are at most 3-dimensional"),
    };
    edge.max(1)
}

#[cfg(test)]
mod tests {
    use super::split_block_size;

    #[test]
    fn block_edge_split() {
        assert_eq!(split_block_size(1024, 1), 1024);
        assert_eq!(split_block_size(1024, 2), 32);
        assert_eq!(split_block_size(1024, 3), 10);
        assert_eq!(split_block_size(768, 2), 27);
        // degenerate occupancy result still yields a launchable block
        assert_eq!(split_block_size(1, 3), 1);
    }
}
