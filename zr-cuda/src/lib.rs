#![warn(missing_debug_implementations)]

//! A cuda compute engine for neural network training: a layered device-memory arena, an
//! occupancy-based kernel dispatch planner, and the numeric primitives (elementwise ops, tree
//! reductions, convolution/pooling index generation) built on top of them. The core type is
//! [CudaEngine](engine::CudaEngine).
//!
//! The kernels live in `kernels/engine.cu` and are compiled offline with `nvcc --ptx`; the engine
//! loads the resulting module at construction and resolves every entry point eagerly.
//!
//! # Quick demo
//!
//! ```no_run
//! # use zr_cuda::engine::CudaEngine;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = CudaEngine::new(0, "kernels/engine.ptx")?;
//!
//! // one arena layer per unit of work, popped as a single bulk release
//! engine.push_layer();
//!
//! let a = engine.to_device(&[1.0, 2.0, 3.0, 4.0])?;
//! let b = engine.tanh(&a, 4)?;
//! let (min, max) = engine.find_min_and_max(&b, 4)?;
//! println!("tanh range: [{}, {}]", min, max);
//!
//! engine.pop_layer();
//! # Ok(())
//! # }
//! ```

/// Convolution placement tables and their cache.
pub mod conv;
/// The engine type and the elementwise/reduction/distance operation surface.
pub mod engine;
/// Error taxonomy.
pub mod error;
/// Kernel module loading and entry-point resolution.
pub mod kernels;
/// Occupancy-based launch configuration planning.
pub mod launch;
/// The layered device memory arena.
pub mod mem;
/// Convolution and pooling operations.
mod tensor;
/// Miscellaneous utilities.
mod util;

/// Export the central types for convenience.
pub use engine::{CudaEngine, DistanceMetric};
pub use error::{CudaError, CudaResult};
pub use mem::DeviceBuffer;
