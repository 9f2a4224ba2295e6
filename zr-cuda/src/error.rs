use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use cudarc::driver::DriverError;

pub type CudaResult<T> = Result<T, CudaError>;

/// Errors reported by the engine.
///
/// Every device-level failure is detected synchronously after the triggering call and carries the
/// driver error (code, symbolic name and description) so it can be diagnosed without re-running.
/// Contract violations (use of a freed buffer, unbalanced `pop_layer`) are panics instead,
/// see [MemoryPool](crate::mem::MemoryPool).
#[derive(Debug)]
pub enum CudaError {
    /// The arena could not satisfy an allocation, neither from a free list nor from the device.
    OutOfDeviceMemory {
        requested_bytes: usize,
        free_bytes: usize,
        total_bytes: usize,
        source: DriverError,
    },
    /// The kernel module could not be read or loaded.
    ModuleLoad { path: PathBuf, detail: String },
    /// The loaded module is missing an expected entry point. Fatal at engine construction.
    KernelNotFound { name: &'static str },
    /// The occupancy query reported no valid launch configuration for a kernel.
    KernelLaunchConfiguration {
        kernel: &'static str,
        source: DriverError,
    },
    /// Any other driver-reported failure.
    Driver {
        context: &'static str,
        source: DriverError,
    },
}

impl Display for CudaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CudaError::OutOfDeviceMemory {
                requested_bytes,
                free_bytes,
                total_bytes,
                source,
            } => write!(
                f,
                "out of device memory: requested {} bytes with {}/{} bytes free ({})",
                requested_bytes, free_bytes, total_bytes, source
            ),
            CudaError::ModuleLoad { path, detail } => {
                write!(f, "failed to load kernel module {:?}: {}", path, detail)
            }
            CudaError::KernelNotFound { name } => {
                write!(f, "kernel module is missing entry point '{}'", name)
            }
            CudaError::KernelLaunchConfiguration { kernel, source } => {
                write!(f, "no valid launch configuration for kernel '{}' ({})", kernel, source)
            }
            CudaError::Driver { context, source } => {
                write!(f, "driver error during {}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for CudaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CudaError::OutOfDeviceMemory { source, .. }
            | CudaError::KernelLaunchConfiguration { source, .. }
            | CudaError::Driver { source, .. } => Some(source),
            CudaError::ModuleLoad { .. } | CudaError::KernelNotFound { .. } => None,
        }
    }
}
