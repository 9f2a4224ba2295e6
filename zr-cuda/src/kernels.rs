use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaFunction, CudaModule};
use cudarc::nvrtc::Ptx;

use crate::error::{CudaError, CudaResult};

/// Every entry point the engine resolves from the compiled module.
///
/// The variants map one-to-one onto the `extern "C" __global__` functions in `kernels/engine.cu`;
/// [Kernel::name] is the symbol name used for resolution.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Kernel {
    PointwiseMultiply,
    PointwiseDivide,
    AddInPlace,
    SubtractInPlace,
    VectorAdd,
    TanH,
    TanHDerivative,
    Sigmoid,
    SigmoidDerivative,
    Relu,
    ReluDerivative,
    LeakyRelu,
    LeakyReluDerivative,
    Abs,
    Log,
    Sqrt,
    SqrtInPlace,
    Pow,
    SoftmaxVector,
    SoftmaxDerivative,
    Reverse,
    RotateInPlace,
    Constrain,
    Normalise,
    L1Regularisation,
    MemClear,
    IsFinite,
    AddToEachRow,
    AddToEachColumn,
    SumRows,
    SumColumns,
    FindMinAndMax,
    FindSum,
    FindStdDev,
    EuclideanDistance,
    ManhattanDistance,
    CosineDistance,
    MultiCosineDistance,
    CosineFinish,
    CalculateDistances,
    TensorAddPadding,
    TensorRemovePadding,
    TensorIm2Col,
    TensorMaxPool,
    TensorReverseMaxPool,
    TensorReverseIm2Col,
}

impl Kernel {
    pub const ALL: &'static [Kernel] = &[
        Kernel::PointwiseMultiply,
        Kernel::PointwiseDivide,
        Kernel::AddInPlace,
        Kernel::SubtractInPlace,
        Kernel::VectorAdd,
        Kernel::TanH,
        Kernel::TanHDerivative,
        Kernel::Sigmoid,
        Kernel::SigmoidDerivative,
        Kernel::Relu,
        Kernel::ReluDerivative,
        Kernel::LeakyRelu,
        Kernel::LeakyReluDerivative,
        Kernel::Abs,
        Kernel::Log,
        Kernel::Sqrt,
        Kernel::SqrtInPlace,
        Kernel::Pow,
        Kernel::SoftmaxVector,
        Kernel::SoftmaxDerivative,
        Kernel::Reverse,
        Kernel::RotateInPlace,
        Kernel::Constrain,
        Kernel::Normalise,
        Kernel::L1Regularisation,
        Kernel::MemClear,
        Kernel::IsFinite,
        Kernel::AddToEachRow,
        Kernel::AddToEachColumn,
        Kernel::SumRows,
        Kernel::SumColumns,
        Kernel::FindMinAndMax,
        Kernel::FindSum,
        Kernel::FindStdDev,
        Kernel::EuclideanDistance,
        Kernel::ManhattanDistance,
        Kernel::CosineDistance,
        Kernel::MultiCosineDistance,
        Kernel::CosineFinish,
        Kernel::CalculateDistances,
        Kernel::TensorAddPadding,
        Kernel::TensorRemovePadding,
        Kernel::TensorIm2Col,
        Kernel::TensorMaxPool,
        Kernel::TensorReverseMaxPool,
        Kernel::TensorReverseIm2Col,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Kernel::PointwiseMultiply => "pointwise_multiply",
            Kernel::PointwiseDivide => "pointwise_divide",
            Kernel::AddInPlace => "add_in_place",
            Kernel::SubtractInPlace => "subtract_in_place",
            Kernel::VectorAdd => "vector_add",
            Kernel::TanH => "tanh_forward",
            Kernel::TanHDerivative => "tanh_derivative",
            Kernel::Sigmoid => "sigmoid_forward",
            Kernel::SigmoidDerivative => "sigmoid_derivative",
            Kernel::Relu => "relu_forward",
            Kernel::ReluDerivative => "relu_derivative",
            Kernel::LeakyRelu => "leaky_relu_forward",
            Kernel::LeakyReluDerivative => "leaky_relu_derivative",
            Kernel::Abs => "abs_forward",
            Kernel::Log => "log_forward",
            Kernel::Sqrt => "sqrt_forward",
            Kernel::SqrtInPlace => "sqrt_in_place",
            Kernel::Pow => "pow_forward",
            Kernel::SoftmaxVector => "softmax_vector",
            Kernel::SoftmaxDerivative => "softmax_derivative",
            Kernel::Reverse => "reverse",
            Kernel::RotateInPlace => "rotate_in_place",
            Kernel::Constrain => "constrain",
            Kernel::Normalise => "normalise",
            Kernel::L1Regularisation => "l1_regularisation",
            Kernel::MemClear => "mem_clear",
            Kernel::IsFinite => "is_finite",
            Kernel::AddToEachRow => "add_to_each_row",
            Kernel::AddToEachColumn => "add_to_each_column",
            Kernel::SumRows => "sum_rows",
            Kernel::SumColumns => "sum_columns",
            Kernel::FindMinAndMax => "find_min_and_max",
            Kernel::FindSum => "find_sum",
            Kernel::FindStdDev => "find_std_dev",
            Kernel::EuclideanDistance => "euclidean_distance",
            Kernel::ManhattanDistance => "manhattan_distance",
            Kernel::CosineDistance => "cosine_distance",
            Kernel::MultiCosineDistance => "multi_cosine_distance",
            Kernel::CosineFinish => "cosine_finish",
            Kernel::CalculateDistances => "calculate_distances",
            Kernel::TensorAddPadding => "tensor_add_padding",
            Kernel::TensorRemovePadding => "tensor_remove_padding",
            Kernel::TensorIm2Col => "tensor_im2col",
            Kernel::TensorMaxPool => "tensor_max_pool",
            Kernel::TensorReverseMaxPool => "tensor_reverse_max_pool",
            Kernel::TensorReverseIm2Col => "tensor_reverse_im2col",
        }
    }
}

/// A compiled device module with every entry point resolved into an opaque function handle.
///
/// The module is loaded once at engine construction; the handles are immutable and shared across
/// all launches for the engine lifetime.
pub struct KernelLibrary {
    // field is never read, but keeps the module alive for the resolved functions
    _module: Arc<CudaModule>,
    functions: HashMap<Kernel, CudaFunction>,
}

impl std::fmt::Debug for KernelLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelLibrary")
            .field("functions", &self.functions.len())
            .finish()
    }
}

impl KernelLibrary {
    /// Load the PTX module at `path` and resolve every [Kernel] entry point.
    pub fn load(context: &Arc<CudaContext>, path: &Path) -> CudaResult<KernelLibrary> {
        let source = std::fs::read_to_string(path).map_err(|e| CudaError::ModuleLoad {
            path: path.to_owned(),
            detail: e.to_string(),
        })?;
        let module = context
            .load_module(Ptx::from_src(source))
            .map_err(|e| CudaError::ModuleLoad {
                path: path.to_owned(),
                detail: e.to_string(),
            })?;

        let mut functions = HashMap::new();
        for &kernel in Kernel::ALL {
            let function = module
                .load_function(kernel.name())
                .map_err(|_| CudaError::KernelNotFound { name: kernel.name() })?;
            functions.insert(kernel, function);
        }

        Ok(KernelLibrary {
            _module: module,
            functions,
        })
    }

    pub fn get(&self, kernel: Kernel) -> &CudaFunction {
        // every variant is resolved at load time, so this cannot miss
        &self.functions[&kernel]
    }
}
