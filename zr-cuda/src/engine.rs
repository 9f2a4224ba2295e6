use std::path::Path;
use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaStream, DriverError, PushKernelArg};

use crate::conv::ConvolutionPlanCache;
use crate::error::{CudaError, CudaResult};
use crate::kernels::{Kernel, KernelLibrary};
use crate::launch::{LaunchPlanner, LaunchShape, REDUCE_BLOCK};
use crate::mem::{DeviceBuffer, MemoryPool};
use crate::util::ceil_div;

/// The distance metrics supported by [CudaEngine::calculate_distances].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DistanceMetric {
    Euclidean,
    Manhattan,
    Cosine,
}

impl DistanceMetric {
    fn id(self) -> i32 {
        match self {
            DistanceMetric::Euclidean => 0,
            DistanceMetric::Manhattan => 1,
            DistanceMetric::Cosine => 2,
        }
    }
}

/// The engine: one device context, one kernel module, a layered memory arena and the operation
/// surface built on top of them.
///
/// The engine binds to a single execution context. Threads other than the constructing one must
/// call [CudaEngine::bind_thread] before issuing operations. Kernel launches are submitted to the
/// default stream; every operation that reads a scalar or a small array back blocks until the
/// device has produced it, so from the caller's perspective each operation is synchronous.
///
/// Every operation that returns a buffer transfers ownership to the caller, which must eventually
/// pass it to [CudaEngine::free] or release it wholesale with [CudaEngine::pop_layer].
pub struct CudaEngine {
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    kernels: KernelLibrary,
    planner: LaunchPlanner,
    memory: MemoryPool,
    pub(crate) plans: ConvolutionPlanCache,
}

impl std::fmt::Debug for CudaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaEngine")
            .field("kernels", &self.kernels)
            .field("memory", &self.memory)
            .finish()
    }
}

pub(crate) fn driver_err(kernel: Kernel) -> impl FnOnce(DriverError) -> CudaError {
    move |source| CudaError::Driver {
        context: kernel.name(),
        source,
    }
}

impl CudaEngine {
    /// Create an engine on device `device`, loading the compiled kernel module from `module_path`.
    ///
    /// All entry points are resolved eagerly, so a stale or truncated module fails here instead of
    /// at the first launch.
    pub fn new(device: usize, module_path: impl AsRef<Path>) -> CudaResult<CudaEngine> {
        let context = CudaContext::new(device).map_err(|source| CudaError::Driver {
            context: "creating the device context",
            source,
        })?;
        let stream = context.default_stream();
        let kernels = KernelLibrary::load(&context, module_path.as_ref())?;

        Ok(CudaEngine {
            context,
            memory: MemoryPool::new(Arc::clone(&stream)),
            stream,
            kernels,
            planner: LaunchPlanner::new(),
            plans: ConvolutionPlanCache::new(),
        })
    }

    pub(crate) fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }

    /// The resolved kernel function table.
    pub fn kernels(&self) -> &KernelLibrary {
        &self.kernels
    }

    /// The launch configuration planner and its occupancy cache.
    pub fn planner(&self) -> &LaunchPlanner {
        &self.planner
    }

    // ------------------------------------------------------------------
    // lifecycle and allocation
    // ------------------------------------------------------------------

    /// Rebind the calling thread to the engine's device context. Required before issuing
    /// operations from a thread other than the constructing one.
    pub fn bind_thread(&self) -> CudaResult<()> {
        self.context.bind_to_thread().map_err(|source| CudaError::Driver {
            context: "binding the thread to the device context",
            source,
        })
    }

    /// Block until the device has completed every launch submitted so far.
    pub fn synchronize(&self) -> CudaResult<()> {
        self.stream.synchronize().map_err(|source| CudaError::Driver {
            context: "synchronizing the stream",
            source,
        })
    }

    pub fn memory(&self) -> &MemoryPool {
        &self.memory
    }

    pub fn push_layer(&self) {
        self.memory.push_layer();
    }

    pub fn pop_layer(&self) {
        self.memory.pop_layer();
    }

    pub fn alloc(&self, size: usize, zero_init: bool) -> CudaResult<DeviceBuffer> {
        self.memory.alloc(size, zero_init)
    }

    pub fn free(&self, buffer: DeviceBuffer) {
        self.memory.free(buffer);
    }

    pub fn offset(&self, buffer: &DeviceBuffer, element_offset: usize, size: usize) -> DeviceBuffer {
        self.memory.offset(buffer, element_offset, size)
    }

    /// Free device memory in bytes.
    pub fn free_memory(&self) -> CudaResult<usize> {
        let (free, _) = mem_info()?;
        Ok(free)
    }

    /// Total device memory in bytes.
    pub fn total_memory(&self) -> CudaResult<usize> {
        let (_, total) = mem_info()?;
        Ok(total)
    }

    // ------------------------------------------------------------------
    // transfers
    // ------------------------------------------------------------------

    /// Allocate a buffer and copy `data` into it.
    pub fn to_device(&self, data: &[f32]) -> CudaResult<DeviceBuffer> {
        let buffer = self.memory.alloc(data.len(), false)?;
        if !data.is_empty() {
            let mut guard = buffer.lock();
            self.stream
                .memcpy_htod(data, &mut guard.view_mut())
                .map_err(|source| CudaError::Driver {
                    context: "host to device copy",
                    source,
                })?;
        }
        Ok(buffer)
    }

    /// Read the first `size` elements of `buffer` back to the host, blocking until the device has
    /// completed the launches that produced them.
    pub fn to_host(&self, buffer: &DeviceBuffer, size: usize) -> CudaResult<Vec<f32>> {
        if size == 0 {
            return Ok(vec![]);
        }
        let guard = buffer.lock();
        self.stream
            .clone_dtoh(&guard.view_range(0, size))
            .map_err(|source| CudaError::Driver {
                context: "device to host copy",
                source,
            })
    }

    /// Read a single element back to the host.
    pub fn get_at(&self, buffer: &DeviceBuffer, index: usize) -> CudaResult<f32> {
        let guard = buffer.lock();
        let values = self
            .stream
            .clone_dtoh(&guard.view_range(index, 1))
            .map_err(|source| CudaError::Driver {
                context: "device to host copy",
                source,
            })?;
        Ok(values[0])
    }

    fn copy_buffer(&self, source: &DeviceBuffer, target: &DeviceBuffer, size: usize) -> CudaResult<()> {
        let src_guard = source.lock();
        let mut dst_guard = target.lock();
        self.stream
            .memcpy_dtod(&src_guard.view_range(0, size), &mut dst_guard.view_range_mut(0, size))
            .map_err(|source| CudaError::Driver {
                context: "device to device copy",
                source,
            })
    }

    // ------------------------------------------------------------------
    // elementwise, allocating
    // ------------------------------------------------------------------

    /// `out[i] = f(a[i])` for a kernel taking `(a, out, n)`.
    fn unary_op(&self, kernel: Kernel, a: &DeviceBuffer, size: usize) -> CudaResult<DeviceBuffer> {
        let ret = self.memory.alloc(size, false)?;
        if size > 0 {
            let function = self.kernels.get(kernel);
            let config = self.planner.plan(kernel, function, LaunchShape::D1(size))?;

            let a_guard = a.lock();
            let mut ret_guard = ret.lock();
            let a_view = a_guard.view_range(0, size);
            let mut ret_view = ret_guard.view_mut();
            let n = size as i32;

            let mut launch = self.stream.launch_builder(function);
            launch.arg(&a_view);
            launch.arg(&mut ret_view);
            launch.arg(&n);
            unsafe { launch.launch(config) }.map_err(driver_err(kernel))?;
        }
        Ok(ret)
    }

    /// Like [Self::unary_op] for kernels taking one extra scalar `(a, out, n, value)`.
    fn unary_scalar_op(&self, kernel: Kernel, a: &DeviceBuffer, size: usize, value: f32) -> CudaResult<DeviceBuffer> {
        let ret = self.memory.alloc(size, false)?;
        if size > 0 {
            let function = self.kernels.get(kernel);
            let config = self.planner.plan(kernel, function, LaunchShape::D1(size))?;

            let a_guard = a.lock();
            let mut ret_guard = ret.lock();
            let a_view = a_guard.view_range(0, size);
            let mut ret_view = ret_guard.view_mut();
            let n = size as i32;

            let mut launch = self.stream.launch_builder(function);
            launch.arg(&a_view);
            launch.arg(&mut ret_view);
            launch.arg(&n);
            launch.arg(&value);
            unsafe { launch.launch(config) }.map_err(driver_err(kernel))?;
        }
        Ok(ret)
    }

    /// Seed the result with a copy of `b`, then run a kernel `(a, ret, n)` that combines `a` into
    /// the copy in place.
    fn binary_op(&self, kernel: Kernel, a: &DeviceBuffer, b: &DeviceBuffer, size: usize) -> CudaResult<DeviceBuffer> {
        let ret = self.memory.alloc(size, false)?;
        if size > 0 {
            self.copy_buffer(b, &ret, size)?;

            let function = self.kernels.get(kernel);
            let config = self.planner.plan(kernel, function, LaunchShape::D1(size))?;

            let a_guard = a.lock();
            let mut ret_guard = ret.lock();
            let a_view = a_guard.view_range(0, size);
            let mut ret_view = ret_guard.view_mut();
            let n = size as i32;

            let mut launch = self.stream.launch_builder(function);
            launch.arg(&a_view);
            launch.arg(&mut ret_view);
            launch.arg(&n);
            unsafe { launch.launch(config) }.map_err(driver_err(kernel))?;
        }
        Ok(ret)
    }

    pub fn pointwise_multiply(&self, a: &DeviceBuffer, b: &DeviceBuffer, size: usize) -> CudaResult<DeviceBuffer> {
        self.binary_op(Kernel::PointwiseMultiply, a, b, size)
    }

    pub fn pointwise_divide(&self, a: &DeviceBuffer, b: &DeviceBuffer, size: usize) -> CudaResult<DeviceBuffer> {
        self.binary_op(Kernel::PointwiseDivide, a, b, size)
    }

    pub fn tanh(&self, a: &DeviceBuffer, size: usize) -> CudaResult<DeviceBuffer> {
        self.unary_op(Kernel::TanH, a, size)
    }

    pub fn tanh_derivative(&self, a: &DeviceBuffer, size: usize) -> CudaResult<DeviceBuffer> {
        self.unary_op(Kernel::TanHDerivative, a, size)
    }

    pub fn sigmoid(&self, a: &DeviceBuffer, size: usize) -> CudaResult<DeviceBuffer> {
        self.unary_op(Kernel::Sigmoid, a, size)
    }

    pub fn sigmoid_derivative(&self, a: &DeviceBuffer, size: usize) -> CudaResult<DeviceBuffer> {
        self.unary_op(Kernel::SigmoidDerivative, a, size)
    }

    pub fn relu(&self, a: &DeviceBuffer, size: usize) -> CudaResult<DeviceBuffer> {
        self.unary_op(Kernel::Relu, a, size)
    }

    pub fn relu_derivative(&self, a: &DeviceBuffer, size: usize) -> CudaResult<DeviceBuffer> {
        self.unary_op(Kernel::ReluDerivative, a, size)
    }

    pub fn leaky_relu(&self, a: &DeviceBuffer, size: usize) -> CudaResult<DeviceBuffer> {
        self.unary_op(Kernel::LeakyRelu, a, size)
    }

    pub fn leaky_relu_derivative(&self, a: &DeviceBuffer, size: usize) -> CudaResult<DeviceBuffer> {
        self.unary_op(Kernel::LeakyReluDerivative, a, size)
    }

    pub fn abs(&self, a: &DeviceBuffer, size: usize) -> CudaResult<DeviceBuffer> {
        self.unary_op(Kernel::Abs, a, size)
    }

    pub fn log(&self, a: &DeviceBuffer, size: usize) -> CudaResult<DeviceBuffer> {
        self.unary_op(Kernel::Log, a, size)
    }

    /// `out[i] = sqrt(a[i] + value_adjustment)`, the adjustment guards against negative inputs
    /// from accumulated rounding.
    pub fn sqrt(&self, a: &DeviceBuffer, size: usize, value_adjustment: f32) -> CudaResult<DeviceBuffer> {
        self.unary_scalar_op(Kernel::Sqrt, a, size, value_adjustment)
    }

    pub fn pow(&self, a: &DeviceBuffer, size: usize, power: f32) -> CudaResult<DeviceBuffer> {
        self.unary_scalar_op(Kernel::Pow, a, size, power)
    }

    /// `out[i] = exp(a[i] - max)`; the caller supplies the vector maximum and divides by the sum.
    pub fn softmax_vector(&self, a: &DeviceBuffer, size: usize, max: f32) -> CudaResult<DeviceBuffer> {
        self.unary_scalar_op(Kernel::SoftmaxVector, a, size, max)
    }

    /// `out[i] = a[size - 1 - i]`.
    pub fn reverse(&self, a: &DeviceBuffer, size: usize) -> CudaResult<DeviceBuffer> {
        self.unary_op(Kernel::Reverse, a, size)
    }

    // ------------------------------------------------------------------
    // elementwise, in place
    // ------------------------------------------------------------------

    /// `a[i] = a[i] * coefficient1 + b[i] * coefficient2`.
    pub fn add_in_place(
        &self,
        a: &DeviceBuffer,
        b: &DeviceBuffer,
        size: usize,
        coefficient1: f32,
        coefficient2: f32,
    ) -> CudaResult<()> {
        self.weighted_in_place(Kernel::AddInPlace, a, b, size, coefficient1, coefficient2)
    }

    /// `a[i] = a[i] * coefficient1 - b[i] * coefficient2`.
    pub fn subtract_in_place(
        &self,
        a: &DeviceBuffer,
        b: &DeviceBuffer,
        size: usize,
        coefficient1: f32,
        coefficient2: f32,
    ) -> CudaResult<()> {
        self.weighted_in_place(Kernel::SubtractInPlace, a, b, size, coefficient1, coefficient2)
    }

    fn weighted_in_place(
        &self,
        kernel: Kernel,
        a: &DeviceBuffer,
        b: &DeviceBuffer,
        size: usize,
        coefficient1: f32,
        coefficient2: f32,
    ) -> CudaResult<()> {
        if size == 0 {
            return Ok(());
        }
        let function = self.kernels.get(kernel);
        let config = self.planner.plan(kernel, function, LaunchShape::D1(size))?;

        let mut a_guard = a.lock();
        let b_guard = b.lock();
        let mut a_view = a_guard.view_range_mut(0, size);
        let b_view = b_guard.view_range(0, size);
        let n = size as i32;

        let mut launch = self.stream.launch_builder(function);
        launch.arg(&mut a_view);
        launch.arg(&b_view);
        launch.arg(&n);
        launch.arg(&coefficient1);
        launch.arg(&coefficient2);
        unsafe { launch.launch(config) }.map(|_| ()).map_err(driver_err(kernel))
    }

    /// In-place kernel over `a` taking `(a, n, scalars...)`.
    fn in_place_op(&self, kernel: Kernel, a: &DeviceBuffer, size: usize, scalars: &[f32]) -> CudaResult<()> {
        if size == 0 {
            return Ok(());
        }
        let function = self.kernels.get(kernel);
        let config = self.planner.plan(kernel, function, LaunchShape::D1(size))?;

        let mut a_guard = a.lock();
        let mut a_view = a_guard.view_range_mut(0, size);
        let n = size as i32;

        let mut launch = self.stream.launch_builder(function);
        launch.arg(&mut a_view);
        launch.arg(&n);
        for scalar in scalars {
            launch.arg(scalar);
        }
        unsafe { launch.launch(config) }.map(|_| ()).map_err(driver_err(kernel))
    }

    /// `a[i] += scalar`.
    pub fn vector_add(&self, a: &DeviceBuffer, size: usize, scalar: f32) -> CudaResult<()> {
        self.in_place_op(Kernel::VectorAdd, a, size, &[scalar])
    }

    /// Clamp every element into `[min, max]`.
    pub fn constrain(&self, a: &DeviceBuffer, size: usize, min: f32, max: f32) -> CudaResult<()> {
        self.in_place_op(Kernel::Constrain, a, size, &[min, max])
    }

    /// `a[i] = (a[i] - min) / range`.
    pub fn normalise(&self, a: &DeviceBuffer, size: usize, min: f32, range: f32) -> CudaResult<()> {
        self.in_place_op(Kernel::Normalise, a, size, &[min, range])
    }

    /// Shrink every element towards zero by `coefficient`, the L1 weight-decay step.
    pub fn l1_regularisation(&self, a: &DeviceBuffer, size: usize, coefficient: f32) -> CudaResult<()> {
        self.in_place_op(Kernel::L1Regularisation, a, size, &[coefficient])
    }

    /// Zero `count` elements starting at `offset`, `increment` elements apart.
    pub fn mem_clear(&self, data: &DeviceBuffer, count: usize, offset: usize, increment: usize) -> CudaResult<()> {
        if count == 0 {
            return Ok(());
        }
        assert!(
            offset + (count - 1) * increment < data.len(),
            "Clearing {} elements at offset {} with increment {} overruns a buffer of {} elements",
            count,
            offset,
            increment,
            data.len()
        );
        let kernel = Kernel::MemClear;
        let function = self.kernels.get(kernel);
        let config = self.planner.plan(kernel, function, LaunchShape::D1(count))?;

        let mut guard = data.lock();
        let mut view = guard.view_mut();
        let (count, offset, increment) = (count as i32, offset as i32, increment as i32);

        let mut launch = self.stream.launch_builder(function);
        launch.arg(&mut view);
        launch.arg(&count);
        launch.arg(&offset);
        launch.arg(&increment);
        unsafe { launch.launch(config) }.map(|_| ()).map_err(driver_err(kernel))
    }

    /// Reverse each of `block_count` equally-sized blocks of `a` in place.
    pub fn rotate_in_place(&self, a: &DeviceBuffer, size: usize, block_count: usize) -> CudaResult<()> {
        assert!(block_count > 0, "Rotation requires at least one block");
        assert_eq!(size % block_count, 0, "Rotation blocks must divide the buffer evenly");
        if size == 0 {
            return Ok(());
        }
        let kernel = Kernel::RotateInPlace;
        let function = self.kernels.get(kernel);
        let config = self.planner.plan(kernel, function, LaunchShape::D1(size))?;

        let mut guard = a.lock();
        let mut view = guard.view_range_mut(0, size);
        let (n, block_size) = (size as i32, (size / block_count) as i32);

        let mut launch = self.stream.launch_builder(function);
        launch.arg(&mut view);
        launch.arg(&n);
        launch.arg(&block_size);
        unsafe { launch.launch(config) }.map(|_| ()).map_err(driver_err(kernel))
    }

    // ------------------------------------------------------------------
    // 2D matrix helpers
    // ------------------------------------------------------------------

    /// `matrix[r, c] += vector[c]` for a row-major `rows`×`columns` matrix.
    pub fn add_to_each_row(
        &self,
        matrix: &DeviceBuffer,
        vector: &DeviceBuffer,
        rows: usize,
        columns: usize,
    ) -> CudaResult<()> {
        self.matrix_vector_op(Kernel::AddToEachRow, matrix, vector, rows, columns)
    }

    /// `matrix[r, c] += vector[r]`.
    pub fn add_to_each_column(
        &self,
        matrix: &DeviceBuffer,
        vector: &DeviceBuffer,
        rows: usize,
        columns: usize,
    ) -> CudaResult<()> {
        self.matrix_vector_op(Kernel::AddToEachColumn, matrix, vector, rows, columns)
    }

    fn matrix_vector_op(
        &self,
        kernel: Kernel,
        matrix: &DeviceBuffer,
        vector: &DeviceBuffer,
        rows: usize,
        columns: usize,
    ) -> CudaResult<()> {
        let shape = LaunchShape::D2 { rows, columns };
        if shape.is_empty() {
            return Ok(());
        }
        let function = self.kernels.get(kernel);
        let config = self.planner.plan(kernel, function, shape)?;

        let mut m_guard = matrix.lock();
        let v_guard = vector.lock();
        let mut m_view = m_guard.view_range_mut(0, rows * columns);
        let v_view = v_guard.view();
        let (rows, columns) = (rows as i32, columns as i32);

        let mut launch = self.stream.launch_builder(function);
        launch.arg(&mut m_view);
        launch.arg(&v_view);
        launch.arg(&rows);
        launch.arg(&columns);
        unsafe { launch.launch(config) }.map(|_| ()).map_err(driver_err(kernel))
    }

    /// Sum each row of a row-major `rows`×`columns` matrix into a vector of length `rows`.
    pub fn sum_rows(&self, matrix: &DeviceBuffer, rows: usize, columns: usize) -> CudaResult<DeviceBuffer> {
        self.matrix_sum_op(Kernel::SumRows, matrix, rows, columns, rows)
    }

    /// Sum each column into a vector of length `columns`.
    pub fn sum_columns(&self, matrix: &DeviceBuffer, rows: usize, columns: usize) -> CudaResult<DeviceBuffer> {
        self.matrix_sum_op(Kernel::SumColumns, matrix, rows, columns, columns)
    }

    fn matrix_sum_op(
        &self,
        kernel: Kernel,
        matrix: &DeviceBuffer,
        rows: usize,
        columns: usize,
        output_len: usize,
    ) -> CudaResult<DeviceBuffer> {
        let ret = self.memory.alloc(output_len, true)?;
        let shape = LaunchShape::D2 { rows, columns };
        if !shape.is_empty() {
            let function = self.kernels.get(kernel);
            let config = self.planner.plan(kernel, function, shape)?;

            let m_guard = matrix.lock();
            let mut ret_guard = ret.lock();
            let m_view = m_guard.view_range(0, rows * columns);
            let mut ret_view = ret_guard.view_mut();
            let (rows, columns) = (rows as i32, columns as i32);

            let mut launch = self.stream.launch_builder(function);
            launch.arg(&m_view);
            launch.arg(&mut ret_view);
            launch.arg(&rows);
            launch.arg(&columns);
            unsafe { launch.launch(config) }.map_err(driver_err(kernel))?;
        }
        Ok(ret)
    }

    /// The softmax Jacobian of a vector of `size` activations, a `size`×`size` row-major matrix.
    pub fn softmax_derivative(&self, a: &DeviceBuffer, size: usize) -> CudaResult<DeviceBuffer> {
        let kernel = Kernel::SoftmaxDerivative;
        let ret = self.memory.alloc(size * size, false)?;
        let shape = LaunchShape::D2 {
            rows: size,
            columns: size,
        };
        if !shape.is_empty() {
            let function = self.kernels.get(kernel);
            let config = self.planner.plan(kernel, function, shape)?;

            let a_guard = a.lock();
            let mut ret_guard = ret.lock();
            let a_view = a_guard.view_range(0, size);
            let mut ret_view = ret_guard.view_mut();
            let n = size as i32;

            let mut launch = self.stream.launch_builder(function);
            launch.arg(&a_view);
            launch.arg(&mut ret_view);
            launch.arg(&n);
            unsafe { launch.launch(config) }.map_err(driver_err(kernel))?;
        }
        Ok(ret)
    }

    // ------------------------------------------------------------------
    // tree reductions
    // ------------------------------------------------------------------

    /// One round of a tree reduction: run `kernel` over the first `size` elements of `input`,
    /// producing one partial result per [REDUCE_BLOCK]-sized block in `output`.
    fn reduction_round(
        &self,
        kernel: Kernel,
        input: &DeviceBuffer,
        size: usize,
        outputs: &[&DeviceBuffer],
        scalar: Option<f32>,
    ) -> CudaResult<()> {
        let partials = ceil_div(size as u32, REDUCE_BLOCK);
        let function = self.kernels.get(kernel);
        let config = LaunchPlanner::reduction(partials);

        let in_guard = input.lock();
        let in_view = in_guard.view_range(0, size);
        let n = size as i32;

        match outputs {
            [out] => {
                let mut out_guard = out.lock();
                let mut out_view = out_guard.view_mut();
                let mut launch = self.stream.launch_builder(function);
                launch.arg(&in_view);
                launch.arg(&n);
                if let Some(scalar) = &scalar {
                    launch.arg(scalar);
                }
                launch.arg(&mut out_view);
                unsafe { launch.launch(config) }.map(|_| ()).map_err(driver_err(kernel))
            }
            [first, second] => {
                let mut first_guard = first.lock();
                let mut second_guard = second.lock();
                let mut first_view = first_guard.view_mut();
                let mut second_view = second_guard.view_mut();
                let mut launch = self.stream.launch_builder(function);
                launch.arg(&in_view);
                launch.arg(&n);
                launch.arg(&mut first_view);
                launch.arg(&mut second_view);
                unsafe { launch.launch(config) }.map(|_| ()).map_err(driver_err(kernel))
            }
            _ => unreachable!("Reductions produce one or two partial buffers"),
        }
    }

    /// The sum of the first `size` elements. Zero-length input sums to zero without touching the
    /// device.
    pub fn sum_values(&self, a: &DeviceBuffer, size: usize) -> CudaResult<f32> {
        if size == 0 {
            return Ok(0.0);
        }

        let mut current: Option<DeviceBuffer> = None;
        let mut size = size;
        while size as u32 > REDUCE_BLOCK {
            let partials = ceil_div(size as u32, REDUCE_BLOCK) as usize;
            let sums = self.memory.alloc(partials, true)?;
            self.reduction_round(Kernel::FindSum, current.as_ref().unwrap_or(a), size, &[&sums], None)?;
            if let Some(previous) = current.take() {
                self.memory.free(previous);
            }
            current = Some(sums);
            size = partials;
        }

        let tail = self.to_host(current.as_ref().unwrap_or(a), size)?;
        if let Some(previous) = current.take() {
            self.memory.free(previous);
        }
        Ok(tail.iter().sum())
    }

    /// The minimum and maximum of the first `size` elements, `(0, 0)` for zero-length input.
    ///
    /// Each round produces per-block minima and maxima in two parallel buffers, which are
    /// concatenated and fed to the next round: the minimum over both partial sets is the global
    /// minimum and likewise for the maximum.
    pub fn find_min_and_max(&self, a: &DeviceBuffer, size: usize) -> CudaResult<(f32, f32)> {
        if size == 0 {
            return Ok((0.0, 0.0));
        }

        let mut current: Option<DeviceBuffer> = None;
        let mut size = size;
        while size as u32 > REDUCE_BLOCK {
            let partials = ceil_div(size as u32, REDUCE_BLOCK) as usize;
            let min_block = self.memory.alloc(partials, true)?;
            let max_block = self.memory.alloc(partials, true)?;
            self.reduction_round(
                Kernel::FindMinAndMax,
                current.as_ref().unwrap_or(a),
                size,
                &[&min_block, &max_block],
                None,
            )?;
            if let Some(previous) = current.take() {
                self.memory.free(previous);
            }

            let joined = self.memory.alloc(partials * 2, false)?;
            {
                let min_guard = min_block.lock();
                let max_guard = max_block.lock();
                let mut joined_guard = joined.lock();
                self.stream
                    .memcpy_dtod(&min_guard.view(), &mut joined_guard.view_range_mut(0, partials))
                    .map_err(|source| CudaError::Driver {
                        context: "concatenating reduction partials",
                        source,
                    })?;
                self.stream
                    .memcpy_dtod(&max_guard.view(), &mut joined_guard.view_range_mut(partials, partials))
                    .map_err(|source| CudaError::Driver {
                        context: "concatenating reduction partials",
                        source,
                    })?;
            }
            self.memory.free(min_block);
            self.memory.free(max_block);

            current = Some(joined);
            size = partials * 2;
        }

        let tail = self.to_host(current.as_ref().unwrap_or(a), size)?;
        if let Some(previous) = current.take() {
            self.memory.free(previous);
        }

        let mut min = f32::MAX;
        let mut max = f32::MIN;
        for &value in &tail {
            min = min.min(value);
            max = max.max(value);
        }
        Ok((min, max))
    }

    /// The standard deviation around the caller-supplied `mean`, zero for zero-length input.
    ///
    /// The first round maps every element to its squared deviation and sums per block; the
    /// remaining rounds are plain partial sums, finished with `sqrt(sum / n)` on the host.
    pub fn find_std_dev(&self, a: &DeviceBuffer, size: usize, mean: f32) -> CudaResult<f32> {
        if size == 0 {
            return Ok(0.0);
        }
        let input_size = size;

        let partials = ceil_div(size as u32, REDUCE_BLOCK) as usize;
        let deviations = self.memory.alloc(partials, true)?;
        self.reduction_round(Kernel::FindStdDev, a, size, &[&deviations], Some(mean))?;

        let mut current = deviations;
        let mut size = partials;
        while size as u32 > REDUCE_BLOCK {
            let partials = ceil_div(size as u32, REDUCE_BLOCK) as usize;
            let sums = self.memory.alloc(partials, true)?;
            self.reduction_round(Kernel::FindSum, &current, size, &[&sums], None)?;
            self.memory.free(current);
            current = sums;
            size = partials;
        }

        let tail = self.to_host(&current, size)?;
        self.memory.free(current);
        let total: f32 = tail.iter().sum();
        Ok((total / input_size as f32).sqrt())
    }

    // ------------------------------------------------------------------
    // distances
    // ------------------------------------------------------------------

    /// `sqrt(sum((a - b)^2))`.
    pub fn euclidean_distance(&self, a: &DeviceBuffer, b: &DeviceBuffer, size: usize) -> CudaResult<f32> {
        let squares = self.binary_distance_pass(Kernel::EuclideanDistance, a, b, size)?;
        let sum = self.sum_values(&squares, size)?;
        self.memory.free(squares);
        Ok(sum.sqrt())
    }

    /// `sum(|a - b|)`.
    pub fn manhattan_distance(&self, a: &DeviceBuffer, b: &DeviceBuffer, size: usize) -> CudaResult<f32> {
        let differences = self.binary_distance_pass(Kernel::ManhattanDistance, a, b, size)?;
        let sum = self.sum_values(&differences, size)?;
        self.memory.free(differences);
        Ok(sum)
    }

    fn binary_distance_pass(
        &self,
        kernel: Kernel,
        a: &DeviceBuffer,
        b: &DeviceBuffer,
        size: usize,
    ) -> CudaResult<DeviceBuffer> {
        let ret = self.memory.alloc(size, false)?;
        if size > 0 {
            let function = self.kernels.get(kernel);
            let config = self.planner.plan(kernel, function, LaunchShape::D1(size))?;

            let a_guard = a.lock();
            let b_guard = b.lock();
            let mut ret_guard = ret.lock();
            let a_view = a_guard.view_range(0, size);
            let b_view = b_guard.view_range(0, size);
            let mut ret_view = ret_guard.view_mut();
            let n = size as i32;

            let mut launch = self.stream.launch_builder(function);
            launch.arg(&a_view);
            launch.arg(&b_view);
            launch.arg(&mut ret_view);
            launch.arg(&n);
            unsafe { launch.launch(config) }.map_err(driver_err(kernel))?;
        }
        Ok(ret)
    }

    /// `1 - a·b / (|a| |b|)`. Two zero vectors are at distance 0; a zero and a nonzero vector are
    /// at distance 1.
    pub fn cosine_distance(&self, a: &DeviceBuffer, b: &DeviceBuffer, size: usize) -> CudaResult<f32> {
        if size == 0 {
            return Ok(0.0);
        }
        let kernel = Kernel::CosineDistance;
        let aa = self.memory.alloc(1, true)?;
        let ab = self.memory.alloc(1, true)?;
        let bb = self.memory.alloc(1, true)?;

        {
            let function = self.kernels.get(kernel);
            let config = self.planner.plan(kernel, function, LaunchShape::D1(size))?;

            let a_guard = a.lock();
            let b_guard = b.lock();
            let mut aa_guard = aa.lock();
            let mut ab_guard = ab.lock();
            let mut bb_guard = bb.lock();
            let a_view = a_guard.view_range(0, size);
            let b_view = b_guard.view_range(0, size);
            let mut aa_view = aa_guard.view_mut();
            let mut ab_view = ab_guard.view_mut();
            let mut bb_view = bb_guard.view_mut();
            let n = size as i32;

            let mut launch = self.stream.launch_builder(function);
            launch.arg(&a_view);
            launch.arg(&b_view);
            launch.arg(&mut aa_view);
            launch.arg(&mut ab_view);
            launch.arg(&mut bb_view);
            launch.arg(&n);
            unsafe { launch.launch(config) }.map_err(driver_err(kernel))?;
        }

        let aa_value = self.get_at(&aa, 0)?;
        let ab_value = self.get_at(&ab, 0)?;
        let bb_value = self.get_at(&bb, 0)?;
        self.memory.free(aa);
        self.memory.free(ab);
        self.memory.free(bb);

        Ok(cosine_from_accumulators(aa_value, ab_value, bb_value))
    }

    /// The full pairwise distance matrix between `vectors` and `compare_to` in one 3D launch,
    /// returned as a row-major `compare_to.len()`×`vectors.len()` matrix.
    pub fn calculate_distances(
        &self,
        vectors: &[DeviceBuffer],
        compare_to: &[DeviceBuffer],
        metric: DistanceMetric,
    ) -> CudaResult<(DeviceBuffer, usize, usize)> {
        assert!(
            !vectors.is_empty() && !compare_to.is_empty(),
            "Distance matrix requires at least one vector on each side"
        );
        let size = vectors[0].len();
        assert!(
            vectors.iter().chain(compare_to.iter()).all(|v| v.len() == size),
            "All vectors must have the same length"
        );

        let rows = compare_to.len();
        let columns = vectors.len();
        let ret = self.memory.alloc(rows * columns, true)?;
        if size == 0 {
            // every pair is a pair of empty vectors: distance 0 under all metrics
            return Ok((ret, rows, columns));
        }

        // stage both sides contiguously so one kernel can address them arithmetically
        let stacked_vectors = self.stack_vectors(vectors, size)?;
        let stacked_compare = self.stack_vectors(compare_to, size)?;

        let shape = LaunchShape::D3 {
            rows: size,
            columns,
            depth: rows,
        };

        match metric {
            DistanceMetric::Euclidean | DistanceMetric::Manhattan => {
                let kernel = Kernel::CalculateDistances;
                let function = self.kernels.get(kernel);
                let config = self.planner.plan(kernel, function, shape)?;

                {
                    let v_guard = stacked_vectors.lock();
                    let c_guard = stacked_compare.lock();
                    let mut ret_guard = ret.lock();
                    let v_view = v_guard.view();
                    let c_view = c_guard.view();
                    let mut ret_view = ret_guard.view_mut();
                    let (rows_arg, columns_arg, size_arg) = (rows as i32, columns as i32, size as i32);
                    let metric_arg = metric.id();

                    let mut launch = self.stream.launch_builder(function);
                    launch.arg(&v_view);
                    launch.arg(&c_view);
                    launch.arg(&mut ret_view);
                    launch.arg(&rows_arg);
                    launch.arg(&columns_arg);
                    launch.arg(&size_arg);
                    launch.arg(&metric_arg);
                    unsafe { launch.launch(config) }.map_err(driver_err(kernel))?;
                }

                if metric == DistanceMetric::Euclidean {
                    self.sqrt_in_place(&ret, rows * columns)?;
                }
            }
            DistanceMetric::Cosine => {
                let aa = self.memory.alloc(rows * columns, true)?;
                let bb = self.memory.alloc(rows * columns, true)?;

                {
                    let kernel = Kernel::MultiCosineDistance;
                    let function = self.kernels.get(kernel);
                    let config = self.planner.plan(kernel, function, shape)?;

                    let v_guard = stacked_vectors.lock();
                    let c_guard = stacked_compare.lock();
                    let mut aa_guard = aa.lock();
                    let mut ab_guard = ret.lock();
                    let mut bb_guard = bb.lock();
                    let v_view = v_guard.view();
                    let c_view = c_guard.view();
                    let mut aa_view = aa_guard.view_mut();
                    let mut ab_view = ab_guard.view_mut();
                    let mut bb_view = bb_guard.view_mut();
                    let (rows_arg, columns_arg, size_arg) = (rows as i32, columns as i32, size as i32);

                    let mut launch = self.stream.launch_builder(function);
                    launch.arg(&v_view);
                    launch.arg(&c_view);
                    launch.arg(&mut aa_view);
                    launch.arg(&mut ab_view);
                    launch.arg(&mut bb_view);
                    launch.arg(&rows_arg);
                    launch.arg(&columns_arg);
                    launch.arg(&size_arg);
                    unsafe { launch.launch(config) }.map_err(driver_err(kernel))?;
                }

                {
                    let kernel = Kernel::CosineFinish;
                    let function = self.kernels.get(kernel);
                    let total = rows * columns;
                    let config = self.planner.plan(kernel, function, LaunchShape::D1(total))?;

                    let aa_guard = aa.lock();
                    let bb_guard = bb.lock();
                    let mut ret_guard = ret.lock();
                    let aa_view = aa_guard.view();
                    let bb_view = bb_guard.view();
                    let mut ret_view = ret_guard.view_mut();
                    let n = total as i32;

                    let mut launch = self.stream.launch_builder(function);
                    launch.arg(&aa_view);
                    launch.arg(&mut ret_view);
                    launch.arg(&bb_view);
                    launch.arg(&n);
                    unsafe { launch.launch(config) }.map_err(driver_err(kernel))?;
                }

                self.memory.free(aa);
                self.memory.free(bb);
            }
        }

        self.memory.free(stacked_vectors);
        self.memory.free(stacked_compare);
        Ok((ret, rows, columns))
    }

    fn stack_vectors(&self, vectors: &[DeviceBuffer], size: usize) -> CudaResult<DeviceBuffer> {
        let stacked = self.memory.alloc(vectors.len() * size, false)?;
        let mut stacked_guard = stacked.lock();
        for (index, vector) in vectors.iter().enumerate() {
            let v_guard = vector.lock();
            self.stream
                .memcpy_dtod(&v_guard.view(), &mut stacked_guard.view_range_mut(index * size, size))
                .map_err(|source| CudaError::Driver {
                    context: "staging vectors for the distance matrix",
                    source,
                })?;
        }
        drop(stacked_guard);
        Ok(stacked)
    }

    /// Replace the first `size` elements with their square roots.
    fn sqrt_in_place(&self, a: &DeviceBuffer, size: usize) -> CudaResult<()> {
        self.in_place_op(Kernel::SqrtInPlace, a, size, &[])
    }

    // ------------------------------------------------------------------
    // diagnostics
    // ------------------------------------------------------------------

    /// Whether every element of `a` is finite (no NaN or infinity).
    pub fn is_finite(&self, a: &DeviceBuffer, size: usize) -> CudaResult<bool> {
        if size == 0 {
            return Ok(true);
        }
        let flags = self.unary_op(Kernel::IsFinite, a, size)?;
        let non_finite = self.sum_values(&flags, size)?;
        self.memory.free(flags);
        Ok(non_finite == 0.0)
    }
}

impl Drop for CudaEngine {
    fn drop(&mut self) {
        // release every layer, including the base one, before the context goes away
        self.memory.clear();
    }
}

fn mem_info() -> CudaResult<(usize, usize)> {
    cudarc::driver::result::mem_get_info().map_err(|source| CudaError::Driver {
        context: "querying device memory",
        source,
    })
}

fn cosine_from_accumulators(aa: f32, ab: f32, bb: f32) -> f32 {
    if aa == 0.0 && bb == 0.0 {
        0.0
    } else if aa == 0.0 || bb == 0.0 {
        1.0
    } else {
        1.0 - ab / aa.sqrt() / bb.sqrt()
    }
}
