//! Convolution and pooling operations.
//!
//! Tensors are dense f32 buffers in row-major layout: element `(r, c, d, n)` of a
//! rows×columns×depth×count tensor lives at `((n * depth + d) * rows + r) * columns + c`.
//! Matrices produced by im2col and consumed by reverse im2col follow the same convention,
//! one row-major matrix per tensor instance.

use cudarc::driver::PushKernelArg;
use itertools::Itertools;

use crate::conv::{ConvolutionPlan, ConvolutionShape};
use crate::engine::{driver_err, CudaEngine};
use crate::error::{CudaError, CudaResult};
use crate::kernels::Kernel;
use crate::launch::LaunchShape;
use crate::mem::DeviceBuffer;

/// The (x, y) placement table of a [ConvolutionPlan], resident on the device.
struct ConvolutionTable {
    x: DeviceBuffer,
    y: DeviceBuffer,
}

impl CudaEngine {
    fn upload_convolution_plan(&self, plan: &ConvolutionPlan) -> CudaResult<ConvolutionTable> {
        let xs = plan.offsets().iter().map(|&(x, _)| x).collect_vec();
        let ys = plan.offsets().iter().map(|&(_, y)| y).collect_vec();

        let x = self.memory().alloc(xs.len(), false)?;
        let y = self.memory().alloc(ys.len(), false)?;
        if !xs.is_empty() {
            // the pool stores f32 words, the index table is bit-cast i32 pairs
            self.upload_words(bytemuck::cast_slice(&xs), &x)?;
            self.upload_words(bytemuck::cast_slice(&ys), &y)?;
        }
        Ok(ConvolutionTable { x, y })
    }

    fn upload_words(&self, words: &[f32], target: &DeviceBuffer) -> CudaResult<()> {
        let mut guard = target.lock();
        self.stream()
            .memcpy_htod(words, &mut guard.view_mut())
            .map_err(|source| CudaError::Driver {
                context: "uploading the convolution index table",
                source,
            })
    }

    fn free_convolution_table(&self, table: ConvolutionTable) {
        self.memory().free(table.x);
        self.memory().free(table.y);
    }

    /// Surround every rows×columns slice with `padding` rows and columns of zeros.
    pub fn tensor_add_padding(
        &self,
        tensor: &DeviceBuffer,
        rows: usize,
        columns: usize,
        depth: usize,
        count: usize,
        padding: usize,
    ) -> CudaResult<(DeviceBuffer, usize, usize)> {
        let output_rows = rows + padding * 2;
        let output_columns = columns + padding * 2;
        let output_size = output_rows * output_columns * depth * count;

        let ret = self.memory().alloc(output_size, true)?;
        if output_size > 0 {
            let kernel = Kernel::TensorAddPadding;
            let function = self.kernels().get(kernel);
            let config = self.planner().plan(kernel, function, LaunchShape::D1(output_size))?;

            let t_guard = tensor.lock();
            let mut ret_guard = ret.lock();
            let t_view = t_guard.view();
            let mut ret_view = ret_guard.view_mut();
            let n = output_size as i32;
            let dims = [
                rows as i32,
                columns as i32,
                depth as i32,
                count as i32,
                output_rows as i32,
                output_columns as i32,
                padding as i32,
            ];

            let mut launch = self.stream().launch_builder(function);
            launch.arg(&t_view);
            launch.arg(&mut ret_view);
            launch.arg(&n);
            for dim in &dims {
                launch.arg(dim);
            }
            unsafe { launch.launch(config) }.map_err(driver_err(kernel))?;
        }
        Ok((ret, output_rows, output_columns))
    }

    /// The inverse of [Self::tensor_add_padding]: strip `padding` rows and columns from every
    /// slice border.
    pub fn tensor_remove_padding(
        &self,
        tensor: &DeviceBuffer,
        rows: usize,
        columns: usize,
        depth: usize,
        count: usize,
        padding: usize,
    ) -> CudaResult<(DeviceBuffer, usize, usize)> {
        assert!(
            rows >= padding * 2 && columns >= padding * 2,
            "Cannot remove padding {} from a {}x{} tensor",
            padding,
            rows,
            columns
        );
        let output_rows = rows - padding * 2;
        let output_columns = columns - padding * 2;
        let output_size = output_rows * output_columns * depth * count;

        let ret = self.memory().alloc(output_size, false)?;
        if output_size > 0 {
            let kernel = Kernel::TensorRemovePadding;
            let function = self.kernels().get(kernel);
            let config = self.planner().plan(kernel, function, LaunchShape::D1(output_size))?;

            let t_guard = tensor.lock();
            let mut ret_guard = ret.lock();
            let t_view = t_guard.view();
            let mut ret_view = ret_guard.view_mut();
            let n = output_size as i32;
            let dims = [
                rows as i32,
                columns as i32,
                depth as i32,
                count as i32,
                output_rows as i32,
                output_columns as i32,
                padding as i32,
            ];

            let mut launch = self.stream().launch_builder(function);
            launch.arg(&t_view);
            launch.arg(&mut ret_view);
            launch.arg(&n);
            for dim in &dims {
                launch.arg(dim);
            }
            unsafe { launch.launch(config) }.map_err(driver_err(kernel))?;
        }
        Ok((ret, output_rows, output_columns))
    }

    /// Rearrange every filter window into a matrix row, one matrix per tensor instance.
    ///
    /// The result has one row per filter placement and `filter_width * filter_height * depth`
    /// columns, so a convolution becomes an ordinary matrix multiplication against a filter
    /// matrix. Returns `(buffer, rows, columns, count)` of the matrix stack.
    pub fn tensor_im2col(
        &self,
        tensor: &DeviceBuffer,
        rows: usize,
        columns: usize,
        depth: usize,
        count: usize,
        filter_width: usize,
        filter_height: usize,
        x_stride: usize,
        y_stride: usize,
    ) -> CudaResult<(DeviceBuffer, usize, usize, usize)> {
        let plan = self.plans.get(ConvolutionShape {
            rows,
            columns,
            filter_height,
            filter_width,
            y_stride,
            x_stride,
        });
        let filter_size = filter_width * filter_height;
        let output_rows = plan.len();
        let output_columns = filter_size * depth;
        let output_size = output_rows * output_columns * count;

        let ret = self.memory().alloc(output_size, true)?;
        if output_size > 0 {
            let table = self.upload_convolution_plan(&plan)?;
            {
                let kernel = Kernel::TensorIm2Col;
                let function = self.kernels().get(kernel);
                let config = self.planner().plan(kernel, function, LaunchShape::D1(output_size))?;

                let t_guard = tensor.lock();
                let x_guard = table.x.lock();
                let y_guard = table.y.lock();
                let mut ret_guard = ret.lock();
                let t_view = t_guard.view();
                let x_view = x_guard.view();
                let y_view = y_guard.view();
                let mut ret_view = ret_guard.view_mut();
                let n = output_size as i32;
                let dims = [
                    rows as i32,
                    columns as i32,
                    depth as i32,
                    count as i32,
                    output_rows as i32,
                    output_columns as i32,
                    filter_width as i32,
                    filter_height as i32,
                ];

                let mut launch = self.stream().launch_builder(function);
                launch.arg(&t_view);
                launch.arg(&mut ret_view);
                launch.arg(&x_view);
                launch.arg(&y_view);
                launch.arg(&n);
                for dim in &dims {
                    launch.arg(dim);
                }
                unsafe { launch.launch(config) }.map_err(driver_err(kernel))?;
            }
            self.free_convolution_table(table);
        }
        Ok((ret, output_rows, output_columns, count))
    }

    /// Max-pool every rows×columns slice. The index buffer records, per output cell, the flat
    /// input index that produced the maximum; it is always well-defined and only returned when
    /// `save_indices` is set (the reverse pass needs it).
    ///
    /// Returns `(buffer, indices, output_rows, output_columns)`.
    pub fn tensor_max_pool(
        &self,
        tensor: &DeviceBuffer,
        rows: usize,
        columns: usize,
        depth: usize,
        count: usize,
        filter_width: usize,
        filter_height: usize,
        x_stride: usize,
        y_stride: usize,
        save_indices: bool,
    ) -> CudaResult<(DeviceBuffer, Option<DeviceBuffer>, usize, usize)> {
        let plan = self.plans.get(ConvolutionShape {
            rows,
            columns,
            filter_height,
            filter_width,
            y_stride,
            x_stride,
        });
        let output_rows = plan.shape().output_rows();
        let output_columns = plan.shape().output_columns();
        let output_size = output_rows * output_columns * depth * count;

        let ret = self.memory().alloc(output_size, true)?;
        let indices = self.memory().alloc(output_size, true)?;

        let size = plan.len() * depth * count;
        if size > 0 {
            let table = self.upload_convolution_plan(&plan)?;
            {
                let kernel = Kernel::TensorMaxPool;
                let function = self.kernels().get(kernel);
                let config = self.planner().plan(kernel, function, LaunchShape::D1(size))?;

                let t_guard = tensor.lock();
                let x_guard = table.x.lock();
                let y_guard = table.y.lock();
                let mut ret_guard = ret.lock();
                let mut indices_guard = indices.lock();
                let t_view = t_guard.view();
                let x_view = x_guard.view();
                let y_view = y_guard.view();
                let mut ret_view = ret_guard.view_mut();
                let mut indices_view = indices_guard.view_mut();
                let n = size as i32;
                let dims = [
                    plan.len() as i32,
                    rows as i32,
                    columns as i32,
                    depth as i32,
                    count as i32,
                    output_rows as i32,
                    output_columns as i32,
                    filter_width as i32,
                    filter_height as i32,
                ];

                let mut launch = self.stream().launch_builder(function);
                launch.arg(&t_view);
                launch.arg(&mut ret_view);
                launch.arg(&mut indices_view);
                launch.arg(&x_view);
                launch.arg(&y_view);
                launch.arg(&n);
                for dim in &dims {
                    launch.arg(dim);
                }
                unsafe { launch.launch(config) }.map_err(driver_err(kernel))?;
            }
            self.free_convolution_table(table);
        }

        let indices = if save_indices {
            Some(indices)
        } else {
            self.memory().free(indices);
            None
        };
        Ok((ret, indices, output_rows, output_columns))
    }

    /// Scatter a pooled gradient back through the indices recorded by [Self::tensor_max_pool].
    ///
    /// `rows`/`columns` are the pooled dimensions of `tensor`, `output_rows`/`output_columns` the
    /// dimensions of the original input. Scatters accumulate atomically, so overlapping pooling
    /// windows that recorded the same input cell are summed instead of racing.
    pub fn tensor_reverse_max_pool(
        &self,
        tensor: &DeviceBuffer,
        indices: &DeviceBuffer,
        rows: usize,
        columns: usize,
        depth: usize,
        count: usize,
        output_rows: usize,
        output_columns: usize,
    ) -> CudaResult<DeviceBuffer> {
        let output_size = output_rows * output_columns * depth * count;
        let size = rows * columns * depth * count;

        let ret = self.memory().alloc(output_size, true)?;
        if size > 0 && output_size > 0 {
            let kernel = Kernel::TensorReverseMaxPool;
            let function = self.kernels().get(kernel);
            let config = self.planner().plan(kernel, function, LaunchShape::D1(size))?;

            let t_guard = tensor.lock();
            let i_guard = indices.lock();
            let mut ret_guard = ret.lock();
            let t_view = t_guard.view_range(0, size);
            let i_view = i_guard.view_range(0, size);
            let mut ret_view = ret_guard.view_mut();
            let (n, output_size) = (size as i32, output_size as i32);

            let mut launch = self.stream().launch_builder(function);
            launch.arg(&t_view);
            launch.arg(&i_view);
            launch.arg(&mut ret_view);
            launch.arg(&n);
            launch.arg(&output_size);
            unsafe { launch.launch(config) }.map_err(driver_err(kernel))?;
        }
        Ok(ret)
    }

    /// Reconstruct an input-shaped gradient from an upstream gradient and a rotated filter
    /// matrix, re-running the forward placement table in reverse.
    ///
    /// `tensor` is the upstream gradient of shape rows×columns×depth×count, where rows and
    /// columns are the placement counts of the forward convolution over an
    /// `output_rows`×`output_columns` input and `depth` is the forward output channel count.
    /// `filters` is a row-major `depth * filter_size`×`output_depth` matrix, rotated by the
    /// caller. Every input cell accumulates atomically over all placements touching it, so
    /// overlapping strides are supported.
    ///
    /// Returns `(buffer, output_rows, output_columns, output_depth)`.
    pub fn tensor_reverse_im2col(
        &self,
        tensor: &DeviceBuffer,
        filters: &DeviceBuffer,
        rows: usize,
        columns: usize,
        depth: usize,
        count: usize,
        output_rows: usize,
        output_columns: usize,
        output_depth: usize,
        filter_width: usize,
        filter_height: usize,
        x_stride: usize,
        y_stride: usize,
    ) -> CudaResult<(DeviceBuffer, usize, usize, usize)> {
        let plan = self.plans.get(ConvolutionShape {
            rows: output_rows,
            columns: output_columns,
            filter_height,
            filter_width,
            y_stride,
            x_stride,
        });
        let output_size = output_rows * output_columns * output_depth * count;
        let size = depth * plan.len() * filter_height * filter_width * output_depth * count;

        let ret = self.memory().alloc(output_size, true)?;
        if size > 0 {
            let table = self.upload_convolution_plan(&plan)?;
            {
                let kernel = Kernel::TensorReverseIm2Col;
                let function = self.kernels().get(kernel);
                let config = self.planner().plan(kernel, function, LaunchShape::D1(size))?;

                let t_guard = tensor.lock();
                let f_guard = filters.lock();
                let x_guard = table.x.lock();
                let y_guard = table.y.lock();
                let mut ret_guard = ret.lock();
                let t_view = t_guard.view();
                let f_view = f_guard.view();
                let x_view = x_guard.view();
                let y_view = y_guard.view();
                let mut ret_view = ret_guard.view_mut();
                let n = size as i32;
                let dims = [
                    rows as i32,
                    columns as i32,
                    depth as i32,
                    count as i32,
                    plan.len() as i32,
                    filter_width as i32,
                    filter_height as i32,
                    output_rows as i32,
                    output_columns as i32,
                    output_depth as i32,
                ];

                let mut launch = self.stream().launch_builder(function);
                launch.arg(&t_view);
                launch.arg(&f_view);
                launch.arg(&mut ret_view);
                launch.arg(&x_view);
                launch.arg(&y_view);
                launch.arg(&n);
                for dim in &dims {
                    launch.arg(dim);
                }
                unsafe { launch.launch(config) }.map_err(driver_err(kernel))?;
            }
            self.free_convolution_table(table);
        }
        Ok((ret, output_rows, output_columns, output_depth))
    }
}
