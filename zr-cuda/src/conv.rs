use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// The (input size, filter size, stride) tuple a [ConvolutionPlan] is computed for.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConvolutionShape {
    pub rows: usize,
    pub columns: usize,
    pub filter_height: usize,
    pub filter_width: usize,
    pub y_stride: usize,
    pub x_stride: usize,
}

impl ConvolutionShape {
    /// Number of valid filter placements along the vertical axis.
    pub fn output_rows(&self) -> usize {
        placements(self.rows, self.filter_height, self.y_stride)
    }

    /// Number of valid filter placements along the horizontal axis.
    pub fn output_columns(&self) -> usize {
        placements(self.columns, self.filter_width, self.x_stride)
    }
}

fn placements(size: usize, filter: usize, stride: usize) -> usize {
    assert!(stride > 0, "Stride must be positive");
    if size >= filter {
        (size - filter) / stride + 1
    } else {
        0
    }
}

/// The precomputed table of valid top-left filter placements for one [ConvolutionShape].
///
/// Placements are enumerated in row-major order (x varies fastest), so placement `p` maps to
/// output cell `(p / output_columns, p % output_columns)`. The table is shared read-only between
/// im2col, max-pooling and their reverse operations on data of the same shape.
#[derive(Debug)]
pub struct ConvolutionPlan {
    shape: ConvolutionShape,
    offsets: Vec<(i32, i32)>,
}

impl ConvolutionPlan {
    fn new(shape: ConvolutionShape) -> ConvolutionPlan {
        let mut offsets = Vec::with_capacity(shape.output_rows() * shape.output_columns());

        let mut y = 0;
        while y + shape.filter_height <= shape.rows {
            let mut x = 0;
            while x + shape.filter_width <= shape.columns {
                offsets.push((x as i32, y as i32));
                x += shape.x_stride;
            }
            y += shape.y_stride;
        }

        ConvolutionPlan { shape, offsets }
    }

    pub fn shape(&self) -> ConvolutionShape {
        self.shape
    }

    /// The (x, y) offset pairs in placement order.
    pub fn offsets(&self) -> &[(i32, i32)] {
        &self.offsets
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Caches one [ConvolutionPlan] per distinct shape tuple.
///
/// Plan generation is idempotent, so a racing first computation is harmless; last write wins.
#[derive(Debug)]
pub struct ConvolutionPlanCache {
    map: RwLock<HashMap<ConvolutionShape, Arc<ConvolutionPlan>>>,
}

impl ConvolutionPlanCache {
    pub fn new() -> ConvolutionPlanCache {
        ConvolutionPlanCache {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, shape: ConvolutionShape) -> Arc<ConvolutionPlan> {
        if let Some(plan) = self.map.read().unwrap().get(&shape) {
            return Arc::clone(plan);
        }

        let plan = Arc::new(ConvolutionPlan::new(shape));
        self.map.write().unwrap().insert(shape, Arc::clone(&plan));
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(rows: usize, columns: usize, filter: usize, stride: usize) -> ConvolutionShape {
        ConvolutionShape {
            rows,
            columns,
            filter_height: filter,
            filter_width: filter,
            y_stride: stride,
            x_stride: stride,
        }
    }

    #[test]
    fn non_overlapping_plan_is_row_major() {
        let plan = ConvolutionPlan::new(shape(4, 4, 2, 2));
        assert_eq!(plan.offsets(), &[(0, 0), (2, 0), (0, 2), (2, 2)]);
        assert_eq!(plan.shape().output_rows(), 2);
        assert_eq!(plan.shape().output_columns(), 2);
    }

    #[test]
    fn stride_clamps_trailing_placements() {
        // x = 4 would need columns 6, so only two placements per axis remain
        let plan = ConvolutionPlan::new(shape(5, 5, 2, 2));
        assert_eq!(plan.len(), 4);
        assert_eq!(plan.shape().output_columns(), 2);
    }

    #[test]
    fn overlapping_plan() {
        let plan = ConvolutionPlan::new(shape(3, 3, 2, 1));
        assert_eq!(plan.offsets(), &[(0, 0), (1, 0), (0, 1), (1, 1)]);
    }

    #[test]
    fn degenerate_input_has_no_placements() {
        let plan = ConvolutionPlan::new(shape(1, 1, 2, 1));
        assert!(plan.is_empty());
        assert_eq!(plan.shape().output_rows(), 0);
    }

    #[test]
    fn cache_returns_shared_plan() {
        let cache = ConvolutionPlanCache::new();
        let a = cache.get(shape(4, 4, 2, 2));
        let b = cache.get(shape(4, 4, 2, 2));
        assert!(Arc::ptr_eq(&a, &b));
    }
}
