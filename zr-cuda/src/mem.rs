use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use cudarc::driver::{CudaSlice, CudaStream, CudaView, CudaViewMut};

use crate::error::{CudaError, CudaResult};

const ELEMENT_BYTES: usize = std::mem::size_of::<f32>();

/// A handle to a device allocation owned by a [MemoryPool].
///
/// A buffer is created by [MemoryPool::alloc] with a reference count of one, and its storage is
/// recycled once every handle referring to it has been passed to [MemoryPool::free]. Views created
/// with [MemoryPool::offset] share the underlying storage and hold an extra reference, so the
/// storage outlives every view.
///
/// Using a buffer after it was freed, or after the layer it was allocated in was popped, is a
/// contract violation and panics on the validity check.
pub struct DeviceBuffer {
    block: Arc<Block>,
    offset: usize,
    len: usize,
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("layer", &self.block.layer)
            .field("valid", &self.is_valid())
            .finish()
    }
}

struct Block {
    /// Index of the layer this block was allocated in, the generation tag.
    layer: usize,
    /// Capacity in elements, the free-list key. May exceed the requested length for zero-size
    /// requests, which are backed by a single element.
    capacity: usize,
    refs: AtomicIsize,
    valid: AtomicBool,
    storage: Mutex<Option<CudaSlice<f32>>>,
}

impl DeviceBuffer {
    /// Length in elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.len * ELEMENT_BYTES
    }

    pub fn is_valid(&self) -> bool {
        self.block.valid.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same underlying allocation.
    pub fn shares_storage_with(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.block, &other.block)
    }

    pub(crate) fn lock(&self) -> StorageGuard<'_> {
        assert!(
            self.is_valid(),
            "Use of a device buffer that was freed or released by pop_layer"
        );
        StorageGuard {
            guard: self.block.storage.lock().unwrap(),
            offset: self.offset,
            len: self.len,
        }
    }
}

/// Exclusive access to a buffer's storage for the duration of one device operation.
pub(crate) struct StorageGuard<'a> {
    guard: MutexGuard<'a, Option<CudaSlice<f32>>>,
    offset: usize,
    len: usize,
}

impl StorageGuard<'_> {
    fn slice(&self) -> &CudaSlice<f32> {
        self.guard
            .as_ref()
            .expect("Use of a device buffer that was freed or released by pop_layer")
    }

    pub fn view(&self) -> CudaView<'_, f32> {
        self.view_range(0, self.len)
    }

    pub fn view_mut(&mut self) -> CudaViewMut<'_, f32> {
        self.view_range_mut(0, self.len)
    }

    pub fn view_range(&self, start: usize, len: usize) -> CudaView<'_, f32> {
        assert!(start + len <= self.len, "View range out of bounds");
        self.slice().slice(self.offset + start..self.offset + start + len)
    }

    pub fn view_range_mut(&mut self, start: usize, len: usize) -> CudaViewMut<'_, f32> {
        assert!(start + len <= self.len, "View range out of bounds");
        let offset = self.offset;
        self.guard
            .as_mut()
            .expect("Use of a device buffer that was freed or released by pop_layer")
            .slice_mut(offset + start..offset + start + len)
    }
}

/// A layered, reference-counted pool of device buffers with bulk release at layer boundaries.
///
/// Training loops allocate and discard thousands of intermediate tensors per step. The pool keeps
/// released storage on a per-layer free list keyed by exact capacity, so tensors of identical
/// shape allocated every iteration skip the device allocator entirely, and [MemoryPool::pop_layer]
/// turns per-step cleanup into one bulk release.
///
/// The pool starts with a single base layer; [MemoryPool::push_layer]/[MemoryPool::pop_layer]
/// bracket a unit of computation and must nest like a stack.
pub struct MemoryPool {
    stream: Arc<CudaStream>,
    state: Mutex<PoolState>,
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("layers", &self.state.lock().unwrap().layers.len())
            .finish()
    }
}

struct PoolState {
    layers: Vec<MemoryLayer>,
}

#[derive(Default)]
struct MemoryLayer {
    /// Released storage available for reuse, keyed by capacity.
    free: HashMap<usize, Vec<CudaSlice<f32>>>,
    /// Every block allocated while this layer was on top. Freed blocks stay in the list with
    /// their storage already moved out; pop skips them.
    allocated: Vec<Arc<Block>>,
}

impl MemoryPool {
    pub fn new(stream: Arc<CudaStream>) -> MemoryPool {
        MemoryPool {
            stream,
            state: Mutex::new(PoolState {
                layers: vec![MemoryLayer::default()],
            }),
        }
    }

    /// Allocate a buffer of `size` elements, preferring reuse of previously released storage of
    /// the same capacity from the current layer or any ancestor.
    pub fn alloc(&self, size: usize, zero_init: bool) -> CudaResult<DeviceBuffer> {
        let capacity = size.max(1);

        let mut state = self.state.lock().unwrap();
        let layer_index = state
            .layers
            .len()
            .checked_sub(1)
            .expect("Memory pool has been disposed");

        let mut reused = None;
        for layer in state.layers.iter_mut().rev() {
            if let Some(list) = layer.free.get_mut(&capacity) {
                if let Some(slice) = list.pop() {
                    reused = Some(slice);
                    break;
                }
            }
        }

        let slice = match reused {
            Some(mut slice) => {
                if zero_init {
                    self.stream
                        .memset_zeros(&mut slice)
                        .map_err(|source| CudaError::Driver {
                            context: "clearing a reused buffer",
                            source,
                        })?;
                }
                slice
            }
            None => self.fresh_alloc(capacity, zero_init)?,
        };

        let block = Arc::new(Block {
            layer: layer_index,
            capacity,
            refs: AtomicIsize::new(1),
            valid: AtomicBool::new(true),
            storage: Mutex::new(Some(slice)),
        });
        state.layers[layer_index].allocated.push(Arc::clone(&block));

        Ok(DeviceBuffer {
            block,
            offset: 0,
            len: size,
        })
    }

    fn fresh_alloc(&self, capacity: usize, zero_init: bool) -> CudaResult<CudaSlice<f32>> {
        let result = if zero_init {
            self.stream.alloc_zeros::<f32>(capacity)
        } else {
            unsafe { self.stream.alloc::<f32>(capacity) }
        };
        result.map_err(|source| {
            let (free_bytes, total_bytes) = cudarc::driver::result::mem_get_info().unwrap_or((0, 0));
            CudaError::OutOfDeviceMemory {
                requested_bytes: capacity * ELEMENT_BYTES,
                free_bytes,
                total_bytes,
                source,
            }
        })
    }

    /// Release one reference to the buffer. Once the owning handle and every view created from it
    /// have been freed, the storage returns to the free list of the buffer's allocation layer.
    pub fn free(&self, buffer: DeviceBuffer) {
        let block = &buffer.block;
        assert!(
            block.valid.load(Ordering::Acquire),
            "Free of a device buffer that was already released by pop_layer"
        );

        let remaining = block.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        assert!(remaining >= 0, "Double free of a device buffer");
        if remaining > 0 {
            return;
        }

        block.valid.store(false, Ordering::Release);
        let slice = block
            .storage
            .lock()
            .unwrap()
            .take()
            .expect("Storage of a live buffer cannot be gone");

        let mut state = self.state.lock().unwrap();
        // the allocation layer must still exist, popping it would have invalidated the block
        state.layers[block.layer]
            .free
            .entry(block.capacity)
            .or_default()
            .push(slice);
    }

    /// A non-owning alias view of `size` elements starting `element_offset` into `buffer`.
    ///
    /// The view holds a reference on the parent's storage, so the storage is recycled only after
    /// the parent and every view have been freed.
    pub fn offset(&self, buffer: &DeviceBuffer, element_offset: usize, size: usize) -> DeviceBuffer {
        assert!(
            element_offset + size <= buffer.len,
            "View of {} elements at offset {} is out of range for a buffer of {} elements",
            size,
            element_offset,
            buffer.len
        );
        assert!(
            buffer.block.valid.load(Ordering::Acquire),
            "Cannot create a view into a freed device buffer"
        );

        buffer.block.refs.fetch_add(1, Ordering::AcqRel);
        DeviceBuffer {
            block: Arc::clone(&buffer.block),
            offset: buffer.offset + element_offset,
            len: size,
        }
    }

    pub fn push_layer(&self) {
        let mut state = self.state.lock().unwrap();
        state.layers.push(MemoryLayer::default());
    }

    /// Release every buffer allocated since the matching [MemoryPool::push_layer], including the
    /// layer's free list, back to the device allocator. Buffers the caller still holds handles to
    /// become invalid.
    pub fn pop_layer(&self) {
        let layer = {
            let mut state = self.state.lock().unwrap();
            assert!(
                state.layers.len() > 1,
                "pop_layer without a matching push_layer"
            );
            state.layers.pop().unwrap()
        };
        release_layer(layer);
    }

    /// Number of layers currently on the stack, including the base layer.
    pub fn layer_count(&self) -> usize {
        self.state.lock().unwrap().layers.len()
    }

    /// Release everything, including the base layer. The pool is unusable afterwards; only called
    /// on engine disposal.
    pub(crate) fn clear(&self) {
        let layers = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.layers)
        };
        for layer in layers {
            release_layer(layer);
        }
    }
}

fn release_layer(layer: MemoryLayer) {
    for block in &layer.allocated {
        if block.valid.swap(false, Ordering::AcqRel) {
            // dropping the slice returns the memory to the device allocator
            let _ = block.storage.lock().unwrap().take();
        }
    }
    // the free-list storage drops here as well
}
