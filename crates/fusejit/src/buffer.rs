//! Owned N-dimensional buffers and their native (`#[repr(C)]`) header.
//!
//! A [`Buffer`] is a boxed [`RawBuffer`] header followed by the Rust-side storage the header
//! points into. Because the header is the first field of a `#[repr(C)]` allocation, a pointer to
//! the allocation is a valid `fusejit_buffer*` on the native side, and ownership can move across
//! the boundary with [`Buffer::into_raw`] / [`Buffer::from_raw`] without copying data.

use std::ffi::c_void;
use std::fmt;
use std::ptr;

use crate::dtype::{DType, Element};
use crate::error::{JitError, JitResult};

/// Strides describe a dense row-major (last axis fastest) layout.
pub const FLAG_ROW_MAJOR: u32 = 1;
/// Strides describe a dense column-major (first axis fastest) layout.
pub const FLAG_COL_MAJOR: u32 = 2;

#[repr(C)]
#[derive(Debug)]
pub struct RawBuffer {
    pub dtype: u32,
    pub rank: u32,
    pub dims: *const i64,
    /// Per-axis strides in bytes.
    pub strides: *const i64,
    pub data: *mut c_void,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    RowMajor,
    ColumnMajor,
}

#[repr(C)]
struct Storage {
    raw: RawBuffer,
    dtype: DType,
    shape: Vec<usize>,
    dims: Vec<i64>,
    strides: Vec<i64>,
    words: Vec<u64>,
}

pub struct Buffer {
    storage: Box<Storage>,
}

// The header only points into heap storage owned by the same allocation.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    pub fn zeros(dtype: DType, dims: &[usize]) -> JitResult<Self> {
        Self::allocate(dtype, dims, Layout::RowMajor)
    }

    pub fn scalar<T: Element>(value: T) -> JitResult<Self> {
        Self::from_slice(&[], &[value])
    }

    /// Builds a row-major buffer from `values` given in row-major order.
    pub fn from_slice<T: Element>(dims: &[usize], values: &[T]) -> JitResult<Self> {
        Self::from_slice_with_layout(dims, values, Layout::RowMajor)
    }

    /// Builds a buffer with the requested physical layout; `values` are in logical row-major
    /// order regardless of `layout`.
    pub fn from_slice_with_layout<T: Element>(
        dims: &[usize],
        values: &[T],
        layout: Layout,
    ) -> JitResult<Self> {
        let buffer = Self::allocate(T::DTYPE, dims, layout)?;
        if values.len() != buffer.len() {
            return Err(JitError::invocation(format!(
                "buffer of shape {dims:?} needs {} values, got {}",
                buffer.len(),
                values.len()
            )));
        }
        let base = buffer.storage.raw.data as *mut u8;
        for (linear, value) in values.iter().enumerate() {
            let offset = buffer.byte_offset(linear);
            unsafe { ptr::write_unaligned(base.add(offset) as *mut T, *value) };
        }
        Ok(buffer)
    }

    fn allocate(dtype: DType, dims: &[usize], layout: Layout) -> JitResult<Self> {
        let elem_count = element_count(dims)
            .ok_or_else(|| JitError::runtime(format!("buffer shape {dims:?} overflows")))?;
        let byte_len = elem_count
            .checked_mul(dtype.size())
            .ok_or_else(|| JitError::runtime(format!("buffer shape {dims:?} overflows")))?;
        let word_count = byte_len.div_ceil(8).max(1);
        let mut words = Vec::new();
        words
            .try_reserve_exact(word_count)
            .map_err(|_| JitError::runtime(format!("failed to allocate {byte_len} bytes")))?;
        words.resize(word_count, 0u64);

        let mut dims_i64 = Vec::with_capacity(dims.len());
        for dim in dims {
            let dim = i64::try_from(*dim)
                .map_err(|_| JitError::runtime(format!("extent {dim} does not fit in i64")))?;
            dims_i64.push(dim);
        }
        let strides = match layout {
            Layout::RowMajor => row_major_strides(&dims_i64, dtype.size() as i64),
            Layout::ColumnMajor => column_major_strides(&dims_i64, dtype.size() as i64),
        };
        let flags = layout_flags(&dims_i64, &strides, dtype.size() as i64);

        let mut storage = Box::new(Storage {
            raw: RawBuffer {
                dtype: dtype.tag(),
                rank: dims.len() as u32,
                dims: ptr::null(),
                strides: ptr::null(),
                data: ptr::null_mut(),
                flags,
            },
            dtype,
            shape: dims.to_vec(),
            dims: dims_i64,
            strides,
            words,
        });
        storage.raw.dims = storage.dims.as_ptr();
        storage.raw.strides = storage.strides.as_ptr();
        storage.raw.data = storage.words.as_mut_ptr() as *mut c_void;
        Ok(Self { storage })
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype
    }

    pub fn rank(&self) -> usize {
        self.storage.shape.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.storage.shape
    }

    /// Byte strides, one per axis.
    pub fn strides(&self) -> &[i64] {
        &self.storage.strides
    }

    pub fn flags(&self) -> u32 {
        self.storage.raw.flags
    }

    pub fn is_row_major(&self) -> bool {
        self.flags() & FLAG_ROW_MAJOR != 0
    }

    pub fn is_column_major(&self) -> bool {
        self.flags() & FLAG_COL_MAJOR != 0
    }

    /// Total element count (1 for rank 0).
    pub fn len(&self) -> usize {
        self.storage.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Data pointer, mainly useful to observe whether a buffer was reused or reallocated.
    pub fn data_ptr(&self) -> *const c_void {
        self.storage.raw.data as *const c_void
    }

    /// Reads the elements in logical row-major order, honoring strides.
    pub fn to_vec<T: Element>(&self) -> JitResult<Vec<T>> {
        if T::DTYPE != self.dtype() {
            return Err(JitError::invocation(format!(
                "buffer holds {}, requested {}",
                self.dtype(),
                T::DTYPE
            )));
        }
        let base = self.storage.raw.data as *const u8;
        let count = self.len();
        let mut out = Vec::with_capacity(count);
        for linear in 0..count {
            let offset = self.byte_offset(linear);
            out.push(unsafe { ptr::read_unaligned(base.add(offset) as *const T) });
        }
        Ok(out)
    }

    fn byte_offset(&self, linear: usize) -> usize {
        let mut rem = linear;
        let mut offset = 0i64;
        for (dim, stride) in self.storage.shape.iter().zip(&self.storage.strides).rev() {
            if *dim == 0 {
                return 0;
            }
            offset += (rem % dim) as i64 * stride;
            rem /= dim;
        }
        offset as usize
    }

    pub fn as_raw(&self) -> *const RawBuffer {
        &self.storage.raw as *const RawBuffer
    }

    /// Hands ownership to native code. Must come back through [`Buffer::from_raw`] exactly once.
    pub fn into_raw(self) -> *mut RawBuffer {
        Box::into_raw(self.storage).cast::<RawBuffer>()
    }

    /// # Safety
    /// `raw` must come from [`Buffer::into_raw`] and must not be reclaimed twice.
    pub unsafe fn from_raw(raw: *mut RawBuffer) -> Self {
        Self {
            storage: unsafe { Box::from_raw(raw.cast::<Storage>()) },
        }
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        let source = &self.storage;
        let mut storage = Box::new(Storage {
            raw: RawBuffer {
                dtype: source.raw.dtype,
                rank: source.raw.rank,
                dims: ptr::null(),
                strides: ptr::null(),
                data: ptr::null_mut(),
                flags: source.raw.flags,
            },
            dtype: source.dtype,
            shape: source.shape.clone(),
            dims: source.dims.clone(),
            strides: source.strides.clone(),
            words: source.words.clone(),
        });
        storage.raw.dims = storage.dims.as_ptr();
        storage.raw.strides = storage.strides.as_ptr();
        storage.raw.data = storage.words.as_mut_ptr() as *mut c_void;
        Self { storage }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("dtype", &self.dtype())
            .field("dims", &self.dims())
            .field("strides", &self.strides())
            .finish()
    }
}

pub(crate) fn element_count(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
}

fn row_major_strides(dims: &[i64], elem_size: i64) -> Vec<i64> {
    let mut strides = vec![0i64; dims.len()];
    let mut acc = elem_size;
    for axis in (0..dims.len()).rev() {
        strides[axis] = acc;
        acc = acc.saturating_mul(dims[axis].max(1));
    }
    strides
}

fn column_major_strides(dims: &[i64], elem_size: i64) -> Vec<i64> {
    let mut strides = vec![0i64; dims.len()];
    let mut acc = elem_size;
    for axis in 0..dims.len() {
        strides[axis] = acc;
        acc = acc.saturating_mul(dims[axis].max(1));
    }
    strides
}

fn layout_flags(dims: &[i64], strides: &[i64], elem_size: i64) -> u32 {
    let mut flags = 0;
    if strides == row_major_strides(dims, elem_size).as_slice() {
        flags |= FLAG_ROW_MAJOR;
    }
    if strides == column_major_strides(dims, elem_size).as_slice() {
        flags |= FLAG_COL_MAJOR;
    }
    flags
}
