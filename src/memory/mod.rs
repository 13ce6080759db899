use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{OxError, OxResult};
use crate::tensor::Layout;
use crate::types::DataType;

/// Scalar element types a `Memory` buffer can be viewed as.
pub trait Element: Copy + Send + Sync + 'static {
    const DATA_TYPE: DataType;
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
}

macro_rules! impl_element {
    ($t:ty, $dt:expr) => {
        impl Element for $t {
            const DATA_TYPE: DataType = $dt;
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(v: f64) -> Self {
                v as $t
            }
        }
    };
}

impl_element!(i8, DataType::I8);
impl_element!(i16, DataType::I16);
impl_element!(i32, DataType::I32);
impl_element!(i64, DataType::I64);
impl_element!(f32, DataType::F32);
impl_element!(f64, DataType::F64);

impl Element for half::f16 {
    const DATA_TYPE: DataType = DataType::F16;
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

#[derive(Debug)]
struct Buffer {
    // u64 words keep every element type naturally aligned
    words: RwLock<Vec<u64>>,
    byte_len: usize,
    attached: bool,
}

/// A reference-counted buffer carrying a `Layout`. Engine-allocated memory
/// is zero-initialised; attached memory takes ownership of caller data.
/// Host access goes through explicit `lock`/`lock_mut` views; the view
/// unlocks when dropped. Cloned handles share the buffer, and a handle can
/// rebind the same buffer under a different layout view, which is how
/// in-place optimised primitives alias their neighbour's storage.
#[derive(Debug, Clone)]
pub struct Memory {
    layout: Layout,
    buffer: Arc<Buffer>,
}

impl Memory {
    pub(crate) fn allocate(layout: Layout) -> OxResult<Memory> {
        let byte_len = layout.bytes();
        let word_len = byte_len.div_ceil(8);
        let mut words = Vec::new();
        words
            .try_reserve_exact(word_len)
            .map_err(|_| OxError::ResourceExhausted(format!("{byte_len} byte buffer")))?;
        words.resize(word_len, 0u64);
        Ok(Memory {
            layout,
            buffer: Arc::new(Buffer { words: RwLock::new(words), byte_len, attached: false }),
        })
    }

    pub(crate) fn attach<T: Element>(layout: Layout, data: &[T]) -> OxResult<Memory> {
        if T::DATA_TYPE != layout.data_type {
            return Err(OxError::InvalidArgument(format!(
                "attached data is {:?} but layout expects {:?}",
                T::DATA_TYPE,
                layout.data_type
            )));
        }
        if data.len() < layout.physical_size() {
            return Err(OxError::InvalidArgument(format!(
                "attached buffer holds {} elements, layout needs {}",
                data.len(),
                layout.physical_size()
            )));
        }
        let byte_len = layout.bytes();
        let mut words = vec![0u64; byte_len.div_ceil(8)];
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr() as *const u8,
                words.as_mut_ptr() as *mut u8,
                (data.len() * std::mem::size_of::<T>()).min(byte_len),
            );
        }
        Ok(Memory {
            layout,
            buffer: Arc::new(Buffer { words: RwLock::new(words), byte_len, attached: true }),
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn byte_len(&self) -> usize {
        self.buffer.byte_len
    }

    pub fn is_attached(&self) -> bool {
        self.buffer.attached
    }

    /// True when both handles refer to the same underlying buffer.
    pub fn same_buffer(&self, other: &Memory) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    /// Rebinds the same buffer under a different layout view. The new
    /// layout must not address past the buffer end.
    pub(crate) fn with_layout(&self, layout: Layout) -> OxResult<Memory> {
        if layout.bytes() > self.buffer.byte_len {
            return Err(OxError::InvalidArgument(format!(
                "layout view of {} bytes exceeds buffer of {} bytes",
                layout.bytes(),
                self.buffer.byte_len
            )));
        }
        Ok(Memory { layout, buffer: Arc::clone(&self.buffer) })
    }

    fn check_type(&self, dt: DataType) -> OxResult<()> {
        if self.layout.data_type != dt {
            return Err(OxError::InvalidArgument(format!(
                "memory holds {:?}, requested view of {:?}",
                self.layout.data_type, dt
            )));
        }
        Ok(())
    }

    /// Immutable typed host view.
    pub fn lock<T: Element>(&self) -> OxResult<MemoryView<'_, T>> {
        self.check_type(T::DATA_TYPE)?;
        let guard = self.buffer.words.read().expect("memory lock poisoned");
        Ok(MemoryView {
            guard,
            len: self.buffer.byte_len / std::mem::size_of::<T>(),
            _m: PhantomData,
        })
    }

    /// Mutable typed host view.
    pub fn lock_mut<T: Element>(&self) -> OxResult<MemoryViewMut<'_, T>> {
        self.check_type(T::DATA_TYPE)?;
        let guard = self.buffer.words.write().expect("memory lock poisoned");
        Ok(MemoryViewMut {
            guard,
            len: self.buffer.byte_len / std::mem::size_of::<T>(),
            _m: PhantomData,
        })
    }

    /// Type-erased read view used by the reference executor.
    pub(crate) fn scalars(&self) -> ScalarView<'_> {
        ScalarView {
            guard: self.buffer.words.read().expect("memory lock poisoned"),
            dtype: self.layout.data_type,
        }
    }

    /// Type-erased write view used by the reference executor.
    pub(crate) fn scalars_mut(&self) -> ScalarViewMut<'_> {
        ScalarViewMut {
            guard: self.buffer.words.write().expect("memory lock poisoned"),
            dtype: self.layout.data_type,
        }
    }

    /// Raw byte snapshot, used when staging to a foreign device buffer.
    #[allow(dead_code)]
    pub(crate) fn copy_to_bytes(&self) -> Vec<u8> {
        let words = self.buffer.words.read().expect("memory lock poisoned");
        let mut out = vec![0u8; self.buffer.byte_len];
        unsafe {
            std::ptr::copy_nonoverlapping(words.as_ptr() as *const u8, out.as_mut_ptr(), out.len());
        }
        out
    }

    /// Overwrites the buffer from raw bytes staged back from a device.
    #[allow(dead_code)]
    pub(crate) fn copy_from_bytes(&self, bytes: &[u8]) {
        let mut words = self.buffer.words.write().expect("memory lock poisoned");
        let n = bytes.len().min(self.buffer.byte_len);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), words.as_mut_ptr() as *mut u8, n);
        }
    }

    /// Copies `data` over the start of the buffer.
    pub fn write_all<T: Element>(&self, data: &[T]) -> OxResult<()> {
        let mut view = self.lock_mut::<T>()?;
        if data.len() > view.len {
            return Err(OxError::InvalidArgument(format!(
                "{} elements do not fit into a buffer of {}",
                data.len(),
                view.len
            )));
        }
        view[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read_to_vec<T: Element>(&self) -> OxResult<Vec<T>> {
        Ok(self.lock::<T>()?.to_vec())
    }

    /// Element-by-element copy into `target`, mapping logical indices
    /// through both layouts. This is the host-side reorder used at build
    /// time for weights constants; it handles any format pair, blocked
    /// included, and converts element types through f64.
    pub fn reordered(&self, target: Layout) -> OxResult<Memory> {
        let src_layout = self.layout();
        if src_layout.size != target.size {
            return Err(OxError::InvalidArgument(format!(
                "reorder changes logical size {} -> {}",
                src_layout.size, target.size
            )));
        }
        let out = Memory::allocate(target.clone())?;
        {
            let src = self.scalars();
            let mut dst = out.scalars_mut();
            let size = src_layout.size;
            for b in 0..size.batch {
                for f in 0..size.feature {
                    for y in 0..size.y {
                        for x in 0..size.x {
                            let v = src.get(src_layout.element_offset(b, f, y, x));
                            dst.set(target.element_offset(b, f, y, x), v);
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

impl PartialEq for Memory {
    /// Handle identity: two memories are equal when they share a buffer.
    fn eq(&self, other: &Self) -> bool {
        self.same_buffer(other)
    }
}

impl Serialize for Memory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let words = self.buffer.words.read().expect("memory lock poisoned");
        (&self.layout, self.buffer.byte_len, &*words).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Memory {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (layout, byte_len, words): (Layout, usize, Vec<u64>) =
            Deserialize::deserialize(deserializer)?;
        if words.len() != byte_len.div_ceil(8) || byte_len != layout.bytes() {
            return Err(D::Error::custom("memory payload does not match its layout"));
        }
        Ok(Memory {
            layout,
            buffer: Arc::new(Buffer { words: RwLock::new(words), byte_len, attached: false }),
        })
    }
}

pub struct MemoryView<'a, T> {
    guard: RwLockReadGuard<'a, Vec<u64>>,
    len: usize,
    _m: PhantomData<T>,
}

impl<T: Element> Deref for MemoryView<'_, T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        // u64 backing keeps any element type aligned
        unsafe { std::slice::from_raw_parts(self.guard.as_ptr() as *const T, self.len) }
    }
}

pub struct MemoryViewMut<'a, T> {
    guard: RwLockWriteGuard<'a, Vec<u64>>,
    len: usize,
    _m: PhantomData<T>,
}

impl<T: Element> Deref for MemoryViewMut<'_, T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.guard.as_ptr() as *const T, self.len) }
    }
}

impl<T: Element> DerefMut for MemoryViewMut<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.guard.as_mut_ptr() as *mut T, self.len) }
    }
}

pub(crate) struct ScalarView<'a> {
    guard: RwLockReadGuard<'a, Vec<u64>>,
    dtype: DataType,
}

impl ScalarView<'_> {
    pub fn get(&self, index: usize) -> f64 {
        let ptr = self.guard.as_ptr() as *const u8;
        unsafe {
            match self.dtype {
                DataType::I8 => *(ptr.add(index) as *const i8) as f64,
                DataType::I16 => *(ptr.add(index * 2) as *const i16) as f64,
                DataType::I32 => *(ptr.add(index * 4) as *const i32) as f64,
                DataType::I64 => *(ptr.add(index * 8) as *const i64) as f64,
                DataType::F16 => f64::from(*(ptr.add(index * 2) as *const half::f16)),
                DataType::F32 => *(ptr.add(index * 4) as *const f32) as f64,
                DataType::F64 => *(ptr.add(index * 8) as *const f64),
            }
        }
    }
}

pub(crate) struct ScalarViewMut<'a> {
    guard: RwLockWriteGuard<'a, Vec<u64>>,
    dtype: DataType,
}

impl ScalarViewMut<'_> {
    /// Reads back a previously written element; kernels that rewrite their
    /// own output in place (per-class softmax passes) need this.
    pub fn get(&self, index: usize) -> f64 {
        let ptr = self.guard.as_ptr() as *const u8;
        unsafe {
            match self.dtype {
                DataType::I8 => *(ptr.add(index) as *const i8) as f64,
                DataType::I16 => *(ptr.add(index * 2) as *const i16) as f64,
                DataType::I32 => *(ptr.add(index * 4) as *const i32) as f64,
                DataType::I64 => *(ptr.add(index * 8) as *const i64) as f64,
                DataType::F16 => f64::from(*(ptr.add(index * 2) as *const half::f16)),
                DataType::F32 => *(ptr.add(index * 4) as *const f32) as f64,
                DataType::F64 => *(ptr.add(index * 8) as *const f64),
            }
        }
    }

    pub fn set(&mut self, index: usize, value: f64) {
        let ptr = self.guard.as_mut_ptr() as *mut u8;
        unsafe {
            match self.dtype {
                DataType::I8 => *(ptr.add(index) as *mut i8) = value as i8,
                DataType::I16 => *(ptr.add(index * 2) as *mut i16) = value as i16,
                DataType::I32 => *(ptr.add(index * 4) as *mut i32) = value as i32,
                DataType::I64 => *(ptr.add(index * 8) as *mut i64) = value as i64,
                DataType::F16 => *(ptr.add(index * 2) as *mut half::f16) = half::f16::from_f64(value),
                DataType::F32 => *(ptr.add(index * 4) as *mut f32) = value as f32,
                DataType::F64 => *(ptr.add(index * 8) as *mut f64) = value,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{Format, TensorShape};

    #[test]
    fn allocate_is_zeroed() {
        let layout = Layout::new(DataType::F32, Format::Bfyx, TensorShape::new(1, 2, 2, 2));
        let mem = Memory::allocate(layout).unwrap();
        assert!(mem.read_to_vec::<f32>().unwrap().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn typed_view_rejects_wrong_type() {
        let layout = Layout::new(DataType::F32, Format::Bfyx, TensorShape::new(1, 1, 1, 4));
        let mem = Memory::allocate(layout).unwrap();
        assert!(mem.lock::<i32>().is_err());
        assert!(mem.lock::<f32>().is_ok());
    }

    #[test]
    fn layout_views_share_storage() {
        let layout = Layout::new(DataType::F32, Format::Bfyx, TensorShape::new(1, 2, 1, 2));
        let mem = Memory::allocate(layout.clone()).unwrap();
        let view = mem.with_layout(layout.transform(Format::Bfyx)).unwrap();
        assert!(mem.same_buffer(&view));
        view.write_all(&[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(mem.read_to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn reorder_round_trip_is_identity() {
        let src_layout = Layout::new(DataType::F32, Format::Bfyx, TensorShape::new(2, 3, 2, 2));
        let mem = Memory::allocate(src_layout.clone()).unwrap();
        let data: Vec<f32> = (0..24).map(|v| v as f32).collect();
        mem.write_all(&data).unwrap();

        let there = mem.reordered(src_layout.transform(Format::Yxfb)).unwrap();
        let back = there.reordered(src_layout.clone()).unwrap();
        assert_eq!(back.read_to_vec::<f32>().unwrap(), data);
    }

    #[test]
    fn reorder_into_blocked_weights() {
        let src = Layout::new(DataType::F32, Format::Oiyx, TensorShape::new(20, 2, 1, 1));
        let mem = Memory::allocate(src.clone()).unwrap();
        let data: Vec<f32> = (0..40).map(|v| v as f32).collect();
        mem.write_all(&data).unwrap();

        let blocked = mem.reordered(src.transform(Format::OsIyxOsv16)).unwrap();
        let back = blocked.reordered(src).unwrap();
        assert_eq!(back.read_to_vec::<f32>().unwrap(), data);
    }

    #[test]
    fn f16_views() {
        let layout = Layout::new(DataType::F16, Format::Bfyx, TensorShape::new(1, 1, 1, 4));
        let mem = Memory::allocate(layout).unwrap();
        let vals: Vec<half::f16> = [1.0f32, 2.0, -0.5, 0.25]
            .iter()
            .map(|v| half::f16::from_f32(*v))
            .collect();
        mem.write_all(&vals).unwrap();
        let round = mem.read_to_vec::<half::f16>().unwrap();
        assert_eq!(round, vals);
    }
}
