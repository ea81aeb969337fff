//! Typed column storage
//!
//! A `Column` is a dense buffer of fixed-width slots plus an optional
//! validity bitmap. Buffers are selected by physical width, so `Date`
//! shares the i32 path, `Timestamp` the i64 path, `Bool`/`Object` the
//! unsigned paths. String columns hold u64 indices into a shared
//! `Vocabulary`; borrowing a vocabulary re-points the shared handle so
//! equal indices denote equal strings across columns.

use super::bitvec::BitVec;
use super::types::{DataType, Value};
use super::vocab::Vocabulary;
use parking_lot::RwLock;
use std::sync::Arc;

/// Vocabulary shared between columns by reference
pub type SharedVocab = Arc<RwLock<Vocabulary>>;

#[derive(Debug, Clone)]
enum Buffer {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Str { indices: Vec<u64>, vocab: SharedVocab },
}

impl Buffer {
    fn new(dtype: DataType) -> Self {
        use DataType::*;
        match dtype {
            Int8 => Buffer::I8(Vec::new()),
            Int16 => Buffer::I16(Vec::new()),
            Int32 | Date => Buffer::I32(Vec::new()),
            Int64 | Timestamp => Buffer::I64(Vec::new()),
            UInt8 | Bool => Buffer::U8(Vec::new()),
            UInt16 => Buffer::U16(Vec::new()),
            UInt32 => Buffer::U32(Vec::new()),
            UInt64 | Object => Buffer::U64(Vec::new()),
            Float32 => Buffer::F32(Vec::new()),
            Float64 => Buffer::F64(Vec::new()),
            Str => Buffer::Str {
                indices: Vec::new(),
                vocab: Arc::new(RwLock::new(Vocabulary::new())),
            },
        }
    }

    fn len(&self) -> usize {
        match self {
            Buffer::I8(v) => v.len(),
            Buffer::I16(v) => v.len(),
            Buffer::I32(v) => v.len(),
            Buffer::I64(v) => v.len(),
            Buffer::U8(v) => v.len(),
            Buffer::U16(v) => v.len(),
            Buffer::U32(v) => v.len(),
            Buffer::U64(v) => v.len(),
            Buffer::F32(v) => v.len(),
            Buffer::F64(v) => v.len(),
            Buffer::Str { indices, .. } => indices.len(),
        }
    }

    fn resize(&mut self, n: usize) {
        match self {
            Buffer::I8(v) => v.resize(n, 0),
            Buffer::I16(v) => v.resize(n, 0),
            Buffer::I32(v) => v.resize(n, 0),
            Buffer::I64(v) => v.resize(n, 0),
            Buffer::U8(v) => v.resize(n, 0),
            Buffer::U16(v) => v.resize(n, 0),
            Buffer::U32(v) => v.resize(n, 0),
            Buffer::U64(v) => v.resize(n, 0),
            Buffer::F32(v) => v.resize(n, 0.0),
            Buffer::F64(v) => v.resize(n, 0.0),
            Buffer::Str { indices, .. } => indices.resize(n, 0),
        }
    }

    fn reserve(&mut self, n: usize) {
        match self {
            Buffer::I8(v) => v.reserve(n),
            Buffer::I16(v) => v.reserve(n),
            Buffer::I32(v) => v.reserve(n),
            Buffer::I64(v) => v.reserve(n),
            Buffer::U8(v) => v.reserve(n),
            Buffer::U16(v) => v.reserve(n),
            Buffer::U32(v) => v.reserve(n),
            Buffer::U64(v) => v.reserve(n),
            Buffer::F32(v) => v.reserve(n),
            Buffer::F64(v) => v.reserve(n),
            Buffer::Str { indices, .. } => indices.reserve(n),
        }
    }
}

/// Typed access to a column's backing buffer.
///
/// One impl per physical slot width; a mismatching access is a
/// programmer error and panics.
pub trait NativeType: Copy + PartialEq + Send + Sync + 'static {
    fn slice(col: &Column) -> &[Self];
    fn slice_mut(col: &mut Column) -> &mut [Self];
}

macro_rules! impl_native {
    ($t:ty, $variant:ident) => {
        impl NativeType for $t {
            #[inline]
            fn slice(col: &Column) -> &[Self] {
                match &col.buf {
                    Buffer::$variant(v) => v,
                    _ => panic!(
                        "type mismatch: {:?} column read as {}",
                        col.dtype,
                        stringify!($t)
                    ),
                }
            }

            #[inline]
            fn slice_mut(col: &mut Column) -> &mut [Self] {
                match &mut col.buf {
                    Buffer::$variant(v) => v,
                    _ => panic!(
                        "type mismatch: {:?} column written as {}",
                        col.dtype,
                        stringify!($t)
                    ),
                }
            }
        }
    };
}

impl_native!(i8, I8);
impl_native!(i16, I16);
impl_native!(i32, I32);
impl_native!(i64, I64);
impl_native!(u8, U8);
impl_native!(u16, U16);
impl_native!(u32, U32);
impl_native!(u64, U64);
impl_native!(f32, F32);
impl_native!(f64, F64);

/// A single typed column: fixed-width slots plus optional validity bits
#[derive(Debug, Clone)]
pub struct Column {
    dtype: DataType,
    buf: Buffer,
    /// None means every slot is valid (validity untracked)
    validity: Option<BitVec>,
}

impl Column {
    pub fn new(dtype: DataType, with_validity: bool) -> Self {
        Self {
            dtype,
            buf: Buffer::new(dtype),
            validity: with_validity.then(BitVec::new),
        }
    }

    pub fn with_capacity(dtype: DataType, with_validity: bool, capacity: usize) -> Self {
        let mut col = Self::new(dtype, with_validity);
        col.reserve(capacity);
        col
    }

    #[inline]
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Grow or shrink to `n` slots. New slots are zeroed and, when
    /// validity is tracked, invalid.
    pub fn set_size(&mut self, n: usize) {
        self.buf.resize(n);
        if let Some(validity) = &mut self.validity {
            validity.resize(n, false);
        }
    }

    /// Reserve capacity for `n` additional slots. Growth is geometric
    /// (Vec semantics), so repeated reserves do not churn.
    pub fn reserve(&mut self, n: usize) {
        self.buf.reserve(n);
    }

    #[inline]
    pub fn is_valid(&self, index: usize) -> bool {
        match &self.validity {
            Some(v) => v.get(index),
            None => index < self.buf.len(),
        }
    }

    #[inline]
    pub fn set_valid(&mut self, index: usize, valid: bool) {
        if let Some(v) = &mut self.validity {
            v.set(index, valid);
        }
    }

    /// Typed read of slot `index`.
    #[inline]
    pub fn get_nth<T: NativeType>(&self, index: usize) -> T {
        T::slice(self)[index]
    }

    /// Typed write of slot `index`; marks the slot valid.
    #[inline]
    pub fn set_nth<T: NativeType>(&mut self, index: usize, value: T) {
        T::slice_mut(self)[index] = value;
        self.set_valid(index, true);
    }

    /// Read slot `index` as a tagged scalar; Null when invalid.
    pub fn value_at(&self, index: usize) -> Value {
        assert!(index < self.size(), "row {index} out of range");
        if !self.is_valid(index) {
            return Value::Null;
        }
        use DataType::*;
        match self.dtype {
            Int8 => Value::Int8(self.get_nth::<i8>(index)),
            Int16 => Value::Int16(self.get_nth::<i16>(index)),
            Int32 => Value::Int32(self.get_nth::<i32>(index)),
            Int64 => Value::Int64(self.get_nth::<i64>(index)),
            UInt8 => Value::UInt8(self.get_nth::<u8>(index)),
            UInt16 => Value::UInt16(self.get_nth::<u16>(index)),
            UInt32 => Value::UInt32(self.get_nth::<u32>(index)),
            UInt64 => Value::UInt64(self.get_nth::<u64>(index)),
            Float32 => Value::Float32(self.get_nth::<f32>(index)),
            Float64 => Value::Float64(self.get_nth::<f64>(index)),
            Bool => Value::Bool(self.get_nth::<u8>(index) != 0),
            Date => Value::Date(self.get_nth::<i32>(index)),
            Timestamp => Value::Timestamp(self.get_nth::<i64>(index)),
            Object => Value::Object(self.get_nth::<u64>(index)),
            Str => {
                let idx = self.vocab_index_at(index);
                Value::Str(self.shared_vocab().read().lookup(idx).to_string())
            }
        }
    }

    /// Write a tagged scalar into slot `index`. Null clears validity;
    /// a variant that does not match the column dtype is fatal.
    pub fn set_value(&mut self, index: usize, value: &Value) {
        use DataType::*;
        match (self.dtype, value) {
            (_, Value::Null) => self.set_valid(index, false),
            (Int8, Value::Int8(v)) => self.set_nth(index, *v),
            (Int16, Value::Int16(v)) => self.set_nth(index, *v),
            (Int32, Value::Int32(v)) => self.set_nth(index, *v),
            (Int64, Value::Int64(v)) => self.set_nth(index, *v),
            (UInt8, Value::UInt8(v)) => self.set_nth(index, *v),
            (UInt16, Value::UInt16(v)) => self.set_nth(index, *v),
            (UInt32, Value::UInt32(v)) => self.set_nth(index, *v),
            (UInt64, Value::UInt64(v)) => self.set_nth(index, *v),
            (Float32, Value::Float32(v)) => self.set_nth(index, *v),
            (Float64, Value::Float64(v)) => self.set_nth(index, *v),
            (Bool, Value::Bool(v)) => self.set_nth(index, *v as u8),
            (Date, Value::Date(v)) => self.set_nth(index, *v),
            (Timestamp, Value::Timestamp(v)) => self.set_nth(index, *v),
            (Object, Value::Object(v)) => self.set_nth(index, *v),
            (Str, Value::Str(s)) => self.set_str(index, s),
            (dtype, value) => panic!("type mismatch: {value:?} written to {dtype:?} column"),
        }
    }

    /// Copy one cell (value + validity) from `src` at `src_row`.
    ///
    /// Both columns must share a dtype. String cells copy by index when
    /// the vocabularies are shared, re-interning otherwise.
    pub fn copy_cell_from(&mut self, dst_row: usize, src: &Column, src_row: usize) {
        assert_eq!(
            self.dtype, src.dtype,
            "cell copy across dtypes {:?} -> {:?}",
            src.dtype, self.dtype
        );
        if !src.is_valid(src_row) {
            self.set_valid(dst_row, false);
            return;
        }
        use DataType::*;
        match self.dtype {
            Int8 => self.set_nth(dst_row, src.get_nth::<i8>(src_row)),
            Int16 => self.set_nth(dst_row, src.get_nth::<i16>(src_row)),
            Int32 | Date => self.set_nth(dst_row, src.get_nth::<i32>(src_row)),
            Int64 | Timestamp => self.set_nth(dst_row, src.get_nth::<i64>(src_row)),
            UInt8 | Bool => self.set_nth(dst_row, src.get_nth::<u8>(src_row)),
            UInt16 => self.set_nth(dst_row, src.get_nth::<u16>(src_row)),
            UInt32 => self.set_nth(dst_row, src.get_nth::<u32>(src_row)),
            UInt64 | Object => self.set_nth(dst_row, src.get_nth::<u64>(src_row)),
            Float32 => self.set_nth(dst_row, src.get_nth::<f32>(src_row)),
            Float64 => self.set_nth(dst_row, src.get_nth::<f64>(src_row)),
            Str => {
                let src_idx = src.vocab_index_at(src_row);
                if self.shares_vocabulary(src) {
                    self.set_vocab_index(dst_row, src_idx);
                } else {
                    let s = src.shared_vocab().read().lookup(src_idx).to_string();
                    self.set_str(dst_row, &s);
                }
            }
        }
    }

    /// Compare two cells for equality. Invalid cells never compare equal.
    pub fn cell_eq(&self, row: usize, other: &Column, other_row: usize) -> bool {
        if !self.is_valid(row) || !other.is_valid(other_row) {
            return false;
        }
        use DataType::*;
        match self.dtype {
            Int8 => self.get_nth::<i8>(row) == other.get_nth::<i8>(other_row),
            Int16 => self.get_nth::<i16>(row) == other.get_nth::<i16>(other_row),
            Int32 | Date => self.get_nth::<i32>(row) == other.get_nth::<i32>(other_row),
            Int64 | Timestamp => self.get_nth::<i64>(row) == other.get_nth::<i64>(other_row),
            UInt8 | Bool => self.get_nth::<u8>(row) == other.get_nth::<u8>(other_row),
            UInt16 => self.get_nth::<u16>(row) == other.get_nth::<u16>(other_row),
            UInt32 => self.get_nth::<u32>(row) == other.get_nth::<u32>(other_row),
            UInt64 | Object => self.get_nth::<u64>(row) == other.get_nth::<u64>(other_row),
            Float32 => self.get_nth::<f32>(row) == other.get_nth::<f32>(other_row),
            Float64 => self.get_nth::<f64>(row) == other.get_nth::<f64>(other_row),
            Str => {
                if self.shares_vocabulary(other) {
                    self.vocab_index_at(row) == other.vocab_index_at(other_row)
                } else {
                    let a = self.shared_vocab();
                    let b = other.shared_vocab();
                    let eq = a.read().lookup(self.vocab_index_at(row))
                        == b.read().lookup(other.vocab_index_at(other_row));
                    eq
                }
            }
        }
    }

    // --- string specializations ---

    /// Handle to this string column's vocabulary.
    pub fn shared_vocab(&self) -> SharedVocab {
        match &self.buf {
            Buffer::Str { vocab, .. } => Arc::clone(vocab),
            _ => panic!("vocabulary access on {:?} column", self.dtype),
        }
    }

    /// Re-point this column's vocabulary at `other`'s, so raw index
    /// writes carry over without re-interning.
    pub fn borrow_vocabulary(&mut self, other: &Column) {
        let shared = other.shared_vocab();
        self.adopt_vocabulary(shared);
    }

    /// Replace this column's vocabulary handle.
    pub fn adopt_vocabulary(&mut self, shared: SharedVocab) {
        match &mut self.buf {
            Buffer::Str { vocab, .. } => *vocab = shared,
            _ => panic!("vocabulary adopt on {:?} column", self.dtype),
        }
    }

    pub fn shares_vocabulary(&self, other: &Column) -> bool {
        match (&self.buf, &other.buf) {
            (Buffer::Str { vocab: a, .. }, Buffer::Str { vocab: b, .. }) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Intern `s` and store its index at `index`; marks the slot valid.
    pub fn set_str(&mut self, index: usize, s: &str) {
        match &mut self.buf {
            Buffer::Str { indices, vocab } => {
                let idx = vocab.write().intern(s);
                indices[index] = idx;
            }
            _ => panic!("string write to {:?} column", self.dtype),
        }
        self.set_valid(index, true);
    }

    /// Raw vocabulary-index write; the hot path for columns that share
    /// a vocabulary. Marks the slot valid.
    #[inline]
    pub fn set_vocab_index(&mut self, index: usize, vocab_idx: u64) {
        match &mut self.buf {
            Buffer::Str { indices, .. } => indices[index] = vocab_idx,
            _ => panic!("vocabulary index write to {:?} column", self.dtype),
        }
        self.set_valid(index, true);
    }

    #[inline]
    pub fn vocab_index_at(&self, index: usize) -> u64 {
        match &self.buf {
            Buffer::Str { indices, .. } => indices[index],
            _ => panic!("vocabulary index read on {:?} column", self.dtype),
        }
    }

    /// Resolve the string at `index`, None when invalid.
    pub fn str_at(&self, index: usize) -> Option<String> {
        if !self.is_valid(index) {
            return None;
        }
        let idx = self.vocab_index_at(index);
        Some(self.shared_vocab().read().lookup(idx).to_string())
    }

    // --- promotion ---

    /// Widen in place to `new_dtype` per the widening matrix; values are
    /// preserved, validity untouched. Non-widening targets are fatal
    /// (callers reject them first).
    pub fn promote(&mut self, new_dtype: DataType) {
        assert!(
            self.dtype.widens_to(new_dtype),
            "cannot promote {:?} to {:?}",
            self.dtype,
            new_dtype
        );
        if self.dtype == new_dtype {
            return;
        }
        let n = self.size();
        let mut widened = Buffer::new(new_dtype);
        widened.resize(n);
        {
            use DataType::*;
            macro_rules! widen {
                ($from:ty, $tovar:ident, $to:ty) => {{
                    let src: &[$from] = <$from as NativeType>::slice(self);
                    if let Buffer::$tovar(dst) = &mut widened {
                        for (d, s) in dst.iter_mut().zip(src) {
                            *d = *s as $to;
                        }
                    }
                }};
            }
            match (self.dtype, new_dtype) {
                (Int8, Int16) => widen!(i8, I16, i16),
                (Int8, Int32) => widen!(i8, I32, i32),
                (Int8, Int64) => widen!(i8, I64, i64),
                (Int16, Int32) => widen!(i16, I32, i32),
                (Int16, Int64) => widen!(i16, I64, i64),
                (Int32, Int64) => widen!(i32, I64, i64),
                (UInt8, UInt16) => widen!(u8, U16, u16),
                (UInt8, UInt32) => widen!(u8, U32, u32),
                (UInt8, UInt64) => widen!(u8, U64, u64),
                (UInt16, UInt32) => widen!(u16, U32, u32),
                (UInt16, UInt64) => widen!(u16, U64, u64),
                (UInt32, UInt64) => widen!(u32, U64, u64),
                (Float32, Float64) => widen!(f32, F64, f64),
                (Int8, Float64) => widen!(i8, F64, f64),
                (Int16, Float64) => widen!(i16, F64, f64),
                (Int32, Float64) => widen!(i32, F64, f64),
                (from, to) => unreachable!("unhandled promotion {from:?} -> {to:?}"),
            }
        }
        self.buf = widened;
        self.dtype = new_dtype;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_read_write() {
        let mut col = Column::new(DataType::Int64, true);
        col.set_size(3);
        assert!(!col.is_valid(0));

        col.set_nth::<i64>(0, 42);
        assert!(col.is_valid(0));
        assert_eq!(col.get_nth::<i64>(0), 42);
        assert_eq!(col.value_at(0), Value::Int64(42));
        assert_eq!(col.value_at(1), Value::Null);
    }

    #[test]
    #[should_panic(expected = "type mismatch")]
    fn test_typed_mismatch_is_fatal() {
        let mut col = Column::new(DataType::Int64, true);
        col.set_size(1);
        col.get_nth::<f64>(0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_is_fatal() {
        let col = Column::new(DataType::Int64, true);
        col.value_at(0);
    }

    #[test]
    fn test_untracked_validity_reports_valid() {
        let mut col = Column::new(DataType::UInt8, false);
        col.set_size(2);
        assert!(col.is_valid(0));
        col.set_valid(0, false); // no-op without a bitmap
        assert!(col.is_valid(0));
        assert!(!col.is_valid(5));
    }

    #[test]
    fn test_set_value_and_null() {
        let mut col = Column::new(DataType::Float64, true);
        col.set_size(2);
        col.set_value(0, &Value::Float64(1.5));
        assert_eq!(col.value_at(0), Value::Float64(1.5));
        col.set_value(0, &Value::Null);
        assert_eq!(col.value_at(0), Value::Null);
    }

    #[test]
    fn test_string_intern_and_borrow() {
        let mut master = Column::new(DataType::Str, true);
        master.set_size(2);
        master.set_str(0, "alpha");
        master.set_str(1, "beta");

        let mut prev = Column::new(DataType::Str, true);
        prev.set_size(2);
        prev.borrow_vocabulary(&master);
        assert!(prev.shares_vocabulary(&master));

        // Raw index write carries the string without re-interning
        prev.set_vocab_index(0, master.vocab_index_at(1));
        assert_eq!(prev.str_at(0).as_deref(), Some("beta"));
        assert!(prev.cell_eq(0, &master, 1));
        assert!(!prev.cell_eq(0, &master, 0));
    }

    #[test]
    fn test_copy_cell_across_vocabs_reinterns() {
        let mut a = Column::new(DataType::Str, true);
        a.set_size(1);
        a.set_str(0, "shared");

        let mut b = Column::new(DataType::Str, true);
        b.set_size(1);
        b.copy_cell_from(0, &a, 0);
        assert_eq!(b.str_at(0).as_deref(), Some("shared"));
        assert!(b.cell_eq(0, &a, 0));
    }

    #[test]
    fn test_promote_preserves_values() {
        let mut col = Column::new(DataType::Int32, true);
        col.set_size(3);
        col.set_nth::<i32>(0, -7);
        col.set_nth::<i32>(2, 1 << 20);

        col.promote(DataType::Int64);
        assert_eq!(col.dtype(), DataType::Int64);
        assert_eq!(col.get_nth::<i64>(0), -7);
        assert!(!col.is_valid(1));
        assert_eq!(col.get_nth::<i64>(2), 1 << 20);
    }

    #[test]
    #[should_panic(expected = "cannot promote")]
    fn test_promote_narrowing_is_fatal() {
        let mut col = Column::new(DataType::Int64, true);
        col.promote(DataType::Int32);
    }
}
