//! Columnar frame: typed columns over owned or memory-mapped buffers,
//! row-index views, and the group-by sort used by the aggregation pipeline.

use std::cmp::Ordering;
use std::ops::Range;
use std::sync::Arc;

use memmap2::Mmap;
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("column {index} has length {len}, expected {nrows}")]
    ColumnLength {
        index: usize,
        len: usize,
        nrows: usize,
    },

    #[error("duplicate column name: {0}")]
    DuplicateName(String),

    #[error("column index {0} out of bounds for frame with {1} columns")]
    ColumnIndex(usize, usize),

    #[error("expected a numeric column, got {0}")]
    NotNumeric(SType),

    #[error("cannot bind a frame with {0} rows to a frame with {1} rows")]
    RowCountMismatch(usize, usize),

    #[error("mapped buffer too short: need {need} bytes at offset {offset}, have {have}")]
    ShortBuffer {
        need: usize,
        offset: usize,
        have: usize,
    },

    #[error("mapped buffer at offset {offset} is misaligned for {align}-byte elements")]
    Misaligned { offset: usize, align: usize },
}

// ============================================================================
// Storage Types
// ============================================================================

/// Storage type of a column. The three-character codes are the ones used by
/// the on-disk column format (see [`crate::nff`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SType {
    /// Booleans stored as `i8` (0, 1, or the `i8::MIN` missing sentinel).
    Bool8,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    /// UTF-8 strings with 32-bit offsets.
    Str32,
    /// UTF-8 strings with 64-bit offsets.
    Str64,
}

impl SType {
    /// Parse a three-character storage code. Unknown codes yield `None`.
    pub fn from_code(code: &str) -> Option<SType> {
        match code {
            "i1b" => Some(SType::Bool8),
            "i1i" => Some(SType::Int8),
            "i2i" => Some(SType::Int16),
            "i4i" => Some(SType::Int32),
            "i8i" => Some(SType::Int64),
            "f4r" => Some(SType::Float32),
            "f8r" => Some(SType::Float64),
            "s4v" => Some(SType::Str32),
            "s8v" => Some(SType::Str64),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SType::Bool8 => "i1b",
            SType::Int8 => "i1i",
            SType::Int16 => "i2i",
            SType::Int32 => "i4i",
            SType::Int64 => "i8i",
            SType::Float32 => "f4r",
            SType::Float64 => "f8r",
            SType::Str32 => "s4v",
            SType::Str64 => "s8v",
        }
    }

    /// Size of one fixed-width element; for string columns this is the size
    /// of one offset entry.
    pub fn elem_size(&self) -> usize {
        match self {
            SType::Bool8 | SType::Int8 => 1,
            SType::Int16 => 2,
            SType::Int32 | SType::Float32 | SType::Str32 => 4,
            SType::Int64 | SType::Float64 | SType::Str64 => 8,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, SType::Str32 | SType::Str64)
    }
}

impl std::fmt::Display for SType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Missing-value sentinels for the fixed-width cell types: the minimum
/// signed integer for integer storage, NaN for floats.
pub trait Na: Copy + PartialOrd + Send + Sync + 'static {
    fn na() -> Self;
    fn is_na(&self) -> bool;
}

macro_rules! impl_na_int {
    ($($t:ty),*) => {$(
        impl Na for $t {
            #[inline]
            fn na() -> Self {
                <$t>::MIN
            }
            #[inline]
            fn is_na(&self) -> bool {
                *self == <$t>::MIN
            }
        }
    )*};
}

macro_rules! impl_na_float {
    ($($t:ty),*) => {$(
        impl Na for $t {
            #[inline]
            fn na() -> Self {
                <$t>::NAN
            }
            #[inline]
            fn is_na(&self) -> bool {
                self.is_nan()
            }
        }
    )*};
}

impl_na_int!(i8, i16, i32, i64);
impl_na_float!(f32, f64);

// ============================================================================
// Buffers (owned or zero-copy mmap views)
// ============================================================================

/// Element storage for one column: either a heap-owned vector or a zero-copy
/// view into a memory-mapped column file. Multiple processes mapping the same
/// file share physical pages through the OS page cache.
#[derive(Clone, Debug)]
pub enum Buffer<T: 'static> {
    Owned(Vec<T>),
    Mapped {
        /// Keeps the memory map alive for the lifetime of the view.
        _mmap: Arc<Mmap>,
        data: &'static [T],
    },
}

impl<T: Copy> Buffer<T> {
    /// Create a view of `len` elements starting at `byte_offset` within the
    /// mapped file. The offset must be aligned for `T` and the file must be
    /// long enough.
    pub fn from_mmap(mmap: Arc<Mmap>, byte_offset: usize, len: usize) -> Result<Self, FrameError> {
        let esize = std::mem::size_of::<T>();
        let need = len * esize;
        if byte_offset + need > mmap.len() {
            return Err(FrameError::ShortBuffer {
                need,
                offset: byte_offset,
                have: mmap.len(),
            });
        }
        let align = std::mem::align_of::<T>();
        if byte_offset % align != 0 {
            return Err(FrameError::Misaligned {
                offset: byte_offset,
                align,
            });
        }
        // SAFETY: The mmap is read-only and immutable, the range was bounds-
        // and alignment-checked above, and the Arc keeps the backing memory
        // alive for as long as this buffer exists. The slice lifetime is
        // extended to 'static because the Arc prevents deallocation.
        let data: &'static [T] = unsafe {
            std::slice::from_raw_parts(mmap.as_ptr().add(byte_offset) as *const T, len)
        };
        Ok(Buffer::Mapped { _mmap: mmap, data })
    }

    pub fn as_slice(&self) -> &[T] {
        match self {
            Buffer::Owned(v) => v,
            Buffer::Mapped { data, .. } => data,
        }
    }

    /// Mutable access to the underlying vector, materializing a mapped view
    /// into owned storage first.
    pub fn make_owned(&mut self) -> &mut Vec<T> {
        if let Buffer::Mapped { data, .. } = self {
            *self = Buffer::Owned(data.to_vec());
        }
        match self {
            Buffer::Owned(v) => v,
            Buffer::Mapped { .. } => unreachable!(),
        }
    }
}

impl<T: Copy> std::ops::Deref for Buffer<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Copy> From<Vec<T>> for Buffer<T> {
    fn from(v: Vec<T>) -> Self {
        Buffer::Owned(v)
    }
}

// ============================================================================
// Row Index and Groupby
// ============================================================================

/// A permutation (or selection) of rows, shared cheaply between columns.
#[derive(Clone, Debug)]
pub struct RowIndex {
    ind: Arc<Vec<u32>>,
}

impl RowIndex {
    pub fn new(indices: Vec<u32>) -> Self {
        RowIndex {
            ind: Arc::new(indices),
        }
    }

    pub fn len(&self) -> usize {
        self.ind.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ind.is_empty()
    }

    #[inline]
    pub fn get(&self, i: usize) -> usize {
        self.ind[i] as usize
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.ind
    }
}

/// Group boundaries over a sorted row index: group `g` occupies
/// `ri[offsets[g]..offsets[g + 1])`.
#[derive(Clone, Debug)]
pub struct Groupby {
    offsets: Vec<u32>,
}

impl Groupby {
    pub fn ngroups(&self) -> usize {
        self.offsets.len() - 1
    }

    #[inline]
    pub fn group(&self, g: usize) -> Range<usize> {
        self.offsets[g] as usize..self.offsets[g + 1] as usize
    }

    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }
}

/// One key of a group-by sort.
#[derive(Clone, Copy, Debug)]
pub struct SortSpec {
    pub col: usize,
    pub descending: bool,
    pub na_last: bool,
    /// Sort by this column but do not let it contribute group boundaries.
    pub remove_groups: bool,
}

impl SortSpec {
    pub fn new(col: usize) -> Self {
        SortSpec {
            col,
            descending: false,
            na_last: false,
            remove_groups: false,
        }
    }
}

// ============================================================================
// Columns
// ============================================================================

/// Typed column storage. String offsets are stored off by one (the first
/// entry is 1, not 0) so that the sign bit can mark a missing row even when
/// the blob position is zero; entry `i + 1` holds the end of row `i`.
#[derive(Clone, Debug)]
pub enum ColumnData {
    Bool8(Buffer<i8>),
    Int8(Buffer<i8>),
    Int16(Buffer<i16>),
    Int32(Buffer<i32>),
    Int64(Buffer<i64>),
    Float32(Buffer<f32>),
    Float64(Buffer<f64>),
    Str32 { blob: Buffer<u8>, offsets: Buffer<i32> },
    Str64 { blob: Buffer<u8>, offsets: Buffer<i64> },
}

impl ColumnData {
    fn physical_len(&self) -> usize {
        match self {
            ColumnData::Bool8(b) | ColumnData::Int8(b) => b.len(),
            ColumnData::Int16(b) => b.len(),
            ColumnData::Int32(b) => b.len(),
            ColumnData::Int64(b) => b.len(),
            ColumnData::Float32(b) => b.len(),
            ColumnData::Float64(b) => b.len(),
            ColumnData::Str32 { offsets, .. } => offsets.len() - 1,
            ColumnData::Str64 { offsets, .. } => offsets.len() - 1,
        }
    }
}

/// A single column: shared typed storage plus an optional row-index view.
/// Cloning is shallow; the storage is reference-counted.
#[derive(Clone, Debug)]
pub struct Column {
    data: Arc<ColumnData>,
    ri: Option<RowIndex>,
}

macro_rules! column_ctor {
    ($name:ident, $t:ty, $variant:ident) => {
        pub fn $name(values: Vec<$t>) -> Column {
            Column {
                data: Arc::new(ColumnData::$variant(Buffer::Owned(values))),
                ri: None,
            }
        }
    };
}

impl Column {
    column_ctor!(bool8, i8, Bool8);
    column_ctor!(int8, i8, Int8);
    column_ctor!(int16, i16, Int16);
    column_ctor!(int32, i32, Int32);
    column_ctor!(int64, i64, Int64);
    column_ctor!(float32, f32, Float32);
    column_ctor!(float64, f64, Float64);

    pub fn from_data(data: ColumnData) -> Column {
        Column {
            data: Arc::new(data),
            ri: None,
        }
    }

    /// Build a string column with 32-bit offsets; `None` items are missing.
    pub fn str32<'a, I>(values: I) -> Column
    where
        I: IntoIterator<Item = Option<&'a str>>,
    {
        let (blob, offsets) = build_str_offsets::<i32, _>(values);
        Column::from_data(ColumnData::Str32 {
            blob: Buffer::Owned(blob),
            offsets: Buffer::Owned(offsets),
        })
    }

    /// Build a string column with 64-bit offsets; `None` items are missing.
    pub fn str64<'a, I>(values: I) -> Column
    where
        I: IntoIterator<Item = Option<&'a str>>,
    {
        let (blob, offsets) = build_str_offsets::<i64, _>(values);
        Column::from_data(ColumnData::Str64 {
            blob: Buffer::Owned(blob),
            offsets: Buffer::Owned(offsets),
        })
    }

    /// Allocate a column of `nrows` missing values.
    pub fn new_data(stype: SType, nrows: usize) -> Column {
        let data = match stype {
            SType::Bool8 => ColumnData::Bool8(vec![i8::na(); nrows].into()),
            SType::Int8 => ColumnData::Int8(vec![i8::na(); nrows].into()),
            SType::Int16 => ColumnData::Int16(vec![i16::na(); nrows].into()),
            SType::Int32 => ColumnData::Int32(vec![i32::na(); nrows].into()),
            SType::Int64 => ColumnData::Int64(vec![i64::na(); nrows].into()),
            SType::Float32 => ColumnData::Float32(vec![f32::na(); nrows].into()),
            SType::Float64 => ColumnData::Float64(vec![f64::na(); nrows].into()),
            SType::Str32 => {
                let mut offsets = vec![-1i32; nrows + 1];
                offsets[0] = 1;
                ColumnData::Str32 {
                    blob: Buffer::Owned(Vec::new()),
                    offsets: offsets.into(),
                }
            }
            SType::Str64 => {
                let mut offsets = vec![-1i64; nrows + 1];
                offsets[0] = 1;
                ColumnData::Str64 {
                    blob: Buffer::Owned(Vec::new()),
                    offsets: offsets.into(),
                }
            }
        };
        Column::from_data(data)
    }

    pub fn stype(&self) -> SType {
        match &*self.data {
            ColumnData::Bool8(_) => SType::Bool8,
            ColumnData::Int8(_) => SType::Int8,
            ColumnData::Int16(_) => SType::Int16,
            ColumnData::Int32(_) => SType::Int32,
            ColumnData::Int64(_) => SType::Int64,
            ColumnData::Float32(_) => SType::Float32,
            ColumnData::Float64(_) => SType::Float64,
            ColumnData::Str32 { .. } => SType::Str32,
            ColumnData::Str64 { .. } => SType::Str64,
        }
    }

    /// Logical number of rows (length of the row-index view if present).
    pub fn len(&self) -> usize {
        match &self.ri {
            Some(ri) => ri.len(),
            None => self.data.physical_len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &ColumnData {
        &self.data
    }

    /// Translate a logical row to its physical position in storage.
    #[inline]
    pub(crate) fn physical_row(&self, row: usize) -> usize {
        match &self.ri {
            Some(ri) => ri.get(row),
            None => row,
        }
    }

    pub fn is_na(&self, row: usize) -> bool {
        let p = self.physical_row(row);
        match &*self.data {
            ColumnData::Bool8(b) | ColumnData::Int8(b) => b[p].is_na(),
            ColumnData::Int16(b) => b[p].is_na(),
            ColumnData::Int32(b) => b[p].is_na(),
            ColumnData::Int64(b) => b[p].is_na(),
            ColumnData::Float32(b) => b[p].is_na(),
            ColumnData::Float64(b) => b[p].is_na(),
            ColumnData::Str32 { offsets, .. } => offsets[p + 1] < 0,
            ColumnData::Str64 { offsets, .. } => offsets[p + 1] < 0,
        }
    }

    /// String cell accessor; `None` when the row is missing.
    /// Panics if the column is not a string column.
    pub fn str_at(&self, row: usize) -> Option<&str> {
        let p = self.physical_row(row);
        match &*self.data {
            ColumnData::Str32 { blob, offsets } => str_cell(blob, &offsets[p], &offsets[p + 1]),
            ColumnData::Str64 { blob, offsets } => str_cell(blob, &offsets[p], &offsets[p + 1]),
            _ => panic!("str_at on a non-string column"),
        }
    }

    /// Render one cell for text output; `None` when the row is missing.
    pub fn format_cell(&self, row: usize) -> Option<String> {
        if self.is_na(row) {
            return None;
        }
        let p = self.physical_row(row);
        let s = match &*self.data {
            ColumnData::Bool8(b) | ColumnData::Int8(b) => b[p].to_string(),
            ColumnData::Int16(b) => b[p].to_string(),
            ColumnData::Int32(b) => b[p].to_string(),
            ColumnData::Int64(b) => b[p].to_string(),
            ColumnData::Float32(b) => b[p].to_string(),
            ColumnData::Float64(b) => b[p].to_string(),
            ColumnData::Str32 { .. } | ColumnData::Str64 { .. } => {
                return self.str_at(row).map(str::to_string);
            }
        };
        Some(s)
    }

    /// Wrap this column in a row-index view, composing with any existing one.
    pub fn apply_rowindex(&self, ri: &RowIndex) -> Column {
        let composed = match &self.ri {
            Some(inner) => {
                let ind = ri
                    .as_slice()
                    .iter()
                    .map(|&j| inner.as_slice()[j as usize])
                    .collect();
                RowIndex::new(ind)
            }
            None => ri.clone(),
        };
        Column {
            data: Arc::clone(&self.data),
            ri: Some(composed),
        }
    }

    /// Resize to `n` rows, padding with missing values. Only meaningful for
    /// plain (non-viewed) columns, which is the only way the reader uses it.
    pub fn set_nrows(&mut self, n: usize) {
        debug_assert!(self.ri.is_none(), "set_nrows on a row-indexed column");
        let data = Arc::make_mut(&mut self.data);
        match data {
            ColumnData::Bool8(b) | ColumnData::Int8(b) => b.make_owned().resize(n, i8::na()),
            ColumnData::Int16(b) => b.make_owned().resize(n, i16::na()),
            ColumnData::Int32(b) => b.make_owned().resize(n, i32::na()),
            ColumnData::Int64(b) => b.make_owned().resize(n, i64::na()),
            ColumnData::Float32(b) => b.make_owned().resize(n, f32::na()),
            ColumnData::Float64(b) => b.make_owned().resize(n, f64::na()),
            ColumnData::Str32 { blob, offsets } => {
                let offs = offsets.make_owned();
                let old = offs.len() - 1;
                if n < old {
                    offs.truncate(n + 1);
                    let end = (offs[n].unsigned_abs() as usize).saturating_sub(1);
                    blob.make_owned().truncate(end);
                } else {
                    let last = offs[old].abs();
                    offs.resize(n + 1, -last);
                }
            }
            ColumnData::Str64 { blob, offsets } => {
                let offs = offsets.make_owned();
                let old = offs.len() - 1;
                if n < old {
                    offs.truncate(n + 1);
                    let end = (offs[n].unsigned_abs() as usize).saturating_sub(1);
                    blob.make_owned().truncate(end);
                } else {
                    let last = offs[old].abs();
                    offs.resize(n + 1, -last);
                }
            }
        }
    }

    /// Compare two logical rows for sorting, with missing values (including
    /// float NaN) ordered per `spec`. Equal missing cells compare equal.
    fn cmp_rows(&self, a: usize, b: usize, spec: &SortSpec) -> Ordering {
        let na_a = self.is_na(a);
        let na_b = self.is_na(b);
        match (na_a, na_b) {
            (true, true) => Ordering::Equal,
            (true, false) => {
                if spec.na_last {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (false, true) => {
                if spec.na_last {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (false, false) => {
                let ord = self.cmp_values(a, b);
                if spec.descending { ord.reverse() } else { ord }
            }
        }
    }

    /// Value comparison of two non-missing logical rows.
    fn cmp_values(&self, a: usize, b: usize) -> Ordering {
        let pa = self.physical_row(a);
        let pb = self.physical_row(b);
        match &*self.data {
            ColumnData::Bool8(v) | ColumnData::Int8(v) => v[pa].cmp(&v[pb]),
            ColumnData::Int16(v) => v[pa].cmp(&v[pb]),
            ColumnData::Int32(v) => v[pa].cmp(&v[pb]),
            ColumnData::Int64(v) => v[pa].cmp(&v[pb]),
            ColumnData::Float32(v) => v[pa].partial_cmp(&v[pb]).unwrap_or(Ordering::Equal),
            ColumnData::Float64(v) => v[pa].partial_cmp(&v[pb]).unwrap_or(Ordering::Equal),
            ColumnData::Str32 { blob, offsets } => {
                str_cell(blob, &offsets[pa], &offsets[pa + 1])
                    .cmp(&str_cell(blob, &offsets[pb], &offsets[pb + 1]))
            }
            ColumnData::Str64 { blob, offsets } => {
                str_cell(blob, &offsets[pa], &offsets[pa + 1])
                    .cmp(&str_cell(blob, &offsets[pb], &offsets[pb + 1]))
            }
        }
    }
}

/// Decode one string cell from the blob given the stored (off-by-one)
/// previous and current offsets.
fn str_cell<'b, T: Copy + Into<i64>>(blob: &'b [u8], prev: &T, cur: &T) -> Option<&'b str> {
    let cur: i64 = (*cur).into();
    if cur < 0 {
        return None;
    }
    let prev: i64 = (*prev).into();
    let start = (prev.unsigned_abs() as usize) - 1;
    let end = (cur as usize) - 1;
    std::str::from_utf8(&blob[start..end]).ok()
}

/// Assemble blob and stored-form offsets for a string column.
fn build_str_offsets<'a, T, I>(values: I) -> (Vec<u8>, Vec<T>)
where
    T: TryFrom<i64> + Copy,
    <T as TryFrom<i64>>::Error: std::fmt::Debug,
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut blob = Vec::new();
    let mut offsets: Vec<T> = Vec::new();
    let push = |offsets: &mut Vec<T>, v: i64| {
        offsets.push(T::try_from(v).expect("string blob exceeds offset width"));
    };
    push(&mut offsets, 1);
    for v in values {
        match v {
            Some(s) => {
                blob.extend_from_slice(s.as_bytes());
                push(&mut offsets, blob.len() as i64 + 1);
            }
            None => {
                push(&mut offsets, -(blob.len() as i64 + 1));
            }
        }
    }
    (blob, offsets)
}

// ============================================================================
// Frame
// ============================================================================

/// An ordered collection of equal-length named columns.
#[derive(Clone, Debug)]
pub struct Frame {
    nrows: usize,
    columns: Vec<Column>,
    names: Vec<String>,
}

impl Frame {
    pub fn new(columns: Vec<Column>, names: Vec<String>) -> Result<Frame, FrameError> {
        assert_eq!(columns.len(), names.len());
        let nrows = columns.first().map_or(0, |c| c.len());
        for (i, col) in columns.iter().enumerate() {
            if col.len() != nrows {
                return Err(FrameError::ColumnLength {
                    index: i,
                    len: col.len(),
                    nrows,
                });
            }
        }
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(FrameError::DuplicateName(name.clone()));
            }
        }
        Ok(Frame {
            nrows,
            columns,
            names,
        })
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn column(&self, i: usize) -> &Column {
        &self.columns[i]
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Find a column by name.
    pub fn column_named(&self, name: &str) -> Option<&Column> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.columns[i])
    }

    /// Restrict every column to the rows selected by `ri`, without copying
    /// cell data.
    pub fn apply_rowindex(&mut self, ri: &RowIndex) {
        for col in &mut self.columns {
            *col = col.apply_rowindex(ri);
        }
        self.nrows = ri.len();
    }

    /// Append the columns of `others` to this frame.
    pub fn cbind(&mut self, others: Vec<Frame>) -> Result<(), FrameError> {
        for other in others {
            if other.nrows != self.nrows {
                return Err(FrameError::RowCountMismatch(other.nrows, self.nrows));
            }
            for (col, name) in other.columns.into_iter().zip(other.names) {
                if self.names.contains(&name) {
                    return Err(FrameError::DuplicateName(name));
                }
                self.columns.push(col);
                self.names.push(name);
            }
        }
        Ok(())
    }

    /// Resize every column to `n` rows, padding with missing values.
    pub fn set_nrows(&mut self, n: usize) {
        for col in &mut self.columns {
            col.set_nrows(n);
        }
        self.nrows = n;
    }

    /// Stable sort of the row indices by the given keys, plus the group
    /// boundaries induced by the keys that do not have `remove_groups` set.
    pub fn group(&self, specs: &[SortSpec]) -> Result<(RowIndex, Groupby), FrameError> {
        for spec in specs {
            if spec.col >= self.ncols() {
                return Err(FrameError::ColumnIndex(spec.col, self.ncols()));
            }
        }

        let mut indices: Vec<u32> = (0..self.nrows as u32).collect();
        indices.sort_by(|&a, &b| {
            for spec in specs {
                let ord = self.columns[spec.col].cmp_rows(a as usize, b as usize, spec);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });

        let grouping: Vec<&SortSpec> = specs.iter().filter(|s| !s.remove_groups).collect();
        let mut offsets: Vec<u32> = vec![0];
        if grouping.is_empty() {
            offsets.push(self.nrows as u32);
        } else {
            for j in 1..indices.len() {
                let prev = indices[j - 1] as usize;
                let cur = indices[j] as usize;
                let boundary = grouping.iter().any(|spec| {
                    self.columns[spec.col].cmp_rows(prev, cur, spec) != Ordering::Equal
                });
                if boundary {
                    offsets.push(j as u32);
                }
            }
            offsets.push(self.nrows as u32);
        }
        if self.nrows == 0 {
            offsets = vec![0];
        }

        Ok((RowIndex::new(indices), Groupby { offsets }))
    }
}

// ============================================================================
// Tests
// ============================================================================
