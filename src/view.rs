//! Uniform floating-point read view over numeric columns.

use num_traits::Float;

use crate::frame::{Column, ColumnData, FrameError};

/// Random-access `T`-typed view over any numeric column, with columnwise
/// extrema computed once at construction. The view never materializes the
/// converted column; it is an index function. Missing cells read as NaN.
pub struct NumericView<'a, T> {
    col: &'a Column,
    nrows: usize,
    min: T,
    max: T,
}

/// Convert an infallibly representable number into `T`.
#[inline]
pub(crate) fn cast<T: Float>(x: f64) -> T {
    T::from(x).expect("value converts to the target float type")
}

impl<'a, T: Float> NumericView<'a, T> {
    /// Build a view over `col`. Fails with [`FrameError::NotNumeric`] for
    /// string columns.
    pub fn new(col: &'a Column) -> Result<Self, FrameError> {
        if !col.stype().is_numeric() {
            return Err(FrameError::NotNumeric(col.stype()));
        }
        let nrows = col.len();
        let mut view = NumericView {
            col,
            nrows,
            min: T::nan(),
            max: T::nan(),
        };
        for row in 0..nrows {
            let v = view.read(row);
            if v.is_nan() {
                continue;
            }
            if view.min.is_nan() || v < view.min {
                view.min = v;
            }
            if view.max.is_nan() || v > view.max {
                view.max = v;
            }
        }
        Ok(view)
    }

    /// Columnwise minimum over non-missing cells (NaN if all missing).
    pub fn min(&self) -> T {
        self.min
    }

    /// Columnwise maximum over non-missing cells (NaN if all missing).
    pub fn max(&self) -> T {
        self.max
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    /// Read one cell, converting to `T`; missing cells yield NaN.
    #[inline]
    pub fn read(&self, row: usize) -> T {
        if self.col.is_na(row) {
            return T::nan();
        }
        let p = self.col.physical_row(row);
        match self.col.data() {
            ColumnData::Bool8(b) | ColumnData::Int8(b) => cast(b[p] as f64),
            ColumnData::Int16(b) => cast(b[p] as f64),
            ColumnData::Int32(b) => cast(b[p] as f64),
            ColumnData::Int64(b) => cast(b[p] as f64),
            ColumnData::Float32(b) => cast(b[p] as f64),
            ColumnData::Float64(b) => cast(b[p]),
            ColumnData::Str32 { .. } | ColumnData::Str64 { .. } => unreachable!(),
        }
    }

    /// Whether the cell at `row` is missing.
    #[inline]
    pub fn is_na(&self, row: usize) -> bool {
        self.col.is_na(row)
    }
}

// ============================================================================
// Tests
// ============================================================================
