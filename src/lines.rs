//! Line-oriented chunk source: newline-terminated records of comma-separated
//! float fields, parsed concurrently through [`crate::reader::ParallelReader`]
//! into a frame of `f64` columns.
//!
//! Empty or unparseable fields become missing values. A line with the wrong
//! field count is treated as a mis-snapped chunk boundary when the chunk
//! start was approximate (recoverable; the reader re-parses from an exact
//! start) and as a fatal parse error otherwise.

use memchr::memchr;
use parking_lot::RwLock;

use crate::frame::{Column, Frame, FrameError};
use crate::reader::{ChunkCoordinates, ChunkSource, ReadError, ThreadContext};

/// Shared parsing state for one input buffer: the byte range plus the
/// growable output columns the reader commits rows into.
pub struct LineSource<'d> {
    data: &'d [u8],
    ncols: usize,
    columns: RwLock<Vec<Vec<f64>>>,
}

impl<'d> LineSource<'d> {
    pub fn new(data: &'d [u8], ncols: usize) -> Self {
        LineSource {
            data,
            ncols,
            columns: RwLock::new(vec![Vec::new(); ncols]),
        }
    }

    pub fn data(&self) -> &'d [u8] {
        self.data
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Turn the committed columns into a frame. `names` must have one entry
    /// per column.
    pub fn into_frame(self, names: Vec<String>) -> Result<Frame, FrameError> {
        let columns = self
            .columns
            .into_inner()
            .into_iter()
            .map(Column::float64)
            .collect();
        Frame::new(columns, names)
    }
}

/// Estimate the mean record length from the first records of the buffer.
pub fn mean_line_length(data: &[u8]) -> f64 {
    const PROBE_LINES: usize = 100;
    let mut lines = 0usize;
    let mut consumed = 0usize;
    while lines < PROBE_LINES {
        match memchr(b'\n', &data[consumed..]) {
            Some(k) => {
                consumed += k + 1;
                lines += 1;
            }
            None => break,
        }
    }
    if lines == 0 {
        data.len().max(1) as f64
    } else {
        consumed as f64 / lines as f64
    }
}

/// Per-worker parse buffer: rows are stored row-major and stamped with their
/// output window once the ordered section has placed them.
pub struct LineContext<'s, 'd> {
    source: &'s LineSource<'d>,
    /// Row-major parsed values, `used * ncols` long.
    values: Vec<f64>,
    used: usize,
    row0: Option<usize>,
}

impl LineContext<'_, '_> {
    /// Parse `[start, end)`. Returns `None` on a row arity mismatch, with
    /// the byte position where parsing stopped otherwise.
    fn parse_range(&mut self, start: usize, end: usize, at_eof: bool) -> Option<usize> {
        let data = self.source.data;
        let ncols = self.source.ncols;
        self.values.clear();
        self.used = 0;

        let mut pos = start;
        while pos < end {
            let line_end = match memchr(b'\n', &data[pos..end]) {
                Some(k) => pos + k,
                // A trailing record without its newline only exists at the
                // end of input; otherwise the snapped end cut it off.
                None if at_eof => end,
                None => break,
            };
            let line = &data[pos..line_end];
            if !line.is_empty() {
                let mut nfields = 0usize;
                let mut field_start = 0usize;
                loop {
                    let field_end = memchr(b',', &line[field_start..])
                        .map(|k| field_start + k)
                        .unwrap_or(line.len());
                    let field = &line[field_start..field_end];
                    nfields += 1;
                    if nfields > ncols {
                        return None;
                    }
                    self.values.push(parse_field(field));
                    if field_end == line.len() {
                        break;
                    }
                    field_start = field_end + 1;
                }
                if nfields != ncols {
                    return None;
                }
                self.used += 1;
            }
            pos = if line_end < end { line_end + 1 } else { end };
        }
        Some(pos)
    }
}

/// One field to `f64`; empty and malformed fields are missing.
fn parse_field(field: &[u8]) -> f64 {
    if field.is_empty() {
        return f64::NAN;
    }
    fast_float::parse::<f64, _>(field).unwrap_or(f64::NAN)
}

impl ThreadContext for LineContext<'_, '_> {
    fn read_chunk(
        &mut self,
        expected: &ChunkCoordinates,
        actual: &mut ChunkCoordinates,
    ) -> Result<(), ReadError> {
        let start = expected.start;
        let end = expected.end.unwrap_or(self.source.data.len());
        let at_eof = end == self.source.data.len();
        *actual = *expected;
        match self.parse_range(start, end, at_eof) {
            Some(consumed) => {
                actual.end = Some(consumed.max(start));
                Ok(())
            }
            None if !expected.start_exact => {
                // Probably a mis-snapped boundary; let the ordered section
                // retry from the true record start.
                self.values.clear();
                self.used = 0;
                actual.end = None;
                Ok(())
            }
            None => Err(ReadError::Parse(format!(
                "record with wrong field count near byte {start}"
            ))),
        }
    }

    fn used_rows(&self) -> usize {
        self.used
    }

    fn truncate_rows(&mut self, n: usize) {
        if n < self.used {
            self.used = n;
            self.values.truncate(n * self.source.ncols);
        }
    }

    fn order_buffer(&mut self, row0: usize) {
        self.row0 = Some(row0);
    }

    fn push_buffers(&mut self) -> Result<(), ReadError> {
        let Some(row0) = self.row0.take() else {
            return Ok(());
        };
        let ncols = self.source.ncols;
        let cols = self.source.columns.read();
        for (c, col) in cols.iter().enumerate() {
            debug_assert!(row0 + self.used <= col.len());
            let base = col.as_ptr() as *mut f64;
            for k in 0..self.used {
                // SAFETY: the ordered section assigned this worker the row
                // window [row0, row0 + used); windows are disjoint between
                // workers and resizes hold the write side of the lock.
                unsafe { base.add(row0 + k).write(self.values[k * ncols + c]) };
            }
        }
        self.values.clear();
        self.used = 0;
        Ok(())
    }
}

impl<'d> ChunkSource for LineSource<'d> {
    type Context<'s>
        = LineContext<'s, 'd>
    where
        Self: 's;

    fn init_thread_context(&self) -> LineContext<'_, 'd> {
        LineContext {
            source: self,
            values: Vec::new(),
            used: 0,
            row0: None,
        }
    }

    /// Snap an approximate boundary to the byte after the next newline.
    fn adjust_chunk_coordinates(&self, cc: &mut ChunkCoordinates, _ctx: &mut LineContext<'_, 'd>) {
        if !cc.start_exact {
            cc.start = next_record_start(self.data, cc.start);
        }
        if let Some(end) = cc.end {
            if !cc.end_exact {
                cc.end = Some(next_record_start(self.data, end).max(cc.start));
            }
        }
    }

    fn set_nrows(&self, nrows: usize) {
        let mut cols = self.columns.write();
        for col in cols.iter_mut() {
            col.resize(nrows, f64::NAN);
        }
    }
}

/// Byte position after the first newline at or beyond `pos`.
fn next_record_start(data: &[u8], pos: usize) -> usize {
    if pos == 0 || pos >= data.len() {
        return pos.min(data.len());
    }
    match memchr(b'\n', &data[pos..]) {
        Some(k) => pos + k + 1,
        None => data.len(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use crate::reader::ParallelReader;

    fn read_to_frame(text: &str, ncols: usize, nthreads: u32, nrows_max: usize) -> Frame {
        let source = LineSource::new(text.as_bytes(), ncols);
        let reader = ParallelReader::new(
            &source,
            0..text.len(),
            mean_line_length(text.as_bytes()),
            nthreads,
            nrows_max,
            0,
        );
        reader.read_all(&NoProgress).unwrap();
        let names = (0..ncols).map(|c| format!("C{c}")).collect();
        source.into_frame(names).unwrap()
    }

    fn col_values(frame: &Frame, c: usize) -> Vec<f64> {
        use crate::frame::ColumnData;
        let ColumnData::Float64(buf) = frame.column(c).data() else {
            panic!("expected float64 column");
        };
        buf.as_slice().to_vec()
    }

    #[test]
    fn test_parse_small_input() {
        let frame = read_to_frame("1.5,2\n,3\n4,\n", 2, 1, usize::MAX);
        assert_eq!(frame.nrows(), 3);
        let a = col_values(&frame, 0);
        let b = col_values(&frame, 1);
        assert_eq!(a[0], 1.5);
        assert!(a[1].is_nan());
        assert_eq!(a[2], 4.0);
        assert_eq!(b[0], 2.0);
        assert_eq!(b[1], 3.0);
        assert!(b[2].is_nan());
    }

    #[test]
    fn test_trailing_record_without_newline() {
        let frame = read_to_frame("1,2\n3,4", 2, 1, usize::MAX);
        assert_eq!(frame.nrows(), 2);
        assert_eq!(col_values(&frame, 1), vec![2.0, 4.0]);
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let frame = read_to_frame("1,2\n\n3,4\n", 2, 1, usize::MAX);
        assert_eq!(frame.nrows(), 2);
    }

    #[test]
    fn test_large_input_parallel_preserves_order() {
        // Variable-width records keep the snapped boundaries honest.
        let mut text = String::new();
        for i in 0..120_000 {
            let pad = "9".repeat(i % 7);
            text.push_str(&format!("{i},{i}.{pad}5\n"));
        }
        let frame = read_to_frame(&text, 2, 4, usize::MAX);
        assert_eq!(frame.nrows(), 120_000);
        let ids = col_values(&frame, 0);
        assert!(ids.iter().enumerate().all(|(i, &v)| v == i as f64));
    }

    #[test]
    fn test_parallel_matches_single_thread() {
        let mut text = String::new();
        for i in 0..50_000 {
            text.push_str(&format!("{},{},{}\n", i, i * 2, i % 13));
        }
        let a = read_to_frame(&text, 3, 1, usize::MAX);
        let b = read_to_frame(&text, 3, 8, usize::MAX);
        for c in 0..3 {
            assert_eq!(col_values(&a, c), col_values(&b, c));
        }
    }

    #[test]
    fn test_row_cap() {
        let mut text = String::new();
        for i in 0..100_000 {
            text.push_str(&format!("{i}\n"));
        }
        let frame = read_to_frame(&text, 1, 4, 777);
        assert_eq!(frame.nrows(), 777);
        let v = col_values(&frame, 0);
        assert!(v.iter().enumerate().all(|(i, &x)| x == i as f64));
    }

    #[test]
    fn test_wrong_arity_from_exact_start_is_fatal() {
        let text = "1,2\n3\n5,6\n";
        let source = LineSource::new(text.as_bytes(), 2);
        let reader = ParallelReader::new(&source, 0..text.len(), 4.0, 1, usize::MAX, 0);
        let err = reader.read_all(&NoProgress).unwrap_err();
        assert!(matches!(err, ReadError::Parse(_)));
    }

    #[test]
    fn test_unparseable_field_becomes_missing() {
        let frame = read_to_frame("1,x\n2,3\n", 2, 1, usize::MAX);
        let b = col_values(&frame, 1);
        assert!(b[0].is_nan());
        assert_eq!(b[1], 3.0);
    }

    #[test]
    fn test_mean_line_length() {
        assert_eq!(mean_line_length(b"ab\ncd\nef\n"), 3.0);
        // No newline at all: the whole buffer is one record.
        assert_eq!(mean_line_length(b"abcd"), 4.0);
    }
}
