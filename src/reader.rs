//! Parallel reading of a chunked byte range with strict output ordering.
//!
//! The byte range is split into chunks parsed concurrently by a pool of
//! workers. Chunk boundaries other than the very first and last are only
//! approximate (the source snaps them onto record starts), so each worker's
//! actual parse range is reconciled against its neighbour inside an ordered
//! critical section; a chunk whose actual start disagrees with the end of
//! the previous chunk is re-parsed exactly once from the now-exact start.
//! Output columns grow geometrically as rows are committed and shrink to
//! the written row count at the end.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::parallel::{self, ErrorCapture, OrderedSerializer};
use crate::progress::{ProgressSink, Status};

// ============================================================================
// Coordinates and Errors
// ============================================================================

/// Byte coordinates of one chunk. A boundary is *exact* when it is known to
/// fall on a record start, *approximate* when it still needs snapping.
/// `end = None` signals that the last parse attempt failed recoverably.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkCoordinates {
    pub start: usize,
    pub end: Option<usize>,
    pub start_exact: bool,
    pub end_exact: bool,
}

impl ChunkCoordinates {
    pub fn set_start_exact(&mut self, pos: usize) {
        self.start = pos;
        self.start_exact = true;
    }

    pub fn set_start_approximate(&mut self, pos: usize) {
        self.start = pos;
        self.start_exact = false;
    }

    pub fn set_end_exact(&mut self, pos: usize) {
        self.end = Some(pos);
        self.end_exact = true;
    }

    pub fn set_end_approximate(&mut self, pos: usize) {
        self.end = Some(pos);
        self.end_exact = false;
    }
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("chunk {index} could not be parsed even from an exact start at byte {start}")]
    ChunkUnparseable { index: usize, start: usize },

    #[error("read interrupted by the progress callback")]
    Interrupted,

    #[error("parse error: {0}")]
    Parse(String),
}

// ============================================================================
// Source Traits
// ============================================================================

/// Per-worker parsing state. Rows flow through three stages: `read_chunk`
/// fills the local buffer, `order_buffer` stamps it with its output row
/// window (inside the ordered section), and `push_buffers` copies stamped
/// rows into the shared columns (outside the ordered section; windows of
/// different workers are disjoint).
pub trait ThreadContext {
    /// Parse the chunk described by `expected`, recording the byte range
    /// actually consumed in `actual`. On a recoverable failure, set
    /// `actual.end = None` and return normally; errors without recovery are
    /// returned as `Err`.
    fn read_chunk(
        &mut self,
        expected: &ChunkCoordinates,
        actual: &mut ChunkCoordinates,
    ) -> Result<(), ReadError>;

    /// Rows currently held by the local buffer.
    fn used_rows(&self) -> usize;

    /// Keep only the first `n` rows of the local buffer.
    fn truncate_rows(&mut self, n: usize);

    /// Stamp the buffered rows with their first output row.
    fn order_buffer(&mut self, row0: usize);

    /// Flush stamped rows to the shared output columns and clear the stamp.
    /// Unstamped rows are never flushed.
    fn push_buffers(&mut self) -> Result<(), ReadError>;
}

/// The externally provided parser side of a read: owns the shared output
/// columns and hands out thread-local parse contexts.
pub trait ChunkSource: Sync {
    type Context<'s>: ThreadContext
    where
        Self: 's;

    fn init_thread_context(&self) -> Self::Context<'_>;

    /// Snap approximate chunk boundaries onto record starts.
    fn adjust_chunk_coordinates(&self, cc: &mut ChunkCoordinates, ctx: &mut Self::Context<'_>);

    /// Resize the shared output columns. May run concurrently with
    /// `push_buffers` on other workers; implementations synchronize with
    /// the exclusive side of their column lock.
    fn set_nrows(&self, nrows: usize);
}

// ============================================================================
// Reader
// ============================================================================

/// Row count and coverage of a finished read.
#[derive(Debug, Clone, Copy)]
pub struct ReadStats {
    pub nrows_written: usize,
    pub end_of_last_chunk: usize,
    pub chunk_count: usize,
}

/// Mutated only inside the ordered section.
struct OrderedState {
    nrows_written: usize,
    nrows_allocated: usize,
    end_of_last_chunk: usize,
}

pub struct ParallelReader<'a, S: ChunkSource> {
    source: &'a S,
    sof: usize,
    eof: usize,
    line_length: f64,
    nthreads: usize,
    chunk_size: usize,
    chunk_count: usize,
    nrows_allocated: usize,
    nrows_max: usize,
}

impl<'a, S: ChunkSource> ParallelReader<'a, S> {
    /// Plan a read of `range` assuming records average `mean_line_len`
    /// bytes. `nrows_allocated` is the source's current column capacity and
    /// must not exceed `nrows_max`.
    pub fn new(
        source: &'a S,
        range: Range<usize>,
        mean_line_len: f64,
        nthreads: u32,
        nrows_max: usize,
        nrows_allocated: usize,
    ) -> Self {
        assert!(range.start <= range.end);
        assert!(nrows_allocated <= nrows_max);
        let mut reader = ParallelReader {
            source,
            sof: range.start,
            eof: range.end,
            line_length: mean_line_len.max(1.0),
            nthreads: parallel::num_threads(nthreads),
            chunk_size: 0,
            chunk_count: 0,
            nrows_allocated,
            nrows_max,
        };
        reader.plan_chunks();
        reader
    }

    /// Split the input into chunks sized for the worker pool: roughly a
    /// thousand records each, within [64 KiB, 1 MiB], never less than ten
    /// records, and a whole number of chunks per thread. A small row cap
    /// shrinks the planned input since the tail would be thrown away anyway.
    fn plan_chunks(&mut self) {
        let mut input_size = self.eof - self.sof;
        let max_rows_size = self.nrows_max as f64 * self.line_length;
        let mut input_reduced = false;
        if self.nrows_max < 1_000_000 && max_rows_size < input_size as f64 {
            input_size = (1.5 * max_rows_size) as usize + 1;
            input_reduced = true;
        }
        self.chunk_size = ((1000.0 * self.line_length) as usize)
            .clamp(1 << 16, 1 << 20)
            .max((10.0 * self.line_length) as usize);
        self.chunk_count = (input_size / self.chunk_size).max(1);
        if self.chunk_count > self.nthreads {
            self.chunk_count = self.nthreads * (1 + (self.chunk_count - 1) / self.nthreads);
            self.chunk_size = input_size / self.chunk_count;
        } else {
            self.nthreads = self.chunk_count;
            self.chunk_size = input_size / self.chunk_count;
            if input_reduced {
                // A single-chunk plan would try to swallow the whole input
                // even though the row cap stops the read much earlier.
                self.chunk_count += 2;
                debug!(
                    nthreads = self.nthreads,
                    nrows_max = self.nrows_max,
                    "threads reduced: the row cap bounds the amount of data to read"
                );
            } else {
                debug!(nthreads = self.nthreads, "threads reduced: input is small");
            }
        }
        debug!(
            chunks = self.chunk_count,
            chunk_size = self.chunk_size,
            "chunk plan"
        );
    }

    /// Expected coordinates of chunk `i`. Only the first chunk (or every
    /// chunk of a single-threaded read) starts exactly where the previous
    /// one ended; everything else starts on the fixed grid and gets snapped
    /// by the source.
    fn compute_chunk_boundaries(
        &self,
        i: usize,
        ctx: &mut S::Context<'_>,
        state: &Mutex<OrderedState>,
    ) -> ChunkCoordinates {
        debug_assert!(i < self.chunk_count);
        let mut cc = ChunkCoordinates::default();

        if i == 0 || self.nthreads == 1 {
            cc.set_start_exact(state.lock().end_of_last_chunk);
        } else {
            cc.set_start_approximate(self.sof + i * self.chunk_size);
        }

        // The end of input can be reached before the last chunk when the
        // planned size was reduced by the row cap.
        let end = cc.start + self.chunk_size;
        if i == self.chunk_count - 1 || end >= self.eof {
            cc.set_end_exact(self.eof);
        } else {
            cc.set_end_approximate(end);
        }

        self.source.adjust_chunk_coordinates(&mut cc, ctx);
        debug_assert!(cc.start >= self.sof);
        debug_assert!(cc.end.is_none_or(|e| e <= self.eof));
        cc
    }

    /// Fraction of the input consumed so far.
    fn work_done_amount(&self, state: &Mutex<OrderedState>) -> f32 {
        let done = (state.lock().end_of_last_chunk - self.sof) as f64;
        let total = (self.eof - self.sof).max(1) as f64;
        (done / total) as f32
    }

    /// Read the whole byte range, committing rows to the source's output
    /// columns in strict input order.
    pub fn read_all(self, progress: &dyn ProgressSink) -> Result<ReadStats, ReadError> {
        let capture: ErrorCapture<ReadError> = ErrorCapture::new();
        let serializer = OrderedSerializer::new();
        let next_chunk = AtomicUsize::new(0);
        let state = Mutex::new(OrderedState {
            nrows_written: 0,
            nrows_allocated: self.nrows_allocated,
            end_of_last_chunk: self.sof,
        });

        let reader = &self;
        parallel::run_workers(self.nthreads, &capture, |worker, _nworkers| {
            let mut ctx = reader.source.init_thread_context();
            let mut acc = ChunkCoordinates::default();

            loop {
                let i = next_chunk.fetch_add(1, Ordering::Relaxed);
                if i >= reader.chunk_count || capture.stop_requested() {
                    break;
                }

                if worker == 0
                    && !progress.report(reader.work_done_amount(&state), Status::Running)
                {
                    return Err(ReadError::Interrupted);
                }

                // Flush rows ordered in a previous iteration before reusing
                // the local buffer.
                ctx.push_buffers()?;
                let xcc = reader.compute_chunk_boundaries(i, &mut ctx, &state);
                ctx.read_chunk(&xcc, &mut acc)?;

                if !serializer.wait_turn(i, || capture.stop_requested()) {
                    ctx.truncate_rows(0);
                    break;
                }
                let result = reader.ordered_section(i, &mut ctx, &mut acc, &xcc, &state, &capture);
                serializer.advance();
                result?;
            }

            // Rows that were never ordered must not survive an abort.
            if capture.error_caught() {
                ctx.truncate_rows(0);
            }
            ctx.push_buffers()?;
            Ok(())
        });

        if let Some(err) = capture.take_error() {
            let status = if matches!(err, ReadError::Interrupted) {
                Status::Interrupted
            } else {
                Status::Error
            };
            progress.report(self.work_done_amount(&state), status);
            return Err(err);
        }

        let state = state.into_inner();

        // Shrink the output to what was actually written.
        self.source.set_nrows(state.nrows_written);
        if state.nrows_written < self.nrows_max {
            assert_eq!(
                state.end_of_last_chunk, self.eof,
                "input not fully consumed"
            );
        }
        progress.report(1.0, Status::Done);
        Ok(ReadStats {
            nrows_written: state.nrows_written,
            end_of_last_chunk: state.end_of_last_chunk,
            chunk_count: self.chunk_count,
        })
    }

    /// The in-order critical section for chunk `i`: reconcile the actual
    /// parse range with the end of the previous chunk, grow the output if
    /// needed, and stamp the rows with their output window.
    fn ordered_section(
        &self,
        i: usize,
        ctx: &mut S::Context<'_>,
        acc: &mut ChunkCoordinates,
        xcc: &ChunkCoordinates,
        state: &Mutex<OrderedState>,
        capture: &ErrorCapture<ReadError>,
    ) -> Result<(), ReadError> {
        let mut st = state.lock();
        if capture.stop_requested() {
            ctx.truncate_rows(0);
            return Ok(());
        }

        // Re-parse on misalignment: at most once, because the second
        // attempt starts from an exact boundary.
        let mut reparsed = false;
        loop {
            let aligned = acc.start == st.end_of_last_chunk
                && acc.end.is_some_and(|e| e >= st.end_of_last_chunk);
            if aligned {
                st.end_of_last_chunk = acc.end.unwrap_or(st.end_of_last_chunk);
                break;
            }
            if reparsed {
                return Err(ReadError::ChunkUnparseable {
                    index: i,
                    start: st.end_of_last_chunk,
                });
            }
            reparsed = true;
            trace!(
                chunk = i,
                start = st.end_of_last_chunk,
                "re-parsing misaligned chunk from its exact start"
            );
            let mut exact = *xcc;
            exact.set_start_exact(st.end_of_last_chunk);
            ctx.read_chunk(&exact, acc)?;
        }

        let row0 = st.nrows_written;
        let mut nrows_new = row0 + ctx.used_rows();
        if nrows_new > st.nrows_allocated {
            if nrows_new > self.nrows_max {
                // Row cap hit: clip this chunk and stop handing out work.
                ctx.truncate_rows(self.nrows_max - row0);
                nrows_new = self.nrows_max;
                self.realloc_columns(&mut st, i, nrows_new);
                capture.request_stop();
            } else {
                self.realloc_columns(&mut st, i, nrows_new);
            }
        }
        st.nrows_written = nrows_new;
        ctx.order_buffer(row0);
        trace!(chunk = i, row0, rows = ctx.used_rows(), "chunk committed");
        Ok(())
    }

    /// Grow the output columns. Mid-read the new size anticipates the
    /// remaining chunks; on the last chunk the requested size is exact.
    fn realloc_columns(&self, st: &mut OrderedState, ichunk: usize, new_nrows: usize) {
        debug_assert!(ichunk < self.chunk_count);
        let mut target = new_nrows;
        if target == st.nrows_allocated {
            return;
        }
        if ichunk < self.chunk_count - 1 {
            let expected =
                1.2 * new_nrows as f64 * self.chunk_count as f64 / (ichunk + 1) as f64;
            target = (expected.ceil() as usize).max(st.nrows_allocated + 1024);
        }
        target = target.min(self.nrows_max);
        st.nrows_allocated = target;
        debug!(nrows = target, chunk = ichunk, "reallocating output columns");
        self.source.set_nrows(target);
    }
}

// ============================================================================
// Tests
// ============================================================================
