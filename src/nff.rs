//! On-disk frame storage: a directory with one binary file per column plus
//! a *colspec* frame describing it.
//!
//! The colspec has exactly three string columns: the column file name, the
//! three-character storage code (see [`SType::from_code`]), and a per-column
//! meta string. Fixed-width files hold `nrows` packed elements and are
//! mapped zero-copy. String files hold the UTF-8 blob followed by the
//! offset array; the meta string `offoff=<n>` gives the byte position of the
//! offsets (the blob is padded so the offsets stay aligned).

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use thiserror::Error;
use tracing::debug;

use crate::frame::{Buffer, Column, ColumnData, Frame, FrameError, SType};

/// Alignment of the offsets section within a string column file.
const BLOB_ALIGNMENT: usize = 8;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("colspec table should have 3 columns, but {0} were passed")]
    ColspecShape(usize),

    #[error("string columns are expected in the colspec table, instead got {0}, {1}, and {2}")]
    ColspecTypes(SType, SType, SType),

    #[error("colspec cell at row {row}, column {col} is missing")]
    ColspecMissing { row: usize, col: usize },

    #[error("unrecognized stype: {0:?}")]
    BadStype(String),

    #[error("bad meta string {meta:?} for string column file {file:?}")]
    BadMeta { file: String, meta: String },

    #[error("cannot open column file {path:?}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Loading
// ============================================================================

/// Load a frame of `nrows` rows from `dir` as described by `colspec`.
/// Column files are memory-mapped; nothing is copied until a column is
/// mutated. Column names are the file names from the colspec.
pub fn load(dir: &Path, colspec: &Frame, nrows: usize) -> Result<Frame, LoadError> {
    if colspec.ncols() != 3 {
        return Err(LoadError::ColspecShape(colspec.ncols()));
    }
    let stypes: Vec<SType> = colspec.columns().iter().map(Column::stype).collect();
    if stypes.iter().any(|s| s.is_numeric()) {
        return Err(LoadError::ColspecTypes(stypes[0], stypes[1], stypes[2]));
    }

    let cell = |row: usize, col: usize| -> Result<&str, LoadError> {
        colspec
            .column(col)
            .str_at(row)
            .ok_or(LoadError::ColspecMissing { row, col })
    };

    let mut columns = Vec::with_capacity(colspec.nrows());
    let mut names = Vec::with_capacity(colspec.nrows());
    for i in 0..colspec.nrows() {
        let filename = cell(i, 0)?;
        let code = cell(i, 1)?;
        let meta = cell(i, 2)?;
        let stype =
            SType::from_code(code).ok_or_else(|| LoadError::BadStype(code.to_string()))?;

        let path = dir.join(filename);
        let column = if nrows == 0 {
            Column::new_data(stype, 0)
        } else {
            let file = File::open(&path).map_err(|source| LoadError::Open {
                path: path.display().to_string(),
                source,
            })?;
            // SAFETY: the mapping is read-only; concurrent external mutation
            // of the file is outside this crate's control, as with any mmap.
            let mmap = Arc::new(unsafe { Mmap::map(&file)? });
            open_column(stype, nrows, mmap, filename, meta)?
        };
        debug!(file = filename, stype = %stype, "mapped column");
        columns.push(column);
        names.push(filename.to_string());
    }

    Ok(Frame::new(columns, names)?)
}

fn open_column(
    stype: SType,
    nrows: usize,
    mmap: Arc<Mmap>,
    file: &str,
    meta: &str,
) -> Result<Column, LoadError> {
    let data = match stype {
        SType::Bool8 => ColumnData::Bool8(Buffer::from_mmap(mmap, 0, nrows)?),
        SType::Int8 => ColumnData::Int8(Buffer::from_mmap(mmap, 0, nrows)?),
        SType::Int16 => ColumnData::Int16(Buffer::from_mmap(mmap, 0, nrows)?),
        SType::Int32 => ColumnData::Int32(Buffer::from_mmap(mmap, 0, nrows)?),
        SType::Int64 => ColumnData::Int64(Buffer::from_mmap(mmap, 0, nrows)?),
        SType::Float32 => ColumnData::Float32(Buffer::from_mmap(mmap, 0, nrows)?),
        SType::Float64 => ColumnData::Float64(Buffer::from_mmap(mmap, 0, nrows)?),
        SType::Str32 | SType::Str64 => {
            let offoff = parse_offoff(meta).ok_or_else(|| LoadError::BadMeta {
                file: file.to_string(),
                meta: meta.to_string(),
            })?;
            let blob = Buffer::from_mmap(Arc::clone(&mmap), 0, offoff)?;
            if stype == SType::Str32 {
                ColumnData::Str32 {
                    blob,
                    offsets: Buffer::from_mmap(mmap, offoff, nrows + 1)?,
                }
            } else {
                ColumnData::Str64 {
                    blob,
                    offsets: Buffer::from_mmap(mmap, offoff, nrows + 1)?,
                }
            }
        }
    };
    Ok(Column::from_data(data))
}

fn parse_offoff(meta: &str) -> Option<usize> {
    meta.strip_prefix("offoff=")?.parse().ok()
}

// ============================================================================
// Saving
// ============================================================================

/// Write every column of `frame` into `dir` (one file per column, named
/// `c000`, `c001`, …) and return the matching colspec frame. Row-index
/// views are materialized while writing, so the files always hold plain
/// row-ordered data.
pub fn save(frame: &Frame, dir: &Path) -> Result<Frame, LoadError> {
    std::fs::create_dir_all(dir)?;
    let mut filenames = Vec::with_capacity(frame.ncols());
    let mut codes = Vec::with_capacity(frame.ncols());
    let mut metas = Vec::with_capacity(frame.ncols());

    for (i, column) in frame.columns().iter().enumerate() {
        let filename = format!("c{i:03}");
        let mut w = BufWriter::new(File::create(dir.join(&filename))?);
        let meta = write_column(&mut w, column, frame.nrows())?;
        w.flush()?;
        debug!(file = %filename, stype = %column.stype(), "wrote column");
        filenames.push(filename);
        codes.push(column.stype().code().to_string());
        metas.push(meta);
    }

    Ok(Frame::new(
        vec![
            Column::str32(filenames.iter().map(|s| Some(s.as_str()))),
            Column::str32(codes.iter().map(|s| Some(s.as_str()))),
            Column::str32(metas.iter().map(|s| Some(s.as_str()))),
        ],
        vec![
            "filename".to_string(),
            "stype".to_string(),
            "meta".to_string(),
        ],
    )?)
}

/// Reinterpret a packed element slice as raw bytes and write it out.
fn write_slice<T: Copy>(w: &mut impl Write, s: &[T]) -> std::io::Result<()> {
    // SAFETY: the element types written here (i8..i64, f32/f64) have no
    // padding and a well-defined in-memory layout.
    let bytes = unsafe {
        std::slice::from_raw_parts(s.as_ptr() as *const u8, std::mem::size_of_val(s))
    };
    w.write_all(bytes)
}

/// Write one column, materializing any row-index view, and return its meta
/// string.
fn write_column(w: &mut impl Write, column: &Column, nrows: usize) -> Result<String, LoadError> {
    macro_rules! fixed {
        ($buf:expr) => {{
            let materialized: Vec<_> = (0..nrows)
                .map(|r| $buf[column.physical_row(r)])
                .collect();
            write_slice(w, &materialized)?;
            String::new()
        }};
    }

    let meta = match column.data() {
        ColumnData::Bool8(b) | ColumnData::Int8(b) => fixed!(b),
        ColumnData::Int16(b) => fixed!(b),
        ColumnData::Int32(b) => fixed!(b),
        ColumnData::Int64(b) => fixed!(b),
        ColumnData::Float32(b) => fixed!(b),
        ColumnData::Float64(b) => fixed!(b),
        ColumnData::Str32 { .. } | ColumnData::Str64 { .. } => {
            let mut blob = Vec::new();
            let mut offsets: Vec<i64> = Vec::with_capacity(nrows + 1);
            offsets.push(1);
            for r in 0..nrows {
                match column.str_at(r) {
                    Some(s) => {
                        blob.extend_from_slice(s.as_bytes());
                        offsets.push(blob.len() as i64 + 1);
                    }
                    None => offsets.push(-(blob.len() as i64 + 1)),
                }
            }
            let offoff = blob.len().div_ceil(BLOB_ALIGNMENT) * BLOB_ALIGNMENT;
            blob.resize(offoff, 0);
            write_slice(w, &blob)?;
            if column.stype() == SType::Str32 {
                let narrow: Vec<i32> = offsets.iter().map(|&o| o as i32).collect();
                write_slice(w, &narrow)?;
            } else {
                write_slice(w, &offsets)?;
            }
            format!("offoff={offoff}")
        }
    };
    Ok(meta)
}

// ============================================================================
// Tests
// ============================================================================
