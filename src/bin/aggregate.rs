//! Reduce a CSV-like numeric table to exemplars and a membership mapping.
//!
//! ## Input
//!
//! A text file of newline-terminated rows of comma-separated numbers
//! (empty fields are missing). With `--header` the first line supplies
//! column names.
//!
//! ## Output
//!
//! With `--output <dir>`: `exemplars.csv` (the representative rows plus a
//! `members_count` column) and `members.csv` (one `exemplar_id` per input
//! row, in input order). Without it, a summary is logged.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin aggregate -- --input data.csv --output out --header
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use memchr::memchr;
use memmap2::Mmap;
use tracing::info;

use oxbow::aggregator::{Aggregate, Aggregator, AggregatorConfig};
use oxbow::frame::Frame;
use oxbow::lines::{LineSource, mean_line_length};
use oxbow::progress::{FnProgress, Status};
use oxbow::reader::ParallelReader;

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(about = "Reduce a CSV-like numeric table to exemplars and members")]
struct Args {
    /// Input file: newline-terminated rows of comma-separated numbers.
    #[arg(long)]
    input: PathBuf,

    /// Directory for exemplars.csv and members.csv. Only a summary is
    /// logged when omitted.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Treat the first line as column names.
    #[arg(long)]
    header: bool,

    /// Read at most this many rows.
    #[arg(long)]
    max_rows: Option<usize>,

    /// Inputs with fewer rows are only sorted, not aggregated.
    #[arg(long, default_value_t = 500)]
    min_rows: usize,

    /// Bin count for a single continuous key column.
    #[arg(long, default_value_t = 500)]
    n_bins: usize,

    /// Horizontal bin count for two continuous key columns.
    #[arg(long, default_value_t = 50)]
    nx_bins: usize,

    /// Vertical bin count for two continuous key columns.
    #[arg(long, default_value_t = 50)]
    ny_bins: usize,

    /// Exemplar cap for the N-dimensional clustering path.
    #[arg(long, default_value_t = 500)]
    nd_max_bins: usize,

    /// Project rows onto this many dimensions when there are more keys.
    #[arg(long, default_value_t = 50)]
    max_dimensions: usize,

    /// Random seed; 0 draws one from OS entropy.
    #[arg(long, default_value_t = 0)]
    seed: u32,

    /// Worker threads; 0 uses all cores.
    #[arg(long, default_value_t = 0)]
    nthreads: u32,

    /// Run the distance computations in single precision.
    #[arg(long)]
    float32: bool,
}

// ============================================================================
// Progress Bars
// ============================================================================

const BAR_SCALE: f32 = 1000.0;

fn step_bar(msg: &'static str) -> ProgressBar {
    let pb = ProgressBar::new(BAR_SCALE as u64);
    pb.set_style(
        ProgressStyle::with_template("{msg:>10} [{bar:40}] {percent:>3}%")
            .expect("valid progress template")
            .progress_chars("=> "),
    );
    pb.set_message(msg);
    pb
}

fn progress_sink(pb: ProgressBar) -> FnProgress<impl Fn(f32, Status) -> bool> {
    FnProgress(move |fraction: f32, status: Status| {
        pb.set_position((fraction * BAR_SCALE) as u64);
        if status != Status::Running {
            pb.finish_and_clear();
        }
        true
    })
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let file = File::open(&args.input)?;
    if file.metadata()?.len() == 0 {
        return Err(format!("input file {} is empty", args.input.display()).into());
    }
    // SAFETY: read-only mapping; the file is not expected to change under us.
    let mmap = unsafe { Mmap::map(&file)? };
    let bytes: &[u8] = &mmap;

    // ── Schema from the first line ─────────────────────────────────────
    let first_end = memchr(b'\n', bytes).unwrap_or(bytes.len());
    let first = &bytes[..first_end];
    let nfields = first.split(|&b| b == b',').count();
    let (names, data): (Vec<String>, &[u8]) = if args.header {
        let names = first
            .split(|&b| b == b',')
            .map(|f| String::from_utf8_lossy(f).trim().to_string())
            .collect();
        (names, &bytes[(first_end + 1).min(bytes.len())..])
    } else {
        ((0..nfields).map(|i| format!("C{i}")).collect(), bytes)
    };
    info!(
        columns = nfields,
        bytes = data.len(),
        "reading {}",
        args.input.display()
    );

    // ── Step 1: parse the input in parallel ────────────────────────────
    let source = LineSource::new(data, nfields);
    let reader = ParallelReader::new(
        &source,
        0..data.len(),
        mean_line_length(data),
        args.nthreads,
        args.max_rows.unwrap_or(usize::MAX),
        0,
    );
    let stats = reader.read_all(&progress_sink(step_bar("parse")))?;
    info!(
        rows = stats.nrows_written,
        chunks = stats.chunk_count,
        "parsed input"
    );
    let frame = source.into_frame(names)?;

    // ── Step 2: aggregate ──────────────────────────────────────────────
    let config = AggregatorConfig {
        min_rows: args.min_rows,
        n_bins: args.n_bins,
        nx_bins: args.nx_bins,
        ny_bins: args.ny_bins,
        nd_max_bins: args.nd_max_bins,
        max_dimensions: args.max_dimensions,
        seed: args.seed,
        nthreads: args.nthreads,
    };
    let aggregator: Box<dyn Aggregate> = if args.float32 {
        Box::new(Aggregator::<f32>::new(config))
    } else {
        Box::new(Aggregator::<f64>::new(config))
    };
    let result = aggregator.aggregate(&frame, &progress_sink(step_bar("aggregate")))?;
    info!(
        exemplars = result.exemplars.nrows(),
        rows = frame.nrows(),
        "aggregated"
    );

    // ── Step 3: write or summarize ─────────────────────────────────────
    match &args.output {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            write_csv(&result.exemplars, &dir.join("exemplars.csv"))?;
            write_csv(&result.members, &dir.join("members.csv"))?;
            info!("wrote {}", dir.display());
        }
        None => {
            let shown = result.exemplars.nrows().min(10);
            for r in 0..shown {
                let cells: Vec<String> = (0..result.exemplars.ncols())
                    .map(|c| {
                        result
                            .exemplars
                            .column(c)
                            .format_cell(r)
                            .unwrap_or_default()
                    })
                    .collect();
                info!("exemplar {r}: {}", cells.join(", "));
            }
            if result.exemplars.nrows() > shown {
                info!("... and {} more", result.exemplars.nrows() - shown);
            }
        }
    }

    Ok(())
}

fn write_csv(frame: &Frame, path: &Path) -> std::io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "{}", frame.names().join(","))?;
    for r in 0..frame.nrows() {
        for c in 0..frame.ncols() {
            if c > 0 {
                w.write_all(b",")?;
            }
            if let Some(cell) = frame.column(c).format_cell(r) {
                w.write_all(cell.as_bytes())?;
            }
        }
        w.write_all(b"\n")?;
    }
    w.flush()
}
