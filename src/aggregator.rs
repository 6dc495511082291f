//! Approximate aggregation of a columnar frame into a small set of
//! representative *exemplars* plus a per-row membership mapping.
//!
//! The strategy is picked by the number of usable key columns: 0 keys sorts
//! the input (every row its own exemplar), 1 and 2 keys bin continuous
//! values and/or group categorical ones, and 3+ keys run the approximate
//! N-dimensional clustering loop with an adaptive squared radius. When the
//! number of observed groups still exceeds the configured cap, a uniform
//! random sub-sample of groups is kept and the rest are marked missing.

use std::marker::PhantomData;

use num_traits::Float;
use parking_lot::RwLock;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::frame::{Column, Frame, FrameError, Na, RowIndex, SortSpec};
use crate::parallel::{self, ErrorCapture, SharedSlice};
use crate::progress::{NoProgress, ProgressSink, Status, PROGRESS_STEPS};
use crate::view::{cast, NumericView};

/// Name of the single column of the members frame.
pub const EXEMPLAR_ID: &str = "exemplar_id";
/// Name of the count column appended to the exemplars frame.
pub const MEMBERS_COUNT: &str = "members_count";

// ============================================================================
// Configuration and Errors
// ============================================================================

/// Tuning parameters for the aggregation.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Inputs with fewer rows than this are not aggregated, only sorted.
    pub min_rows: usize,
    /// Bin count for a single continuous key.
    pub n_bins: usize,
    /// Horizontal bin count for two continuous keys.
    pub nx_bins: usize,
    /// Vertical bin count for two continuous keys.
    pub ny_bins: usize,
    /// Cap on the number of exemplars for the 0-key and N-dimensional paths.
    pub nd_max_bins: usize,
    /// Dimensionality above which rows are projected onto a random subspace.
    pub max_dimensions: usize,
    /// Random seed; 0 draws one from OS entropy up front.
    pub seed: u32,
    /// Worker threads; 0 uses the machine's available parallelism.
    pub nthreads: u32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig {
            min_rows: 500,
            n_bins: 500,
            nx_bins: 50,
            ny_bins: 50,
            nd_max_bins: 500,
            max_dimensions: 50,
            seed: 0,
            nthreads: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("aggregation interrupted by the progress callback")]
    Interrupted,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

// ============================================================================
// Public Surface
// ============================================================================

/// Result of an aggregation: a row subset of the input with an appended
/// `members_count` column, and one `exemplar_id` column aligned to the
/// input row order. Rows dropped by sub-sampling keep a missing id.
#[derive(Debug)]
pub struct Aggregated {
    pub exemplars: Frame,
    pub members: Frame,
}

/// The aggregation capability, object-safe so the f32/f64 instantiation can
/// be chosen at the boundary.
pub trait Aggregate {
    fn aggregate(
        &self,
        frame: &Frame,
        progress: &dyn ProgressSink,
    ) -> Result<Aggregated, AggregateError>;
}

/// Aggregator parameterized by the float type used for all distance work.
/// Both instantiations converge to roughly the same exemplar set; `f32`
/// halves the memory traffic of the clustering loop.
pub struct Aggregator<T> {
    config: AggregatorConfig,
    _marker: PhantomData<T>,
}

impl<T> Aggregator<T> {
    pub fn new(config: AggregatorConfig) -> Self {
        Aggregator {
            config,
            _marker: PhantomData,
        }
    }
}

impl<T: Float + Send + Sync> Aggregate for Aggregator<T> {
    fn aggregate(
        &self,
        frame: &Frame,
        progress: &dyn ProgressSink,
    ) -> Result<Aggregated, AggregateError> {
        let seed = if self.config.seed != 0 {
            self.config.seed
        } else {
            rand::rng().random()
        };
        let job = Job::<T> {
            frame,
            cfg: &self.config,
            progress,
            seed,
            views: Vec::new(),
            cat: None,
            members: vec![i32::na(); frame.nrows()],
        };
        job.run()
    }
}

/// Convenience shorthand with default configuration and no progress sink.
pub fn aggregate(frame: &Frame, config: AggregatorConfig) -> Result<Aggregated, AggregateError> {
    Aggregator::<f64>::new(config).aggregate(frame, &NoProgress)
}

// ============================================================================
// Job State
// ============================================================================

struct Job<'a, T> {
    frame: &'a Frame,
    cfg: &'a AggregatorConfig,
    progress: &'a dyn ProgressSink,
    seed: u32,
    views: Vec<NumericView<'a, T>>,
    cat: Option<Frame>,
    members: Vec<i32>,
}

struct Exemplar<T> {
    id: usize,
    coords: Vec<T>,
}

/// Shared state of the N-dimensional clustering loop, guarded by one
/// reader/writer lock. `ecounter` advances on every structural mutation;
/// a prober whose snapshot went stale starts over.
struct NdState<T> {
    exemplars: Vec<Exemplar<T>>,
    /// Union-find parent pointers: `ids[e.id] == e.id` exactly for roots.
    ids: Vec<usize>,
    coprimes: Vec<usize>,
    /// Squared radius for cluster membership; only ever grows.
    delta: T,
    ecounter: u64,
}

impl<'a, T: Float + Send + Sync> Job<'a, T> {
    fn run(mut self) -> Result<Aggregated, AggregateError> {
        self.check_progress(0.0)?;
        let nrows = self.frame.nrows();
        let mut was_sampled = false;

        if nrows >= self.cfg.min_rows {
            self.partition_columns()?;
            let ncols = self.views.len() + self.cat.as_ref().map_or(0, Frame::ncols);
            let (max_bins, n_na_bins) = match ncols {
                0 => {
                    self.group_0d()?;
                    (self.cfg.nd_max_bins, 0)
                }
                1 => {
                    self.group_1d()?;
                    (self.cfg.n_bins, 1)
                }
                2 => {
                    self.group_2d()?;
                    (self.cfg.nx_bins * self.cfg.ny_bins, 3)
                }
                _ => {
                    self.group_nd()?;
                    (self.cfg.nd_max_bins, 0)
                }
            };
            was_sampled = self.sample_exemplars(max_bins, n_na_bins);
        } else {
            self.group_0d()?;
        }

        let progress = self.progress;
        let out = self.build_output(was_sampled)?;
        progress.report(1.0, Status::Done);
        Ok(out)
    }

    fn check_progress(&self, fraction: f32) -> Result<(), AggregateError> {
        if self.progress.report(fraction, Status::Running) {
            Ok(())
        } else {
            self.progress.report(fraction, Status::Interrupted);
            Err(AggregateError::Interrupted)
        }
    }

    /// Split the input into continuous views and the categorical side-frame.
    /// Non-numeric columns only participate while the input is narrow; once
    /// it has three or more columns they are dropped from the keys.
    fn partition_columns(&mut self) -> Result<(), AggregateError> {
        let mut cat_cols = Vec::new();
        let mut cat_names = Vec::new();
        let mut dropped = 0usize;
        for (i, col) in self.frame.columns().iter().enumerate() {
            if col.stype().is_numeric() {
                self.views.push(NumericView::new(col)?);
            } else if self.frame.ncols() < 3 {
                cat_cols.push(col.clone());
                cat_names.push(self.frame.names()[i].clone());
            } else {
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(
                dropped,
                "ignoring non-numeric columns of a wide input; only numeric \
                 columns participate in the grouping keys"
            );
        }
        if !cat_cols.is_empty() {
            self.cat = Some(Frame::new(cat_cols, cat_names)?);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // 0 keys
    // ------------------------------------------------------------------

    /// No grouping: every row becomes its own exemplar, ranked by a sort on
    /// the first column (missing first).
    fn group_0d(&mut self) -> Result<(), AggregateError> {
        if self.frame.ncols() == 0 {
            return Ok(());
        }
        let mut spec = SortSpec::new(0);
        spec.remove_groups = true;
        let (ri, _) = self.frame.group(&[spec])?;
        for (rank, &row) in ri.as_slice().iter().enumerate() {
            self.members[row as usize] = rank as i32;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // 1 key
    // ------------------------------------------------------------------

    fn group_1d(&mut self) -> Result<(), AggregateError> {
        if self.views.is_empty() {
            self.group_1d_categorical()
        } else {
            self.group_1d_continuous();
            Ok(())
        }
    }

    fn group_1d_continuous(&mut self) {
        let view = &self.views[0];
        let (f, s) = norm_coeffs(view.min(), view.max(), self.cfg.n_bins);
        self.members
            .par_iter_mut()
            .enumerate()
            .for_each(|(row, m)| {
                let value = view.read(row);
                *m = if value.is_nan() {
                    i32::na()
                } else {
                    bin_of(f * value + s)
                };
            });
    }

    /// Plain group-by: the member id is the group index (a missing-key group,
    /// if any, sorts first and is kept as a group of its own).
    fn group_1d_categorical(&mut self) -> Result<(), AggregateError> {
        let cat = self.cat.as_ref().expect("categorical key present");
        let (ri, gb) = cat.group(&[SortSpec::new(0)])?;
        for g in 0..gb.ngroups() {
            for j in gb.group(g) {
                self.members[ri.get(j)] = g as i32;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // 2 keys
    // ------------------------------------------------------------------

    /// Rows with missing keys land in the negative bins −1, −2, −3 by which
    /// key combination is missing, disjoint from the non-missing bins; after
    /// exemplar building they are renumbered from 0 like everything else.
    fn group_2d(&mut self) -> Result<(), AggregateError> {
        match self.views.len() {
            0 => self.group_2d_categorical(),
            1 => self.group_2d_mixed(),
            2 => {
                self.group_2d_continuous();
                Ok(())
            }
            // Two key columns total, so at most two continuous ones.
            _ => unreachable!(),
        }
    }

    fn group_2d_continuous(&mut self) {
        let vx = &self.views[0];
        let vy = &self.views[1];
        let (fx, sx) = norm_coeffs(vx.min(), vx.max(), self.cfg.nx_bins);
        let (fy, sy) = norm_coeffs(vy.min(), vy.max(), self.cfg.ny_bins);
        let nx = self.cfg.nx_bins as i32;
        self.members
            .par_iter_mut()
            .enumerate()
            .for_each(|(row, m)| {
                let v0 = vx.read(row);
                let v1 = vy.read(row);
                let na = v0.is_nan() as i32 + 2 * v1.is_nan() as i32;
                *m = if na != 0 {
                    -na
                } else {
                    bin_of(fy * v1 + sy) * nx + bin_of(fx * v0 + sx)
                };
            });
    }

    fn group_2d_categorical(&mut self) -> Result<(), AggregateError> {
        let cat = self.cat.as_ref().expect("categorical keys present");
        let (ri, gb) = cat.group(&[SortSpec::new(0), SortSpec::new(1)])?;
        let c0 = cat.column(0);
        let c1 = cat.column(1);
        for g in 0..gb.ngroups() {
            for j in gb.group(g) {
                let row = ri.get(j);
                let na = c0.is_na(row) as i32 + 2 * c1.is_na(row) as i32;
                self.members[row] = if na != 0 { -na } else { g as i32 };
            }
        }
        Ok(())
    }

    /// One continuous and one categorical key: bin within each category.
    fn group_2d_mixed(&mut self) -> Result<(), AggregateError> {
        let cat = self.cat.as_ref().expect("categorical key present");
        let view = &self.views[0];
        let (fx, sx) = norm_coeffs(view.min(), view.max(), self.cfg.nx_bins);
        let (ri, gb) = cat.group(&[SortSpec::new(0)])?;
        let ckey = cat.column(0);
        for g in 0..gb.ngroups() {
            let base = (g * self.cfg.nx_bins) as i32;
            for j in gb.group(g) {
                let row = ri.get(j);
                let value = view.read(row);
                let na = value.is_nan() as i32 + 2 * ckey.is_na(row) as i32;
                self.members[row] = if na != 0 {
                    -na
                } else {
                    base + bin_of(fx * value + sx)
                };
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // 3+ keys: approximate ND clustering
    // ------------------------------------------------------------------

    /// The squared radius `delta` starts at machine epsilon so the first
    /// rows seed distinct exemplars. Whenever the live set outgrows
    /// `nd_max_bins`, the mean pairwise exemplar distance determines a merge
    /// radius, close pairs are folded together through the union-find `ids`,
    /// and `delta` grows to cover the merged bubbles.
    fn group_nd(&mut self) -> Result<(), AggregateError> {
        let ncols = self.views.len();
        let nrows = self.frame.nrows();
        let ndims = self.cfg.max_dimensions.min(ncols);
        let do_projection = ncols > self.cfg.max_dimensions;
        let pmatrix = do_projection.then(|| self.projection_matrix(ncols));
        let nth = parallel::num_threads(self.cfg.nthreads).min(nrows.max(1));
        debug!(nrows, ncols, ndims, nth, do_projection, "clustering rows");

        let shared = RwLock::new(NdState::<T> {
            exemplars: Vec::new(),
            ids: Vec::new(),
            coprimes: Vec::new(),
            delta: T::epsilon(),
            ecounter: 0,
        });
        let capture: ErrorCapture<AggregateError> = ErrorCapture::new();

        {
            let members = SharedSlice::new(&mut self.members);
            let views = &self.views;
            let cfg = self.cfg;
            let progress = self.progress;
            let seed = self.seed;
            let pmatrix = pmatrix.as_deref();

            parallel::run_workers(nth, &capture, |worker, nworkers| {
                let mut rng = SmallRng::seed_from_u64(seed as u64 + worker as u64);
                let rstep = (nrows / (nworkers * PROGRESS_STEPS)).max(1);
                let mut member = vec![T::nan(); ndims];

                let mut row = worker;
                while row < nrows {
                    if capture.stop_requested() {
                        return Ok(());
                    }
                    match pmatrix {
                        Some(p) => project_row(views, &mut member, row, p, cfg.max_dimensions),
                        None => normalize_row(views, &mut member, row),
                    }

                    loop {
                        // Probe the live set under the shared lock, walking a
                        // quasi-random modular path so concurrent probers
                        // spread across the clusters instead of piling onto
                        // the oldest exemplars.
                        let (snapshot, assigned) = {
                            let state = shared.read();
                            let n = state.exemplars.len();
                            let mut assigned = None;
                            if n > 0 {
                                let x = rng.random_range(0..n);
                                let c = rng.random_range(0..state.coprimes.len());
                                let stride = state.coprimes[c];
                                for k in 0..n {
                                    let j = (k * stride + x) % n;
                                    let d = distance(
                                        &member,
                                        &state.exemplars[j].coords,
                                        state.delta,
                                        true,
                                    );
                                    if d < state.delta {
                                        assigned = Some(state.exemplars[j].id);
                                        break;
                                    }
                                }
                            }
                            (state.ecounter, assigned)
                        };

                        if let Some(id) = assigned {
                            // SAFETY: each row is written only by the worker
                            // that owns its stride.
                            unsafe { members.set(row, id as i32) };
                            break;
                        }

                        let mut state = shared.write();
                        if state.ecounter != snapshot {
                            // Lost the race against another append or merge:
                            // the new exemplar might already cover this row.
                            drop(state);
                            continue;
                        }
                        state.ecounter += 1;
                        let id = state.ids.len();
                        state.ids.push(id);
                        state.exemplars.push(Exemplar {
                            id,
                            coords: member.clone(),
                        });
                        // SAFETY: as above, one writer per row.
                        unsafe { members.set(row, id as i32) };
                        trace!(row, id, live = state.exemplars.len(), "appended exemplar");
                        if state.exemplars.len() > cfg.nd_max_bins {
                            state.adjust_delta();
                        }
                        state.coprimes = coprimes(state.exemplars.len());
                        break;
                    }

                    if worker == 0 && (row / nworkers) % rstep == 0 {
                        let fraction = (row + 1) as f32 / nrows as f32;
                        if !progress.report(fraction, Status::Running) {
                            progress.report(fraction, Status::Interrupted);
                            return Err(AggregateError::Interrupted);
                        }
                    }
                    row += nworkers;
                }
                Ok(())
            });
        }

        if let Some(err) = capture.take_error() {
            return Err(err);
        }
        let state = shared.into_inner();
        debug!(
            exemplars = state.exemplars.len(),
            appended = state.ids.len(),
            "clustering finished"
        );
        self.adjust_members(&state.ids);
        Ok(())
    }

    /// Seeded random projection onto `max_dimensions` directions, one
    /// standard-normal coefficient per (input dim, output dim) pair.
    fn projection_matrix(&self, ncols: usize) -> Vec<T> {
        let mut rng = SmallRng::seed_from_u64(self.seed as u64);
        (0..ncols * self.cfg.max_dimensions)
            .map(|_| {
                let x: f64 = rng.sample(StandardNormal);
                cast(x)
            })
            .collect()
    }

    /// Replace each member id with its union-find root.
    fn adjust_members(&mut self, ids: &[usize]) {
        if ids.is_empty() {
            return;
        }
        let map: Vec<i32> = (0..ids.len())
            .into_par_iter()
            .map(|i| find_root(ids, i) as i32)
            .collect();
        self.members.par_iter_mut().for_each(|m| {
            *m = map[*m as usize];
        });
    }

    // ------------------------------------------------------------------
    // Sub-sampling and output
    // ------------------------------------------------------------------

    /// When grouping produced more groups than the strategy's cap (plus its
    /// possible missing-key bins), keep a uniform random selection of
    /// `max_bins` groups and mark every other row missing.
    fn sample_exemplars(&mut self, max_bins: usize, n_na_bins: usize) -> bool {
        let (ri, offsets) = group_members(&self.members);
        let ngroups = offsets.len() - 1;
        if ngroups <= max_bins + n_na_bins {
            return false;
        }
        debug!(ngroups, max_bins, "sampling groups");

        for m in &mut self.members {
            *m = i32::na();
        }
        let mut lcg = Lcg::new(self.seed);
        let mut k = 0usize;
        while k < max_bins {
            let g = lcg.next() as usize % ngroups;
            let range = offsets[g] as usize..offsets[g + 1] as usize;
            let first = ri[range.start] as usize;
            if self.members[first].is_na() {
                for j in range {
                    self.members[ri[j] as usize] = k as i32;
                }
                k += 1;
            }
        }
        true
    }

    /// Sort the members, pick the first row of every group as its exemplar,
    /// and renumber group ids densely. A leading missing-id group (rows
    /// dropped by sub-sampling, or rows whose single bin key was missing)
    /// contributes no exemplar and its rows keep a missing id.
    fn build_output(mut self, _was_sampled: bool) -> Result<Aggregated, AggregateError> {
        let (ri, offsets) = group_members(&self.members);
        let ngroups = offsets.len() - 1;
        let has_na_group =
            ngroups > 0 && self.members[ri[offsets[0] as usize] as usize].is_na();
        let skip = has_na_group as usize;
        let n_exemplars = ngroups - skip;

        let mut exemplar_rows = Vec::with_capacity(n_exemplars);
        let mut counts = Vec::with_capacity(n_exemplars);
        for g in skip..ngroups {
            let new_id = (g - skip) as i32;
            let range = offsets[g] as usize..offsets[g + 1] as usize;
            exemplar_rows.push(ri[range.start]);
            counts.push(range.len() as i32);
            for j in range {
                self.members[ri[j] as usize] = new_id;
            }
        }

        let mut exemplars = self.frame.clone();
        exemplars.apply_rowindex(&RowIndex::new(exemplar_rows));
        let counts = Frame::new(vec![Column::int32(counts)], vec![MEMBERS_COUNT.to_string()])?;
        exemplars.cbind(vec![counts])?;
        let members = Frame::new(
            vec![Column::int32(self.members)],
            vec![EXEMPLAR_ID.to_string()],
        )?;
        Ok(Aggregated { exemplars, members })
    }
}

// ============================================================================
// ND Helpers
// ============================================================================

impl<T: Float> NdState<T> {
    /// Merge exemplars closer than half the mean pairwise distance and grow
    /// `delta` to cover the radius of the merged bubbles.
    fn adjust_delta(&mut self) {
        let n = self.exemplars.len();
        if n < 2 {
            return;
        }
        let npairs = n * (n - 1) / 2;
        let mut dists = Vec::with_capacity(npairs);
        let mut total = T::zero();
        for i in 0..n - 1 {
            for j in i + 1..n {
                let d = distance(
                    &self.exemplars[i].coords,
                    &self.exemplars[j].coords,
                    self.delta,
                    false,
                );
                total = total + d.sqrt();
                dists.push(d);
            }
        }
        let delta_merge = (cast::<T>(0.5) * total / cast(npairs as f64)).powi(2);
        self.delta =
            self.delta + delta_merge + cast::<T>(2.0) * (self.delta * delta_merge).sqrt();

        let mut alive = vec![true; n];
        let mut k = 0;
        for i in 0..n - 1 {
            for j in i + 1..n {
                if dists[k] < delta_merge && alive[i] && alive[j] {
                    self.ids[self.exemplars[j].id] = self.exemplars[i].id;
                    alive[j] = false;
                }
                k += 1;
            }
        }
        let mut idx = 0;
        self.exemplars.retain(|_| {
            let keep = alive[idx];
            idx += 1;
            keep
        });
        trace!(
            merged = n - self.exemplars.len(),
            live = self.exemplars.len(),
            "radius grown and close exemplars merged"
        );
    }
}

/// Squared Euclidean distance over the dimensions where both vectors are
/// present, scaled by `n_effective / n_considered` to stay comparable with
/// fully observed pairs. With `early_exit` the raw running sum is returned
/// as soon as it exceeds `delta`; the `< delta` decision is unaffected,
/// because only the final division by `n_considered` could shrink the value.
/// Under heavy missingness that scaling is a documented approximation.
fn distance<T: Float>(a: &[T], b: &[T], delta: T, early_exit: bool) -> T {
    let mut sum = T::zero();
    let mut considered = 0usize;
    for (&x, &y) in a.iter().zip(b) {
        if x.is_nan() || y.is_nan() {
            continue;
        }
        considered += 1;
        let d = x - y;
        sum = sum + d * d;
        if early_exit && sum > delta {
            return sum;
        }
    }
    if considered == 0 {
        return T::zero();
    }
    sum * cast(a.len() as f64) / cast(considered as f64)
}

/// Normalization of `x` to `[0, c_bins)` as `x * factor + shift`. A constant
/// column has no usable range and maps everything to the middle bin.
fn norm_coeffs<T: Float>(min: T, max: T, c_bins: usize) -> (T, T) {
    let eps = T::epsilon();
    if (max - min).abs() > eps {
        let f = cast::<T>(c_bins as f64) * (T::one() - eps) / (max - min);
        (f, -f * min)
    } else {
        (T::zero(), cast::<T>(0.5) * cast(c_bins as f64))
    }
}

#[inline]
fn bin_of<T: Float>(x: T) -> i32 {
    x.to_i32().expect("bin index fits in i32")
}

/// Map every continuous value of a row into `[0, 1)`; missing cells stay NaN.
fn normalize_row<T: Float>(views: &[NumericView<'_, T>], out: &mut [T], row: usize) {
    for (d, view) in views.iter().enumerate() {
        let (f, s) = norm_coeffs(view.min(), view.max(), 1);
        out[d] = f * view.read(row) + s;
    }
}

/// Project a row onto the random subspace, averaging over the non-missing
/// input dimensions so sparse rows stay on the same scale as dense ones.
fn project_row<T: Float>(
    views: &[NumericView<'_, T>],
    out: &mut [T],
    row: usize,
    pmatrix: &[T],
    max_dims: usize,
) {
    for o in out.iter_mut() {
        *o = T::zero();
    }
    let mut present = 0usize;
    for (i, view) in views.iter().enumerate() {
        let value = view.read(row);
        if value.is_nan() {
            continue;
        }
        let (f, s) = norm_coeffs(view.min(), view.max(), 1);
        let normed = f * value + s;
        for (j, o) in out.iter_mut().enumerate() {
            *o = *o + pmatrix[i * max_dims + j] * normed;
        }
        present += 1;
    }
    let scale = cast::<T>(present as f64);
    for o in out.iter_mut() {
        *o = *o / scale;
    }
}

/// Iterative union-find lookup over the flat parent array.
fn find_root(ids: &[usize], mut i: usize) -> usize {
    while ids[i] != i {
        i = ids[i];
    }
    i
}

/// Integers in `[1, n)` coprime with `n`, the strides of the modular probe
/// paths. `n = 1` yields `[1]` so a draw is always possible.
pub fn coprimes(n: usize) -> Vec<usize> {
    if n <= 1 {
        return if n == 1 { vec![1] } else { Vec::new() };
    }
    (1..n).filter(|&c| gcd(c, n) == 1).collect()
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Stable sort of row indices by member id (the missing sentinel is the
/// smallest `i32`, so missing rows lead), plus group offsets.
fn group_members(members: &[i32]) -> (Vec<u32>, Vec<u32>) {
    let mut ri: Vec<u32> = (0..members.len() as u32).collect();
    ri.sort_by_key(|&i| members[i as usize]);
    let mut offsets = vec![0u32];
    for j in 1..ri.len() {
        if members[ri[j] as usize] != members[ri[j - 1] as usize] {
            offsets.push(j as u32);
        }
    }
    if !ri.is_empty() {
        offsets.push(ri.len() as u32);
    }
    (ri, offsets)
}

/// Instance-scoped linear-congruential generator used for group sampling,
/// so a seeded run is reproducible regardless of what the rest of the
/// process does with the global generators.
struct Lcg(u64);

impl Lcg {
    fn new(seed: u32) -> Self {
        Lcg(seed as u64)
    }

    fn next(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ColumnData, Na};
    use crate::progress::FnProgress;
    use rand_distr::Normal;

    fn int32_values(frame: &Frame, col: usize) -> Vec<i32> {
        let column = frame.column(col);
        let ColumnData::Int32(buf) = column.data() else {
            panic!("expected int32 column");
        };
        (0..frame.nrows())
            .map(|r| buf[column.physical_row(r)])
            .collect()
    }

    fn f64_values(frame: &Frame, col: usize) -> Vec<f64> {
        let column = frame.column(col);
        (0..frame.nrows())
            .map(|r| {
                let p = column.physical_row(r);
                match column.data() {
                    ColumnData::Float64(buf) => buf[p],
                    _ => panic!("expected float64 column"),
                }
            })
            .collect()
    }

    fn config(f: impl FnOnce(&mut AggregatorConfig)) -> AggregatorConfig {
        let mut cfg = AggregatorConfig {
            seed: 42,
            nthreads: 1,
            ..AggregatorConfig::default()
        };
        f(&mut cfg);
        cfg
    }

    #[test]
    fn test_0d_small_input_sorts_rows() {
        let frame = Frame::new(
            vec![Column::int32(vec![3, 1, 2, 1])],
            vec!["v".into()],
        )
        .unwrap();
        let out = aggregate(&frame, config(|c| c.min_rows = 100)).unwrap();
        assert_eq!(int32_values(&out.members, 0), vec![3, 0, 2, 1]);
        assert_eq!(int32_values(&out.exemplars, 0), vec![1, 1, 2, 3]);
        assert_eq!(int32_values(&out.exemplars, 1), vec![1, 1, 1, 1]);
        assert_eq!(out.exemplars.names()[1], MEMBERS_COUNT);
    }

    #[test]
    fn test_1d_continuous_binning() {
        let frame = Frame::new(
            vec![Column::float64(vec![0.0, 0.5, 1.0, f64::NAN])],
            vec!["x".into()],
        )
        .unwrap();
        let out = aggregate(
            &frame,
            config(|c| {
                c.min_rows = 1;
                c.n_bins = 2;
            }),
        )
        .unwrap();
        // Two bins plus the missing row, which keeps a missing id.
        assert_eq!(int32_values(&out.members, 0), vec![0, 0, 1, i32::na()]);
        assert_eq!(int32_values(&out.exemplars, 1), vec![2, 1]);
        assert_eq!(f64_values(&out.exemplars, 0), vec![0.0, 1.0]);
    }

    #[test]
    fn test_1d_constant_column_single_bin() {
        let frame = Frame::new(
            vec![Column::float64(vec![7.5; 6])],
            vec!["x".into()],
        )
        .unwrap();
        let out = aggregate(
            &frame,
            config(|c| {
                c.min_rows = 1;
                c.n_bins = 4;
            }),
        )
        .unwrap();
        // Constant columns map everything to the middle bin.
        assert_eq!(int32_values(&out.members, 0), vec![0; 6]);
        assert_eq!(int32_values(&out.exemplars, 1), vec![6]);
    }

    #[test]
    fn test_2d_continuous_missing_bins() {
        let frame = Frame::new(
            vec![
                Column::float64(vec![1.0, f64::NAN, 1.0, f64::NAN]),
                Column::float64(vec![2.0, 2.0, f64::NAN, f64::NAN]),
            ],
            vec!["x".into(), "y".into()],
        )
        .unwrap();
        let out = aggregate(
            &frame,
            config(|c| {
                c.min_rows = 1;
                c.nx_bins = 1;
                c.ny_bins = 1;
            }),
        )
        .unwrap();
        // Four distinct groups: (v,v), (na,v), (v,na), (na,na).
        assert_eq!(int32_values(&out.exemplars, 2), vec![1, 1, 1, 1]);
        let members = int32_values(&out.members, 0);
        let mut sorted = members.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_2d_all_missing_column_single_na_bin() {
        let frame = Frame::new(
            vec![
                Column::float64(vec![1.0, 2.0, 3.0]),
                Column::float64(vec![f64::NAN; 3]),
            ],
            vec!["x".into(), "y".into()],
        )
        .unwrap();
        let out = aggregate(&frame, config(|c| c.min_rows = 1)).unwrap();
        // Every row is (value, missing): one bin, originally −2.
        assert_eq!(int32_values(&out.members, 0), vec![0, 0, 0]);
        assert_eq!(int32_values(&out.exemplars, 2), vec![3]);
    }

    #[test]
    fn test_1d_categorical_groups() {
        let frame = Frame::new(
            vec![Column::str32([
                Some("b"),
                Some("a"),
                Some("b"),
                None,
                Some("a"),
            ])],
            vec!["k".into()],
        )
        .unwrap();
        let out = aggregate(&frame, config(|c| c.min_rows = 1)).unwrap();
        // Groups sort missing-first: [NA], [a, a], [b, b].
        assert_eq!(int32_values(&out.members, 0), vec![2, 1, 2, 0, 1]);
        assert_eq!(int32_values(&out.exemplars, 1), vec![1, 2, 2]);
    }

    #[test]
    fn test_2d_categorical_groups_and_na_cases() {
        let frame = Frame::new(
            vec![
                Column::str32([Some("x"), Some("x"), None, Some("y")]),
                Column::str32([Some("p"), Some("p"), Some("q"), None]),
            ],
            vec!["a".into(), "b".into()],
        )
        .unwrap();
        let out = aggregate(&frame, config(|c| c.min_rows = 1)).unwrap();
        let members = int32_values(&out.members, 0);
        // (x,p) twice; (NA,q) and (y,NA) in their own bins.
        assert_eq!(members[0], members[1]);
        assert_ne!(members[2], members[3]);
        assert_ne!(members[2], members[0]);
        let counts = int32_values(&out.exemplars, 2);
        let mut sorted = counts.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![1, 1, 2]);
        assert_eq!(counts.iter().sum::<i32>(), 4);
    }

    #[test]
    fn test_2d_mixed_bins_within_category() {
        let frame = Frame::new(
            vec![
                Column::float64(vec![0.0, 9.0, 0.5, 9.0, f64::NAN]),
                Column::str32([Some("u"), Some("u"), Some("v"), Some("v"), Some("u")]),
            ],
            vec!["x".into(), "k".into()],
        )
        .unwrap();
        let out = aggregate(
            &frame,
            config(|c| {
                c.min_rows = 1;
                c.nx_bins = 2;
            }),
        )
        .unwrap();
        let members = int32_values(&out.members, 0);
        // Same category, opposite halves of the range: different bins.
        assert_ne!(members[0], members[1]);
        // Different categories never share a bin.
        assert_ne!(members[1], members[3]);
        // The missing continuous value gets its own bin.
        let counts = int32_values(&out.exemplars, 2);
        assert_eq!(counts.iter().sum::<i32>(), 5);
        assert_eq!(counts.len(), 5);
    }

    #[test]
    fn test_subsampling_caps_groups() {
        let values: Vec<String> = (0..1000).map(|i| format!("cat{i:04}")).collect();
        let frame = Frame::new(
            vec![Column::str32(values.iter().map(|s| Some(s.as_str())))],
            vec!["k".into()],
        )
        .unwrap();
        let out = aggregate(
            &frame,
            config(|c| {
                c.min_rows = 1;
                c.n_bins = 10;
            }),
        )
        .unwrap();
        assert_eq!(out.exemplars.nrows(), 10);
        let counts = int32_values(&out.exemplars, 1);
        assert!(counts.iter().all(|&c| c >= 1));
        // Ten groups survive; everything else is missing.
        let members = int32_values(&out.members, 0);
        let kept: Vec<i32> = members.iter().copied().filter(|m| !m.is_na()).collect();
        let mut distinct = kept.clone();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_nd_three_gaussians_recovered() {
        let centers = [
            [0.0, 0.0, 0.0, 0.0, 0.0],
            [10.0, 0.0, 0.0, 0.0, 0.0],
            [0.0, 10.0, 0.0, 0.0, 0.0],
        ];
        let mut rng = SmallRng::seed_from_u64(42);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut cols = vec![Vec::with_capacity(1000); 5];
        for i in 0..1000 {
            let c = i % 3;
            for (d, col) in cols.iter_mut().enumerate() {
                col.push(centers[c][d] + rng.sample::<f64, _>(normal));
            }
        }
        let frame = Frame::new(
            cols.into_iter().map(Column::float64).collect(),
            (0..5).map(|d| format!("x{d}")).collect(),
        )
        .unwrap();

        let out = aggregate(
            &frame,
            config(|c| {
                c.min_rows = 1;
                c.nd_max_bins = 10;
                c.max_dimensions = 5;
            }),
        )
        .unwrap();

        let n_exemplars = out.exemplars.nrows();
        assert!(
            (3..=10).contains(&n_exemplars),
            "got {n_exemplars} exemplars"
        );
        let members = int32_values(&out.members, 0);
        let counts = int32_values(&out.exemplars, 5);
        assert_eq!(counts.iter().sum::<i32>(), 1000);
        assert!(members.iter().all(|&m| (0..n_exemplars as i32).contains(&m)));

        // Each dominant cluster's member mean must sit near a true center.
        let data: Vec<Vec<f64>> = (0..5).map(|d| f64_values(&frame, d)).collect();
        let mut dominant = 0;
        for (e, &count) in counts.iter().enumerate() {
            if count < 200 {
                continue;
            }
            dominant += 1;
            let mut mean = [0.0f64; 5];
            for (row, &m) in members.iter().enumerate() {
                if m == e as i32 {
                    for d in 0..5 {
                        mean[d] += data[d][row];
                    }
                }
            }
            for v in &mut mean {
                *v /= count as f64;
            }
            let best = centers
                .iter()
                .map(|c| {
                    c.iter()
                        .zip(&mean)
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum::<f64>()
                        .sqrt()
                })
                .fold(f64::INFINITY, f64::min);
            assert!(best < 2.0, "dominant cluster {e} is {best:.2} from truth");
        }
        assert!(dominant >= 3, "only {dominant} dominant clusters");
    }

    #[test]
    fn test_nd_deterministic_with_fixed_seed() {
        let mut rng = SmallRng::seed_from_u64(7);
        let cols: Vec<Column> = (0..4)
            .map(|_| Column::float64((0..300).map(|_| rng.random_range(0.0..1.0)).collect()))
            .collect();
        let frame = Frame::new(cols, (0..4).map(|d| format!("c{d}")).collect()).unwrap();
        let cfg = config(|c| {
            c.min_rows = 1;
            c.nd_max_bins = 20;
        });
        let a = aggregate(&frame, cfg.clone()).unwrap();
        let b = aggregate(&frame, cfg).unwrap();
        assert_eq!(int32_values(&a.members, 0), int32_values(&b.members, 0));
        assert_eq!(a.exemplars.nrows(), b.exemplars.nrows());
    }

    #[test]
    fn test_nd_with_projection_and_missing_values() {
        let mut rng = SmallRng::seed_from_u64(3);
        let cols: Vec<Column> = (0..8)
            .map(|_| {
                Column::float64(
                    (0..200)
                        .map(|_| {
                            if rng.random_range(0..10) == 0 {
                                f64::NAN
                            } else {
                                rng.random_range(0.0..1.0)
                            }
                        })
                        .collect(),
                )
            })
            .collect();
        let frame = Frame::new(cols, (0..8).map(|d| format!("c{d}")).collect()).unwrap();
        let out = aggregate(
            &frame,
            config(|c| {
                c.min_rows = 1;
                c.nd_max_bins = 15;
                c.max_dimensions = 3;
                c.nthreads = 2;
            }),
        )
        .unwrap();
        let n = out.exemplars.nrows() as i32;
        assert!(n >= 1);
        let members = int32_values(&out.members, 0);
        assert!(members.iter().all(|&m| (0..n).contains(&m)));
        let counts = int32_values(&out.exemplars, 8);
        assert_eq!(counts.iter().sum::<i32>(), 200);
    }

    #[test]
    fn test_wide_input_drops_categorical_keys() {
        let frame = Frame::new(
            vec![
                Column::float64(vec![0.1, 0.2, 0.9]),
                Column::float64(vec![0.4, 0.5, 0.6]),
                Column::float64(vec![0.7, 0.8, 0.2]),
                Column::str32([Some("a"), Some("b"), Some("c")]),
            ],
            vec!["x".into(), "y".into(), "z".into(), "k".into()],
        )
        .unwrap();
        // The string column is ignored, so this takes the 3-key ND path and
        // the exemplars frame still carries all four input columns.
        let out = aggregate(&frame, config(|c| c.min_rows = 1)).unwrap();
        assert_eq!(out.exemplars.ncols(), 5);
        let counts_col = out.exemplars.ncols() - 1;
        let counts = int32_values(&out.exemplars, counts_col);
        assert_eq!(counts.iter().sum::<i32>(), 3);
    }

    #[test]
    fn test_empty_input() {
        let frame = Frame::new(vec![Column::float64(Vec::new())], vec!["x".into()]).unwrap();
        let out = aggregate(&frame, config(|_| {})).unwrap();
        assert_eq!(out.exemplars.nrows(), 0);
        assert_eq!(out.members.nrows(), 0);
    }

    #[test]
    fn test_cancellation_interrupts() {
        let frame = Frame::new(
            vec![Column::float64((0..100).map(f64::from).collect())],
            vec!["x".into()],
        )
        .unwrap();
        let sink = FnProgress(|_f: f32, _s: Status| false);
        let agg = Aggregator::<f64>::new(config(|c| c.min_rows = 1));
        let err = agg.aggregate(&frame, &sink).unwrap_err();
        assert!(matches!(err, AggregateError::Interrupted));
    }

    #[test]
    fn test_distance_properties() {
        let a = [0.25f64, 0.5, 0.75];
        let b = [0.5f64, 0.5, 0.25];
        let big = f64::INFINITY;
        assert_eq!(distance(&a, &a, big, false), 0.0);
        assert_eq!(distance(&a, &b, big, false), distance(&b, &a, big, false));
        // The early-exit value dominates the exact one.
        let exact = distance(&a, &b, 1e-12, false);
        let early = distance(&a, &b, 1e-12, true);
        assert!(exact <= early);

        // Missing dimensions rescale by n_effective / n_considered.
        let c = [0.5f64, f64::NAN, 0.25];
        let d = distance(&a, &c, big, false);
        let expected = (0.0625 + 0.25) * 3.0 / 2.0;
        assert!((d - expected).abs() < 1e-12);
    }

    #[test]
    fn test_norm_coeffs_bounds() {
        let (f, s) = norm_coeffs(2.0f64, 10.0, 1);
        for v in [2.0, 5.0, 9.999, 10.0] {
            let x = f * v + s;
            assert!((0.0..1.0).contains(&x), "{v} mapped to {x}");
        }
        // Round trip within epsilon times the range.
        let v = 7.3;
        let back = (f * v + s - s) / f;
        assert!((back - v).abs() <= f64::EPSILON * 8.0);

        let (f, s) = norm_coeffs(4.0f64, 4.0, 6);
        assert_eq!(f, 0.0);
        assert_eq!(s, 3.0);
    }

    #[test]
    fn test_coprimes_small() {
        assert!(coprimes(0).is_empty());
        assert_eq!(coprimes(1), vec![1]);
        assert_eq!(coprimes(2), vec![1]);
        assert_eq!(coprimes(6), vec![1, 5]);
        assert_eq!(coprimes(7), vec![1, 2, 3, 4, 5, 6]);
        // A modular path with any coprime stride visits every residue.
        for &c in coprimes(12).iter() {
            let mut seen = vec![false; 12];
            for k in 0..12 {
                seen[(k * c + 5) % 12] = true;
            }
            assert!(seen.iter().all(|&s| s));
        }
    }

    #[test]
    fn test_find_root_idempotent() {
        let ids = vec![0, 0, 1, 3, 3, 4];
        for i in 0..ids.len() {
            let r = find_root(&ids, i);
            assert_eq!(find_root(&ids, r), r);
        }
        assert_eq!(find_root(&ids, 2), 0);
        assert_eq!(find_root(&ids, 5), 3);
    }

    #[test]
    fn test_lcg_is_deterministic() {
        let mut a = Lcg::new(9);
        let mut b = Lcg::new(9);
        let xs: Vec<u32> = (0..8).map(|_| a.next()).collect();
        let ys: Vec<u32> = (0..8).map(|_| b.next()).collect();
        assert_eq!(xs, ys);
        assert!(xs.windows(2).any(|w| w[0] != w[1]));
    }
}
