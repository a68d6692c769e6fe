//! Pairwise OTD engine.
//!
//! `PairwiseOtd` scores every (source, target) cell with a `DivergenceScorer` and assembles the
//! matrix of record. The contract:
//!
//! - cells are visited row-major (source outer, target inner);
//! - the device decision is made once per `compute()`, before the first cell;
//! - the first failing cell aborts the run, attributed as `Error::Pair { row, col, .. }`,
//!   and no matrix (partial or stale) remains accessible;
//! - degradations (backend unavailable, per-cell host fallback, solver iteration limit) are
//!   collected as `Diagnostic`s rather than raised;
//! - with a checkpoint path, the sequential schedule rewrites the CSV after every completed
//!   source row, and the parallel schedule writes it once all cells are done.

use crate::backend::BackendProbe;
use crate::cloud::{PointCloud, SampleSet};
use crate::config::{EngineOptions, LossConfig};
use crate::device::{Device, DeviceFallbackEvent, DevicePlanner};
use crate::scorer::{DivergenceScorer, Score, SinkhornScorer};
use crate::view::{LabeledTable, OtdMatrix, ResultView};
use crate::{Error, Result};
use ndarray::Array2;
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle of an engine's matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputationState {
    NotStarted,
    InProgress,
    Completed,
    /// The last `compute()` aborted; nothing is exposed until a later run succeeds.
    Failed,
}

/// Non-fatal conditions recorded during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// The accelerated backend was requested but is not usable; the run used the host path.
    BackendUnavailable,
    /// One cell was downgraded from the accelerator to the host path.
    DeviceFallback(DeviceFallbackEvent),
    /// The solver stopped at `max_iter` before reaching `tol`; the cell holds its last iterate.
    NotConverged { row: usize, col: usize },
}

#[derive(Debug)]
struct RunOutput {
    matrix: OtdMatrix,
    timings: Array2<f32>,
    diagnostics: Vec<Diagnostic>,
    planner: DevicePlanner,
}

struct CellOutcome {
    cost: f32,
    seconds: f32,
    converged: bool,
    fallback: Option<DeviceFallbackEvent>,
}

/// Score one pair under `planner`, downgrading to host on any accelerator-side failure.
///
/// Returns the score and, if the cell was downgraded, the reason.
pub(crate) fn score_cell(
    scorer: &dyn DivergenceScorer,
    planner: &DevicePlanner,
    config: &LossConfig,
    source: &PointCloud,
    target: &PointCloud,
    track_gradient: bool,
) -> Result<(Score, Option<String>)> {
    let reason = match planner.place_pair(source, target) {
        Ok(cell) => match scorer.score(&cell.source, &cell.target, config, track_gradient) {
            Err(Error::Device(reason)) if cell.source.device() == Device::Accelerator => reason,
            other => return other.map(|s| (s, None)),
        },
        Err(Error::Device(reason)) => reason,
        Err(e) => return Err(e),
    };
    let cell = planner.place_pair_on_host(source, target)?;
    let score = scorer.score(&cell.source, &cell.target, config, track_gradient)?;
    Ok((score, Some(reason)))
}

/// Pairwise optimal transport distances between a source and a target `SampleSet`.
pub struct PairwiseOtd {
    sources: SampleSet,
    targets: SampleSet,
    config: LossConfig,
    scorer: Arc<dyn DivergenceScorer>,
    probe: BackendProbe,
    options: EngineOptions,
    state: ComputationState,
    last: Option<RunOutput>,
}

impl PairwiseOtd {
    /// New engine with the built-in `wass` Sinkhorn scorer and process-wide backend detection.
    pub fn new(sources: SampleSet, targets: SampleSet, config: LossConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sources,
            targets,
            config,
            scorer: Arc::new(SinkhornScorer),
            probe: BackendProbe::Detect,
            options: EngineOptions::default(),
            state: ComputationState::NotStarted,
            last: None,
        })
    }

    pub fn with_scorer(mut self, scorer: impl DivergenceScorer + 'static) -> Self {
        self.scorer = Arc::new(scorer);
        self
    }

    pub fn with_probe(mut self, probe: BackendProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Fill every cell, row-major. Recomputes (and overwrites) on every call.
    pub fn compute(&mut self) -> Result<&OtdMatrix> {
        self.state = ComputationState::InProgress;
        self.last = None;
        match self.run() {
            Ok(out) => {
                self.state = ComputationState::Completed;
                Ok(&self.last.insert(out).matrix)
            }
            Err(e) => {
                self.state = ComputationState::Failed;
                tracing::error!(error = %e, "pairwise OTD run aborted");
                Err(e)
            }
        }
    }

    fn run(&self) -> Result<RunOutput> {
        let (rows, cols) = (self.sources.len(), self.targets.len());
        let (planner, unavailable) = DevicePlanner::plan(
            &self.config,
            self.probe.available(),
            self.options.accelerator_capacity,
        );
        let mut diagnostics = Vec::new();
        if let Some(d) = unavailable {
            tracing::warn!("accelerated backend requested but unavailable; using host path");
            diagnostics.push(d);
        }
        tracing::info!(
            rows,
            cols,
            device = %planner.device(),
            scorer = self.scorer.name(),
            kind = self.config.kind.name(),
            "computing pairwise OTD"
        );

        let outcomes = self.run_cells(&planner, rows, cols)?;

        let mut values = Array2::<f32>::zeros((rows, cols));
        let mut timings = Array2::<f32>::zeros((rows, cols));
        for (idx, out) in outcomes.into_iter().enumerate() {
            let (i, j) = (idx / cols, idx % cols);
            values[[i, j]] = out.cost;
            timings[[i, j]] = out.seconds;
            if let Some(ev) = out.fallback {
                diagnostics.push(Diagnostic::DeviceFallback(ev));
            }
            if !out.converged {
                diagnostics.push(Diagnostic::NotConverged { row: i, col: j });
            }
        }

        let matrix = OtdMatrix::new(
            values,
            self.sources.labels().to_vec(),
            self.targets.labels().to_vec(),
        );
        tracing::info!(
            total_seconds = timings.sum(),
            diagnostics = diagnostics.len(),
            "pairwise OTD completed"
        );
        Ok(RunOutput {
            matrix,
            timings,
            diagnostics,
            planner,
        })
    }

    #[cfg(feature = "parallel")]
    fn run_cells(&self, planner: &DevicePlanner, rows: usize, cols: usize) -> Result<Vec<CellOutcome>> {
        if !self.options.parallel {
            return self.run_cells_sequential(planner, rows, cols);
        }
        use rayon::prelude::*;
        // Collecting into `Result` stops scheduling new cells after the first error.
        let outcomes: Vec<CellOutcome> = (0..rows * cols)
            .into_par_iter()
            .map(|idx| self.cell(planner, idx / cols, idx % cols))
            .collect::<Result<_>>()?;
        if let Some(path) = &self.options.checkpoint {
            self.write_checkpoint(path, &outcomes, rows, cols)?;
        }
        Ok(outcomes)
    }

    #[cfg(not(feature = "parallel"))]
    fn run_cells(&self, planner: &DevicePlanner, rows: usize, cols: usize) -> Result<Vec<CellOutcome>> {
        if self.options.parallel {
            tracing::debug!("parallel schedule requested without the `parallel` feature");
        }
        self.run_cells_sequential(planner, rows, cols)
    }

    fn run_cells_sequential(
        &self,
        planner: &DevicePlanner,
        rows: usize,
        cols: usize,
    ) -> Result<Vec<CellOutcome>> {
        let mut outcomes = Vec::with_capacity(rows * cols);
        if rows == 0 {
            if let Some(path) = &self.options.checkpoint {
                self.write_checkpoint(path, &outcomes, 0, cols)?;
            }
        }
        for i in 0..rows {
            for j in 0..cols {
                outcomes.push(self.cell(planner, i, j)?);
            }
            if let Some(path) = &self.options.checkpoint {
                self.write_checkpoint(path, &outcomes, i + 1, cols)?;
            }
        }
        Ok(outcomes)
    }

    fn cell(&self, planner: &DevicePlanner, i: usize, j: usize) -> Result<CellOutcome> {
        let (source, target) = (&self.sources.clouds()[i], &self.targets.clouds()[j]);
        let start = Instant::now();
        let (score, fallback) = score_cell(
            self.scorer.as_ref(),
            planner,
            &self.config,
            source,
            target,
            false,
        )
        .map_err(|e| e.at_pair(i, j))?;
        let seconds = start.elapsed().as_secs_f32();
        if !score.cost.is_finite() {
            return Err(
                Error::Computation(format!("non-finite cost {}", score.cost)).at_pair(i, j),
            );
        }
        tracing::debug!(
            source = %self.sources.labels()[i],
            target = %self.targets.labels()[j],
            cost = score.cost,
            seconds,
            "scored cell"
        );
        if !score.converged {
            tracing::warn!(row = i, col = j, "solver hit max_iter before reaching tol");
        }
        let fallback = fallback.map(|reason| {
            tracing::warn!(row = i, col = j, %reason, "cell downgraded to host");
            DeviceFallbackEvent {
                row: i,
                col: j,
                reason,
            }
        });
        Ok(CellOutcome {
            cost: score.cost,
            seconds,
            converged: score.converged,
            fallback,
        })
    }

    fn write_checkpoint(
        &self,
        path: &std::path::Path,
        outcomes: &[CellOutcome],
        done_rows: usize,
        cols: usize,
    ) -> Result<()> {
        let flat: Vec<f32> = outcomes.iter().map(|o| o.cost).collect();
        let values = Array2::from_shape_vec((done_rows, cols), flat)
            .map_err(|e| Error::Computation(format!("checkpoint layout: {e}")))?;
        let table = LabeledTable::new(
            values,
            self.sources.labels()[..done_rows].to_vec(),
            self.targets.labels().to_vec(),
        );
        table.write_csv(std::fs::File::create(path)?)?;
        tracing::debug!(path = %path.display(), done_rows, "wrote checkpoint");
        Ok(())
    }

    fn output(&self) -> Result<&RunOutput> {
        match (&self.state, &self.last) {
            (ComputationState::Completed, Some(out)) => Ok(out),
            _ => Err(Error::NotComputed),
        }
    }

    pub fn matrix(&self) -> Result<&OtdMatrix> {
        Ok(&self.output()?.matrix)
    }

    pub fn view(&self) -> Result<ResultView<'_>> {
        Ok(self.output()?.matrix.view())
    }

    /// Per-cell wall time in seconds, labeled like the matrix.
    pub fn timings(&self) -> Result<LabeledTable> {
        let out = self.output()?;
        Ok(LabeledTable::new(
            out.timings.clone(),
            self.sources.labels().to_vec(),
            self.targets.labels().to_vec(),
        ))
    }

    /// Diagnostics of the last completed run (empty otherwise).
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self.output() {
            Ok(out) => &out.diagnostics,
            Err(_) => &[],
        }
    }

    /// Device chosen for the last completed run.
    pub fn device(&self) -> Option<Device> {
        self.output().ok().map(|o| o.planner.device())
    }

    pub(crate) fn planner(&self) -> Result<&DevicePlanner> {
        Ok(&self.output()?.planner)
    }

    pub fn state(&self) -> ComputationState {
        self.state
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn sources(&self) -> &SampleSet {
        &self.sources
    }

    pub fn targets(&self) -> &SampleSet {
        &self.targets
    }

    pub fn scorer(&self) -> &dyn DivergenceScorer {
        self.scorer.as_ref()
    }

    /// Matrices of two engines are comparable iff their loss configurations are identical.
    pub fn is_comparable(&self, other: &PairwiseOtd) -> bool {
        self.config == other.config
    }
}

impl core::fmt::Debug for PairwiseOtd {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PairwiseOtd")
            .field("sources", &self.sources.len())
            .field("targets", &self.targets.len())
            .field("config", &self.config)
            .field("scorer", &self.scorer.name())
            .field("state", &self.state)
            .finish()
    }
}
