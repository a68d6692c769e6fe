//! Brenier maps: displacement fields from the gradient of the transport cost.
//!
//! For uniform weights `1/n` on the source, the gradient of the (entropic) transport cost
//! w.r.t. a source point is `∂cost/∂x_i = (1/n) Σ_j π̃_ij ∇c(x_i − y_j)` where `π̃` is the
//! row-normalized plan. Writing `g_i = n · ∂cost/∂x_i` and inverting `∇c(z) = |z|^{p−2} z`
//! gives the displacement
//!
//! \[
//! T(x_i) − x_i = −(∇c)^{-1}(g_i) = −|g_i|^{(2−p)/(p−1)} g_i,
//! \]
//!
//! which for `p = 2` is simply `−n · ∂cost/∂x_i`. For `p ≤ 1`, `∇c` is not invertible and
//! the map is rejected.

use crate::cloud::PointCloud;
use crate::config::LossConfig;
use crate::device::{DeviceFallbackEvent, DevicePlanner};
use crate::engine::{score_cell, Diagnostic, PairwiseOtd};
use crate::scorer::DivergenceScorer;
use crate::{Axis, Error, Result};
use ndarray::Array2;
use std::collections::HashMap;

/// Displacement of every source point toward the target distribution.
#[derive(Debug, Clone, PartialEq)]
pub struct BrenierMap {
    pair: Option<(usize, usize)>,
    displacement: Array2<f32>,
    cost: f32,
    converged: bool,
}

impl BrenierMap {
    /// `(source, target)` indices when extracted from an engine.
    pub fn pair(&self) -> Option<(usize, usize)> {
        self.pair
    }

    /// `n×d`, row `k` is the displacement of source point `k`.
    pub fn displacement(&self) -> &Array2<f32> {
        &self.displacement
    }

    pub fn into_displacement(self) -> Array2<f32> {
        self.displacement
    }

    /// Divergence value of the gradient-tracked evaluation.
    pub fn cost(&self) -> f32 {
        self.cost
    }

    /// `false` if the solver behind this map stopped at its iteration limit.
    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn len(&self) -> usize {
        self.displacement.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.displacement.nrows() == 0
    }

    /// `source + displacement`.
    pub fn apply(&self, source: &PointCloud) -> Result<Array2<f32>> {
        if source.view().dim() != self.displacement.dim() {
            return Err(Error::InvalidInput(format!(
                "source shape {:?} does not match map shape {:?}",
                source.view().dim(),
                self.displacement.dim()
            )));
        }
        Ok(&source.view() + &self.displacement)
    }
}

/// Convert `∂cost/∂source` into per-point displacements for cost exponent `p`.
pub fn displacement_from_gradient(gradient: &Array2<f32>, p: f32) -> Result<Array2<f32>> {
    if !(p > 1.0) || !p.is_finite() {
        return Err(Error::InvalidInput(format!(
            "Brenier map requires p > 1 (got {p})"
        )));
    }
    let n = gradient.nrows() as f32;
    let expo = (2.0 - p) / (p - 1.0);
    let mut out = gradient.mapv(|v| -n * v);
    if p != 2.0 {
        for mut row in out.rows_mut() {
            let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            let scale = if norm > 0.0 { norm.powf(expo) } else { 0.0 };
            row.mapv_inplace(|v| v * scale);
        }
    }
    Ok(out)
}

fn brenier_with(
    scorer: &dyn DivergenceScorer,
    planner: &DevicePlanner,
    config: &LossConfig,
    source: &PointCloud,
    target: &PointCloud,
    pair: Option<(usize, usize)>,
) -> Result<(BrenierMap, Option<String>)> {
    let (score, fallback) = score_cell(scorer, planner, config, source, target, true)?;
    if let Some(reason) = &fallback {
        tracing::warn!(?pair, %reason, "Brenier evaluation downgraded to host");
    }
    let gradient = score.gradient.ok_or_else(|| {
        Error::Computation(format!("scorer `{}` returned no gradient", scorer.name()))
    })?;
    if gradient.dim() != source.view().dim() {
        return Err(Error::Computation(format!(
            "gradient shape {:?} does not match source shape {:?}",
            gradient.dim(),
            source.view().dim()
        )));
    }
    let displacement = displacement_from_gradient(&gradient, config.p)?;
    if displacement.iter().any(|v| !v.is_finite()) {
        return Err(Error::Computation("non-finite displacement".into()));
    }
    tracing::debug!(?pair, cost = score.cost, n = source.len(), "extracted Brenier map");
    let map = BrenierMap {
        pair,
        displacement,
        cost: score.cost,
        converged: score.converged,
    };
    Ok((map, fallback))
}

/// Independent (engine-free) extraction on the host path.
pub fn extract_brenier_map(
    scorer: &dyn DivergenceScorer,
    source: &PointCloud,
    target: &PointCloud,
    config: &LossConfig,
) -> Result<BrenierMap> {
    config.validate()?;
    let (map, _) = brenier_with(scorer, &DevicePlanner::host(), config, source, target, None)?;
    Ok(map)
}

/// Brenier maps for cells of a completed engine, memoized per `(source, target)`.
///
/// Borrows the engine, so the matrix cannot be recomputed (or mutated) while maps are cached.
/// Host fallbacks and unconverged solves during extraction are recorded as `Diagnostic`s, the
/// same way `PairwiseOtd::compute` records them.
pub struct BrenierMapExtractor<'e> {
    engine: &'e PairwiseOtd,
    maps: HashMap<(usize, usize), BrenierMap>,
    diagnostics: Vec<Diagnostic>,
}

impl<'e> BrenierMapExtractor<'e> {
    /// Fails with `NotComputed` unless the engine holds a completed matrix.
    pub fn for_engine(engine: &'e PairwiseOtd) -> Result<Self> {
        engine.matrix()?;
        Ok(Self {
            engine,
            maps: HashMap::new(),
            diagnostics: Vec::new(),
        })
    }

    fn check_bounds(&self, i: usize, j: usize) -> Result<()> {
        let (rows, cols) = (self.engine.sources().len(), self.engine.targets().len());
        if i >= rows {
            return Err(Error::IndexOutOfRange {
                axis: Axis::Source,
                index: i,
                len: rows,
            });
        }
        if j >= cols {
            return Err(Error::IndexOutOfRange {
                axis: Axis::Target,
                index: j,
                len: cols,
            });
        }
        Ok(())
    }

    /// Map for source `i` → target `j`, reusing the engine's config, scorer and device plan.
    pub fn extract(&mut self, i: usize, j: usize) -> Result<&BrenierMap> {
        self.check_bounds(i, j)?;
        if !self.maps.contains_key(&(i, j)) {
            let engine = self.engine;
            let (map, fallback) = brenier_with(
                engine.scorer(),
                engine.planner()?,
                engine.config(),
                &engine.sources().clouds()[i],
                &engine.targets().clouds()[j],
                Some((i, j)),
            )
            .map_err(|e| e.at_pair(i, j))?;
            if let Some(reason) = fallback {
                self.diagnostics
                    .push(Diagnostic::DeviceFallback(DeviceFallbackEvent {
                        row: i,
                        col: j,
                        reason,
                    }));
            }
            if !map.converged {
                self.diagnostics.push(Diagnostic::NotConverged { row: i, col: j });
            }
            self.maps.insert((i, j), map);
        }
        Ok(&self.maps[&(i, j)])
    }

    /// Every cell, row-major.
    pub fn extract_all(&mut self) -> Result<Vec<Vec<&BrenierMap>>> {
        let (rows, cols) = (self.engine.sources().len(), self.engine.targets().len());
        for i in 0..rows {
            for j in 0..cols {
                self.extract(i, j)?;
            }
        }
        let maps = &self.maps;
        Ok((0..rows)
            .map(move |i| (0..cols).map(move |j| &maps[&(i, j)]).collect())
            .collect())
    }

    /// Already-extracted map, if any.
    pub fn get(&self, i: usize, j: usize) -> Option<&BrenierMap> {
        self.maps.get(&(i, j))
    }

    pub fn cached(&self) -> usize {
        self.maps.len()
    }

    /// Degradations seen while extracting, in extraction order.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}
