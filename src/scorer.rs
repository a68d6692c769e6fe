//! The pluggable divergence seam.
//!
//! A `DivergenceScorer` turns one placed (source, target) pair into a scalar cost and,
//! optionally, the gradient of that cost w.r.t. the source coordinates. The engine and the
//! Brenier extractor only ever talk to this trait.
//!
//! The built-in `SinkhornScorer` delegates the transport solve to `wass` (log-domain Sinkhorn
//! with uniform weights) and reports the regularized value
//!
//! \[
//! \mathrm{OT}_ε(x, y) = ⟨C, P⟩ + ε · \mathrm{KL}(P \,\|\, a ⊗ b),
//! \]
//!
//! evaluated on the returned plan. Its gradient uses the envelope theorem: at the optimal plan
//! `P`, `∂ OT_ε / ∂x_i = Σ_j P_ij ∇ₓc(x_i, y_j)`, so no differentiation through the solver is
//! needed. The ground-cost kernel runs on whatever device the clouds were placed on.
//!
//! When `wass` reports that the solve did not reach `tol` within `max_iter`, the scorer reruns
//! the fixed-iteration solver and returns its plan with `Score::converged == false`; callers
//! surface that as a diagnostic rather than an error.

use crate::config::{DivergenceKind, LossConfig};
use crate::device::{Device, Placed};
use crate::{Error, Result};
use ndarray::{Array1, Array2};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Output of one scorer call.
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub cost: f32,
    /// `∂cost/∂source`, shape `n×d`; present iff gradient tracking was requested.
    pub gradient: Option<Array2<f32>>,
    /// `false` when the solver stopped at its iteration limit without reaching `tol`.
    pub converged: bool,
}

impl Score {
    /// A converged score.
    pub fn new(cost: f32, gradient: Option<Array2<f32>>) -> Self {
        Self {
            cost,
            gradient,
            converged: true,
        }
    }
}

pub trait DivergenceScorer: Send + Sync {
    fn name(&self) -> &str;

    fn score(
        &self,
        source: &Placed<'_>,
        target: &Placed<'_>,
        config: &LossConfig,
        track_gradient: bool,
    ) -> Result<Score>;
}

impl<S: DivergenceScorer + ?Sized> DivergenceScorer for Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn score(
        &self,
        source: &Placed<'_>,
        target: &Placed<'_>,
        config: &LossConfig,
        track_gradient: bool,
    ) -> Result<Score> {
        (**self).score(source, target, config, track_gradient)
    }
}

/// Shared pair precondition: same dimension, both non-empty.
pub fn check_pair(source: &Placed<'_>, target: &Placed<'_>) -> Result<()> {
    if source.is_empty() || target.is_empty() {
        return Err(Error::InvalidInput("point clouds must be non-empty".into()));
    }
    if source.dim() != target.dim() {
        return Err(Error::InvalidInput(format!(
            "dimension mismatch: source d={} vs target d={}",
            source.dim(),
            target.dim()
        )));
    }
    Ok(())
}

/// Entropic OT / Sinkhorn divergence backed by `wass`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SinkhornScorer;

/// One entropic solve: plan plus regularized value.
#[derive(Debug)]
struct Solve {
    plan: Array2<f32>,
    value: f32,
    converged: bool,
}

impl SinkhornScorer {
    /// Uniform-weight entropic solve at `ε = blur^p`.
    fn solve(cost: &Array2<f32>, config: &LossConfig) -> Result<Solve> {
        let (n, m) = cost.dim();
        let a = Array1::<f32>::from_elem(n, 1.0 / n as f32);
        let b = Array1::<f32>::from_elem(m, 1.0 / m as f32);
        let eps = config.epsilon();
        let (plan, converged) = match wass::sinkhorn_log_with_convergence(
            &a,
            &b,
            cost,
            eps,
            config.max_iter,
            config.tol,
        ) {
            Ok((plan, _dist, iters)) => {
                tracing::trace!(n, m, iters, "sinkhorn solve");
                (plan, true)
            }
            Err(wass::Error::SinkhornNotConverged(iters)) => {
                tracing::debug!(
                    n,
                    m,
                    iters,
                    eps,
                    "sinkhorn hit max_iter; using fixed-iteration plan"
                );
                let (plan, _dist) = wass::sinkhorn_log(&a, &b, cost, eps, config.max_iter);
                (plan, false)
            }
            Err(e) => return Err(Error::Computation(format!("sinkhorn failed: {e}"))),
        };
        let value = regularized_value(cost, &plan, eps, n, m);
        if !value.is_finite() {
            return Err(Error::Computation(format!(
                "non-finite transport value ({value})"
            )));
        }
        Ok(Solve {
            plan,
            value,
            converged,
        })
    }
}

/// `⟨C, P⟩ + ε · KL(P ‖ a ⊗ b)` for uniform `a`, `b`, with the generalized KL
/// `Σ P log(P / ab) − Σ P + 1`.
fn regularized_value(
    cost: &Array2<f32>,
    plan: &Array2<f32>,
    eps: f32,
    n: usize,
    m: usize,
) -> f32 {
    let log_ab = -((n as f64).ln() + (m as f64).ln());
    let (mut transport, mut entropy, mut mass) = (0.0f64, 0.0f64, 0.0f64);
    for (&c, &p) in cost.iter().zip(plan.iter()) {
        if p <= 0.0 {
            continue;
        }
        let p = p as f64;
        transport += c as f64 * p;
        entropy += p * (p.ln() - log_ab);
        mass += p;
    }
    (transport + eps as f64 * (entropy - mass + 1.0)) as f32
}

impl DivergenceScorer for SinkhornScorer {
    fn name(&self) -> &str {
        "wass-sinkhorn"
    }

    fn score(
        &self,
        source: &Placed<'_>,
        target: &Placed<'_>,
        config: &LossConfig,
        track_gradient: bool,
    ) -> Result<Score> {
        check_pair(source, target)?;
        let p = config.p;

        let xy = Self::solve(&source.cost_matrix(target, p)?, config)?;

        let (cost, xx, converged) = match config.kind {
            DivergenceKind::EntropicOt => (xy.value, None, xy.converged),
            DivergenceKind::Sinkhorn => {
                let xx = Self::solve(&source.cost_matrix(source, p)?, config)?;
                let yy = Self::solve(&target.cost_matrix(target, p)?, config)?;
                // Non-negative in exact arithmetic; the floor absorbs solver residue.
                let s = (xy.value - 0.5 * (xx.value + yy.value)).max(0.0);
                let converged = xy.converged && xx.converged && yy.converged;
                (s, Some(xx), converged)
            }
        };
        if !cost.is_finite() {
            return Err(Error::Computation(format!("non-finite divergence ({cost})")));
        }

        let gradient = if track_gradient {
            let mut g = source.transport_gradient(target, &xy.plan.view(), p)?;
            if let Some(xx) = xx {
                // x appears in both slots of OT(x, x): symmetrize, and the ½ cancels the 2.
                let sym = (&xx.plan + &xx.plan.t()) * 0.5;
                g -= &source.transport_gradient(source, &sym.view(), p)?;
            }
            if g.iter().any(|v| !v.is_finite()) {
                return Err(Error::Computation("non-finite gradient".into()));
            }
            Some(g)
        } else {
            None
        };

        Ok(Score {
            cost,
            gradient,
            converged,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    source: u64,
    target: u64,
    config: u64,
    gradient: bool,
    device: Device,
}

/// Memoizing wrapper: identical (clouds, config, gradient flag, device) are scored once.
///
/// Keys are content fingerprints, so the cache is valid across engines; `invalidate` drops
/// everything.
pub struct CachedScorer<S> {
    inner: S,
    cache: Mutex<HashMap<CacheKey, Score>>,
    hits: AtomicUsize,
}

impl<S: DivergenceScorer> CachedScorer<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
            hits: AtomicUsize::new(0),
        }
    }

    pub fn invalidate(&self) {
        self.cache.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: DivergenceScorer> DivergenceScorer for CachedScorer<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn score(
        &self,
        source: &Placed<'_>,
        target: &Placed<'_>,
        config: &LossConfig,
        track_gradient: bool,
    ) -> Result<Score> {
        let key = CacheKey {
            source: source.cloud().fingerprint(),
            target: target.cloud().fingerprint(),
            config: config.fingerprint(),
            gradient: track_gradient,
            device: source.device(),
        };
        if let Some(hit) = self.cache.lock().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit.clone());
        }
        // Not holding the lock while scoring: concurrent misses may both compute (same value).
        let score = self.inner.score(source, target, config, track_gradient)?;
        self.cache.lock().insert(key, score.clone());
        Ok(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::PointCloud;
    use crate::device::DevicePlanner;
    use ndarray::array;

    fn cfg() -> LossConfig {
        LossConfig::default().with_blur(0.5)
    }

    #[test]
    fn self_divergence_is_zero_with_zero_gradient() -> Result<()> {
        let x = PointCloud::new(array![[0.0f32, 0.0], [1.0, 1.0], [0.5, -0.5]])?;
        let cell = DevicePlanner::host().place_pair(&x, &x)?;
        let s = SinkhornScorer.score(&cell.source, &cell.target, &cfg(), true)?;
        assert_eq!(s.cost, 0.0);
        let g = s.gradient.expect("gradient requested");
        assert_eq!(g.dim(), (3, 2));
        assert!(g.iter().all(|v| v.abs() < 1e-3), "{g:?}");
        Ok(())
    }

    #[test]
    fn entropic_ot_is_biased_on_self_pairs() -> Result<()> {
        let x = PointCloud::new(array![[0.0f32, 0.0], [1.0, 1.0]])?;
        let cell = DevicePlanner::host().place_pair(&x, &x)?;
        let c = cfg().with_kind(DivergenceKind::EntropicOt);
        let s = SinkhornScorer.score(&cell.source, &cell.target, &c, false)?;
        assert!(s.cost > 0.0);
        assert!(s.gradient.is_none());
        Ok(())
    }

    #[test]
    fn divergence_grows_with_separation() -> Result<()> {
        let x = PointCloud::new(array![[0.0f32, 0.0], [1.0, 0.0], [0.0, 1.0]])?;
        let near = PointCloud::new(array![[0.5f32, 0.0], [1.5, 0.0], [0.5, 1.0]])?;
        let far = PointCloud::new(array![[3.0f32, 0.0], [4.0, 0.0], [3.0, 1.0]])?;
        let host = DevicePlanner::host();
        let a = host.place_pair(&x, &near)?;
        let b = host.place_pair(&x, &far)?;
        let s_near = SinkhornScorer.score(&a.source, &a.target, &cfg(), false)?.cost;
        let s_far = SinkhornScorer.score(&b.source, &b.target, &cfg(), false)?.cost;
        assert!(s_near > 0.0);
        assert!(s_far > s_near, "near={s_near} far={s_far}");
        // Pure translation by t under |x-y|^2/2: S ≈ |t|^2/2.
        assert!((s_far - 4.5).abs() < 0.2, "far={s_far}");
        Ok(())
    }

    #[test]
    fn gradient_matches_finite_differences_of_cost() -> Result<()> {
        let x0 = array![[0.0f32, 0.0], [0.8, 0.3], [0.2, 1.0], [1.1, 0.9]];
        let y = PointCloud::new(array![[1.5f32, 0.5], [2.0, 1.2], [1.2, 1.8]])?;
        let host = DevicePlanner::host();
        let h = 5e-3f32;
        for kind in [DivergenceKind::EntropicOt, DivergenceKind::Sinkhorn] {
            let c = cfg().with_kind(kind).with_tol(1e-6).with_max_iter(20_000);
            let eval = |x: &Array2<f32>, grad: bool| -> Result<Score> {
                let x = PointCloud::new(x.clone())?;
                let cell = host.place_pair(&x, &y)?;
                SinkhornScorer.score(&cell.source, &cell.target, &c, grad)
            };
            let g = eval(&x0, true)?.gradient.expect("gradient requested");
            for i in 0..x0.nrows() {
                for k in 0..x0.ncols() {
                    let mut xp = x0.clone();
                    xp[[i, k]] += h;
                    let mut xm = x0.clone();
                    xm[[i, k]] -= h;
                    let fd = (eval(&xp, false)?.cost - eval(&xm, false)?.cost) / (2.0 * h);
                    let an = g[[i, k]];
                    assert!(
                        (fd - an).abs() < 5e-3 + 0.05 * an.abs(),
                        "{kind:?} ({i},{k}) fd={fd} grad={an}"
                    );
                }
            }
        }
        Ok(())
    }

    #[test]
    fn iteration_limit_yields_unconverged_score_not_error() -> Result<()> {
        let x = PointCloud::new(array![[0.0f32, 0.0], [1.0, 0.2], [0.3, 0.9]])?;
        let y = PointCloud::new(array![[0.4f32, 0.1], [1.2, 1.0]])?;
        let cell = DevicePlanner::host().place_pair(&x, &y)?;
        let c = cfg().with_max_iter(1).with_tol(1e-12);
        let s = SinkhornScorer.score(&cell.source, &cell.target, &c, true)?;
        assert!(!s.converged);
        assert!(s.cost.is_finite() && s.cost >= 0.0);
        assert!(s.gradient.expect("gradient requested").iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn default_blur_scores_unit_scale_clouds() -> Result<()> {
        use rand::SeedableRng;
        use rand_distr::{Distribution, StandardNormal};
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(5);
        let mut blob = |n: usize, shift: f32| {
            Array2::from_shape_fn((n, 2), |_| {
                let z: f32 = StandardNormal.sample(&mut rng);
                shift + 0.3 * z
            })
        };
        let x = PointCloud::new(blob(20, 0.0))?;
        let y = PointCloud::new(blob(20, 1.0))?;
        let cell = DevicePlanner::host().place_pair(&x, &y)?;
        let s = SinkhornScorer.score(&cell.source, &cell.target, &LossConfig::default(), false)?;
        assert!(s.cost.is_finite() && s.cost > 0.0, "cost={}", s.cost);
        Ok(())
    }

    #[test]
    fn dimension_mismatch_is_rejected_before_solving() -> Result<()> {
        let x = PointCloud::new(array![[0.0f32, 0.0]])?;
        let y = PointCloud::new(array![[0.0f32, 0.0, 0.0]])?;
        let cell = DevicePlanner::host().place_pair(&x, &y)?;
        let err = SinkhornScorer
            .score(&cell.source, &cell.target, &cfg(), false)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        Ok(())
    }

    #[test]
    fn cache_hits_on_identical_content() -> Result<()> {
        let x = PointCloud::new(array![[0.0f32, 0.0], [1.0, 1.0]])?;
        let x2 = x.clone();
        let y = PointCloud::new(array![[2.0f32, 0.0], [1.0, 3.0]])?;
        let cached = CachedScorer::new(SinkhornScorer);
        let host = DevicePlanner::host();

        let a = host.place_pair(&x, &y)?;
        let first = cached.score(&a.source, &a.target, &cfg(), false)?;
        let b = host.place_pair(&x2, &y)?;
        let second = cached.score(&b.source, &b.target, &cfg(), false)?;
        assert_eq!(first, second);
        assert_eq!(cached.hits(), 1);
        assert_eq!(cached.len(), 1);

        // Different config is a different key.
        cached.score(&a.source, &a.target, &cfg().with_blur(0.4), false)?;
        assert_eq!(cached.len(), 2);

        cached.invalidate();
        assert!(cached.is_empty());
        Ok(())
    }
}
