//! Loss configuration (what a matrix entry *means*) and engine options (how a run is executed).
//!
//! Only `LossConfig` determines comparability of two matrices. `EngineOptions` changes
//! scheduling, device capacity and checkpointing, never the numbers.

use crate::{Error, Result};
use std::path::PathBuf;

/// Which divergence the built-in scorer evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DivergenceKind {
    /// Debiased Sinkhorn divergence: `OT_ε(x,y) − ½OT_ε(x,x) − ½OT_ε(y,y)`.
    #[default]
    Sinkhorn,
    /// Plain entropic transport cost `OT_ε(x,y)` (biased: `OT_ε(x,x) > 0`).
    EntropicOt,
}

impl DivergenceKind {
    pub fn name(self) -> &'static str {
        match self {
            DivergenceKind::Sinkhorn => "sinkhorn",
            DivergenceKind::EntropicOt => "entropic_ot",
        }
    }
}

/// Divergence identity: two engines are comparable iff their `LossConfig`s are equal.
#[derive(Debug, Clone, PartialEq)]
pub struct LossConfig {
    pub kind: DivergenceKind,
    /// Ground cost exponent: `c(x, y) = |x − y|^p / p`.
    pub p: f32,
    /// Entropic blur; the solver runs at `ε = blur^p`.
    pub blur: f32,
    /// ε-annealing ratio in `(0, 1)`. Part of the identity; consumed by annealing scorers.
    pub scaling: f32,
    /// Maximum Sinkhorn iterations per solve.
    pub max_iter: usize,
    /// Sinkhorn convergence tolerance.
    pub tol: f32,
    /// Request the accelerated kernel backend.
    pub accelerated: bool,
    /// Device override: never place clouds on an accelerator.
    pub force_host: bool,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            kind: DivergenceKind::Sinkhorn,
            p: 2.0,
            blur: 0.05,
            scaling: 0.8,
            max_iter: 5_000,
            tol: 1e-4,
            accelerated: false,
            force_host: false,
        }
    }
}

impl LossConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kind(mut self, kind: DivergenceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_p(mut self, p: f32) -> Self {
        self.p = p;
        self
    }

    pub fn with_blur(mut self, blur: f32) -> Self {
        self.blur = blur;
        self
    }

    pub fn with_scaling(mut self, scaling: f32) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_tol(mut self, tol: f32) -> Self {
        self.tol = tol;
        self
    }

    pub fn with_accelerated(mut self, accelerated: bool) -> Self {
        self.accelerated = accelerated;
        self
    }

    pub fn with_force_host(mut self, force_host: bool) -> Self {
        self.force_host = force_host;
        self
    }

    /// Entropic regularization handed to the solver.
    pub fn epsilon(&self) -> f32 {
        self.blur.powf(self.p)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.p.is_finite() || self.p < 1.0 {
            return Err(Error::InvalidInput("p must be finite and >= 1".into()));
        }
        if !self.blur.is_finite() || self.blur <= 0.0 {
            return Err(Error::InvalidInput("blur must be positive and finite".into()));
        }
        if !(self.scaling > 0.0 && self.scaling < 1.0) {
            return Err(Error::InvalidInput("scaling must lie in (0, 1)".into()));
        }
        if self.max_iter == 0 {
            return Err(Error::InvalidInput("max_iter must be >= 1".into()));
        }
        if !self.tol.is_finite() || self.tol <= 0.0 {
            return Err(Error::InvalidInput("tol must be positive and finite".into()));
        }
        let eps = self.epsilon();
        if !eps.is_finite() || eps <= 0.0 {
            return Err(Error::InvalidInput(format!(
                "blur^p underflows/overflows (epsilon = {eps})"
            )));
        }
        Ok(())
    }

    /// Stable hash of every field. Equal configs have equal fingerprints.
    pub fn fingerprint(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut h = std::collections::hash_map::DefaultHasher::new();
        self.kind.hash(&mut h);
        for x in [self.p, self.blur, self.scaling, self.tol] {
            x.to_bits().hash(&mut h);
        }
        self.max_iter.hash(&mut h);
        self.accelerated.hash(&mut h);
        self.force_host.hash(&mut h);
        h.finish()
    }
}

/// Run mechanics for `PairwiseOtd::compute`.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Evaluate cells on the rayon pool (requires the `parallel` feature; ignored otherwise).
    pub parallel: bool,
    /// Max working-set elements (`n·d + m·d + n·m`) a single cell may place on an accelerator.
    /// `None` means unbounded.
    pub accelerator_capacity: Option<usize>,
    /// Write completed rows as a labeled CSV to this path while computing.
    pub checkpoint: Option<PathBuf>,
}

impl EngineOptions {
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_accelerator_capacity(mut self, elements: usize) -> Self {
        self.accelerator_capacity = Some(elements);
        self
    }

    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_geomloss_style_sinkhorn() {
        let c = LossConfig::default();
        assert_eq!(c.kind, DivergenceKind::Sinkhorn);
        assert_eq!(c.p, 2.0);
        assert!((c.epsilon() - 0.0025).abs() < 1e-7);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(LossConfig::new().with_p(0.5).validate().is_err());
        assert!(LossConfig::new().with_blur(0.0).validate().is_err());
        assert!(LossConfig::new().with_scaling(1.0).validate().is_err());
        assert!(LossConfig::new().with_max_iter(0).validate().is_err());
        assert!(LossConfig::new().with_tol(f32::NAN).validate().is_err());
    }

    #[test]
    fn fingerprint_follows_equality() {
        let a = LossConfig::new().with_blur(0.5);
        let b = LossConfig::new().with_blur(0.5);
        let c = LossConfig::new().with_blur(0.25);
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
