//! # otpair
//!
//! Pairwise optimal transport distances (OTD) between collections of point clouds
//! (e.g. cytometry samples), plus Brenier-map extraction for a selected (source, target) cell.
//!
//! This crate is intentionally small:
//!
//! - it orchestrates **which pairs** get scored, **where** (host vs accelerated backend), and
//!   **how results are exposed** (matrix, plain rows, labeled table),
//! - it depends on `wass` for the actual entropic OT solve (it does not reimplement Sinkhorn),
//! - it does not provide a CLI, plotting, or data loading.
//!
//! ## Public invariants (must not change)
//!
//! - **Row-major, all-or-nothing**: `PairwiseOtd::compute` visits cells source-outer,
//!   target-inner, and either fills every cell or exposes no matrix at all.
//! - **Ordering survives every projection**: row `i` is source `i`, column `j` is target `j`,
//!   in the `ndarray` matrix, the plain rows, and the labeled table.
//! - **One device decision per run**: the accelerated-vs-host choice is made before the first
//!   cell; only single cells may be downgraded (and each downgrade is recorded).
//! - **No hidden normalization**: clouds are uniform-weight empirical measures; the ground cost
//!   is `|x - y|^p / p` and the entropic scale is `ε = blur^p`.
//!
//! ## Module map
//!
//! - `cloud`: `PointCloud` / `SampleSet` (validated inputs + labels)
//! - `config`: `LossConfig` (divergence identity) and `EngineOptions` (run mechanics)
//! - `backend`: process-wide accelerated-backend probe
//! - `device`: `DevicePlanner` and scoped device placements
//! - `kernel`: host ground-cost kernel (ndarray)
//! - `scorer`: the pluggable `DivergenceScorer` seam + the `wass`-backed Sinkhorn scorer
//! - `engine`: `PairwiseOtd`, the pairwise loop
//! - `view`: `ResultView` projections of the matrix of record
//! - `brenier`: displacement fields from the gradient of the transport cost
//!
//! Optional (feature-gated):
//!
//! - `burn_kernel` (`burn`): ground cost + gradient on a Burn autodiff backend
//! - `parallel`: rayon schedule for `compute`

pub mod backend;
pub mod brenier;
pub mod cloud;
pub mod config;
pub mod device;
pub mod engine;
pub mod kernel;
pub mod scorer;
pub mod view;

#[cfg(feature = "burn")]
pub mod burn_kernel;

pub use brenier::{extract_brenier_map, BrenierMap, BrenierMapExtractor};
pub use cloud::{PointCloud, SampleSet};
pub use config::{DivergenceKind, EngineOptions, LossConfig};
pub use device::{Device, DeviceFallbackEvent, DevicePlanner};
pub use engine::{ComputationState, Diagnostic, PairwiseOtd};
pub use scorer::{CachedScorer, DivergenceScorer, Score, SinkhornScorer};
pub use view::{LabeledTable, OtdMatrix, ResultView};

/// Which side of the matrix an index refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Source,
    Target,
}

impl core::fmt::Display for Axis {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Axis::Source => f.write_str("source"),
            Axis::Target => f.write_str("target"),
        }
    }
}

/// otpair error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("distance matrix not computed (call compute() first)")]
    NotComputed,
    #[error("{axis} index {index} out of range (len {len})")]
    IndexOutOfRange { axis: Axis, index: usize, len: usize },
    #[error("computation failed: {0}")]
    Computation(String),
    #[error("device error: {0}")]
    Device(String),
    #[error("pair ({row}, {col}): {error}")]
    Pair {
        row: usize,
        col: usize,
        #[source]
        error: Box<Error>,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl Error {
    pub(crate) fn at_pair(self, row: usize, col: usize) -> Self {
        match self {
            // Already attributed (e.g. a nested scorer); keep the innermost cell.
            e @ Error::Pair { .. } => e,
            e => Error::Pair {
                row,
                col,
                error: Box::new(e),
            },
        }
    }

    /// The `(source, target)` cell this error is attributed to, if any.
    pub fn pair(&self) -> Option<(usize, usize)> {
        match self {
            Error::Pair { row, col, .. } => Some((*row, *col)),
            _ => None,
        }
    }

    /// The underlying error with pair attribution stripped.
    pub fn root(&self) -> &Error {
        match self {
            Error::Pair { error, .. } => error.root(),
            e => e,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
