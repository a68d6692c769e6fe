//! Device planning and scoped placements.
//!
//! The planner decides **once per run** whether cells go to the accelerated backend or the
//! host path. A placement (`Placed`) owns whatever device buffer the cloud was uploaded into;
//! the buffer is released when the placement drops, i.e. at the end of the cell.

use crate::cloud::PointCloud;
use crate::config::LossConfig;
use crate::engine::Diagnostic;
use crate::{kernel, Error, Result};
use ndarray::{Array2, ArrayView2};

#[cfg(feature = "burn")]
use crate::burn_kernel::DeviceCloud;

/// Where a cell is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Host,
    Accelerator,
}

impl core::fmt::Display for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Device::Host => f.write_str("host"),
            Device::Accelerator => f.write_str("accelerator"),
        }
    }
}

/// A single cell that was downgraded from the accelerator to the host path.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFallbackEvent {
    pub row: usize,
    pub col: usize,
    pub reason: String,
}

/// A cloud placed on a device. Device memory (if any) is freed on drop.
pub struct Placed<'a> {
    cloud: &'a PointCloud,
    device: Device,
    #[cfg(feature = "burn")]
    buffer: Option<DeviceCloud>,
}

impl<'a> Placed<'a> {
    pub fn cloud(&self) -> &'a PointCloud {
        self.cloud
    }

    pub fn view(&self) -> ArrayView2<'a, f32> {
        self.cloud.view()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn len(&self) -> usize {
        self.cloud.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cloud.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.cloud.dim()
    }

    /// Ground-cost matrix `c(self_i, other_j)`, evaluated on this placement's device.
    pub fn cost_matrix(&self, other: &Placed<'_>, p: f32) -> Result<Array2<f32>> {
        #[cfg(feature = "burn")]
        if let (Some(x), Some(y)) = (&self.buffer, &other.buffer) {
            return crate::burn_kernel::cost_matrix(x, y, p);
        }
        kernel::cost_matrix(&self.view(), &other.view(), p)
    }

    /// `Σ_j plan[i,j] ∇ₓc(self_i, other_j)`, evaluated on this placement's device.
    pub fn transport_gradient(
        &self,
        other: &Placed<'_>,
        plan: &ArrayView2<f32>,
        p: f32,
    ) -> Result<Array2<f32>> {
        #[cfg(feature = "burn")]
        if let (Some(x), Some(y)) = (&self.buffer, &other.buffer) {
            return crate::burn_kernel::transport_gradient(x, y, plan, p);
        }
        kernel::transport_gradient(&self.view(), &other.view(), plan, p)
    }
}

impl core::fmt::Debug for Placed<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Placed")
            .field("n", &self.len())
            .field("d", &self.dim())
            .field("device", &self.device)
            .finish()
    }
}

/// Source and target placements for one cell.
#[derive(Debug)]
pub struct CellPlacement<'a> {
    pub source: Placed<'a>,
    pub target: Placed<'a>,
}

/// Per-run device decision plus the accelerator capacity budget.
#[derive(Debug, Clone)]
pub struct DevicePlanner {
    device: Device,
    capacity: Option<usize>,
}

impl DevicePlanner {
    /// Always host.
    pub fn host() -> Self {
        Self {
            device: Device::Host,
            capacity: None,
        }
    }

    /// Make the run-level decision.
    ///
    /// Accelerator iff it was requested, is not overridden by `force_host`, and the probe
    /// reports it usable. A request that cannot be honored yields a `BackendUnavailable`
    /// diagnostic (the caller logs it once per run).
    pub fn plan(
        config: &LossConfig,
        accelerator_available: bool,
        capacity: Option<usize>,
    ) -> (Self, Option<Diagnostic>) {
        let wants = config.accelerated && !config.force_host;
        let device = if wants && accelerator_available {
            Device::Accelerator
        } else {
            Device::Host
        };
        let diagnostic = (wants && !accelerator_available).then_some(Diagnostic::BackendUnavailable);
        (Self { device, capacity }, diagnostic)
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Working-set size of one cell: both clouds plus the `n×m` cost matrix.
    pub fn working_set(n: usize, m: usize, d: usize) -> usize {
        n.saturating_mul(d)
            .saturating_add(m.saturating_mul(d))
            .saturating_add(n.saturating_mul(m))
    }

    /// Place one cloud on the planned device.
    pub fn place<'a>(&self, cloud: &'a PointCloud) -> Result<Placed<'a>> {
        place_on(self.device, cloud)
    }

    /// Place a cell on the planned device, enforcing the accelerator capacity budget.
    pub fn place_pair<'a>(
        &self,
        source: &'a PointCloud,
        target: &'a PointCloud,
    ) -> Result<CellPlacement<'a>> {
        if self.device == Device::Accelerator {
            if let Some(cap) = self.capacity {
                let need = Self::working_set(source.len(), target.len(), source.dim());
                if need > cap {
                    return Err(Error::Device(format!(
                        "cell working set {need} exceeds accelerator capacity {cap}"
                    )));
                }
            }
        }
        Ok(CellPlacement {
            source: self.place(source)?,
            target: self.place(target)?,
        })
    }

    /// Host placement, used when a cell is downgraded.
    pub fn place_pair_on_host<'a>(
        &self,
        source: &'a PointCloud,
        target: &'a PointCloud,
    ) -> Result<CellPlacement<'a>> {
        Ok(CellPlacement {
            source: place_on(Device::Host, source)?,
            target: place_on(Device::Host, target)?,
        })
    }
}

fn place_on(device: Device, cloud: &PointCloud) -> Result<Placed<'_>> {
    match device {
        Device::Host => Ok(Placed {
            cloud,
            device,
            #[cfg(feature = "burn")]
            buffer: None,
        }),
        #[cfg(feature = "burn")]
        Device::Accelerator => Ok(Placed {
            cloud,
            device,
            buffer: Some(DeviceCloud::upload(cloud)?),
        }),
        #[cfg(not(feature = "burn"))]
        Device::Accelerator => Err(Error::Device(
            "accelerated backend not compiled (enable the `burn` feature)".into(),
        )),
    }
}
