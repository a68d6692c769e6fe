//! Burn-backed (opt-in) accelerated kernel.
//!
//! This module is intentionally **additive**: it evaluates the same ground cost and transport
//! gradient as `kernel`, but on a Burn tensor backend, and takes the gradient from autodiff
//! instead of a closed form. The Sinkhorn solve itself stays in `wass` on the host.
//!
//! The backend is `Autodiff<NdArray<f32>>`; swapping in a GPU backend only changes
//! `AccelBackend`.

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use ndarray::{Array2, ArrayView2};

use crate::cloud::PointCloud;
use crate::{Error, Result};

/// Accelerated backend: ndarray + autodiff.
pub type AccelBackend = Autodiff<NdArray<f32>>;

/// Gradient-free twin of `AccelBackend`, used for exported tensors.
pub type AccelInner = NdArray<f32>;

/// A point cloud resident on the accelerated backend. Dropping it releases the buffer.
pub struct DeviceCloud {
    tensor: Tensor<AccelBackend, 2>,
}

impl DeviceCloud {
    pub fn upload(cloud: &PointCloud) -> Result<Self> {
        let device = <AccelBackend as Backend>::Device::default();
        Ok(Self {
            tensor: array_to_tensor::<AccelBackend>(&cloud.view(), &device),
        })
    }

    pub fn dims(&self) -> [usize; 2] {
        self.tensor.dims()
    }
}

/// Copy an `n×d` view into a backend tensor (row-major).
pub fn array_to_tensor<B: Backend>(a: &ArrayView2<f32>, device: &B::Device) -> Tensor<B, 2> {
    let (n, d) = a.dim();
    let data = TensorData::new(a.iter().copied().collect::<Vec<f32>>(), [n, d]);
    Tensor::from_data(data, device)
}

fn tensor_to_array<B: Backend>(t: Tensor<B, 2>) -> Result<Array2<f32>> {
    let [n, m] = t.dims();
    let flat = t
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| Error::Device(format!("tensor readback failed: {e:?}")))?;
    Array2::from_shape_vec((n, m), flat)
        .map_err(|e| Error::Device(format!("tensor readback shape: {e}")))
}

/// `|x_i − y_j|²` via `|x|² + |y|² − 2⟨x, y⟩`, clamped at 0 against cancellation.
fn squared_distances<B: Backend>(x: Tensor<B, 2>, y: Tensor<B, 2>) -> Tensor<B, 2> {
    let x2 = x.clone().powf_scalar(2.0).sum_dim(1);
    let y2 = y.clone().powf_scalar(2.0).sum_dim(1).transpose();
    let xy = x.matmul(y.transpose());
    (x2 + y2 - xy.mul_scalar(2.0)).clamp_min(0.0)
}

fn ground_cost<B: Backend>(sq: Tensor<B, 2>, p: f32) -> Tensor<B, 2> {
    if p == 2.0 {
        sq.mul_scalar(0.5)
    } else {
        // Offset keeps d/dsq finite at coincident points.
        sq.add_scalar(1e-12)
            .powf_scalar(p / 2.0)
            .div_scalar(p)
    }
}

fn check_dims(x: &DeviceCloud, y: &DeviceCloud) -> Result<()> {
    let [_, dx] = x.dims();
    let [_, dy] = y.dims();
    if dx != dy {
        return Err(Error::InvalidInput(format!(
            "dimension mismatch: source d={dx} vs target d={dy}"
        )));
    }
    Ok(())
}

pub fn cost_matrix(x: &DeviceCloud, y: &DeviceCloud, p: f32) -> Result<Array2<f32>> {
    check_dims(x, y)?;
    let c = ground_cost(squared_distances(x.tensor.clone(), y.tensor.clone()), p);
    tensor_to_array(c)
}

/// Gradient of `⟨C(x, y), P⟩` w.r.t. `x`, with `P` and `y` held constant.
pub fn transport_gradient(
    x: &DeviceCloud,
    y: &DeviceCloud,
    plan: &ArrayView2<f32>,
    p: f32,
) -> Result<Array2<f32>> {
    check_dims(x, y)?;
    let [n, _] = x.dims();
    let [m, _] = y.dims();
    if plan.dim() != (n, m) {
        return Err(Error::InvalidInput(format!(
            "plan shape {:?} does not match ({n}, {m})",
            plan.dim()
        )));
    }
    let device = x.tensor.device();
    let xg = x.tensor.clone().require_grad();
    let plan_t = array_to_tensor::<AccelBackend>(plan, &device);
    let objective = (ground_cost(squared_distances(xg.clone(), y.tensor.clone()), p) * plan_t).sum();
    let grads = objective.backward();
    let g = xg
        .grad(&grads)
        .ok_or_else(|| Error::Device("autodiff produced no gradient for source".into()))?;
    tensor_to_array(g)
}

/// Minimal end-to-end exercise of the backend, used by the process-wide probe.
pub fn smoke_test() -> bool {
    let Ok(x) = PointCloud::from_rows(&[vec![0.0, 0.0], vec![1.0, 1.0]]) else {
        return false;
    };
    let Ok(dx) = DeviceCloud::upload(&x) else {
        return false;
    };
    match cost_matrix(&dx, &dx, 2.0) {
        Ok(c) => c.dim() == (2, 2) && (c[[0, 1]] - 1.0).abs() < 1e-5,
        Err(_) => false,
    }
}
