// Truncated SVD backends for the EM loop

use ndarray::{s, Array1, Array2};
use ndarray_linalg::{SVDInto, QR, SVD};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::Normal;

use std::error::Error;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Extra sketch dimensions beyond the target rank for the randomized path.
const N_OVERSAMPLES: usize = 10;

/// Output of a rank-k truncated SVD, together with the squared Frobenius
/// energy of the matrix that the retained components do not capture.
#[derive(Debug, Clone)]
pub struct TruncatedSvd {
    /// The k largest singular values, descending.
    pub singular_values: Array1<f64>,
    /// The matching right-singular vectors as rows, shape (k, n_features).
    pub vt: Array2<f64>,
    /// Sum of squared singular values beyond rank k.
    pub unexplained_variance: f64,
}

/// A strategy that produces the top-k singular values/vectors of a matrix
/// plus the residual energy. The EM loop calls this once per iteration on
/// the whitened data.
pub trait DecompositionBackend {
    fn truncated_svd(
        &mut self,
        matrix: &Array2<f64>,
        rank: usize,
    ) -> Result<TruncatedSvd, Box<dyn Error>>;
}

/// Which truncated-SVD strategy the fit should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SvdMethod {
    /// Full LAPACK SVD, truncated to the target rank. Deterministic and the
    /// most accurate choice; cost grows cubically with the smaller matrix
    /// dimension, so prefer it for small-to-moderate inputs.
    Lapack,
    /// Seeded randomized SVD with power-iteration refinement. Much cheaper
    /// when the target rank is far below the number of features.
    Randomized,
}

impl FromStr for SvdMethod {
    type Err = Box<dyn Error>;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "lapack" => Ok(SvdMethod::Lapack),
            "randomized" => Ok(SvdMethod::Randomized),
            _ => Err(format!(
                "SVD method '{}' is not supported; expected 'lapack' or 'randomized'.",
                name
            )
            .into()),
        }
    }
}

/// Exact backend: computes the full decomposition and keeps the top k.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactSvd;

impl DecompositionBackend for ExactSvd {
    fn truncated_svd(
        &mut self,
        matrix: &Array2<f64>,
        rank: usize,
    ) -> Result<TruncatedSvd, Box<dyn Error>> {
        let (_, singular_values, vt) = matrix
            .svd(false, true)
            .map_err(|e| format!("LAPACK SVD failed: {}", e))?;
        let vt = vt.ok_or("LAPACK SVD did not return right-singular vectors.")?;

        let kept = rank.min(singular_values.len());
        let retained = singular_values.slice(s![..kept]).to_owned();
        let unexplained_variance = singular_values
            .slice(s![kept..])
            .iter()
            .map(|v| v * v)
            .sum();

        Ok(TruncatedSvd {
            singular_values: retained,
            vt: vt.slice(s![..kept, ..]).to_owned(),
            unexplained_variance,
        })
    }
}

/// Randomized backend: Gaussian sketch with oversampling, refined by
/// QR-orthonormalized power iterations, then an exact SVD of the small
/// projected matrix.
///
/// The RNG is seeded once and its state advances across calls, so
/// successive EM iterations draw fresh sketches while the whole fit stays
/// reproducible for a fixed seed.
#[derive(Debug, Clone)]
pub struct RandomizedSvd {
    iterated_power: usize,
    rng: ChaCha8Rng,
}

impl RandomizedSvd {
    pub fn new(iterated_power: usize, seed: u64) -> Self {
        Self {
            iterated_power,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl DecompositionBackend for RandomizedSvd {
    fn truncated_svd(
        &mut self,
        matrix: &Array2<f64>,
        rank: usize,
    ) -> Result<TruncatedSvd, Box<dyn Error>> {
        let n_samples = matrix.nrows();
        let n_features = matrix.ncols();
        // The sketch cannot usefully exceed the matrix rank budget.
        let l_sketch = (rank + N_OVERSAMPLES)
            .min(n_samples.min(n_features))
            .max(1);

        let normal =
            Normal::new(0.0, 1.0).map_err(|e| format!("Failed to create Normal distribution: {}", e))?;
        let omega = Array2::from_shape_fn((n_features, l_sketch), |_| self.rng.sample(normal));

        // Initial sketch: Y = M @ Omega, orthonormalized.
        let y = matrix.dot(&omega);
        let (mut q_basis, _) = y
            .qr()
            .map_err(|e| format!("QR decomposition of initial sketch failed: {}", e))?;

        // Power iterations refine the basis towards the dominant singular
        // vectors; each pass is re-orthonormalized for stability.
        for i in 0..self.iterated_power {
            let w = matrix.t().dot(&q_basis);
            let (w_ortho, _) = w
                .qr()
                .map_err(|e| format!("QR decomposition in power iteration {} failed: {}", i, e))?;
            let z = matrix.dot(&w_ortho);
            let (z_ortho, _) = z
                .qr()
                .map_err(|e| format!("QR decomposition in power iteration {} failed: {}", i, e))?;
            q_basis = z_ortho;
        }

        // Project onto the basis and decompose the small matrix exactly.
        let b_projected = q_basis.t().dot(matrix);
        let (_, singular_values, vt) = b_projected
            .svd_into(false, true)
            .map_err(|e| format!("SVD of projected sketch failed: {}", e))?;
        let vt = vt.ok_or("SVD of projected sketch did not return right-singular vectors.")?;

        let kept = rank.min(singular_values.len());
        let retained = singular_values.slice(s![..kept]).to_owned();

        // The sketch only sees an approximation, so the residual energy is
        // measured against the full matrix directly.
        let total_energy: f64 = matrix.iter().map(|v| v * v).sum();
        let retained_energy: f64 = retained.iter().map(|v| v * v).sum();

        Ok(TruncatedSvd {
            singular_values: retained,
            vt: vt.slice(s![..kept, ..]).to_owned(),
            unexplained_variance: total_energy - retained_energy,
        })
    }
}
