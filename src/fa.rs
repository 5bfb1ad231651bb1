// Factor analysis (FA) fitted by expectation-maximization

use log::warn;
use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::{Determinant, Inverse};
use serde::{Deserialize, Serialize};

use std::error::Error;
use std::f64::consts::PI;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::svd::{DecompositionBackend, ExactSvd, RandomizedSvd, SvdMethod};

/// Floor applied to noise variances so whitening and log terms stay finite.
const SMALL: f64 = 1e-12;

/// Factor analysis structure.
///
/// Observations are modeled as a linear transform of standard-normal latent
/// factors plus independent Gaussian noise with a per-feature (diagonal)
/// variance. `fit` estimates the loading matrix and the noise variances by
/// maximum likelihood using EM; afterwards the struct holds the fitted
/// parameters and supports projection onto the latent space (`transform`),
/// reconstruction of the implied observation covariance (`get_covariance`,
/// `get_precision`), per-row log-likelihood of new data (`score`), and
/// binary persistence (`save_model` / `load_model`).
#[derive(Serialize, Deserialize, Debug)]
pub struct FactorAnalysis {
    /// Target latent dimensionality. `None` means "use n_features".
    n_components: Option<usize>,
    /// Stopping tolerance on the per-iteration log-likelihood improvement.
    tol: f64,
    /// Iteration budget for the EM loop.
    max_iter: usize,
    /// Optional initial guess for the noise variances, length n_features.
    noise_variance_init: Option<Array1<f64>>,
    /// Which truncated-SVD strategy each EM iteration uses.
    svd_method: SvdMethod,
    /// Power-iteration refinement passes (randomized strategy only).
    iterated_power: usize,
    /// Seed for the sketching RNG (randomized strategy only).
    random_seed: u64,

    /// Mean vector of the training data, shape (n_features).
    mean: Option<Array1<f64>>,
    /// Loading matrix, shape (n_components, n_features).
    components: Option<Array2<f64>>,
    /// Estimated noise variance per feature, every entry >= `SMALL`.
    noise_variance: Option<Array1<f64>>,
    /// Log-likelihood recorded at each completed EM iteration.
    loglike: Vec<f64>,
    /// Number of EM iterations that actually ran.
    n_iter: usize,
    /// Whether the tolerance test was satisfied within the budget.
    converged: bool,
}

impl Default for FactorAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

impl FactorAnalysis {
    /// Creates an unfitted model with the default configuration:
    /// all features as components, tolerance `1e-2`, at most 1000
    /// iterations, all-ones initial noise variance, randomized SVD with
    /// 3 power-iteration passes and seed 0.
    ///
    /// # Examples
    ///
    /// ```
    /// use factor_analysis::FactorAnalysis;
    /// let fa = FactorAnalysis::new();
    /// ```
    pub fn new() -> Self {
        Self {
            n_components: None,
            tol: 1e-2,
            max_iter: 1000,
            noise_variance_init: None,
            svd_method: SvdMethod::Randomized,
            iterated_power: 3,
            random_seed: 0,
            mean: None,
            components: None,
            noise_variance: None,
            loglike: Vec::new(),
            n_iter: 0,
            converged: false,
        }
    }

    /// Sets the target latent dimensionality. Must be between 1 and
    /// n_features; validated when `fit` is called.
    pub fn with_n_components(mut self, n_components: usize) -> Self {
        self.n_components = Some(n_components);
        self
    }

    /// Sets the stopping tolerance for the EM loop.
    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    /// Sets the EM iteration budget.
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Supplies an initial guess for the per-feature noise variances.
    /// Its length must equal n_features of the data passed to `fit`.
    pub fn with_noise_variance_init(mut self, init: Array1<f64>) -> Self {
        self.noise_variance_init = Some(init);
        self
    }

    /// Selects the decomposition strategy used inside each EM iteration.
    pub fn with_svd_method(mut self, method: SvdMethod) -> Self {
        self.svd_method = method;
        self
    }

    /// Sets the number of power-iteration refinement passes for the
    /// randomized strategy.
    pub fn with_iterated_power(mut self, iterated_power: usize) -> Self {
        self.iterated_power = iterated_power;
        self
    }

    /// Sets the RNG seed for the randomized strategy.
    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    /// Creates a fitted instance from externally computed parameters.
    ///
    /// * `components` - loading matrix, shape (n_components, n_features).
    /// * `mean` - feature means of the original data, shape (n_features).
    /// * `noise_variance` - per-feature noise variances, shape (n_features).
    ///   Entries must be finite and non-negative; zeros are raised to the
    ///   internal floor so downstream inverses and logs stay defined.
    ///
    /// # Errors
    /// Returns an error if the feature dimensions disagree or if
    /// `noise_variance` contains non-finite or negative values.
    pub fn with_model(
        components: Array2<f64>,
        mean: Array1<f64>,
        noise_variance: Array1<f64>,
    ) -> Result<Self, Box<dyn Error>> {
        let n_features = components.ncols();
        if mean.len() != n_features || noise_variance.len() != n_features {
            return Err(format!(
                "Feature dimensions of components ({}), mean ({}), and noise_variance ({}) must match.",
                n_features,
                mean.len(),
                noise_variance.len()
            )
            .into());
        }
        if noise_variance.iter().any(|&v| !v.is_finite() || v < 0.0) {
            return Err(
                "noise_variance contains non-finite or negative values.".into(),
            );
        }

        let mut model = Self::new();
        model.n_components = Some(components.nrows());
        model.mean = Some(mean);
        model.components = Some(components);
        model.noise_variance = Some(noise_variance.mapv(|v| v.max(SMALL)));
        model.converged = true;
        Ok(model)
    }

    /// Returns the feature mean vector of the training data, if fitted.
    pub fn mean(&self) -> Option<&Array1<f64>> {
        self.mean.as_ref()
    }

    /// Returns the loading matrix, shape (n_components, n_features), if fitted.
    pub fn components(&self) -> Option<&Array2<f64>> {
        self.components.as_ref()
    }

    /// Returns the estimated per-feature noise variances, if fitted.
    pub fn noise_variance(&self) -> Option<&Array1<f64>> {
        self.noise_variance.as_ref()
    }

    /// Returns the log-likelihood recorded at each completed EM iteration.
    pub fn loglike(&self) -> &[f64] {
        &self.loglike
    }

    /// Returns how many EM iterations the last fit ran.
    pub fn n_iter(&self) -> usize {
        self.n_iter
    }

    /// Returns whether the last fit satisfied the tolerance test within the
    /// iteration budget. A `false` after a successful `fit` means the budget
    /// was exhausted; the stored parameters are still the best EM estimate.
    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Fits the model to `x` (n_samples x n_features) with EM.
    ///
    /// The matrix is consumed and centered in place; clone it first if the
    /// original values are still needed. Each iteration whitens the centered
    /// data by the current noise estimate, takes a truncated SVD, rebuilds
    /// the loading matrix from the retained spectrum, and updates the noise
    /// variances. The loop stops as soon as the log-likelihood improvement
    /// falls below the tolerance; that includes a likelihood decrease, which
    /// the rank-truncated update can produce.
    ///
    /// Exhausting the iteration budget is not an error: a warning is logged,
    /// `converged()` reports `false`, and the last estimate is kept.
    ///
    /// # Errors
    /// Returns an error on empty input, fewer than 2 samples, a zero
    /// iteration budget, a component count of 0 or above n_features, or a
    /// `noise_variance_init` whose length differs from n_features.
    ///
    /// # Examples
    ///
    /// ```
    /// use ndarray::array;
    /// use factor_analysis::FactorAnalysis;
    ///
    /// let x = array![[1.0, 2.1], [2.0, 4.2], [3.1, 5.8], [4.0, 8.3]];
    /// let mut fa = FactorAnalysis::new().with_n_components(1);
    /// fa.fit(x).unwrap();
    /// assert_eq!(fa.components().unwrap().dim(), (1, 2));
    /// ```
    pub fn fit(&mut self, mut x: Array2<f64>) -> Result<(), Box<dyn Error>> {
        let n_samples = x.nrows();
        let n_features = x.ncols();

        if n_samples == 0 || n_features == 0 {
            return Err("Input matrix has zero samples or zero features.".into());
        }
        if n_samples < 2 {
            return Err("Input matrix must have at least 2 samples.".into());
        }
        if self.max_iter == 0 {
            return Err("max_iter must be at least 1.".into());
        }
        let n_components = match self.n_components {
            None => n_features,
            Some(0) => return Err("n_components must be at least 1.".into()),
            Some(k) if k > n_features => {
                return Err(format!(
                    "n_components ({}) cannot exceed the number of features ({}).",
                    k, n_features
                )
                .into())
            }
            Some(k) => k,
        };

        let mean = x
            .mean_axis(Axis(0))
            .ok_or("Failed to compute mean of the data.")?;
        x -= &mean;

        let llconst = n_features as f64 * (2.0 * PI).ln() + n_components as f64;
        let var = x.var_axis(Axis(0), 0.0);

        let mut psi = match &self.noise_variance_init {
            None => Array1::ones(n_features),
            Some(init) => {
                if init.len() != n_features {
                    return Err(format!(
                        "noise_variance_init dimension does not match number of features: {} != {}",
                        init.len(),
                        n_features
                    )
                    .into());
                }
                if init.iter().any(|&v| !v.is_finite() || v < 0.0) {
                    return Err(
                        "noise_variance_init contains non-finite or negative values.".into(),
                    );
                }
                init.mapv(|v| v.max(SMALL))
            }
        };

        let mut backend: Box<dyn DecompositionBackend> = match self.svd_method {
            SvdMethod::Lapack => Box::new(ExactSvd),
            SvdMethod::Randomized => {
                Box::new(RandomizedSvd::new(self.iterated_power, self.random_seed))
            }
        };

        let mut loglike = Vec::new();
        let mut old_ll = f64::NEG_INFINITY;
        let mut components: Option<Array2<f64>> = None;
        let mut converged = false;

        for _ in 0..self.max_iter {
            let (w, ll) = em_step(&x, &psi, n_components, llconst, backend.as_mut())?;
            loglike.push(ll);
            if ll - old_ll < self.tol {
                components = Some(w);
                converged = true;
                break;
            }
            old_ll = ll;

            // M-step for psi: residual per-feature variance, floored.
            let explained = w.mapv(|v| v * v).sum_axis(Axis(0));
            psi = (&var - &explained).mapv(|v| v.max(SMALL));
            components = Some(w);
        }

        if !converged {
            warn!(
                "Factor analysis did not converge within {} iterations; \
                 keeping the last EM estimate. Consider raising max_iter or tol.",
                self.max_iter
            );
        }

        self.n_iter = loglike.len();
        self.mean = Some(mean);
        self.components = components;
        self.noise_variance = Some(psi);
        self.loglike = loglike;
        self.converged = converged;
        Ok(())
    }

    /// Projects `x` onto the latent space: the posterior mean of the factors
    /// given each observed row under the fitted generative model.
    ///
    /// The matrix is consumed and centered in place. The result has shape
    /// (n_samples, n_components).
    ///
    /// # Errors
    /// Returns an error if the model is not fitted, if the feature dimension
    /// of `x` disagrees with the model, or if the latent posterior covariance
    /// cannot be inverted.
    pub fn transform(&self, mut x: Array2<f64>) -> Result<Array2<f64>, Box<dyn Error>> {
        let (components, mean, psi) = self.fitted()?;
        self.check_features(x.ncols())?;

        x -= mean;

        // Wpsi = W / psi, column-scaled by the inverse noise variances.
        let wpsi = components / psi;
        let identity = Array2::<f64>::eye(components.nrows());
        let cov_z = (identity + wpsi.dot(&components.t()))
            .inv()
            .map_err(|e| format!("Failed to invert latent posterior covariance: {}", e))?;

        Ok(x.dot(&wpsi.t()).dot(&cov_z))
    }

    /// Reconstructs the observation covariance implied by the fitted model:
    /// `W^T W + diag(psi)`, shape (n_features, n_features).
    ///
    /// # Errors
    /// Returns an error if the model is not fitted.
    pub fn get_covariance(&self) -> Result<Array2<f64>, Box<dyn Error>> {
        let (components, _, psi) = self.fitted()?;
        let mut cov = components.t().dot(components);
        let mut diag = cov.diag_mut();
        diag += psi;
        Ok(cov)
    }

    /// Computes the precision matrix, the inverse of `get_covariance`.
    /// `score` goes through this; it is exposed separately so callers can
    /// reuse the inverse across repeated scoring.
    ///
    /// # Errors
    /// Returns an error if the model is not fitted or the covariance is
    /// singular.
    pub fn get_precision(&self) -> Result<Array2<f64>, Box<dyn Error>> {
        self.get_covariance()?
            .inv()
            .map_err(|e| format!("Failed to invert model covariance: {}", e).into())
    }

    /// Computes the log-likelihood of each row of `x` under the fitted
    /// model, as a length-n_samples vector.
    ///
    /// # Errors
    /// Returns an error if the model is not fitted, if the feature dimension
    /// of `x` disagrees with the model, or if the model covariance is
    /// singular.
    pub fn score(&self, mut x: Array2<f64>) -> Result<Array1<f64>, Box<dyn Error>> {
        let (_, mean, _) = self.fitted()?;
        self.check_features(x.ncols())?;
        let n_features = mean.len();

        x -= mean;
        let cov = self.get_covariance()?;
        let precision = cov
            .inv()
            .map_err(|e| format!("Failed to invert model covariance: {}", e))?;
        let (_, log_det) = cov
            .sln_det()
            .map_err(|e| format!("Failed to compute covariance log-determinant: {}", e))?;

        let quadratic = (&x * &x.dot(&precision)).sum_axis(Axis(1));
        let norm_term = log_det + n_features as f64 * (2.0 * PI).ln();
        Ok(quadratic.mapv(|q| -0.5 * (q + norm_term)))
    }

    /// Saves the fitted model to a file using bincode.
    ///
    /// # Errors
    /// Returns an error if the model is not fitted, or if file I/O or
    /// serialization fails.
    pub fn save_model<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn Error>> {
        self.fitted()?;
        let file = File::create(path.as_ref())
            .map_err(|e| format!("Failed to create file at {:?}: {}", path.as_ref(), e))?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| format!("Failed to serialize factor analysis model: {}", e))?;
        Ok(())
    }

    /// Loads a model previously saved with `save_model`, validating that the
    /// stored parameters are complete and dimensionally consistent.
    ///
    /// # Errors
    /// Returns an error if file I/O or deserialization fails, or if the
    /// loaded parameters are missing, mismatched, or contain invalid noise
    /// variances.
    pub fn load_model<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn Error>> {
        let file = File::open(path.as_ref())
            .map_err(|e| format!("Failed to open file at {:?}: {}", path.as_ref(), e))?;
        let mut reader = BufReader::new(file);
        let model: FactorAnalysis =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                .map_err(|e| format!("Failed to deserialize factor analysis model: {}", e))?;

        let (components, mean, psi) = model.fitted().map_err(|_| {
            "Loaded model is missing fitted parameters (components, mean, or noise variance)."
        })?;
        let n_features = components.ncols();
        if mean.len() != n_features || psi.len() != n_features {
            return Err(format!(
                "Loaded model has inconsistent feature dimensions: components={}, mean={}, noise_variance={}",
                n_features,
                mean.len(),
                psi.len()
            )
            .into());
        }
        if psi.iter().any(|&v| !v.is_finite() || v <= 0.0) {
            return Err(
                "Loaded model's noise variances contain non-finite, zero, or negative values."
                    .into(),
            );
        }
        Ok(model)
    }

    fn fitted(&self) -> Result<(&Array2<f64>, &Array1<f64>, &Array1<f64>), Box<dyn Error>> {
        match (&self.components, &self.mean, &self.noise_variance) {
            (Some(w), Some(m), Some(p)) => Ok((w, m, p)),
            _ => Err("Factor analysis model has not been fitted yet.".into()),
        }
    }

    fn check_features(&self, n_input_features: usize) -> Result<(), Box<dyn Error>> {
        let n_model_features = self.mean.as_ref().map_or(0, |m| m.len());
        if n_input_features != n_model_features {
            return Err(format!(
                "Input data feature dimension ({}) does not match model's feature dimension ({}).",
                n_input_features, n_model_features
            )
            .into());
        }
        Ok(())
    }
}

/// One EM iteration on already-centered data with the current noise
/// estimate: whiten, decompose, rebuild the loading matrix, and evaluate
/// the marginal log-likelihood. State is threaded explicitly so a single
/// step can be exercised in isolation.
fn em_step(
    centered: &Array2<f64>,
    psi: &Array1<f64>,
    n_components: usize,
    llconst: f64,
    backend: &mut dyn DecompositionBackend,
) -> Result<(Array2<f64>, f64), Box<dyn Error>> {
    let n_samples = centered.nrows() as f64;

    // SMALL keeps the division defined for floored variances.
    let sqrt_psi = psi.mapv(f64::sqrt) + SMALL;
    let whitening = &sqrt_psi * n_samples.sqrt();
    let whitened = centered / &whitening;

    let svd = backend.truncated_svd(&whitened, n_components)?;
    let s2 = svd.singular_values.mapv(|v| v * v);

    // Closed-form M-step for W: scale each retained direction by
    // sqrt(max(s^2 - 1, 0)), then undo the whitening per feature.
    let mut loadings = svd.vt;
    for (mut row, &s) in loadings.rows_mut().into_iter().zip(s2.iter()) {
        let gain = (s - 1.0).max(0.0).sqrt();
        row.mapv_inplace(|v| v * gain);
    }
    loadings *= &sqrt_psi;

    // Gaussian marginal log-likelihood in the whitened frame; avoids the
    // explicit n_features x n_features inversion.
    let ll = -(n_samples / 2.0)
        * (llconst
            + s2.mapv(f64::ln).sum()
            + svd.unexplained_variance
            + psi.mapv(f64::ln).sum());

    Ok((loadings, ll))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn zero_components_is_rejected() {
        let x = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let mut fa = FactorAnalysis::new().with_n_components(0);
        assert!(fa.fit(x).is_err());
    }

    #[test]
    fn more_components_than_features_is_rejected() {
        let x = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let mut fa = FactorAnalysis::new().with_n_components(3);
        assert!(fa.fit(x).is_err());
    }

    #[test]
    fn wrong_length_noise_variance_init_is_rejected() {
        let x = array![
            [1.0, 2.0, 0.5, 1.5, 0.2],
            [3.0, 4.0, 0.1, 1.1, 0.9],
            [5.0, 6.0, 0.7, 1.9, 0.4],
        ];
        let mut fa = FactorAnalysis::new()
            .with_n_components(2)
            .with_noise_variance_init(array![1.0, 1.0, 1.0]);
        let err = fa.fit(x).unwrap_err();
        assert!(err.to_string().contains("noise_variance_init"));
    }

    #[test]
    fn single_sample_is_rejected() {
        let x = array![[1.0, 2.0]];
        let mut fa = FactorAnalysis::new();
        assert!(fa.fit(x).is_err());
    }

    #[test]
    fn zero_iteration_budget_is_rejected() {
        let x = array![[1.0, 2.0], [3.0, 4.0]];
        let mut fa = FactorAnalysis::new().with_max_iter(0);
        assert!(fa.fit(x).is_err());
    }

    #[test]
    fn inference_before_fit_fails() {
        let fa = FactorAnalysis::new();
        assert!(fa.transform(array![[1.0, 2.0]]).is_err());
        assert!(fa.get_covariance().is_err());
        assert!(fa.get_precision().is_err());
        assert!(fa.score(array![[1.0, 2.0]]).is_err());
    }

    #[test]
    fn transform_checks_feature_dimension() {
        let x = array![[1.0, 2.0, 3.0], [2.0, 4.1, 5.9], [3.2, 6.0, 9.1], [4.0, 7.9, 12.2]];
        let mut fa = FactorAnalysis::new().with_n_components(1);
        fa.fit(x).unwrap();
        assert!(fa.transform(array![[1.0, 2.0]]).is_err());
    }

    #[test]
    fn em_step_produces_expected_shapes_and_finite_likelihood() {
        let x = array![
            [1.0, -0.5, 0.3],
            [-1.2, 0.8, -0.1],
            [0.4, -1.1, 0.9],
            [-0.2, 0.7, -1.3],
        ];
        let mean = x.mean_axis(Axis(0)).unwrap();
        let centered = x - &mean;
        let psi = Array1::ones(3);
        let llconst = 3.0 * (2.0 * PI).ln() + 2.0;

        let mut backend = ExactSvd;
        let (w, ll) = em_step(&centered, &psi, 2, llconst, &mut backend).unwrap();
        assert_eq!(w.dim(), (2, 3));
        assert!(ll.is_finite());
    }

    #[test]
    fn with_model_score_matches_hand_computed_density() {
        // Scalar model: cov = 0.8^2 + 0.5 = 1.14.
        let fa = FactorAnalysis::with_model(array![[0.8]], array![2.0], array![0.5]).unwrap();

        let scores = fa.score(array![[2.5]]).unwrap();
        let cov = 0.8_f64 * 0.8 + 0.5;
        let expected = -0.5 * ((0.5_f64 * 0.5) / cov + cov.ln() + (2.0 * PI).ln());
        assert_abs_diff_eq!(scores[0], expected, epsilon = 1e-12);
    }

    #[test]
    fn with_model_validates_dimensions_and_values() {
        assert!(FactorAnalysis::with_model(
            array![[0.8, 0.1]],
            array![2.0],
            array![0.5, 0.5]
        )
        .is_err());
        assert!(FactorAnalysis::with_model(
            array![[0.8]],
            array![2.0],
            array![f64::NAN]
        )
        .is_err());
        assert!(FactorAnalysis::with_model(array![[0.8]], array![2.0], array![-0.1]).is_err());
    }

    #[test]
    fn model_round_trips_through_save_and_load() {
        let x = array![
            [1.0, 2.0, 3.0],
            [2.0, 4.1, 5.9],
            [3.2, 6.0, 9.1],
            [4.0, 7.9, 12.2],
            [5.1, 9.8, 15.0],
        ];
        let mut fa = FactorAnalysis::new().with_n_components(2);
        fa.fit(x).unwrap();

        let file = tempfile::NamedTempFile::new().unwrap();
        fa.save_model(file.path()).unwrap();
        let loaded = FactorAnalysis::load_model(file.path()).unwrap();

        assert_eq!(fa.components().unwrap(), loaded.components().unwrap());
        assert_eq!(fa.mean().unwrap(), loaded.mean().unwrap());
        assert_eq!(fa.noise_variance().unwrap(), loaded.noise_variance().unwrap());
        assert_eq!(fa.loglike(), loaded.loglike());
    }

    #[test]
    fn saving_an_unfitted_model_fails() {
        let fa = FactorAnalysis::new();
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(fa.save_model(file.path()).is_err());
    }
}
