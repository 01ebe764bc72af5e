use super::{derivatives, evolution::EvolutionStep, Akaze};
use crate::image::GrayFloatImage;
use ndarray::azip;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

impl Akaze {
    /// Scale of the derivative filters of an evolution, in pixels of its octave.
    fn sigma_size(&self, evolution: &EvolutionStep) -> u32 {
        f64::round(evolution.esigma * self.derivative_factor / f64::from(evolution.ratio())) as u32
    }

    fn compute_multiscale_derivatives(&self, evolutions: &mut [EvolutionStep]) {
        let process_evolution = |evolution: &mut EvolutionStep| {
            let sigma_size = self.sigma_size(evolution);
            compute_multiscale_derivatives_for_evolution(evolution, sigma_size);
        };
        #[cfg(not(feature = "rayon"))]
        for evolution in evolutions.iter_mut() {
            process_evolution(evolution);
        }
        #[cfg(feature = "rayon")]
        evolutions.into_par_iter().for_each(|evolution| {
            process_evolution(evolution);
        });
    }

    /// Compute the detector response, the scale normalized determinant of the
    /// Hessian, and save it in the evolutions.
    #[allow(non_snake_case, clippy::suspicious_operation_groupings)]
    pub fn detector_response(&self, evolutions: &mut [EvolutionStep]) {
        self.compute_multiscale_derivatives(evolutions);
        let process_evolution = |evolution: &mut EvolutionStep| {
            let sigma_size_quat = (self.sigma_size(evolution) as f32).powi(4);
            let mut Ldet = evolution.Lxx.zero_array();
            azip!((
                Ldet in &mut Ldet,
                &Lxx in &evolution.Lxx.0,
                &Lyy in &evolution.Lyy.0,
                &Lxy in &evolution.Lxy.0,
            ) {
                *Ldet = (Lxx * Lyy - Lxy * Lxy) * sigma_size_quat;
            });
            evolution.Ldet = GrayFloatImage::from_array2(Ldet);
        };
        #[cfg(not(feature = "rayon"))]
        for evolution in evolutions.iter_mut() {
            process_evolution(evolution);
        }
        #[cfg(feature = "rayon")]
        evolutions.into_par_iter().for_each(|evolution| {
            process_evolution(evolution);
        });
    }
}

fn compute_multiscale_derivatives_for_evolution(evolution: &mut EvolutionStep, sigma_size: u32) {
    #[cfg(not(feature = "rayon"))]
    {
        evolution.Lx = derivatives::scharr_horizontal(&evolution.Lsmooth, sigma_size);
        evolution.Ly = derivatives::scharr_vertical(&evolution.Lsmooth, sigma_size);
        evolution.Lxx = derivatives::scharr_horizontal(&evolution.Lx, sigma_size);
        evolution.Lyy = derivatives::scharr_vertical(&evolution.Ly, sigma_size);
        evolution.Lxy = derivatives::scharr_vertical(&evolution.Lx, sigma_size);
    }
    #[cfg(feature = "rayon")]
    {
        (evolution.Lx, evolution.Ly) = rayon::join(
            || derivatives::scharr_horizontal(&evolution.Lsmooth, sigma_size),
            || derivatives::scharr_vertical(&evolution.Lsmooth, sigma_size),
        );
        (evolution.Lxx, (evolution.Lyy, evolution.Lxy)) = rayon::join(
            || derivatives::scharr_horizontal(&evolution.Lx, sigma_size),
            || {
                rayon::join(
                    || derivatives::scharr_vertical(&evolution.Ly, sigma_size),
                    || derivatives::scharr_vertical(&evolution.Lx, sigma_size),
                )
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn blob_center_has_positive_response() {
        let akaze = Akaze::default();
        let mut evolutions = akaze.allocate_evolutions(100, 100);
        let blob = GrayFloatImage(Array2::from_shape_fn((100, 100), |(y, x)| {
            let d2 = (x as f32 - 50.0).powi(2) + (y as f32 - 50.0).powi(2);
            (-d2 / 32.0).exp()
        }));
        for evolution in evolutions.iter_mut() {
            evolution.Lsmooth = blob.clone();
        }
        akaze.detector_response(&mut evolutions);
        for evolution in &evolutions {
            let center = evolution.Ldet.get(50, 50);
            assert!(center > 0.0);
            assert!(center > evolution.Ldet.get(60, 50));
        }
    }
}
