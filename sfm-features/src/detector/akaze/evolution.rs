use super::{fed_tau, Akaze};
use crate::image::GrayFloatImage;
use log::*;

/// Smallest image side at which an octave is still worth processing.
const MIN_OCTAVE_SIZE: usize = 40;
/// Below this side length an octave gets a single sublevel.
const FULL_OCTAVE_SIZE: usize = 80;

#[derive(Debug)]
#[allow(non_snake_case)]
pub struct EvolutionStep {
    /// Evolution time
    pub etime: f64,
    /// Evolution sigma. For linear diffusion t = sigma^2 / 2
    pub esigma: f64,
    /// Image octave
    pub octave: u32,
    /// Image sublevel in each octave
    pub sublevel: u32,
    /// Evolution image
    pub Lt: GrayFloatImage,
    /// Smoothed image
    pub Lsmooth: GrayFloatImage,
    /// First order spatial derivatives
    pub Lx: GrayFloatImage,
    pub Ly: GrayFloatImage,
    /// Second order spatial derivatives
    pub Lxx: GrayFloatImage,
    pub Lyy: GrayFloatImage,
    pub Lxy: GrayFloatImage,
    /// Diffusivity image
    pub Lflow: GrayFloatImage,
    /// Detector response
    pub Ldet: GrayFloatImage,
    /// Explicit diffusion steps leading from the previous evolution to this one
    pub fed_tau_steps: Vec<f64>,
}

impl EvolutionStep {
    fn new(octave: u32, sublevel: u32, options: &Akaze) -> EvolutionStep {
        let esigma = options.base_scale_offset
            * f64::powf(
                2.0f64,
                f64::from(sublevel) / f64::from(options.num_sublevels) + f64::from(octave),
            );
        EvolutionStep {
            etime: 0.5 * (esigma * esigma),
            esigma,
            octave,
            sublevel,
            Lt: GrayFloatImage::new(0, 0),
            Lsmooth: GrayFloatImage::new(0, 0),
            Lx: GrayFloatImage::new(0, 0),
            Ly: GrayFloatImage::new(0, 0),
            Lxx: GrayFloatImage::new(0, 0),
            Lyy: GrayFloatImage::new(0, 0),
            Lxy: GrayFloatImage::new(0, 0),
            Lflow: GrayFloatImage::new(0, 0),
            Ldet: GrayFloatImage::new(0, 0),
            fed_tau_steps: vec![],
        }
    }

    /// Size of a pixel of this evolution in input pixels.
    pub fn ratio(&self) -> f32 {
        (1u32 << self.octave) as f32
    }
}

impl Akaze {
    /// Lay out the evolutions of the scale space for an image of the given size.
    ///
    /// Octaves stop once the smaller side drops under 40 pixels, and small octaves
    /// get a single sublevel. The result is empty for images that are too small.
    pub fn allocate_evolutions(&self, width: usize, height: usize) -> Vec<EvolutionStep> {
        let mut evolutions: Vec<EvolutionStep> = (0..self.max_octave_evolution)
            .map_while(|octave| {
                let smallest_dim = width.min(height) >> octave;
                if smallest_dim < MIN_OCTAVE_SIZE {
                    return None;
                }
                let sublevels = if smallest_dim < FULL_OCTAVE_SIZE {
                    1
                } else {
                    self.num_sublevels
                };
                Some((0..sublevels).map(move |sublevel| EvolutionStep::new(octave, sublevel, self)))
            })
            .flatten()
            .collect();
        for i in 1..evolutions.len() {
            let ttime = evolutions[i].etime - evolutions[i - 1].etime;
            evolutions[i].fed_tau_steps = fed_tau::fed_tau_by_process_time(ttime, 1, 0.25, true);
            trace!(
                "{} steps in evolution {}.",
                evolutions[i].fed_tau_steps.len(),
                i
            );
        }
        evolutions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_images_have_no_evolutions() {
        assert!(Akaze::default().allocate_evolutions(30, 200).is_empty());
    }

    #[test]
    fn evolutions_follow_octaves() {
        let evolutions = Akaze::default().allocate_evolutions(200, 100);
        // 100 -> 4 sublevels, 50 -> 1 sublevel, 25 stops.
        assert_eq!(evolutions.len(), 5);
        assert_eq!(evolutions[4].octave, 1);
        assert!(evolutions.windows(2).all(|w| w[1].esigma > w[0].esigma));
        assert!(evolutions[0].fed_tau_steps.is_empty());
        assert!(!evolutions[1].fed_tau_steps.is_empty());
    }
}
