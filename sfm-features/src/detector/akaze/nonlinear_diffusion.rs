use super::evolution::EvolutionStep;
use crate::image::GrayFloatImage;
use ndarray::{azip, s, Array2};

/// Perform one explicit nonlinear diffusion step on `Lt`, using `Lflow` as the
/// conductivity.
///
/// Forward Euler scheme on a 3x3 stencil:
/// dL/dt = d(c dL/dx)/dx + d(c dL/dy)/dy
#[allow(non_snake_case)]
pub fn calculate_step(evolution_step: &mut EvolutionStep, step_size: f32) {
    let conductivities = &evolution_step.Lflow;
    let input = &mut evolution_step.Lt;
    let (height, width) = input.dim();
    if height < 2 || width < 2 {
        return;
    }
    let mut horizontal_flow = Array2::<f32>::zeros((height, width - 1));
    azip!((
        flow in &mut horizontal_flow,
        &a in input.slice(s![.., ..-1]),
        &b in input.slice(s![.., 1..]),
        &ca in conductivities.slice(s![.., ..-1]),
        &cb in conductivities.slice(s![.., 1..]),
    ) {
        *flow = 0.5 * step_size * (ca + cb) * (b - a);
    });
    let mut vertical_flow = Array2::<f32>::zeros((height - 1, width));
    azip!((
        flow in &mut vertical_flow,
        &a in input.slice(s![..-1, ..]),
        &b in input.slice(s![1.., ..]),
        &ca in conductivities.slice(s![..-1, ..]),
        &cb in conductivities.slice(s![1.., ..]),
    ) {
        *flow = 0.5 * step_size * (ca + cb) * (b - a);
    });

    input
        .slice_mut(s![.., ..-1])
        .zip_mut_with(&horizontal_flow, |acc, &i| *acc += i);
    input
        .slice_mut(s![.., 1..])
        .zip_mut_with(&horizontal_flow, |acc, &i| *acc -= i);
    input
        .slice_mut(s![..-1, ..])
        .zip_mut_with(&vertical_flow, |acc, &i| *acc += i);
    input
        .slice_mut(s![1.., ..])
        .zip_mut_with(&vertical_flow, |acc, &i| *acc -= i);
}

/// Perona and Malik conductivity g2 = 1 / (1 + |grad L|^2 / k^2).
///
/// Preserves wide regions over small ones.
#[allow(non_snake_case)]
pub fn pm_g2(Lx: &GrayFloatImage, Ly: &GrayFloatImage, k: f64) -> GrayFloatImage {
    debug_assert_eq!(Lx.dim(), Ly.dim());
    let inverse_k = (1.0f64 / (k * k)) as f32;
    let mut conductivities = Lx.zero_array();
    azip!((
        c in &mut conductivities,
        &x in &Lx.0,
        &y in &Ly.0,
    ) {
        *c = 1.0 / (1.0 + inverse_k * (x * x + y * y));
    });
    GrayFloatImage::from_array2(conductivities)
}
