//! Fast Explicit Diffusion step sizes.
//!
//! FED takes cycles of explicit diffusion steps with varying step sizes. Early steps
//! exceed the stability limit of a single explicit step, later ones are small, and
//! a full cycle remains stable. See Grewenig, Weickert and Bruhn, "From box
//! filtering to fast explicit diffusion", DAGM 2010.

use std::f64::consts::PI;

/// Step sizes of `cycles` equal cycles reaching the total diffusion `time`.
///
/// `tau_max` is the stability limit of the explicit scheme. With `reordering`, the
/// steps are permuted with a kappa cycle to limit the growth of rounding errors.
pub fn fed_tau_by_process_time(time: f64, cycles: u32, tau_max: f64, reordering: bool) -> Vec<f64> {
    fed_tau_by_cycle_time(time / f64::from(cycles.max(1)), tau_max, reordering)
}

/// Least number of steps reaching the cycle `time`, with their sizes.
fn fed_tau_by_cycle_time(time: f64, tau_max: f64, reordering: bool) -> Vec<f64> {
    let n = (f64::ceil(f64::sqrt(3.0 * time / tau_max + 0.25) - 0.5 - 1.0e-8) + 0.5) as usize;
    if n == 0 {
        return vec![];
    }
    let scale = 3.0 * time / (tau_max * ((n * (n + 1)) as f64));
    let c = 1.0 / (4.0 * n as f64 + 2.0);
    let d = scale * tau_max / 2.0;
    let steps: Vec<f64> = (0..n)
        .map(|k| {
            let h = f64::cos(PI * (2.0 * k as f64 + 1.0) * c);
            d / (h * h)
        })
        .collect();
    if reordering && n > 1 {
        kappa_cycle(&steps)
    } else {
        steps
    }
}

/// Permute steps with the kappa cycle `kappa = n / 2` modulo the next prime above `n`.
fn kappa_cycle(steps: &[f64]) -> Vec<f64> {
    let n = steps.len();
    let kappa = n / 2;
    let prime = (n + 1..)
        .find(|&p| primal::is_prime(p as u64))
        .unwrap_or(n + 1);
    // Multiples of kappa modulo the prime visit every residue once.
    (1..prime)
        .map(|k| (k * kappa) % prime)
        .filter(|&residue| residue >= 1 && residue <= n)
        .map(|residue| steps[residue - 1])
        .take(n)
        .collect()
}
