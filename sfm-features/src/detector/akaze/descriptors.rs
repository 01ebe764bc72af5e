use super::{evolution::EvolutionStep, Akaze, KeyPoint};
use crate::config::AkazeDescriptor;
use crate::detector::msurf::{self, SurfLayout};
use crate::features_data::Descriptors;
use bitarray::BitArray;
use ndarray::Array2;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Number of M-LDB comparisons per channel over the 2x2, 3x3 and 4x4 grids.
const MLDB_BITS_PER_CHANNEL: usize = 6 + 36 + 120;

impl Akaze {
    /// Number of bits of the M-LDB descriptors this detector produces.
    pub fn mldb_bits(&self) -> usize {
        let total = MLDB_BITS_PER_CHANNEL * self.descriptor_channels;
        if self.descriptor_size > 0 && self.descriptor_size < total {
            self.descriptor_size
        } else {
            total
        }
    }

    /// Extract descriptors for the keypoints from the evolutions.
    ///
    /// Keypoints whose descriptor support leaves the image are dropped; the
    /// returned keypoints match the descriptor rows.
    pub fn extract_descriptors(
        &self,
        evolutions: &[EvolutionStep],
        keypoints: &[KeyPoint],
    ) -> (Vec<KeyPoint>, Descriptors) {
        match self.descriptor {
            AkazeDescriptor::Mldb | AkazeDescriptor::MldbUpright => {
                let nbytes = (self.mldb_bits() + 7) / 8;
                let described = describe_all(keypoints, |keypoint| {
                    self.get_mldb_descriptor(keypoint, evolutions)
                });
                let (keypoints, rows): (Vec<KeyPoint>, Vec<Vec<u8>>) = described
                    .into_iter()
                    .map(|(keypoint, bits)| (keypoint, bits.bytes()[..nbytes].to_vec()))
                    .unzip();
                let descriptors = Array2::from_shape_fn((rows.len(), nbytes), |(i, j)| rows[i][j]);
                (keypoints, Descriptors::Byte(descriptors))
            }
            _ => {
                let layout = match self.descriptor {
                    AkazeDescriptor::Surf | AkazeDescriptor::SurfUpright => SurfLayout::Surf,
                    _ => SurfLayout::Msurf,
                };
                let described = describe_all(keypoints, |keypoint| {
                    Some(get_surf_descriptor(layout, keypoint, evolutions))
                });
                let (keypoints, rows): (Vec<KeyPoint>, Vec<[f32; msurf::DESCRIPTOR_SIZE]>) =
                    described.into_iter().unzip();
                let shape = (rows.len(), msurf::DESCRIPTOR_SIZE);
                let descriptors = Array2::from_shape_fn(shape, |(i, j)| rows[i][j]);
                (keypoints, Descriptors::Float(descriptors))
            }
        }
    }

    /// Computes the M-LDB binary descriptor of a keypoint at its orientation.
    ///
    /// Returns `None` when a sample falls outside the evolution.
    fn get_mldb_descriptor(
        &self,
        keypoint: &KeyPoint,
        evolutions: &[EvolutionStep],
    ) -> Option<BitArray<64>> {
        let mut output = BitArray::zeros();
        let channels = self.descriptor_channels.clamp(1, 3);
        let mut values: Vec<f32> = vec![0f32; 16 * channels];
        let size_mult = [1.0f32, 2.0f32 / 3.0f32, 1.0f32 / 2.0f32];

        let evolution = &evolutions[keypoint.class_id];
        let ratio = evolution.ratio();
        let scale = f32::round(0.5f32 * keypoint.size / ratio);
        let sample = MldbSample {
            xf: keypoint.point.0 / ratio,
            yf: keypoint.point.1 / ratio,
            co: f32::cos(keypoint.angle),
            si: f32::sin(keypoint.angle),
            scale,
        };
        let pattern_size = self.descriptor_pattern_size as f32;
        let nbits = self.mldb_bits();

        let mut dpos = 0usize;
        for (lvl, multiplier) in size_mult.iter().enumerate() {
            let val_count = (lvl + 2usize) * (lvl + 2usize);
            let sample_step = f32::ceil(pattern_size * multiplier) as usize;
            self.mldb_fill_values(&mut values, sample_step, channels, &sample, evolution)?;
            mldb_binary_comparisons(
                &values,
                output.bytes_mut(),
                val_count,
                &mut dpos,
                channels,
                nbits,
            );
        }
        Some(output)
    }

    /// Fill the comparison values for one grid of the M-LDB descriptor.
    fn mldb_fill_values(
        &self,
        values: &mut [f32],
        sample_step: usize,
        channels: usize,
        sample: &MldbSample,
        evolution: &EvolutionStep,
    ) -> Option<()> {
        let pattern_size = self.descriptor_pattern_size as i32;
        let MldbSample { xf, yf, co, si, scale } = *sample;
        let mut valuepos = 0;
        for i in (-pattern_size..pattern_size).step_by(sample_step) {
            for j in (-pattern_size..pattern_size).step_by(sample_step) {
                let mut di = 0f32;
                let mut dx = 0f32;
                let mut dy = 0f32;
                let mut nsamples = 0usize;
                for k in i..(i + sample_step as i32) {
                    for l in j..(j + sample_step as i32) {
                        let (l, k) = (l as f32, k as f32);
                        let sample_y = yf + (l * co * scale + k * si * scale);
                        let sample_x = xf + (-l * si * scale + k * co * scale);
                        let y1 = f32::round(sample_y) as isize;
                        let x1 = f32::round(sample_x) as isize;
                        if !(0..evolution.Lt.width() as isize).contains(&x1)
                            || !(0..evolution.Lt.height() as isize).contains(&y1)
                        {
                            return None;
                        }
                        let (x1, y1) = (x1 as usize, y1 as usize);
                        di += evolution.Lt.get(x1, y1);
                        if channels > 1 {
                            let rx = evolution.Lx.get(x1, y1);
                            let ry = evolution.Ly.get(x1, y1);
                            if channels == 2 {
                                dx += f32::sqrt(rx * rx + ry * ry);
                            } else {
                                dx += -rx * si + ry * co;
                                dy += rx * co + ry * si;
                            }
                        }
                        nsamples += 1;
                    }
                }
                let n = nsamples as f32;
                values[valuepos] = di / n;
                if channels > 1 {
                    values[valuepos + 1] = dx / n;
                }
                if channels > 2 {
                    values[valuepos + 2] = dy / n;
                }
                valuepos += channels;
            }
        }
        Some(())
    }
}

/// Rotated sampling frame of an M-LDB descriptor, in octave pixels.
#[derive(Debug, Clone, Copy)]
struct MldbSample {
    xf: f32,
    yf: f32,
    co: f32,
    si: f32,
    scale: f32,
}

/// SURF or MSURF descriptor sampled bilinearly on the keypoint's evolution.
fn get_surf_descriptor(
    layout: SurfLayout,
    keypoint: &KeyPoint,
    evolutions: &[EvolutionStep],
) -> [f32; msurf::DESCRIPTOR_SIZE] {
    let evolution = &evolutions[keypoint.class_id];
    let ratio = evolution.ratio();
    let scale = f32::round(0.5f32 * keypoint.size / ratio);
    msurf::surf_descriptor(
        layout,
        keypoint.point.0 / ratio,
        keypoint.point.1 / ratio,
        scale,
        keypoint.angle,
        |x, y| (evolution.Lx.sample_bilinear(x, y), evolution.Ly.sample_bilinear(x, y)),
    )
}

fn describe_all<D: Send>(
    keypoints: &[KeyPoint],
    describe: impl Fn(&KeyPoint) -> Option<D> + Sync + Send,
) -> Vec<(KeyPoint, D)> {
    #[cfg(not(feature = "rayon"))]
    {
        keypoints
            .iter()
            .filter_map(|keypoint| Some((*keypoint, describe(keypoint)?)))
            .collect()
    }
    #[cfg(feature = "rayon")]
    {
        keypoints
            .par_iter()
            .filter_map(|keypoint| Some((*keypoint, describe(keypoint)?)))
            .collect()
    }
}

/// Do the binary comparisons to obtain the descriptor, stopping at `nbits`.
fn mldb_binary_comparisons(
    values: &[f32],
    descriptor: &mut [u8],
    count: usize,
    dpos: &mut usize,
    channels: usize,
    nbits: usize,
) {
    for pos in 0..channels {
        for i in 0..count {
            let ival = values[channels * i + pos];
            for j in (i + 1)..count {
                if *dpos >= nbits {
                    return;
                }
                if ival > values[channels * j + pos] {
                    descriptor[*dpos >> 3usize] |= 1u8 << (*dpos & 7);
                }
                *dpos += 1usize;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mldb_length_follows_channels_and_size() {
        let mut akaze = Akaze::default();
        assert_eq!(akaze.mldb_bits(), 486);
        akaze.descriptor_channels = 1;
        assert_eq!(akaze.mldb_bits(), 162);
        akaze.descriptor_size = 64;
        assert_eq!(akaze.mldb_bits(), 64);
        akaze.descriptor_size = 1000;
        assert_eq!(akaze.mldb_bits(), 162);
    }

    #[test]
    fn comparisons_stop_at_the_bit_budget() {
        let values = [4.0f32, 3.0, 2.0, 1.0];
        let mut descriptor = [0u8; 2];
        let mut dpos = 0;
        mldb_binary_comparisons(&values, &mut descriptor, 4, &mut dpos, 1, 4);
        assert_eq!(dpos, 4);
        assert_eq!(descriptor, [0b1111, 0]);
    }

    #[test]
    fn empty_keypoints_keep_descriptor_width() {
        let akaze = Akaze {
            descriptor: AkazeDescriptor::Mldb,
            ..Akaze::default()
        };
        let (keypoints, descriptors) = akaze.extract_descriptors(&[], &[]);
        assert!(keypoints.is_empty());
        assert_eq!(descriptors.width(), 61);
        assert!(descriptors.is_byte());
    }
}
