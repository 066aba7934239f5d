//! Per-silo augmentation.
//!
//! Silos differ in the angle their images are rotated by, which gives the federation a small
//! number of distinct data distributions. Some silos additionally receive Gaussian pixel noise.

use std::f64::consts::PI;

use rand::Rng;

use crate::common::SiloId;

/// The rotation angles in degrees of a federation with five silos.
pub const FIVE_SILO_ANGLES: [f32; 5] = [0., 0., 0., -50., 120.];

/// The rotation angles in degrees of any other federation.
pub const NINE_SILO_ANGLES: [f32; 9] = [0., 0., 0., -50., -50., -50., 120., 120., 120.];

/// The standard deviation of the pixel noise, in raw pixel units.
pub const NOISE_STD: f64 = 10.;

/// Silos with an index above this one receive pixel noise if noise is enabled.
pub const NOISE_AFTER: usize = 5;

/// The rotation angles of a federation with `num_silos` silos.
pub fn rotation_angles(num_silos: usize) -> &'static [f32] {
    if num_silos == 5 {
        &FIVE_SILO_ANGLES
    } else {
        &NINE_SILO_ANGLES
    }
}

/// The rotation angle of the given silo. Silos beyond the angle table are not rotated.
pub fn silo_angle(silo: SiloId, num_silos: usize) -> f32 {
    rotation_angles(num_silos)
        .get(silo.0)
        .copied()
        .unwrap_or(0.)
}

/// The distribution a silo belongs to: the position of its angle among the distinct angles.
pub fn distribution_id(silo: SiloId, num_silos: usize) -> usize {
    let angle = silo_angle(silo, num_silos);
    let mut distinct: Vec<f32> = Vec::new();
    for a in rotation_angles(num_silos) {
        if !distinct.contains(a) {
            distinct.push(*a);
        }
    }
    distinct.iter().position(|a| *a == angle).unwrap_or(0)
}

/// Checks whether the given silo receives pixel noise.
pub fn is_noisy(silo: SiloId, noise: bool) -> bool {
    noise && silo.0 > NOISE_AFTER
}

/// Adds zero-mean Gaussian noise with standard deviation `std` to every pixel.
pub fn add_gaussian_noise(image: &mut [f32], std: f64, rng: &mut impl Rng) {
    for pixel in image.iter_mut() {
        *pixel += (std * standard_normal(rng)) as f32;
    }
}

// Box-Muller transform
fn standard_normal(rng: &mut impl Rng) -> f64 {
    let u1 = 1. - rng.gen::<f64>();
    let u2 = rng.gen::<f64>();
    (-2. * u1.ln()).sqrt() * (2. * PI * u2).cos()
}

/// The affine matrix that rotates by `angle` degrees counter-clockwise about `center`.
///
/// `[x', y'] = [[a, b, tx], [c, d, ty]] · [x, y, 1]`
pub fn rotation_matrix(center: (f64, f64), angle: f64) -> [[f64; 3]; 2] {
    let (cx, cy) = center;
    let radians = angle.to_radians();
    let alpha = radians.cos();
    let beta = radians.sin();
    [
        [alpha, beta, (1. - alpha) * cx - beta * cy],
        [-beta, alpha, beta * cx + (1. - alpha) * cy],
    ]
}

/// Rotates a row-major `height × width` image by `angle` degrees about its center.
///
/// Every target pixel is mapped back onto the source image and sampled bilinearly. Source
/// positions outside of the image read as zero.
pub fn rotate(image: &[f32], height: usize, width: usize, angle: f32) -> Vec<f32> {
    if angle == 0. {
        return image.to_vec();
    }

    let [[a, b, tx], [c, d, ty]] =
        rotation_matrix((width as f64 / 2., height as f64 / 2.), angle as f64);
    // the inverse of the rotation part is its transpose
    let (ia, ib, ic, id) = (a, c, b, d);
    let (itx, ity) = (-(ia * tx + ib * ty), -(ic * tx + id * ty));

    let pixel = |x: i64, y: i64| -> f64 {
        if x < 0 || y < 0 || x >= width as i64 || y >= height as i64 {
            0.
        } else {
            image[y as usize * width + x as usize] as f64
        }
    };

    let mut rotated = Vec::with_capacity(height * width);
    for y in 0..height {
        for x in 0..width {
            let (xf, yf) = (x as f64, y as f64);
            let sx = ia * xf + ib * yf + itx;
            let sy = ic * xf + id * yf + ity;

            let (x0, y0) = (sx.floor(), sy.floor());
            let (fx, fy) = (sx - x0, sy - y0);
            let (x0, y0) = (x0 as i64, y0 as i64);

            let value = pixel(x0, y0) * (1. - fx) * (1. - fy)
                + pixel(x0 + 1, y0) * fx * (1. - fy)
                + pixel(x0, y0 + 1) * (1. - fx) * fy
                + pixel(x0 + 1, y0 + 1) * fx * fy;
            rotated.push(value as f32);
        }
    }
    rotated
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn approx_eq(a: &[f32], b: &[f32]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-4)
    }

    #[test]
    fn test_angles() {
        assert_eq!(silo_angle(SiloId(4), 5), 120.);
        assert_eq!(silo_angle(SiloId(4), 9), -50.);
        assert_eq!(silo_angle(SiloId(8), 9), 120.);
        assert_eq!(silo_angle(SiloId(1), 3), 0.);
    }

    #[test]
    fn test_distribution_id() {
        let ids: Vec<_> = (0..9).map(|s| distribution_id(SiloId(s), 9)).collect();
        assert_eq!(ids, vec![0, 0, 0, 1, 1, 1, 2, 2, 2]);
        assert_eq!(distribution_id(SiloId(4), 5), 2);
    }

    #[test]
    fn test_is_noisy() {
        assert!(!is_noisy(SiloId(5), true));
        assert!(is_noisy(SiloId(6), true));
        assert!(!is_noisy(SiloId(6), false));
    }

    #[test]
    fn test_rotate_zero_is_identity() {
        let image: Vec<f32> = (0..12).map(|v| v as f32).collect();
        assert_eq!(rotate(&image, 3, 4, 0.), image);
    }

    #[test]
    fn test_rotate_half_turn_mirrors() {
        // about the center (2, 2) pixel (x, y) is taken from (4 - x, 4 - y)
        let mut image = vec![0.; 16];
        image[4 + 1] = 1.;
        image[2 * 4 + 3] = 0.5;
        let rotated = rotate(&image, 4, 4, 180.);

        let mut expected = vec![0.; 16];
        expected[3 * 4 + 3] = 1.;
        expected[2 * 4 + 1] = 0.5;
        assert!(approx_eq(&rotated, &expected));
    }

    #[test]
    fn test_rotate_quarter_turn() {
        // counter-clockwise: pixel (x, y) is taken from (5 - y, x)
        let mut image = vec![0.; 25];
        image[2 * 5 + 4] = 1.;
        let rotated = rotate(&image, 5, 5, 90.);
        assert!((rotated[5 + 2] - 1.).abs() < 1e-4);
    }

    #[test]
    fn test_rotation_matrix_fixes_center() {
        let [[a, b, tx], [c, d, ty]] = rotation_matrix((14., 14.), -50.);
        assert!((a * 14. + b * 14. + tx - 14.).abs() < 1e-9);
        assert!((c * 14. + d * 14. + ty - 14.).abs() < 1e-9);
    }

    #[test]
    fn test_noise_statistics() {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        let mut image = vec![0.; 10_000];
        add_gaussian_noise(&mut image, NOISE_STD, &mut rng);

        let n = image.len() as f64;
        let mean = image.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = image.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
        assert!(mean.abs() < 0.5);
        assert!((var.sqrt() - NOISE_STD).abs() < 0.5);
    }
}
