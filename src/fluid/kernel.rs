//! SPH smoothing kernels.
//!
//! Every shape has compact support `2h`, where `h` is the smoothing radius.
//! Kernels are a closed set selected at construction: [`KernelShape`] names the
//! shape and [`SmoothingKernel`] carries the radius and the derived
//! normalization constant.

use std::f32::consts::PI;

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Kernel shape.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelShape {
    /// Cubic B-spline (M4). Production kernel for interpolation.
    #[default]
    CubicBSpline,
    /// Poly6 stretched over `2h`. Smooth, cheap, no gradient at the origin.
    Poly6,
    /// Spiky stretched over `2h`. Non-vanishing gradient near the origin and a
    /// positive second derivative everywhere inside the support.
    Spiky,
}

impl KernelShape {
    /// Normalization constant for smoothing radius `h`.
    pub fn normalization(self, h: f32) -> f32 {
        let support = 2.0 * h;
        match self {
            KernelShape::CubicBSpline => 1.0 / (PI * h * h * h),
            KernelShape::Poly6 => 315.0 / (64.0 * PI * support.powi(9)),
            KernelShape::Spiky => 15.0 / (PI * support.powi(6)),
        }
    }
}

/// A smoothing kernel with a fixed shape and smoothing radius.
///
/// `Copy` on purpose: callers take a private copy before calling
/// [`SmoothingKernel::adjust`], so adjustments never leak between particles.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SmoothingKernel {
    shape: KernelShape,
    /// Configured smoothing radius `h`.
    radius: f32,
    /// Effective radius `h0` used by the evaluation functions.
    effective_radius: f32,
    /// Normalization constant `A` for `effective_radius`.
    normalization: f32,
}

impl SmoothingKernel {
    /// Kernel of the given shape with smoothing radius `radius` (`h`).
    pub fn new(shape: KernelShape, radius: f32) -> Self {
        Self {
            shape,
            radius,
            effective_radius: radius,
            normalization: shape.normalization(radius),
        }
    }

    /// Cubic B-spline kernel.
    pub fn cubic_b_spline(radius: f32) -> Self {
        Self::new(KernelShape::CubicBSpline, radius)
    }

    /// Poly6 kernel over `[0, 2h]`.
    pub fn poly6(radius: f32) -> Self {
        Self::new(KernelShape::Poly6, radius)
    }

    /// Spiky kernel; its gradient does not vanish at the origin.
    pub fn spiky(radius: f32) -> Self {
        Self::new(KernelShape::Spiky, radius)
    }

    /// Kernel family.
    pub fn shape(&self) -> KernelShape {
        self.shape
    }

    /// Configured smoothing radius `h`.
    pub fn radius(&self) -> f32 {
        self.radius
    }

    /// Radius `h0` the evaluation functions currently use.
    pub fn effective_radius(&self) -> f32 {
        self.effective_radius
    }

    /// Normalization constant `A`, refreshed by [`SmoothingKernel::adjust`].
    pub fn normalization(&self) -> f32 {
        self.normalization
    }

    /// Distance beyond which every function returns zero.
    #[inline]
    pub fn support(&self) -> f32 {
        2.0 * self.effective_radius
    }

    /// Recomputes the normalization for a local density ratio `rho / rho0`.
    ///
    /// The effective radius stays pinned to the configured radius, so the
    /// result is currently independent of `density_ratio`.
    pub fn adjust(&mut self, density_ratio: f32) {
        debug_assert!(density_ratio.is_finite());
        self.effective_radius = self.radius;
        self.normalization = self.shape.normalization(self.effective_radius);
    }

    /// Kernel weight `W(d)`.
    #[inline]
    pub fn weight(&self, distance: f32) -> f32 {
        if distance > self.support() {
            return 0.0;
        }
        let a = self.normalization;
        match self.shape {
            KernelShape::CubicBSpline => {
                let q = distance / self.effective_radius;
                if q <= 1.0 {
                    a * (1.0 - 1.5 * q * q + 0.75 * q * q * q)
                } else {
                    let t = 2.0 - q;
                    a * 0.25 * t * t * t
                }
            }
            KernelShape::Poly6 => {
                let s = self.support();
                let x = s * s - distance * distance;
                a * x * x * x
            }
            KernelShape::Spiky => {
                let x = self.support() - distance;
                a * x * x * x
            }
        }
    }

    /// Radial derivative `dW/dd`. Non-positive inside the support.
    #[inline]
    pub fn first_derivative(&self, distance: f32) -> f32 {
        if distance > self.support() {
            return 0.0;
        }
        let a = self.normalization;
        match self.shape {
            KernelShape::CubicBSpline => {
                let h = self.effective_radius;
                let q = distance / h;
                if q <= 1.0 {
                    a / h * (-3.0 * q + 2.25 * q * q)
                } else {
                    let t = 2.0 - q;
                    a / h * (-0.75 * t * t)
                }
            }
            KernelShape::Poly6 => {
                let s = self.support();
                let x = s * s - distance * distance;
                -6.0 * a * distance * x * x
            }
            KernelShape::Spiky => {
                let x = self.support() - distance;
                -3.0 * a * x * x
            }
        }
    }

    /// Second radial derivative `d²W/dd²`.
    #[inline]
    pub fn second_derivative(&self, distance: f32) -> f32 {
        if distance > self.support() {
            return 0.0;
        }
        let a = self.normalization;
        match self.shape {
            KernelShape::CubicBSpline => {
                let h = self.effective_radius;
                let q = distance / h;
                if q <= 1.0 {
                    a / (h * h) * (-3.0 + 4.5 * q)
                } else {
                    a / (h * h) * 1.5 * (2.0 - q)
                }
            }
            KernelShape::Poly6 => {
                let s2 = self.support() * self.support();
                let d2 = distance * distance;
                -6.0 * a * (s2 - d2) * (s2 - 5.0 * d2)
            }
            KernelShape::Spiky => 6.0 * a * (self.support() - distance),
        }
    }

    /// Gradient of `W` with respect to the evaluating particle.
    ///
    /// `direction` is the unit vector from the evaluating particle towards the
    /// neighbor. Callers must not pass a zero distance, since the direction is
    /// undefined there.
    #[inline]
    pub fn gradient(&self, distance: f32, direction: Vec3) -> Vec3 {
        if distance > self.support() {
            return Vec3::ZERO;
        }
        direction * -self.first_derivative(distance)
    }
}

/// The pair of kernels a solver evaluates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KernelSet {
    /// Density estimation and field interpolation.
    pub interpolation: SmoothingKernel,
    /// Pressure gradient and viscosity Laplacian.
    pub gradient: SmoothingKernel,
}

impl KernelSet {
    pub fn new(interpolation: KernelShape, gradient: KernelShape, radius: f32) -> Self {
        Self {
            interpolation: SmoothingKernel::new(interpolation, radius),
            gradient: SmoothingKernel::new(gradient, radius),
        }
    }

    /// Largest support of the two kernels.
    pub fn support(&self) -> f32 {
        self.interpolation.support().max(self.gradient.support())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Simpson integral of `W(r) 4 pi r^2` over the support.
    fn volume_integral(kernel: &SmoothingKernel) -> f32 {
        let steps = 2000;
        let support = kernel.support() as f64;
        let dr = support / steps as f64;
        let f = |r: f64| kernel.weight(r as f32) as f64 * 4.0 * std::f64::consts::PI * r * r;
        let mut sum = f(0.0) + f(support);
        for i in 1..steps {
            let r = i as f64 * dr;
            sum += if i % 2 == 0 { 2.0 * f(r) } else { 4.0 * f(r) };
        }
        (sum * dr / 3.0) as f32
    }

    #[test]
    fn test_kernel_normalization() {
        for shape in [KernelShape::CubicBSpline, KernelShape::Poly6, KernelShape::Spiky] {
            for h in [0.1, 0.25, 1.0] {
                let kernel = SmoothingKernel::new(shape, h);
                let integral = volume_integral(&kernel);
                assert!(
                    (integral - 1.0).abs() < 1e-3,
                    "{shape:?} h={h} integrates to {integral}"
                );
            }
        }
    }

    #[test]
    fn test_cubic_spline_continuity_at_unit_radius() {
        let kernel = SmoothingKernel::cubic_b_spline(0.5);
        let h = kernel.radius();
        let eps = 1e-4;

        let below = kernel.weight(h - eps);
        let above = kernel.weight(h + eps);
        assert!((below - above).abs() < 1e-2);

        let d_below = kernel.first_derivative(h - eps);
        let d_above = kernel.first_derivative(h + eps);
        assert!((d_below - d_above).abs() < 1e-1);
    }

    #[test]
    fn test_weight_decreases_with_distance() {
        let kernel = SmoothingKernel::cubic_b_spline(1.0);
        let mut last = kernel.weight(0.0);
        for i in 1..=20 {
            let w = kernel.weight(i as f32 * 0.1);
            assert!(w <= last);
            last = w;
        }
        assert_eq!(kernel.weight(2.0), 0.0);
    }

    #[test]
    fn test_first_derivative_matches_finite_difference() {
        for shape in [KernelShape::CubicBSpline, KernelShape::Poly6, KernelShape::Spiky] {
            let kernel = SmoothingKernel::new(shape, 1.0);
            for d in [0.3_f32, 0.8, 1.3, 1.7] {
                let eps = 1e-3;
                let numeric = (kernel.weight(d + eps) - kernel.weight(d - eps)) / (2.0 * eps);
                let analytic = kernel.first_derivative(d);
                assert!(
                    (numeric - analytic).abs() < 1e-2 * analytic.abs().max(1.0),
                    "{shape:?} at {d}: {numeric} vs {analytic}"
                );
            }
        }
    }

    #[test]
    fn test_second_derivative_matches_finite_difference() {
        for shape in [KernelShape::CubicBSpline, KernelShape::Poly6, KernelShape::Spiky] {
            let kernel = SmoothingKernel::new(shape, 1.0);
            for d in [0.4_f32, 1.4] {
                let eps = 1e-2;
                let numeric = (kernel.first_derivative(d + eps)
                    - kernel.first_derivative(d - eps))
                    / (2.0 * eps);
                let analytic = kernel.second_derivative(d);
                assert!(
                    (numeric - analytic).abs() < 2e-2 * analytic.abs().max(1.0),
                    "{shape:?} at {d}: {numeric} vs {analytic}"
                );
            }
        }
    }

    #[test]
    fn test_gradient_points_towards_neighbor() {
        let kernel = SmoothingKernel::spiky(1.0);
        // Neighbor along +x: W grows as the evaluating particle moves towards it.
        let grad = kernel.gradient(0.5, Vec3::X);
        assert!(grad.x > 0.0);
        assert_eq!(grad.y, 0.0);
        assert_eq!(grad.z, 0.0);
    }

    #[test]
    fn test_adjust_keeps_radius() {
        let mut kernel = SmoothingKernel::cubic_b_spline(0.25);
        let before = kernel.weight(0.1);
        kernel.adjust(1.4);
        assert_eq!(kernel.effective_radius(), 0.25);
        assert_eq!(kernel.weight(0.1), before);
    }

    proptest! {
        #[test]
        fn test_compact_support(
            h in 0.01f32..2.0,
            beyond in 1.0001f32..10.0,
            dx in -1.0f32..1.0,
            dy in -1.0f32..1.0,
        ) {
            let direction = Vec3::new(dx, dy, 1.0).normalize();
            for shape in [KernelShape::CubicBSpline, KernelShape::Poly6, KernelShape::Spiky] {
                let kernel = SmoothingKernel::new(shape, h);
                let d = 2.0 * h * beyond;
                prop_assert_eq!(kernel.weight(d), 0.0);
                prop_assert_eq!(kernel.first_derivative(d), 0.0);
                prop_assert_eq!(kernel.second_derivative(d), 0.0);
                prop_assert_eq!(kernel.gradient(d, direction), Vec3::ZERO);
            }
        }
    }
}
