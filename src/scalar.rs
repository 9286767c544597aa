//! The scalar abstraction the engine is generic over, and a forward-mode
//! dual number implementing it.
//!
//! Every parameter-dependent quantity in the crate is computed through
//! [`Scalar`] operations only. Evaluating with `f64` gives plain values;
//! evaluating with [`Dual<f64>`] propagates one directional derivative
//! through the entire computation (sizes, growth rates, durations, split
//! probabilities, mutation rate), and `Dual<Dual<f64>>` propagates
//! second-order directional derivatives for Hessian-vector products.
//!
//! Integer-indexed constants (binomial coefficients, Moran eigensystems,
//! Polanski-Kimmel weights) enter through [`Scalar::from_f64`] and carry no
//! derivative. Control flow branches on [`Scalar::value`], the primal part,
//! which is the usual convention for forward-mode differentiation.

use num_traits::{One, Zero};
use std::fmt::Debug;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

/// Closed numeric interface for the likelihood engine.
///
/// The method set is exactly what the engine needs: field arithmetic plus
/// `exp`, `ln`, `expm1`, integer powers, `abs`, and the exponential
/// integral `Ei` (whose derivative is `exp(x)/x`).
pub trait Scalar:
    Copy
    + Debug
    + PartialOrd
    + Zero
    + One
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
    + DivAssign
    + Send
    + Sync
    + 'static
{
    /// Lift a derivative-free constant into the scalar type.
    fn from_f64(x: f64) -> Self;

    /// The primal (value) part, with all derivative information stripped.
    fn value(&self) -> f64;

    fn exp(self) -> Self;

    fn ln(self) -> Self;

    /// `e^x - 1`, accurate near zero.
    fn expm1(self) -> Self;

    fn powi(self, n: i32) -> Self;

    fn abs(self) -> Self;

    /// The exponential integral `Ei(x)`.
    fn expi(self) -> Self;

    fn is_finite(&self) -> bool {
        self.value().is_finite()
    }
}

impl Scalar for f64 {
    fn from_f64(x: f64) -> Self {
        x
    }

    fn value(&self) -> f64 {
        *self
    }

    fn exp(self) -> Self {
        f64::exp(self)
    }

    fn ln(self) -> Self {
        f64::ln(self)
    }

    fn expm1(self) -> Self {
        f64::exp_m1(self)
    }

    fn powi(self, n: i32) -> Self {
        f64::powi(self, n)
    }

    fn abs(self) -> Self {
        f64::abs(self)
    }

    fn expi(self) -> Self {
        crate::special::ei(self)
    }
}

/// A first-order dual number `re + eps * d`, where `d^2 = 0`.
///
/// Arithmetic follows the chain rule, so any engine quantity computed with
/// duals carries the exact derivative along the seeded direction. The
/// component type is itself a [`Scalar`], so duals nest.
///
/// Comparisons (`PartialEq`/`PartialOrd`) look at the primal part only:
/// two duals that agree in value but differ in derivative compare equal,
/// which keeps branch selection consistent between an `f64` evaluation and
/// a dual one.
#[derive(Clone, Copy, Debug)]
pub struct Dual<S> {
    /// Primal part.
    pub re: S,
    /// Derivative part.
    pub eps: S,
}

impl<S: Scalar> Dual<S> {
    /// A constant: derivative zero.
    pub fn constant(re: S) -> Self {
        Dual { re, eps: S::zero() }
    }

    /// The variable of differentiation: derivative one.
    pub fn variable(re: S) -> Self {
        Dual { re, eps: S::one() }
    }
}

impl<S: Scalar> PartialEq for Dual<S> {
    fn eq(&self, other: &Self) -> bool {
        self.re == other.re
    }
}

impl<S: Scalar> PartialOrd for Dual<S> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.re.partial_cmp(&other.re)
    }
}

impl<S: Scalar> Add for Dual<S> {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Dual {
            re: self.re + rhs.re,
            eps: self.eps + rhs.eps,
        }
    }
}

impl<S: Scalar> Sub for Dual<S> {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Dual {
            re: self.re - rhs.re,
            eps: self.eps - rhs.eps,
        }
    }
}

impl<S: Scalar> Mul for Dual<S> {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Dual {
            re: self.re * rhs.re,
            eps: self.re * rhs.eps + self.eps * rhs.re,
        }
    }
}

impl<S: Scalar> Div for Dual<S> {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        Dual {
            re: self.re / rhs.re,
            eps: (self.eps * rhs.re - self.re * rhs.eps) / (rhs.re * rhs.re),
        }
    }
}

impl<S: Scalar> Neg for Dual<S> {
    type Output = Self;
    fn neg(self) -> Self {
        Dual {
            re: -self.re,
            eps: -self.eps,
        }
    }
}

impl<S: Scalar> AddAssign for Dual<S> {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl<S: Scalar> SubAssign for Dual<S> {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl<S: Scalar> MulAssign for Dual<S> {
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}

impl<S: Scalar> DivAssign for Dual<S> {
    fn div_assign(&mut self, rhs: Self) {
        *self = *self / rhs;
    }
}

impl<S: Scalar> Zero for Dual<S> {
    fn zero() -> Self {
        Dual {
            re: S::zero(),
            eps: S::zero(),
        }
    }

    fn is_zero(&self) -> bool {
        self.re.is_zero() && self.eps.is_zero()
    }
}

impl<S: Scalar> One for Dual<S> {
    fn one() -> Self {
        Dual {
            re: S::one(),
            eps: S::zero(),
        }
    }
}

impl<S: Scalar> Scalar for Dual<S> {
    fn from_f64(x: f64) -> Self {
        Dual::constant(S::from_f64(x))
    }

    fn value(&self) -> f64 {
        self.re.value()
    }

    fn exp(self) -> Self {
        let e = self.re.exp();
        Dual {
            re: e,
            eps: self.eps * e,
        }
    }

    fn ln(self) -> Self {
        Dual {
            re: self.re.ln(),
            eps: self.eps / self.re,
        }
    }

    fn expm1(self) -> Self {
        Dual {
            re: self.re.expm1(),
            eps: self.eps * self.re.exp(),
        }
    }

    fn powi(self, n: i32) -> Self {
        if n == 0 {
            return Self::one();
        }
        Dual {
            re: self.re.powi(n),
            eps: self.eps * S::from_f64(n as f64) * self.re.powi(n - 1),
        }
    }

    fn abs(self) -> Self {
        if self.re.value() < 0.0 { -self } else { self }
    }

    fn expi(self) -> Self {
        // d/dx Ei(x) = exp(x) / x
        Dual {
            re: self.re.expi(),
            eps: self.eps * self.re.exp() / self.re,
        }
    }
}

/// Gradient of `f` at `x` by forward-mode sweeps, one seeded direction per
/// coordinate.
pub fn gradient<F>(f: F, x: &[f64]) -> Vec<f64>
where
    F: Fn(&[Dual<f64>]) -> Dual<f64>,
{
    (0..x.len())
        .map(|i| {
            let args: Vec<Dual<f64>> = x
                .iter()
                .enumerate()
                .map(|(j, &v)| {
                    if i == j {
                        Dual::variable(v)
                    } else {
                        Dual::constant(v)
                    }
                })
                .collect();
            f(&args).eps
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn dual_product_rule() {
        let x = Dual::variable(3.0);
        let y = x * x + Dual::constant(2.0) * x;
        assert_relative_eq!(y.re, 15.0);
        assert_relative_eq!(y.eps, 8.0); // 2x + 2
    }

    #[test]
    fn dual_quotient_and_chain_rule() {
        let x = Dual::variable(0.7);
        let y = (x * x).exp() / x;
        // d/dx e^{x^2}/x = e^{x^2} (2x/x - 1/x^2) = e^{x^2} (2 - 1/x^2)
        let expect = (0.7f64 * 0.7).exp() * (2.0 - 1.0 / (0.7 * 0.7));
        assert_relative_eq!(y.eps, expect, epsilon = 1e-12);
    }

    #[test]
    fn dual_expm1_matches_exp_minus_one() {
        let x = Dual::variable(1e-9);
        let a = x.expm1();
        assert_relative_eq!(a.re, 1e-9, epsilon = 1e-18);
        assert_relative_eq!(a.eps, (1e-9f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn nested_duals_give_second_derivative() {
        // f(x) = x^3; f''(3) = 18
        let inner = Dual::variable(3.0);
        let x: Dual<Dual<f64>> = Dual {
            re: inner,
            eps: Dual::constant(1.0),
        };
        let y = x * x * x;
        assert_relative_eq!(y.eps.eps, 18.0, epsilon = 1e-10);
    }

    #[test]
    fn gradient_helper_matches_analytic() {
        let g = gradient(|x| x[0] * x[1] + x[1].ln(), &[2.0, 5.0]);
        assert_relative_eq!(g[0], 5.0, epsilon = 1e-12);
        assert_relative_eq!(g[1], 2.0 + 0.2, epsilon = 1e-12);
    }

    #[test]
    fn comparisons_ignore_derivative_part() {
        let a = Dual::variable(1.0);
        let b = Dual::constant(1.0);
        assert!(a == b);
        assert!(Dual::constant(0.5) < b);
    }
}
