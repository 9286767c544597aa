//! Special functions and combinatorial kernels.
//!
//! Everything here is a numeric building block for the size-history and
//! admixture computations: the exponential integral and two
//! cancellation-safe transforms of it, binomial coefficients, and the
//! Polanski-Kimmel weights that turn expected coalescence times into a
//! site-frequency spectrum.
//!
//! # Numerical stability
//!
//! The exponential-size-history branch lengths involve
//! `-Ei(-1/x) * e^{1/x} / x`, which loses all precision for small `|x|`
//! (the two factors blow up in opposite directions). Below `|x| < 1/45`
//! the function is evaluated by its asymptotic series
//! `1 - x + 2x^2 - 6x^3 + ...` instead; ten terms suffice at that
//! threshold. Similarly `(e^x - 1)/x` switches to its Taylor series at
//! `x = 0` so that higher-order derivatives through dual numbers remain
//! finite there.

use crate::scalar::Scalar;
use ndarray::Array2;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Binomial coefficient `C(n, k)` as a float; zero when `k > n`.
pub fn binom(n: usize, k: usize) -> f64 {
    if k > n {
        return 0.0;
    }
    statrs::function::factorial::binomial(n as u64, k as u64)
}

/// The exponential integral `Ei(x)`.
///
/// Power series about the origin for positive arguments and for small
/// negative ones (via `E1`), continued fraction for large negative
/// arguments, asymptotic series beyond `x > 50`. Arguments reaching this
/// function from the size-history code are bounded by `|x| <= 45`.
pub fn ei(x: f64) -> f64 {
    if x == 0.0 {
        return f64::NEG_INFINITY;
    }
    if x < 0.0 {
        return -e1(-x);
    }
    if x < 50.0 {
        // Ei(x) = gamma + ln(x) + sum_k x^k / (k * k!)
        let mut term = 1.0;
        let mut sum = 0.0;
        for k in 1..=200 {
            term *= x / k as f64;
            sum += term / k as f64;
            if term < 1e-16 * sum {
                break;
            }
        }
        EULER_GAMMA + x.ln() + sum
    } else {
        // asymptotic: e^x/x * (1 + 1!/x + 2!/x^2 + ...), truncated at the
        // smallest term
        let mut term = 1.0;
        let mut sum = 1.0;
        for k in 1..=60 {
            let next = term * k as f64 / x;
            if next >= term {
                break;
            }
            term = next;
            sum += term;
        }
        x.exp() / x * sum
    }
}

/// `E1(x)` for `x > 0`.
fn e1(x: f64) -> f64 {
    if x <= 1.0 {
        // E1(x) = -gamma - ln(x) - sum_k (-x)^k / (k * k!)
        let mut term = 1.0;
        let mut sum = 0.0;
        for k in 1..=60 {
            term *= -x / k as f64;
            sum -= term / k as f64;
            if term.abs() < 1e-18 {
                break;
            }
        }
        -EULER_GAMMA - x.ln() + sum
    } else {
        // modified Lentz continued fraction, as in Numerical Recipes expint
        let mut b = x + 1.0;
        let mut c = 1e308;
        let mut d = 1.0 / b;
        let mut h = d;
        for i in 1..=200 {
            let a = -((i * i) as f64);
            b += 2.0;
            d = 1.0 / (a * d + b);
            c = b + a / c;
            let del = c * d;
            h *= del;
            if (del - 1.0).abs() < 1e-15 {
                break;
            }
        }
        h * (-x).exp()
    }
}

/// `-Ei(-1/x) * e^{1/x} / x`, stable across the whole argument range.
pub fn transformed_expi<S: Scalar>(x: S) -> S {
    if x.value().abs() < 1.0 / 45.0 {
        transformed_expi_series(x)
    } else {
        let inv = S::one() / x;
        -(-inv).expi() * inv.exp() / x
    }
}

fn transformed_expi_series<S: Scalar>(x: S) -> S {
    // 1 - x + 2x^2 - 6x^3 + ... (n! terms, alternating)
    let mut c = S::one();
    let mut ret = S::one();
    for n in 1..=10 {
        c = -c * x * S::from_f64(n as f64);
        ret += c;
    }
    ret
}

/// `(e^x - 1)/x`, finite (and smooth through dual numbers) at `x = 0`.
pub fn expm1d<S: Scalar>(x: S) -> S {
    if x.value() == 0.0 {
        expm1d_taylor(x)
    } else {
        x.expm1() / x
    }
}

fn expm1d_taylor<S: Scalar>(x: S) -> S {
    // 1 + x/2! + x^2/3! + ...
    let mut c = S::one();
    let mut ret = S::one();
    for n in 2..=10 {
        c = c * x / S::from_f64(n as f64);
        ret += c;
    }
    ret
}

/// Polanski-Kimmel weights `W(n, b, j)` as a matrix with rows `j = 2..=n`
/// and columns `b = 1..=n-1`.
///
/// `sfs[b] = sum_j etjj[j] * W(n, b, j)` converts expected coalescence
/// times into expected branch lengths subtending `b` of `n` lineages.
/// The weights satisfy a three-term recursion in `j` at fixed `b`, which
/// is filled iteratively here; no memoization is needed.
pub fn polanski_kimmel_w(n: usize) -> Array2<f64> {
    let nf = n as f64;
    let mut w = Array2::zeros((n - 1, n - 1));
    for b in 1..n {
        let bf = b as f64;
        w[[0, b - 1]] = 6.0 / (nf + 1.0);
        if n >= 3 {
            w[[1, b - 1]] = 30.0 * (nf - 2.0 * bf) / (nf + 1.0) / (nf + 2.0);
        }
        for j in 4..=n {
            let jj = (j - 2) as f64;
            let two_back = -(1.0 + jj) * (3.0 + 2.0 * jj) * (nf - jj)
                / jj
                / (2.0 * jj - 1.0)
                / (nf + jj + 1.0);
            let one_back = (3.0 + 2.0 * jj) * (nf - 2.0 * bf) / jj / (nf + jj + 1.0);
            w[[j - 2, b - 1]] = w[[j - 4, b - 1]] * two_back + w[[j - 3, b - 1]] * one_back;
        }
    }
    w
}
