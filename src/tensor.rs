//! Numeric arrays with population-labeled axes.
//!
//! Partial likelihoods in the sum-product engine are indexed by the derived
//! allele count in each coexisting population. Tracking which axis belongs
//! to which population by hand is the kind of bookkeeping that silently
//! breaks, so the tensor carries its labels and every operation is phrased
//! against them.

use crate::demography::PopId;
use crate::scalar::Scalar;
use ndarray::{Array1, ArrayD, ArrayViewD, Axis, IxDyn, Zip};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TensorError {
    #[error("population {0} does not label any axis of the tensor")]
    MissingAxis(PopId),

    #[error("length mismatch on the axis of population {pop}: got {got}, expected {expected}")]
    AxisLength {
        pop: PopId,
        got: usize,
        expected: usize,
    },

    #[error("axis labels are not unique")]
    DuplicateLabel,

    #[error("tensor has {axes} axes but {labels} labels")]
    LabelCount { axes: usize, labels: usize },
}

/// An `ArrayD` whose axes are identified by population, in order.
#[derive(Debug, Clone)]
pub struct LabeledTensor<S: Scalar> {
    values: ArrayD<S>,
    labels: Vec<PopId>,
}

impl<S: Scalar> LabeledTensor<S> {
    pub fn new(values: ArrayD<S>, labels: Vec<PopId>) -> Result<Self, TensorError> {
        if values.ndim() != labels.len() {
            return Err(TensorError::LabelCount {
                axes: values.ndim(),
                labels: labels.len(),
            });
        }
        for (i, a) in labels.iter().enumerate() {
            if labels[i + 1..].contains(a) {
                return Err(TensorError::DuplicateLabel);
            }
        }
        Ok(LabeledTensor { values, labels })
    }

    /// One-dimensional indicator: probability one at derived count `k`
    /// among `n` lineages.
    pub fn one_hot(pop: PopId, n: usize, k: usize) -> Self {
        let mut values = Array1::from_elem(n + 1, S::zero());
        values[k] = S::one();
        LabeledTensor {
            values: values.into_dyn(),
            labels: vec![pop],
        }
    }

    pub fn values(&self) -> &ArrayD<S> {
        &self.values
    }

    pub fn labels(&self) -> &[PopId] {
        &self.labels
    }

    pub fn axis(&self, pop: PopId) -> Result<usize, TensorError> {
        self.labels
            .iter()
            .position(|&l| l == pop)
            .ok_or(TensorError::MissingAxis(pop))
    }

    pub fn axis_len(&self, pop: PopId) -> Result<usize, TensorError> {
        Ok(self.values.shape()[self.axis(pop)?])
    }

    /// Replace the raw values, keeping labels (used to thread drift
    /// transitions through without relabeling).
    pub(crate) fn with_values(&self, values: ArrayD<S>) -> Self {
        LabeledTensor {
            values,
            labels: self.labels.clone(),
        }
    }

    /// Elementwise product over the union of the two label sets; axes
    /// missing from one operand broadcast across it.
    pub fn product(&self, other: &Self) -> Self {
        let mut labels = self.labels.clone();
        for l in &other.labels {
            if !labels.contains(l) {
                labels.push(*l);
            }
        }
        let shape: Vec<usize> = labels
            .iter()
            .map(|&l| {
                self.axis_len(l)
                    .or_else(|_| other.axis_len(l))
                    .unwrap_or(1)
            })
            .collect();
        let a = aligned(&self.values, &self.labels, &labels);
        let b = aligned(&other.values, &other.labels, &labels);
        let a = a
            .broadcast(IxDyn(&shape))
            .expect("aligned operand broadcasts to the union shape");
        let b = b
            .broadcast(IxDyn(&shape))
            .expect("aligned operand broadcasts to the union shape");
        let values = Zip::from(&a).and(&b).map_collect(|&x, &y| x * y);
        LabeledTensor { values, labels }
    }

    /// Multiply entries along `pop`'s axis by `weights`.
    pub fn scale_axis(&self, pop: PopId, weights: &[S]) -> Result<Self, TensorError> {
        let ax = self.axis(pop)?;
        let len = self.values.shape()[ax];
        if weights.len() != len {
            return Err(TensorError::AxisLength {
                pop,
                got: weights.len(),
                expected: len,
            });
        }
        let mut values = self.values.clone();
        for (i, mut slab) in values.axis_iter_mut(Axis(ax)).enumerate() {
            let w = weights[i];
            slab.mapv_inplace(|x| x * w);
        }
        Ok(self.with_values(values))
    }

    /// Marginalize `pop` away by summation.
    pub fn sum_out(&self, pop: PopId) -> Result<Self, TensorError> {
        let ax = self.axis(pop)?;
        let values = self.values.sum_axis(Axis(ax));
        let labels = self
            .labels
            .iter()
            .copied()
            .filter(|&l| l != pop)
            .collect();
        Ok(LabeledTensor { values, labels })
    }

    /// Replace axes `a` and `b` by their convolution axis, labeled `joined`:
    /// `out[.., k] = sum_{i + j = k} in[.., i, j]`.
    ///
    /// This is the polynomial-multiplication form of hypergeometric
    /// downsampling; the combinatorial weights are applied by the caller
    /// via [`scale_axis`](Self::scale_axis).
    pub fn convolve(&self, a: PopId, b: PopId, joined: PopId) -> Result<Self, TensorError> {
        let ax_a = self.axis(a)?;
        let ax_b = self.axis(b)?;
        if ax_a == ax_b {
            return Err(TensorError::DuplicateLabel);
        }
        let ndim = self.values.ndim();
        let len_a = self.values.shape()[ax_a];
        let len_b = self.values.shape()[ax_b];

        // untouched axes keep their relative order; the joined axis goes last
        let mut perm: Vec<usize> = (0..ndim).filter(|&i| i != ax_a && i != ax_b).collect();
        let mut out_labels: Vec<PopId> = perm.iter().map(|&i| self.labels[i]).collect();
        let mut out_shape: Vec<usize> = perm.iter().map(|&i| self.values.shape()[i]).collect();
        out_labels.push(joined);
        out_shape.push(len_a + len_b - 1);
        perm.push(ax_a);
        perm.push(ax_b);

        let rest = ndim - 2;
        let view = self.values.view().permuted_axes(perm);
        let mut out = ArrayD::from_elem(IxDyn(&out_shape), S::zero());
        for i in 0..len_a {
            let slab_i = view.index_axis(Axis(rest), i);
            for j in 0..len_b {
                let slab = slab_i.index_axis(Axis(rest), j);
                let mut target = out.index_axis_mut(Axis(rest), i + j);
                Zip::from(&mut target).and(&slab).for_each(|t, &s| *t += s);
            }
        }
        LabeledTensor::new(out, out_labels)
    }

    /// The vector along `pop`'s axis with every other axis pinned at
    /// index 0 (no derived alleles anywhere else).
    pub fn zeroth_vector(&self, pop: PopId) -> Result<Vec<S>, TensorError> {
        let mut ax = self.axis(pop)?;
        let mut view = self.values.view();
        while view.ndim() > 1 {
            let drop = if ax == 0 { 1 } else { 0 };
            view = view.index_axis_move(Axis(drop), 0);
            if drop < ax {
                ax -= 1;
            }
        }
        Ok(view.iter().copied().collect())
    }

    /// Sum of every entry.
    pub fn total(&self) -> S {
        let mut acc = S::zero();
        for v in self.values.iter() {
            acc += *v;
        }
        acc
    }
}

/// View `values` (whose axes are `labels`) with its axes rearranged to the
/// relative order of `target`, inserting length-1 axes for labels it does
/// not carry.
fn aligned<'a, S: Scalar>(
    values: &'a ArrayD<S>,
    labels: &[PopId],
    target: &[PopId],
) -> ArrayViewD<'a, S> {
    let order: Vec<usize> = target
        .iter()
        .filter_map(|t| labels.iter().position(|l| l == t))
        .collect();
    let mut view = values.view().permuted_axes(order);
    for (i, t) in target.iter().enumerate() {
        if !labels.contains(t) {
            view = view.insert_axis(Axis(i));
        }
    }
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::IxDyn;

    fn pop(i: usize) -> PopId {
        PopId(i)
    }

    fn tensor(shape: &[usize], data: Vec<f64>, labels: Vec<PopId>) -> LabeledTensor<f64> {
        LabeledTensor::new(
            ArrayD::from_shape_vec(IxDyn(shape), data).unwrap(),
            labels,
        )
        .unwrap()
    }

    #[test]
    fn rejects_mismatched_labels() {
        let arr = ArrayD::from_elem(IxDyn(&[2, 2]), 0.0);
        assert!(matches!(
            LabeledTensor::<f64>::new(arr.clone(), vec![pop(0)]),
            Err(TensorError::LabelCount { .. })
        ));
        assert!(matches!(
            LabeledTensor::<f64>::new(arr, vec![pop(0), pop(0)]),
            Err(TensorError::DuplicateLabel)
        ));
    }

    #[test]
    fn one_hot_places_unit_mass() {
        let t = LabeledTensor::<f64>::one_hot(pop(3), 4, 2);
        assert_eq!(t.labels(), &[pop(3)]);
        assert_relative_eq!(t.values()[[2]], 1.0);
        assert_relative_eq!(t.total(), 1.0);
    }

    #[test]
    fn product_broadcasts_over_disjoint_labels() {
        let a = tensor(&[2], vec![1.0, 2.0], vec![pop(0)]);
        let b = tensor(&[3], vec![1.0, 10.0, 100.0], vec![pop(1)]);
        let p = a.product(&b);
        assert_eq!(p.labels(), &[pop(0), pop(1)]);
        assert_relative_eq!(p.values()[[1, 2]], 200.0);
        assert_relative_eq!(p.values()[[0, 1]], 10.0);
    }

    #[test]
    fn product_aligns_shared_labels_regardless_of_order() {
        let a = tensor(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![pop(0), pop(1)]);
        let b = tensor(&[3, 2], vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0], vec![pop(1), pop(0)]);
        let p = a.product(&b);
        assert_eq!(p.labels(), &[pop(0), pop(1)]);
        // a[[i, j]] * b[[j, i]]
        assert_relative_eq!(p.values()[[0, 2]], 3.0 * 3.0);
        assert_relative_eq!(p.values()[[1, 1]], 5.0 * 20.0);
    }

    #[test]
    fn scale_axis_applies_weights_along_one_axis() {
        let t = tensor(&[2, 2], vec![1.0, 2.0, 3.0, 4.0], vec![pop(0), pop(1)]);
        let s = t.scale_axis(pop(1), &[10.0, 0.5]).unwrap();
        assert_relative_eq!(s.values()[[0, 0]], 10.0);
        assert_relative_eq!(s.values()[[1, 1]], 2.0);
        assert!(matches!(
            t.scale_axis(pop(1), &[1.0]),
            Err(TensorError::AxisLength { .. })
        ));
    }

    #[test]
    fn convolve_matches_polynomial_multiplication() {
        // (1 + 2x) * (3 + 4x) = 3 + 10x + 8x^2 as an outer product
        let a = tensor(&[2], vec![1.0, 2.0], vec![pop(0)]);
        let b = tensor(&[2], vec![3.0, 4.0], vec![pop(1)]);
        let c = a.product(&b).convolve(pop(0), pop(1), pop(2)).unwrap();
        assert_eq!(c.labels(), &[pop(2)]);
        assert_relative_eq!(c.values()[[0]], 3.0);
        assert_relative_eq!(c.values()[[1]], 10.0);
        assert_relative_eq!(c.values()[[2]], 8.0);
    }

    #[test]
    fn convolve_leaves_spectator_axes_alone() {
        // spectator axis of length 2, two convolved axes of length 2
        let t = tensor(
            &[2, 2, 2],
            vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
            vec![pop(9), pop(0), pop(1)],
        );
        let c = t.convolve(pop(0), pop(1), pop(5)).unwrap();
        assert_eq!(c.labels(), &[pop(9), pop(5)]);
        assert_relative_eq!(c.values()[[0, 0]], 1.0);
        assert_relative_eq!(c.values()[[1, 2]], 1.0);
        assert_relative_eq!(c.values()[[1, 0]], 0.0);
    }

    #[test]
    fn sum_out_marginalizes() {
        let t = tensor(&[2, 2], vec![1.0, 2.0, 3.0, 4.0], vec![pop(0), pop(1)]);
        let m = t.sum_out(pop(0)).unwrap();
        assert_eq!(m.labels(), &[pop(1)]);
        assert_relative_eq!(m.values()[[0]], 4.0);
        assert_relative_eq!(m.values()[[1]], 6.0);
    }

    #[test]
    fn zeroth_vector_pins_other_axes() {
        let t = tensor(
            &[2, 3],
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            vec![pop(0), pop(1)],
        );
        assert_eq!(t.zeroth_vector(pop(1)).unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(t.zeroth_vector(pop(0)).unwrap(), vec![1.0, 4.0]);
        assert!(t.zeroth_vector(pop(7)).is_err());
    }
}
