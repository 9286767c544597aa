//! End-to-end likelihood scenarios over small demographies.

use approx::assert_relative_eq;
use kingman::scalar::gradient;
use kingman::{Demography, Dual, Scalar, SizeModel, SumProduct};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn constant(size: f64, tau: f64) -> SizeModel<f64> {
    SizeModel::Constant { size, tau }
}

/// Two sampled populations of two lineages each, with drifting leaf
/// segments, merging into a constant ancestral population held forever.
fn divergence_demography(leaf_size: f64, root_size: f64) -> Demography<f64> {
    let mut b = Demography::<f64>::builder();
    let x = b.add_leaf("x", 2, constant(leaf_size, 0.1)).unwrap();
    let y = b.add_leaf("y", 2, constant(leaf_size, 0.1)).unwrap();
    let anc = b
        .add_population("anc", constant(root_size, f64::INFINITY))
        .unwrap();
    b.add_edge(anc, x).unwrap();
    b.add_edge(anc, y).unwrap();
    b.add_event((anc, x), (anc, y));
    b.build().unwrap()
}

/// One sampled population drawing from two admixing parents that merge
/// into a common ancestor.
fn pulse_demography(lineages: usize, p1: f64) -> Demography<f64> {
    let mut b = Demography::<f64>::builder();
    let c = b.add_leaf("c", lineages, constant(1.0, 0.05)).unwrap();
    let left = b.add_population("left", constant(1.0, 0.1)).unwrap();
    let right = b.add_population("right", constant(1.0, 0.1)).unwrap();
    let anc = b
        .add_population("anc", constant(1.0, f64::INFINITY))
        .unwrap();
    b.add_edge(left, c).unwrap();
    b.add_edge(right, c).unwrap();
    b.add_edge(anc, left).unwrap();
    b.add_edge(anc, right).unwrap();
    b.set_split_probs(c, (left, p1), (right, 1.0 - p1));
    b.add_event((left, c), (right, c));
    b.add_event((anc, left), (anc, right));
    b.build().unwrap()
}

#[test]
fn divergence_scenario_has_sane_likelihood() {
    init_logging();
    // one derived allele in x, none in y, observed once, theta = 1
    let demo = divergence_demography(0.1, 1.0);
    let config = demo.configuration(&[("x", 1, 1), ("y", 0, 2)]).unwrap();

    let evaluation = SumProduct::new(&demo, &config).unwrap();
    let p = evaluation.p(false).unwrap();
    assert!(p > 0.0 && p < 1.0, "p = {p}");

    let ll = demo.log_likelihood_prf(1.0, &[(config, 1.0)]).unwrap();
    assert!(ll.is_finite() && ll < 0.0, "ll = {ll}");
}

#[test]
fn divergence_normalizing_constant_is_positive() {
    let demo = divergence_demography(0.1, 1.0);
    let total = demo.total_branch_length().unwrap();
    assert!(total > 0.0 && total.is_finite(), "total = {total}");
}

#[test]
fn event_tree_has_single_root_covering_the_sample() {
    let demo = pulse_demography(2, 0.5);
    let tree = demo.event_tree();
    let root = tree.node(tree.root());
    assert_eq!(root.subpops(), &[demo.pop("anc").unwrap()]);
    assert_eq!(root.leaves(), &[demo.pop("c").unwrap()]);
}

#[test]
fn single_lineage_admixture_tensor_closed_form() {
    let demo = pulse_demography(1, 0.5);
    let c = demo.pop("c").unwrap();
    let tensor = demo.admixture_prob(c).unwrap();
    // order: child, parent1, parent2
    let expect = [
        [[1.0, 0.5], [0.5, 0.0]],
        [[0.0, 0.5], [0.5, 1.0]],
    ];
    for (cd, plane) in expect.iter().enumerate() {
        for (d1, row) in plane.iter().enumerate() {
            for (d2, want) in row.iter().enumerate() {
                assert_relative_eq!(
                    tensor.values()[[cd, d1, d2]],
                    *want,
                    epsilon = 1e-12
                );
            }
        }
    }
}

#[test]
fn admixture_tensor_columns_are_distributions() {
    let demo = pulse_demography(3, 0.3);
    let c = demo.pop("c").unwrap();
    let tensor = demo.admixture_prob(c).unwrap();
    let n = demo.lineages(c);
    for d1 in 0..=n {
        for d2 in 0..=n {
            let mut total = 0.0;
            for cd in 0..=n {
                total += tensor.values()[[cd, d1, d2]];
            }
            assert_relative_eq!(total, 1.0, epsilon = 1e-10);
        }
    }
}

#[test]
fn admixed_sample_likelihood_is_finite_and_negative() {
    init_logging();
    let demo = pulse_demography(2, 0.3);
    let singleton = demo.configuration(&[("c", 1, 1)]).unwrap();
    let doubleton = demo.configuration(&[("c", 2, 0)]).unwrap();

    let p = SumProduct::new(&demo, &singleton)
        .unwrap()
        .p(true)
        .unwrap();
    assert!(p > 0.0 && p < 1.0, "normalized p = {p}");

    let ll = demo
        .log_likelihood_prf(0.5, &[(singleton, 3.0), (doubleton, 1.0)])
        .unwrap();
    assert!(ll.is_finite() && ll < 0.0, "ll = {ll}");
}

#[test]
fn branch_total_gradient_matches_finite_differences() {
    let total_at = |sizes: &[Dual<f64>]| -> Dual<f64> {
        let mut b = Demography::<Dual<f64>>::builder();
        let leaf_model = SizeModel::Constant {
            size: sizes[0],
            tau: Dual::constant(0.2),
        };
        let x = b.add_leaf("x", 2, leaf_model.clone()).unwrap();
        let y = b.add_leaf("y", 2, leaf_model).unwrap();
        let anc = b
            .add_population(
                "anc",
                SizeModel::Constant {
                    size: sizes[1],
                    tau: Dual::constant(f64::INFINITY),
                },
            )
            .unwrap();
        b.add_edge(anc, x).unwrap();
        b.add_edge(anc, y).unwrap();
        b.add_event((anc, x), (anc, y));
        b.build().unwrap().total_branch_length().unwrap()
    };

    let at = [0.5, 1.2];
    let grad = gradient(&total_at, &at);

    let scalar_total = |sizes: [f64; 2]| -> f64 {
        total_at(&[Dual::constant(sizes[0]), Dual::constant(sizes[1])]).value()
    };
    let h = 1e-6;
    for i in 0..2 {
        let mut up = at;
        let mut down = at;
        up[i] += h;
        down[i] -= h;
        let fd = (scalar_total(up) - scalar_total(down)) / (2.0 * h);
        assert_relative_eq!(grad[i], fd, max_relative = 1e-5);
    }
}

#[test]
fn log_likelihood_gradient_in_theta_is_analytic() {
    // d/d theta [-T theta/2 + w ln(p theta/2) - ln w!] = -T/2 + w/theta
    let demo = divergence_demography(0.1, 1.0);
    let config = demo.configuration(&[("x", 1, 1), ("y", 0, 2)]).unwrap();
    let total = demo.total_branch_length().unwrap();

    let mut b = Demography::<Dual<f64>>::builder();
    let leaf_model = SizeModel::Constant {
        size: Dual::constant(0.1),
        tau: Dual::constant(0.1),
    };
    let x = b.add_leaf("x", 2, leaf_model.clone()).unwrap();
    let y = b.add_leaf("y", 2, leaf_model).unwrap();
    let anc = b
        .add_population(
            "anc",
            SizeModel::Constant {
                size: Dual::constant(1.0),
                tau: Dual::constant(f64::INFINITY),
            },
        )
        .unwrap();
    b.add_edge(anc, x).unwrap();
    b.add_edge(anc, y).unwrap();
    b.add_event((anc, x), (anc, y));
    let dual_demo = b.build().unwrap();
    let dual_config = dual_demo.configuration(&[("x", 1, 1), ("y", 0, 2)]).unwrap();

    let weight = 3.0;
    let theta = Dual::variable(0.8);
    let ll = dual_demo
        .log_likelihood_prf(theta, &[(dual_config, weight)])
        .unwrap();

    // cross-check the value against the f64 evaluation
    let ll_f64 = demo
        .log_likelihood_prf(0.8, &[(config, weight)])
        .unwrap();
    assert_relative_eq!(ll.value(), ll_f64, epsilon = 1e-10);
    assert_relative_eq!(ll.eps, -total / 2.0 + weight / 0.8, max_relative = 1e-8);
}
