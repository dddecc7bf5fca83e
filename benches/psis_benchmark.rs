use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use mousestress::diagnostics::effective_sample_size;
use mousestress::psis::psis_loo;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Log-likelihood draws of Bernoulli observations under a jittered logit.
fn log_likelihood(draws: usize, n_obs: usize) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(0x5EED + (draws * n_obs) as u64);
    let eta: Vec<f64> = (0..n_obs).map(|_| rng.gen_range(-3.0..3.0)).collect();
    Array2::from_shape_fn((draws, n_obs), |(_, j)| {
        let noise: f64 = rng.sample(StandardNormal);
        let p = 1.0 / (1.0 + (-(eta[j] + 0.3 * noise)).exp());
        p.ln()
    })
}

fn autocorrelated_chain(draws: usize, seed: u64) -> Array1<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut value = 0.0;
    Array1::from_shape_fn(draws, |_| {
        let noise: f64 = rng.sample(StandardNormal);
        value = 0.7 * value + noise;
        value
    })
}

fn benchmark_psis_loo(c: &mut Criterion) {
    let shapes = [(1000_usize, 100_usize), (4000, 100), (4000, 500)];
    let mut group = c.benchmark_group("psis_loo");
    group.sample_size(20);
    for &(draws, n_obs) in &shapes {
        let log_lik = log_likelihood(draws, n_obs);
        let r_eff = vec![1.0; n_obs];
        group.throughput(Throughput::Elements((draws * n_obs) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{draws}x{n_obs}")),
            &log_lik,
            |b, input| {
                b.iter(|| {
                    let loo = psis_loo(black_box(input.view()), &r_eff);
                    black_box(loo.map(|l| l.looic).unwrap_or(f64::NAN));
                });
            },
        );
    }
    group.finish();
}

fn benchmark_ess(c: &mut Criterion) {
    let mut group = c.benchmark_group("effective_sample_size");
    for draws in [500_usize, 1000, 4000] {
        let chains: Vec<_> = (0..4).map(|k| autocorrelated_chain(draws, k)).collect();
        group.throughput(Throughput::Elements((4 * draws) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(draws), &chains, |b, input| {
            b.iter(|| {
                let views: Vec<_> = input.iter().map(|c| c.view()).collect();
                black_box(effective_sample_size(black_box(&views)).unwrap_or(f64::NAN));
            });
        });
    }
    group.finish();
}

criterion_group!(psis_benchmark, benchmark_psis_loo, benchmark_ess);
criterion_main!(psis_benchmark);
