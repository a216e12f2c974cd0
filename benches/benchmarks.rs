use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::{Array, Array2};
use ndarray_rand::rand_distr::{StandardNormal, Uniform};
use ndarray_rand::RandomExt;
use vd_reml::{regularize, vd_reml, InputData, VdRemlConfig};

// Random relatedness from 0/1 genotypes and unrelated phenotypes.
fn generate_input(n_samples: usize, n_traits: usize) -> InputData {
    let snps = Array::random((n_samples, 500), Uniform::new(0., 1.)).mapv(|u: f64| if u < 0.2 { 1.0 } else { 0.0 });
    let kinship = snps.dot(&snps.t()) / 100.0;
    let phenotypes: Array2<f64> = Array::random((n_samples, n_traits), StandardNormal);
    let samples: Vec<String> = (0..n_samples).map(|i| format!("SID{}", i)).collect();
    let traits: Vec<String> = (0..n_traits).map(|i| format!("PID{}", i)).collect();
    let mut data = InputData::new();
    data.add_phenotypes(phenotypes, traits, samples.clone()).unwrap();
    data.add_relatedness(kinship, samples).unwrap();
    data
}

fn bench_regularize(c: &mut Criterion) {
    let mut group = c.benchmark_group("regularize");
    for &p in [5usize, 20, 100].iter() {
        let a: Array2<f64> = Array::random((p, p), StandardNormal);
        let m = &a + &a.t();
        group.bench_with_input(BenchmarkId::new("regularize", p), &m, |b, m| {
            b.iter(|| regularize(m).unwrap());
        });
    }
    group.finish();
}

fn bench_vd_reml(c: &mut Criterion) {
    let mut group = c.benchmark_group("vd_reml");
    group.sample_size(10);
    let config = VdRemlConfig { iterations: 1, verbose: false, ..Default::default() };
    for &(n_samples, n_traits) in [(100, 5), (500, 5), (500, 10)].iter() {
        let data = generate_input(n_samples, n_traits);
        group.bench_with_input(
            BenchmarkId::new("vd_reml", format!("{}x{}", n_samples, n_traits)),
            &data,
            |b, data| b.iter(|| vd_reml(data, &config).unwrap()),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_regularize, bench_vd_reml);
criterion_main!(benches);
