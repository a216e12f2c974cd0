use ndarray::{Array2, Axis};
use ndarray_rand::rand_distr::{StandardNormal, Uniform};
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use vd_reml::linalg_backends::symmetric_eigen;
use vd_reml::{vd_reml, InputData, VdRemlConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (n, s, p) = (100, 1000, 5);
    let mut rng = ChaCha8Rng::seed_from_u64(10);

    let snps = Array2::random_using((n, s), Uniform::new(0.0, 1.0), &mut rng)
        .mapv(|u: f64| if u < 0.2 { 1.0 } else { 0.0 });
    let kinship = snps.dot(&snps.t()) / 10.0;
    let y: Array2<f64> = Array2::random_using((n, p), StandardNormal, &mut rng);

    let eig = symmetric_eigen(&kinship)?;
    let half = &eig.eigenvectors * &eig.eigenvalues.mapv(|v| v.max(0.0).sqrt()).insert_axis(Axis(0));
    let phenotypes = half.dot(&eig.eigenvectors.t()).dot(&y);

    let samples: Vec<String> = (1..=n).map(|i| format!("SID{}", i)).collect();
    let traits: Vec<String> = (1..=p).map(|i| format!("PID{}", i)).collect();
    let mut data = InputData::new();
    data.add_phenotypes(phenotypes, traits, samples.clone())?;
    data.add_relatedness(kinship, samples)?;

    let result = vd_reml(&data, &VdRemlConfig { verbose: false, ..Default::default() })?;
    println!("converged: {}", result.converged);
    println!("min eigenvalues before regularization: Cg {:e}, Cn {:e}", result.cg_min_eigenvalue, result.cn_min_eigenvalue);
    let (cg, cn, seconds) = result.into_parts();
    println!("Cg =\n{:.4}", cg);
    println!("Cn =\n{:.4}", cn);
    println!("fitted in {:.3}s", seconds);
    Ok(())
}
