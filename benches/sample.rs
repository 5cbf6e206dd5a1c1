use abc_pmc::test_models::{LinearGaussian, NormalMeans};
use abc_pmc::{
    basic_abc, calc_weights, pmc_abc, AbcModel, KernelSettings, PerturbationKernel, PmcSettings,
    Proposal,
};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

fn criterion_benchmark(c: &mut Criterion) {
    let model = LinearGaussian::new(20., 1., 1., 100.).unwrap();
    c.bench_function("prior round 1d 2000", |b| {
        b.iter(|| basic_abc(&model, black_box(10.), 2000, Proposal::Prior, 42).unwrap())
    });

    let population = basic_abc(&model, 10., 2000, Proposal::Prior, 42).unwrap();
    let thetas = population.accepted_thetas();
    let weights = vec![1. / thetas.len() as f64; thetas.len()];
    let kernel =
        PerturbationKernel::from_population(&thetas, &weights, &KernelSettings::default()).unwrap();
    let previous = population.summary().accepted;
    let current = basic_abc(
        &model,
        5.,
        2000,
        Proposal::Pmc {
            previous: &previous,
            kernel: &kernel,
        },
        43,
    )
    .unwrap()
    .accepted_thetas();

    c.bench_function("calc_weights 1d", |b| {
        b.iter(|| calc_weights(&previous, black_box(&current), &kernel, model.prior()).unwrap())
    });

    let model = NormalMeans::new(&[2., 3., 4.], 10, 0., 10.).unwrap();
    let settings = PmcSettings {
        epsilon_0: 5.,
        steps: 4,
        max_iter: 1000,
        min_acc_rate: 0.,
        ..Default::default()
    };
    for num_threads in [1, 4] {
        c.bench_function(&format!("pmc 3d 4 rounds, {} threads", num_threads), |b| {
            b.iter_batched(
                || PmcSettings {
                    num_threads,
                    ..settings
                },
                |settings| pmc_abc(&model, &settings, None).unwrap(),
                BatchSize::SmallInput,
            )
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
