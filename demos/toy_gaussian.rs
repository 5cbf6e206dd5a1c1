//! Infer the location of a noisy one dimensional toy model.
//!
//! Run with `RUST_LOG=abc_pmc=debug` for per-round details.

use std::time::Duration;

use abc_pmc::{pmc_abc, test_models::LinearGaussian, PmcSettings, Progress, ProgressCallback};
use anyhow::Context;
use arrow::array::Array;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let model = LinearGaussian::new(20., 1., 1., 100.)?;
    let settings = PmcSettings {
        epsilon_0: 50.,
        steps: 10,
        max_iter: 2000,
        target_acc_rate: 0.05,
        num_threads: 4,
        seed: 42,
        ..Default::default()
    };

    let progress = ProgressCallback {
        callback: Box::new(|progress: &Progress| {
            if progress.elapsed > Duration::from_secs(1) {
                info!(
                    round = progress.round,
                    evaluated = progress.evaluated,
                    total = progress.total,
                    "Still sampling"
                );
            }
        }),
        rate: 500,
    };

    let trace = pmc_abc(&model, &settings, Some(progress))?;
    info!(rounds = trace.len(), termination = ?trace.termination, "Finished");

    let last = trace.last().context("run produced no rounds")?;
    let mean = last.accepted().posterior_mean();
    let cov = last.accepted().posterior_covariance()?;
    println!(
        "tau = {:.3} ± {:.3} (epsilon {:.3}, {} accepted, ess {:.1})",
        mean[0],
        cov[(0, 0)].sqrt(),
        last.epsilon(),
        last.n_accepted(),
        last.ess(),
    );

    let table = trace.to_arrow()?;
    println!("{} rounds exported, columns {:?}", table.len(), table.column_names());
    Ok(())
}
