//! knn-cli: brute-force k-nearest-neighbor search from the command line.

mod io;

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use knn_cuda::test_utils::{brute_force_knn, uniform_points};
use knn_cuda::{
    knn_search_with_config, CpuBackend, KnnError, KnnResult, KnnSearcher, PointSet,
    SearchConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// CUDA when available, CPU otherwise
    Auto,
    Cpu,
    Cuda,
}

#[derive(Parser)]
#[command(name = "knn-cli")]
#[command(about = "Brute-force k-nearest-neighbor search", long_about = None)]
#[command(version)]
struct Cli {
    /// Reference point file (one point per line, whitespace-separated)
    #[arg(long, value_name = "FILE", conflicts_with = "random_reference")]
    reference: Option<PathBuf>,

    /// Query point file
    #[arg(long, value_name = "FILE", conflicts_with = "random_query")]
    query: Option<PathBuf>,

    /// Generate N uniform random reference points instead of reading a file
    #[arg(long, value_name = "N")]
    random_reference: Option<usize>,

    /// Generate M uniform random query points instead of reading a file
    #[arg(long, value_name = "M")]
    random_query: Option<usize>,

    /// Dimension of generated points
    #[arg(long, default_value_t = 3)]
    dimension: usize,

    /// Seed for generated points
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Number of neighbors per query
    #[arg(short, default_value_t = 1)]
    k: usize,

    /// Compute backend
    #[arg(long, value_enum, default_value_t = Backend::Auto)]
    backend: Backend,

    /// CUDA device ordinal
    #[arg(long, default_value_t = 0)]
    device: usize,

    /// Fraction of free device memory to plan against
    #[arg(long, default_value_t = 0.8)]
    memory_fraction: f64,

    /// Upper bound on queries per batch
    #[arg(long, value_name = "N")]
    max_batch: Option<usize>,

    /// Write results here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Emit JSON instead of `index:distance` lines
    #[arg(long)]
    json: bool,

    /// Compare against an exact double-precision search and report the error
    #[arg(long)]
    verify: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let reference = load_or_generate(
        "reference",
        cli.reference.as_ref(),
        cli.random_reference,
        cli.dimension,
        cli.seed,
    )?;
    let query = load_or_generate(
        "query",
        cli.query.as_ref(),
        cli.random_query,
        cli.dimension,
        cli.seed.wrapping_add(1),
    )?;

    let mut builder = SearchConfig::builder()
        .memory_fraction(cli.memory_fraction)
        .device_id(cli.device)
        .use_gpu(cli.backend != Backend::Cpu);
    if let Some(max_batch) = cli.max_batch {
        builder = builder.max_batch_size(max_batch);
    }
    let config = builder.build()?;

    tracing::info!(
        reference = reference.len(),
        query = query.len(),
        dimension = reference.dimension(),
        k = cli.k,
        requested_backend = ?cli.backend,
        "starting kNN search"
    );

    let result = run_search(cli.backend, &reference, &query, cli.k, config)?;

    tracing::info!(
        backend = %result.backend,
        batch_size = result.batch_size,
        batch_count = result.batch_count,
        total_ms = result.timing.total_ms,
        "search finished"
    );

    if cli.verify {
        verify(&result, &reference, &query)?;
    }

    let rendered = if cli.json {
        io::format_json(&result)?
    } else {
        io::format_text(&result)
    };
    match &cli.output {
        Some(path) => fs::write(path, rendered)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => print!("{rendered}"),
    }

    Ok(())
}

fn load_or_generate(
    what: &str,
    path: Option<&PathBuf>,
    random: Option<usize>,
    dimension: usize,
    seed: u64,
) -> Result<PointSet> {
    match (path, random) {
        (Some(path), _) => io::load_points(path),
        (None, Some(count)) => uniform_points(count, dimension, seed)
            .with_context(|| format!("failed to generate {what} points")),
        (None, None) => bail!("no {what} points: pass --{what} FILE or --random-{what} N"),
    }
}

fn run_search(
    backend: Backend,
    reference: &PointSet,
    query: &PointSet,
    k: usize,
    config: SearchConfig,
) -> Result<KnnResult> {
    match backend {
        Backend::Cpu => {
            let backend = CpuBackend::new();
            let searcher = KnnSearcher::with_config(backend.clone(), config)?;
            let result = searcher.search(reference, query, k).map_err(explain)?;
            tracing::debug!(peak_bytes = backend.peak_bytes(), "host workspace peak");
            Ok(result)
        }
        Backend::Cuda => {
            #[cfg(feature = "cuda")]
            {
                let device = knn_cuda::CudaBackend::with_device_id(config.device_id)
                    .context("CUDA backend requested but could not be initialized")?;
                let searcher = KnnSearcher::with_config(device, config)?;
                searcher.search(reference, query, k).map_err(explain)
            }
            #[cfg(not(feature = "cuda"))]
            {
                let _ = config;
                bail!("CUDA backend requested but knn-cli was built without the `cuda` feature")
            }
        }
        Backend::Auto => knn_search_with_config(reference, query, k, &config).map_err(explain),
    }
}

/// Attach a hint that points at the flag or input to change.
fn explain(err: KnnError) -> anyhow::Error {
    let hint = if err.is_capacity_error() {
        "the reference set and one batch of queries must fit in the memory budget; \
         raise --memory-fraction or search a smaller reference set"
    } else if err.is_precondition_violation() {
        "check the point files, -k and the search flags"
    } else {
        "the search was aborted"
    };
    anyhow::Error::new(err).context(hint)
}

/// Recompute the search exactly and report the worst distance error.
fn verify(result: &KnnResult, reference: &PointSet, query: &PointSet) -> Result<()> {
    let expected = brute_force_knn(reference, query, result.k);
    let mut max_error = 0.0f64;
    let mut index_mismatches = 0usize;

    for (q, neighbors) in expected.iter().enumerate() {
        let got_indices = result.indices_for(q);
        let got_distances = result.distances_for(q);
        for (slot, &(index, distance)) in neighbors.iter().enumerate() {
            if !got_distances[slot].is_finite() {
                bail!(
                    "verification failed: query {q} slot {slot} has distance {}",
                    got_distances[slot]
                );
            }
            max_error = max_error.max((got_distances[slot] as f64 - distance).abs());
            if got_indices[slot] != index {
                index_mismatches += 1;
            }
        }
    }

    tracing::info!(
        max_distance_error = max_error,
        index_mismatches,
        "verified against exact search"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explain_hints_by_error_class() {
        let err = explain(KnnError::InsufficientMemory {
            requested_bytes: 2048,
            usable_bytes: 1024,
        });
        assert!(err.to_string().contains("--memory-fraction"));
        assert!(err.root_cause().to_string().contains("1024"));

        let err = explain(KnnError::InvalidK {
            k: 5,
            reference_count: 3,
        });
        assert!(err.to_string().contains("-k"));
    }

    #[test]
    fn test_cpu_search_reports_backend() {
        let reference = uniform_points(20, 2, 1).unwrap();
        let query = uniform_points(5, 2, 2).unwrap();
        let config = SearchConfig::builder().use_gpu(false).build().unwrap();

        let result = run_search(Backend::Cpu, &reference, &query, 3, config.clone()).unwrap();
        assert_eq!(result.backend, "cpu");
        let result = run_search(Backend::Auto, &reference, &query, 3, config).unwrap();
        assert_eq!(result.backend, "cpu");
    }
}
