use anyhow::Result;
use clap::Parser;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use mamba2::{LayerWeights, Mamba2Config, Mamba2Layer, ScanKind, SequenceBatch};

/// Runs a Mamba2 layer over a random batch, once in bulk and once by priming a session on a
/// prefix and stepping through the rest, and reports how far apart the two are.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON config file, missing fields take their default value.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Flat f32 checkpoint, the layer is randomly initialized when not set.
    #[arg(long)]
    weights: Option<std::path::PathBuf>,

    /// Where to write the weights that were used.
    #[arg(long)]
    save_weights: Option<std::path::PathBuf>,

    #[arg(long)]
    d_model: Option<usize>,

    #[arg(long)]
    scan: Option<ScanKind>,

    #[arg(long)]
    chunk_size: Option<usize>,

    #[arg(long, default_value_t = 64)]
    seq_len: usize,

    /// Timesteps processed by `prime`, the remaining ones go through `step`.
    /// Defaults to all but the last timestep.
    #[arg(long)]
    prefix_len: Option<usize>,

    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    #[arg(long, default_value_t = 299792458)]
    seed: u64,

    /// Used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn random_batch<R: Rng>(
    rng: &mut R,
    batch_size: usize,
    seq_len: usize,
    width: usize,
) -> Result<SequenceBatch> {
    let sequences = (0..batch_size)
        .map(|_| (0..seq_len * width).map(|_| rng.gen_range(-1f32..1f32)).collect())
        .collect();
    Ok(SequenceBatch::new(width, sequences)?)
}

fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(a, b)| (a - b).abs()).fold(0f32, f32::max)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut cfg = match &args.config {
        Some(p) => Mamba2Config::from_json_file(p)?,
        None => Mamba2Config::default(),
    };
    if let Some(d_model) = args.d_model {
        cfg.d_model = d_model
    }
    if let Some(scan) = args.scan {
        cfg.scan = scan
    }
    if let Some(chunk_size) = args.chunk_size {
        cfg.chunk_size = chunk_size
    }
    cfg.validate()?;
    tracing::info!(?cfg, "config");

    let mut rng = StdRng::seed_from_u64(args.seed);
    let weights = match &args.weights {
        Some(p) => LayerWeights::from_file(&cfg, p)?,
        None => LayerWeights::init(&cfg, &mut rng)?,
    };
    if let Some(p) = &args.save_weights {
        weights.save(p)?;
        tracing::info!(path = %p.display(), "saved weights");
    }
    let layer = Mamba2Layer::new(0, cfg.clone(), weights)?;

    let prefix_len = args.prefix_len.unwrap_or(args.seq_len.saturating_sub(1));
    if prefix_len > args.seq_len {
        anyhow::bail!("prefix length {prefix_len} is longer than the sequence ({})", args.seq_len)
    }
    let inputs = random_batch(&mut rng, args.batch_size, args.seq_len, cfg.d_model)?;

    let start = std::time::Instant::now();
    let bulk = layer.forward(&inputs)?;
    let dt = start.elapsed();
    println!(
        "bulk: {} x {} steps ({:.2} step/s)",
        args.batch_size,
        args.seq_len,
        (args.batch_size * args.seq_len) as f64 / dt.as_secs_f64(),
    );

    let start = std::time::Instant::now();
    let mut session = layer.begin(args.batch_size);
    let primed = session.prime(&inputs.narrow(0, prefix_len)?)?;
    let mut max_diff = 0f32;
    for (i, seq) in primed.sequences().iter().enumerate() {
        max_diff = max_diff.max(max_abs_diff(seq, &bulk.sequence(i)[..seq.len()]));
    }
    let d = cfg.d_model;
    for t in prefix_len..args.seq_len {
        let xs: Vec<f32> = (0..args.batch_size).flat_map(|i| inputs.row(i, t).to_vec()).collect();
        let ys = session.step(&xs)?;
        for (i, y) in ys.chunks(d).enumerate() {
            max_diff = max_diff.max(max_abs_diff(y, bulk.row(i, t)));
        }
    }
    session.end();
    let dt = start.elapsed();
    println!(
        "prime {prefix_len} + step {}: {:.2}ms, max abs diff to bulk {max_diff:.3e}",
        args.seq_len - prefix_len,
        dt.as_secs_f64() * 1e3,
    );
    Ok(())
}
