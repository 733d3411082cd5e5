use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::{Device, Tensor};
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use nano_specinfer::{
    AttentionConfig, AttentionLayer, AttentionWeights, BatchConfig, BatchLimits, BitMask,
    CommittedTokenInfo, Communicator, EngineConfig, ExecutionContext, InferenceMode, KernelPath,
    LocalCommunicator, RequestSlots, Result, ThreadCommunicator,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Incremental,
    Speculative,
    TreeVerify,
}

impl From<Mode> for InferenceMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Incremental => InferenceMode::Incremental,
            Mode::Speculative => InferenceMode::Speculative,
            Mode::TreeVerify => InferenceMode::TreeVerify,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kernel {
    Fused,
    Batched,
}

#[derive(Parser, Debug)]
#[command(name = "nano-specinfer")]
#[command(about = "Drive a paged KV-cache attention layer through synthetic batches")]
struct Args {
    /// JSON engine configuration (defaults to a small demo layer)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Attention variant to run
    #[arg(long, value_enum, default_value = "incremental")]
    mode: Mode,

    /// Override the configured kernel family
    #[arg(long, value_enum)]
    kernel: Option<Kernel>,

    /// Number of concurrent requests
    #[arg(long, default_value = "2")]
    requests: usize,

    /// Prompt tokens per request
    #[arg(long, default_value = "8")]
    prompt_len: usize,

    /// Decode / speculation rounds after the prompt
    #[arg(long, default_value = "4")]
    rounds: usize,

    /// Seed for weights and activations
    #[arg(long, default_value = "0")]
    seed: u64,
}

fn demo_config() -> EngineConfig {
    EngineConfig {
        limits: BatchLimits {
            max_requests_per_batch: 8,
            max_tokens_per_batch: 256,
            max_sequence_length: 128,
            max_spec_tree_token_num: 16,
        },
        attention: AttentionConfig {
            hidden_size: 256,
            num_q_heads: 4,
            num_kv_heads: 4,
            head_dim: 64,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Per-request driver state.
struct RequestState {
    slot: usize,
    guid: u64,
    /// Committed history length.
    depth: usize,
    /// Growing draft tree (speculative mode).
    tree: Option<BitMask>,
    /// Accepted path of the previous verify round.
    pending_commit: Vec<CommittedTokenInfo>,
}

fn build_batch(
    round: usize,
    mode: InferenceMode,
    limits: BatchLimits,
    states: &mut [RequestState],
    args: &Args,
    rng: &mut StdRng,
) -> Result<BatchConfig> {
    let mut bc = BatchConfig::new(mode, limits);
    for state in states.iter_mut() {
        if round == 0 {
            let tokens: Vec<u32> = (0..args.prompt_len).map(|_| rng.gen_range(0..32000)).collect();
            bc.add_prompt(state.slot, state.guid, &tokens)?;
            state.depth = args.prompt_len;
            continue;
        }
        match mode {
            InferenceMode::Incremental => {
                bc.add_decode(state.slot, state.guid, state.depth, &[rng.gen_range(0..32000)])?;
                state.depth += 1;
            }
            InferenceMode::Speculative => {
                // Each round drafts one more node under the newest one.
                let tree = match state.tree.take() {
                    None => BitMask::from_parents(
                        state.depth,
                        &[None],
                        limits.max_spec_tree_token_num,
                    )?,
                    Some(mut tree) => {
                        let newest = tree.tree_size() - 1;
                        tree.append_nodes(&[Some(newest)])?;
                        tree
                    }
                };
                bc.add_tree_layer(state.slot, state.guid, tree.clone(), &[rng.gen_range(0..32000)])?;
                state.tree = Some(tree);
            }
            InferenceMode::TreeVerify => {
                bc.add_committed(state.pending_commit.drain(..))?;
                let tokens: Vec<u32> = (0..3).map(|_| rng.gen_range(0..32000)).collect();
                bc.add_tree(
                    state.slot,
                    state.guid,
                    state.depth,
                    &tokens,
                    &[None, Some(0), Some(0)],
                )?;
                // Pretend verification accepts the root and its second child.
                state.pending_commit =
                    CommittedTokenInfo::accepted_path(state.slot, state.depth, &[0, 2]);
                state.depth += 2;
            }
        }
    }
    Ok(bc)
}

fn run_shard(config: &EngineConfig, comm: Box<dyn Communicator>, args: &Args) -> Result<()> {
    let rank = comm.rank();
    let world_size = comm.world_size();
    let ctx = ExecutionContext::new(Device::Cpu, comm, config.memory_budget_bytes);

    // Every shard draws identical full weights and inputs from the seed.
    let mut rng = StdRng::seed_from_u64(args.seed);
    let full = AttentionWeights::random(&config.attention, &mut rng, ctx.device())?;
    let weights = full.shard(&config.attention, rank, world_size)?;
    let mode: InferenceMode = args.mode.into();
    let mut layer = AttentionLayer::<f32>::new(&ctx, config, mode, weights)?;

    let mut slots = RequestSlots::new(config.limits.max_requests_per_batch);
    let mut states = Vec::with_capacity(args.requests);
    for guid in 0..args.requests as u64 {
        states.push(RequestState {
            slot: slots.acquire(guid)?,
            guid,
            depth: 0,
            tree: None,
            pending_commit: Vec::new(),
        });
    }

    for round in 0..=args.rounds {
        let bc = build_batch(round, mode, config.limits, &mut states, args, &mut rng)?;
        let num_tokens = bc.num_active_tokens();
        let input: Vec<f32> = (0..num_tokens * config.attention.hidden_size)
            .map(|_| rng.gen_range(-1.0..1.0))
            .collect();
        let input = Tensor::from_vec(input, (num_tokens, config.attention.hidden_size), ctx.device())?;

        let output = layer.forward(&ctx, &bc, &input)?;
        let mean_abs: f32 = output.abs()?.mean_all()?.to_scalar()?;
        if rank == 0 {
            tracing::info!(round, num_tokens, mean_abs, "round finished");
        }
    }

    let mut lengths: HashMap<u64, usize> = HashMap::new();
    for state in &states {
        lengths.insert(state.guid, state.depth);
        slots.release(state.guid);
    }
    tracing::info!(rank, ?lengths, "all rounds finished");
    Ok(())
}

fn run(args: &Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => demo_config(),
    };
    if let Some(kernel) = args.kernel {
        config.attention.kernel = match kernel {
            Kernel::Fused => KernelPath::Fused,
            Kernel::Batched => KernelPath::Batched,
        };
    }
    config.validate()?;

    tracing::info!(
        mode = ?args.mode,
        kernel = ?config.attention.kernel,
        tensor_parallel_size = config.tensor_parallel_size,
        requests = args.requests,
        "nano-specinfer v{}",
        env!("CARGO_PKG_VERSION")
    );

    if config.tensor_parallel_size == 1 {
        return run_shard(&config, Box::new(LocalCommunicator), args);
    }

    let group = ThreadCommunicator::group(config.tensor_parallel_size);
    std::thread::scope(|scope| {
        let handles: Vec<_> = group
            .into_iter()
            .map(|comm| {
                let config = &config;
                scope.spawn(move || run_shard(config, Box::new(comm), args))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(nano_specinfer::Error::Collective("shard thread panicked".into()))
                })
            })
            .collect::<Result<Vec<()>>>()
    })?;
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(&args) {
        tracing::error!(error = %e, "run failed");
        std::process::exit(1);
    }
}
