use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
};

use anyhow::{bail, Context};
use clap::Parser;
use cli_table::{format::Justify, print_stdout, Cell, CellStruct, Style, Table};
use pagekv_core::{
    initialize_logging, BlockAllocator, CacheConfig, SamplingParams, Sequence, SequenceId,
    SequenceIdAllocator, SequenceSnapshot, SequenceStatus,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{info, warn};

const VOCAB_SIZE: u32 = 32_000;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON cache config. Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tokens per block.
    #[arg(long)]
    block_size: Option<usize>,

    /// Number of physical blocks in the pool.
    #[arg(long)]
    num_blocks: Option<usize>,

    /// Number of requests to simulate.
    #[arg(long, short = 'n', default_value_t = 64)]
    num_seqs: usize,

    /// Leading prompt tokens shared by every request.
    #[arg(long, default_value_t = 512)]
    shared_prefix_len: usize,

    /// Prompt length of each request, including the shared prefix.
    #[arg(long, short = 'p', default_value_t = 1024)]
    prompt_len: usize,

    /// Tokens to generate per request.
    #[arg(long, short = 'g', default_value_t = 128)]
    gen_len: usize,

    /// Maximum number of concurrently running requests.
    #[arg(long, default_value_t = 16)]
    max_running: usize,

    /// Seed for the synthetic prompts and generated tokens.
    #[arg(short, long)]
    seed: Option<u64>,
}

/// Receiver-side copies of every running sequence, kept current purely from
/// snapshot bytes.
#[derive(Default)]
struct WireMirror {
    replicas: HashMap<SequenceId, Sequence>,
    prompt_msgs: usize,
    prompt_bytes: usize,
    decode_msgs: usize,
    decode_bytes: usize,
}

impl WireMirror {
    /// Seed a replica the first time a sequence is admitted. A resumed
    /// sequence already has one.
    fn admit(&mut self, seq: &Sequence) -> anyhow::Result<()> {
        if self.replicas.contains_key(&seq.id()) {
            return Ok(());
        }
        let bytes = seq.snapshot().to_bytes()?;
        self.prompt_msgs += 1;
        self.prompt_bytes += bytes.len();
        let replica = Sequence::from_snapshot(
            seq.id(),
            seq.block_size(),
            SequenceSnapshot::from_bytes(&bytes)?,
        )?;
        self.replicas.insert(seq.id(), replica);
        Ok(())
    }

    /// Ship the state after one appended token.
    fn sync(&mut self, seq: &Sequence) -> anyhow::Result<()> {
        let bytes = seq.snapshot().to_bytes()?;
        self.decode_msgs += 1;
        self.decode_bytes += bytes.len();
        let replica = self
            .replicas
            .get_mut(&seq.id())
            .with_context(|| format!("no replica for seq {}", seq.id()))?;
        replica.apply_snapshot(SequenceSnapshot::from_bytes(&bytes)?)?;
        Ok(())
    }

    fn retire(&mut self, seq: &Sequence) -> anyhow::Result<()> {
        let replica = self
            .replicas
            .remove(&seq.id())
            .with_context(|| format!("no replica for seq {}", seq.id()))?;
        if replica.token_ids() != seq.token_ids() {
            bail!("replica of seq {} diverged from the sender", seq.id());
        }
        Ok(())
    }
}

#[derive(Default)]
struct SimResult {
    steps: usize,
    finished: usize,
    preemptions: usize,
    generated_tokens: usize,
    peak_usage: f64,
}

fn make_prompts(args: &Args, rng: &mut StdRng) -> Vec<Vec<u32>> {
    let prefix_len = args.shared_prefix_len.min(args.prompt_len);
    let prefix: Vec<u32> = (0..prefix_len).map(|_| rng.gen_range(0..VOCAB_SIZE)).collect();
    (0..args.num_seqs)
        .map(|_| {
            let mut prompt = prefix.clone();
            prompt.extend((prefix_len..args.prompt_len).map(|_| rng.gen_range(0..VOCAB_SIZE)));
            prompt
        })
        .collect()
}

fn preempt(alloc: &mut BlockAllocator, seq: &mut Sequence, result: &mut SimResult) {
    warn!(
        "Preempting seq {} ({} tokens), {} blocks free.",
        seq.id(),
        seq.num_tokens(),
        alloc.num_free_blocks()
    );
    alloc.deallocate(seq);
    seq.set_status(SequenceStatus::Waiting);
    result.preemptions += 1;
}

fn reached_limit(seq: &Sequence) -> bool {
    seq.num_completion_tokens() >= seq.sampling_params().max_tokens
}

fn finish(
    alloc: &mut BlockAllocator,
    mirror: &mut WireMirror,
    mut seq: Sequence,
    result: &mut SimResult,
) -> anyhow::Result<()> {
    alloc.deallocate(&mut seq);
    seq.set_status(SequenceStatus::Finished);
    mirror.retire(&seq)?;
    result.finished += 1;
    Ok(())
}

fn simulate(
    alloc: &mut BlockAllocator,
    mirror: &mut WireMirror,
    mut waiting: VecDeque<Sequence>,
    max_running: usize,
    rng: &mut StdRng,
) -> anyhow::Result<SimResult> {
    let mut result = SimResult::default();
    let mut running: VecDeque<Sequence> = VecDeque::new();

    while !waiting.is_empty() || !running.is_empty() {
        result.steps += 1;

        // Admit in arrival order while the pool has room.
        while running.len() < max_running {
            let Some(seq) = waiting.front() else {
                break;
            };
            if seq.num_blocks() > alloc.num_blocks() {
                bail!(
                    "seq {} needs {} blocks but the pool only has {}",
                    seq.id(),
                    seq.num_blocks(),
                    alloc.num_blocks()
                );
            }
            if !alloc.can_allocate(seq) {
                break;
            }
            let Some(mut seq) = waiting.pop_front() else {
                break;
            };
            alloc.allocate(&mut seq)?;
            seq.set_status(SequenceStatus::Running);
            mirror.admit(&seq)?;
            running.push_back(seq);
        }
        if running.is_empty() {
            bail!(
                "no sequence could be admitted with {} free blocks",
                alloc.num_free_blocks()
            );
        }

        // One decode step for every running sequence.
        let mut scheduled = VecDeque::with_capacity(running.len());
        'next: while let Some(mut seq) = running.pop_front() {
            seq.append_token(rng.gen_range(0..VOCAB_SIZE));
            result.generated_tokens += 1;
            while !alloc.can_append(&seq) {
                match running.pop_back() {
                    Some(mut victim) => {
                        preempt(alloc, &mut victim, &mut result);
                        waiting.push_front(victim);
                    }
                    None => {
                        // The token that hit the limit needs no KV slot.
                        if reached_limit(&seq) {
                            mirror.sync(&seq)?;
                            finish(alloc, mirror, seq, &mut result)?;
                        } else {
                            preempt(alloc, &mut seq, &mut result);
                            mirror.sync(&seq)?;
                            waiting.push_front(seq);
                        }
                        continue 'next;
                    }
                }
            }
            alloc.may_append(&mut seq)?;
            mirror.sync(&seq)?;

            if reached_limit(&seq) {
                finish(alloc, mirror, seq, &mut result)?;
            } else {
                scheduled.push_back(seq);
            }
        }
        running = scheduled;
        result.peak_usage = result.peak_usage.max(alloc.usage());
    }

    Ok(result)
}

#[allow(clippy::cast_precision_loss)]
fn mean_bytes(bytes: usize, msgs: usize) -> f64 {
    if msgs == 0 {
        0.0
    } else {
        bytes as f64 / msgs as f64
    }
}

fn print_results(
    alloc: &BlockAllocator,
    mirror: &WireMirror,
    result: &SimResult,
) -> anyhow::Result<()> {
    let stats = alloc.stats();
    let rows = vec![
        ("block size", alloc.block_size().to_string()),
        ("blocks", stats.total_blocks.to_string()),
        ("steps", result.steps.to_string()),
        ("finished", result.finished.to_string()),
        ("generated tokens", result.generated_tokens.to_string()),
        ("preemptions", result.preemptions.to_string()),
        ("peak usage", format!("{:.1}%", 100.0 * result.peak_usage)),
        ("prefix hits", stats.prefix_cache_hits.to_string()),
        ("prefix misses", stats.prefix_cache_misses.to_string()),
        ("hit rate", format!("{:.1}%", stats.hit_rate())),
        (
            "prompt snapshot",
            format!("{:.1} B", mean_bytes(mirror.prompt_bytes, mirror.prompt_msgs)),
        ),
        (
            "decode snapshot",
            format!("{:.1} B", mean_bytes(mirror.decode_bytes, mirror.decode_msgs)),
        ),
    ];

    let rows: Vec<Vec<CellStruct>> = rows
        .into_iter()
        .map(|(name, value)| vec![name.cell(), value.cell().justify(Justify::Right)])
        .collect();

    let table = rows
        .table()
        .title(vec!["metric".cell().bold(true), "value".cell().bold(true)])
        .bold(true);
    print_stdout(table)?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    initialize_logging();

    let mut config = match &args.config {
        Some(path) => CacheConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(block_size) = args.block_size {
        config.block_size = block_size;
    }
    if let Some(num_blocks) = args.num_blocks {
        config.num_blocks = num_blocks;
    }
    config.validate()?;
    if args.max_running == 0 {
        bail!("--max-running must be at least 1");
    }
    info!("Cache config: {}", serde_json::to_string(&config)?);

    let seed = args.seed.unwrap_or_else(rand::random);
    info!("Using seed {seed}.");
    let mut rng = StdRng::seed_from_u64(seed);

    let ids = SequenceIdAllocator::new();
    let params = SamplingParams {
        max_tokens: args.gen_len,
        ..Default::default()
    };
    let waiting: VecDeque<Sequence> = make_prompts(&args, &mut rng)
        .into_iter()
        .map(|prompt| Sequence::new(&ids, prompt, config.block_size, params.clone()))
        .collect();

    let mut alloc = BlockAllocator::from_config(&config);
    let mut mirror = WireMirror::default();
    let result = simulate(&mut alloc, &mut mirror, waiting, args.max_running, &mut rng)?;

    alloc.check_integrity()?;
    if alloc.num_used_blocks() != 0 {
        bail!("{} blocks still referenced after the run", alloc.num_used_blocks());
    }
    print_results(&alloc, &mirror, &result)
}
