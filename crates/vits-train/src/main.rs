use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::Command;
use tracing_subscriber::EnvFilter;
use vits_train::logger::{FanoutSink, FileSink, LogSink, TracingSink};
use vits_train::preprocess::{self, PreprocessArgs};
use vits_train::{HParams, Trainer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// モデルの学習を実行します (分散時は 1 プロセス = 1 ランク)
    Train(TrainArgs),
    /// 同一ホスト上に world_size 個の学習プロセスを起動します
    Launch(LaunchArgs),
    /// スペクトログラムを事前計算してキャッシュします
    Preprocess(PreprocessArgs),
}

#[derive(Parser, Debug)]
struct TrainArgs {
    /// ハイパーパラメータ JSON
    #[arg(long, short)]
    config: PathBuf,

    /// このプロセスのランク
    #[arg(long)]
    rank: Option<usize>,

    /// 全プロセス数
    #[arg(long)]
    world_size: Option<usize>,
}

#[derive(Parser, Debug)]
struct LaunchArgs {
    /// ハイパーパラメータ JSON
    #[arg(long, short)]
    config: PathBuf,

    /// 起動するプロセス数
    #[arg(long, default_value_t = 1)]
    world_size: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Train(args) => train(args),
        Commands::Launch(args) => launch(args),
        Commands::Preprocess(args) => run_preprocess(args),
    };

    if let Err(e) = result {
        eprintln!("\n[ERROR] Command failed with error:");
        eprintln!("{:?}", e);
        std::process::exit(1);
    }
}

fn train(args: TrainArgs) -> Result<()> {
    let hp = HParams::from_file(&args.config)?.with_identity(args.rank, args.world_size)?;
    let log_dir = hp.log_dir.clone();
    let mut trainer = Trainer::init(hp, |ctx| {
        let mut sinks: Vec<Box<dyn LogSink + Send>> = vec![Box::new(TracingSink)];
        if ctx.is_primary() {
            sinks.push(Box::new(FileSink::create(&log_dir)?));
        }
        Ok(FanoutSink::new(sinks))
    })
    .with_context(|| format!("failed to initialize trainer (log directory {:?})", log_dir))?;
    let summary = trainer.train()?;
    trainer.shutdown()?;
    println!(
        "Training completed: {} epochs, global step {}, {} checkpoint files.",
        summary.epochs_run,
        summary.global_step,
        summary.checkpoints.len()
    );
    Ok(())
}

/// 自分自身を `train --rank i --world-size n` で子プロセスとして起動する
fn launch(args: LaunchArgs) -> Result<()> {
    if args.world_size == 0 {
        bail!("--world-size must be positive");
    }
    let hp = HParams::from_file(&args.config)?;
    if !hp.distributed_run && args.world_size > 1 {
        bail!("world_size {} requested but distributed_run is false", args.world_size);
    }
    let exe = std::env::current_exe().context("failed to locate current executable")?;

    let mut children = Vec::with_capacity(args.world_size);
    for rank in 0..args.world_size {
        let child = Command::new(&exe)
            .arg("train")
            .arg("--config")
            .arg(&args.config)
            .arg("--rank")
            .arg(rank.to_string())
            .arg("--world-size")
            .arg(args.world_size.to_string())
            .spawn()
            .with_context(|| format!("failed to spawn rank {}", rank))?;
        tracing::info!(rank, pid = child.id(), "worker spawned");
        children.push((rank, child));
    }

    let mut failed = Vec::new();
    for (rank, mut child) in children {
        let status = child.wait().with_context(|| format!("failed to wait for rank {}", rank))?;
        if !status.success() {
            tracing::error!(rank, ?status, "worker failed");
            failed.push(rank);
        }
    }
    if !failed.is_empty() {
        bail!("ranks {:?} exited with failure", failed);
    }
    println!("All {} workers finished.", args.world_size);
    Ok(())
}

fn run_preprocess(args: PreprocessArgs) -> Result<()> {
    let hp = HParams::from_file(&args.config)?;
    preprocess::run(&hp, args.overwrite)?;
    Ok(())
}
