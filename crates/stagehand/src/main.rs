use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use stagehand::Result;
use stagehand::controller::Controller;
use stagehand::outputs::OutputWriter;
use stagehand::round::{Round, RoundCtx, StdoutSink};
use stagehand::runner::ProcessRunner;
use stagehand::store::Resolved;
use stagehand::variant::{Arch, Variant};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute one staging round
    Run {
        /// Path to a stage configuration TOML
        #[arg(long, default_value = "stage.toml")]
        config: PathBuf,
        /// Terminal marker: a previous round already completed the build
        #[arg(long)]
        finished: bool,
        /// Resume from the latest checkpoint instead of starting fresh
        #[arg(long)]
        resume: bool,
        /// Target architecture (x64, x86, arm)
        #[arg(long, default_value = "x64")]
        arch: String,
        /// Feature level selector (empty disables the flag)
        #[arg(long, default_value = "sse3")]
        simd: String,
        /// Resume from this exact checkpoint ref instead of name lookup
        #[arg(long)]
        checkpoint_ref: Option<String>,
    },
    /// Print the checkpoint a resuming round would use, without running it
    Resolve {
        #[arg(long, default_value = "stage.toml")]
        config: PathBuf,
        #[arg(long, default_value = "x64")]
        arch: String,
        #[arg(long, default_value = "sse3")]
        simd: String,
        #[arg(long)]
        checkpoint_ref: Option<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    match args.cmd {
        Command::Run {
            config,
            finished,
            resume,
            arch,
            simd,
            checkpoint_ref,
        } => cmd_run(&config, finished, resume, &arch, &simd, checkpoint_ref),
        Command::Resolve {
            config,
            arch,
            simd,
            checkpoint_ref,
        } => cmd_resolve(&config, &arch, &simd, checkpoint_ref),
    }
}

fn variant_from(arch: &str, simd: &str) -> Result<Variant> {
    let simd = simd.trim();
    let simd = (!simd.is_empty()).then(|| simd.to_string());
    Ok(Variant::new(Arch::parse(arch)?, simd))
}

fn cmd_run(
    config: &PathBuf,
    finished: bool,
    resume: bool,
    arch: &str,
    simd: &str,
    checkpoint_ref: Option<String>,
) -> Result<()> {
    let cfg = stagehand::config::load(config)?;
    let round = Round {
        finished,
        resume_requested: resume,
        variant: variant_from(arch, simd)?,
        explicit_checkpoint_ref: checkpoint_ref,
    };

    let store = cfg.store_client()?;
    let bootstrap = (!cfg.build.bootstrap.is_empty()).then(|| cfg.build.bootstrap.clone());
    let runner = ProcessRunner::new(
        cfg.build.program.clone(),
        cfg.build.script.clone(),
        cfg.build.parallelism,
        bootstrap,
    );
    let outputs = OutputWriter::from_env();
    let ctx = RoundCtx::new(Arc::new(StdoutSink));

    let controller = Controller::new(&cfg, &store, &runner, &outputs);
    controller.run_round(&round, &ctx)?;
    Ok(())
}

fn cmd_resolve(
    config: &PathBuf,
    arch: &str,
    simd: &str,
    checkpoint_ref: Option<String>,
) -> Result<()> {
    let cfg = stagehand::config::load(config)?;
    let variant = variant_from(arch, simd)?;
    let store = cfg.store_client()?;
    let name = variant.checkpoint_name();
    match store.resolve(&name, checkpoint_ref.as_deref())? {
        Resolved::Ref(ref_id) => println!("{name}: ref {ref_id}"),
        Resolved::RejectedExplicit(raw) => println!("{name}: explicit ref '{raw}' is malformed"),
        Resolved::NotFound => println!("{name}: no resumable checkpoint"),
    }
    Ok(())
}
