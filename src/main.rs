//! quantpatch CLI - inspect and patch quantized checkpoints
//!
//! Loads GGUF or safetensors checkpoints without expanding them, applies
//! delta files on top, and reports what had to be materialized.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use rs_quantpatch::{
    load_deltas,
    utils::{format_bytes, parse_device},
    Checkpoint, DevicePlan, DeviceRoles, ParameterStore, PatchedModelHandle, PatcherConfig,
    StorageConfig, StorageState,
};

#[derive(Parser)]
#[command(name = "quantpatch")]
#[command(author, version, about = "Lazy patching for quantized checkpoints", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StorageArgs {
    /// Models directory holding the default roots
    #[arg(long, env = "QUANTPATCH_MODELS_DIR", default_value = "models")]
    base_dir: PathBuf,

    /// Storage config JSON, replacing the default roots
    #[arg(long)]
    storage_config: Option<PathBuf>,
}

impl StorageArgs {
    fn load(&self) -> anyhow::Result<StorageConfig> {
        let storage = match &self.storage_config {
            Some(path) => StorageConfig::from_file(path)?,
            None => StorageConfig::with_base_dir(&self.base_dir),
        };
        Ok(storage)
    }

    /// `model` as given, or looked up under `root` when one is named
    fn locate(&self, model: &Path, root: Option<&str>) -> anyhow::Result<PathBuf> {
        let Some(root) = root else {
            return Ok(model.to_path_buf());
        };
        let name = model.to_string_lossy();
        Ok(self.load()?.resolve(root, &name)?)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List checkpoints under a storage root
    List {
        #[command(flatten)]
        storage: StorageArgs,

        /// Root to list
        #[arg(long, default_value = "diffusion_models")]
        root: String,
    },

    /// Show the tensors of a checkpoint
    Info {
        /// Checkpoint path, or a file name under `--root`
        #[arg(short, long)]
        model: PathBuf,

        /// Storage root to find the checkpoint in
        #[arg(long)]
        root: Option<String>,

        #[command(flatten)]
        storage: StorageArgs,
    },

    /// Load a checkpoint, apply a delta file, and report the result
    Patch {
        /// Checkpoint path, or a file name under `--root`
        #[arg(short, long)]
        model: PathBuf,

        /// Storage root to find the checkpoint in
        #[arg(long)]
        root: Option<String>,

        #[command(flatten)]
        storage: StorageArgs,

        /// Safetensors file of deltas
        #[arg(short, long)]
        patch: PathBuf,

        /// Multiplier for every delta
        #[arg(long, default_value = "1.0")]
        strength: f64,

        /// Load device: cpu, auto, cuda[:N], metal[:N]
        #[arg(long, default_value = "cpu")]
        device: String,

        /// Device for backups and parked patches
        #[arg(long, default_value = "cpu")]
        offload_device: String,

        /// Compute dtype, overriding the config
        #[arg(long)]
        dtype: Option<String>,

        /// Patcher config JSON
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rs_quantpatch=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List { storage, root } => {
            list_models(&storage.load()?, &root)?;
        }

        Commands::Info {
            model,
            root,
            storage,
        } => {
            show_info(&storage.locate(&model, root.as_deref())?)?;
        }

        Commands::Patch {
            model,
            root,
            storage,
            patch,
            strength,
            device,
            offload_device,
            dtype,
            config,
        } => {
            let mut patcher = match config {
                Some(path) => PatcherConfig::from_file(path)?,
                None => PatcherConfig::default(),
            };
            if let Some(dtype) = dtype {
                patcher.compute_dtype = dtype;
                patcher.compute_dtype()?;
            }
            let model = storage.locate(&model, root.as_deref())?;
            patch_model(&model, &patch, strength, &device, &offload_device, patcher)?;
        }
    }

    Ok(())
}

fn list_models(storage: &StorageConfig, root: &str) -> anyhow::Result<()> {
    let files = storage.list(root)?;
    if files.is_empty() {
        println!("No checkpoints under '{}'", root);
        return Ok(());
    }
    for file in files {
        println!("{}", file);
    }
    Ok(())
}

fn show_info(model_path: &Path) -> anyhow::Result<()> {
    let checkpoint = Checkpoint::open(model_path)?;

    println!("Checkpoint Information");
    println!("======================");
    println!("Format: {:?}", checkpoint.format());
    println!("Tensors: {}", checkpoint.len());
    println!("Size: {}", format_bytes(checkpoint.total_bytes() as u64));

    if !checkpoint.metadata().is_empty() {
        println!("\nMetadata");
        println!("========");
        for (key, value) in checkpoint.metadata() {
            println!("{}: {}", key, value);
        }
    }

    println!("\nTensors");
    println!("=======");
    for block in checkpoint.blocks() {
        println!(
            "{:<60} {:>6} {:?} {}",
            block.name(),
            format!("{:?}", block.kind()),
            block.shape(),
            format_bytes(block.byte_len() as u64)
        );
    }

    Ok(())
}

fn patch_model(
    model_path: &Path,
    patch_path: &Path,
    strength: f64,
    device: &str,
    offload_device: &str,
    config: PatcherConfig,
) -> anyhow::Result<()> {
    let load = parse_device(device)?;
    let offload = parse_device(offload_device)?;
    println!("Load device: {:?}, offload device: {:?}", load, offload);

    let checkpoint = Arc::new(Checkpoint::open(model_path)?);
    let store = Arc::new(RwLock::new(ParameterStore::from_checkpoint(&checkpoint, &offload)));
    let roles = DeviceRoles::new(load.clone(), offload.clone());
    let mut handle = PatchedModelHandle::new(&store, checkpoint.clone(), roles).with_config(config);

    let patches = load_deltas(patch_path, strength, &offload)?;
    let total = patches.len();
    let accepted = handle.add_patches(patches);
    println!(
        "Accepted patches for {} weights ({} patches in file)",
        accepted.len(),
        total
    );

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(format!("Loading {} weights...", checkpoint.len()));
    pb.enable_steady_tick(Duration::from_millis(100));

    let report = handle.first_load(&DevicePlan::all_on(load));

    pb.finish_and_clear();
    let report = report?;

    println!("\nPatch Report");
    println!("============");
    println!("Dense: {}", report.dense.len());
    println!("Quantized: {}", report.quantized.len());
    println!("Released from mmap: {}", report.released);
    println!("Still mapped: {}", checkpoint.mapped_blocks());
    println!("Model size: {}", format_bytes(handle.model_size()? as u64));

    let materialized = handle
        .backing()
        .records()
        .filter(|r| r.state == StorageState::Materialized)
        .count();
    println!("Materialized records: {}", materialized);

    if !report.failures.is_empty() {
        println!("\nFailures");
        println!("========");
        for (key, err) in &report.failures {
            println!("{}: {}", key, err);
        }
    }

    Ok(())
}
