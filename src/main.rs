//! wasm-tiering CLI entry point.
//!
//! Loads a TOML configuration, instantiates a simulated module and drives
//! calls and loop back-edges through the tier-up coordinator, then reports
//! which tier every function ended up in.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wasm_tiering_common::{ConfigFile, SimulationConfig, TieringConfig};
use wasm_tiering_core::{
    FunctionCodeBlock, FunctionDefinition, FunctionIndex, MemoryMode, PlanStatus, TagFilter,
    TagIndex, TieringEngine,
};
use wasm_tiering_host::{ModuleCalleeGroup, ModuleInfo, SignatureIndex, TrampolineBinder};

/// Calls issued between yields to the compiler pool.
const YIELD_EVERY: u64 = 1_024;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Simulate tier-up of a WebAssembly module.
#[derive(Debug, Parser)]
#[command(name = "wasm-tiering", version, about)]
struct Cli {
    /// TOML configuration file. Defaults are used when omitted.
    #[arg(short, long, env = "WASM_TIERING_CONFIG")]
    config: Option<PathBuf>,

    /// Override the number of simulated calls.
    #[arg(long)]
    calls: Option<u64>,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text", env = "WASM_TIERING_LOG_FORMAT")]
    log_format: LogFormat,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,wasm_tiering=debug".into());
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    info!("Starting wasm-tiering");

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ConfigFile::default(),
    };
    if let Some(calls) = cli.calls {
        config.simulation.calls = calls;
    }
    config
        .tiering
        .validate()
        .context("Invalid tiering configuration")?;

    info!(
        functions = config.simulation.functions,
        imports = config.simulation.imports,
        calls = config.simulation.calls,
        "Configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .max_blocking_threads(config.tiering.compiler.worker_threads)
        .enable_all()
        .build()
        .context("Failed to build the compiler runtime")?;

    runtime.block_on(simulate(&config.tiering, &config.simulation))
}

/// Module with one loop, one try region and a call to the next function in
/// every function body.
fn simulated_module(simulation: &SimulationConfig) -> ModuleInfo {
    let len = u32::try_from(simulation.bytecode_len.max(8)).unwrap_or(u32::MAX);
    let functions = (0..simulation.functions)
        .map(|i| {
            let block = FunctionCodeBlock::new(vec![0u8; len as usize])
                .with_locals(2)
                .with_loop(len / 4, 1)
                .with_try(len / 8..len / 2, TagFilter::Tag(TagIndex(0)))
                .with_try(len / 4..len / 2, TagFilter::CatchAll)
                .with_call(FunctionIndex((i + 1) % simulation.functions));
            FunctionDefinition::named(format!("func{i}"), block)
        })
        .collect();

    ModuleInfo {
        import_signatures: (0..simulation.imports).map(SignatureIndex).collect(),
        functions,
    }
}

async fn simulate(tiering: &TieringConfig, simulation: &SimulationConfig) -> anyhow::Result<()> {
    let engine = TieringEngine::new(tiering).context("Failed to create tiering engine")?;
    let binder = TrampolineBinder::new(engine.allocator().clone());
    let owner = ModuleCalleeGroup::create(&engine, simulated_module(simulation), &binder)
        .context("Failed to instantiate module")?;
    let coordinator =
        engine.coordinator(Arc::clone(owner.group()), tokio::runtime::Handle::current());

    let mode = if simulation.signaling_memory {
        MemoryMode::Signaling
    } else {
        MemoryMode::BoundsChecking
    };

    let mut osr_entries = 0u64;
    if simulation.functions > 0 {
        for call in 0..simulation.calls {
            let index = FunctionIndex(
                u32::try_from(call % u64::from(simulation.functions)).unwrap_or_default(),
            );
            coordinator.on_call(index, mode);

            if index.0 == 0 {
                for _ in 0..simulation.back_edges_per_call {
                    if coordinator.on_loop_back_edge(index, mode, 0).is_some() {
                        osr_entries += 1;
                        break;
                    }
                }
            }

            if call % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }
    } else {
        warn!("Module defines no functions, nothing to simulate");
    }

    coordinator.wait_idle().await;

    let group = coordinator.group();
    for callee in group.iter() {
        let target = group.call_target(callee.index(), mode);
        info!(
            function = %callee.identity(),
            tier = %target.mode(),
            entry = %target.entrypoint(),
            osr_entry = group.osr_entry(callee.index(), mode).is_some(),
            "Final tier"
        );
    }

    let plans = coordinator.plans();
    let installed = plans
        .iter()
        .filter(|(_, status)| *status == PlanStatus::Installed)
        .count();
    let failed = plans
        .iter()
        .filter(|(_, status)| matches!(status, PlanStatus::Failed(_)))
        .count();

    info!(
        plans = plans.len(),
        installed,
        failed,
        osr_entries,
        executable_bytes_in_use = engine.allocator().bytes_in_use(),
        "Simulation finished"
    );

    Ok(())
}
