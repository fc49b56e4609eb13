//! Primordia entry point.
//!
//! Wires the configuration into the pipeline: world → engine → chunk
//! encoder → tick-data queue → persistence → batch notifications, then
//! runs until a stop signal arrives. Exit code 0 on a clean stop, 1 on an
//! unrecovered fatal error.

use clap::{Parser, Subcommand};
use primordia_app_config::AppConfig;
use primordia_broker::{Broker, JournalBroker, JournalConfig, MemoryBroker};
use primordia_chunk::{ChunkEncoder, EncoderParams};
use primordia_error::{Error, ErrorKind};
use primordia_logger::{error, info, warn};
use primordia_notify::{start_topic_pump, NotifyService};
use primordia_organism::OrganismLimits;
use primordia_runtime::{QueueResource, ResourceRegistry};
use primordia_sim::{
    BasicInstructionSet, PluginRegistry, Sampler, SamplerConfig, SamplerService, Simulation,
};
use primordia_stop_handler::{broadcast_exit_signals, new_crossbeam_exit_rx};
use primordia_store::{
    BatchStorage, FileBatchStorage, IdempotencyTracker, MemoryIdempotencyTracker, PersistConfig,
    PersistService,
};
use primordia_systemtime::unix_time_as_millis;
use primordia_types::{
    BatchInfo, ProgramArtifact, Shape, SimulationMetadata, TickDataChunk,
};
use primordia_world::World;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const STALL_SKIP_CAP: usize = 16;

#[derive(Parser)]
#[command(name = "primordia", about = "Artificial-life data-generation pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a simulation until interrupted
    Run {
        /// Path of the TOML configuration
        #[arg(short, long)]
        config: PathBuf,
        /// Data directory for journals and batch files
        #[arg(long, default_value = "primordia-data")]
        data_dir: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_default_env().init();
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run { config, data_dir } => run(&config, &data_dir),
    };
    if let Err(e) = result {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

fn run(config_path: &PathBuf, data_dir: &PathBuf) -> Result<(), Error> {
    let mut config = AppConfig::load(config_path)?;
    config.apply_env_overrides()?;
    let run_id = format!("run-{}", unix_time_as_millis());
    info!("starting simulation {}", run_id);

    // world and engine
    let shape = Shape::new(
        config.engine.environment.shape.clone(),
        config.engine.environment.topology,
    )?;
    let world = World::new(shape);
    let mut simulation = Simulation::new(
        run_id.clone(),
        world,
        Box::new(BasicInstructionSet::default()),
        config.engine.seed,
        STALL_SKIP_CAP,
    );

    let plugin_registry = PluginRegistry::new();
    for plugin_config in &config.engine.plugins {
        let plugin = plugin_registry.build(&plugin_config.name, &plugin_config.options)?;
        simulation.register_plugin(plugin);
    }

    let mut programs: Vec<ProgramArtifact> = Vec::new();
    for organism_config in &config.engine.organisms {
        let program_id = organism_config
            .program
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let artifact = std::fs::read(&organism_config.program).map_err(|e| {
            ErrorKind::ResourceUnavailable
                .other(format!("{}: {}", organism_config.program.display(), e))
        })?;
        programs.push(ProgramArtifact {
            program_id: program_id.clone(),
            artifact,
        });
        simulation.spawn_organism(
            &program_id,
            organism_config.placement_positions.clone(),
            organism_config.initial_energy,
            OrganismLimits::default(),
        )?;
    }

    // queues, registered as named resources and acquired through bindings
    let mut registry = ResourceRegistry::new();
    let coalescing_delay = Duration::from_millis(config.broker.coalescing_delay_ms);
    let mut journal_to_stop: Option<Arc<JournalBroker<TickDataChunk>>> = None;
    let tick_data_queue: Arc<dyn Broker<TickDataChunk>> =
        if let Some(capacity) = config.broker.capacity {
            Arc::new(
                MemoryBroker::new(capacity)
                    .coalescing_delay(coalescing_delay)
                    .stop_signal(new_crossbeam_exit_rx()),
            )
        } else {
            let max_size_bytes = config
                .broker
                .max_size_bytes
                .expect("validated: one of capacity/max_size_bytes");
            let journal = Arc::new(JournalBroker::open(JournalConfig {
                path: data_dir.join("journal").join("tick-data"),
                max_size_bytes,
                coalescing_delay,
            })?);
            journal_to_stop = Some(Arc::clone(&journal));
            journal
        };
    registry.register_queue(QueueResource::new("tick-data", tick_data_queue));

    let metadata_queue: Arc<dyn Broker<SimulationMetadata>> = Arc::new(MemoryBroker::new(4));
    registry.register_queue(QueueResource::new("metadata", metadata_queue));

    let batch_topic: Arc<dyn Broker<BatchInfo>> = Arc::new(MemoryBroker::new(128));
    registry.register_queue(QueueResource::new("batch-info", batch_topic));

    // persistence
    let storage: Arc<dyn BatchStorage> = Arc::new(FileBatchStorage::new(data_dir.join("batches")));
    let tracker: Arc<dyn IdempotencyTracker> = Arc::new(MemoryIdempotencyTracker::new());
    let persist = PersistService::new(
        run_id.clone(),
        registry.acquire_queue::<TickDataChunk>("queue-in:tick-data")?,
        registry.acquire_queue::<BatchInfo>("queue-out-direct:batch-info")?,
        storage,
        Some(tracker),
        PersistConfig {
            max_batch_size: config.persistence.max_batch_size,
            batch_timeout: Duration::from_secs(config.persistence.batch_timeout_seconds),
        },
    )?;
    let (mut persist_handle, persist_counters) = persist.start("PersistService");

    // notifications
    let (notify_thread, notify) = NotifyService::default().start(Some("NotifyService"));
    let progress_rx = notify.subscribe_new_batch("cli-progress");
    let progress_thread = std::thread::Builder::new()
        .name("cli-progress".into())
        .spawn(move || {
            while let Ok(info) = progress_rx.recv() {
                info!(
                    "batch {} covering ticks {}..={}",
                    info.storage_path, info.tick_start, info.tick_end
                );
            }
        })
        .expect("start progress thread should ok");
    let pump_thread = start_topic_pump(
        registry.acquire_queue::<BatchInfo>("queue-in-direct:batch-info")?,
        notify.clone(),
        new_crossbeam_exit_rx(),
    );

    // engine
    let encoder = ChunkEncoder::new(
        run_id.clone(),
        simulation.world().total_cells(),
        EncoderParams {
            snapshot_interval: config.engine.snapshot_interval,
            accumulated_delta_interval: config.engine.accumulated_delta_interval,
            chunk_interval: config.engine.chunk_interval,
        },
    )?;
    let sampler = Sampler::new(simulation, encoder, config.engine.sampling_interval)?;
    let metadata = SimulationMetadata {
        simulation_run_id: run_id.clone(),
        start_time_ms: unix_time_as_millis(),
        initial_seed: config.engine.seed,
        programs,
        resolved_config_json: config.resolved_json(),
    };
    let sampler_service = SamplerService::new(
        sampler,
        registry.acquire_queue::<TickDataChunk>("queue-out:tick-data")?,
        registry.acquire_queue::<SimulationMetadata>("queue-out:metadata")?,
        Some(metadata),
        SamplerConfig {
            sampling_interval: config.engine.sampling_interval,
            yield_interval: config.engine.yield_interval,
            pause_ticks: config.engine.pause_ticks.clone(),
        },
    );
    let mut sampler_handle = sampler_service.start("SamplerService");

    // run until interrupted
    let exit_rx = new_crossbeam_exit_rx();
    ctrlc::set_handler(broadcast_exit_signals)
        .map_err(|e| ErrorKind::Internal.other(format!("signal handler: {}", e)))?;
    let _ = exit_rx.recv();
    info!("stop signal received, draining");

    // unblock any producer stuck on backpressure, stop the engine so no new
    // chunks arrive, then let persistence finish its in-flight batch
    if let Some(journal) = journal_to_stop {
        journal.shutdown();
    }
    sampler_handle.stop();
    persist_handle.stop();
    notify.stop();
    if pump_thread.join().is_err() {
        warn!("batch topic pump panicked");
    }
    if notify_thread.join().is_err() {
        warn!("notify service panicked");
    }
    drop(progress_thread);

    info!(
        "clean stop: {} batches, {} chunks, {} duplicates skipped",
        persist_counters.batches_written(),
        persist_counters.chunks_written(),
        persist_counters.duplicates()
    );
    Ok(())
}
