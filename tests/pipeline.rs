//! End-to-end pipeline test: engine → chunk encoder → broker → persistence
//! → batch notifications, wired the same way the binary wires them.

use primordia_broker::{Broker, MemoryBroker};
use primordia_chunk::{ChunkEncoder, EncoderParams};
use primordia_notify::{start_topic_pump, NotifyService};
use primordia_organism::OrganismLimits;
use primordia_runtime::{QueueResource, ResourceRegistry};
use primordia_sim::{
    BasicInstructionSet, EnergyDrainPlugin, Sampler, SamplerConfig, SamplerService, Simulation,
};
use primordia_store::{
    BatchStorage, FileBatchStorage, IdempotencyTracker, MemoryIdempotencyTracker, PersistConfig,
    PersistService,
};
use primordia_types::{
    BatchInfo, Molecule, MoleculeType, SampleKind, Shape, SimulationMetadata, TickDataChunk,
    Topology,
};
use primordia_world::World;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn chunks_flow_from_engine_to_sealed_batches_and_notifications() {
    let data_dir = tempfile::tempdir().unwrap();
    let run_id = "run-e2e".to_string();

    // engine with one organism walking over mark instructions
    let mut world = World::new(Shape::new(vec![8, 8], Topology::Torus).unwrap());
    for col in [2, 4, 6] {
        world.set_molecule(Molecule::pack(0, MoleculeType::Code, 2), 0, &[1, col]);
    }
    let mut simulation = Simulation::new(
        run_id.clone(),
        world,
        Box::new(BasicInstructionSet::default()),
        42,
        8,
    );
    simulation.register_plugin(Box::new(EnergyDrainPlugin::new(1)));
    simulation
        .spawn_organism("walker", vec![1, 1], 10_000, OrganismLimits::default())
        .unwrap();

    // queues behind the resource registry, like the binary sets them up
    let mut registry = ResourceRegistry::new();
    registry.register_queue(QueueResource::new(
        "tick-data",
        Arc::new(MemoryBroker::new(32)) as Arc<dyn Broker<TickDataChunk>>,
    ));
    registry.register_queue(QueueResource::new(
        "metadata",
        Arc::new(MemoryBroker::new(4)) as Arc<dyn Broker<SimulationMetadata>>,
    ));
    registry.register_queue(QueueResource::new(
        "batch-info",
        Arc::new(MemoryBroker::new(32)) as Arc<dyn Broker<BatchInfo>>,
    ));

    // persistence
    let storage = Arc::new(FileBatchStorage::new(data_dir.path()));
    let tracker = Arc::new(MemoryIdempotencyTracker::new());
    let persist = PersistService::new(
        run_id.clone(),
        registry.acquire_queue("queue-in:tick-data").unwrap(),
        registry.acquire_queue("queue-out:batch-info").unwrap(),
        Arc::clone(&storage) as Arc<dyn BatchStorage>,
        Some(tracker as Arc<dyn IdempotencyTracker>),
        PersistConfig {
            max_batch_size: 4,
            batch_timeout: Duration::from_millis(200),
        },
    )
    .unwrap();
    let (mut persist_handle, counters) = persist.start("PersistService");

    // notification fan-out
    let (notify_thread, notify) = NotifyService::default().start(Some("NotifyService"));
    let subscriber = notify.subscribe_new_batch("test-subscriber");
    let (pump_exit_tx, pump_exit_rx) = primordia_channel::bounded(1);
    let pump = start_topic_pump(
        registry.acquire_queue("queue-in:batch-info").unwrap(),
        notify.clone(),
        pump_exit_rx,
    );

    // engine service
    let encoder = ChunkEncoder::new(
        run_id.clone(),
        64,
        EncoderParams {
            snapshot_interval: 2,
            accumulated_delta_interval: 1,
            chunk_interval: 4,
        },
    )
    .unwrap();
    let sampler = Sampler::new(simulation, encoder, 1).unwrap();
    let metadata = SimulationMetadata {
        simulation_run_id: run_id.clone(),
        start_time_ms: 1,
        initial_seed: 42,
        programs: Vec::new(),
        resolved_config_json: "{}".to_string(),
    };
    let sampler_service = SamplerService::new(
        sampler,
        registry.acquire_queue("queue-out:tick-data").unwrap(),
        registry.acquire_queue("queue-out:metadata").unwrap(),
        Some(metadata),
        SamplerConfig {
            sampling_interval: 1,
            yield_interval: 64,
            pause_ticks: Vec::new(),
        },
    );
    let mut sampler_handle = sampler_service.start("SamplerService");

    // at least two batches make it to storage and to a subscriber
    wait_until("batches written", || counters.batches_written() >= 2);
    sampler_handle.stop();
    persist_handle.stop();

    let first = subscriber.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first.simulation_run_id, run_id);
    assert_eq!(first.tick_start, 0);

    // the sealed file replays: every chunk opens with a snapshot and the
    // sample pacing matches the configured intervals
    let chunks: Vec<TickDataChunk> = storage
        .read_chunks(&first.storage_path)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert!(!chunks.is_empty());
    for chunk in &chunks {
        assert_eq!(chunk.run_id, run_id);
        assert_eq!(chunk.tick_count, 4);
        let kinds: Vec<SampleKind> = chunk.samples.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SampleKind::Snapshot,
                SampleKind::AccumulatedDelta,
                SampleKind::Snapshot,
                SampleKind::AccumulatedDelta,
            ]
        );
        // one living organism serialized per sample
        assert_eq!(chunk.snapshot.organisms.len(), 1);
        assert_eq!(chunk.snapshot.plugins.len(), 1);
    }

    // metadata was emitted exactly once
    let metadata_queue: Arc<dyn Broker<SimulationMetadata>> =
        registry.acquire_queue("queue-in:metadata").unwrap();
    assert_eq!(metadata_queue.produced_count(), 1);

    pump_exit_tx.send(()).unwrap();
    pump.join().unwrap();
    notify.stop();
    notify_thread.join().unwrap();
}
