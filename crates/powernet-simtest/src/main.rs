//! Powernet Headless Validation Harness
//!
//! Validates settlement math, clustering, persistence, and replication
//! without any host engine. Runs entirely in-process: no DB, no real
//! networking, no rendering.
//!
//! Usage:
//!   cargo run -p powernet-simtest
//!   cargo run -p powernet-simtest -- --verbose
//!   cargo run -p powernet-simtest -- --config path/to/power_config.json

use powernet_logic::config::PowerConfig;
use serde::Deserialize;
use powernet_logic::conduit::{ConduitMode, ConduitState};
use powernet_logic::consumer::ConsumerState;
use powernet_logic::entity::PrefabKind;
use powernet_logic::geometry::Vec3;
use powernet_logic::resolve::{self, NetworkView};
use powernet_logic::source::SourceState;
use powernet_logic::storage::StorageState;
use powernet_server::record::{keys, FieldValue, MemoryStore, RecordStore};
use powernet_server::replication::{LoopbackTransport, ReservationLedger, WireMessage};
use powernet_server::PowerSystem;

// ── Settlement scenario table (JSON, same shape a tuning file uses) ─────

const SCENARIOS_JSON: &str = include_str!("../data/settlement_scenarios.json");

#[derive(Debug, Deserialize)]
struct SettlementScenario {
    name: String,
    /// (fuel, output_rate) per source.
    sources: Vec<(f32, f32)>,
    /// (energy, capacity) per storage.
    storages: Vec<(f32, f32)>,
    /// demand per consumer, all demanding.
    consumers: Vec<f32>,
    expected_delivered: f32,
}

// ── Test harness ────────────────────────────────────────────────────────

struct TestResult {
    name: String,
    passed: bool,
    detail: String,
}

fn check(name: &str, passed: bool, detail: String) -> TestResult {
    TestResult {
        name: name.into(),
        passed,
        detail,
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let verbose = args.iter().any(|a| a == "--verbose");
    let config = load_config(&args);

    println!("=== Powernet Simulation Harness ===\n");

    let mut results = Vec::new();

    // 1. Configuration sanity
    results.extend(validate_config(&config));

    // 2. Settlement scenarios
    results.extend(validate_settlement(verbose));

    // 3. Clustering properties
    results.extend(validate_clustering(&config));

    // 4. Full cycle: persistence + replication
    results.extend(validate_full_cycle(&config, verbose));

    // 5. Single-pass strategy consistency
    results.extend(validate_single_pass());

    // 6. Scenario table sweep
    results.extend(validate_scenario_table(verbose));

    // ── Summary ──
    println!();
    let passed = results.iter().filter(|r| r.passed).count();
    let failed = results.iter().filter(|r| !r.passed).count();
    let total = results.len();

    for r in &results {
        let icon = if r.passed { "✓" } else { "✗" };
        if !r.passed || verbose {
            println!("  {} {}: {}", icon, r.name, r.detail);
        }
    }

    println!(
        "\n=== RESULT: {}/{} passed, {} failed ===",
        passed, total, failed
    );

    if failed > 0 {
        std::process::exit(1);
    }
}

/// Load a config from `--config <path>`, falling back to defaults.
fn load_config(args: &[String]) -> PowerConfig {
    let path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1));
    let Some(path) = path else {
        return PowerConfig::default();
    };
    match std::fs::read_to_string(path).map_err(|e| e.to_string()).and_then(|text| {
        serde_json::from_str::<PowerConfig>(&text).map_err(|e| e.to_string())
    }) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config {}: {} (using defaults)", path, err);
            PowerConfig::default()
        }
    }
}

// ── 1. Configuration ────────────────────────────────────────────────────

fn validate_config(config: &PowerConfig) -> Vec<TestResult> {
    println!("--- Configuration ---");
    let mut results = Vec::new();

    results.push(check(
        "config_spatial_positive",
        config.join_distance > 0.0 && config.notify_range > 0.0,
        format!(
            "join {} / notify {} / span warn {}",
            config.join_distance, config.notify_range, config.cluster_span_warn
        ),
    ));

    results.push(check(
        "config_span_bound_exceeds_join",
        config.cluster_span_warn > config.join_distance,
        "span sanity bound must dwarf the join threshold".into(),
    ));

    // Serde roundtrip keeps every field.
    let roundtrip: Result<PowerConfig, _> =
        serde_json::to_string(config).and_then(|s| serde_json::from_str(&s));
    results.push(check(
        "config_json_roundtrip",
        roundtrip.as_ref().map(|c| c == config).unwrap_or(false),
        "config survives JSON roundtrip".into(),
    ));

    results
}

// ── 2. Settlement scenarios ─────────────────────────────────────────────

fn validate_settlement(verbose: bool) -> Vec<TestResult> {
    println!("--- Settlement ---");
    let mut results = Vec::new();

    // Source meets consumer; fuel burns exactly what was drawn.
    let mut view = NetworkView::default();
    let mut gen = SourceState::new(100.0, 5.0);
    gen.fuel = 10.0;
    view.sources.push((1, gen));
    let mut machine = ConsumerState::new(3.0);
    machine.is_demanding = true;
    view.consumers.push((2, machine));

    let settlement = resolve::resolve(1.0, &view);
    resolve::apply(&mut view, &settlement);
    if verbose {
        println!(
            "  source scenario: granted {:?}, fuel left {}",
            settlement.consumer_grants, view.sources[0].1.fuel
        );
    }
    results.push(check(
        "settle_source_meets_demand",
        settlement.consumer_grants == vec![(2, 3.0)] && view.sources[0].1.fuel == 7.0,
        format!("delivered 3, fuel 10 -> {}", view.sources[0].1.fuel),
    ));

    // Storage discharge order: richer storage first, nothing negative.
    let mut view = NetworkView::default();
    view.storages.push((1, StorageState::new(100.0)));
    let mut charged = StorageState::new(100.0);
    charged.energy = 50.0;
    view.storages.push((2, charged));
    let mut machine = ConsumerState::new(60.0);
    machine.is_demanding = true;
    view.consumers.push((3, machine));

    let settlement = resolve::resolve(1.0, &view);
    resolve::apply(&mut view, &settlement);
    let delivered: f32 = settlement.consumer_grants.iter().map(|(_, a)| a).sum();
    results.push(check(
        "settle_discharge_order",
        (delivered - 50.0).abs() < 1e-4
            && view.storages.iter().all(|(_, s)| s.energy >= 0.0),
        format!("delivered {} of 60, storages non-negative", delivered),
    ));

    // Conservation with a mixed grid.
    let mut view = NetworkView::default();
    let mut gen = SourceState::new(50.0, 4.0);
    gen.fuel = 6.0;
    view.sources.push((1, gen));
    let mut bat = StorageState::new(40.0);
    bat.energy = 12.0;
    view.storages.push((2, bat));
    let mut machine = ConsumerState::new(9.0);
    machine.is_demanding = true;
    view.consumers.push((3, machine));
    let mut pad = ConduitState::new(ConduitMode::Drain);
    pad.update_pool(7, 2.0, 20.0);
    view.conduits.push((4, pad));

    let settlement = resolve::resolve(1.0, &view);
    results.push(check(
        "settle_conservation",
        settlement.total_granted() <= settlement.total_committed() + 1e-4,
        format!(
            "granted {:.2} <= committed {:.2}",
            settlement.total_granted(),
            settlement.total_committed()
        ),
    ));

    let peek_bound = settlement.storage_commits.iter().all(|(id, c)| {
        settlement
            .discharge_peeks
            .iter()
            .find(|(pid, _)| pid == id)
            .map(|(_, p)| c <= p)
            .unwrap_or(false)
    });
    results.push(check(
        "settle_commit_within_peek",
        peek_bound,
        "every storage commit stays within its peek".into(),
    ));

    results
}

// ── 3. Clustering ───────────────────────────────────────────────────────

fn validate_clustering(config: &PowerConfig) -> Vec<TestResult> {
    println!("--- Clustering ---");
    let mut results = Vec::new();

    let build = |positions: &[(u64, f32)]| {
        let mut system = PowerSystem::new(config.clone());
        let mut store = MemoryStore::new();
        for &(id, x) in positions {
            store.insert(id, Vec3::new(x, 0.0, 0.0));
            system.observe_record_loaded(&store, id, PrefabKind::Machine);
        }
        let mut transport = LoopbackTransport::new();
        system.tick(&mut store, &mut transport, 0.0);
        (system, store)
    };

    // Transitivity: chain within threshold joins even when the ends are
    // farther apart than the threshold.
    let step = config.join_distance * 0.75;
    let (system, _) = build(&[(1, 0.0), (2, step), (3, step * 2.0)]);
    let net = |id: u64| system.registry.get(id).map(|e| e.data.network_id.clone());
    results.push(check(
        "cluster_transitive",
        net(1) == net(3) && net(1).map(|n| !n.is_empty()).unwrap_or(false),
        "A-B-C chain lands in one network".into(),
    ));

    // Idempotence: membership stable across a forced second rebuild.
    let (mut system, mut store) = build(&[(1, 0.0), (2, 10.0), (3, 90.0), (4, 99.0)]);
    let partition = |system: &PowerSystem| {
        let mut nets: Vec<(String, u64)> = system
            .registry
            .entries()
            .map(|e| (e.data.network_id.clone(), e.id))
            .collect();
        nets.sort();
        let mut groups: Vec<Vec<u64>> = Vec::new();
        let mut last: Option<String> = None;
        for (net, id) in nets {
            if last.as_deref() != Some(net.as_str()) {
                groups.push(Vec::new());
                last = Some(net);
            }
            if let Some(group) = groups.last_mut() {
                group.push(id);
            }
        }
        groups.sort();
        groups
    };
    let first = partition(&system);
    system.clusters.rebuild(&mut system.registry, &mut store);
    let second = partition(&system);
    results.push(check(
        "cluster_idempotent",
        first == second,
        format!("{:?} == {:?}", first, second),
    ));

    // Singleton: removing one of a pair leaves a fresh singleton net.
    let (mut system, mut store) = build(&[(1, 0.0), (2, 8.0)]);
    let before = net_of(&system, 2);
    system.observe_record_removed(1);
    store.remove(1);
    let mut transport = LoopbackTransport::new();
    system.tick(&mut store, &mut transport, 0.0);
    let after = net_of(&system, 2);
    results.push(check(
        "cluster_singleton_fresh_id",
        !after.is_empty() && after != before,
        format!("{} -> {}", before, after),
    ));

    results
}

fn net_of(system: &PowerSystem, id: u64) -> String {
    system
        .registry
        .get(id)
        .map(|e| e.data.network_id.clone())
        .unwrap_or_default()
}

// ── 4. Full cycle ───────────────────────────────────────────────────────

fn validate_full_cycle(config: &PowerConfig, verbose: bool) -> Vec<TestResult> {
    println!("--- Full Cycle ---");
    let mut results = Vec::new();

    let mut system = PowerSystem::new(config.clone());
    let mut store = MemoryStore::new();
    let mut transport = LoopbackTransport::new();
    system.replicator.bind(&mut transport);

    store.insert(1, Vec3::new(0.0, 0.0, 0.0));
    store.set(1, keys::FUEL, FieldValue::Float(30.0));
    store.set(1, keys::FUEL_OUTPUT_RATE, FieldValue::Float(5.0));
    store.insert(2, Vec3::new(6.0, 0.0, 0.0));
    store.set(2, keys::IS_DEMANDING, FieldValue::Bool(true));
    system.observe_record_loaded(&store, 1, PrefabKind::Generator);
    system.observe_record_loaded(&store, 2, PrefabKind::Machine);

    // Observer 10 stands next to the grid; observer 20 is far away.
    system.replicator.update_observer(10, Vec3::new(3.0, 0.0, 0.0));
    system
        .replicator
        .update_observer(20, Vec3::new(config.notify_range * 10.0, 0.0, 0.0));

    let report = system.tick(&mut store, &mut transport, 1.0);
    if verbose {
        println!("  tick report: {:?}", report);
    }
    results.push(check(
        "cycle_notify_scoped",
        report.notified == vec![10] && transport.drain(20).is_empty(),
        format!("notified {:?}", report.notified),
    ));

    results.push(check(
        "cycle_fuel_persisted",
        store.get(1, keys::FUEL).and_then(|v| v.as_float()) == Some(27.0),
        format!("fuel on record: {:?}", store.get(1, keys::FUEL)),
    ));

    // Steady state writes nothing further.
    let fields_before = store.field_count(1);
    if let Some(entry) = system.registry.get_mut(2) {
        if let Some(consumer) = entry.data.as_consumer_mut() {
            consumer.is_demanding = false;
        }
    }
    let report = system.tick(&mut store, &mut transport, 1.0);
    results.push(check(
        "cycle_dirty_write_minimality",
        report.changed.is_empty() && store.field_count(1) == fields_before,
        "idle tick produced zero persisted writes".into(),
    ));

    // Fuel RPC: reservation released only after the commit message.
    let mut ledger = ReservationLedger::new();
    let correlation = ledger.reserve(5.0);
    system.replicator.handle_inbound(
        &mut transport,
        &mut system.registry,
        10,
        WireMessage::FuelAddRequest {
            entity: 1,
            amount: 5.0,
            correlation,
        },
    );
    let commit_received = transport
        .drain(10)
        .iter()
        .any(|m| *m == WireMessage::FuelAddCommit { correlation });
    results.push(check(
        "cycle_fuel_rpc_commit",
        commit_received && ledger.release(correlation) == Some(5.0),
        "fuel request answered with a commit before discard".into(),
    ));

    results
}

// ── 5. Single-pass strategy ─────────────────────────────────────────────

fn validate_single_pass() -> Vec<TestResult> {
    println!("--- Single Pass ---");
    let mut results = Vec::new();

    let mut view = NetworkView::default();
    let mut gen = SourceState::new(100.0, 5.0);
    gen.fuel = 10.0;
    view.sources.push((1, gen));
    let mut machine = ConsumerState::new(3.0);
    machine.is_demanding = true;
    view.consumers.push((2, machine));

    let summary = resolve::resolve_single_pass(1.0, &mut view);
    results.push(check(
        "single_pass_scenario",
        summary.consumer_grants == vec![(2, 3.0)] && view.sources[0].1.fuel == 7.0,
        format!("delivered 3, fuel left {}", view.sources[0].1.fuel),
    ));

    let supplied = summary.supplied_by_sources + summary.supplied_by_storages;
    results.push(check(
        "single_pass_conserves",
        summary.total_granted() <= supplied + 1e-4,
        format!("granted {:.2} <= supplied {:.2}", summary.total_granted(), supplied),
    ));

    results
}

// ── 6. Scenario table ───────────────────────────────────────────────────

fn validate_scenario_table(verbose: bool) -> Vec<TestResult> {
    println!("--- Scenario Table ---");
    let mut results = Vec::new();

    let scenarios: Vec<SettlementScenario> = match serde_json::from_str(SCENARIOS_JSON) {
        Ok(s) => s,
        Err(e) => {
            results.push(check(
                "scenarios_parse",
                false,
                format!("JSON parse error: {}", e),
            ));
            return results;
        }
    };
    results.push(check(
        "scenarios_parse",
        !scenarios.is_empty(),
        format!("{} scenarios loaded", scenarios.len()),
    ));

    for scenario in &scenarios {
        let mut view = NetworkView::default();
        let mut next_id = 1u64;
        for &(fuel, rate) in &scenario.sources {
            let mut source = SourceState::new(fuel.max(100.0), rate);
            source.fuel = fuel;
            view.sources.push((next_id, source));
            next_id += 1;
        }
        for &(energy, capacity) in &scenario.storages {
            let mut storage = StorageState::new(capacity);
            storage.energy = energy;
            view.storages.push((next_id, storage));
            next_id += 1;
        }
        for &demand in &scenario.consumers {
            let mut consumer = ConsumerState::new(demand);
            consumer.is_demanding = true;
            view.consumers.push((next_id, consumer));
            next_id += 1;
        }

        let settlement = resolve::resolve(1.0, &view);
        let delivered: f32 = settlement.consumer_grants.iter().map(|(_, a)| a).sum();
        if verbose {
            println!(
                "  {}: delivered {:.2} (expected {:.2})",
                scenario.name, delivered, scenario.expected_delivered
            );
        }
        results.push(check(
            &format!("scenario_{}", scenario.name),
            (delivered - scenario.expected_delivered).abs() < 1e-3
                && settlement.total_granted() <= settlement.total_committed() + 1e-3,
            format!(
                "delivered {:.2}, expected {:.2}",
                delivered, scenario.expected_delivered
            ),
        ));
    }

    results
}
