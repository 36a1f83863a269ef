//! Benchmark-cache behaviour through the public conversion API.

mod common;

use std::fs;

use tempfile::TempDir;

use lith_backend_empty::Backend as DummyBackend;
use lith_core::{
    BackendPreference, BatchRun, GpuMode, MemorySettings, Options, Router, SettingsStore,
    TargetProfile,
};

use common::*;

const W: u32 = 48;
const H: u32 = 24;

// Matches the autotune key for a 48x24 source on a 48-pixel RGB panel.
const BENCH_KEY: &str = "bench/opencl/48x24->48c3";

fn accel_options() -> Options {
    Options {
        gpu_mode: GpuMode::Auto,
        gpu_backend: BackendPreference::OpenCl,
        ..Options::default()
    }
}

fn convert_with_store(store: &dyn SettingsStore) -> Vec<u8> {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("model.ctb");
    let output = dir.path().join("model.zip");
    let layers: Vec<Vec<u8>> = (0..4).map(|i| noise_layer(W, H, 500 + i)).collect();
    fs::write(&source, build_ctb(W, H, 0, &layers)).unwrap();

    let mut router = Router::new();
    router.register(Box::new(DummyBackend::new()));
    let profile = TargetProfile::rgb8("test-rgb", W, 50.0, 0.0);
    let options = accel_options();
    BatchRun::new(&source, &output, &profile, &options, &router)
        .settings(store)
        .execute()
        .unwrap();
    fs::read(&output).unwrap()
}

#[test]
fn first_run_benchmarks_and_caches_the_result() {
    let store = MemorySettings::new();
    assert!(store.get(BENCH_KEY).is_none());
    convert_with_store(&store);

    let cached = store.get(BENCH_KEY).expect("benchmark record cached");
    let record: serde_json::Value = serde_json::from_str(&cached).unwrap();
    assert!(record["cpu_ms"].as_f64().unwrap() >= 0.0);
    assert!(record["gpu_ms"].as_f64().unwrap() >= 0.0);
    assert_eq!(record["backend_code"], 1);
}

#[test]
fn cached_records_short_circuit_the_benchmark() {
    let store = MemorySettings::new();
    // A record claiming the accelerator loses badly: the run must stay on
    // CPU, succeed, and leave the record untouched.
    let poisoned = r#"{"cpu_ms":1.0,"gpu_ms":500.0,"backend_code":1}"#;
    store.put(BENCH_KEY, poisoned);
    let archive = convert_with_store(&store);
    assert!(!archive.is_empty());
    assert_eq!(store.get(BENCH_KEY).as_deref(), Some(poisoned));
}

#[test]
fn unparseable_cache_entries_are_replaced() {
    let store = MemorySettings::new();
    store.put(BENCH_KEY, "corrupt{{");
    convert_with_store(&store);
    let cached = store.get(BENCH_KEY).unwrap();
    assert!(serde_json::from_str::<serde_json::Value>(&cached).is_ok());
}
