#![allow(dead_code)]

use atomic64_host::prelude::*;
use tracing_subscriber::EnvFilter;

/// Installs a subscriber filtered by `ATOMIC64_LOG`, once per test binary.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("ATOMIC64_LOG"))
        .with_test_writer()
        .try_init();
}

pub fn generate(slot_count: usize) -> (Atomic64Library, LockBuffer) {
    init_logging();
    let device = Device::system_default();
    let float64 = Float64Library::new(&device);
    Atomic64Builder::new()
        .slot_count(slot_count)
        .generate(&float64)
        .expect("library generation")
}

pub fn cells(count: usize) -> Vec<EmulatedAtomicU64> {
    (0..count).map(|_| EmulatedAtomicU64::new(0)).collect()
}
