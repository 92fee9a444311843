use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tracing_subscriber::{EnvFilter, fmt};

/// Route executor events to the test harness; filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Task body bumping `counter` once per invocation.
pub fn bump(counter: &Arc<AtomicUsize>) -> impl FnMut() + Send + 'static {
    let counter = counter.clone();
    move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}
