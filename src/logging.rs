//! `env_logger` setup for binaries and tests embedding this crate.

/// Install `env_logger`, honouring `RUST_LOG` and defaulting to `info`.
/// Returns false when a logger was already installed.
pub fn init() -> bool {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init()
        .is_ok()
}

/// Logger that writes through the test harness's captured output.
pub fn init_for_tests() {
    let _ = env_logger::builder().is_test(true).try_init();
}
