use log::LevelFilter;

/// Initialize logging using env_logger.
/// By default, this reads the RUST_LOG environment variable for filtering,
/// e.g. `RUST_LOG=remoterm_core=debug remoterm connect --profile prod`.
/// Without RUST_LOG everything at `info` and above is printed.
pub fn init_logging() {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();
    // A second call (e.g. from an embedding application) is harmless.
    let _ = builder.try_init();
}
