use tracing_subscriber::EnvFilter;

/// Crates whose events follow `--log-level`; everything else stays at `warn`.
const PIPELINE_TARGETS: &[&str] = &[
    "medallion",
    "medallion_engine",
    "medallion_lake",
    "medallion_state",
];

/// Filter directives for `--log-level` when `RUST_LOG` is unset.
fn default_directives(log_level: &str) -> String {
    let level = log_level.trim().to_ascii_lowercase();
    let mut directives = vec!["warn".to_string()];
    directives.extend(
        PIPELINE_TARGETS
            .iter()
            .map(|target| format!("{target}={level}")),
    );
    directives.join(",")
}

/// Initialize structured logging on stderr, keeping stdout for reports.
///
/// `RUST_LOG` wins over `--log-level` when set. An unparsable level falls
/// back to `info` for the pipeline crates.
pub fn init(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(log_level)))
        .unwrap_or_else(|_| EnvFilter::new(default_directives("info")));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
