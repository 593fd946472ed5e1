pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# COORDINATOR CONFIGURATION
# =============================================================================
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/coordinator/config.yml
#   3. /etc/coordinator/config.yml
#
# Environment variables written as $env{...} are expanded before parsing. A
# leading ~ in paths is expanded to the home directory.

# =============================================================================
# STORAGE
# =============================================================================
storage:
  # DuckDB database file holding equipment, lots, batches and telemetry
  path: ~/.local/share/coordinator/coordinator.duckdb

# =============================================================================
# RECONCILIATION
# =============================================================================
# The background loop matches equipment telemetry to pending batch steps and
# deletes the rows of lots that finished their route. 'enabled' and
# 'update_interval_seconds' are re-read every iteration, so edits here take
# effect without a restart.
reconcile:
  enabled: true
  # Pause between passes
  update_interval_seconds: 30
  # Delay before the first pass after startup
  warmup: 5s
  # How long to wait before re-checking while disabled
  disabled_backoff: 5s
  # Events closer than this belong to the same cluster. Durations accept
  # ms, s, m and h suffixes.
  cluster_window: 5m
  # 'session' compares each event to the previous one in the cluster,
  # 'from_start' compares it to the first one
  cluster_gap_mode: session

# =============================================================================
# WEB API
# =============================================================================
web:
  listen: 127.0.0.1:8080
"#
    .to_string()
}
