//! Storage operation metrics.
//!
//! Records through the `metrics` facade; the embedding application decides
//! whether an exporter is installed.

use crate::Result;
use std::time::Instant;

/// Records operation metrics for storage operations.
///
/// This function records two metrics for each operation:
/// 1. `storage_operations_total` - Counter for operation count by status
/// 2. `storage_operation_duration_ms` - Histogram for operation latency
///
/// # Arguments
///
/// * `backend` - Backend name (`"sqlite"` or `"flat_file"`)
/// * `operation` - Operation name (e.g., `"add_memory"`, `"load_all"`)
/// * `start` - Operation start time from `Instant::now()`
/// * `status` - Operation status (`"success"` or `"error"`)
pub fn record_operation_metrics(
    backend: &'static str,
    operation: &'static str,
    start: Instant,
    status: &'static str,
) {
    metrics::counter!(
        "storage_operations_total",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "storage_operation_duration_ms",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}

/// Runs `f` and records its outcome with [`record_operation_metrics`].
///
/// # Errors
///
/// Returns whatever `f` returned.
pub fn timed<T, F>(backend: &'static str, operation: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let start = Instant::now();
    let result = f();
    let status = if result.is_ok() { "success" } else { "error" };
    record_operation_metrics(backend, operation, start, status);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_record_operation_metrics_without_recorder() {
        // No recorder installed: the facade drops the measurements.
        let start = Instant::now();
        record_operation_metrics("sqlite", "add_memory", start, "success");
        record_operation_metrics("flat_file", "load_all", start, "error");
    }

    #[test]
    fn test_timed_passes_result_through() {
        assert_eq!(timed("sqlite", "get_stat", || Ok(3)).unwrap(), 3);

        let err: Result<()> = timed("sqlite", "get_stat", || {
            Err(Error::NotFound("missing".to_string()))
        });
        assert!(matches!(err, Err(Error::NotFound(_))));
    }
}
