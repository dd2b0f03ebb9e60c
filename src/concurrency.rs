use crate::config::Settings;
use sysinfo::System;
use tracing::{debug, warn};

pub const MAX_WORKERS_ENV: &str = "MAX_CONCURRENT_WORKERS";

const MIN_DEFAULT_FETCHERS: usize = 2;
const MAX_DEFAULT_FETCHERS: usize = 4;

/// Where the fetcher budget came from, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetSource {
    Explicit,
    Settings,
    Environment,
    CpuDefault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetcherBudget {
    pub fetchers: usize,
    pub source: BudgetSource,
}

/// One fewer than the CPU count, kept between 2 and 4.
pub fn default_fetcher_count(cpu_count: usize) -> usize {
    cpu_count
        .saturating_sub(1)
        .clamp(MIN_DEFAULT_FETCHERS, MAX_DEFAULT_FETCHERS)
}

/// Logical CPUs as seen by sysinfo, falling back to the std estimate.
pub fn detect_cpu_count() -> usize {
    let mut sys = System::new();
    sys.refresh_cpu();
    let count = sys.cpus().len();
    if count > 0 {
        return count;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Resolve the fetcher budget. Order: explicit override, settings,
/// environment value, CPU-derived default. Zero and unparseable values are
/// skipped.
pub fn resolve_fetcher_budget(
    explicit: Option<usize>,
    settings: &Settings,
    env_value: Option<&str>,
    cpu_count: usize,
) -> FetcherBudget {
    if let Some(n) = explicit.filter(|n| *n > 0) {
        return FetcherBudget { fetchers: n, source: BudgetSource::Explicit };
    }
    if let Some(n) = settings.max_concurrent_workers.filter(|n| *n > 0) {
        return FetcherBudget { fetchers: n, source: BudgetSource::Settings };
    }
    if let Some(raw) = env_value {
        match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 => {
                return FetcherBudget { fetchers: n, source: BudgetSource::Environment };
            }
            _ => warn!(value = raw, "ignoring invalid {}", MAX_WORKERS_ENV),
        }
    }
    let fetchers = default_fetcher_count(cpu_count);
    debug!(cpu_count, fetchers, "using CPU-derived fetcher budget");
    FetcherBudget { fetchers, source: BudgetSource::CpuDefault }
}

/// Resolve against the live process environment and machine.
pub fn resolve_from_environment(explicit: Option<usize>, settings: &Settings) -> FetcherBudget {
    let env_value = std::env::var(MAX_WORKERS_ENV).ok();
    resolve_fetcher_budget(explicit, settings, env_value.as_deref(), detect_cpu_count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_clamped() {
        assert_eq!(default_fetcher_count(1), 2);
        assert_eq!(default_fetcher_count(2), 2);
        assert_eq!(default_fetcher_count(4), 3);
        assert_eq!(default_fetcher_count(5), 4);
        assert_eq!(default_fetcher_count(64), 4);
    }

    #[test]
    fn test_priority_order() {
        let settings = Settings { max_concurrent_workers: Some(6) };
        let none = Settings::default();

        let b = resolve_fetcher_budget(Some(3), &settings, Some("8"), 16);
        assert_eq!(b, FetcherBudget { fetchers: 3, source: BudgetSource::Explicit });

        let b = resolve_fetcher_budget(None, &settings, Some("8"), 16);
        assert_eq!(b, FetcherBudget { fetchers: 6, source: BudgetSource::Settings });

        let b = resolve_fetcher_budget(None, &none, Some("8"), 16);
        assert_eq!(b, FetcherBudget { fetchers: 8, source: BudgetSource::Environment });

        let b = resolve_fetcher_budget(None, &none, None, 16);
        assert_eq!(b, FetcherBudget { fetchers: 4, source: BudgetSource::CpuDefault });
    }

    #[test]
    fn test_invalid_values_fall_through() {
        let zero = Settings { max_concurrent_workers: Some(0) };
        let b = resolve_fetcher_budget(Some(0), &zero, Some("lots"), 3);
        assert_eq!(b, FetcherBudget { fetchers: 2, source: BudgetSource::CpuDefault });
    }

    #[test]
    fn test_detect_cpu_count_is_positive() {
        assert!(detect_cpu_count() >= 1);
    }
}
