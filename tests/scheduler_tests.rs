use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use memtune::config::SchedulerConfig;
use memtune::memory::{slope, CollectionScheduler, SchedulerState, WorkloadType};
use memtune::runtime::{Aggressiveness, ManualCollector, ManualMemorySource};
use memtune::ManualClock;

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

struct Harness {
    scheduler: CollectionScheduler,
    clock: ManualClock,
    memory: ManualMemorySource,
    collector: ManualCollector,
}

fn harness(config: SchedulerConfig) -> Result<Harness> {
    let clock = ManualClock::starting_at(Duration::from_secs(1_000));
    let memory = ManualMemorySource::new(Some(GB));
    memory.set_usage(100 * MB);
    let collector = ManualCollector::new();
    collector.link_memory(memory.clone());

    let scheduler = CollectionScheduler::new(config, Arc::new(memory.clone()), Arc::new(clock.clone()))?
        .with_collector(Arc::new(collector.clone()));

    Ok(Harness {
        scheduler,
        clock,
        memory,
        collector,
    })
}

fn quiet_config() -> SchedulerConfig {
    SchedulerConfig {
        auto_optimize: false,
        enable_monitoring: false,
        ..SchedulerConfig::default()
    }
}

/// Trend estimation used by the leak monitor
#[cfg(test)]
mod trend_tests {
    use super::*;

    #[test]
    fn test_slope_per_minute() {
        assert_eq!(slope(&[(0.0, 0.0), (60.0, 60.0)]), 60.0);
        assert_eq!(slope(&[(5.0, 10.0)]), 0.0);
        assert_eq!(slope(&[]), 0.0);
    }
}

/// Trigger rules and the skip path
#[cfg(test)]
mod trigger_tests {
    use super::*;

    #[test]
    fn test_collect_skipped_before_min_interval() -> Result<()> {
        let mut h = harness(quiet_config())?;

        let first = h.scheduler.force_collect();
        assert!(!first.skipped);
        assert_eq!(h.scheduler.history().count(), 1);

        h.clock.advance(Duration::from_secs(5));
        let second = h.scheduler.collect(false);
        assert!(second.skipped);
        assert_eq!(second.collected, 0);
        assert_eq!(second.duration, Duration::ZERO);

        assert_eq!(h.scheduler.history().count(), 1);
        assert_eq!(h.scheduler.history().filter(|run| run.forced).count(), 1);
        assert_eq!(h.scheduler.metrics().skipped, 1);
        assert_eq!(h.scheduler.state(), SchedulerState::Idle);
        Ok(())
    }

    #[test]
    fn test_thresholds_not_checked_until_interval_elapses() -> Result<()> {
        let mut h = harness(quiet_config())?;
        h.scheduler.force_collect();

        h.collector.add_garbage(20_000, 8 * MB);
        h.clock.advance(Duration::from_secs(10));
        assert!(!h.scheduler.should_collect());

        h.clock.advance(Duration::from_secs(25));
        assert!(h.scheduler.should_collect());
        assert_eq!(h.scheduler.state(), SchedulerState::ShouldCollect);

        let outcome = h.scheduler.collect(false);
        assert!(!outcome.skipped);
        assert_eq!(outcome.collected, 20_000);
        assert_eq!(outcome.memory_freed, (8 * MB) as i64);
        assert_eq!(h.scheduler.metrics().scheduled, 1);
        assert_eq!(h.scheduler.state(), SchedulerState::Idle);
        Ok(())
    }

    #[test]
    fn test_memory_ratio_and_buffer_triggers() -> Result<()> {
        let mut h = harness(quiet_config())?;
        assert!(!h.scheduler.should_collect());

        h.memory.set_usage(850 * MB);
        assert!(h.scheduler.should_collect());

        h.memory.set_usage(100 * MB);
        h.collector.set_buffer_size(1_000);
        assert!(h.scheduler.should_collect());
        Ok(())
    }

    #[test]
    fn test_tick_collects_when_due() -> Result<()> {
        let mut h = harness(quiet_config())?;
        assert!(h.scheduler.tick().is_none());

        h.collector.add_garbage(10_000, 2 * MB);
        let outcome = h.scheduler.tick().expect("thresholds tripped");
        assert_eq!(outcome.collected, 10_000);
        assert!(h.scheduler.history().all(|run| !run.forced));

        h.scheduler.disable();
        h.collector.add_garbage(10_000, 2 * MB);
        h.clock.advance(Duration::from_secs(60));
        assert!(h.scheduler.tick().is_none());
        Ok(())
    }
}

/// Post-run analysis and the longer-horizon adaptation
#[cfg(test)]
mod adaptation_tests {
    use super::*;

    #[test]
    fn test_slow_pass_raises_thresholds_monotonically() -> Result<()> {
        let mut h = harness(quiet_config())?;
        h.collector.set_pass_duration(h.clock.clone(), Duration::from_secs(1));

        let mut previous = h.scheduler.thresholds().roots_threshold;
        for expected in [12_000, 14_400] {
            h.scheduler.force_collect();
            let roots = h.scheduler.thresholds().roots_threshold;
            assert!(roots > previous);
            assert_eq!(roots, expected);
            previous = roots;
        }
        assert_eq!(h.scheduler.thresholds().buffer_threshold, 1_440);
        Ok(())
    }

    #[test]
    fn test_low_yield_pass_batches_more() -> Result<()> {
        let mut h = harness(quiet_config())?;
        h.collector.add_garbage(500, 4 * 1024);
        h.scheduler.force_collect();
        assert_eq!(h.scheduler.thresholds().roots_threshold, 15_000);
        Ok(())
    }

    #[test]
    fn test_failed_pass_recorded_as_empty_run() -> Result<()> {
        let mut h = harness(quiet_config())?;
        h.collector.add_garbage(50, MB);
        h.collector.fail_next_pass();

        let outcome = h.scheduler.force_collect();
        assert!(!outcome.skipped);
        assert_eq!(outcome.collected, 0);
        assert_eq!(outcome.efficiency, 0.0);

        let runs: Vec<_> = h.scheduler.history().collect();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].collected, 0);
        assert_eq!(h.scheduler.metrics().runs, 1);
        Ok(())
    }

    #[test]
    fn test_frequent_low_yield_runs_raise_thresholds_once() -> Result<()> {
        let mut h = harness(SchedulerConfig {
            min_interval_secs: 0.0,
            ..quiet_config()
        })?;
        for _ in 0..10 {
            h.clock.advance(Duration::from_secs(5));
            h.scheduler.force_collect();
        }

        h.scheduler.optimize_gc_settings();
        assert_eq!(h.scheduler.thresholds().roots_threshold, 15_000);
        assert_eq!(h.scheduler.thresholds().buffer_threshold, 1_500);

        // No new run, no new adjustment
        h.scheduler.optimize_gc_settings();
        assert_eq!(h.scheduler.thresholds().roots_threshold, 15_000);
        Ok(())
    }

    #[test]
    fn test_rare_long_runs_lower_thresholds() -> Result<()> {
        let mut h = harness(SchedulerConfig {
            profile_gc: false,
            ..quiet_config()
        })?;
        h.collector.set_pass_duration(h.clock.clone(), Duration::from_secs(1));
        for _ in 0..10 {
            h.clock.advance(Duration::from_secs(400));
            h.collector.add_garbage(1_000, 0);
            h.scheduler.force_collect();
        }

        h.scheduler.optimize_gc_settings();
        assert_eq!(h.scheduler.thresholds().roots_threshold, 8_000);
        Ok(())
    }

    #[test]
    fn test_memory_pressure_halves_roots_and_sets_high_tier() -> Result<()> {
        let mut h = harness(SchedulerConfig {
            min_interval_secs: 0.0,
            ..quiet_config()
        })?;
        for _ in 0..10 {
            h.clock.advance(Duration::from_secs(5));
            h.scheduler.force_collect();
        }

        h.memory.set_usage(950 * MB);
        h.scheduler.optimize_gc_settings();
        assert_eq!(h.scheduler.thresholds().roots_threshold, 7_500);
        assert_eq!(h.collector.aggressiveness(), Some(Aggressiveness::High));

        h.memory.set_usage(100 * MB);
        h.scheduler.optimize_gc_settings();
        assert_eq!(h.collector.aggressiveness(), Some(Aggressiveness::Low));
        Ok(())
    }

    #[test]
    fn test_leak_monitor_biases_toward_collection() -> Result<()> {
        let mut h = harness(quiet_config())?;

        let mut detected = false;
        for _ in 0..10 {
            h.memory.allocate(MB);
            detected = h.scheduler.check_memory_patterns();
            h.clock.advance(Duration::from_secs(10));
        }
        assert!(detected);
        assert_eq!(h.scheduler.thresholds().roots_threshold, 5_000);
        assert_eq!(h.scheduler.thresholds().min_interval, Duration::from_secs(24));
        assert!(h.scheduler.report().memory_trend > MB as f64);
        Ok(())
    }

    #[test]
    fn test_leak_monitor_never_raises_short_interval() -> Result<()> {
        let mut h = harness(SchedulerConfig {
            min_interval_secs: 5.0,
            ..quiet_config()
        })?;
        for _ in 0..10 {
            h.memory.allocate(2 * MB);
            h.scheduler.check_memory_patterns();
            h.clock.advance(Duration::from_secs(10));
        }
        assert_eq!(h.scheduler.thresholds().min_interval, Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn test_samples_closer_than_ten_seconds_are_ignored() -> Result<()> {
        let mut h = harness(quiet_config())?;
        for _ in 0..30 {
            h.memory.allocate(10 * MB);
            assert!(!h.scheduler.check_memory_patterns());
            h.clock.advance(Duration::from_secs(3));
        }
        // Only every fourth call samples: 8 samples, below the minimum window
        assert_eq!(h.scheduler.thresholds().roots_threshold, 10_000);
        Ok(())
    }
}

/// Presets and reporting
#[cfg(test)]
mod preset_tests {
    use super::*;

    #[test]
    fn test_workload_presets() -> Result<()> {
        let mut h = harness(quiet_config())?;

        h.scheduler.optimize_for(WorkloadType::WebRequest);
        assert_eq!(h.scheduler.thresholds().roots_threshold, 1_000);
        assert_eq!(h.scheduler.thresholds().min_interval, Duration::from_secs(5));

        h.scheduler.optimize_for("memory-intensive".parse()?);
        assert_eq!(h.scheduler.thresholds().roots_threshold, 500);
        assert_eq!(h.scheduler.thresholds().memory_ratio, 0.6);

        h.scheduler.optimize_for(WorkloadType::Default);
        assert_eq!(h.scheduler.thresholds().roots_threshold, 10_000);
        assert_eq!(h.scheduler.thresholds().min_interval, Duration::from_secs(30));
        Ok(())
    }

    #[test]
    fn test_report_tail_and_averages() -> Result<()> {
        let mut h = harness(SchedulerConfig {
            min_interval_secs: 0.0,
            history_size: 12,
            ..quiet_config()
        })?;
        for _ in 0..15 {
            h.collector.add_garbage(10, 0);
            h.clock.advance(Duration::from_secs(1));
            h.scheduler.force_collect();
        }

        assert_eq!(h.scheduler.history().count(), 12);
        let report = h.scheduler.report();
        assert_eq!(report.metrics.runs, 15);
        assert_eq!(report.metrics.forced, 15);
        assert_eq!(report.recent_history.len(), 10);
        assert_eq!(report.efficiency, 10.0);
        assert_eq!(report.memory.map(|memory| memory.ceiling), Some(Some(GB)));

        let json = serde_json::to_value(&report)?;
        assert_eq!(json["metrics"]["runs"], 15);
        Ok(())
    }
}
