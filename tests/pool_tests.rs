use anyhow::{bail, Result};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use memtune::config::{ConnectionPoolConfig, PoolConfig};
use memtune::pool::{
    buffer_factory, shared_array_pool, BucketArrayPool, Connection, ConnectionPool, PoolOptions, Poolable,
    PooledBuffer, ResourcePool,
};
use memtune::{ErrorKind, ManualClock, MemtuneError};

#[derive(Debug, Default)]
struct Parser {
    tokens: Vec<String>,
}

impl Poolable for Parser {
    fn reset(&mut self) {
        self.tokens.clear();
    }
}

fn pool_with(clock: &ManualClock, max_idle_time_secs: u64) -> ResourcePool {
    let config = PoolConfig {
        max_idle_time_secs,
        ..PoolConfig::default()
    };
    ResourcePool::new(config, Arc::new(clock.clone()))
}

/// Reuse accounting and the free-list/in-use invariant
#[cfg(test)]
mod reuse_tests {
    use super::*;

    #[test]
    fn test_each_release_acquire_pair_reuses_once() -> Result<()> {
        let clock = ManualClock::new();
        let mut pool = pool_with(&clock, 300);

        let first = pool.acquire::<Parser>("parser")?;
        let id = first.id();
        pool.release(first);

        for round in 1..=5u64 {
            let mut parser = pool.acquire::<Parser>("parser")?;
            assert_eq!(parser.id(), id);
            assert!(parser.tokens.is_empty());
            assert_eq!(pool.stats(Some("parser")).reused, round);
            parser.tokens.push(format!("token-{}", round));
            clock.advance(Duration::from_secs(1));
            pool.release(parser);
        }

        let stats = pool.stats(Some("parser"));
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 5);
        assert!((stats.reuse_rate - 5.0 / 6.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_free_list_and_in_use_never_overlap() -> Result<()> {
        let clock = ManualClock::new();
        let mut pool = pool_with(&clock, 300);

        let mut held = Vec::new();
        for step in 0..40 {
            if step % 3 == 2 {
                if let Some(parser) = held.pop() {
                    pool.release::<Parser>(parser);
                }
            } else {
                held.push(pool.acquire::<Parser>("parser")?);
            }

            let available: HashSet<_> = pool.available_ids("parser").into_iter().collect();
            let in_use: HashSet<_> = pool.in_use_ids("parser").into_iter().collect();
            assert!(available.is_disjoint(&in_use));
            assert_eq!(in_use.len(), held.len());
        }
        Ok(())
    }

    #[test]
    fn test_acquire_never_returns_checked_out_object() -> Result<()> {
        let clock = ManualClock::new();
        let mut pool = pool_with(&clock, 300);

        let a = pool.acquire::<Parser>("parser")?;
        let b = pool.acquire::<Parser>("parser")?;
        assert_ne!(a.id(), b.id());
        pool.release(a);
        let c = pool.acquire::<Parser>("parser")?;
        assert_ne!(c.id(), b.id());
        assert_eq!(pool.stats(Some("parser")).in_use, 2);
        Ok(())
    }

    #[test]
    fn test_stats_aggregate_and_unknown_class() -> Result<()> {
        let clock = ManualClock::new();
        let mut pool = pool_with(&clock, 300);

        let parser = pool.acquire::<Parser>("parser")?;
        pool.release(parser);
        let buffer = pool.acquire::<PooledBuffer>("buffer")?;
        pool.release(buffer);
        let _again = pool.acquire::<PooledBuffer>("buffer")?;

        let total = pool.stats(None);
        assert_eq!(total.created, 2);
        assert_eq!(total.reused, 1);
        assert_eq!(total.available, 1);
        assert_eq!(total.in_use, 1);

        let missing = pool.stats(Some("nothing"));
        assert_eq!((missing.created, missing.reused, missing.available), (0, 0, 0));
        assert_eq!(missing.reuse_rate, 0.0);
        Ok(())
    }

    #[test]
    fn test_clear_pool_keeps_checked_out_objects() -> Result<()> {
        let clock = ManualClock::new();
        let mut pool = pool_with(&clock, 300);

        let kept = pool.acquire::<Parser>("parser")?;
        let returned = pool.acquire::<Parser>("parser")?;
        pool.release(returned);

        pool.clear_pool("parser");
        assert!(pool.available_ids("parser").is_empty());
        assert_eq!(pool.in_use_ids("parser"), vec![kept.id()]);

        assert!(pool.release(kept));
        pool.clear_all();
        assert_eq!(pool.stats(None).available, 0);
        Ok(())
    }

    #[test]
    fn test_class_without_factory_uses_default() -> Result<()> {
        let clock = ManualClock::new();
        let mut pool = pool_with(&clock, 300);
        pool.register_class::<Parser>("parser", PoolOptions::max_size(2))?;

        let parser = pool.acquire::<Parser>("parser")?;
        assert!(parser.tokens.is_empty());
        assert_eq!(pool.stats(Some("parser")).created, 1);
        Ok(())
    }

    #[test]
    fn test_registered_factory_wins_over_default() -> Result<()> {
        let clock = ManualClock::new();
        let mut pool = pool_with(&clock, 300);
        pool.register_with_factory("parser", PoolOptions::default(), || {
            Ok(Parser {
                tokens: vec!["<start>".to_string()],
            })
        })?;

        let parser = pool.acquire::<Parser>("parser")?;
        assert_eq!(parser.tokens, vec!["<start>".to_string()]);
        Ok(())
    }

    #[test]
    fn test_dropped_checkout_leaves_in_use_set() -> Result<()> {
        let clock = ManualClock::new();
        let mut pool = pool_with(&clock, 300);

        for _ in 0..10 {
            let parser = pool.acquire::<Parser>("parser")?;
            drop(parser);
        }
        let held = pool.acquire::<Parser>("parser")?;

        assert_eq!(pool.in_use_ids("parser"), vec![held.id()]);
        assert_eq!(pool.stats(Some("parser")).in_use, 1);
        assert_eq!(pool.stats(Some("parser")).created, 11);
        Ok(())
    }

    #[test]
    fn test_errors_are_classified() -> Result<()> {
        let clock = ManualClock::new();
        let mut pool = pool_with(&clock, 300);

        let err = pool.acquire_registered::<Parser>("parser").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidReference);
        assert!(err.is_recoverable());

        pool.register_with_factory("broken", PoolOptions::default(), || -> Result<Parser> {
            bail!("backend unavailable")
        })?;
        let err = pool.acquire_registered::<Parser>("broken").unwrap_err();
        assert!(matches!(err, MemtuneError::FactoryFailed { .. }));
        assert_eq!(err.kind(), ErrorKind::Configuration);
        Ok(())
    }
}

/// Idle expiry and sweeps
#[cfg(test)]
mod cleanup_tests {
    use super::*;

    #[test]
    fn test_cleanup_is_idempotent() -> Result<()> {
        let clock = ManualClock::new();
        let mut pool = pool_with(&clock, 60);

        let old = pool.acquire::<Parser>("parser")?;
        let fresh = pool.acquire::<Parser>("parser")?;
        pool.release(old);
        clock.advance(Duration::from_secs(45));
        pool.release(fresh);
        clock.advance(Duration::from_secs(30));

        let first = pool.cleanup();
        assert_eq!(first.evicted, 1);
        let stats_after_first = pool.stats(None);

        let second = pool.cleanup();
        assert_eq!(second.evicted, 0);
        assert_eq!(second.memory_freed, 0);
        assert_eq!(pool.stats(None), stats_after_first);
        Ok(())
    }

    #[test]
    fn test_memory_saved_accumulates() -> Result<()> {
        let clock = ManualClock::new();
        let hints = Rc::new(RefCell::new(0));
        let counter = hints.clone();
        let mut pool = pool_with(&clock, 10).with_collection_hint(move || *counter.borrow_mut() += 1);

        for _ in 0..3 {
            let parser = pool.acquire::<Parser>("parser")?;
            pool.release(parser);
            clock.advance(Duration::from_secs(11));
            pool.cleanup();
        }

        assert_eq!(*hints.borrow(), 3);
        assert!(pool.stats(None).memory_saved > 0);
        assert_eq!(pool.stats(None).created, 3);
        Ok(())
    }
}

/// Size-bucketed arrays and string buffers
#[cfg(test)]
mod array_tests {
    use super::*;

    #[test]
    fn test_bucket_selection() -> Result<()> {
        let mut pool = BucketArrayPool::<u32>::with_buckets(vec![16, 32, 64, 128], 8)?;
        assert_eq!(pool.allocate(50).capacity(), 64);
        assert_eq!(pool.allocate(5000).capacity(), 128);
        assert_eq!(pool.allocate(0).capacity(), 16);

        let mut buffer = pool.allocate(100);
        buffer.extend(0..100);
        pool.deallocate(buffer);
        assert_eq!(pool.pooled(128), 1);
        let reused = pool.allocate(5000);
        assert!(reused.is_empty());
        assert!(reused.capacity() >= 128);
        Ok(())
    }

    #[test]
    fn test_pooled_buffers_through_resource_pool() -> Result<()> {
        let clock = ManualClock::new();
        let mut pool = pool_with(&clock, 300);
        let arrays = shared_array_pool(BucketArrayPool::with_buckets(vec![16, 32, 64], 4)?);
        pool.register_with_factory("html", PoolOptions::max_size(2), buffer_factory(arrays.clone()))?;

        let mut buffer = pool.acquire_registered::<PooledBuffer>("html")?;
        for row in 0..20 {
            buffer.append("<tr>").append(&row.to_string()).append("</tr>");
        }
        assert_eq!(buffer.fragment_count(), 60);
        let id = buffer.id();
        assert!(pool.release(buffer));

        let buffer = pool.acquire_registered::<PooledBuffer>("html")?;
        assert_eq!(buffer.id(), id);
        assert!(buffer.is_empty());
        assert_eq!(arrays.borrow().pooled(60), 1);
        Ok(())
    }

    #[test]
    fn test_oversized_buffer_is_not_pooled() -> Result<()> {
        let clock = ManualClock::new();
        let mut pool = pool_with(&clock, 300);

        let mut buffer = pool.acquire::<PooledBuffer>("buffer")?;
        buffer.append(&"x".repeat(2 * 1024 * 1024));
        assert!(!pool.release(buffer));
        assert_eq!(pool.stats(Some("buffer")).available, 0);
        assert_eq!(pool.stats(Some("buffer")).in_use, 0);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BackendState {
    alive: bool,
    pings: u32,
    rollbacks: u32,
    session_resets: u32,
    opened: u32,
}

/// Connection double whose backend can be killed from the test
struct FakeConnection {
    backend: Rc<RefCell<BackendState>>,
    in_transaction: bool,
}

impl Connection for FakeConnection {
    fn ping(&mut self, _timeout: Duration) -> Result<()> {
        let mut backend = self.backend.borrow_mut();
        backend.pings += 1;
        if !backend.alive {
            bail!("connection reset by peer");
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn rollback(&mut self) -> Result<()> {
        self.in_transaction = false;
        self.backend.borrow_mut().rollbacks += 1;
        Ok(())
    }

    fn reset_session(&mut self) -> Result<()> {
        self.backend.borrow_mut().session_resets += 1;
        Ok(())
    }
}

fn connection_pool(clock: &ManualClock) -> Result<(ConnectionPool<FakeConnection>, Rc<RefCell<BackendState>>)> {
    let backend = Rc::new(RefCell::new(BackendState {
        alive: true,
        ..BackendState::default()
    }));
    let mut pool = ConnectionPool::new(ConnectionPoolConfig::default(), Arc::new(clock.clone()));
    let shared = backend.clone();
    pool.register_connection("primary", PoolOptions::max_size(4), move || {
        shared.borrow_mut().opened += 1;
        Ok(FakeConnection {
            backend: shared.clone(),
            in_transaction: false,
        })
    })?;
    Ok((pool, backend))
}

/// Liveness and reset contract of pooled connections
#[cfg(test)]
mod connection_tests {
    use super::*;

    #[test]
    fn test_unknown_connection_name() -> Result<()> {
        let clock = ManualClock::new();
        let (mut pool, _) = connection_pool(&clock)?;
        assert!(matches!(
            pool.get_connection("replica"),
            Err(MemtuneError::UnknownConnection { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_no_ping_within_interval() -> Result<()> {
        let clock = ManualClock::new();
        let (mut pool, backend) = connection_pool(&clock)?;

        let connection = pool.get_connection("primary")?;
        assert!(pool.release(connection));
        clock.advance(Duration::from_secs(30));
        let _connection = pool.get_connection("primary")?;

        assert_eq!(backend.borrow().pings, 0);
        assert_eq!(backend.borrow().opened, 1);
        assert_eq!(backend.borrow().session_resets, 1);
        Ok(())
    }

    #[test]
    fn test_dead_connection_replaced_after_ping_interval() -> Result<()> {
        let clock = ManualClock::new();
        let (mut pool, backend) = connection_pool(&clock)?;

        let connection = pool.get_connection("primary")?;
        let stale_id = connection.id();
        assert!(pool.release(connection));

        clock.advance(Duration::from_secs(61));
        let fresh = pool.get_connection("primary")?;
        assert_eq!(fresh.id(), stale_id);
        assert_eq!(backend.borrow().pings, 1);

        assert!(pool.release(fresh));
        backend.borrow_mut().alive = false;
        clock.advance(Duration::from_secs(61));
        let replacement = pool.get_connection("primary")?;
        assert_ne!(replacement.id(), stale_id);
        assert_eq!(backend.borrow().opened, 2);
        assert_eq!(pool.stats(Some("primary")).created, 2);
        Ok(())
    }

    #[test]
    fn test_open_transaction_is_not_pooled() -> Result<()> {
        let clock = ManualClock::new();
        let (mut pool, backend) = connection_pool(&clock)?;

        let mut connection = pool.get_connection("primary")?;
        connection.in_transaction = true;
        assert!(!pool.release(connection));
        assert_eq!(pool.stats(Some("primary")).available, 0);
        assert_eq!(backend.borrow().rollbacks, 0);
        Ok(())
    }
}
