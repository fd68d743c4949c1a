use super::Engine;
use crate::error::{Error, Result};
use std::fmt::Display;
use std::sync::Arc;

impl Engine {
    /// Applies `f` to every item on one of the scatter/gather pools and
    /// returns the outputs in input order.
    ///
    /// With `use_processes == false` every item is its own job on the
    /// thread pool. Otherwise items are batched into chunks of
    /// `max(1, len / workers)` and run on the compute pool. No more than
    /// `max_workers` jobs (default: the pool size) are in flight at once.
    ///
    /// An item whose call returned an error or panicked comes back as
    /// `None`; the other items are unaffected. Starts the engine if needed.
    /// Fails if the engine is stopped before every item was handed out.
    pub fn parallel_map<T, R, E, F>(
        &self,
        f: F,
        items: Vec<T>,
        max_workers: Option<usize>,
        use_processes: bool,
    ) -> Result<Vec<Option<R>>>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: Display + 'static,
        F: Fn(T) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        self.start()?;
        let pool = self.pool(use_processes)?;

        let total = items.len();
        let limit = max_workers.unwrap_or_else(|| pool.num_threads()).max(1);
        let chunk_size = if use_processes {
            (total / limit).max(1)
        } else {
            1
        };

        let f = Arc::new(f);
        let (tx, rx) = crossbeam_channel::unbounded::<(usize, Vec<Option<R>>)>();
        let mut tx = Some(tx);

        let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
        let mut remaining = items.into_iter();
        let mut next_start = 0;
        let mut in_flight = 0;

        loop {
            while in_flight < limit && next_start < total {
                let chunk: Vec<T> = remaining.by_ref().take(chunk_size).collect();
                let start = next_start;
                next_start += chunk.len();

                let Some(tx) = tx.clone() else {
                    break;
                };
                let f = f.clone();
                let panic_handler = self.inner.panic_handler.clone();

                pool.execute(move || {
                    let outputs = chunk
                        .into_iter()
                        .enumerate()
                        .map(|(offset, item)| match panic_handler.execute(|| f(item)) {
                            Ok(Ok(value)) => Some(value),
                            Ok(Err(e)) => {
                                tracing::error!(index = start + offset, error = %e, "parallel item failed");
                                None
                            }
                            Err(_) => None,
                        })
                        .collect();
                    let _ = tx.send((start, outputs));
                })?;
                in_flight += 1;
            }

            if next_start == total {
                // from here on only in-flight jobs hold senders
                tx = None;
            }
            if in_flight == 0 {
                break;
            }

            let (start, outputs) = rx.recv().map_err(|_| {
                Error::executor(format!(
                    "pool {} dropped {} in-flight jobs",
                    pool.name(),
                    in_flight
                ))
            })?;
            in_flight -= 1;
            for (offset, output) in outputs.into_iter().enumerate() {
                results[start + offset] = output;
            }
        }

        let failed = results.iter().filter(|r| r.is_none()).count();
        self.inner.metrics.record_mapped(total, failed);
        tracing::debug!(
            items = total,
            failed,
            chunk_size,
            pool = pool.name(),
            "parallel map finished"
        );

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::TaskError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn engine() -> Engine {
        let config = Config::builder()
            .num_workers(1)
            .max_workers(4)
            .max_processes(3)
            .poll_interval(Duration::from_millis(20))
            .build()
            .unwrap();
        Engine::new(config).unwrap()
    }

    #[test]
    fn test_thread_mode_keeps_order() {
        let engine = engine();
        let out = engine
            .parallel_map(|x: u64| Ok::<_, TaskError>(x * x), (0..100).collect(), None, false)
            .unwrap();

        let expected: Vec<Option<u64>> = (0..100u64).map(|x| Some(x * x)).collect();
        assert_eq!(out, expected);
        assert!(engine.is_running());
        engine.stop();
    }

    #[test]
    fn test_failed_items_are_none() {
        let engine = engine();
        let out = engine
            .parallel_map(
                |x: i32| {
                    if x % 3 == 0 {
                        Err(format!("bad item {}", x))
                    } else {
                        Ok(x)
                    }
                },
                (1..=9).collect(),
                None,
                false,
            )
            .unwrap();

        assert_eq!(
            out,
            vec![Some(1), Some(2), None, Some(4), Some(5), None, Some(7), Some(8), None]
        );
        assert_eq!(engine.stats().metrics.items_failed, 3);
        engine.stop();
    }

    #[test]
    fn test_compute_mode_chunks() {
        let engine = engine();
        let out = engine
            .parallel_map(
                |x: i32| {
                    if x == 4 {
                        panic!("four is cursed");
                    }
                    Ok::<_, TaskError>(x + 100)
                },
                (0..10).collect(),
                None,
                true,
            )
            .unwrap();

        assert_eq!(out.len(), 10);
        assert_eq!(out[0], Some(100));
        assert_eq!(out[4], None);
        assert_eq!(out[9], Some(109));
        engine.stop();
    }

    #[test]
    fn test_in_flight_bounded() {
        let engine = engine();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (a, p) = (active.clone(), peak.clone());
        let out = engine
            .parallel_map(
                move |x: u32| {
                    let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    a.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, TaskError>(x)
                },
                (0..40).collect(),
                Some(2),
                false,
            )
            .unwrap();

        assert_eq!(out.iter().flatten().count(), 40);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        engine.stop();
    }

    #[test]
    fn test_stop_during_map_returns() {
        let engine = engine();
        engine.start().unwrap();

        let mapper = engine.clone();
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let handle = std::thread::spawn(move || {
            let out = mapper.parallel_map(
                |x: u32| {
                    std::thread::sleep(Duration::from_millis(1));
                    Ok::<_, TaskError>(x)
                },
                (0..500).collect(),
                Some(2),
                false,
            );
            let _ = done_tx.send(out.map(|items| items.len()));
        });

        std::thread::sleep(Duration::from_millis(30));
        engine.stop();

        let finished = done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("parallel_map hung after stop");
        match finished {
            Ok(len) => assert_eq!(len, 500),
            Err(e) => assert!(matches!(e, Error::Executor(_)), "unexpected error: {:?}", e),
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_empty_input() {
        let engine = engine();
        let out = engine
            .parallel_map(|x: i32| Ok::<_, TaskError>(x), Vec::new(), None, false)
            .unwrap();
        assert!(out.is_empty());
        assert!(!engine.is_running());
    }
}
