use super::*;
use crate::common::*;

/// Settings of the background batch fetching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchConfig {
    /// Number of worker threads. Zero fetches batches on the calling thread.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Capacity of the queue between workers and the consumer.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

impl PrefetchConfig {
    pub fn synchronous() -> Self {
        Self {
            workers: 0,
            ..Self::default()
        }
    }
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

fn default_workers() -> usize {
    num_cpus::get()
}

fn default_max_queue_size() -> usize {
    10
}

/// Feeds `steps` batches of one epoch to `consume`, then ends the epoch.
///
/// Batch indices wrap around when `steps` exceeds the generator length.
/// With workers, batches arrive in completion order and `consume` receives
/// the step number along with each batch. All workers are joined before
/// [on_epoch_end](BatchSequence::on_epoch_end) is called. The epoch is not
/// ended if fetching or consuming fails.
pub fn run_epoch<G, F>(
    generator: &mut G,
    steps: usize,
    config: &PrefetchConfig,
    mut consume: F,
) -> Result<()>
where
    G: BatchSequence + Sync,
    G::Batch: Send,
    F: FnMut(usize, G::Batch) -> Result<()>,
{
    let len = generator.len();
    ensure!(len > 0, "the batch generator yields no batches");

    let PrefetchConfig {
        workers,
        max_queue_size,
    } = *config;
    let num_workers = workers.min(steps);

    if num_workers == 0 {
        for step in 0..steps {
            let batch = generator.get_batch(step % len)?;
            consume(step, batch)?;
        }
    } else {
        let shared: &G = generator;
        let next_step = AtomicUsize::new(0);
        let next_step = &next_step;
        let (tx, rx) = flume::bounded(max_queue_size.max(1));

        std::thread::scope(|scope| -> Result<()> {
            let handles: Vec<_> = (0..num_workers)
                .map(|_| {
                    let tx = tx.clone();
                    scope.spawn(move || loop {
                        let step = next_step.fetch_add(1, Ordering::SeqCst);
                        if step >= steps {
                            break;
                        }
                        let batch = shared.get_batch(step % len);
                        let failed = batch.is_err();
                        if tx.send((step, batch)).is_err() || failed {
                            break;
                        }
                    })
                })
                .collect();
            drop(tx);

            let result = (0..steps).try_for_each(|_| {
                let (step, batch) = rx
                    .recv()
                    .map_err(|_| format_err!("prefetch workers stopped unexpectedly"))?;
                consume(step, batch?)
            });

            // unblock workers waiting on a full queue
            drop(rx);
            for handle in handles {
                handle
                    .join()
                    .map_err(|_| format_err!("a prefetch worker panicked"))?;
            }

            result
        })?;
    }

    generator.on_epoch_end();
    Ok(())
}
