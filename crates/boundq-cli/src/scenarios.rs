use anyhow::{anyhow, bail, Context, Result};
use boundq_concurrent::{BoundedQueue, PushError};
use boundq_core::Person;
use colored::Colorize;
use std::sync::Arc;
use std::thread::{self, ScopedJoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

fn joined<T>(result: thread::Result<T>, role: &str) -> Result<T> {
    result.map_err(|_| anyhow!("{} thread panicked", role))
}

/// Join every producer, then close the queue so consumers always terminate.
fn finish_producers<T, R, E>(
    q: &BoundedQueue<T>,
    handles: Vec<ScopedJoinHandle<'_, Result<R, E>>>,
) -> Result<Vec<R>>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let results: Vec<_> = handles
        .into_iter()
        .map(|h| joined(h.join(), "producer"))
        .collect();
    q.close();

    let mut outputs = Vec::with_capacity(results.len());
    for r in results {
        outputs.push(r??);
    }
    Ok(outputs)
}

/// One thread fills the queue and drains it again with `try_pop` while a
/// second thread closes the queue after `close_after`.
pub fn single(capacity: usize, close_after: Duration) -> Result<Vec<usize>> {
    let q = BoundedQueue::with_capacity(capacity)?;
    let mut popped = Vec::with_capacity(capacity);

    thread::scope(|s| -> Result<()> {
        s.spawn(|| {
            thread::sleep(close_after);
            q.close();
        });

        for i in 0..q.capacity() {
            q.push(i).context("queue closed while filling")?;
        }
        println!("{}", "Printing queue...".bold());
        println!("{}", q);

        while let Ok(v) = q.try_pop() {
            println!("Popped element: {}", v.to_string().green());
            println!("{}", q);
            popped.push(v);
        }
        debug!(
            close_after_ms = close_after.as_millis() as u64,
            "drained, waiting for close"
        );
        Ok(())
    })?;

    Ok(popped)
}

/// Every producer pushes its own id `items` times; consumers pop until the
/// queue is closed and drained. Returns the number of elements each consumer got.
///
/// With `push_timeout` set, producers use bounded waits and retry on timeout.
pub fn threads(
    capacity: usize,
    producers: usize,
    consumers: usize,
    items: usize,
    push_timeout: Option<Duration>,
) -> Result<Vec<usize>> {
    let q = BoundedQueue::with_capacity(capacity)?;

    let counts = thread::scope(|s| -> Result<Vec<usize>> {
        let consumer_handles: Vec<_> = (0..consumers)
            .map(|c| {
                let q = &q;
                s.spawn(move || {
                    let mut n = 0usize;
                    for v in q {
                        trace!(consumer = c, value = v, queue = %q, "popped");
                        n += 1;
                    }
                    n
                })
            })
            .collect();

        let producer_handles: Vec<_> = (0..producers)
            .map(|p| {
                let q = &q;
                s.spawn(move || -> Result<usize, PushError<usize>> {
                    let mut timeouts = 0usize;
                    for _ in 0..items {
                        match push_timeout {
                            None => q.push(p)?,
                            Some(timeout) => {
                                let mut value = p;
                                loop {
                                    match q.push_for(value, timeout) {
                                        Ok(()) => break,
                                        Err(PushError::Timeout(v)) => {
                                            timeouts += 1;
                                            debug!(producer = p, "push timed out, retrying");
                                            value = v;
                                        }
                                        Err(e) => return Err(e),
                                    }
                                }
                            }
                        }
                        trace!(producer = p, queue = %q, "pushed");
                    }
                    Ok(timeouts)
                })
            })
            .collect();

        let timeouts: usize = finish_producers(&q, producer_handles)?.into_iter().sum();
        if timeouts > 0 {
            info!(timeouts, "timed pushes retried");
        }

        consumer_handles
            .into_iter()
            .map(|h| joined(h.join(), "consumer"))
            .collect()
    })?;

    for (c, n) in counts.iter().enumerate() {
        println!("consumer {} popped {} elements", c, n);
    }
    println!("{}", "Printing queue...".bold());
    println!("{}", q);
    Ok(counts)
}

/// Two producers push shared `Person` payloads, two consumers print them.
pub fn persons(capacity: usize, items: usize) -> Result<usize> {
    let q: BoundedQueue<Arc<Person>> = BoundedQueue::with_capacity(capacity)?;
    let templates = [
        Person::new("Ada", 36, "Software Dev"),
        Person::new("Grace", 45, "CEO"),
    ];

    let consumed = thread::scope(|s| -> Result<usize> {
        let consumer_handles: Vec<_> = (0..2)
            .map(|_| {
                let q = &q;
                s.spawn(move || {
                    let mut n = 0usize;
                    for person in q {
                        println!("{}", person);
                        n += 1;
                    }
                    n
                })
            })
            .collect();

        let producer_handles: Vec<_> = templates
            .iter()
            .map(|template| {
                let q = &q;
                s.spawn(move || -> Result<(), PushError<Arc<Person>>> {
                    for _ in 0..items {
                        q.push(Arc::new(template.clone()))?;
                    }
                    Ok(())
                })
            })
            .collect();

        finish_producers(&q, producer_handles)?;

        let mut total = 0;
        for h in consumer_handles {
            total += joined(h.join(), "consumer")?;
        }
        Ok(total)
    })?;

    Ok(consumed)
}

#[derive(Debug)]
pub struct ShutdownReport {
    /// Elements handed back to producers that were blocked when the queue closed
    pub handed_back: Vec<usize>,
    /// Elements drained after close
    pub drained: Vec<usize>,
}

/// Fill a capacity-1 queue, park `blocked` producers on it, close, then drain.
pub fn shutdown(blocked: usize, settle: Duration) -> Result<ShutdownReport> {
    let q = BoundedQueue::with_capacity(1)?;
    q.push(usize::MAX)?;

    let mut handed_back = thread::scope(|s| -> Result<Vec<usize>> {
        let handles: Vec<_> = (0..blocked)
            .map(|i| {
                let q = &q;
                s.spawn(move || q.push(i))
            })
            .collect();

        thread::sleep(settle);
        let start = Instant::now();
        q.close();

        let mut back = Vec::with_capacity(blocked);
        for h in handles {
            match joined(h.join(), "producer")? {
                Ok(()) => bail!("push succeeded on a full queue that nobody drained"),
                Err(e) => back.push(e.into_inner()),
            }
        }
        info!(
            waiters = blocked,
            elapsed_us = start.elapsed().as_micros() as u64,
            "all blocked producers released"
        );
        Ok(back)
    })?;
    handed_back.sort_unstable();

    for v in &handed_back {
        println!("handed back to producer: {}", v.to_string().yellow());
    }
    let drained: Vec<usize> = q.try_iter().collect();
    println!("drained after close: {:?}", drained);

    Ok(ShutdownReport {
        handed_back,
        drained,
    })
}

impl ShutdownReport {
    /// Every blocked producer got its element back and only the element that
    /// filled the queue was left to drain.
    pub fn verify(&self, blocked: usize) -> Result<()> {
        if self.handed_back.len() != blocked {
            bail!(
                "{} of {} blocked producers were released",
                self.handed_back.len(),
                blocked
            );
        }
        if self.drained != [usize::MAX] {
            bail!(
                "expected only the original element after close, drained {:?}",
                self.drained
            );
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ThroughputReport {
    pub items: usize,
    pub elapsed: Duration,
}

impl ThroughputReport {
    pub fn items_per_sec(&self) -> f64 {
        self.items as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }
}

/// The benchmark workload, timed in-process.
pub fn throughput(
    capacity: usize,
    producers: usize,
    consumers: usize,
    items: usize,
) -> Result<ThroughputReport> {
    let q = BoundedQueue::with_capacity(capacity)?;
    let start = Instant::now();

    let consumed = thread::scope(|s| -> Result<usize> {
        let consumer_handles: Vec<_> = (0..consumers)
            .map(|_| {
                let q = &q;
                s.spawn(move || q.iter().count())
            })
            .collect();

        let producer_handles: Vec<_> = (0..producers)
            .map(|p| {
                let q = &q;
                s.spawn(move || -> Result<(), PushError<usize>> {
                    for _ in 0..items {
                        q.push(p)?;
                    }
                    Ok(())
                })
            })
            .collect();

        finish_producers(&q, producer_handles)?;

        let mut total = 0;
        for h in consumer_handles {
            total += joined(h.join(), "consumer")?;
        }
        Ok(total)
    })?;

    let expected = producers * items;
    if consumed != expected {
        bail!("consumed {} elements, expected {}", consumed, expected);
    }
    Ok(ThroughputReport {
        items: consumed,
        elapsed: start.elapsed(),
    })
}
