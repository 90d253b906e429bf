use metrics::{counter, gauge};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Upper bound on the slots reserved up front; larger queues grow on demand.
const PREALLOC_LIMIT: usize = 1024;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue capacity must be greater than zero")]
    ZeroCapacity,
}

/// Why an insertion did not take effect. The rejected element is handed back.
#[derive(Error, Clone, Copy, PartialEq, Eq)]
pub enum PushError<T> {
    #[error("queue is full")]
    Full(T),
    #[error("queue is closed")]
    Closed(T),
    #[error("timed out waiting for free capacity")]
    Timeout(T),
}

impl<T> PushError<T> {
    /// Take back the element that was not queued.
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(v) | PushError::Closed(v) | PushError::Timeout(v) => v,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, PushError::Full(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, PushError::Closed(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PushError::Timeout(_))
    }

    fn reason(&self) -> &'static str {
        match self {
            PushError::Full(_) => "full",
            PushError::Closed(_) => "closed",
            PushError::Timeout(_) => "timeout",
        }
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("Full(..)"),
            PushError::Closed(_) => f.write_str("Closed(..)"),
            PushError::Timeout(_) => f.write_str("Timeout(..)"),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    #[error("queue is empty")]
    Empty,
    #[error("queue is closed and drained")]
    Closed,
    #[error("timed out waiting for an element")]
    Timeout,
}

struct State<T> {
    buffer: VecDeque<T>,
    open: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

/// Bounded blocking MPMC queue guarded by one mutex and two condition variables.
///
/// - `push`/`pop` block, `push_for`/`pop_for` block up to a timeout, `try_*` never block
/// - `close` is one-way: pending and future insertions are refused, consumers drain what is left
/// - Handles are cheap clones sharing the same queue
pub struct BoundedQueue<T> {
    inner: Arc<Shared<T>>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> BoundedQueue<T> {
    /// Create an open, empty queue holding at most `capacity` elements.
    pub fn with_capacity(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        let state = State {
            buffer: VecDeque::with_capacity(capacity.min(PREALLOC_LIMIT)),
            open: true,
        };
        Ok(Self {
            inner: Arc::new(Shared {
                state: Mutex::new(state),
                not_full: Condvar::new(),
                not_empty: Condvar::new(),
                capacity,
            }),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.state.lock().buffer.len() >= self.inner.capacity
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.state.lock().open
    }

    /// Block until there is room or the queue is closed.
    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        let capacity = self.inner.capacity;
        let mut state = self.inner.state.lock();
        self.inner
            .not_full
            .wait_while(&mut state, |s| s.open && s.buffer.len() >= capacity);

        if !state.open {
            drop(state);
            return Err(self.rejected(PushError::Closed(value)));
        }
        self.enqueue(state, value);
        Ok(())
    }

    /// Like `push`, but gives up once `timeout` has elapsed.
    pub fn push_for(&self, value: T, timeout: Duration) -> Result<(), PushError<T>> {
        let capacity = self.inner.capacity;
        let mut state = self.inner.state.lock();
        self.inner.not_full.wait_while_for(
            &mut state,
            |s| s.open && s.buffer.len() >= capacity,
            timeout,
        );

        if !state.open {
            drop(state);
            return Err(self.rejected(PushError::Closed(value)));
        }
        if state.buffer.len() >= capacity {
            drop(state);
            return Err(self.rejected(PushError::Timeout(value)));
        }
        self.enqueue(state, value);
        Ok(())
    }

    pub fn try_push(&self, value: T) -> Result<(), PushError<T>> {
        let state = self.inner.state.lock();
        if !state.open {
            drop(state);
            return Err(self.rejected(PushError::Closed(value)));
        }
        if state.buffer.len() >= self.inner.capacity {
            drop(state);
            return Err(self.rejected(PushError::Full(value)));
        }
        self.enqueue(state, value);
        Ok(())
    }

    /// Block until an element is available. Returns `PopError::Closed` once the
    /// queue is closed and drained.
    pub fn pop(&self) -> Result<T, PopError> {
        let mut state = self.inner.state.lock();
        self.inner
            .not_empty
            .wait_while(&mut state, |s| s.open && s.buffer.is_empty());

        self.dequeue(state).ok_or(PopError::Closed)
    }

    /// Like `pop`, but gives up once `timeout` has elapsed.
    pub fn pop_for(&self, timeout: Duration) -> Result<T, PopError> {
        let mut state = self.inner.state.lock();
        self.inner.not_empty.wait_while_for(
            &mut state,
            |s| s.open && s.buffer.is_empty(),
            timeout,
        );

        let open = state.open;
        self.dequeue(state)
            .ok_or(if open { PopError::Timeout } else { PopError::Closed })
    }

    /// Remove the head element if there is one. Works the same before and after `close`.
    pub fn try_pop(&self) -> Result<T, PopError> {
        let state = self.inner.state.lock();
        self.dequeue(state).ok_or(PopError::Empty)
    }

    /// Refuse all further insertions and wake every blocked producer and consumer.
    /// Elements already queued stay available. Calling it again has no effect.
    pub fn close(&self) {
        let was_open = {
            let mut state = self.inner.state.lock();
            std::mem::replace(&mut state.open, false)
        };
        self.inner.not_full.notify_all();
        self.inner.not_empty.notify_all();

        if was_open {
            debug!(capacity = self.inner.capacity, "queue closed");
            counter!("boundq_closed_total").increment(1);
        }
    }

    /// Blocking iterator over popped elements, ends once the queue is closed and drained.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { queue: self }
    }

    /// Non-blocking iterator, ends as soon as the queue is empty.
    pub fn try_iter(&self) -> TryIter<'_, T> {
        TryIter { queue: self }
    }

    fn enqueue(&self, mut state: MutexGuard<'_, State<T>>, value: T) {
        state.buffer.push_back(value);
        // Set under the lock so the last write matches the last change
        gauge!("boundq_depth").set(state.buffer.len() as f64);
        drop(state);

        self.inner.not_empty.notify_one();
        counter!("boundq_pushed_total").increment(1);
    }

    fn dequeue(&self, mut state: MutexGuard<'_, State<T>>) -> Option<T> {
        let value = state.buffer.pop_front()?;
        gauge!("boundq_depth").set(state.buffer.len() as f64);
        drop(state);

        self.inner.not_full.notify_one();
        counter!("boundq_popped_total").increment(1);
        Some(value)
    }

    fn rejected(&self, err: PushError<T>) -> PushError<T> {
        let reason = err.reason();
        trace!(reason, "push rejected");
        counter!("boundq_rejected_total", "reason" => reason).increment(1);
        err
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Copy of the current contents, head first. The lock is released before returning.
    pub fn snapshot(&self) -> Vec<T> {
        let state = self.inner.state.lock();
        state.buffer.iter().cloned().collect()
    }
}

impl<T: Clone + fmt::Display> fmt::Display for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Format outside the lock
        let snapshot = self.snapshot();
        f.write_str("[")?;
        for (i, item) in snapshot.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", item)?;
        }
        f.write_str("]")
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (len, open) = {
            let state = self.inner.state.lock();
            (state.buffer.len(), state.open)
        };
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.inner.capacity)
            .field("len", &len)
            .field("open", &open)
            .finish()
    }
}

pub struct Iter<'a, T> {
    queue: &'a BoundedQueue<T>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.queue.pop().ok()
    }
}

pub struct TryIter<'a, T> {
    queue: &'a BoundedQueue<T>,
}

impl<T> Iterator for TryIter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.queue.try_pop().ok()
    }
}

impl<'a, T> IntoIterator for &'a BoundedQueue<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn zero_capacity_is_rejected() {
        let err = BoundedQueue::<u32>::with_capacity(0).unwrap_err();
        assert_eq!(err, QueueError::ZeroCapacity);
    }

    #[test]
    fn capacity_is_stable() {
        let q = BoundedQueue::with_capacity(3).unwrap();
        assert_eq!(q.capacity(), 3);
        q.push(1).unwrap();
        q.close();
        q.try_pop().unwrap();
        assert_eq!(q.capacity(), 3);
    }

    #[test]
    fn fifo_order() {
        let q = BoundedQueue::with_capacity(4).unwrap();
        for i in 0..4 {
            q.push(i).unwrap();
        }
        for i in 0..4 {
            assert_eq!(q.pop().unwrap(), i);
        }
        assert!(q.is_empty());
    }

    #[test]
    fn try_push_full_hands_value_back() {
        let q = BoundedQueue::with_capacity(2).unwrap();
        q.try_push("a").unwrap();
        q.try_push("b").unwrap();
        assert!(q.is_full());

        let err = q.try_push("c").unwrap_err();
        assert!(err.is_full());
        assert_eq!(err.into_inner(), "c");
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn try_pop_empty() {
        let q = BoundedQueue::<u8>::with_capacity(2).unwrap();
        assert_eq!(q.try_pop(), Err(PopError::Empty));
    }

    #[test]
    fn drain_after_close() {
        let q = BoundedQueue::with_capacity(5).unwrap();
        q.push(10).unwrap();
        q.push(20).unwrap();
        q.push(30).unwrap();
        q.close();

        assert_eq!(q.try_pop(), Ok(10));
        assert_eq!(q.try_pop(), Ok(20));
        assert_eq!(q.try_pop(), Ok(30));
        assert_eq!(q.try_pop(), Err(PopError::Empty));
        assert_eq!(q.pop(), Err(PopError::Closed));
    }

    #[test]
    fn closed_queue_refuses_pushes() {
        let q = BoundedQueue::with_capacity(2).unwrap();
        q.close();
        q.close();
        assert!(q.is_closed());

        assert!(matches!(q.push(1), Err(PushError::Closed(1))));
        assert!(matches!(q.try_push(2), Err(PushError::Closed(2))));
        assert!(matches!(
            q.push_for(3, Duration::from_millis(10)),
            Err(PushError::Closed(3))
        ));
        assert!(q.is_empty());
    }

    #[test]
    fn push_for_times_out_when_full() {
        let q = BoundedQueue::with_capacity(1).unwrap();
        q.push(1).unwrap();

        let start = Instant::now();
        let err = q.push_for(2, Duration::from_millis(50)).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.into_inner(), 2);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(q.snapshot(), vec![1]);
    }

    #[test]
    fn push_for_succeeds_when_space_frees_up() {
        let q = BoundedQueue::with_capacity(1).unwrap();
        q.push(1).unwrap();

        let consumer = {
            let q = q.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                q.pop().unwrap()
            })
        };
        q.push_for(2, Duration::from_secs(5)).unwrap();
        assert_eq!(consumer.join().unwrap(), 1);
        assert_eq!(q.try_pop(), Ok(2));
    }

    #[test]
    fn pop_for_times_out_then_reports_closed() {
        let q = BoundedQueue::<u32>::with_capacity(1).unwrap();
        assert_eq!(q.pop_for(Duration::from_millis(20)), Err(PopError::Timeout));
        q.close();
        assert_eq!(q.pop_for(Duration::from_millis(20)), Err(PopError::Closed));
    }

    #[test]
    fn close_during_push_for_reports_closed() {
        let q = BoundedQueue::with_capacity(1).unwrap();
        q.push(1).unwrap();

        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                let start = Instant::now();
                (q.push_for(2, Duration::from_secs(5)), start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        q.close();

        let (result, waited) = producer.join().unwrap();
        assert_eq!(result, Err(PushError::Closed(2)));
        assert!(waited < Duration::from_secs(5));
        assert_eq!(q.snapshot(), vec![1]);
    }

    #[test]
    fn close_during_pop_for_reports_closed() {
        let q = BoundedQueue::<u32>::with_capacity(1).unwrap();

        let consumer = {
            let q = q.clone();
            thread::spawn(move || {
                let start = Instant::now();
                (q.pop_for(Duration::from_secs(5)), start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        q.close();

        let (result, waited) = consumer.join().unwrap();
        assert_eq!(result, Err(PopError::Closed));
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn try_pop_wakes_blocked_producer() {
        let q = BoundedQueue::with_capacity(1).unwrap();
        q.push(1).unwrap();

        let producer = {
            let q = q.clone();
            thread::spawn(move || q.push(2))
        };
        // Let the producer block on the full queue
        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.try_pop(), Ok(1));
        producer.join().unwrap().unwrap();
        assert_eq!(q.try_pop(), Ok(2));
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let q = BoundedQueue::<u32>::with_capacity(1).unwrap();
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.pop())
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(consumer.join().unwrap(), Err(PopError::Closed));
    }

    #[test]
    fn display_formats_snapshot() {
        let q = BoundedQueue::with_capacity(3).unwrap();
        assert_eq!(q.to_string(), "[]");
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.push(3).unwrap();
        assert_eq!(q.to_string(), "[1,2,3]");
    }

    #[test]
    fn iterators_stop_at_the_right_time() {
        let q = BoundedQueue::with_capacity(4).unwrap();
        q.push('a').unwrap();
        q.push('b').unwrap();
        assert_eq!(q.try_iter().collect::<String>(), "ab");

        q.push('c').unwrap();
        q.close();
        assert_eq!((&q).into_iter().collect::<Vec<_>>(), vec!['c']);
    }

    #[test]
    fn debug_does_not_require_debug_elements() {
        struct Opaque;
        let q = BoundedQueue::with_capacity(2).unwrap();
        assert!(q.try_push(Opaque).is_ok());
        let err = q.try_push(Opaque).and_then(|_| q.try_push(Opaque)).unwrap_err();
        assert_eq!(format!("{:?}", err), "Full(..)");
        assert_eq!(
            format!("{:?}", q),
            "BoundedQueue { capacity: 2, len: 2, open: true }"
        );
    }

    #[test]
    fn telemetry_counts_operations() {
        use metrics_util::debugging::{DebugValue, DebuggingRecorder};
        use std::collections::HashMap;

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let q = BoundedQueue::with_capacity(1).unwrap();
            q.push(1).unwrap();
            assert!(q.try_push(2).unwrap_err().is_full());
            assert_eq!(q.pop(), Ok(1));
            q.close();
            q.close();
            assert!(q.try_push(3).unwrap_err().is_closed());
        });

        let recorded: HashMap<String, f64> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, value)| {
                let key = key.key();
                let labels: Vec<String> = key
                    .labels()
                    .map(|l| format!("{}={}", l.key(), l.value()))
                    .collect();
                let name = if labels.is_empty() {
                    key.name().to_string()
                } else {
                    format!("{}{{{}}}", key.name(), labels.join(","))
                };
                let value = match value {
                    DebugValue::Counter(n) => n as f64,
                    DebugValue::Gauge(g) => g.into_inner(),
                    _ => f64::NAN,
                };
                (name, value)
            })
            .collect();

        assert_eq!(recorded["boundq_pushed_total"], 1.0);
        assert_eq!(recorded["boundq_popped_total"], 1.0);
        assert_eq!(recorded["boundq_rejected_total{reason=full}"], 1.0);
        assert_eq!(recorded["boundq_rejected_total{reason=closed}"], 1.0);
        assert_eq!(recorded["boundq_closed_total"], 1.0);
        assert_eq!(recorded["boundq_depth"], 0.0);
        assert!(!recorded.contains_key("boundq_rejected_total{reason=timeout}"));
    }
}
