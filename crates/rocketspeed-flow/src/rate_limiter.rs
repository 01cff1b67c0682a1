// Sink wrapper gating writes at N per period.
use crate::{allocate_sink_id, ManagedSink, ReadyFuture, Sink, SinkId};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct RateState {
    available: u64,
    period_start: Instant,
}

struct RateShared {
    id: SinkId,
    name: String,
    limit: u64,
    period: Duration,
    state: Mutex<RateState>,
}

impl RateShared {
    fn refill(&self, state: &mut RateState) {
        let now = Instant::now();
        if now.duration_since(state.period_start) >= self.period {
            state.available = self.limit;
            state.period_start = now;
        }
    }

    fn take_one(&self) {
        let mut state = self.state.lock().expect("rate lock");
        self.refill(&mut state);
        state.available = state.available.saturating_sub(1);
    }

    fn is_allowed(&self) -> bool {
        let mut state = self.state.lock().expect("rate lock");
        self.refill(&mut state);
        state.available > 0
    }

    fn until_allowed(&self) -> Duration {
        let mut state = self.state.lock().expect("rate lock");
        self.refill(&mut state);
        if state.available > 0 {
            return Duration::ZERO;
        }
        (state.period_start + self.period).saturating_duration_since(Instant::now())
    }
}

/// Forwards writes to an inner sink while budgeting them at `limit` per
/// `period`. The write itself always goes through; once the budget is
/// spent the sink reports saturation so upstream sources pause until the
/// period rolls over.
pub struct RateLimiterSink<T, S> {
    inner: S,
    shared: Arc<RateShared>,
    _marker: PhantomData<fn(T)>,
}

impl<T, S: Sink<T>> RateLimiterSink<T, S> {
    pub fn new(limit: u64, period: Duration, inner: S) -> Self {
        let name = format!("rate-limiter({})", inner.sink_name());
        Self {
            inner,
            shared: Arc::new(RateShared {
                id: allocate_sink_id(),
                name,
                limit,
                period,
                state: Mutex::new(RateState {
                    available: limit,
                    period_start: Instant::now(),
                }),
            }),
            _marker: PhantomData,
        }
    }
}

impl<T, S: Clone> Clone for RateLimiterSink<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shared: self.shared.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: 'static, S: Sink<T> + Clone + 'static> Sink<T> for RateLimiterSink<T, S> {
    fn write(&self, value: T) -> bool {
        let accepted = self.inner.write(value);
        self.shared.take_one();
        accepted && self.shared.is_allowed()
    }
}

impl<T: 'static, S: Sink<T> + Clone + 'static> ManagedSink for RateLimiterSink<T, S> {
    fn sink_id(&self) -> SinkId {
        self.shared.id
    }

    fn sink_name(&self) -> &str {
        &self.shared.name
    }

    fn flush_pending(&self) -> bool {
        self.inner.flush_pending() && self.shared.is_allowed()
    }

    fn ready(&self) -> ReadyFuture {
        let inner = self.inner.ready();
        let shared = self.shared.clone();
        Box::pin(async move {
            inner.await;
            let wait = shared.until_allowed();
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        })
    }

    fn boxed_clone(&self) -> Box<dyn ManagedSink> {
        Box::new(self.clone())
    }
}
