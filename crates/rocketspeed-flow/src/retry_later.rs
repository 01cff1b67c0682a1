// Sink whose target may ask for a write to be retried after a delay.
use crate::{allocate_sink_id, ManagedSink, ReadyFuture, Sink, SinkId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Result of offering a value to a retry-later handler.
pub enum RetryDecision<T> {
    Accepted,
    /// The handler could not take the value; offer it again after the
    /// delay.
    RetryAfter(T, Duration),
}

type Handler<T> = Box<dyn FnMut(T) -> RetryDecision<T> + Send>;

struct RetryState<T> {
    handler: Handler<T>,
    pending: VecDeque<T>,
    next_attempt: Option<Instant>,
}

struct RetryShared<T> {
    id: SinkId,
    name: String,
    state: Mutex<RetryState<T>>,
}

/// Forwards writes to a handler that may apply backpressure by requesting
/// a retry delay. Refused values are buffered in order and re-offered
/// once the delay elapses.
pub struct RetryLaterSink<T> {
    shared: Arc<RetryShared<T>>,
}

impl<T: Send + 'static> RetryLaterSink<T> {
    pub fn new(
        name: impl Into<String>,
        handler: impl FnMut(T) -> RetryDecision<T> + Send + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(RetryShared {
                id: allocate_sink_id(),
                name: name.into(),
                state: Mutex::new(RetryState {
                    handler: Box::new(handler),
                    pending: VecDeque::new(),
                    next_attempt: None,
                }),
            }),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().expect("retry lock").pending.len()
    }
}

impl<T> Clone for RetryLaterSink<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Sink<T> for RetryLaterSink<T> {
    fn write(&self, value: T) -> bool {
        let mut state = self.shared.state.lock().expect("retry lock");
        if let Some(at) = state.next_attempt {
            if Instant::now() < at {
                state.pending.push_back(value);
                return false;
            }
            state.next_attempt = None;
        }
        if !state.pending.is_empty() {
            // Keep order behind values already waiting for retry.
            state.pending.push_back(value);
            return false;
        }
        match (state.handler)(value) {
            RetryDecision::Accepted => true,
            RetryDecision::RetryAfter(value, delay) => {
                state.pending.push_front(value);
                state.next_attempt = Some(Instant::now() + delay);
                false
            }
        }
    }
}

impl<T: Send + 'static> ManagedSink for RetryLaterSink<T> {
    fn sink_id(&self) -> SinkId {
        self.shared.id
    }

    fn sink_name(&self) -> &str {
        &self.shared.name
    }

    fn flush_pending(&self) -> bool {
        let mut state = self.shared.state.lock().expect("retry lock");
        if let Some(at) = state.next_attempt {
            if Instant::now() < at {
                return false;
            }
            state.next_attempt = None;
        }
        while let Some(value) = state.pending.pop_front() {
            match (state.handler)(value) {
                RetryDecision::Accepted => continue,
                RetryDecision::RetryAfter(value, delay) => {
                    state.pending.push_front(value);
                    state.next_attempt = Some(Instant::now() + delay);
                    return false;
                }
            }
        }
        true
    }

    fn ready(&self) -> ReadyFuture {
        let wait = {
            let state = self.shared.state.lock().expect("retry lock");
            state
                .next_attempt
                .map(|at| at.saturating_duration_since(Instant::now()))
                // No recorded delay; poll again shortly.
                .unwrap_or(Duration::from_millis(10))
        };
        Box::pin(async move {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        })
    }

    fn boxed_clone(&self) -> Box<dyn ManagedSink> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn accepted_writes_pass_straight_through() {
        let taken = Arc::new(Mutex::new(Vec::new()));
        let sink_taken = taken.clone();
        let sink = RetryLaterSink::new("test", move |value: u32| {
            sink_taken.lock().expect("taken").push(value);
            RetryDecision::Accepted
        });
        assert!(sink.write(1));
        assert!(sink.write(2));
        assert_eq!(*taken.lock().expect("taken"), vec![1, 2]);
    }

    #[tokio::test]
    async fn refused_write_is_buffered_and_retried_after_delay() {
        let accept = Arc::new(AtomicBool::new(false));
        let handler_accept = accept.clone();
        let taken = Arc::new(Mutex::new(Vec::new()));
        let handler_taken = taken.clone();
        let sink = RetryLaterSink::new("test", move |value: u32| {
            if handler_accept.load(Ordering::Relaxed) {
                handler_taken.lock().expect("taken").push(value);
                RetryDecision::Accepted
            } else {
                RetryDecision::RetryAfter(value, Duration::from_millis(20))
            }
        });

        assert!(!sink.write(1));
        // Subsequent writes queue behind the refused value.
        assert!(!sink.write(2));
        assert_eq!(sink.pending_len(), 2);
        assert!(!sink.flush_pending());

        accept.store(true, Ordering::Relaxed);
        sink.ready().await;
        assert!(sink.flush_pending());
        assert_eq!(*taken.lock().expect("taken"), vec![1, 2]);
        assert_eq!(sink.pending_len(), 0);
    }
}
