//! Single-flight memoization of async resolutions

use std::future::Future;

use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use parking_lot::Mutex;

type SharedResult<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

enum State<T, E> {
    Empty,
    Pending {
        generation: u64,
        future: SharedResult<T, E>,
    },
    Ready(T),
}

struct Inner<T, E> {
    state: State<T, E>,
    generation: u64,
}

/// Memoizes the first successful result of an async resolution.
///
/// Concurrent callers before completion await the same in-flight future. The lock is only
/// held while installing or reading the state, never while the future runs. A failed
/// resolution is not cached, the next caller starts a new one.
pub struct SingleFlight<T, E> {
    inner: Mutex<Inner<T, E>>,
}

impl<T, E> Default for SingleFlight<T, E> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Empty,
                generation: 0,
            }),
        }
    }
}

impl<T, E> std::fmt::Debug for SingleFlight<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.inner.lock().state {
            State::Empty => "Empty",
            State::Pending { .. } => "Pending",
            State::Ready(_) => "Ready",
        };
        f.debug_struct("SingleFlight").field("state", &state).finish()
    }
}

impl<T, E> SingleFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// The memoized value, if the resolution already succeeded
    pub fn get(&self) -> Option<T> {
        match &self.inner.lock().state {
            State::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Returns the memoized value, joins the in-flight resolution, or starts one with `init`
    pub async fn get_or_try_init<F, Fut>(&self, init: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (generation, future) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match &inner.state {
                State::Ready(value) => return Ok(value.clone()),
                State::Pending { generation, future } => (*generation, future.clone()),
                State::Empty => {
                    inner.generation += 1;
                    let generation = inner.generation;
                    let future = init().boxed().shared();
                    inner.state = State::Pending {
                        generation,
                        future: future.clone(),
                    };
                    (generation, future)
                }
            }
        };

        let result = future.await;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let State::Pending { generation: current, .. } = &inner.state {
            if *current == generation {
                inner.state = match &result {
                    Ok(value) => State::Ready(value.clone()),
                    Err(_) => State::Empty,
                };
            }
        }
        result
    }
}
