use std::{cell::Cell, fmt, pin::Pin, rc::Rc, task, thread};

use thiserror::Error;

// === Shared === //

#[derive(Debug, Clone, Error)]
#[error("{}", if self.was_panic { "worker thread panicked" } else { "promise dropped unexpectedly" })]
pub struct PromiseCrashed {
    pub was_panic: bool,
}

struct State<T, E> {
    cancelled: Cell<bool>,
    result: Cell<Option<Result<T, E>>>,
    on_result_waker: Cell<Option<task::Waker>>,
}

/// Creates a single-threaded promise. Dropping the resolver without settling it rejects the
/// future with [`PromiseCrashed`].
pub fn promise<T, E>() -> (PromiseResolver<T, E>, PromiseFuture<T, E>)
where
    T: 'static,
    E: 'static + From<PromiseCrashed>,
{
    let state = Rc::new(State {
        cancelled: Cell::new(false),
        result: Cell::new(None),
        on_result_waker: Cell::new(None),
    });

    (
        PromiseResolver {
            state: Some(state.clone()),
        },
        PromiseFuture { state: Some(state) },
    )
}

/// A future that is already settled.
pub fn settled<T, E>(res: Result<T, E>) -> PromiseFuture<T, E>
where
    T: 'static,
    E: 'static + From<PromiseCrashed>,
{
    let (resolver, future) = promise();
    resolver.finish(res);
    future
}

// === PromiseResolver === //

pub struct PromiseResolver<T, E = PromiseCrashed>
where
    T: 'static,
    E: 'static + From<PromiseCrashed>,
{
    state: Option<Rc<State<T, E>>>,
}

impl<T, E> fmt::Debug for PromiseResolver<T, E>
where
    T: 'static,
    E: 'static + From<PromiseCrashed>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseResolver").finish_non_exhaustive()
    }
}

impl<T, E> PromiseResolver<T, E>
where
    T: 'static,
    E: 'static + From<PromiseCrashed>,
{
    /// Whether the future was dropped before the promise settled.
    pub fn is_cancelled(&self) -> bool {
        self.state.as_ref().is_some_and(|state| state.cancelled.get())
    }

    pub fn accept(self, value: T) {
        self.finish(Ok(value));
    }

    pub fn reject(self, err: E) {
        self.finish(Err(err));
    }

    pub fn finish(mut self, res: Result<T, E>) {
        if let Some(state) = self.state.take() {
            state.settle(res);
        }
    }
}

impl<T, E> Drop for PromiseResolver<T, E>
where
    T: 'static,
    E: 'static + From<PromiseCrashed>,
{
    fn drop(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };

        let was_panic = thread::panicking();

        state.settle(Err(PromiseCrashed { was_panic }.into()));
    }
}

impl<T, E> State<T, E> {
    fn settle(&self, res: Result<T, E>) {
        self.result.set(Some(res));

        if let Some(waker) = self.on_result_waker.take() {
            waker.wake();
        }
    }
}

// === PromiseFuture === //

pub struct PromiseFuture<T, E = PromiseCrashed>
where
    T: 'static,
    E: 'static + From<PromiseCrashed>,
{
    state: Option<Rc<State<T, E>>>,
}

impl<T, E> fmt::Debug for PromiseFuture<T, E>
where
    T: 'static,
    E: 'static + From<PromiseCrashed>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseFuture").finish_non_exhaustive()
    }
}

impl<T, E> PromiseFuture<T, E>
where
    T: 'static,
    E: 'static + From<PromiseCrashed>,
{
    /// Whether polling would complete immediately.
    pub fn is_settled(&self) -> bool {
        self.state.as_ref().is_none_or(|state| {
            let res = state.result.take();
            let settled = res.is_some();
            state.result.set(res);
            settled
        })
    }
}

impl<T, E> Future for PromiseFuture<T, E>
where
    T: 'static,
    E: 'static + From<PromiseCrashed>,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        let me = self.get_mut();

        let Some(state) = me.state.as_ref() else {
            return task::Poll::Ready(Err(PromiseCrashed { was_panic: false }.into()));
        };

        if let Some(res) = state.result.take() {
            me.state = None;
            task::Poll::Ready(res)
        } else {
            state.on_result_waker.set(Some(cx.waker().clone()));
            task::Poll::Pending
        }
    }
}

impl<T, E> Drop for PromiseFuture<T, E>
where
    T: 'static,
    E: 'static + From<PromiseCrashed>,
{
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            state.cancelled.set(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_values_are_delivered() {
        let (resolver, future) = promise::<u32, PromiseCrashed>();
        assert!(!future.is_settled());

        resolver.accept(4);
        assert!(future.is_settled());
        assert_eq!(smol::block_on(future).unwrap(), 4);
    }

    #[test]
    fn dropped_resolvers_crash_the_future() {
        let (resolver, future) = promise::<u32, PromiseCrashed>();
        drop(resolver);

        let err = smol::block_on(future).unwrap_err();
        assert!(!err.was_panic);
    }

    #[test]
    fn dropping_the_future_cancels() {
        let (resolver, future) = promise::<u32, PromiseCrashed>();
        assert!(!resolver.is_cancelled());

        drop(future);
        assert!(resolver.is_cancelled());
        resolver.accept(1);
    }

    #[test]
    fn settled_futures_complete_immediately() {
        let future = settled::<(), PromiseCrashed>(Ok(()));
        assert!(future.is_settled());
        smol::block_on(future).unwrap();
    }
}
