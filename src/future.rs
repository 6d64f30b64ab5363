//! A minimal bridge from `std::future::Future` into the fiber scheduler:
//! [`block_on`] is the entire scope of async support this crate provides —
//! no executor, no `spawn`, no combinators. Chaining futures together is
//! left to whatever `std::future` combinators the caller already has;
//! this only makes "block on a future" a real suspension point instead of
//! a busy poll loop.

use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use futures::pin_mut;

use crate::sync::event::Event;

struct EventWaker {
    event: Event,
}

// `Waker` is unconditionally `Send + Sync`, and a fiber driving a future may
// be stolen onto a different worker thread (or woken from the timer
// worker's own thread) between polls, so the wake side can legitimately run
// concurrently with the polling side on another thread. `Rc`'s non-atomic
// refcount would make that a data race; `Arc` is required here.
fn raw_waker(w: Arc<EventWaker>) -> RawWaker {
    const VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop_waker);
    RawWaker::new(Arc::into_raw(w).cast(), &VTABLE)
}

unsafe fn clone(data: *const ()) -> RawWaker {
    Arc::increment_strong_count(data as *const EventWaker);
    raw_waker(Arc::from_raw(data.cast()))
}

unsafe fn wake(data: *const ()) {
    let w: Arc<EventWaker> = Arc::from_raw(data.cast());
    w.event.set();
}

unsafe fn wake_by_ref(data: *const ()) {
    let w: Arc<EventWaker> = Arc::from_raw(data.cast());
    w.event.set();
    std::mem::forget(w);
}

unsafe fn drop_waker(data: *const ()) {
    drop(Arc::from_raw(data as *const EventWaker));
}

/// Runs `f` to completion on the calling fiber, blocking (suspending the
/// fiber, not the worker) whenever it's pending.
///
/// # Panics
/// Panics outside of fiber context — the blocking is implemented as a
/// fiber suspension, which requires one.
pub fn block_on<F: Future>(f: F) -> F::Output {
    pin_mut!(f);
    loop {
        let w = Arc::new(EventWaker { event: Event::new() });
        let waker = unsafe { Waker::from_raw(raw_waker(Arc::clone(&w))) };
        let mut cx = Context::from_waker(&waker);
        if let Poll::Ready(v) = f.as_mut().poll(&mut cx) {
            return v;
        }
        w.event.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::Poll as StdPoll;

    struct Ready<T>(Option<T>);
    impl<T: Unpin> Future for Ready<T> {
        type Output = T;
        fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> StdPoll<T> {
            StdPoll::Ready(self.0.take().expect("polled after completion"))
        }
    }

    #[test]
    fn block_on_resolves_an_already_ready_future() {
        assert_eq!(block_on(Ready(Some(42))), 42);
    }
}
