use core::{
    future::{poll_fn, Future},
    task::Poll,
};

use portable_atomic::{AtomicU32, AtomicUsize, Ordering};

use atomic_waker::AtomicWaker;

/// Completion signal for the command in flight.
///
/// Every attempt at issuing a command arms the signal with a fresh token. The RX loop completes
/// the signal with the token of the command it believes the reply belongs to, which is only
/// accepted if it is the token armed last. Tokens are never reused, so a completion for an
/// abandoned attempt can't wake a later one.
pub struct ReplySignal {
    next_token: AtomicU32,
    armed: AtomicU32,
    completed: AtomicU32,
    waker: AtomicWaker,
}
impl ReplySignal {
    const NONE: u32 = 0;
    pub const fn new() -> Self {
        Self {
            next_token: AtomicU32::new(1),
            armed: AtomicU32::new(Self::NONE),
            completed: AtomicU32::new(Self::NONE),
            waker: AtomicWaker::new(),
        }
    }
    /// Arm the signal for a new attempt and return its token.
    pub fn arm(&self) -> u32 {
        let mut token = self.next_token.fetch_add(1, Ordering::Relaxed);
        if token == Self::NONE {
            token = self.next_token.fetch_add(1, Ordering::Relaxed);
        }
        self.completed.store(Self::NONE, Ordering::Relaxed);
        self.armed.store(token, Ordering::Release);
        token
    }
    /// Stop accepting completions for the armed token.
    pub fn disarm(&self) {
        self.armed.store(Self::NONE, Ordering::Release);
    }
    /// The token currently armed, if any.
    #[cfg(test)]
    pub fn armed(&self) -> Option<u32> {
        match self.armed.load(Ordering::Acquire) {
            Self::NONE => None,
            token => Some(token),
        }
    }
    /// Complete the attempt with this token.
    ///
    /// Returns [false] and does nothing, if the token isn't the one armed last.
    pub fn complete(&self, token: u32) -> bool {
        if token == Self::NONE || self.armed.load(Ordering::Acquire) != token {
            return false;
        }
        self.completed.store(token, Ordering::Release);
        self.waker.wake();
        true
    }
    /// Wait for the attempt with this token to be completed.
    pub fn wait(&self, token: u32) -> impl Future<Output = ()> + use<'_> {
        poll_fn(move |cx| {
            if self.completed.load(Ordering::Acquire) == token {
                Poll::Ready(())
            } else {
                self.waker.register(cx.waker());
                // The completion may have happened in between.
                if self.completed.load(Ordering::Acquire) == token {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
        })
    }
}

/// A synchronization primitive, which allows queueing a number signals, to be awaited.
///
/// This is used to kick the work loop, which then looks at the shared state to find out what
/// needs to be done.
pub struct SignalQueue {
    waker: AtomicWaker,
    queued_signals: AtomicUsize,
}
impl SignalQueue {
    pub const fn new() -> Self {
        Self {
            waker: AtomicWaker::new(),
            queued_signals: AtomicUsize::new(0),
        }
    }
    /// Increments the queued signals by one.
    pub fn put(&self) {
        self.queued_signals.fetch_add(1, Ordering::Relaxed);
        self.waker.wake();
    }
    /// Asynchronously wait for the next signal.
    ///
    /// All signals queued up to this point are consumed at once, since one pass of the work loop
    /// handles all of them.
    pub async fn next(&self) {
        poll_fn(|cx| {
            if self.queued_signals.swap(0, Ordering::Relaxed) == 0 {
                self.waker.register(cx.waker());
                if self.queued_signals.swap(0, Ordering::Relaxed) == 0 {
                    return Poll::Pending;
                }
            }
            Poll::Ready(())
        })
        .await
    }
}
