//! One-shot settable completion future.
//!
//! The queue's async dequeue/peek hand-off needs a minimal primitive: a cell
//! that exactly one producer settles — with a value, an error, or a
//! cancellation — and that consumers can block on. The scheduling model is
//! plain threads with blocking I/O, so the awaiter is a condvar wait, not a
//! task poll.
//!
//! Contract:
//!
//! - `set` / `set_error` / `cancel`: first settler wins and returns `true`;
//!   every later attempt returns `false` and changes nothing.
//! - `cancel` never interrupts the producing thread; a cancelled future is
//!   never subsequently completed with a value.
//! - `wait` blocks until settled; cancellation and producer errors surface
//!   as `Err`. A delivered value is handed to exactly one waiter.

use std::time::{Duration, Instant};

use eyre::Result;
use parking_lot::{Condvar, Mutex};

enum State<T> {
    Pending,
    Ready(Result<T>),
    Cancelled,
    Delivered,
}

pub struct SettableFuture<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

impl<T> SettableFuture<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending),
            cond: Condvar::new(),
        }
    }

    fn settle(&self, next: State<T>) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, State::Pending) {
            *state = next;
            self.cond.notify_all();
            true
        } else {
            false
        }
    }

    pub fn set(&self, value: T) -> bool {
        self.settle(State::Ready(Ok(value)))
    }

    pub fn set_error(&self, error: eyre::Report) -> bool {
        self.settle(State::Ready(Err(error)))
    }

    pub fn cancel(&self) -> bool {
        self.settle(State::Cancelled)
    }

    pub fn is_done(&self) -> bool {
        !matches!(*self.state.lock(), State::Pending)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.lock(), State::Cancelled)
    }

    /// Blocks until the future settles.
    pub fn wait(&self) -> Result<T> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                State::Pending => self.cond.wait(&mut state),
                _ => break,
            }
        }
        Self::take(&mut state)
    }

    /// Blocks up to `timeout`; `None` means it is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while matches!(*state, State::Pending) {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
        Some(Self::take(&mut state))
    }

    fn take(state: &mut State<T>) -> Result<T> {
        match std::mem::replace(state, State::Delivered) {
            State::Ready(result) => result,
            State::Cancelled => {
                *state = State::Cancelled;
                Err(eyre::eyre!("completion future was cancelled"))
            }
            State::Delivered => {
                Err(eyre::eyre!("completion future already delivered its result"))
            }
            // wait loops exclude Pending before calling take
            State::Pending => Err(eyre::eyre!("completion future still pending")),
        }
    }
}

impl<T> Default for SettableFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}
