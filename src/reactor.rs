//! Single-threaded event reactor (§4.1).
//!
//! Built on `mio`, the lowest-level readiness-polling crate in this
//! corpus (see `other_examples` for `mio`-backed raw TCP reactors), rather
//! than a multi-threaded async runtime — the relay's entire RTSP/TCP/timer
//! dispatch runs on one thread by design (§5).
//!
//! Three primitive registrations, exactly as specified:
//! - [`Reactor::register`] — readable-fd handler.
//! - [`Reactor::schedule_after`] — one-shot delayed task, cancellable by token.
//! - [`Reactor::run`] — drives the loop until an externally-settable watch
//!   flag becomes true.
//!
//! A callback runs to completion before the next is dispatched, and may
//! freely register/cancel/re-register other callbacks (including its own
//! fd) from within itself — the `&mut Reactor` handed to every callback is
//! the same reactor driving the loop, there is no re-entrant poll.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{event::Source, Events, Interest, Poll, Token};

type ReadableCallback = Box<dyn FnMut(&mut Reactor)>;
type TimerCallback = Box<dyn FnOnce(&mut Reactor)>;

/// Cancellation handle for a delayed task scheduled via [`Reactor::schedule_after`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

struct TimerEntry {
    deadline: Instant,
    id: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

/// The single-threaded event reactor.
///
/// Owns the `mio::Poll` instance, the fd-readiness callback table, and the
/// timer min-heap. There is exactly one of these per process (§3 invariant).
pub struct Reactor {
    poll: Poll,
    events: Events,
    readable: HashMap<Token, ReadableCallback>,
    next_token: usize,
    timer_heap: BinaryHeap<Reverse<TimerEntry>>,
    timer_callbacks: HashMap<u64, TimerCallback>,
    next_timer_id: u64,
}

/// Upper bound on a single `poll()` wait, so the watch variable is checked
/// promptly even when nothing is scheduled or readable.
const MAX_POLL_WAIT: Duration = Duration::from_millis(250);

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Reactor {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            readable: HashMap::new(),
            next_token: 0,
            timer_heap: BinaryHeap::new(),
            timer_callbacks: HashMap::new(),
            next_timer_id: 0,
        })
    }

    /// Register `source` for readability (level-triggered semantics are
    /// sufficient per spec; callbacks that read sockets must still drain
    /// available data since `mio`'s epoll/kqueue backends report readiness
    /// edge-triggered — see callbacks in `sink` and `transport`).
    pub fn register<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        callback: ReadableCallback,
    ) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(source, token, Interest::READABLE)?;
        self.readable.insert(token, callback);
        Ok(token)
    }

    /// Unregister a previously-registered fd. Must be called by the
    /// callback before it closes its own fd (spec §4.1 failure rule);
    /// double-deregistration is tolerated (the source may already be gone).
    pub fn deregister<S: Source + ?Sized>(&mut self, source: &mut S, token: Token) {
        let _ = self.poll.registry().deregister(source);
        self.readable.remove(&token);
    }

    /// Schedule a one-shot callback for `delay` from now. Returns an
    /// opaque token that can be passed to [`Reactor::cancel`].
    pub fn schedule_after(&mut self, delay: Duration, callback: TimerCallback) -> TimerToken {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        let deadline = Instant::now() + delay;
        self.timer_heap.push(Reverse(TimerEntry { deadline, id }));
        self.timer_callbacks.insert(id, callback);
        TimerToken(id)
    }

    /// Cancel a scheduled task. A no-op if the task already fired (its
    /// callback was removed from the table, so it simply won't be found
    /// when the stale heap entry is eventually popped).
    pub fn cancel(&mut self, token: TimerToken) {
        self.timer_callbacks.remove(&token.0);
    }

    /// Run the loop until `watch` is set to `true` by any callback (or by
    /// a signal handler registered via `signal_hook::flag::register`).
    pub fn run(&mut self, watch: &Arc<AtomicBool>) -> io::Result<()> {
        while !watch.load(Ordering::SeqCst) {
            self.run_once()?;
        }
        Ok(())
    }

    /// Run one iteration: wait for the next timer or fd readiness (capped
    /// at [`MAX_POLL_WAIT`]), then dispatch whatever fired. Exposed
    /// separately so tests can single-step the reactor.
    pub fn run_once(&mut self) -> io::Result<()> {
        let timeout = self.next_timeout();
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let ready_tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
        for token in ready_tokens {
            if let Some(mut callback) = self.readable.remove(&token) {
                callback(self);
                // The callback may have re-registered the same token (e.g.
                // after re-arming a listener); only put it back if nobody
                // already replaced or removed it.
                self.readable.entry(token).or_insert(callback);
            }
        }

        self.dispatch_expired_timers();
        Ok(())
    }

    fn next_timeout(&self) -> Duration {
        match self.timer_heap.peek() {
            Some(Reverse(entry)) => {
                let now = Instant::now();
                if entry.deadline <= now {
                    Duration::from_millis(0)
                } else {
                    (entry.deadline - now).min(MAX_POLL_WAIT)
                }
            }
            None => MAX_POLL_WAIT,
        }
    }

    fn dispatch_expired_timers(&mut self) {
        let now = Instant::now();
        let mut fired: Vec<u64> = Vec::new();
        while let Some(Reverse(entry)) = self.timer_heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Reverse(entry) = self.timer_heap.pop().unwrap();
            fired.push(entry.id);
        }
        for id in fired {
            if let Some(callback) = self.timer_callbacks.remove(&id) {
                callback(self);
            }
        }
    }

    /// Direct access to the `mio::Registry`, for callbacks that need to
    /// re-register an existing source with different interest (rare; most
    /// code goes through [`Reactor::register`]).
    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }
}

/// Build the `Arc<AtomicBool>` watch variable and wire `SIGINT`/`SIGTERM`
/// to set it, giving Ctrl-C the same orderly-shutdown path as a natural
/// end-of-stream (§4.1, §6).
pub fn install_shutdown_watch() -> io::Result<Arc<AtomicBool>> {
    let watch = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&watch))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&watch))?;
    Ok(watch)
}
