//! Single-threaded readiness reactor.
//!
//! Wraps an epoll instance and a `CLOCK_MONOTONIC` timerfd. Registered
//! sources are dispatched by a tagged record rather than virtual calls:
//! the timerfd routes to the timer expiry handler, UDP sockets route to
//! their receiver's batched read path. A deferred-task queue runs at the
//! tail of every poll cycle, which is how the pcap replayer yields between
//! flood batches.
//!
//! The reactor is thread-hostile: every method must run on the thread
//! that constructed it.

mod timer;

use crate::capture::udp::RxEngine;
use crate::capture::SharedHandler;
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{error, warn};

pub use timer::TimerId;
use timer::{TimerEntry, TimerQueue};

/// Event slots handed to a single `epoll_wait`.
const MAX_EVENTS: usize = 128;

/// Readiness interest bits, re-exported so callers don't reach for libc.
pub mod interest {
    pub const READ: u32 = libc::EPOLLIN as u32;
}

/// Dispatch record stored per registered descriptor. Routing is by
/// variant match; receivers build the `Udp` payload themselves.
#[derive(Clone)]
pub enum SourceRecord {
    /// The reactor's own timerfd.
    Timer,
    /// A live UDP socket owned by a `UdpReceiver`.
    Udp(UdpSource),
}

/// Everything needed to drain one ready UDP socket without touching the
/// receiver handle: the engine holds the buffers, the handler is the
/// user callback for the subscribed port.
#[derive(Clone)]
pub struct UdpSource {
    pub(crate) fd: RawFd,
    pub(crate) engine: Rc<RefCell<RxEngine>>,
    pub(crate) handler: SharedHandler,
}

pub struct Reactor {
    epoll: OwnedFd,
    timer_fd: OwnedFd,
    sources: RefCell<HashMap<RawFd, SourceRecord>>,
    timers: RefCell<TimerQueue>,
    deferred: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    owner: ThreadId,
}

/// Current `CLOCK_MONOTONIC` reading in nanoseconds. This is the clock
/// the timerfd is armed against, so expirations can be programmed
/// absolutely.
pub(crate) fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC never fails with a valid timespec pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

impl Reactor {
    pub fn new() -> Result<Rc<Self>> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(Error::last_os());
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll_fd) };

        let tfd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if tfd < 0 {
            return Err(Error::last_os());
        }
        let timer_fd = unsafe { OwnedFd::from_raw_fd(tfd) };

        let reactor = Self {
            epoll,
            timer_fd,
            sources: RefCell::new(HashMap::new()),
            timers: RefCell::new(TimerQueue::new()),
            deferred: RefCell::new(VecDeque::new()),
            owner: thread::current().id(),
        };

        // The timerfd is a permanent source of the loop itself.
        reactor.add_source(tfd, interest::READ, SourceRecord::Timer)?;
        Ok(Rc::new(reactor))
    }

    /// Registers a descriptor with the multiplexer. The record is stored
    /// keyed by fd and recovered from the event's user data on readiness.
    pub fn add_source(&self, fd: RawFd, interest_mask: u32, record: SourceRecord) -> Result<()> {
        self.check_thread();
        if fd < 0 {
            return Err(Error::InvalidArg("negative file descriptor"));
        }
        let mut sources = self.sources.borrow_mut();
        if sources.contains_key(&fd) {
            return Err(Error::InvalidArg("descriptor already registered"));
        }

        let mut ev = libc::epoll_event {
            events: interest_mask,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev) } < 0
        {
            return Err(Error::last_os());
        }
        sources.insert(fd, record);
        Ok(())
    }

    /// Unregisters a descriptor and drops its dispatch record.
    pub fn remove_source(&self, fd: RawFd) -> Result<()> {
        self.check_thread();
        self.sources
            .borrow_mut()
            .remove(&fd)
            .ok_or(Error::NotFound)?;
        if unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        } < 0
        {
            return Err(Error::last_os());
        }
        Ok(())
    }

    /// Polls once and dispatches readiness, then drains the deferred
    /// queue. A non-empty deferred queue forces a non-blocking poll so
    /// queued work is never delayed by the timeout.
    pub fn run_once(&self, timeout_ms: i32) -> Result<()> {
        self.check_thread();
        let timeout = if self.deferred.borrow().is_empty() {
            timeout_ms
        } else {
            0
        };

        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { mem::zeroed() };
        let ready = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout,
            )
        };

        if ready < 0 {
            let err = io::Error::last_os_error();
            // A signal waking the poll is not a failure.
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(Error::Io(err));
            }
        }

        for ev in events.iter().take(ready.max(0) as usize) {
            let fd = ev.u64 as RawFd;
            // Clone the record out so no borrow is held across user code.
            let record = self.sources.borrow().get(&fd).cloned();
            match record {
                Some(SourceRecord::Timer) => self.handle_timer_expiry(),
                Some(SourceRecord::Udp(src)) => {
                    let res = catch_unwind(AssertUnwindSafe(|| {
                        src.engine.borrow_mut().read_batch(src.fd, &src.handler);
                    }));
                    if res.is_err() {
                        error!(fd, "packet handler panicked; continuing");
                    }
                }
                None => {}
            }
        }

        self.drain_deferred();
        Ok(())
    }

    /// Appends a task to run at the tail of the current (or next) poll
    /// cycle.
    pub fn run_in_loop(&self, task: impl FnOnce() + 'static) {
        self.check_thread();
        self.deferred.borrow_mut().push_back(Box::new(task));
    }

    /// Schedules `cb` once, `delay` from now.
    pub fn run_after(&self, delay: Duration, cb: impl FnMut() + 'static) -> Result<TimerId> {
        self.check_thread();
        Ok(self.schedule(delay, Duration::ZERO, false, Box::new(cb)))
    }

    /// Schedules `cb` repeatedly at a fixed cadence. Successive
    /// expirations are derived from the previous expiration, not from the
    /// time the callback finished, so long callbacks do not accumulate
    /// drift.
    pub fn run_every(&self, interval: Duration, cb: impl FnMut() + 'static) -> Result<TimerId> {
        self.check_thread();
        if interval.is_zero() {
            return Err(Error::InvalidArg("zero repeat interval"));
        }
        Ok(self.schedule(interval, interval, true, Box::new(cb)))
    }

    /// Cancels a pending timer. Cancelling from inside the timer's own
    /// callback suppresses the repeat reinsertion but not the in-flight
    /// call.
    pub fn cancel_timer(&self, id: TimerId) -> Result<()> {
        self.check_thread();
        let head_changed = self
            .timers
            .borrow_mut()
            .cancel(id)
            .map_err(|_| Error::NotFound)?;
        if head_changed {
            self.rearm_timer_fd();
        }
        Ok(())
    }

    fn schedule(
        &self,
        delay: Duration,
        interval: Duration,
        repeat: bool,
        callback: Box<dyn FnMut()>,
    ) -> TimerId {
        let expiration_ns = monotonic_ns() + delay.as_nanos() as u64;
        let (id, head_changed) = self.timers.borrow_mut().insert(
            expiration_ns,
            TimerEntry {
                interval_ns: interval.as_nanos() as u64,
                repeat,
                callback,
            },
        );
        if head_changed {
            self.rearm_timer_fd();
        }
        id
    }

    /// Programs the timerfd absolutely for the earliest pending
    /// expiration, or disarms it when no timers remain.
    fn rearm_timer_fd(&self) {
        let earliest = self.timers.borrow().earliest_ns();
        let mut spec: libc::itimerspec = unsafe { mem::zeroed() };
        if let Some(ns) = earliest {
            // An absolute expiration already in the past fires
            // immediately, so no lower clamp is needed.
            spec.it_value.tv_sec = (ns / 1_000_000_000) as libc::time_t;
            spec.it_value.tv_nsec = (ns % 1_000_000_000) as libc::c_long;
        }
        let flags = if earliest.is_some() {
            libc::TFD_TIMER_ABSTIME
        } else {
            0
        };
        if unsafe {
            libc::timerfd_settime(self.timer_fd.as_raw_fd(), flags, &spec, std::ptr::null_mut())
        } < 0
        {
            warn!("timerfd_settime failed: {}", io::Error::last_os_error());
        }
    }

    fn handle_timer_expiry(&self) {
        // Drain the expiration counter to clear readiness; the value
        // itself is not interesting because expiries are recomputed from
        // the clock below.
        let mut expirations: u64 = 0;
        let _ = unsafe {
            libc::read(
                self.timer_fd.as_raw_fd(),
                &mut expirations as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };

        let now_ns = monotonic_ns();
        let expired = self.timers.borrow_mut().pop_expired(now_ns);

        for mut fired in expired {
            // No timer-queue borrow is held here: the callback may
            // schedule or cancel timers freely.
            let res = catch_unwind(AssertUnwindSafe(|| (fired.entry.callback)()));
            if res.is_err() {
                error!(id = fired.id, "timer callback panicked; continuing");
            }

            let mut timers = self.timers.borrow_mut();
            let cancelled = timers.take_cancelled(fired.id);
            if fired.entry.repeat && !cancelled {
                let next_ns = fired.expiration_ns + fired.entry.interval_ns;
                timers.insert_with_id(fired.id, next_ns, fired.entry);
            }
        }

        self.timers.borrow_mut().finish_firing();
        self.rearm_timer_fd();
    }

    fn drain_deferred(&self) {
        // Swap-and-drain: tasks appended while draining land in the new
        // queue and run on the next cycle.
        let tasks = mem::take(&mut *self.deferred.borrow_mut());
        for task in tasks {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("deferred task panicked; continuing");
            }
        }
    }

    fn check_thread(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "Reactor accessed from wrong thread"
        );
    }
}
