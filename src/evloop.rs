//! Event Loop
//!
//! A cooperative, strictly single-threaded reactor. Activities ("pumps")
//! are fd read/write watchers, one-shot or periodic timers, and idlers.
//! Within one loop no callback ever preempts another; the only suspension
//! point is returning from a callback. Pipes scheduled on the same loop
//! therefore need no locks against each other.
//!
//! Other threads interact with a loop only through its [`LoopHandle`],
//! which injects closures via a channel and an eventfd wakeup; this is the
//! bootstrap mechanism for the cross-loop transfer module.
//!
//! # Blockers
//!
//! A pump can be blocked any number of times (back-pressure from a sink
//! that cannot write); a blocked pump stays registered but does not fire
//! until every block is lifted.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::error::{Error, Result};
use crate::sync::WakeFd;

/// What a pump waits for
enum PumpKind {
    ReadFd(RawFd),
    WriteFd(RawFd),
    Timer {
        deadline: Instant,
        repeat: Option<Duration>,
    },
    Idler,
}

struct PumpState {
    kind: PumpKind,
    /// Taken out while the callback runs
    cb: Option<Box<dyn FnMut()>>,
    active: bool,
    blocked: u32,
    /// Whether this pump keeps `run()` alive; internal plumbing doesn't
    keepalive: bool,
}

impl PumpState {
    fn runnable(&self) -> bool {
        self.active && self.blocked == 0
    }
}

type Injected = Box<dyn FnOnce(&EvLoop) + Send>;

struct LoopInner {
    pumps: RefCell<HashMap<u64, PumpState>>,
    next_id: Cell<u64>,
    /// Closures injected from other threads
    inbox: crossbeam_channel::Receiver<Injected>,
    inbox_tx: crossbeam_channel::Sender<Injected>,
    wake: std::sync::Arc<WakeFd>,
    /// Keeps `run()` alive with no pumps (worker loops)
    hold: Cell<bool>,
}

/// A cooperative single-threaded event loop
///
/// Cheap to clone; all clones refer to the same loop. Not `Send`: a loop
/// lives and dies on one thread.
#[derive(Clone)]
pub struct EvLoop {
    inner: Rc<LoopInner>,
}

/// Owning handle to a registered pump; unregisters on drop
pub struct Pump {
    id: u64,
    inner: Weak<LoopInner>,
}

/// Non-owning handle to a pump, for start/stop/block bookkeeping
#[derive(Clone)]
pub struct PumpToken {
    id: u64,
    inner: Weak<LoopInner>,
}

/// Cross-thread handle to a loop
#[derive(Clone)]
pub struct LoopHandle {
    tx: crossbeam_channel::Sender<Injected>,
    wake: std::sync::Arc<WakeFd>,
}

impl EvLoop {
    /// Create a loop on the current thread
    pub fn new() -> Result<Self> {
        let (inbox_tx, inbox) = crossbeam_channel::unbounded();
        let wake = std::sync::Arc::new(WakeFd::new()?);
        Ok(Self {
            inner: Rc::new(LoopInner {
                pumps: RefCell::new(HashMap::new()),
                next_id: Cell::new(1),
                inbox,
                inbox_tx,
                wake,
                hold: Cell::new(false),
            }),
        })
    }

    fn register(&self, kind: PumpKind, cb: Box<dyn FnMut()>, keepalive: bool) -> Pump {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        self.inner.pumps.borrow_mut().insert(
            id,
            PumpState {
                kind,
                cb: Some(cb),
                active: false,
                blocked: 0,
                keepalive,
            },
        );
        Pump {
            id,
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Watch an fd for readability
    pub fn alloc_read_pump(&self, fd: RawFd, cb: impl FnMut() + 'static) -> Result<Pump> {
        if fd < 0 {
            return Err(Error::Upump);
        }
        Ok(self.register(PumpKind::ReadFd(fd), Box::new(cb), true))
    }

    /// Watch an fd for writability
    pub fn alloc_write_pump(&self, fd: RawFd, cb: impl FnMut() + 'static) -> Result<Pump> {
        if fd < 0 {
            return Err(Error::Upump);
        }
        Ok(self.register(PumpKind::WriteFd(fd), Box::new(cb), true))
    }

    /// One-shot (`repeat` = None) or periodic timer
    pub fn alloc_timer(
        &self,
        after: Duration,
        repeat: Option<Duration>,
        cb: impl FnMut() + 'static,
    ) -> Result<Pump> {
        Ok(self.register(
            PumpKind::Timer {
                deadline: Instant::now() + after,
                repeat,
            },
            Box::new(cb),
            true,
        ))
    }

    /// Run once per loop iteration while nothing else is pending
    pub fn alloc_idler(&self, cb: impl FnMut() + 'static) -> Result<Pump> {
        Ok(self.register(PumpKind::Idler, Box::new(cb), true))
    }

    /// A handle other threads can inject closures through
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            tx: self.inner.inbox_tx.clone(),
            wake: std::sync::Arc::clone(&self.inner.wake),
        }
    }

    /// Spawn a dedicated thread running a loop until shut down
    ///
    /// The loop stays alive while idle so peers can inject work; call
    /// [`LoopHandle::shutdown`] to end it. The thread's loop is handed to
    /// `setup` first so initial pumps can be installed.
    pub fn spawn_thread(
        name: &str,
        setup: impl FnOnce(&EvLoop) + Send + 'static,
    ) -> Result<(std::thread::JoinHandle<()>, LoopHandle)> {
        let (handshake_tx, handshake_rx) = crossbeam_channel::bounded(1);
        let thread = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let ev = match EvLoop::new() {
                    Ok(ev) => ev,
                    Err(_) => return,
                };
                ev.inner.hold.set(true);
                let _ = handshake_tx.send(ev.handle());
                setup(&ev);
                ev.run();
            })
            .map_err(|_| Error::External)?;
        let handle = handshake_rx.recv().map_err(|_| Error::External)?;
        Ok((thread, handle))
    }

    fn drain_inbox(&self) {
        self.inner.wake.drain();
        while let Ok(injected) = self.inner.inbox.try_recv() {
            injected(self);
        }
    }

    /// Call a pump's callback with the pump map unborrowed
    fn fire(&self, id: u64) {
        let cb = {
            let mut pumps = self.inner.pumps.borrow_mut();
            match pumps.get_mut(&id) {
                Some(state) => state.cb.take(),
                None => None,
            }
        };
        let Some(mut cb) = cb else { return };
        cb();
        let mut pumps = self.inner.pumps.borrow_mut();
        if let Some(state) = pumps.get_mut(&id) {
            if state.cb.is_none() {
                state.cb = Some(cb);
            }
        }
    }

    /// Run until no keep-alive pump is active (and no hold is set)
    pub fn run(&self) {
        loop {
            self.drain_inbox();

            // Snapshot the runnable pumps.
            let mut fds: Vec<(u64, RawFd, PollFlags)> = Vec::new();
            let mut idlers: Vec<u64> = Vec::new();
            let mut nearest: Option<Instant> = None;
            let mut alive = self.inner.hold.get();
            {
                let pumps = self.inner.pumps.borrow();
                for (&id, state) in pumps.iter() {
                    if !state.runnable() {
                        continue;
                    }
                    alive = alive || state.keepalive;
                    match state.kind {
                        PumpKind::ReadFd(fd) => fds.push((id, fd, PollFlags::POLLIN)),
                        PumpKind::WriteFd(fd) => fds.push((id, fd, PollFlags::POLLOUT)),
                        PumpKind::Timer { deadline, .. } => {
                            nearest = Some(match nearest {
                                Some(n) => n.min(deadline),
                                None => deadline,
                            });
                        }
                        PumpKind::Idler => idlers.push(id),
                    }
                }
            }
            if !alive {
                return;
            }

            // The injector wakeup is always watched.
            let wake_fd = self.inner.wake.raw_fd();
            let now = Instant::now();
            let timeout = if !idlers.is_empty() {
                PollTimeout::ZERO
            } else {
                match nearest {
                    Some(deadline) => {
                        let ms = deadline.saturating_duration_since(now).as_millis();
                        PollTimeout::try_from(ms.min(i32::MAX as u128) as i32)
                            .unwrap_or(PollTimeout::MAX)
                    }
                    None => PollTimeout::NONE,
                }
            };

            let mut poll_fds: Vec<PollFd> = Vec::with_capacity(fds.len() + 1);
            // Safety: the fds stay open for the duration of the poll call;
            // pump owners keep them alive while registered.
            poll_fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(wake_fd) },
                PollFlags::POLLIN,
            ));
            for &(_, fd, flags) in &fds {
                poll_fds.push(PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, flags));
            }

            match poll(&mut poll_fds, timeout) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => return,
            }

            let mut ready: Vec<u64> = Vec::new();
            for (i, &(id, _, flags)) in fds.iter().enumerate() {
                if let Some(revents) = poll_fds[i + 1].revents() {
                    if revents.intersects(flags | PollFlags::POLLERR | PollFlags::POLLHUP) {
                        ready.push(id);
                    }
                }
            }
            drop(poll_fds);

            for id in ready {
                self.fire(id);
            }

            // Expired timers.
            let now = Instant::now();
            let due: Vec<u64> = {
                let mut pumps = self.inner.pumps.borrow_mut();
                let mut due = Vec::new();
                for (&id, state) in pumps.iter_mut() {
                    if !state.runnable() {
                        continue;
                    }
                    if let PumpKind::Timer { deadline, repeat } = &mut state.kind {
                        if *deadline <= now {
                            due.push(id);
                            match repeat {
                                Some(period) => {
                                    while *deadline <= now {
                                        *deadline += *period;
                                    }
                                }
                                None => state.active = false,
                            }
                        }
                    }
                }
                due
            };
            for id in due {
                self.fire(id);
            }

            for id in idlers {
                self.fire(id);
            }
        }
    }
}

impl LoopInner {
    fn with_pump(&self, id: u64, f: impl FnOnce(&mut PumpState)) {
        if let Some(state) = self.pumps.borrow_mut().get_mut(&id) {
            f(state);
        }
    }
}

impl Pump {
    /// Begin firing
    pub fn start(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.with_pump(self.id, |s| s.active = true);
        }
    }

    /// Stop firing; idempotent
    pub fn stop(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.with_pump(self.id, |s| s.active = false);
        }
    }

    /// Non-owning handle for blockers and restarts
    pub fn token(&self) -> PumpToken {
        PumpToken {
            id: self.id,
            inner: self.inner.clone(),
        }
    }

    /// Whether this pump keeps `run()` alive; internal plumbing pumps
    /// (queue drains, proxies) opt out
    pub fn set_keepalive(&self, keepalive: bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.with_pump(self.id, |s| s.keepalive = keepalive);
        }
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.pumps.borrow_mut().remove(&self.id);
        }
    }
}

impl PumpToken {
    /// Begin firing
    pub fn start(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.with_pump(self.id, |s| s.active = true);
        }
    }

    /// Stop firing; idempotent
    pub fn stop(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.with_pump(self.id, |s| s.active = false);
        }
    }

    /// Add a block; the pump stays silent until every block is lifted
    pub fn block(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.with_pump(self.id, |s| s.blocked += 1);
        }
    }

    /// Lift one block
    pub fn unblock(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.with_pump(self.id, |s| s.blocked = s.blocked.saturating_sub(1));
        }
    }
}

impl LoopHandle {
    /// Run a closure on the loop's thread at the next iteration
    ///
    /// Fails with `External` when the loop is gone.
    pub fn submit(&self, f: impl FnOnce(&EvLoop) + Send + 'static) -> Result<()> {
        self.tx.send(Box::new(f)).map_err(|_| Error::External)?;
        self.wake.signal();
        Ok(())
    }

    /// Let the loop exit once its pumps are done
    pub fn shutdown(&self) -> Result<()> {
        self.submit(|ev| ev.inner.hold.set(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_fires_once() {
        let ev = EvLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let hits2 = hits.clone();
        let pump = ev
            .alloc_timer(Duration::from_millis(1), None, move || {
                hits2.set(hits2.get() + 1);
            })
            .unwrap();
        pump.start();
        ev.run();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn periodic_timer_repeats_until_stopped() {
        let ev = EvLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let hits2 = hits.clone();
        let pump = ev
            .alloc_timer(
                Duration::from_millis(1),
                Some(Duration::from_millis(1)),
                move || hits2.set(hits2.get() + 1),
            )
            .unwrap();
        let token = pump.token();
        // A second timer stops the first one after ~5ms.
        let stopper = ev
            .alloc_timer(Duration::from_millis(10), None, move || token.stop())
            .unwrap();
        pump.start();
        stopper.start();
        ev.run();
        assert!(hits.get() >= 3);
    }

    #[test]
    fn blocked_pump_stays_silent() {
        let ev = EvLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let hits2 = hits.clone();
        let pump = ev
            .alloc_timer(Duration::from_millis(1), None, move || {
                hits2.set(hits2.get() + 1);
            })
            .unwrap();
        pump.start();
        let token = pump.token();
        token.block();
        // Unblocker lets the loop finish.
        let unblock = ev
            .alloc_timer(Duration::from_millis(5), None, {
                let token = token.clone();
                move || token.unblock()
            })
            .unwrap();
        unblock.start();
        ev.run();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn injection_from_another_thread() {
        let (thread, handle) = EvLoop::spawn_thread("worker", |_| {}).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        handle
            .submit(move |_ev| {
                tx.send(std::thread::current().name().map(String::from))
                    .unwrap();
            })
            .unwrap();
        let name = rx.recv().unwrap();
        assert_eq!(name.as_deref(), Some("worker"));
        handle.shutdown().unwrap();
        thread.join().unwrap();
    }

    #[test]
    fn read_pump_sees_fd() {
        use crate::sync::spsc_queue;
        let ev = EvLoop::new().unwrap();
        let (mut tx, rx) = spsc_queue::<u32>(4).unwrap();
        tx.push(7).unwrap();
        let got = Rc::new(Cell::new(0));
        let got2 = got.clone();
        let rx = Rc::new(RefCell::new(rx));
        let pump = ev
            .alloc_read_pump(rx.borrow().wake_fd(), {
                let rx = rx.clone();
                move || {
                    let mut rx = rx.borrow_mut();
                    rx.acknowledge();
                    while let Some(v) = rx.pop() {
                        got2.set(v);
                    }
                }
            })
            .unwrap();
        pump.start();
        // One-shot: stop after first fire via a short timer.
        let token = pump.token();
        let stop = ev
            .alloc_timer(Duration::from_millis(5), None, move || token.stop())
            .unwrap();
        stop.start();
        ev.run();
        assert_eq!(got.get(), 7);
    }
}
