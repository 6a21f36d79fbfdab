//! Cross-Loop Transfer
//!
//! Pipes are confined to the loop they were mounted on. To run a pipe on
//! another thread's loop, a [`XferMgr`] moves construction and ownership
//! over there and leaves a local *proxy* behind:
//!
//! ```text
//! local loop                          remote loop
//! ──────────                          ───────────
//! proxy.control(SetUri) ──commands──> owned pipe, commands applied
//! proxy probe chain     <──events──── pipe events, serialized
//! ```
//!
//! Both directions are bounded SPSC queues drained by read pumps, so
//! ordering per direction is preserved and a full command queue surfaces
//! as the transient [`Error::External`]. Only the enumerated command
//! subset crosses (attach-loop, set-uri, set-output between pipes of the
//! same manager, release, detach); everything else stays local and
//! answers `Unhandled`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::evloop::{EvLoop, LoopHandle, Pump};
use crate::packet::Packet;
use crate::pipe::{Command, Pipe, PipeCtx, PipeHandle};
use crate::probe::{EncapsStatus, Event, LogLevel, LogMsg, Probe, ProbeChain, ProbeVerdict};
use crate::sync::{spsc_queue, SpscProducer};

/// Queue depth per direction
const DEFAULT_DEPTH: usize = 64;

/// Builds the remote pipe on the remote loop, with the forwarding probe
/// chain the manager prepared
pub type RemoteBuilder = Box<dyn FnOnce(&EvLoop, ProbeChain) -> PipeHandle + Send>;

enum XferCmd {
    Mount { id: u64, builder: RemoteBuilder },
    AttachEvLoop { id: u64 },
    SetUri { id: u64, uri: String },
    SetOutput { id: u64, output_id: u64 },
    Release { id: u64 },
    Detach { id: u64 },
}

/// The event subset that crosses back to the proxy
enum RemoteEvent {
    Ready,
    Dead,
    SourceEnd,
    SinkEnd,
    Fatal(Error),
    ErrorEvent(Error),
    Log {
        level: LogLevel,
        prefixes: Vec<String>,
        message: String,
    },
    ClockRef {
        systime: u64,
        prog: u64,
        discontinuity: bool,
    },
    TsStatus(EncapsStatus),
    LastCc(u8),
    NewFlowDef(Packet),
}

struct XferEvt {
    id: u64,
    event: RemoteEvent,
}

// ---------------------------------------------------------------------------
// Remote side
// ---------------------------------------------------------------------------

struct RemoteState {
    pipes: HashMap<u64, PipeHandle>,
    evt_tx: Rc<RefCell<SpscProducer<XferEvt>>>,
}

/// Forwards a remote pipe's events into the event queue
struct ForwardProbe {
    id: u64,
    evt_tx: Rc<RefCell<SpscProducer<XferEvt>>>,
}

impl ForwardProbe {
    fn send(&self, event: RemoteEvent) {
        // Event queue full: the observation is lost, the pipeline is not.
        let _ = self.evt_tx.borrow_mut().push(XferEvt {
            id: self.id,
            event,
        });
    }
}

impl Probe for ForwardProbe {
    fn catch(&self, event: &mut Event<'_>) -> Result<ProbeVerdict> {
        let serialized = match event {
            Event::Ready => RemoteEvent::Ready,
            Event::Dead => RemoteEvent::Dead,
            Event::SourceEnd => RemoteEvent::SourceEnd,
            Event::SinkEnd => RemoteEvent::SinkEnd,
            Event::Fatal(err) => RemoteEvent::Fatal(*err),
            Event::ErrorEvent(err) => RemoteEvent::ErrorEvent(*err),
            Event::Log(msg) => RemoteEvent::Log {
                level: msg.level,
                prefixes: msg.prefixes.clone(),
                message: msg.message.clone(),
            },
            Event::ClockRef {
                systime,
                prog,
                discontinuity,
            } => RemoteEvent::ClockRef {
                systime: *systime,
                prog: *prog,
                discontinuity: *discontinuity,
            },
            Event::TsStatus(status) => RemoteEvent::TsStatus(*status),
            Event::LastCc(cc) => RemoteEvent::LastCc(*cc),
            Event::NewFlowDef(def) => RemoteEvent::NewFlowDef(def.dup()),
            // Needs and requests are answered on the remote loop.
            _ => return Ok(ProbeVerdict::Pass),
        };
        self.send(serialized);
        Ok(ProbeVerdict::Handled)
    }
}

fn apply_remote(ev: &EvLoop, state: &Rc<RefCell<RemoteState>>, cmd: XferCmd) {
    match cmd {
        XferCmd::Mount { id, builder } => {
            let probe = ProbeChain::null().push(ForwardProbe {
                id,
                evt_tx: Rc::clone(&state.borrow().evt_tx),
            });
            let pipe = builder(ev, probe);
            state.borrow_mut().pipes.insert(id, pipe);
        }
        XferCmd::AttachEvLoop { id } => {
            if let Some(pipe) = state.borrow().pipes.get(&id) {
                let _ = pipe.control(Command::AttachEvLoop(ev.clone()));
            }
        }
        XferCmd::SetUri { id, uri } => {
            if let Some(pipe) = state.borrow().pipes.get(&id) {
                let _ = pipe.control(Command::SetUri(&uri));
            }
        }
        XferCmd::SetOutput { id, output_id } => {
            let state = state.borrow();
            if let (Some(pipe), Some(output)) =
                (state.pipes.get(&id), state.pipes.get(&output_id))
            {
                let _ = pipe.set_output(output);
            }
        }
        XferCmd::Release { id } => {
            // Dropping the handle destroys the pipe on this loop; its Dead
            // event travels back through the forward probe.
            state.borrow_mut().pipes.remove(&id);
        }
        XferCmd::Detach { id } => {
            // The pipe leaves the manager's custody; it survives only if
            // the builder kept other handles on this loop.
            state.borrow_mut().pipes.remove(&id);
        }
    }
}

// ---------------------------------------------------------------------------
// Local side
// ---------------------------------------------------------------------------

struct LocalState {
    cmd_tx: RefCell<SpscProducer<XferCmd>>,
    /// Proxy probe chains, kept alive until the remote `Dead` arrives
    registry: RefCell<HashMap<u64, ProbeChain>>,
    next_id: Cell<u64>,
}

impl LocalState {
    fn send(&self, cmd: XferCmd) -> Result<()> {
        self.cmd_tx
            .borrow_mut()
            .push(cmd)
            .map_err(|_| Error::External)
    }
}

/// Moves pipes to a remote loop and proxies them locally
pub struct XferMgr {
    state: Rc<LocalState>,
    _evt_pump: Pump,
}

impl XferMgr {
    /// Create a transfer manager between the local loop and a remote one
    ///
    /// The remote loop (usually from [`EvLoop::spawn_thread`]) gets the
    /// command consumer installed through its handle; the local loop hosts
    /// the event consumer.
    pub fn new(local: &EvLoop, remote: &LoopHandle) -> Result<Self> {
        Self::with_depth(local, remote, DEFAULT_DEPTH)
    }

    /// Same with an explicit per-direction queue depth
    pub fn with_depth(local: &EvLoop, remote: &LoopHandle, depth: usize) -> Result<Self> {
        let (cmd_tx, cmd_rx) = spsc_queue::<XferCmd>(depth)?;
        let (evt_tx, evt_rx) = spsc_queue::<XferEvt>(depth)?;

        // Remote half: drain commands into pipe operations.
        remote.submit(move |ev| {
            let state = Rc::new(RefCell::new(RemoteState {
                pipes: HashMap::new(),
                evt_tx: Rc::new(RefCell::new(evt_tx)),
            }));
            let cmd_rx = Rc::new(RefCell::new(cmd_rx));
            let fd = cmd_rx.borrow().wake_fd();
            let pump = {
                let ev = ev.clone();
                let state = Rc::clone(&state);
                ev.clone().alloc_read_pump(fd, move || {
                    let mut rx = cmd_rx.borrow_mut();
                    rx.acknowledge();
                    while let Some(cmd) = rx.pop() {
                        apply_remote(&ev, &state, cmd);
                    }
                })
            };
            if let Ok(pump) = pump {
                pump.set_keepalive(false);
                pump.start();
                // The pump lives as long as the remote state does.
                state.borrow_mut().pipes.insert(0, keepalive_pipe(pump));
            }
        })?;

        // Local half: drain events back onto proxy probe chains.
        let state = Rc::new(LocalState {
            cmd_tx: RefCell::new(cmd_tx),
            registry: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
        });
        let evt_rx = Rc::new(RefCell::new(evt_rx));
        let fd = evt_rx.borrow().wake_fd();
        let evt_pump = {
            let state = Rc::clone(&state);
            local.alloc_read_pump(fd, move || {
                let mut rx = evt_rx.borrow_mut();
                rx.acknowledge();
                while let Some(evt) = rx.pop() {
                    dispatch_event(&state, evt);
                }
            })?
        };
        evt_pump.set_keepalive(false);
        evt_pump.start();

        Ok(Self {
            state,
            _evt_pump: evt_pump,
        })
    }

    /// Hand a pipe to the remote loop, returning the local proxy
    ///
    /// `builder` runs on the remote thread; it must mount the pipe with
    /// the probe chain it is given (extending it is fine), so events find
    /// their way back. `probe` is the proxy's local chain where those
    /// events are re-thrown.
    pub fn transfer(
        &self,
        builder: impl FnOnce(&EvLoop, ProbeChain) -> PipeHandle + Send + 'static,
        probe: ProbeChain,
    ) -> Result<PipeHandle> {
        let id = self.state.next_id.get();
        self.state.next_id.set(id + 1);
        self.state.send(XferCmd::Mount {
            id,
            builder: Box::new(builder),
        })?;
        self.state.registry.borrow_mut().insert(id, probe.clone());
        let proxy = XferProxy {
            state: Rc::clone(&self.state),
            id,
            released: false,
        };
        Ok(PipeHandle::mount(proxy, probe))
    }
}

fn dispatch_event(state: &Rc<LocalState>, evt: XferEvt) {
    let chain = match state.registry.borrow().get(&evt.id) {
        Some(chain) => chain.clone(),
        None => return,
    };
    match evt.event {
        RemoteEvent::Ready => {
            let _ = chain.throw(&mut Event::Ready);
        }
        RemoteEvent::Dead => {
            let _ = chain.throw(&mut Event::Dead);
            state.registry.borrow_mut().remove(&evt.id);
        }
        RemoteEvent::SourceEnd => {
            let _ = chain.throw(&mut Event::SourceEnd);
        }
        RemoteEvent::SinkEnd => {
            let _ = chain.throw(&mut Event::SinkEnd);
        }
        RemoteEvent::Fatal(err) => {
            let _ = chain.throw(&mut Event::Fatal(err));
        }
        RemoteEvent::ErrorEvent(err) => {
            let _ = chain.throw(&mut Event::ErrorEvent(err));
        }
        RemoteEvent::Log {
            level,
            prefixes,
            message,
        } => {
            let mut msg = LogMsg {
                level,
                prefixes,
                message,
            };
            let _ = chain.throw(&mut Event::Log(&mut msg));
        }
        RemoteEvent::ClockRef {
            systime,
            prog,
            discontinuity,
        } => {
            let _ = chain.throw(&mut Event::ClockRef {
                systime,
                prog,
                discontinuity,
            });
        }
        RemoteEvent::TsStatus(status) => {
            let _ = chain.throw(&mut Event::TsStatus(status));
        }
        RemoteEvent::LastCc(cc) => {
            let _ = chain.throw(&mut Event::LastCc(cc));
        }
        RemoteEvent::NewFlowDef(def) => {
            let _ = chain.throw(&mut Event::NewFlowDef(&def));
        }
    }
}

/// Query resolved by proxies of the same manager during `SetOutput`
struct ProxyQuery {
    mgr_token: usize,
    id: Option<u64>,
}

/// Local stand-in for a pipe owned by the remote loop
struct XferProxy {
    state: Rc<LocalState>,
    id: u64,
    released: bool,
}

impl Pipe for XferProxy {
    fn input(&mut self, ctx: &mut PipeCtx, _pkt: Packet) {
        ctx.warn("data cannot cross a transfer proxy; dropping");
    }

    fn control(&mut self, _ctx: &mut PipeCtx, cmd: Command<'_>) -> Result<()> {
        match cmd {
            Command::AttachEvLoop(_) => {
                // The remote pipe runs on the remote loop, whatever was
                // passed here.
                self.state.send(XferCmd::AttachEvLoop { id: self.id })
            }
            Command::SetUri(uri) => self.state.send(XferCmd::SetUri {
                id: self.id,
                uri: uri.to_owned(),
            }),
            Command::SetOutput(output) => {
                let mut query = ProxyQuery {
                    mgr_token: Rc::as_ptr(&self.state) as usize,
                    id: None,
                };
                output.control_ext(&mut query).map_err(|_| Error::Invalid)?;
                let output_id = query.id.ok_or(Error::Invalid)?;
                self.state.send(XferCmd::SetOutput {
                    id: self.id,
                    output_id,
                })
            }
            Command::Extension(ext) => {
                if let Some(query) = ext.downcast_mut::<ProxyQuery>() {
                    if query.mgr_token == Rc::as_ptr(&self.state) as usize {
                        query.id = Some(self.id);
                        return Ok(());
                    }
                    return Err(Error::Invalid);
                }
                if ext.downcast_mut::<DetachCmd>().is_some() {
                    self.released = true;
                    return self.state.send(XferCmd::Detach { id: self.id });
                }
                Err(Error::Unhandled)
            }
            _ => Err(Error::Unhandled),
        }
    }
}

impl Drop for XferProxy {
    fn drop(&mut self) {
        if !self.released {
            // Remote destruction is asynchronous; the registry keeps the
            // probe chain alive until the remote Dead arrives.
            let _ = self.state.send(XferCmd::Release { id: self.id });
        }
    }
}

/// Extension command detaching the remote pipe from the manager
pub struct DetachCmd;

/// Pins the command pump into the remote pipe map under the reserved id 0
fn keepalive_pipe(pump: Pump) -> PipeHandle {
    struct Keepalive {
        _pump: Pump,
    }
    impl Pipe for Keepalive {
        fn input(&mut self, _ctx: &mut PipeCtx, _pkt: Packet) {}
        fn control(&mut self, _ctx: &mut PipeCtx, _cmd: Command<'_>) -> Result<()> {
            Err(Error::Unhandled)
        }
    }
    PipeHandle::mount(Keepalive { _pump: pump }, ProbeChain::null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeVerdict;
    use std::sync::mpsc;

    struct SendRecorder {
        tx: mpsc::Sender<&'static str>,
    }

    impl Probe for SendRecorder {
        fn catch(&self, event: &mut Event<'_>) -> Result<ProbeVerdict> {
            let name = match event {
                Event::Ready => "ready",
                Event::Dead => "dead",
                Event::SourceEnd => "source_end",
                _ => return Ok(ProbeVerdict::Pass),
            };
            let _ = self.tx.send(name);
            Ok(ProbeVerdict::Handled)
        }
    }

    struct RecordingPipe {
        uris: Rc<RefCell<Vec<String>>>,
    }

    impl Pipe for RecordingPipe {
        fn input(&mut self, _ctx: &mut PipeCtx, _pkt: Packet) {}
        fn control(&mut self, ctx: &mut PipeCtx, cmd: Command<'_>) -> Result<()> {
            match cmd {
                Command::SetUri(uri) => {
                    self.uris.borrow_mut().push(uri.to_owned());
                    ctx.throw(&mut Event::SourceEnd).ok();
                    Ok(())
                }
                _ => Err(Error::Unhandled),
            }
        }
    }

    #[test]
    fn set_uri_crosses_and_events_come_back() {
        let (worker, remote) = EvLoop::spawn_thread("xfer-remote", |_| {}).unwrap();
        let local = EvLoop::new().unwrap();
        let mgr = XferMgr::new(&local, &remote).unwrap();

        let (tx, rx) = mpsc::channel();
        let probe = ProbeChain::null().push(SendRecorder { tx });
        let proxy = mgr
            .transfer(
                |_ev, probe| {
                    PipeHandle::mount(
                        RecordingPipe {
                            uris: Rc::new(RefCell::new(Vec::new())),
                        },
                        probe,
                    )
                },
                probe,
            )
            .unwrap();

        proxy.control(Command::SetUri("file:/tmp/x")).unwrap();

        // Local mount ready fires synchronously; the remote ready and the
        // source_end echo arrive through the event queue once the local
        // loop runs.
        let mut seen = Vec::new();
        seen.push(rx.recv().unwrap()); // proxy mount ready

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while seen.len() < 3 && std::time::Instant::now() < deadline {
            // Drive the local loop briefly so the event pump fires.
            let stop = local
                .alloc_timer(std::time::Duration::from_millis(10), None, || {})
                .unwrap();
            stop.start();
            local.run();
            while let Ok(name) = rx.try_recv() {
                seen.push(name);
            }
        }
        assert!(seen.contains(&"ready"));
        assert!(seen.contains(&"source_end"));

        drop(proxy);
        remote.shutdown().unwrap();
        worker.join().unwrap();
    }
}
