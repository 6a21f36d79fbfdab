//! Pipe Core
//!
//! A pipe is a processing stage: packets are pushed into its input, typed
//! commands control it, and events climb its probe chain. Pipes are
//! mounted on [`PipeHandle`]s, loop-confined shared handles in the spirit
//! of the rest of the loop-local state (`Rc` + `RefCell`); the payload
//! path stays single-owner because `input` consumes the packet.
//!
//! # Lifecycle
//!
//! ```text
//! mount -> READY --input/control--> READY --last handle dropped--> DEAD
//! ```
//!
//! `Ready` is thrown when the pipe is mounted and `Dead` when the last
//! handle goes away. A pipe that has not received a flow definition yet
//! must refuse input.
//!
//! # Control protocol
//!
//! The common commands are a sealed enum; module-specific commands travel
//! through [`Command::Extension`] as `Any` payloads, so unknown extensions
//! are answered with `Unhandled` instead of colliding.

mod bin;
mod helpers;
mod null;
mod queue;

pub use bin::BinPipe;
pub use helpers::{InputQueue, OutputHelper, SubList};
pub use null::{CollectSink, Collected, NullSink};
pub use queue::{queue_pair, QueueEnd, QueueSink, QueueSourcePart};

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::buf::BufMgr;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::evloop::{EvLoop, PumpToken};
use crate::packet::{Packet, PacketMgr};
use crate::probe::{Event, LogLevel, ProbeChain};

/// Identifies a request across registration and cancellation
pub type RequestId = u64;

/// What a request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Negotiate a concrete flow format from a preferred template
    FlowFormat,
    /// A buffer allocator conforming to the template flow format
    BufMgr,
    /// A packet factory
    PacketMgr,
    /// A clock
    Clock,
    /// An event loop to install pumps on
    EvLoop,
    /// A factory for source pipes
    SourceMgr,
}

/// A provider's answer to a request
pub enum Response {
    /// Concrete flow format
    FlowFormat(Packet),
    /// Buffer allocator
    BufMgr(BufMgr),
    /// Packet factory
    PacketMgr(PacketMgr),
    /// Clock
    Clock(Arc<dyn Clock>),
    /// Event loop
    EvLoop(EvLoop),
    /// Opaque source factory
    SourceMgr(Rc<dyn Any>),
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// A provider request travelling through the graph
///
/// Registered on a pipe's output, forwarded downstream until somebody
/// answers or throws it up a probe chain where a provider probe lives. The
/// reply callback runs on the loop of whoever fulfills it; requesters that
/// cancelled simply ignore the late reply.
#[derive(Clone)]
pub struct Request {
    id: RequestId,
    kind: RequestKind,
    template: Rc<Packet>,
    reply: Rc<dyn Fn(Response)>,
}

impl Request {
    /// Create a request; `template` carries the preferred flow format
    pub fn new(kind: RequestKind, template: Packet, reply: impl Fn(Response) + 'static) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            template: Rc::new(template),
            reply: Rc::new(reply),
        }
    }

    /// Unique id, used for cancellation
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// What is being asked for
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// The preferred flow format
    pub fn template(&self) -> &Packet {
        &self.template
    }

    /// Answer the request
    pub fn fulfill(&self, response: Response) {
        (self.reply)(response);
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Typed control commands understood by pipes
///
/// Handling is optional everywhere: a pipe answers `Unhandled` for
/// commands outside its concern and callers tolerate it.
pub enum Command<'a> {
    /// Late-bind a packet factory
    AttachPacketMgr(PacketMgr),
    /// Late-bind a buffer allocator
    AttachBufMgr(BufMgr),
    /// Late-bind the event loop to install pumps on
    AttachEvLoop(EvLoop),
    /// Late-bind a clock
    AttachClock(Arc<dyn Clock>),
    /// Declare the shape of upcoming input; the pipe validates and may
    /// refuse with `Invalid`
    SetFlowDef(Packet),
    /// Read back the input flow definition
    GetFlowDef(&'a mut Option<Packet>),
    /// Link the downstream pipe
    SetOutput(PipeHandle),
    /// Read back the downstream pipe
    GetOutput(&'a mut Option<PipeHandle>),
    /// Register a provider request on this pipe
    RegisterRequest(Request),
    /// Cancel a previously registered request
    UnregisterRequest(RequestId),
    /// Point a source/sink at a resource
    SetUri(&'a str),
    /// Module-defined key/value tuning
    SetOption(&'a str, &'a str),
    /// Collect the sub-pipes of a super-pipe
    IterateSub(&'a mut Vec<PipeHandle>),
    /// Module-specific command; unknown payloads answer `Unhandled`
    Extension(&'a mut dyn Any),
}

impl std::fmt::Debug for Command<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::AttachPacketMgr(_) => "AttachPacketMgr",
            Command::AttachBufMgr(_) => "AttachBufMgr",
            Command::AttachEvLoop(_) => "AttachEvLoop",
            Command::AttachClock(_) => "AttachClock",
            Command::SetFlowDef(_) => "SetFlowDef",
            Command::GetFlowDef(_) => "GetFlowDef",
            Command::SetOutput(_) => "SetOutput",
            Command::GetOutput(_) => "GetOutput",
            Command::RegisterRequest(_) => "RegisterRequest",
            Command::UnregisterRequest(_) => "UnregisterRequest",
            Command::SetUri(_) => "SetUri",
            Command::SetOption(..) => "SetOption",
            Command::IterateSub(_) => "IterateSub",
            Command::Extension(_) => "Extension",
        };
        f.write_str(name)
    }
}

/// Per-call context handed to a pipe's entry points
pub struct PipeCtx {
    /// The pipe's probe chain
    pub probe: ProbeChain,
    /// Pump that produced the current input, for back-pressure blockers
    pub producer: Option<PumpToken>,
}

impl PipeCtx {
    /// Throw an event up the probe chain
    pub fn throw(&self, event: &mut Event<'_>) -> Result<()> {
        self.probe.throw(event)
    }

    /// Throw a fatal error event; informational, the pipe stays alive
    pub fn throw_fatal(&self, error: Error) {
        let _ = self.probe.throw(&mut Event::Fatal(error));
    }

    /// Throw a recoverable error event
    pub fn throw_error(&self, error: Error) {
        let _ = self.probe.throw(&mut Event::ErrorEvent(error));
    }

    /// Log at verbose level
    pub fn verbose(&self, msg: impl Into<String>) {
        self.probe.log(LogLevel::Verbose, msg);
    }

    /// Log at debug level
    pub fn debug(&self, msg: impl Into<String>) {
        self.probe.log(LogLevel::Debug, msg);
    }

    /// Log at notice level
    pub fn notice(&self, msg: impl Into<String>) {
        self.probe.log(LogLevel::Notice, msg);
    }

    /// Log at warning level
    pub fn warn(&self, msg: impl Into<String>) {
        self.probe.log(LogLevel::Warn, msg);
    }

    /// Log at error level
    pub fn error(&self, msg: impl Into<String>) {
        self.probe.log(LogLevel::Error, msg);
    }
}

/// A processing stage
pub trait Pipe: 'static {
    /// Consume one packet: forward it, hold it, or drop it
    fn input(&mut self, ctx: &mut PipeCtx, pkt: Packet);

    /// Handle a control command; `Unhandled` is a normal outcome
    fn control(&mut self, ctx: &mut PipeCtx, cmd: Command<'_>) -> Result<()>;
}

struct PipeCell {
    state: RefCell<Box<dyn Pipe>>,
    probe: ProbeChain,
}

impl Drop for PipeCell {
    fn drop(&mut self) {
        let _ = self.probe.throw(&mut Event::Dead);
    }
}

/// Shared handle to a mounted pipe
///
/// Cloning shares the pipe; the pipe dies (throwing `Dead`) when the last
/// handle is dropped. Handles are loop-confined and not `Send`; crossing
/// threads goes through the transfer module.
#[derive(Clone)]
pub struct PipeHandle(Rc<PipeCell>);

/// Non-owning handle, used by sub-pipes pointing back at their super-pipe
#[derive(Clone, Default)]
pub struct WeakPipeHandle(Weak<PipeCell>);

impl PipeHandle {
    /// Mount a pipe with its probe chain; throws `Ready`
    pub fn mount(pipe: impl Pipe + 'static, probe: ProbeChain) -> Self {
        let handle = Self(Rc::new(PipeCell {
            state: RefCell::new(Box::new(pipe)),
            probe,
        }));
        let _ = handle.0.probe.throw(&mut Event::Ready);
        handle
    }

    fn ctx(&self, producer: Option<PumpToken>) -> PipeCtx {
        PipeCtx {
            probe: self.0.probe.clone(),
            producer,
        }
    }

    /// Push a packet into the pipe, consuming it
    pub fn input(&self, pkt: Packet) {
        self.input_from(pkt, None);
    }

    /// Push a packet, naming the producing pump for back-pressure
    pub fn input_from(&self, pkt: Packet, producer: Option<PumpToken>) {
        let mut ctx = self.ctx(producer);
        self.0.state.borrow_mut().input(&mut ctx, pkt);
    }

    /// Send a control command
    pub fn control(&self, cmd: Command<'_>) -> Result<()> {
        let mut ctx = self.ctx(None);
        self.0.state.borrow_mut().control(&mut ctx, cmd)
    }

    /// Send a module-specific extension command
    pub fn control_ext<T: Any>(&self, ext: &mut T) -> Result<()> {
        self.control(Command::Extension(ext))
    }

    /// Declare the input flow definition
    pub fn set_flow_def(&self, def: Packet) -> Result<()> {
        self.control(Command::SetFlowDef(def))
    }

    /// Read back the input flow definition
    pub fn flow_def(&self) -> Result<Option<Packet>> {
        let mut slot = None;
        self.control(Command::GetFlowDef(&mut slot))?;
        Ok(slot)
    }

    /// Link the downstream pipe
    pub fn set_output(&self, output: &PipeHandle) -> Result<()> {
        self.control(Command::SetOutput(output.clone()))
    }

    /// Read back the downstream pipe
    pub fn output(&self) -> Result<Option<PipeHandle>> {
        let mut slot = None;
        self.control(Command::GetOutput(&mut slot))?;
        Ok(slot)
    }

    /// Register a provider request
    pub fn register_request(&self, request: Request) -> Result<()> {
        self.control(Command::RegisterRequest(request))
    }

    /// Cancel a provider request
    pub fn unregister_request(&self, id: RequestId) -> Result<()> {
        self.control(Command::UnregisterRequest(id))
    }

    /// The probe chain attached at mount
    pub fn probe(&self) -> &ProbeChain {
        &self.0.probe
    }

    /// Non-owning handle
    pub fn downgrade(&self) -> WeakPipeHandle {
        WeakPipeHandle(Rc::downgrade(&self.0))
    }

    /// Whether two handles refer to the same pipe
    pub fn same(&self, other: &PipeHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl WeakPipeHandle {
    /// Upgrade if the pipe is still alive
    pub fn upgrade(&self) -> Option<PipeHandle> {
        self.0.upgrade().map(PipeHandle)
    }
}

impl std::fmt::Debug for PipeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeHandle")
            .field("handles", &Rc::strong_count(&self.0))
            .finish()
    }
}
