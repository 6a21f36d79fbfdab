//! Probes
//!
//! Control flows down the pipeline; events flow up. Every pipe carries a
//! probe chain attached at allocation, and throws events at it: lifecycle
//! notices, data-plane needs, timing information and log records. Each
//! handler either consumes the event, passes it to the next node, or
//! reports an error back to the thrower.
//!
//! Decorators wrap an existing chain: [`PrefixProbe`] labels log records,
//! [`LogProbe`] terminates them into `tracing`, [`SelflowProbe`] filters
//! flow announcements, [`DejitterProbe`] smooths clock references, and
//! [`MemProviderProbe`] answers allocator requests.

mod dejitter;
mod log;
mod prefix;
mod provide;
mod selflow;

pub use dejitter::DejitterProbe;
pub use log::LogProbe;
pub use prefix::PrefixProbe;
pub use provide::MemProviderProbe;
pub use selflow::SelflowProbe;

use std::rc::Rc;

use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::pipe::Request;

/// Severity of a log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Per-packet chatter
    Verbose,
    /// Developer detail
    Debug,
    /// Normal operational notices
    Notice,
    /// Something is off but the pipeline continues
    Warn,
    /// An operation failed
    Error,
}

/// A structured log record travelling up the probe chain
#[derive(Debug)]
pub struct LogMsg {
    /// Severity
    pub level: LogLevel,
    /// Labels pushed by [`PrefixProbe`] nodes, innermost first
    pub prefixes: Vec<String>,
    /// Already-formatted message
    pub message: String,
}

/// Encapsulator timing state, reported after every state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncapsStatus {
    /// Earliest system time the pipe wants to inject a packet
    pub cr_sys: u64,
    /// Latest system time before the decoder buffer underruns
    pub dts_sys: u64,
    /// Next PCR deadline, `u64::MAX` when not a PCR PID
    pub pcr_sys: u64,
    /// Whether a full TS packet is ready for splice
    pub ready: bool,
}

/// An event thrown at a probe chain
#[derive(Debug)]
pub enum Event<'a> {
    /// The pipe finished initializing
    Ready,
    /// The pipe is being destroyed
    Dead,
    /// An unrecoverable error; informational, nothing is auto-destroyed
    Fatal(Error),
    /// A recoverable error
    ErrorEvent(Error),
    /// A source reached the end of its input
    SourceEnd,
    /// A sink cannot accept more data
    SinkEnd,
    /// The pipe needs an output; carries the flow definition it will send
    /// and a slot a handler can fill with the pipe to attach
    NeedOutput {
        /// Flow definition of the data about to flow
        flow_def: &'a Packet,
        /// Filled by a handler that knows where the data should go
        output: &'a mut Option<crate::pipe::PipeHandle>,
    },
    /// A new flow definition was set on the pipe
    NewFlowDef(&'a Packet),
    /// A negotiated flow format was decided
    NewFlowFormat(&'a Packet),
    /// A request could not be fulfilled downstream and bubbles up
    ProvideRequest(&'a Request),
    /// A clock reference was acquired (program time against system time)
    ClockRef {
        /// System time of the observation
        systime: u64,
        /// Program clock value observed
        prog: u64,
        /// Whether the reference follows a discontinuity
        discontinuity: bool,
    },
    /// A packet needs its system dates derived from program dates
    ClockTs(&'a mut Packet),
    /// The set of flows of a split pipe changed
    SplitUpdate,
    /// A log record
    Log(&'a mut LogMsg),
    /// Encapsulator timing report
    TsStatus(EncapsStatus),
    /// Continuity counter after the packet just emitted
    LastCc(u8),
}

/// What a probe handler did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// Event consumed; stop walking the chain
    Handled,
    /// Not interesting; try the next node
    Pass,
}

/// An event handler in a probe chain
pub trait Probe {
    /// Inspect an event
    fn catch(&self, event: &mut Event<'_>) -> Result<ProbeVerdict>;
}

struct ProbeNode {
    handler: Box<dyn Probe>,
    next: ProbeChain,
}

/// A chain of probe handlers, cheap to clone and share between pipes
///
/// The chain is immutable once built; pushing returns a new head.
#[derive(Clone, Default)]
pub struct ProbeChain(Option<Rc<ProbeNode>>);

impl ProbeChain {
    /// The empty chain; every event falls off the end
    pub fn null() -> Self {
        Self(None)
    }

    /// Prepend a handler, returning the new head
    pub fn push(self, handler: impl Probe + 'static) -> Self {
        Self(Some(Rc::new(ProbeNode {
            handler: Box::new(handler),
            next: self,
        })))
    }

    /// Throw an event at the chain
    ///
    /// Walks head to tail until a handler consumes it. `Err(Unhandled)`
    /// means the event fell off the end, which is a normal outcome for
    /// informational events.
    pub fn throw(&self, event: &mut Event<'_>) -> Result<()> {
        let mut node = &self.0;
        while let Some(n) = node {
            match n.handler.catch(event)? {
                ProbeVerdict::Handled => return Ok(()),
                ProbeVerdict::Pass => node = &n.next.0,
            }
        }
        Err(Error::Unhandled)
    }

    /// Throw a log record; falling off the end is fine
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let mut msg = LogMsg {
            level,
            prefixes: Vec::new(),
            message: message.into(),
        };
        let _ = self.throw(&mut Event::Log(&mut msg));
    }
}

impl std::fmt::Debug for ProbeChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut len = 0;
        let mut node = &self.0;
        while let Some(n) = node {
            len += 1;
            node = &n.next.0;
        }
        f.debug_struct("ProbeChain").field("handlers", &len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountProbe {
        hits: Rc<Cell<u32>>,
        verdict: ProbeVerdict,
    }

    impl Probe for CountProbe {
        fn catch(&self, _event: &mut Event<'_>) -> Result<ProbeVerdict> {
            self.hits.set(self.hits.get() + 1);
            Ok(self.verdict)
        }
    }

    #[test]
    fn chain_stops_at_handled() {
        let outer_hits = Rc::new(Cell::new(0));
        let inner_hits = Rc::new(Cell::new(0));
        let chain = ProbeChain::null()
            .push(CountProbe {
                hits: outer_hits.clone(),
                verdict: ProbeVerdict::Handled,
            })
            .push(CountProbe {
                hits: inner_hits.clone(),
                verdict: ProbeVerdict::Pass,
            });
        chain.throw(&mut Event::Ready).unwrap();
        assert_eq!(inner_hits.get(), 1);
        assert_eq!(outer_hits.get(), 1);
    }

    #[test]
    fn empty_chain_is_unhandled() {
        let chain = ProbeChain::null();
        assert_eq!(chain.throw(&mut Event::Ready).unwrap_err(), Error::Unhandled);
    }

    #[test]
    fn error_propagates_to_thrower() {
        struct FailProbe;
        impl Probe for FailProbe {
            fn catch(&self, _event: &mut Event<'_>) -> Result<ProbeVerdict> {
                Err(Error::External)
            }
        }
        let chain = ProbeChain::null().push(FailProbe);
        assert_eq!(chain.throw(&mut Event::Ready).unwrap_err(), Error::External);
    }
}
