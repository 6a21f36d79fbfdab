//! Pipe Helpers
//!
//! The recurring state machines most pipes embed: output linkage with flow
//! definition re-emission and request forwarding ([`OutputHelper`]), a
//! bounded hold queue with producer blockers ([`InputQueue`]), and the
//! sibling list of a super-pipe's children ([`SubList`]).

use std::collections::VecDeque;

use crate::error::Error;
use crate::evloop::PumpToken;
use crate::packet::Packet;
use crate::probe::Event;

use super::{Command, PipeCtx, PipeHandle, Request, RequestId, WeakPipeHandle};

/// Output linkage of a pipe
///
/// Stores the downstream pipe, the output flow definition, and the
/// provider requests registered through this pipe. Setting a new output
/// re-emits the flow definition and re-registers the requests there.
#[derive(Default)]
pub struct OutputHelper {
    output: Option<PipeHandle>,
    flow_def: Option<Packet>,
    flow_def_sent: bool,
    requests: Vec<Request>,
}

impl OutputHelper {
    /// Fresh helper with nothing attached
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the flow definition describing upcoming output
    ///
    /// It is (re-)announced downstream before the next packet.
    pub fn store_flow_def(&mut self, def: Packet) {
        self.flow_def = Some(def);
        self.flow_def_sent = false;
    }

    /// The stored output flow definition
    pub fn flow_def(&self) -> Option<&Packet> {
        self.flow_def.as_ref()
    }

    /// The downstream pipe
    pub fn output(&self) -> Option<&PipeHandle> {
        self.output.as_ref()
    }

    /// Attach the downstream pipe, re-registering pending requests on it
    pub fn set_output(&mut self, ctx: &PipeCtx, output: PipeHandle) {
        if let Some(old) = &self.output {
            for req in &self.requests {
                let _ = old.unregister_request(req.id());
            }
        }
        for req in &self.requests {
            // Nobody may answer; the request then stays pending here.
            let _ = forward_request(ctx, Some(&output), req);
        }
        self.output = Some(output);
        self.flow_def_sent = false;
    }

    /// Push a packet downstream
    ///
    /// Announces the flow definition first when needed. Without an output,
    /// throws `NeedOutput` and installs whatever the probes supply; if the
    /// pipe is still dangling the packet is dropped with a warning.
    pub fn output_packet(&mut self, ctx: &PipeCtx, pkt: Packet) {
        if self.output.is_none() {
            if let Some(def) = &self.flow_def {
                let mut slot = None;
                let _ = ctx.throw(&mut Event::NeedOutput {
                    flow_def: def,
                    output: &mut slot,
                });
                if let Some(output) = slot {
                    self.set_output(ctx, output);
                }
            }
        }
        let Some(output) = &self.output else {
            ctx.warn("dropping packet: no output attached");
            return;
        };
        if !self.flow_def_sent {
            match &self.flow_def {
                Some(def) => {
                    if let Err(err) = output.set_flow_def(def.dup()) {
                        ctx.warn(format!("output refused flow definition: {err}"));
                        return;
                    }
                    self.flow_def_sent = true;
                }
                None => {
                    ctx.warn("dropping packet: no flow definition");
                    return;
                }
            }
        }
        output.input(pkt);
    }

    /// Register a request, forwarding downstream or up the probe chain
    pub fn register_request(&mut self, ctx: &PipeCtx, request: Request) {
        let _ = forward_request(ctx, self.output.as_ref(), &request);
        self.requests.push(request);
    }

    /// Cancel a request everywhere it might be pending
    pub fn unregister_request(&mut self, _ctx: &PipeCtx, id: RequestId) {
        self.requests.retain(|r| r.id() != id);
        if let Some(output) = &self.output {
            let _ = output.unregister_request(id);
        }
    }
}

/// Try downstream first, then the probe chain
fn forward_request(
    ctx: &PipeCtx,
    output: Option<&PipeHandle>,
    request: &Request,
) -> crate::error::Result<()> {
    if let Some(output) = output {
        match output.control(Command::RegisterRequest(request.clone())) {
            Err(Error::Unhandled) => {}
            other => return other,
        }
    }
    ctx.throw(&mut Event::ProvideRequest(request))
}

/// Bounded hold queue with producer back-pressure
///
/// When a pipe cannot process its input right away (a sink hit `EAGAIN`,
/// an encapsulator waits for the mux), packets are held here. Crossing the
/// high-water mark blocks the producing pump; draining lifts the blocks.
pub struct InputQueue {
    pending: VecDeque<Packet>,
    max: usize,
    blockers: Vec<PumpToken>,
}

impl InputQueue {
    /// Queue blocking producers beyond `max` held packets
    pub fn new(max: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            max: max.max(1),
            blockers: Vec::new(),
        }
    }

    /// Number of held packets
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is held
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Hold a packet; blocks the producer when over the high-water mark
    pub fn hold(&mut self, ctx: &PipeCtx, pkt: Packet) {
        self.pending.push_back(pkt);
        if self.pending.len() >= self.max {
            if let Some(producer) = &ctx.producer {
                producer.block();
                self.blockers.push(producer.clone());
            }
        }
    }

    /// Take the oldest held packet; unblocks producers when drained
    pub fn pop(&mut self) -> Option<Packet> {
        let pkt = self.pending.pop_front();
        if self.pending.is_empty() {
            self.unblock_all();
        }
        pkt
    }

    /// Peek at the oldest held packet
    pub fn front(&self) -> Option<&Packet> {
        self.pending.front()
    }

    /// Iterate held packets oldest first
    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.pending.iter()
    }

    /// Drop everything held and lift all blocks
    pub fn flush(&mut self) {
        self.pending.clear();
        self.unblock_all();
    }

    fn unblock_all(&mut self) {
        for blocker in self.blockers.drain(..) {
            blocker.unblock();
        }
    }
}

impl Drop for InputQueue {
    fn drop(&mut self) {
        self.unblock_all();
    }
}

/// Sibling list of a super-pipe's children
///
/// Children are held weakly: a sub-pipe dies when its last outside handle
/// drops, and the list forgets it on the next walk.
#[derive(Default)]
pub struct SubList {
    subs: Vec<WeakPipeHandle>,
}

impl SubList {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a child
    pub fn add(&mut self, sub: &PipeHandle) {
        self.subs.push(sub.downgrade());
    }

    /// Live children, pruning the dead
    pub fn iter(&mut self) -> Vec<PipeHandle> {
        self.subs.retain(|w| w.upgrade().is_some());
        self.subs.iter().filter_map(WeakPipeHandle::upgrade).collect()
    }

    /// Number of live children
    pub fn len(&mut self) -> usize {
        self.subs.retain(|w| w.upgrade().is_some());
        self.subs.len()
    }

    /// Whether no child is alive
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }
}
