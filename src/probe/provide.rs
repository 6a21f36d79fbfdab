//! Provider Probe
//!
//! Sits near the top of an application's probe chain and answers the
//! requests that bubbled all the way up without finding a provider: buffer
//! allocators synthesized from the request's flow-format template, packet
//! factories, and clocks.

use std::sync::Arc;

use crate::buf::{BufMgr, PicFormat};
use crate::clock::Clock;
use crate::error::Result;
use crate::mem::MemAlloc;
use crate::packet::PacketMgr;
use crate::pipe::{Request, RequestKind, Response};

use super::{Event, Probe, ProbeVerdict};

/// Answers provider requests from a memory backing
pub struct MemProviderProbe {
    mem: Arc<dyn MemAlloc>,
    packet_mgr: PacketMgr,
    clock: Option<Arc<dyn Clock>>,
}

impl MemProviderProbe {
    /// Provider over the given memory backing
    pub fn new(mem: Arc<dyn MemAlloc>, packet_mgr: PacketMgr) -> Self {
        Self {
            mem,
            packet_mgr,
            clock: None,
        }
    }

    /// Also answer clock requests
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Synthesize a buffer manager matching a flow-format template
    fn synthesize(&self, request: &Request) -> Option<BufMgr> {
        let template = request.template();
        if template.flow_def_matches("block.") {
            return Some(BufMgr::block(Arc::clone(&self.mem)));
        }
        if template.flow_def_matches("pic.") {
            let format = match template.attrs.string("p.format").ok().flatten().as_deref() {
                Some("rgba") => PicFormat::rgba(),
                _ => PicFormat::yuv420p(),
            };
            // Honor the requested alignment when present.
            let align = template
                .attrs
                .unsigned("p.align")
                .ok()
                .flatten()
                .unwrap_or(16) as usize;
            return Some(BufMgr::pic(Arc::clone(&self.mem), Arc::new(format), align));
        }
        if template.flow_def_matches("sound.") {
            let channels = template
                .attrs
                .small_unsigned("s.channels")
                .ok()
                .flatten()
                .unwrap_or(2) as usize;
            let sample_size = template
                .attrs
                .small_unsigned("s.samplesize")
                .ok()
                .flatten()
                .unwrap_or(2) as usize;
            return Some(BufMgr::sound(
                Arc::clone(&self.mem),
                vec!["all"],
                channels * sample_size,
            ));
        }
        None
    }
}

impl Probe for MemProviderProbe {
    fn catch(&self, event: &mut Event<'_>) -> Result<ProbeVerdict> {
        let Event::ProvideRequest(request) = event else {
            return Ok(ProbeVerdict::Pass);
        };
        match request.kind() {
            RequestKind::BufMgr => match self.synthesize(request) {
                Some(mgr) => {
                    request.fulfill(Response::BufMgr(mgr));
                    Ok(ProbeVerdict::Handled)
                }
                None => Ok(ProbeVerdict::Pass),
            },
            RequestKind::FlowFormat => {
                // The template already is an acceptable format.
                request.fulfill(Response::FlowFormat(request.template().dup()));
                Ok(ProbeVerdict::Handled)
            }
            RequestKind::PacketMgr => {
                request.fulfill(Response::PacketMgr(self.packet_mgr.clone()));
                Ok(ProbeVerdict::Handled)
            }
            RequestKind::Clock => match &self.clock {
                Some(clock) => {
                    request.fulfill(Response::Clock(Arc::clone(clock)));
                    Ok(ProbeVerdict::Handled)
                }
                None => Ok(ProbeVerdict::Pass),
            },
            _ => Ok(ProbeVerdict::Pass),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow;
    use crate::mem::HeapAlloc;
    use crate::probe::ProbeChain;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn provider() -> ProbeChain {
        ProbeChain::null().push(MemProviderProbe::new(
            Arc::new(HeapAlloc),
            PacketMgr::new(4),
        ))
    }

    #[test]
    fn provides_block_mgr_from_template() {
        let chain = provider();
        let mgr = PacketMgr::new(1);
        let got: Rc<RefCell<Option<BufMgr>>> = Rc::new(RefCell::new(None));
        let got2 = Rc::clone(&got);
        let request = Request::new(
            RequestKind::BufMgr,
            flow::alloc_def(&mgr, "block.mpegts.").unwrap(),
            move |resp| {
                if let Response::BufMgr(mgr) = resp {
                    *got2.borrow_mut() = Some(mgr);
                }
            },
        );
        chain.throw(&mut Event::ProvideRequest(&request)).unwrap();
        let mgr = got.borrow_mut().take().unwrap();
        assert_eq!(mgr.alloc_block(188).unwrap().size(), 188);
    }

    #[test]
    fn provides_pic_mgr_with_alignment() {
        let chain = provider();
        let mgr = PacketMgr::new(1);
        let mut template = flow::alloc_def(&mgr, "pic.").unwrap();
        template.attrs.set_unsigned("p.align", 32).unwrap();
        let got: Rc<RefCell<Option<BufMgr>>> = Rc::new(RefCell::new(None));
        let got2 = Rc::clone(&got);
        let request = Request::new(RequestKind::BufMgr, template, move |resp| {
            if let Response::BufMgr(mgr) = resp {
                *got2.borrow_mut() = Some(mgr);
            }
        });
        chain.throw(&mut Event::ProvideRequest(&request)).unwrap();
        let mgr = got.borrow_mut().take().unwrap();
        let pic = mgr.alloc_pic(64, 32).unwrap();
        let (_, stride) = pic.plane_read("y8").unwrap();
        assert_eq!(stride % 32, 0);
    }

    #[test]
    fn unknown_kinds_pass() {
        let chain = provider();
        let mgr = PacketMgr::new(1);
        let request = Request::new(
            RequestKind::SourceMgr,
            flow::alloc_def(&mgr, "void.").unwrap(),
            |_| {},
        );
        assert!(chain.throw(&mut Event::ProvideRequest(&request)).is_err());
    }
}
