//! Flow Selection Probe
//!
//! Sits above a split pipe (demux, program splitter) and decides which
//! announced flows continue downstream. The selector is a comma-separated
//! list of flow ids (`"68,69"`), `name=value` attribute matches
//! (`"lang=eng"`), `"all"`, or `"auto"` which latches onto the first flow
//! seen.

use std::cell::RefCell;

use crate::error::Result;
use crate::packet::Packet;

use super::{Event, Probe, ProbeVerdict};

/// One term of a selector expression
enum Term {
    All,
    Auto,
    Id(u64),
    Attr { name: String, value: String },
}

/// Filters `NewFlowDef` announcements by a selector expression
pub struct SelflowProbe {
    terms: Vec<Term>,
    /// Flow id latched by an `auto` term
    latched: RefCell<Option<u64>>,
}

impl SelflowProbe {
    /// Parse a selector expression
    pub fn new(selector: &str) -> Self {
        let terms = selector
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| {
                if t == "all" {
                    Term::All
                } else if t == "auto" {
                    Term::Auto
                } else if let Some((name, value)) = t.split_once('=') {
                    Term::Attr {
                        name: name.to_owned(),
                        value: value.to_owned(),
                    }
                } else if let Ok(id) = t.parse() {
                    Term::Id(id)
                } else {
                    // An unparsable term selects nothing; keep it inert as
                    // an attribute match that cannot succeed.
                    Term::Attr {
                        name: String::new(),
                        value: t.to_owned(),
                    }
                }
            })
            .collect();
        Self {
            terms,
            latched: RefCell::new(None),
        }
    }

    /// Whether a flow definition passes the selector
    pub fn selects(&self, def: &Packet) -> bool {
        let id = def.attrs.unsigned("f.id").ok().flatten();
        for term in &self.terms {
            match term {
                Term::All => return true,
                Term::Auto => {
                    let mut latched = self.latched.borrow_mut();
                    match (*latched, id) {
                        (None, Some(id)) => {
                            *latched = Some(id);
                            return true;
                        }
                        (Some(want), Some(id)) if want == id => return true,
                        _ => {}
                    }
                }
                Term::Id(want) => {
                    if id == Some(*want) {
                        return true;
                    }
                }
                Term::Attr { name, value } => {
                    if !name.is_empty()
                        && def.attrs.string(name).ok().flatten().as_deref() == Some(value)
                    {
                        return true;
                    }
                }
            }
        }
        false
    }
}

impl Probe for SelflowProbe {
    fn catch(&self, event: &mut Event<'_>) -> Result<ProbeVerdict> {
        match event {
            Event::NewFlowDef(def) => {
                if self.selects(def) {
                    Ok(ProbeVerdict::Pass)
                } else {
                    // Swallow the announcement: the flow stays unattached.
                    Ok(ProbeVerdict::Handled)
                }
            }
            Event::SplitUpdate => Ok(ProbeVerdict::Pass),
            _ => Ok(ProbeVerdict::Pass),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketMgr;

    fn flow(id: u64, lang: Option<&str>) -> Packet {
        let mgr = PacketMgr::new(1);
        let mut def = mgr.alloc();
        def.attrs.set_string("f.def", "block.").unwrap();
        def.attrs.set_unsigned("f.id", id).unwrap();
        if let Some(lang) = lang {
            def.attrs.set_string("x.lang", lang).unwrap();
        }
        def
    }

    #[test]
    fn id_list() {
        let probe = SelflowProbe::new("68, 69");
        assert!(probe.selects(&flow(68, None)));
        assert!(probe.selects(&flow(69, None)));
        assert!(!probe.selects(&flow(70, None)));
    }

    #[test]
    fn auto_latches_first() {
        let probe = SelflowProbe::new("auto");
        assert!(probe.selects(&flow(7, None)));
        assert!(probe.selects(&flow(7, None)));
        assert!(!probe.selects(&flow(8, None)));
    }

    #[test]
    fn attribute_match() {
        let probe = SelflowProbe::new("x.lang=eng");
        assert!(probe.selects(&flow(1, Some("eng"))));
        assert!(!probe.selects(&flow(1, Some("fra"))));
    }

    #[test]
    fn all_matches_everything() {
        let probe = SelflowProbe::new("all");
        assert!(probe.selects(&flow(123, None)));
    }
}
