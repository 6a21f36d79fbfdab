//! Prefix Probe
//!
//! Labels log records with the name of the pipe section below it, so the
//! terminal logger can print the chain of pipes a record travelled
//! through.

use crate::error::Result;

use super::{Event, Probe, ProbeVerdict};

/// Prepends a label to log records and passes everything through
pub struct PrefixProbe {
    name: String,
}

impl PrefixProbe {
    /// Create a prefix node with the given label
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Probe for PrefixProbe {
    fn catch(&self, event: &mut Event<'_>) -> Result<ProbeVerdict> {
        if let Event::Log(msg) = event {
            msg.prefixes.push(self.name.clone());
        }
        Ok(ProbeVerdict::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{LogLevel, LogMsg, ProbeChain};

    #[test]
    fn prefixes_stack_inner_first() {
        let chain = ProbeChain::null()
            .push(PrefixProbe::new("outer"))
            .push(PrefixProbe::new("inner"));
        let mut msg = LogMsg {
            level: LogLevel::Debug,
            prefixes: Vec::new(),
            message: "hello".into(),
        };
        // Falls off the end once both prefixes are applied.
        let _ = chain.throw(&mut Event::Log(&mut msg));
        assert_eq!(msg.prefixes, vec!["inner".to_owned(), "outer".to_owned()]);
    }
}
