//! Terminal Log Probe
//!
//! Consumes log records below a configured level and forwards the rest to
//! `tracing`, joining the prefix chain into a single target-like label.
//! Install it at the top of a probe chain; everything else passes through.

use tracing::{debug, error, info, trace, warn};

use crate::error::Result;

use super::{Event, LogLevel, Probe, ProbeVerdict};

/// Formats log records into `tracing` events
pub struct LogProbe {
    min_level: LogLevel,
}

impl LogProbe {
    /// Create a logger dropping records below `min_level`
    pub fn new(min_level: LogLevel) -> Self {
        Self { min_level }
    }
}

impl Probe for LogProbe {
    fn catch(&self, event: &mut Event<'_>) -> Result<ProbeVerdict> {
        let Event::Log(msg) = event else {
            return Ok(ProbeVerdict::Pass);
        };
        if msg.level < self.min_level {
            return Ok(ProbeVerdict::Handled);
        }
        // Prefixes are pushed innermost first; print outermost first.
        let path = msg
            .prefixes
            .iter()
            .rev()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        match msg.level {
            LogLevel::Verbose => trace!(pipe = %path, "{}", msg.message),
            LogLevel::Debug => debug!(pipe = %path, "{}", msg.message),
            LogLevel::Notice => info!(pipe = %path, "{}", msg.message),
            LogLevel::Warn => warn!(pipe = %path, "{}", msg.message),
            LogLevel::Error => error!(pipe = %path, "{}", msg.message),
        }
        Ok(ProbeVerdict::Handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeChain;

    #[test]
    fn consumes_log_records() {
        let chain = ProbeChain::null().push(LogProbe::new(LogLevel::Debug));
        // Swallowed either way: filtered or emitted.
        chain.log(LogLevel::Verbose, "dropped");
        chain.log(LogLevel::Warn, "emitted");
        // Non-log events still fall through.
        assert!(chain.throw(&mut Event::Ready).is_err());
    }
}
