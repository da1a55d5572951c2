//! Rejection warning de-duplication.

use std::net::IpAddr;

use parking_lot::Mutex;

/// Remembers the last address a rejection warning was produced for.
///
/// A single slot shared by all connections. Racing rejections may lose or
/// duplicate a log line; nothing else depends on this state.
#[derive(Debug, Default)]
pub struct RejectionWarnings {
    last: Mutex<Option<IpAddr>>,
}

impl RejectionWarnings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Warning text for a rejected source, or `None` if the previous warning
    /// was for the same address.
    pub fn warning_for(&self, addr: IpAddr) -> Option<String> {
        let addr = addr.to_canonical();
        {
            let mut last = self.last.lock();
            if *last == Some(addr) {
                return None;
            }
            *last = Some(addr);
        }
        Some(format!(
            "Proxied connection from {} is not in the proxy whitelist",
            addr
        ))
    }
}
