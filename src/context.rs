use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Last request sent to one bus address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentRequest {
    pub service: u8,
    pub sent_at: Instant,
}

/// Per-address memory of the most recently transmitted request.
///
/// Responses carry the RTN status in the CID2 slot, so a successful response
/// does not name the service it answers; the decoder resolves it through
/// this map instead. Entries are created lazily, overwritten on every
/// transmission and never removed — the map is bounded by the number of bus
/// addresses.
///
/// There is exactly one writer (the request/response driver) and one reader
/// (the decoder); the struct is not meant to be shared between pollers.
#[derive(Debug, Default)]
pub struct RequestContext {
    entries: HashMap<u8, SentRequest>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a transmission, replacing whatever was remembered for the
    /// address.
    pub fn record_sent(&mut self, address: u8, service: u8, now: Instant) {
        log::trace!("record request 0x{service:02X} for address 0x{address:02X}");
        self.entries.insert(
            address,
            SentRequest {
                service,
                sent_at: now,
            },
        );
    }

    /// Service id of the last request sent to `address`, if any.
    pub fn resolve_hint(&self, address: u8) -> Option<u8> {
        self.entries.get(&address).map(|e| e.service)
    }

    /// Age of the remembered request. Staleness policy belongs to the
    /// caller: the core only reports the duration, it never expires entries
    /// itself.
    pub fn age(&self, address: u8, now: Instant) -> Option<Duration> {
        self.entries
            .get(&address)
            .map(|e| now.saturating_duration_since(e.sent_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_tracks_last_sent_service() {
        let mut ctx = RequestContext::new();
        assert_eq!(ctx.resolve_hint(0x01), None);

        let t0 = Instant::now();
        ctx.record_sent(0x01, 0x42, t0);
        assert_eq!(ctx.resolve_hint(0x01), Some(0x42));
        assert_eq!(ctx.resolve_hint(0x02), None);

        ctx.record_sent(0x01, 0x47, t0);
        assert_eq!(ctx.resolve_hint(0x01), Some(0x47));
    }

    #[test]
    fn addresses_are_independent() {
        let mut ctx = RequestContext::new();
        let t0 = Instant::now();
        ctx.record_sent(0x01, 0x42, t0);
        ctx.record_sent(0x02, 0x44, t0);
        assert_eq!(ctx.resolve_hint(0x01), Some(0x42));
        assert_eq!(ctx.resolve_hint(0x02), Some(0x44));
    }

    #[test]
    fn age_reports_elapsed_time() {
        let mut ctx = RequestContext::new();
        let t0 = Instant::now();
        ctx.record_sent(0x01, 0x42, t0);
        let later = t0 + Duration::from_millis(750);
        assert_eq!(ctx.age(0x01, later), Some(Duration::from_millis(750)));
        assert_eq!(ctx.age(0x02, later), None);
    }
}
