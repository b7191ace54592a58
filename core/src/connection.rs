use serde::{Deserialize, Serialize};
use std::{
    net::IpAddr,
    sync::atomic::{AtomicU8, Ordering},
};

/// The 5-tuple identifying a tracked flow.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowTuple {
    pub source: IpAddr,
    pub source_port: u16,
    pub destination: IpAddr,
    pub destination_port: u16,

    /// IANA L4 protocol number.
    pub protocol: u8,
}

/// Connection outcomes that are reported at most once per connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReportedOutcome {
    Accepted = 0b01,
    Rejected = 0b10,
}

/// Tracked per-connection state shared between concurrent packet decisions.
///
/// The reported flags are sticky: once an outcome has been marked, it stays
/// marked for the lifetime of the connection. Marking is a single atomic
/// fetch-or, so two racing decision paths cannot both observe the
/// `unset -> set` transition for the same outcome.
#[derive(Debug)]
pub struct Connection {
    pub tuple: FlowTuple,
    reported: AtomicU8,
}

// === impl FlowTuple ===

impl FlowTuple {
    pub fn new(
        source: IpAddr,
        source_port: u16,
        destination: IpAddr,
        destination_port: u16,
        protocol: u8,
    ) -> Self {
        Self {
            source,
            source_port,
            destination,
            destination_port,
            protocol,
        }
    }

    /// The same flow as seen from the other direction.
    pub fn reversed(self) -> Self {
        Self {
            source: self.destination,
            source_port: self.destination_port,
            destination: self.source,
            destination_port: self.source_port,
            protocol: self.protocol,
        }
    }
}

// === impl Connection ===

impl Connection {
    pub fn new(tuple: FlowTuple) -> Self {
        Self {
            tuple,
            reported: AtomicU8::new(0),
        }
    }

    /// Marks an outcome as reported.
    ///
    /// Returns true iff this call performed the transition; callers that
    /// want at-most-once emission use the return value to suppress
    /// duplicates.
    pub fn mark_reported(&self, outcome: ReportedOutcome) -> bool {
        let bit = outcome as u8;
        self.reported.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    pub fn is_reported(&self, outcome: ReportedOutcome) -> bool {
        self.reported.load(Ordering::Acquire) & (outcome as u8) != 0
    }
}
