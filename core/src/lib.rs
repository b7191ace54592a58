//! Microseg core
//!
//! Shared data model for the microsegmentation controller and its monitors:
//! policy decisions, flow telemetry, connection tracking state, and the
//! processing-unit (PU) identity types. The traits defined here are the
//! narrow seams between the datapath, the lifecycle monitors, and the
//! external collaborators (policy engine, telemetry collector).

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod collector;
pub mod connection;
pub mod policy;
pub mod pu;

pub use self::{
    collector::{
        Collector, ContainerRecord, DropReason, Endpoint, EndpointKind, FlowRecord, LogCollector,
        ObservedPolicy,
    },
    connection::{Connection, FlowTuple, ReportedOutcome},
    policy::{Action, FlowPolicy, ObserveAction, PolicyEngine},
    pu::{Event, PuContext, PuHandler, PuRuntime, PuType, TagSet},
};
