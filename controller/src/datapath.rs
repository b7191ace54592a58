//! Flow-policy reporting.
//!
//! Translates packet-level decisions into telemetry records. Construction
//! is total: once policy defaulting is applied there is no failure path,
//! and the collector owns delivery. The per-connection reported flags only
//! gate caller-side suppression; every invocation still constructs and
//! emits a record.

use chrono::Utc;
use microseg_core::{
    Collector, Connection, DropReason, Endpoint, EndpointKind, FlowPolicy, FlowRecord, FlowTuple,
    ObservedPolicy, PuContext, ReportedOutcome,
};
use std::sync::Arc;

pub struct FlowReporter {
    collector: Arc<dyn Collector>,
}

impl FlowReporter {
    pub fn new(collector: Arc<dyn Collector>) -> Self {
        Self { collector }
    }

    /// Reports a flow accepted by policy. Marks the connection
    /// accept-reported when one is given.
    pub fn report_accepted_flow(
        &self,
        flow: &FlowTuple,
        conn: Option<&Connection>,
        source_id: &str,
        dest_id: &str,
        context: &PuContext,
        report: &FlowPolicy,
        enforced: &FlowPolicy,
    ) {
        if let Some(conn) = conn {
            conn.mark_reported(ReportedOutcome::Accepted);
        }
        self.report_flow(flow, source_id, dest_id, context, None, report, enforced);
    }

    /// Reports a rejected flow.
    ///
    /// The connection is marked reject-reported only for policy drops;
    /// other rejection reasons (token, format) are reported but leave the
    /// policy-drop idempotency flag untouched. A missing report policy is
    /// synthesized as a default reject so a record can always be produced,
    /// and a missing enforced policy defaults to the report policy.
    pub fn report_rejected_flow(
        &self,
        flow: &FlowTuple,
        conn: Option<&Connection>,
        source_id: &str,
        dest_id: &str,
        context: &PuContext,
        reason: DropReason,
        report: Option<&FlowPolicy>,
        enforced: Option<&FlowPolicy>,
    ) {
        if let Some(conn) = conn {
            if reason == DropReason::PolicyDrop {
                conn.mark_reported(ReportedOutcome::Rejected);
            }
        }

        let synthesized;
        let report = match report {
            Some(report) => report,
            None => {
                synthesized = FlowPolicy::reject_default();
                &synthesized
            }
        };
        let enforced = enforced.unwrap_or(report);

        self.report_flow(
            flow,
            source_id,
            dest_id,
            context,
            Some(reason),
            report,
            enforced,
        );
    }

    /// Reports a flow whose far side is an external service rather than a
    /// known PU. `app` tells whether the PU initiated the flow: for
    /// application-initiated flows the PU is the source endpoint; for
    /// network-received flows the roles are swapped.
    pub fn report_external_service_flow(
        &self,
        context: &PuContext,
        report: &FlowPolicy,
        enforced: &FlowPolicy,
        app: bool,
        flow: &FlowTuple,
    ) {
        let src = (flow.source, flow.source_port);
        let dst = (flow.destination, flow.destination_port);
        self.report_external_common(context, report, enforced, app, flow.protocol, src, dst);
    }

    /// As [`report_external_service_flow`], for flows observed in the
    /// mirror of their logical direction (e.g. reply packets): the raw
    /// addresses swap sides before role labeling.
    ///
    /// [`report_external_service_flow`]: FlowReporter::report_external_service_flow
    pub fn report_reverse_external_service_flow(
        &self,
        context: &PuContext,
        report: &FlowPolicy,
        enforced: &FlowPolicy,
        app: bool,
        flow: &FlowTuple,
    ) {
        let src = (flow.destination, flow.destination_port);
        let dst = (flow.source, flow.source_port);
        self.report_external_common(context, report, enforced, app, flow.protocol, src, dst);
    }

    fn report_external_common(
        &self,
        context: &PuContext,
        report: &FlowPolicy,
        enforced: &FlowPolicy,
        app: bool,
        protocol: u8,
        (src_ip, src_port): (std::net::IpAddr, u16),
        (dst_ip, dst_port): (std::net::IpAddr, u16),
    ) {
        let (source, destination) = if app {
            (
                Endpoint {
                    kind: EndpointKind::Pu,
                    id: context.management_id.clone(),
                    ip: src_ip,
                    port: src_port,
                },
                Endpoint {
                    kind: EndpointKind::Address,
                    id: report.service_id.clone(),
                    ip: dst_ip,
                    port: dst_port,
                },
            )
        } else {
            (
                Endpoint {
                    kind: EndpointKind::Address,
                    id: report.service_id.clone(),
                    ip: src_ip,
                    port: src_port,
                },
                Endpoint {
                    kind: EndpointKind::Pu,
                    id: context.management_id.clone(),
                    ip: dst_ip,
                    port: dst_port,
                },
            )
        };

        let record = FlowRecord {
            context_id: context.context_id.clone(),
            source,
            destination,
            protocol,
            action: report.action,
            // External-service records always carry the policy drop-reason
            // slot, matching the established wire behavior for this record
            // kind regardless of action.
            drop_reason: Some(DropReason::PolicyDrop),
            policy_id: report.policy_id.clone(),
            tags: context.annotations.clone(),
            observed: mk_observed(report, enforced),
            timestamp: Utc::now(),
        };

        self.collector.collect_flow(record);
    }

    #[allow(clippy::too_many_arguments)]
    fn report_flow(
        &self,
        flow: &FlowTuple,
        source_id: &str,
        dest_id: &str,
        context: &PuContext,
        drop_reason: Option<DropReason>,
        report: &FlowPolicy,
        enforced: &FlowPolicy,
    ) {
        let record = FlowRecord {
            context_id: context.context_id.clone(),
            source: Endpoint {
                kind: EndpointKind::Pu,
                id: source_id.to_string(),
                ip: flow.source,
                port: flow.source_port,
            },
            destination: Endpoint {
                kind: EndpointKind::Pu,
                id: dest_id.to_string(),
                ip: flow.destination,
                port: flow.destination_port,
            },
            protocol: flow.protocol,
            action: report.action,
            drop_reason,
            policy_id: report.policy_id.clone(),
            tags: context.annotations.clone(),
            observed: mk_observed(report, enforced),
            timestamp: Utc::now(),
        };

        self.collector.collect_flow(record);
    }
}

/// The observed overlay is populated iff the report policy declares itself
/// observed; it carries the decision that was actually applied.
fn mk_observed(report: &FlowPolicy, enforced: &FlowPolicy) -> Option<ObservedPolicy> {
    report.observe_action.observed().then(|| ObservedPolicy {
        action: enforced.action,
        policy_id: enforced.policy_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use microseg_core::{Action, ContainerRecord, ObserveAction, PuType, TagSet};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        flows: Mutex<Vec<FlowRecord>>,
    }

    impl Collector for Recording {
        fn collect_flow(&self, record: FlowRecord) {
            self.flows.lock().push(record);
        }

        fn collect_container(&self, _: ContainerRecord) {}
    }

    fn mk_reporter() -> (Arc<Recording>, FlowReporter) {
        let collector = Arc::new(Recording::default());
        let reporter = FlowReporter::new(collector.clone());
        (collector, reporter)
    }

    fn mk_context() -> PuContext {
        PuContext {
            context_id: "ctx-0".to_string(),
            management_id: "mgmt-0".to_string(),
            pu_type: PuType::Kubernetes,
            annotations: TagSet::default(),
        }
    }

    fn mk_flow() -> FlowTuple {
        FlowTuple::new(
            "192.0.2.10".parse().unwrap(),
            34567,
            "192.0.2.20".parse().unwrap(),
            443,
            6,
        )
    }

    fn accept_policy(id: &str) -> FlowPolicy {
        FlowPolicy {
            action: Action::Accept,
            policy_id: id.to_string(),
            service_id: "svc-0".to_string(),
            observe_action: ObserveAction::NotObserved,
        }
    }

    #[test]
    fn policy_drop_marks_reject_reported_exactly_once() {
        let (collector, reporter) = mk_reporter();
        let ctx = mk_context();
        let flow = mk_flow();
        let conn = Connection::new(flow);

        assert!(!conn.is_reported(ReportedOutcome::Rejected));
        reporter.report_rejected_flow(
            &flow,
            Some(&conn),
            "src",
            "dst",
            &ctx,
            DropReason::PolicyDrop,
            None,
            None,
        );
        assert!(conn.is_reported(ReportedOutcome::Rejected));

        // A retransmitted packet takes the same path; the flag stays set
        // and the engine still constructs a record per call.
        reporter.report_rejected_flow(
            &flow,
            Some(&conn),
            "src",
            "dst",
            &ctx,
            DropReason::PolicyDrop,
            None,
            None,
        );
        assert!(conn.is_reported(ReportedOutcome::Rejected));
        assert_eq!(collector.flows.lock().len(), 2);
    }

    #[test]
    fn non_policy_rejections_do_not_mark_the_connection() {
        let (collector, reporter) = mk_reporter();
        let ctx = mk_context();
        let flow = mk_flow();
        let conn = Connection::new(flow);

        reporter.report_rejected_flow(
            &flow,
            Some(&conn),
            "src",
            "dst",
            &ctx,
            DropReason::InvalidToken,
            None,
            None,
        );
        assert!(!conn.is_reported(ReportedOutcome::Rejected));

        let flows = collector.flows.lock();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].drop_reason, Some(DropReason::InvalidToken));
    }

    #[test]
    fn reject_without_policy_synthesizes_default() {
        let (collector, reporter) = mk_reporter();
        let ctx = mk_context();
        let flow = mk_flow();

        reporter.report_rejected_flow(
            &flow,
            None,
            "src",
            "dst",
            &ctx,
            DropReason::PolicyDrop,
            None,
            None,
        );

        let flows = collector.flows.lock();
        assert_eq!(flows[0].action, Action::Reject);
        assert!(flows[0].policy_id.is_empty());
        // The enforced policy defaulted to the synthesized reject, which is
        // not observed, so no overlay appears.
        assert_eq!(flows[0].observed, None);
    }

    #[test]
    fn accepted_flow_marks_connection_and_has_no_drop_reason() {
        let (collector, reporter) = mk_reporter();
        let ctx = mk_context();
        let flow = mk_flow();
        let conn = Connection::new(flow);
        let policy = accept_policy("p-1");

        reporter.report_accepted_flow(&flow, Some(&conn), "src", "dst", &ctx, &policy, &policy);

        assert!(conn.is_reported(ReportedOutcome::Accepted));
        let flows = collector.flows.lock();
        assert_eq!(flows[0].action, Action::Accept);
        assert_eq!(flows[0].drop_reason, None);
        assert_eq!(flows[0].policy_id, "p-1");
        assert_eq!(flows[0].source.kind, EndpointKind::Pu);
        assert_eq!(flows[0].source.id, "src");
        assert_eq!(flows[0].destination.id, "dst");
    }

    #[test]
    fn observed_overlay_carries_the_enforced_decision() {
        let (collector, reporter) = mk_reporter();
        let ctx = mk_context();
        let flow = mk_flow();

        let mut report = accept_policy("observed-policy");
        report.observe_action = ObserveAction::ObserveApply;
        let enforced = FlowPolicy {
            action: Action::Reject,
            policy_id: "enforced-policy".to_string(),
            service_id: String::new(),
            observe_action: ObserveAction::NotObserved,
        };

        reporter.report_accepted_flow(&flow, None, "src", "dst", &ctx, &report, &enforced);

        let flows = collector.flows.lock();
        assert_eq!(
            flows[0].observed,
            Some(ObservedPolicy {
                action: Action::Reject,
                policy_id: "enforced-policy".to_string(),
            })
        );
    }

    #[test]
    fn external_flow_roles_follow_direction() {
        let (collector, reporter) = mk_reporter();
        let ctx = mk_context();
        let flow = mk_flow();
        let policy = accept_policy("ext");

        // Application-initiated: the PU is the source.
        reporter.report_external_service_flow(&ctx, &policy, &policy, true, &flow);
        // Network-received: roles invert.
        reporter.report_external_service_flow(&ctx, &policy, &policy, false, &flow);

        let flows = collector.flows.lock();
        assert_eq!(flows[0].source.kind, EndpointKind::Pu);
        assert_eq!(flows[0].source.id, "mgmt-0");
        assert_eq!(flows[0].destination.kind, EndpointKind::Address);
        assert_eq!(flows[0].destination.id, "svc-0");

        assert_eq!(flows[1].source.kind, EndpointKind::Address);
        assert_eq!(flows[1].source.id, "svc-0");
        assert_eq!(flows[1].destination.kind, EndpointKind::Pu);
        assert_eq!(flows[1].destination.id, "mgmt-0");
    }

    #[test]
    fn reverse_external_flow_swaps_raw_addresses() {
        let (collector, reporter) = mk_reporter();
        let ctx = mk_context();
        let flow = mk_flow();
        let policy = accept_policy("ext");

        reporter.report_external_service_flow(&ctx, &policy, &policy, true, &flow);
        reporter.report_reverse_external_service_flow(&ctx, &policy, &policy, true, &flow);

        let flows = collector.flows.lock();
        // Identical inputs: the reverse variant maps the raw destination
        // address to the record's source slot and vice versa, while role
        // labeling stays the same.
        assert_eq!(flows[0].source.ip, flow.source);
        assert_eq!(flows[0].destination.ip, flow.destination);
        assert_eq!(flows[1].source.ip, flow.destination);
        assert_eq!(flows[1].source.port, flow.destination_port);
        assert_eq!(flows[1].destination.ip, flow.source);
        assert_eq!(flows[1].destination.port, flow.source_port);
        assert_eq!(flows[1].source.kind, EndpointKind::Pu);
        assert_eq!(flows[1].destination.kind, EndpointKind::Address);
    }
}
