//! Invariant evaluation over a parsed state document.
//!
//! Evaluation is pure and deterministic: no I/O, declared order, no
//! short-circuiting (every invariant contributes a detail record even
//! after a failure). "First match" inside a single invariant follows
//! the document order of the state tree. A matcher that panics on an
//! unexpected state shape is caught and counted as `fail` with reason
//! `exception`; it never aborts the job.

use serde_json::Value;

use crate::report::{InvariantOutcome, Verdict};
use crate::state::{NodeId, StateDoc};
use crate::task::{Invariant, InvariantKind, ResourceAddress};

/// Evaluates all invariants against a state document.
#[must_use]
pub fn evaluate(invariants: &[Invariant], state: &StateDoc) -> Verdict {
    let detail = invariants
        .iter()
        .map(|invariant| {
            let checked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                check(&invariant.kind, state)
            }));
            let result = checked.unwrap_or_else(|_| Err("exception".to_string()));
            match result {
                Ok(()) => InvariantOutcome {
                    id: invariant.id.clone(),
                    kind: invariant.kind.tag().to_string(),
                    passed: true,
                    reason: None,
                },
                Err(reason) => InvariantOutcome {
                    id: invariant.id.clone(),
                    kind: invariant.kind.tag().to_string(),
                    passed: false,
                    reason: Some(reason),
                },
            }
        })
        .collect();

    Verdict::from_outcomes(detail)
}

fn check(kind: &InvariantKind, state: &StateDoc) -> Result<(), String> {
    match kind {
        InvariantKind::ResourceExists { address } => check_resource_exists(state, address),
        InvariantKind::AttributeEquals {
            address,
            attribute,
            expected,
        } => check_attribute_equals(state, address, attribute, expected),
        InvariantKind::FirewallAllows {
            address,
            protocol,
            port,
        } => check_firewall_allows(state, address, protocol, *port),
        InvariantKind::BindingGrants {
            address,
            principal,
            role,
        } => check_binding_grants(state, address, principal, role),
        InvariantKind::CollectionContains {
            address,
            attribute,
            element,
        } => check_collection_contains(state, address, attribute, element),
    }
}

fn check_resource_exists(state: &StateDoc, address: &ResourceAddress) -> Result<(), String> {
    if state.find(&address.resource_type, &address.name).next().is_some() {
        Ok(())
    } else {
        Err(format!("no resource '{address}' in state"))
    }
}

/// Matches a reference-like attribute value.
///
/// State commonly stores full self-links where task specs carry the
/// friendly name (`net-1` vs `projects/.../global/networks/net-1`), so
/// a string matches when it is equal or ends with `/<expected>`.
fn ref_match(actual: &str, expected: &str) -> bool {
    actual == expected || actual.ends_with(&format!("/{expected}"))
}

fn check_attribute_equals(
    state: &StateDoc,
    address: &ResourceAddress,
    attribute: &str,
    expected: &Value,
) -> Result<(), String> {
    let mut first_observed: Option<Value> = None;
    let mut seen_any = false;

    for resource in state.find(&address.resource_type, &address.name) {
        seen_any = true;
        let Some(node) = state.arena().resolve_path(resource.attributes, attribute) else {
            if first_observed.is_none() {
                first_observed = Some(Value::Null);
            }
            continue;
        };

        if state.arena().value_eq(node, expected) {
            return Ok(());
        }
        if let (Some(actual), Some(want)) = (state.arena().as_str(node), expected.as_str()) {
            if ref_match(actual, want) {
                return Ok(());
            }
        }
        if first_observed.is_none() {
            first_observed = Some(state.arena().to_value(node));
        }
    }

    if !seen_any {
        return Err(format!("no resource '{address}' in state"));
    }
    let observed = first_observed.unwrap_or(Value::Null);
    Err(format!(
        "{attribute}: expected {expected}, got {observed}"
    ))
}

fn check_firewall_allows(
    state: &StateDoc,
    address: &ResourceAddress,
    protocol: &str,
    port: Option<u16>,
) -> Result<(), String> {
    let mut seen_any = false;
    let mut observed_allow: Option<Value> = None;

    for resource in state.find(&address.resource_type, &address.name) {
        seen_any = true;
        let Some(allow) = state.arena().field(resource.attributes, "allow") else {
            continue;
        };
        if observed_allow.is_none() {
            observed_allow = Some(state.arena().to_value(allow));
        }
        let Some(blocks) = state.arena().as_array(allow) else {
            continue;
        };

        for block in blocks {
            if allow_block_matches(state, *block, protocol, port) {
                return Ok(());
            }
        }
    }

    if !seen_any {
        return Err(format!("no resource '{address}' in state"));
    }
    let wanted = match port {
        Some(p) => format!("{protocol}/{p}"),
        None => protocol.to_string(),
    };
    let observed = observed_allow.unwrap_or(Value::Null);
    Err(format!("no allow block for {wanted}, got {observed}"))
}

fn allow_block_matches(state: &StateDoc, block: NodeId, protocol: &str, port: Option<u16>) -> bool {
    let arena = state.arena();
    let proto_ok = arena
        .field(block, "protocol")
        .and_then(|n| arena.as_str(n))
        .is_some_and(|p| p.eq_ignore_ascii_case(protocol));
    if !proto_ok {
        return false;
    }
    let Some(port) = port else {
        return true;
    };

    // Ports are stored as strings and may be ranges ("1000-2000").
    let wanted = port.to_string();
    arena
        .field(block, "ports")
        .and_then(|n| arena.as_array(n).map(<[NodeId]>::to_vec))
        .unwrap_or_default()
        .into_iter()
        .any(|p| match arena.to_value(p) {
            Value::String(s) => s == wanted || port_in_range(&s, port),
            Value::Number(n) => n.as_u64() == Some(u64::from(port)),
            _ => false,
        })
}

fn port_in_range(spec: &str, port: u16) -> bool {
    let Some((lo, hi)) = spec.split_once('-') else {
        return false;
    };
    match (lo.trim().parse::<u16>(), hi.trim().parse::<u16>()) {
        (Ok(lo), Ok(hi)) => (lo..=hi).contains(&port),
        _ => false,
    }
}

fn check_binding_grants(
    state: &StateDoc,
    address: &ResourceAddress,
    principal: &str,
    role: &str,
) -> Result<(), String> {
    let mut seen_any = false;
    let mut observed: Option<(String, String)> = None;

    for resource in state.find(&address.resource_type, &address.name) {
        seen_any = true;
        let arena = state.arena();
        let actual_role = arena
            .field(resource.attributes, "role")
            .and_then(|n| arena.as_str(n))
            .unwrap_or_default();
        let actual_member = arena
            .field(resource.attributes, "member")
            .and_then(|n| arena.as_str(n))
            .unwrap_or_default();

        // Members expand to full emails in state
        // (serviceAccount:sa-1 -> serviceAccount:sa-1@proj.iam...).
        let member_ok = !principal.is_empty()
            && actual_member.to_lowercase().contains(&principal.to_lowercase());
        if actual_role == role && member_ok {
            return Ok(());
        }
        if observed.is_none() {
            observed = Some((actual_role.to_string(), actual_member.to_string()));
        }
    }

    if !seen_any {
        return Err(format!("no resource '{address}' in state"));
    }
    let (got_role, got_member) = observed.unwrap_or_default();
    Err(format!(
        "expected role '{role}' for '{principal}', got role '{got_role}' member '{got_member}'"
    ))
}

fn check_collection_contains(
    state: &StateDoc,
    address: &ResourceAddress,
    attribute: &str,
    element: &Value,
) -> Result<(), String> {
    let mut seen_any = false;
    let mut observed: Option<Value> = None;

    for resource in state.find(&address.resource_type, &address.name) {
        seen_any = true;
        let Some(node) = state.arena().resolve_path(resource.attributes, attribute) else {
            continue;
        };
        if observed.is_none() {
            observed = Some(state.arena().to_value(node));
        }
        let Some(items) = state.arena().as_array(node) else {
            continue;
        };
        if items.iter().any(|i| state.arena().value_eq(*i, element)) {
            return Ok(());
        }
    }

    if !seen_any {
        return Err(format!("no resource '{address}' in state"));
    }
    let observed = observed.unwrap_or(Value::Null);
    Err(format!(
        "{attribute}: expected element {element}, got {observed}"
    ))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::task::TaskSpec;

    fn state() -> StateDoc {
        StateDoc::from_value(&json!({
            "version": 4,
            "resources": [
                {
                    "mode": "managed",
                    "type": "random_id",
                    "name": "example",
                    "instances": [{"attributes": {"byte_length": 4, "hex": "a1b2c3d4"}}]
                },
                {
                    "mode": "managed",
                    "type": "google_compute_instance",
                    "name": "main_0",
                    "instances": [{"attributes": {
                        "name": "vm-a",
                        "machine_type": "projects/p/zones/z/machineTypes/e2-micro",
                        "network_interface": [{"network": "projects/p/global/networks/net-1"}]
                    }}]
                },
                {
                    "mode": "managed",
                    "type": "google_compute_firewall",
                    "name": "allow_ssh",
                    "instances": [{"attributes": {
                        "name": "fw-ssh",
                        "allow": [
                            {"protocol": "icmp", "ports": []},
                            {"protocol": "tcp", "ports": ["22", "8000-8100"]}
                        ]
                    }}]
                },
                {
                    "mode": "managed",
                    "type": "google_project_iam_member",
                    "name": "binding_0",
                    "instances": [{"attributes": {
                        "role": "roles/viewer",
                        "member": "serviceAccount:sa-12345678@proj.iam.gserviceaccount.com"
                    }}]
                },
                {
                    "mode": "managed",
                    "type": "google_dns_record_set",
                    "name": "www",
                    "instances": [{"attributes": {
                        "rrdatas": ["10.0.0.1", "10.0.0.2"]
                    }}]
                }
            ]
        }))
        .unwrap()
    }

    fn run(spec_json: &str) -> Verdict {
        let spec = TaskSpec::from_json(spec_json).unwrap();
        evaluate(&spec.invariants, &state())
    }

    #[test]
    fn happy_path_single_invariant() {
        let verdict = run(
            r#"{"invariants": [
                {"id": "i1", "kind": "resource_exists", "address": "random_id.example"}
            ]}"#,
        );
        assert!(verdict.passed());
        assert_eq!(verdict.passed_invariants, 1);
        assert_eq!(verdict.total_invariants, 1);
        assert!((verdict.score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn attribute_mismatch_names_expected_and_observed() {
        let verdict = run(
            r#"{"invariants": [
                {"id": "i1", "kind": "attribute_equals",
                 "address": "google_compute_instance.main_0",
                 "attribute": "name", "expected": "vm-b"}
            ]}"#,
        );
        assert!(!verdict.passed());
        assert_eq!(verdict.score, 0.0);
        let reason = verdict.detail[0].reason.as_deref().unwrap();
        assert!(reason.contains("vm-b"), "expected value in reason: {reason}");
        assert!(reason.contains("vm-a"), "observed value in reason: {reason}");
    }

    #[test]
    fn reference_values_match_by_suffix() {
        let verdict = run(
            r#"{"invariants": [
                {"id": "i1", "kind": "attribute_equals",
                 "address": "google_compute_instance.main_0",
                 "attribute": "machine_type", "expected": "e2-micro"},
                {"id": "i2", "kind": "attribute_equals",
                 "address": "google_compute_instance.main_0",
                 "attribute": "network_interface.0.network", "expected": "net-1"}
            ]}"#,
        );
        assert!(verdict.passed(), "{:?}", verdict.detail);
    }

    #[test]
    fn firewall_allow_matches_port_and_range() {
        let verdict = run(
            r#"{"invariants": [
                {"id": "p22", "kind": "firewall_allows",
                 "address": "google_compute_firewall.allow_ssh",
                 "protocol": "tcp", "port": 22},
                {"id": "p8050", "kind": "firewall_allows",
                 "address": "google_compute_firewall.allow_ssh",
                 "protocol": "tcp", "port": 8050},
                {"id": "icmp", "kind": "firewall_allows",
                 "address": "google_compute_firewall.allow_ssh",
                 "protocol": "icmp"}
            ]}"#,
        );
        assert!(verdict.passed(), "{:?}", verdict.detail);
    }

    #[test]
    fn firewall_denies_unlisted_port() {
        let verdict = run(
            r#"{"invariants": [
                {"id": "p443", "kind": "firewall_allows",
                 "address": "google_compute_firewall.allow_ssh",
                 "protocol": "tcp", "port": 443}
            ]}"#,
        );
        assert!(!verdict.passed());
        assert!(verdict.detail[0]
            .reason
            .as_deref()
            .unwrap()
            .contains("tcp/443"));
    }

    #[test]
    fn binding_matches_expanded_member() {
        let verdict = run(
            r#"{"invariants": [
                {"id": "b", "kind": "binding_grants",
                 "address": "google_project_iam_member.binding_0",
                 "principal": "serviceAccount:sa-12345678", "role": "roles/viewer"}
            ]}"#,
        );
        assert!(verdict.passed(), "{:?}", verdict.detail);
    }

    #[test]
    fn binding_role_mismatch_fails() {
        let verdict = run(
            r#"{"invariants": [
                {"id": "b", "kind": "binding_grants",
                 "address": "google_project_iam_member.binding_0",
                 "principal": "serviceAccount:sa-12345678", "role": "roles/editor"}
            ]}"#,
        );
        assert!(!verdict.passed());
    }

    #[test]
    fn collection_contains_element() {
        let verdict = run(
            r#"{"invariants": [
                {"id": "c1", "kind": "collection_contains",
                 "address": "google_dns_record_set.www",
                 "attribute": "rrdatas", "element": "10.0.0.2"},
                {"id": "c2", "kind": "collection_contains",
                 "address": "google_dns_record_set.www",
                 "attribute": "rrdatas", "element": "10.9.9.9"}
            ]}"#,
        );
        assert!(!verdict.passed());
        assert!(verdict.detail[0].passed);
        assert!(!verdict.detail[1].passed);
        assert!((verdict.score - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_resource_reports_address() {
        let verdict = run(
            r#"{"invariants": [
                {"id": "m", "kind": "resource_exists", "address": "google_pubsub_topic.events"}
            ]}"#,
        );
        let reason = verdict.detail[0].reason.as_deref().unwrap();
        assert!(reason.contains("google_pubsub_topic.events"));
    }

    #[test]
    fn all_invariants_evaluated_after_failure() {
        let verdict = run(
            r#"{"invariants": [
                {"id": "f", "kind": "resource_exists", "address": "missing.one"},
                {"id": "p", "kind": "resource_exists", "address": "random_id.example"}
            ]}"#,
        );
        assert_eq!(verdict.detail.len(), 2);
        assert!(!verdict.detail[0].passed);
        assert!(verdict.detail[1].passed);
    }

    #[test]
    fn zero_invariants_fail_closed() {
        let verdict = run(r#"{"invariants": []}"#);
        assert!(!verdict.passed());
        assert_eq!(verdict.score, 0.0);
        assert_eq!(verdict.total_invariants, 0);
    }

    #[test]
    fn determinism_same_inputs_same_verdict() {
        let spec = r#"{"invariants": [
            {"id": "a", "kind": "resource_exists", "address": "random_id.example"},
            {"id": "b", "kind": "attribute_equals",
             "address": "google_compute_instance.main_0",
             "attribute": "name", "expected": "vm-a"}
        ]}"#;
        let first = run(spec);
        let second = run(spec);
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }
}
