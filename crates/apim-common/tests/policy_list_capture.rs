//! Parses captured `PolicyList` responses end to end

use apim_common::crd::{ApplyRange, IpRuleKind, ResourceState};
use apim_common::policy_list::parse_policy_list;
use kube::ResourceExt;

const CAPTURE: &str = include_str!("fixtures/policy_list.json");

#[test]
fn capture_parses_and_validates() {
    let list = parse_policy_list(CAPTURE).unwrap();

    assert_eq!(list.kind, "PolicyList");
    assert_eq!(list.api_version, "k8s.nginx.org/v1");
    assert_eq!(list.resource_version(), Some("2801061"));
    assert!(!list.has_more());

    let names: Vec<_> = list.items.iter().map(|p| p.name_any()).collect();
    assert_eq!(names, vec!["test-ip-allow", "office-ip-allow"]);
}

#[test]
fn capture_items_expose_gateway_metadata() {
    let list = parse_policy_list(CAPTURE).unwrap();
    let first = &list.items[0];

    assert_eq!(first.ip_rule_kind(), Some(IpRuleKind::Allow));
    assert_eq!(first.apply_range(), ApplyRange::Server);
    assert_eq!(first.ip_sources(), ["192.168.201.1", "192.22.22.1"]);
    assert_eq!(first.state(), ResourceState::Valid);

    // Not yet reconciled by the controller
    let second = &list.items[1];
    assert_eq!(second.state(), ResourceState::Unknown);
    assert_eq!(second.apply_range(), ApplyRange::Http);
}

#[test]
fn capture_reports_owners_and_valid_subset() {
    let list = parse_policy_list(CAPTURE).unwrap();

    let managers: Vec<_> = list.field_managers().into_iter().collect();
    assert_eq!(managers, vec!["apim-gateway", "nginx-ingress"]);
    assert_eq!(list.valid_items().count(), 1);
}

#[test]
fn tampered_capture_is_rejected_with_path() {
    let tampered = CAPTURE.replace("10.10.0.0/16", "10.10.0.0/40");
    let err = parse_policy_list(&tampered).unwrap_err();
    assert_eq!(err.field(), Some("items[1].spec.accessControl.allow[0]"));
}

const INGRESS_CAPTURE: &str = include_str!("fixtures/ipallow_capture.json");

#[test]
fn ingress_capture_is_valid_as_recorded() {
    let list = parse_policy_list(INGRESS_CAPTURE).unwrap();

    assert_eq!(list.items.len(), 2);
    assert_eq!(list.valid_items().count(), 2);
    assert_eq!(list.resource_version(), Some("2801061"));
    assert_eq!(list.continue_token(), None);
    assert!(!list.has_more());

    let managers: Vec<_> = list.field_managers().into_iter().collect();
    assert_eq!(managers, vec!["nginx-ingress", "python-httpx"]);

    for policy in &list.items {
        assert_eq!(policy.state(), ResourceState::Valid);
        assert_eq!(policy.ip_rule_kind(), Some(IpRuleKind::Allow));
        assert_eq!(policy.ip_sources(), ["192.168.201.1", "192.22.22.1"]);
        assert_eq!(policy.apply_range(), ApplyRange::Http);
    }
}

#[test]
fn ingress_capture_keeps_unsuffixed_names() {
    let list = parse_policy_list(INGRESS_CAPTURE).unwrap();

    let names: Vec<_> = list.items.iter().map(|p| p.name_any()).collect();
    assert_eq!(names, vec!["test-ip-allow", "test1212"]);
    assert_eq!(IpRuleKind::Allow.policy_name("test1212"), "test1212");
    assert_eq!(IpRuleKind::Allow.policy_name("test-ip-allow"), "test");
    assert_eq!(
        list.items[1].uid().as_deref(),
        Some("7c554a79-f348-4ca5-a81a-9de5dd983e00")
    );
}
