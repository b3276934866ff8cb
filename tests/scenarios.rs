use serde_json::json;
use siem_query::ast::{
    Condition, FieldRef, FunctionCall, Literal, Operand, Operator, QueryParts, SelectField,
};
use siem_query::mock::{Event, MockConfig};
use siem_query::provider::QueryState;
use siem_query::{
    run_query, CancellationFlag, FailureKind, FieldType, MockProvider, QueryAst, QueryError, Schema,
};

fn events() -> Vec<Event> {
    serde_json::from_value(json!([
        {"tenant_id": "acme", "activity_name": "failed_login", "src_ip": "10.0.0.2"},
        {"tenant_id": "acme", "activity_name": "failed_login", "src_ip": "10.0.0.1"},
        {"tenant_id": "acme", "activity_name": "logon", "src_ip": "10.0.0.2"},
        {"tenant_id": "acme", "activity_name": "failed_login", "src_ip": "10.0.0.1"},
        {"tenant_id": "globex", "activity_name": "failed_login", "src_ip": "10.0.0.2"},
        {"tenant_id": "globex", "activity_name": "failed_login", "src_ip": "10.0.0.2"}
    ]))
    .unwrap()
}

fn provider() -> MockProvider {
    MockProvider::with_events(MockConfig::default(), events())
}

fn query_with(parts: QueryParts) -> QueryAst {
    QueryAst::from_parts(QueryParts {
        tenant_id: "acme".into(),
        query_id: "scenario".into(),
        ..parts
    })
    .unwrap()
}

#[test]
fn test_grouped_failed_logins_ordered_by_count() {
    let doc = r#"{
        "select": [
            {"expr": {"type": "field", "name": "activity_name", "field_type": "string"}},
            {"expr": {"type": "function", "name": "count", "args": [], "return_type": "integer"},
             "alias": "count"}
        ],
        "where": {"type": "condition",
                  "left": {"type": "field", "name": "activity_name", "field_type": "string"},
                  "operator": "eq",
                  "right": {"type": "literal", "value": "failed_login", "literal_type": "string"}},
        "group_by": {"fields": [{"name": "src_ip", "field_type": "ip_address"}]},
        "order_by": [{"field": {"name": "count", "field_type": "integer"}, "direction": "desc"}],
        "limit": 100,
        "tenant_id": "acme",
        "query_id": "q-failed-logins"
    }"#;
    let ast = QueryAst::from_json(doc).unwrap();
    let schema = Schema::ocsf();

    let result = run_query(&provider(), &ast, &schema, &CancellationFlag::new()).unwrap();
    assert_eq!(result.query_id, "q-failed-logins");
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0]["count"], json!(2));
    assert_eq!(result.rows[1]["count"], json!(1));
    assert!(result.rows.iter().all(|r| r["activity_name"] == json!("failed_login")));
    assert_eq!(result.total_count, None);
}

#[test]
fn test_regex_on_ip_field_is_operator_mismatch() {
    let ast = query_with(QueryParts {
        where_clause: Some(
            Condition::compare(
                FieldRef::new("device.ip", FieldType::IpAddress).unwrap(),
                Operator::Regex,
                Literal::string("x"),
            )
            .unwrap()
            .into(),
        ),
        ..Default::default()
    });
    let err = run_query(&provider(), &ast, &Schema::ocsf(), &CancellationFlag::new()).unwrap_err();
    match &err {
        QueryError::Rejected(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].kind, FailureKind::OperatorTypeMismatch);
            assert_eq!(failures[0].kind.code(), "operator_type_mismatch");
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert_eq!(err.final_state(), QueryState::Rejected);
}

#[test]
fn test_between_with_empty_list_never_reaches_validation() {
    let doc = r#"{
        "where": {"type": "condition",
                  "left": {"type": "field", "name": "severity_id", "field_type": "integer"},
                  "operator": "between", "right": []},
        "tenant_id": "acme", "query_id": "q"
    }"#;
    assert!(QueryAst::from_json(doc).is_err());
}

#[test]
fn test_limit_bounds() {
    let schema = Schema::ocsf();
    let too_large = query_with(QueryParts {
        limit: Some(50_000),
        ..Default::default()
    });
    let failures = schema.validator().validate(&too_large);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, FailureKind::BoundExceeded);

    let at_max = query_with(QueryParts {
        limit: Some(10_000),
        ..Default::default()
    });
    assert!(schema.validator().validate(&at_max).is_empty());
}

#[test]
fn test_independent_violations_are_all_reported() {
    let ast = query_with(QueryParts {
        select: vec![SelectField::field(
            FieldRef::new("no_such_field", FieldType::String).unwrap(),
        )],
        limit: Some(50_000),
        ..Default::default()
    });
    let kinds: Vec<_> = Schema::ocsf()
        .validator()
        .validate(&ast)
        .into_iter()
        .map(|f| f.kind)
        .collect();
    assert!(kinds.len() >= 2);
    assert!(kinds.contains(&FailureKind::UnknownField));
    assert!(kinds.contains(&FailureKind::BoundExceeded));
}

fn nested_lower(depth: usize) -> Operand {
    let mut operand: Operand = FieldRef::new("user.name", FieldType::String).unwrap().into();
    for _ in 0..depth {
        operand = FunctionCall::new("lower", vec![operand], FieldType::String)
            .unwrap()
            .into();
    }
    operand
}

#[test]
fn test_depth_guard_boundary() {
    let schema = Schema::ocsf();
    let at_limit = query_with(QueryParts {
        select: vec![SelectField::new(nested_lower(32), Some("name".into())).unwrap()],
        ..Default::default()
    });
    assert!(schema.validator().validate(&at_limit).is_empty());

    let too_deep = query_with(QueryParts {
        select: vec![SelectField::new(nested_lower(33), Some("name".into())).unwrap()],
        ..Default::default()
    });
    let failures = schema.validator().validate(&too_deep);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, FailureKind::DepthExceeded);
}

#[test]
fn test_tenant_rows_never_leak() {
    let schema = Schema::ocsf();
    let select = vec![SelectField::field(
        FieldRef::new("src_ip", FieldType::IpAddress).unwrap(),
    )];
    let acme = query_with(QueryParts {
        select: select.clone(),
        ..Default::default()
    });
    let globex = QueryAst::from_parts(QueryParts {
        tenant_id: "globex".into(),
        ..acme.to_parts()
    })
    .unwrap();

    let provider = provider();
    let acme_rows = run_query(&provider, &acme, &schema, &CancellationFlag::new()).unwrap();
    let globex_rows = run_query(&provider, &globex, &schema, &CancellationFlag::new()).unwrap();
    assert_eq!(acme_rows.total_count, Some(4));
    assert_eq!(globex_rows.total_count, Some(2));
    assert!(globex_rows.rows.iter().all(|r| r["src_ip"] == json!("10.0.0.2")));
}

#[test]
fn test_cancelled_query_fails() {
    let cancel = CancellationFlag::new();
    cancel.cancel();
    let ast = query_with(QueryParts::default());
    let err = run_query(&provider(), &ast, &Schema::ocsf(), &cancel).unwrap_err();
    assert_eq!(err.final_state(), QueryState::Failed);
    match err {
        QueryError::Execution(inner) => assert_eq!(inner.code(), "cancelled"),
        other => panic!("expected execution failure, got {:?}", other),
    }
}
