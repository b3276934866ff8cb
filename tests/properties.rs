use proptest::prelude::*;
use serde_json::{json, Map};
use siem_query::ast::{
    Condition, Direction, FieldRef, FunctionCall, GroupBy, Literal, Operand, Operator, OrderBy,
    Predicate, QueryParts, RelativeDuration, SelectField, TimeRange, Timestamp,
};
use siem_query::mock::{Event, MockConfig};
use siem_query::{CancellationFlag, FieldType, MockProvider, QueryAst, QueryProvider, Schema};

const SELECTABLE: &[(&str, FieldType)] = &[
    ("activity_name", FieldType::String),
    ("src_ip", FieldType::IpAddress),
    ("severity_id", FieldType::Integer),
    ("user.name", FieldType::String),
    ("not_in_catalog", FieldType::String),
];

const TENANTS: &[&str] = &["acme", "globex", "initech"];

fn field(name: &str, field_type: FieldType) -> FieldRef {
    FieldRef::new(name, field_type).unwrap()
}

fn condition() -> impl Strategy<Value = Predicate> {
    prop_oneof![
        ("[a-z_]{1,12}", any::<bool>()).prop_map(|(value, negate)| {
            let op = if negate { Operator::Ne } else { Operator::Eq };
            Predicate::from(
                Condition::compare(field("activity_name", FieldType::String), op, Literal::string(value))
                    .unwrap(),
            )
        }),
        (0i64..8).prop_map(|n| {
            Predicate::from(
                Condition::compare(field("severity_id", FieldType::Integer), Operator::Gte, Literal::integer(n))
                    .unwrap(),
            )
        }),
        prop::sample::select(vec!["10.0.0.0/8", "10.1.0.0/16", "192.168.0.0/24"]).prop_map(|net| {
            Predicate::from(
                Condition::compare(
                    field("src_ip", FieldType::IpAddress),
                    Operator::InSubnet,
                    Literal::ip(net).unwrap(),
                )
                .unwrap(),
            )
        }),
        prop::collection::vec(0i64..8, 1..4).prop_map(|values| {
            Predicate::from(
                Condition::list(
                    field("severity_id", FieldType::Integer),
                    Operator::In,
                    values.into_iter().map(Literal::integer).collect(),
                )
                .unwrap(),
            )
        }),
        Just(Predicate::from(
            Condition::unary(field("user.name", FieldType::String), Operator::IsNotNull).unwrap(),
        )),
        (0i32..400).prop_map(|n| {
            Predicate::from(
                Condition::compare(
                    field("risk_score", FieldType::Float),
                    Operator::Lt,
                    Literal::float(f64::from(n) / 4.0).unwrap(),
                )
                .unwrap(),
            )
        }),
        prop::sample::select(INSTANTS.to_vec()).prop_map(|at| {
            Predicate::from(
                Condition::compare(field("time", FieldType::Timestamp), Operator::Gte, Literal::timestamp(at).unwrap())
                    .unwrap(),
            )
        }),
        Just(Predicate::from(
            Condition::compare(
                field("user.name", FieldType::String),
                Operator::Ne,
                Literal::null(FieldType::String),
            )
            .unwrap(),
        )),
        (1usize..4).prop_map(|depth| {
            Predicate::from(
                Condition::compare(lowered("user.name", depth), Operator::StartsWith, Literal::string("user"))
                    .unwrap(),
            )
        }),
    ]
}

/// 带不同时区偏移的 RFC 3339 时间
const INSTANTS: &[&str] = &[
    "2024-03-01T10:00:00Z",
    "2024-03-01T12:30:00+02:00",
    "2023-12-31T23:59:59-05:00",
    "0000-01-01T00:30:00Z",
];

/// 嵌套 `depth` 层的 `lower(lower(...field))`
fn lowered(name: &str, depth: usize) -> Operand {
    let mut operand: Operand = field(name, FieldType::String).into();
    for _ in 0..depth {
        operand = FunctionCall::new("lower", vec![operand], FieldType::String)
            .unwrap()
            .into();
    }
    operand
}

fn select_item() -> impl Strategy<Value = SelectField> {
    let alias = || prop::option::of("[a-z][a-z_]{0,7}");
    prop_oneof![
        (prop::sample::select(SELECTABLE.to_vec()), alias()).prop_map(|((name, t), alias)| {
            match alias {
                Some(alias) => SelectField::field(field(name, t).with_alias(alias).unwrap()),
                None => SelectField::field(field(name, t)),
            }
        }),
        (1usize..4, alias()).prop_map(|(depth, alias)| SelectField::new(lowered("user.name", depth), alias).unwrap()),
        alias().prop_map(|alias| {
            let count = FunctionCall::new("count", vec![], FieldType::Integer).unwrap();
            SelectField::new(count, alias).unwrap()
        }),
        (prop::sample::select(vec!["sum", "min", "max"]), alias()).prop_map(|(name, alias)| {
            let call = FunctionCall::new(
                name,
                vec![field("traffic.bytes", FieldType::Integer).into()],
                FieldType::Integer,
            )
            .unwrap();
            SelectField::new(call, alias).unwrap()
        }),
        alias().prop_map(|alias| {
            let avg = FunctionCall::new("avg", vec![field("risk_score", FieldType::Float).into()], FieldType::Float)
                .unwrap();
            SelectField::new(avg, alias).unwrap()
        }),
    ]
}

fn group_by() -> impl Strategy<Value = GroupBy> {
    (
        prop::sample::subsequence(vec![("activity_name", FieldType::String), ("src_ip", FieldType::IpAddress)], 1..=2),
        prop::option::of(0i64..4),
    )
        .prop_map(|(fields, min_count)| {
            let having = min_count.map(|n| {
                let count = FunctionCall::new("count", vec![], FieldType::Integer).unwrap();
                Predicate::from(Condition::compare(count, Operator::Gte, Literal::integer(n)).unwrap())
            });
            GroupBy::new(fields.into_iter().map(|(name, t)| field(name, t)).collect(), having).unwrap()
        })
}

fn time_range() -> impl Strategy<Value = TimeRange> {
    prop_oneof![
        (prop::sample::select(INSTANTS.to_vec()), prop::sample::select(INSTANTS.to_vec())).prop_map(
            |(start, end)| TimeRange::between(Timestamp::parse(start).unwrap(), Timestamp::parse(end).unwrap())
        ),
        prop::sample::select(vec!["30s", "15m", "24h", "7d", "2w"])
            .prop_map(|token| TimeRange::last(RelativeDuration::parse(token).unwrap())),
    ]
}

fn predicate() -> impl Strategy<Value = Predicate> {
    condition().prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..4).prop_map(|c| Predicate::and(c).unwrap()),
            prop::collection::vec(inner.clone(), 1..4).prop_map(|c| Predicate::or(c).unwrap()),
            inner.prop_map(|c| Predicate::not(c).unwrap()),
        ]
    })
}

prop_compose! {
    fn query()(
        select in prop::collection::vec(select_item(), 0..4),
        filter in prop::option::of(predicate()),
        grouping in prop::option::of(group_by()),
        order in prop::option::of((prop::sample::select(SELECTABLE.to_vec()), any::<bool>())),
        limit in prop::option::of(0u64..20_000),
        offset in 0u64..4,
        window in prop::option::of(time_range()),
        source in prop::option::of("[a-z ]{1,20}"),
        tenant in prop::sample::select(TENANTS.to_vec()),
    ) -> QueryAst {
        let order_by = order
            .map(|((name, t), desc)| {
                let direction = if desc { Direction::Desc } else { Direction::Asc };
                vec![OrderBy { field: field(name, t), direction }]
            })
            .unwrap_or_default();
        QueryAst::from_parts(QueryParts {
            select,
            where_clause: filter,
            group_by: grouping,
            order_by,
            limit,
            offset,
            time_range: window,
            tenant_id: tenant.to_string(),
            query_id: "prop".to_string(),
            source_query: source,
        })
        .unwrap()
    }
}

/// 测试事件：`owner` 为所属租户，`seq` 为写入序号
fn fixture() -> Vec<Event> {
    let activities = ["failed_login", "logon", "logoff"];
    (0..48)
        .map(|i: usize| {
            let tenant = TENANTS[i % TENANTS.len()];
            let mut fields = Map::new();
            fields.insert("owner".into(), json!(tenant));
            fields.insert("seq".into(), json!(i));
            fields.insert("activity_name".into(), json!(activities[i % activities.len()]));
            fields.insert("severity_id".into(), json!(i % 7));
            fields.insert("src_ip".into(), json!(format!("10.{}.0.{}", i % 3, i)));
            if i % 5 != 0 {
                fields.insert("user".into(), json!({"name": format!("user{}", i % 4)}));
            }
            Event::new(tenant, fields)
        })
        .collect()
}

fn unbounded_provider() -> MockProvider {
    MockProvider::with_events(
        MockConfig {
            timeout_ms: None,
            ..Default::default()
        },
        fixture(),
    )
}

proptest! {
    #[test]
    fn prop_document_round_trip(ast in query()) {
        let json = ast.to_json().unwrap();
        let reparsed = QueryAst::from_json(&json).unwrap();
        prop_assert_eq!(reparsed, ast);
    }

    #[test]
    fn prop_validation_is_deterministic(ast in query()) {
        let schema = Schema::ocsf();
        let first = schema.validator().validate(&ast);
        let second = schema.validator().validate(&ast);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_rows_stay_within_tenant(filter in prop::option::of(predicate())) {
        let provider = unbounded_provider();
        let schema = Schema::ocsf();
        for tenant in TENANTS {
            let ast = QueryAst::from_parts(QueryParts {
                where_clause: filter.clone(),
                tenant_id: tenant.to_string(),
                query_id: "isolation".to_string(),
                ..Default::default()
            })
            .unwrap();
            let result = provider.execute(&ast, &schema, &CancellationFlag::new()).unwrap();
            for row in &result.rows {
                prop_assert_eq!(&row["owner"], &json!(tenant));
            }
        }
    }

    #[test]
    fn prop_repeated_execution_is_identical(ast in query()) {
        let provider = unbounded_provider();
        let schema = Schema::ocsf();
        let first = provider.execute(&ast, &schema, &CancellationFlag::new());
        let second = provider.execute(&ast, &schema, &CancellationFlag::new());
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_equal_sort_keys_keep_ingestion_order(desc in any::<bool>(), tenant in prop::sample::select(TENANTS.to_vec())) {
        let direction = if desc { Direction::Desc } else { Direction::Asc };
        let ast = QueryAst::from_parts(QueryParts {
            order_by: vec![OrderBy { field: field("activity_name", FieldType::String), direction }],
            tenant_id: tenant.to_string(),
            query_id: "stable".to_string(),
            ..Default::default()
        })
        .unwrap();
        let result = unbounded_provider()
            .execute(&ast, &Schema::ocsf(), &CancellationFlag::new())
            .unwrap();
        for pair in result.rows.windows(2) {
            if pair[0]["activity_name"] == pair[1]["activity_name"] {
                prop_assert!(pair[0]["seq"].as_u64() < pair[1]["seq"].as_u64());
            }
        }
    }
}
