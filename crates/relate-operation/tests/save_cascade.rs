mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{
    MockConnection, accounts, docs, expect_err, generated_id, teams, text, unwrap_outcome,
};
use relate_core::{
    ConnectionErrorKind, Cx, DependencyError, Dialect, EntityRef, EntityType, Error,
    ForeignKeyInfo, ForeignTableInfo, GeneratedValue, MetadataRegistry, PropertyInfo,
    QueryErrorKind, SqlType, Value,
};
use relate_operation::{OperationConfig, ZeroRowsPolicy};
use std::sync::Arc;

fn block_on<F: Future>(f: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(f)
}

#[test]
fn referenced_instance_is_inserted_first() {
    let registry = teams();
    let conn = MockConnection::new(Dialect::Postgres);
    let cx = Cx::for_testing();

    let team = EntityRef::new(registry.entity("Team").unwrap());
    team.set("name", text("core")).unwrap();
    let member = EntityRef::new(registry.entity("Member").unwrap());
    member.set("name", text("x")).unwrap();
    member.set("team", &team).unwrap();

    let result = block_on(async {
        unwrap_outcome(
            relate_operation::save(
                &cx,
                &conn,
                &registry,
                &[member.clone()],
                OperationConfig::default(),
            )
            .await,
        )
    });

    let statements = conn.statements();
    assert_eq!(statements.len(), 2);
    assert_eq!(
        statements[0].0,
        "INSERT INTO \"teams\" (\"name\") VALUES ($1) RETURNING \"id\""
    );
    assert_eq!(
        statements[1].0,
        "INSERT INTO \"members\" (\"name\", \"team_id\") VALUES ($1, $2) RETURNING \"id\""
    );
    assert_eq!(statements[1].1, vec![text("x"), Value::BigInt(1)]);

    assert_eq!(result.inserted, 2);
    assert_eq!(result.waves, 2);
    assert_eq!(team.id(), Some(Value::BigInt(1)));
    assert_eq!(member.id(), Some(Value::BigInt(2)));
    for instance in [&team, &member] {
        assert!(instance.is_persisted());
        assert!(instance.is_loaded());
        assert!(instance.modified_fields().is_empty());
    }
}

#[test]
fn shared_target_is_saved_once() {
    let registry = teams();
    let conn = MockConnection::new(Dialect::Postgres);
    let cx = Cx::for_testing();

    let team = EntityRef::new(registry.entity("Team").unwrap());
    team.set("name", text("core")).unwrap();
    let members: Vec<EntityRef> = ["a", "b"]
        .iter()
        .map(|name| {
            let m = EntityRef::new(registry.entity("Member").unwrap());
            m.set("name", text(name)).unwrap();
            m.set("team", &team).unwrap();
            m
        })
        .collect();

    let result = block_on(async {
        unwrap_outcome(
            relate_operation::save(&cx, &conn, &registry, &members, OperationConfig::default())
                .await,
        )
    });

    let sql = conn.sql();
    assert_eq!(sql.len(), 2);
    assert_eq!(sql.iter().filter(|s| s.contains("\"teams\"")).count(), 1);
    assert_eq!(
        sql[1],
        "INSERT INTO \"members\" (\"name\", \"team_id\") VALUES ($1, $2), ($3, $4) RETURNING \"id\""
    );
    assert_eq!(result.inserted, 3);
    assert_eq!(members[0].id(), Some(Value::BigInt(2)));
    assert_eq!(members[1].id(), Some(Value::BigInt(3)));
}

#[test]
fn inserts_are_chunked_by_batch_size() {
    let registry = teams();
    let conn = MockConnection::new(Dialect::Postgres);
    let cx = Cx::for_testing();

    let teams: Vec<EntityRef> = (0..2500)
        .map(|i| {
            let team = EntityRef::new(registry.entity("Team").unwrap());
            team.set("name", text(&format!("team {i}"))).unwrap();
            team
        })
        .collect();

    let result = block_on(async {
        unwrap_outcome(
            relate_operation::save(&cx, &conn, &registry, &teams, OperationConfig::default()).await,
        )
    });

    let sizes: Vec<usize> = conn.statements().iter().map(|(_, p)| p.len()).collect();
    assert_eq!(sizes, vec![1000, 1000, 500]);
    assert_eq!(result.waves, 1);
    assert_eq!(result.inserted, 2500);
    assert_eq!(teams[0].id(), Some(Value::BigInt(1)));
    assert_eq!(teams[1999].id(), Some(Value::BigInt(2000)));
    assert_eq!(teams[2499].id(), Some(Value::BigInt(2500)));
}

#[test]
fn single_row_inserts_without_returning() {
    let registry = teams();
    let conn = MockConnection::new(Dialect::Mysql);
    let cx = Cx::for_testing();

    let teams: Vec<EntityRef> = ["a", "b"]
        .iter()
        .map(|name| {
            let team = EntityRef::new(registry.entity("Team").unwrap());
            team.set("name", text(name)).unwrap();
            team
        })
        .collect();

    block_on(async {
        unwrap_outcome(
            relate_operation::save(&cx, &conn, &registry, &teams, OperationConfig::default()).await,
        )
    });

    assert_eq!(
        conn.sql(),
        vec![
            "INSERT INTO `teams` (`name`) VALUES (?)".to_string(),
            "INSERT INTO `teams` (`name`) VALUES (?)".to_string(),
        ]
    );
    assert_eq!(teams[0].id(), Some(Value::BigInt(1)));
    assert_eq!(teams[1].id(), Some(Value::BigInt(2)));
}

#[test]
fn versioned_update_bumps_version() {
    let registry = docs();
    let conn = MockConnection::new(Dialect::Postgres);
    let cx = Cx::for_testing();

    let doc = EntityRef::from_store(
        registry.entity("Doc").unwrap(),
        vec![
            ("id", Value::BigInt(1).into()),
            ("title", text("a").into()),
            ("code", text("D-1").into()),
            ("version", Value::Int(3).into()),
        ],
    );
    doc.set("title", text("b")).unwrap();

    let result = block_on(async {
        unwrap_outcome(
            relate_operation::save(&cx, &conn, &registry, &[doc.clone()], OperationConfig::default())
                .await,
        )
    });

    let statements = conn.statements();
    assert_eq!(
        statements[0].0,
        "UPDATE \"docs\" SET \"title\" = $1, \"version\" = $2 WHERE \"id\" = $3 AND \"version\" = $4"
    );
    assert_eq!(
        statements[0].1,
        vec![text("b"), Value::Int(4), Value::BigInt(1), Value::Int(3)]
    );
    assert_eq!(result.updated, 1);
    assert_eq!(doc.get_value("version").unwrap(), Value::Int(4));
    assert!(!doc.is_modified("title"));
}

#[test]
fn stale_version_is_an_optimistic_lock_error() {
    let registry = docs();
    let conn = MockConnection::new(Dialect::Postgres);
    conn.respond_affected("UPDATE \"docs\"", 0);
    let cx = Cx::for_testing();

    let doc = EntityRef::from_store(
        registry.entity("Doc").unwrap(),
        vec![
            ("id", Value::BigInt(1).into()),
            ("title", text("a").into()),
            ("code", text("D-1").into()),
            ("version", Value::Int(3).into()),
        ],
    );
    doc.set("title", text("b")).unwrap();

    let err = block_on(async {
        expect_err(
            relate_operation::save(&cx, &conn, &registry, &[doc.clone()], OperationConfig::default())
                .await,
        )
    });

    assert!(err.is_retryable());
    match err {
        Error::OptimisticLock(lock) => {
            assert_eq!(lock.entity, "Doc");
            assert_eq!(lock.expected_version, 3);
        }
        other => panic!("expected an optimistic lock error, got {other:?}"),
    }
    assert!(doc.is_modified("title"));
}

#[test]
fn non_updatable_change_is_rolled_back() {
    let registry = docs();
    let conn = MockConnection::new(Dialect::Postgres);
    let cx = Cx::for_testing();

    let doc = EntityRef::from_store(
        registry.entity("Doc").unwrap(),
        vec![
            ("id", Value::BigInt(1).into()),
            ("title", text("a").into()),
            ("code", text("D-1").into()),
            ("version", Value::Int(1).into()),
        ],
    );
    doc.set("code", text("D-2")).unwrap();
    doc.set("title", text("b")).unwrap();

    block_on(async {
        unwrap_outcome(
            relate_operation::save(&cx, &conn, &registry, &[doc.clone()], OperationConfig::default())
                .await,
        )
    });

    let sql = conn.sql();
    assert_eq!(sql.len(), 1);
    assert!(!sql[0].contains("\"code\""));
    assert_eq!(doc.get_value("code").unwrap(), text("D-1"));
}

fn unversioned() -> Arc<MetadataRegistry> {
    Arc::new(
        MetadataRegistry::builder()
            .entity(
                EntityType::new("Note", "notes")
                    .property(PropertyInfo::new("id", SqlType::BigInt).primary_key())
                    .property(PropertyInfo::new("body", SqlType::Text)),
            )
            .build()
            .unwrap(),
    )
}

#[test]
fn zero_row_update_follows_policy() {
    let registry = unversioned();
    let cx = Cx::for_testing();
    let note = || {
        let note = EntityRef::reference(registry.entity("Note").unwrap(), 9_i64).unwrap();
        note.set("body", text("x")).unwrap();
        note
    };

    let conn = MockConnection::new(Dialect::Postgres);
    conn.respond_affected("UPDATE", 0);
    let err = block_on(async {
        expect_err(
            relate_operation::save(&cx, &conn, &registry, &[note()], OperationConfig::default())
                .await,
        )
    });
    match err {
        Error::Query(q) => assert_eq!(q.kind, QueryErrorKind::NotFound),
        other => panic!("expected a not-found error, got {other:?}"),
    }

    let conn = MockConnection::new(Dialect::Postgres);
    conn.respond_affected("UPDATE", 0);
    let config = OperationConfig::new().with_zero_rows(ZeroRowsPolicy::Ignore);
    let result = block_on(async {
        unwrap_outcome(relate_operation::save(&cx, &conn, &registry, &[note()], config).await)
    });
    assert_eq!(result.updated, 1);
}

#[test]
fn unmodified_reference_writes_nothing() {
    let registry = unversioned();
    let conn = MockConnection::new(Dialect::Postgres);
    let cx = Cx::for_testing();
    let note = EntityRef::reference(registry.entity("Note").unwrap(), 9_i64).unwrap();

    let result = block_on(async {
        unwrap_outcome(
            relate_operation::save(&cx, &conn, &registry, &[note], OperationConfig::default())
                .await,
        )
    });

    assert!(conn.sql().is_empty());
    assert_eq!(result.waves, 0);
}

#[test]
fn removed_required_member_is_deleted() {
    let registry = teams();
    let conn = MockConnection::new(Dialect::Postgres);
    let cx = Cx::for_testing();

    let team = EntityRef::new(registry.entity("Team").unwrap());
    team.set("name", text("core")).unwrap();
    let a = EntityRef::new(registry.entity("Member").unwrap());
    a.set("name", text("a")).unwrap();
    let b = EntityRef::new(registry.entity("Member").unwrap());
    b.set("name", text("b")).unwrap();
    team.set_foreign_table("members", vec![a.clone(), b.clone()])
        .unwrap();

    block_on(async {
        let first = unwrap_outcome(
            relate_operation::save(&cx, &conn, &registry, &[team.clone()], OperationConfig::default())
                .await,
        );
        assert_eq!(first.inserted, 3);
        assert_eq!(a.get_value("team").unwrap(), Value::BigInt(1));

        team.set_foreign_table("members", vec![a.clone()]).unwrap();
        let second = unwrap_outcome(
            relate_operation::save(&cx, &conn, &registry, &[team.clone()], OperationConfig::default())
                .await,
        );
        assert_eq!(second.deleted, 1);
        assert_eq!(second.statements, 1);
    });

    let sql = conn.sql();
    assert_eq!(sql.last().unwrap(), "DELETE FROM \"members\" WHERE \"id\" IN ($1)");
    assert_eq!(conn.statements().last().unwrap().1, vec![Value::BigInt(3)]);
    assert!(b.is_deleted());
    assert!(!a.is_deleted());
}

fn nodes() -> Arc<MetadataRegistry> {
    Arc::new(
        MetadataRegistry::builder()
            .entity(
                EntityType::new("Node", "nodes")
                    .property(
                        PropertyInfo::new("id", SqlType::BigInt)
                            .primary_key()
                            .generated(GeneratedValue::AutoIncrement),
                    )
                    .property(
                        PropertyInfo::new("next", SqlType::BigInt)
                            .foreign_key(ForeignKeyInfo::new("Node").optional(true)),
                    ),
            )
            .build()
            .unwrap(),
    )
}

#[test]
fn insert_cycle_is_rejected() {
    let registry = nodes();
    let conn = MockConnection::new(Dialect::Postgres);
    let cx = Cx::for_testing();

    let a = EntityRef::new(registry.entity("Node").unwrap());
    let b = EntityRef::new(registry.entity("Node").unwrap());
    a.set("next", &b).unwrap();
    b.set("next", &a).unwrap();

    let err = block_on(async {
        expect_err(
            relate_operation::save(&cx, &conn, &registry, &[a.clone()], OperationConfig::default())
                .await,
        )
    });

    match err {
        Error::Dependency(DependencyError::Cycle { path }) => {
            assert!(path.len() >= 3);
            assert_eq!(path.first(), path.last());
        }
        other => panic!("expected a cycle error, got {other:?}"),
    }
    assert!(conn.sql().is_empty());
    assert!(!a.is_persisted());
}

#[test]
fn sequence_without_dialect_support_is_a_config_error() {
    let registry = Arc::new(
        MetadataRegistry::builder()
            .entity(
                EntityType::new("Invoice", "invoices")
                    .property(
                        PropertyInfo::new("id", SqlType::BigInt)
                            .primary_key()
                            .generated(GeneratedValue::Sequence("invoice_seq")),
                    )
                    .property(PropertyInfo::new("total", SqlType::BigInt)),
            )
            .build()
            .unwrap(),
    );
    let cx = Cx::for_testing();
    let invoice = || {
        let invoice = EntityRef::new(registry.entity("Invoice").unwrap());
        invoice.set("total", Value::BigInt(10)).unwrap();
        invoice
    };

    let sqlite = MockConnection::new(Dialect::Sqlite);
    let err = block_on(async {
        expect_err(
            relate_operation::save(&cx, &sqlite, &registry, &[invoice()], OperationConfig::default())
                .await,
        )
    });
    assert!(matches!(err, Error::Config(_)));
    assert!(sqlite.sql().is_empty());

    let postgres = MockConnection::new(Dialect::Postgres);
    let saved = invoice();
    block_on(async {
        unwrap_outcome(
            relate_operation::save(
                &cx,
                &postgres,
                &registry,
                &[saved.clone()],
                OperationConfig::default(),
            )
            .await,
        )
    });
    assert_eq!(
        postgres.sql(),
        vec![
            "INSERT INTO \"invoices\" (\"id\", \"total\") VALUES (nextval('invoice_seq'), $1) RETURNING \"id\""
                .to_string()
        ]
    );
    assert_eq!(saved.id(), Some(Value::BigInt(1)));
}

#[test]
fn unknown_entity_type_is_rejected() {
    let registry = teams();
    let other = docs();
    let conn = MockConnection::new(Dialect::Postgres);
    let cx = Cx::for_testing();
    let doc = EntityRef::new(other.entity("Doc").unwrap());

    let err = block_on(async {
        expect_err(
            relate_operation::save(&cx, &conn, &registry, &[doc], OperationConfig::default()).await,
        )
    });
    assert!(err.is_programming_error());
}

/// A loaded team with one stored member, and that member.
fn stored_team(registry: &Arc<MetadataRegistry>) -> (EntityRef, EntityRef) {
    let team = EntityRef::from_store(
        registry.entity("Team").unwrap(),
        vec![("id", Value::BigInt(1).into()), ("name", text("core").into())],
    );
    let member = EntityRef::from_store(
        registry.entity("Member").unwrap(),
        vec![
            ("id", Value::BigInt(2).into()),
            ("name", text("m").into()),
            ("team", (&team).into()),
        ],
    );
    team.set_foreign_table("members", vec![member.clone()])
        .unwrap();
    (team, member)
}

#[test]
fn moved_member_leaves_optional_team_in_place() {
    let registry = teams();
    let conn = MockConnection::new(Dialect::Postgres);
    let cx = Cx::for_testing();
    let (team, member) = stored_team(&registry);
    let other = EntityRef::reference(registry.entity("Team").unwrap(), 5_i64).unwrap();
    member.set("team", &other).unwrap();

    let result = block_on(async {
        unwrap_outcome(
            relate_operation::save(&cx, &conn, &registry, &[member.clone()], OperationConfig::default())
                .await,
        )
    });

    let statements = conn.statements();
    assert_eq!(statements.len(), 1);
    assert_eq!(
        statements[0].0,
        "UPDATE \"members\" SET \"team_id\" = $1 WHERE \"id\" = $2"
    );
    assert_eq!(statements[0].1, vec![Value::BigInt(5), Value::BigInt(2)]);
    assert_eq!(result.updated, 1);
    assert_eq!(result.deleted, 0);

    assert!(!team.is_deleted());
    assert!(
        team.foreign_table("members")
            .unwrap()
            .unwrap()
            .entities()
            .is_empty()
    );
    assert_eq!(member.get_value("team").unwrap(), Value::BigInt(5));
    assert!(member.modified_fields().is_empty());
}

/// Like `teams()`, but a team cannot exist without its members.
fn required_teams() -> Arc<MetadataRegistry> {
    Arc::new(
        MetadataRegistry::builder()
            .entity(
                EntityType::new("Team", "teams")
                    .property(generated_id())
                    .property(PropertyInfo::new("name", SqlType::Text))
                    .foreign_table(
                        ForeignTableInfo::collection("members", "Member", "team").optional(false),
                    ),
            )
            .entity(
                EntityType::new("Member", "members")
                    .property(generated_id())
                    .property(PropertyInfo::new("name", SqlType::Text))
                    .property(
                        PropertyInfo::new("team", SqlType::BigInt)
                            .column("team_id")
                            .foreign_key(ForeignKeyInfo::new("Team")),
                    ),
            )
            .build()
            .unwrap(),
    )
}

#[test]
fn moved_member_deletes_required_previous_team() {
    let registry = required_teams();
    let conn = MockConnection::new(Dialect::Postgres);
    let cx = Cx::for_testing();
    let (team, member) = stored_team(&registry);
    let other = EntityRef::reference(registry.entity("Team").unwrap(), 5_i64).unwrap();
    member.set("team", &other).unwrap();

    let result = block_on(async {
        unwrap_outcome(
            relate_operation::save(&cx, &conn, &registry, &[member.clone()], OperationConfig::default())
                .await,
        )
    });

    // the member row is rewritten before its old team goes away
    assert_eq!(
        conn.sql(),
        vec![
            "UPDATE \"members\" SET \"team_id\" = $1 WHERE \"id\" = $2".to_string(),
            "DELETE FROM \"teams\" WHERE \"id\" IN ($1)".to_string(),
        ]
    );
    assert_eq!(conn.statements()[1].1, vec![Value::BigInt(1)]);
    assert_eq!(result.updated, 1);
    assert_eq!(result.deleted, 1);
    assert_eq!(result.waves, 2);
    assert!(team.is_deleted());
    assert!(!member.is_deleted());
    assert!(!other.is_deleted());
}

#[test]
fn scalar_inverse_member_points_back_at_new_owner() {
    let registry = accounts(false);
    let conn = MockConnection::new(Dialect::Postgres);
    let cx = Cx::for_testing();

    let user = EntityRef::new(registry.entity("User").unwrap());
    user.set("name", text("ann")).unwrap();
    let profile = EntityRef::new(registry.entity("Profile").unwrap());
    profile.set("bio", text("hi")).unwrap();
    user.set_foreign_table("profile", &profile).unwrap();

    let result = block_on(async {
        unwrap_outcome(
            relate_operation::save(&cx, &conn, &registry, &[user.clone()], OperationConfig::default())
                .await,
        )
    });

    let statements = conn.statements();
    assert_eq!(
        statements[0].0,
        "INSERT INTO \"users\" (\"name\") VALUES ($1) RETURNING \"id\""
    );
    assert_eq!(
        statements[1].0,
        "INSERT INTO \"profiles\" (\"bio\", \"user_id\") VALUES ($1, $2) RETURNING \"id\""
    );
    assert_eq!(statements[1].1, vec![text("hi"), Value::BigInt(1)]);
    assert_eq!(result.inserted, 2);
    assert_eq!(result.waves, 2);
    assert_eq!(profile.get_value("user").unwrap(), Value::BigInt(1));
    assert!(profile.is_persisted());
}

fn tokens() -> Arc<MetadataRegistry> {
    Arc::new(
        MetadataRegistry::builder()
            .entity(
                EntityType::new("Token", "tokens")
                    .property(
                        PropertyInfo::new("id", SqlType::Text)
                            .primary_key()
                            .generated(GeneratedValue::RandomUuid),
                    )
                    .property(PropertyInfo::new("name", SqlType::Text)),
            )
            .build()
            .unwrap(),
    )
}

#[test]
fn random_uuid_is_generated_by_client_without_server_support() {
    let registry = tokens();
    let cx = Cx::for_testing();
    let token = || {
        let token = EntityRef::new(registry.entity("Token").unwrap());
        token.set("name", text("api")).unwrap();
        token
    };

    let sqlite = MockConnection::new(Dialect::Sqlite);
    let local = token();
    block_on(async {
        unwrap_outcome(
            relate_operation::save(&cx, &sqlite, &registry, &[local.clone()], OperationConfig::default())
                .await,
        )
    });
    let statements = sqlite.statements();
    assert_eq!(
        statements[0].0,
        "INSERT INTO \"tokens\" (\"id\", \"name\") VALUES (?1, ?2)"
    );
    let Value::Text(id) = &statements[0].1[0] else {
        panic!("expected a text uuid, got {:?}", statements[0].1[0]);
    };
    assert_eq!(id.len(), 36);
    assert_eq!(id.as_bytes()[14], b'4');
    assert_eq!(local.id(), Some(Value::Text(id.clone())));
    assert!(local.is_persisted());

    let postgres = MockConnection::new(Dialect::Postgres);
    block_on(async {
        unwrap_outcome(
            relate_operation::save(&cx, &postgres, &registry, &[token()], OperationConfig::default())
                .await,
        )
    });
    assert_eq!(
        postgres.sql(),
        vec![
            "INSERT INTO \"tokens\" (\"id\", \"name\") VALUES (gen_random_uuid(), $1) RETURNING \"id\""
                .to_string()
        ]
    );
}

#[test]
fn insert_batch_shares_one_timestamp() {
    let registry = Arc::new(
        MetadataRegistry::builder()
            .entity(
                EntityType::new("Event", "events")
                    .property(generated_id())
                    .property(PropertyInfo::new("name", SqlType::Text))
                    .property(PropertyInfo::new("created_at", SqlType::Timestamp).created_date())
                    .property(
                        PropertyInfo::new("updated_at", SqlType::Timestamp).last_modified_date(),
                    ),
            )
            .build()
            .unwrap(),
    );
    let conn = MockConnection::new(Dialect::Postgres);
    let cx = Cx::for_testing();
    let events: Vec<EntityRef> = ["a", "b", "c"]
        .iter()
        .map(|name| {
            let event = EntityRef::new(registry.entity("Event").unwrap());
            event.set("name", text(name)).unwrap();
            event
        })
        .collect();

    block_on(async {
        unwrap_outcome(
            relate_operation::save(&cx, &conn, &registry, &events, OperationConfig::default()).await,
        )
    });

    let statements = conn.statements();
    assert_eq!(statements.len(), 1);
    assert_eq!(
        statements[0].0,
        "INSERT INTO \"events\" (\"name\", \"created_at\", \"updated_at\") \
         VALUES ($1, $2, $3), ($4, $5, $6), ($7, $8, $9) RETURNING \"id\""
    );
    let params = &statements[0].1;
    let stamp = params[1].clone();
    assert!(matches!(stamp, Value::Timestamp(_)));
    for i in [2, 4, 5, 7, 8] {
        assert_eq!(params[i], stamp);
    }
    for event in &events {
        assert_eq!(event.get_value("created_at").unwrap(), stamp);
        assert_eq!(event.get_value("updated_at").unwrap(), stamp);
    }
}

#[test]
fn connection_failure_surfaces_unchanged() {
    let registry = teams();
    let conn = MockConnection::new(Dialect::Postgres);
    conn.fail_on("INSERT INTO \"members\"");
    let cx = Cx::for_testing();

    let team = EntityRef::new(registry.entity("Team").unwrap());
    team.set("name", text("core")).unwrap();
    let member = EntityRef::new(registry.entity("Member").unwrap());
    member.set("name", text("x")).unwrap();
    member.set("team", &team).unwrap();

    let err = block_on(async {
        expect_err(
            relate_operation::save(&cx, &conn, &registry, &[member.clone()], OperationConfig::default())
                .await,
        )
    });

    match &err {
        Error::Connection(e) => assert_eq!(e.kind, ConnectionErrorKind::Disconnected),
        other => panic!("expected a connection error, got {other:?}"),
    }
    assert!(!err.is_retryable());
    assert_eq!(conn.sql().len(), 2);
    // the earlier wave stays applied
    assert!(team.is_persisted());
    assert_eq!(team.id(), Some(Value::BigInt(1)));
    assert!(!member.is_persisted());
}
