#![allow(dead_code)]

use relate_core::{
    Connection, ConnectionError, ConnectionErrorKind, Cx, Dialect, EntityType, Error,
    ForeignKeyInfo, ForeignTableInfo, GeneratedValue, MetadataRegistry, OnForeignDeleted, Outcome,
    PropertyInfo, Row, SqlType, Value,
};
use std::sync::{Arc, Mutex};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

#[derive(Debug, Default)]
struct MockState {
    executed: Vec<(String, Vec<Value>)>,
    next_id: i64,
    selects: usize,
    /// (sql fragment, rows returned by a matching SELECT)
    rows: Vec<(String, Vec<Row>)>,
    /// (sql fragment, affected count reported by a matching statement)
    affected: Vec<(String, u64)>,
    /// Statements containing one of these fragments lose the connection
    failures: Vec<String>,
}

/// Connection that records every statement.
///
/// Generated ids count up from 1. `INSERT ... RETURNING` yields one row per
/// value tuple. Statements report one affected row unless configured
/// otherwise.
#[derive(Debug, Clone)]
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
    dialect: Dialect,
}

impl MockConnection {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            dialect,
        }
    }

    pub fn respond_rows(&self, fragment: &str, rows: Vec<Row>) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.rows.push((fragment.to_string(), rows));
    }

    pub fn respond_affected(&self, fragment: &str, affected: u64) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.affected.push((fragment.to_string(), affected));
    }

    pub fn fail_on(&self, fragment: &str) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.failures.push(fragment.to_string());
    }

    pub fn statements(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().expect("lock poisoned").executed.clone()
    }

    pub fn sql(&self) -> Vec<String> {
        self.statements().into_iter().map(|(sql, _)| sql).collect()
    }

    pub fn selects(&self) -> usize {
        self.state.lock().expect("lock poisoned").selects
    }

    fn record(&self, sql: &str, params: &[Value]) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.executed.push((sql.to_string(), params.to_vec()));
    }

    fn failure(&self, sql: &str) -> Option<Error> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .failures
            .iter()
            .any(|fragment| sql.contains(fragment.as_str()))
            .then(|| {
                Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Disconnected,
                    message: "connection reset by peer".to_string(),
                    source: None,
                })
            })
    }

    fn rows_for(&self, sql: &str) -> Vec<Row> {
        if sql.starts_with("INSERT") {
            let columns: Vec<String> = sql
                .split(" RETURNING ")
                .nth(1)
                .unwrap_or_default()
                .split(", ")
                .map(|c| c.trim_matches('"').to_string())
                .collect();
            let count = if sql.contains("DEFAULT VALUES") {
                1
            } else {
                sql.matches("), (").count() + 1
            };
            (0..count)
                .map(|_| {
                    let values = columns
                        .iter()
                        .map(|_| Value::BigInt(self.next_id()))
                        .collect();
                    Row::new(columns.clone(), values)
                })
                .collect()
        } else {
            let mut state = self.state.lock().expect("lock poisoned");
            state.selects += 1;
            state
                .rows
                .iter()
                .find(|(fragment, _)| sql.contains(fragment.as_str()))
                .map(|(_, rows)| rows.clone())
                .unwrap_or_default()
        }
    }

    fn affected_for(&self, sql: &str) -> u64 {
        let state = self.state.lock().expect("lock poisoned");
        state
            .affected
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map_or(1, |(_, n)| *n)
    }

    fn next_id(&self) -> i64 {
        let mut state = self.state.lock().expect("lock poisoned");
        state.next_id += 1;
        state.next_id
    }
}

impl Connection for MockConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        self.record(sql, params);
        let outcome = match self.failure(sql) {
            Some(err) => Outcome::Err(err),
            None => Outcome::Ok(self.rows_for(sql)),
        };
        async move { outcome }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        self.record(sql, params);
        let outcome = match self.failure(sql) {
            Some(err) => Outcome::Err(err),
            None => Outcome::Ok(self.affected_for(sql)),
        };
        async move { outcome }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        self.record(sql, params);
        let id = self.next_id();
        async move { Outcome::Ok(id) }
    }
}

pub fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

pub fn generated_id() -> PropertyInfo {
    PropertyInfo::new("id", SqlType::BigInt)
        .primary_key()
        .generated(GeneratedValue::AutoIncrement)
}

/// Team (1) <- (n) Member, Member.team is required.
pub fn teams() -> Arc<MetadataRegistry> {
    let registry = MetadataRegistry::builder()
        .entity(
            EntityType::new("Team", "teams")
                .property(generated_id())
                .property(PropertyInfo::new("name", SqlType::Text))
                .foreign_table(ForeignTableInfo::collection("members", "Member", "team")),
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
        .expect("valid team mapping");
    Arc::new(registry)
}

/// Owner (1) <- (n) Pet, Pet.owner is nulled when the owner is deleted.
pub fn owners() -> Arc<MetadataRegistry> {
    let registry = MetadataRegistry::builder()
        .entity(
            EntityType::new("Owner", "owners")
                .property(generated_id())
                .property(PropertyInfo::new("name", SqlType::Text)),
        )
        .entity(
            EntityType::new("Pet", "pets")
                .property(generated_id())
                .property(PropertyInfo::new("name", SqlType::Text))
                .property(
                    PropertyInfo::new("owner", SqlType::BigInt)
                        .column("owner_id")
                        .foreign_key(
                            ForeignKeyInfo::new("Owner")
                                .optional(true)
                                .on_foreign_deleted(OnForeignDeleted::SetNull),
                        ),
                ),
        )
        .build()
        .expect("valid owner mapping");
    Arc::new(registry)
}

/// Post (1) <- (n) Comment, optionally with Comment (1) <- (n) Reaction.
pub fn posts(with_reactions: bool) -> Arc<MetadataRegistry> {
    let mut builder = MetadataRegistry::builder()
        .entity(
            EntityType::new("Post", "posts")
                .property(generated_id())
                .property(PropertyInfo::new("title", SqlType::Text)),
        )
        .entity(
            EntityType::new("Comment", "comments")
                .property(generated_id())
                .property(PropertyInfo::new("body", SqlType::Text))
                .property(
                    PropertyInfo::new("post", SqlType::BigInt)
                        .column("post_id")
                        .foreign_key(ForeignKeyInfo::new("Post")),
                ),
        );
    if with_reactions {
        builder = builder.entity(
            EntityType::new("Reaction", "reactions")
                .property(generated_id())
                .property(
                    PropertyInfo::new("comment", SqlType::BigInt)
                        .column("comment_id")
                        .foreign_key(ForeignKeyInfo::new("Comment")),
                ),
        );
    }
    Arc::new(builder.build().expect("valid post mapping"))
}

/// Versioned documents.
pub fn docs() -> Arc<MetadataRegistry> {
    let registry = MetadataRegistry::builder()
        .entity(
            EntityType::new("Doc", "docs")
                .property(PropertyInfo::new("id", SqlType::BigInt).primary_key())
                .property(PropertyInfo::new("title", SqlType::Text))
                .property(PropertyInfo::new("code", SqlType::Text).updatable(false))
                .property(PropertyInfo::new("version", SqlType::Integer).version()),
        )
        .build()
        .expect("valid doc mapping");
    Arc::new(registry)
}

/// User (1) <- (1) Profile through the scalar inverse field `User.profile`.
pub fn accounts(profile_required: bool) -> Arc<MetadataRegistry> {
    let registry = MetadataRegistry::builder()
        .entity(
            EntityType::new("User", "users")
                .property(generated_id())
                .property(PropertyInfo::new("name", SqlType::Text))
                .foreign_table(
                    ForeignTableInfo::scalar("profile", "Profile", "user")
                        .optional(!profile_required),
                ),
        )
        .entity(
            EntityType::new("Profile", "profiles")
                .property(generated_id())
                .property(PropertyInfo::new("bio", SqlType::Text))
                .property(
                    PropertyInfo::new("user", SqlType::BigInt)
                        .column("user_id")
                        .foreign_key(ForeignKeyInfo::new("User")),
                ),
        )
        .build()
        .expect("valid account mapping");
    Arc::new(registry)
}
