//! Insert and update cascade.
//!
//! A save request inserts a non-persisted instance or updates the modified
//! properties of a persisted one. Processing follows foreign keys (targets
//! that are not persisted yet are saved first) and loaded inverse fields
//! (added members point back at the owner, removed members are deleted or
//! detached).

use crate::config::ZeroRowsPolicy;
use crate::delete::DeleteProcessor;
use crate::instance::{InstanceProcessor, InstanceRequests, describe};
use crate::operation::OperationContext;
use crate::request::{RequestId, RequestKind};
use crate::statement::{Completion, Exec, SqlWriter, Statement, StatementOutput};
use relate_core::{
    ConfigError, Dialect, EntityRef, EntityType, Error, FieldValue, ForeignTableInfo,
    GeneratedValue, ModelAccessErrorKind, OnForeignDeleted, OptimisticLockError, PropertyInfo,
    QueryError, QueryErrorKind, Result, Value,
};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Default)]
pub(crate) struct SaveProcessor {
    pub(crate) requests: InstanceRequests,
}

impl InstanceProcessor for SaveProcessor {
    const KIND: RequestKind = RequestKind::Save;

    fn requests(ctx: &OperationContext) -> &InstanceRequests {
        &ctx.saves.requests
    }

    fn requests_mut(ctx: &mut OperationContext) -> &mut InstanceRequests {
        &mut ctx.saves.requests
    }

    /// A persisted instance that was never loaded has nothing to write
    /// unless it was changed through its handle.
    fn initially_to_process(instance: &EntityRef) -> bool {
        !instance.is_persisted() || instance.is_loaded() || !instance.modified_fields().is_empty()
    }

    fn do_process(
        _ctx: &mut OperationContext,
        _request: RequestId,
        _instance: &EntityRef,
    ) -> Result<bool> {
        Ok(true)
    }

    fn process_foreign_key(
        ctx: &mut OperationContext,
        request: RequestId,
        instance: &EntityRef,
        fk: &PropertyInfo,
        inverse: Option<ForeignTableInfo>,
    ) -> Result<()> {
        let current = instance.get(fk.name)?;
        if instance.is_persisted() && instance.is_modified(fk.name) {
            if let Some(original) = instance.persisted_value(fk.name) {
                if original != current {
                    orphan_previous_target(ctx, request, instance, fk, inverse, &original)?;
                }
            }
        }

        let FieldValue::Entity(target) = current else {
            return Ok(());
        };
        let context_only =
            target.is_persisted() && !target.is_loaded() && target.modified_fields().is_empty();
        let target_request = if context_only {
            Self::add_to_not_process(ctx, &target)?
        } else {
            Self::add_to_process(ctx, &target)?
        };
        if !target.is_persisted() {
            // the generated id must exist before this row references it
            ctx.graph.depends_on(request, target_request)?;
        }
        Ok(())
    }

    fn process_foreign_table_field(
        ctx: &mut OperationContext,
        request: RequestId,
        owner: &EntityRef,
        field: ForeignTableInfo,
        value: Option<FieldValue>,
    ) -> Result<()> {
        let Some(value) = value else {
            return Ok(());
        };
        let registry = Arc::clone(&ctx.registry);
        let member_ty = registry.entity(field.target)?;
        let fk = member_ty.require_property(field.join_key)?;
        let Some(fk_info) = fk.foreign_key else {
            return Ok(());
        };
        let owner_ref = FieldValue::Entity(owner.clone());
        let current = value.entities();
        let original = owner
            .persisted_foreign_table(field.field)
            .map(|v| v.entities())
            .unwrap_or_default();

        for removed in original
            .iter()
            .filter(|o| !current.iter().any(|c| c.same_row(o)))
        {
            if removed.is_deleted() {
                continue;
            }
            let removed = ctx.cache.resolve(removed);
            if removed.get(fk.name)? != owner_ref {
                // moved to another owner; its own save writes the new link
                Self::add_to_process(ctx, &removed)?;
                continue;
            }
            if !fk_info.optional || fk_info.on_foreign_deleted == OnForeignDeleted::Delete {
                tracing::debug!(
                    owner = %describe(owner),
                    member = %describe(&removed),
                    field = field.field,
                    "Removed member deleted"
                );
                DeleteProcessor::add_to_process(ctx, &removed)?;
            } else {
                removed.set(fk.name, FieldValue::NULL)?;
                Self::add_to_process(ctx, &removed)?;
            }
        }

        for member in current {
            let member = ctx.cache.resolve(&member);
            if member.get(fk.name)? != owner_ref {
                member.set(fk.name, owner_ref.clone())?;
            }
            let member_request = Self::add_to_process(ctx, &member)?;
            if !owner.is_persisted() {
                ctx.graph.depends_on(member_request, request)?;
            }
        }
        Ok(())
    }

    fn do_requests(
        ctx: &mut OperationContext,
        ty: &Arc<EntityType>,
        batch: Vec<(RequestId, EntityRef)>,
    ) -> Result<Vec<Statement>> {
        let now = now_micros();
        let (inserts, updates): (Vec<_>, Vec<_>) =
            batch.into_iter().partition(|(_, e)| !e.is_persisted());
        let mut statements = insert_statements(ctx, ty, inserts, now)?;
        for (request, instance) in updates {
            if let Some(statement) = update_statement(ctx, ty, request, instance, now)? {
                statements.push(statement);
            }
        }
        Ok(statements)
    }
}

/// The foreign key of a persisted instance now points elsewhere; deal with
/// the row it pointed at before.
fn orphan_previous_target(
    ctx: &mut OperationContext,
    request: RequestId,
    instance: &EntityRef,
    fk: &PropertyInfo,
    inverse: Option<ForeignTableInfo>,
    original: &FieldValue,
) -> Result<()> {
    let Some(fk_info) = fk.foreign_key else {
        return Ok(());
    };
    let previous = match original {
        FieldValue::Entity(e) => Some(ctx.cache.resolve(e)),
        FieldValue::Value(v) if !v.is_null() => ctx.cache.find(fk_info.target, v),
        _ => None,
    };
    let Some(previous) = previous else {
        return Ok(());
    };
    if let Some(pending) = DeleteProcessor::requests(ctx).get(&previous) {
        // the old target goes away anyway; rewrite this row first
        return ctx.graph.depends_on(pending, request);
    }
    if !previous.is_loaded() || previous.is_deleted() {
        return Ok(());
    }
    if let Some(ft) = inverse {
        previous.detach_foreign_table(ft.field, instance)?;
    }
    let must_delete = fk_info.cascade_delete || inverse.is_some_and(|ft| !ft.optional);
    if must_delete {
        tracing::debug!(
            instance = %describe(instance),
            previous = %describe(&previous),
            property = fk.name,
            "Orphaned target deleted"
        );
        let delete = DeleteProcessor::add_to_process(ctx, &previous)?;
        ctx.graph.depends_on(delete, request)?;
    }
    Ok(())
}

#[derive(Debug)]
enum InsertValue {
    Bind(Value),
    /// SQL expression evaluated by the database
    Expr(String),
}

#[derive(Debug)]
struct PreparedRow {
    request: RequestId,
    instance: EntityRef,
    values: Vec<InsertValue>,
}

/// Rows sharing the same column list and generated columns.
#[derive(Debug)]
struct InsertShape {
    columns: Vec<&'static str>,
    read_back: Vec<&'static str>,
    rows: Vec<PreparedRow>,
}

fn insert_statements(
    ctx: &OperationContext,
    ty: &Arc<EntityType>,
    inserts: Vec<(RequestId, EntityRef)>,
    now: i64,
) -> Result<Vec<Statement>> {
    let dialect = ctx.dialect;
    let mut shapes: Vec<InsertShape> = Vec::new();
    for (request, instance) in inserts {
        let mut columns = Vec::with_capacity(ty.properties.len());
        let mut values = Vec::with_capacity(ty.properties.len());
        let mut read_back = Vec::new();
        for prop in &ty.properties {
            let current = instance.get_value(prop.name)?;
            let value = match prop.generated {
                Some(_) if !current.is_null() => InsertValue::Bind(current),
                Some(GeneratedValue::AutoIncrement) => {
                    read_back.push(prop.name);
                    continue;
                }
                Some(GeneratedValue::Sequence(sequence)) => {
                    let expr = dialect.sequence_next_value(sequence).ok_or_else(|| {
                        Error::Config(ConfigError {
                            message: format!(
                                "{:?} has no sequences; cannot generate {}.{} from '{}'",
                                dialect, ty.name, prop.name, sequence
                            ),
                            source: None,
                        })
                    })?;
                    read_back.push(prop.name);
                    InsertValue::Expr(expr)
                }
                Some(GeneratedValue::RandomUuid) => {
                    if let Some(function) = dialect.uuid_function() {
                        read_back.push(prop.name);
                        InsertValue::Expr(function.to_string())
                    } else {
                        let value = prop.sql_type.uuid_value(random_uuid())?;
                        instance.assign(prop.name, value.clone())?;
                        InsertValue::Bind(value)
                    }
                }
                None if prop.version => {
                    let value = prop.sql_type.integer_value(1)?;
                    instance.assign(prop.name, value.clone())?;
                    InsertValue::Bind(value)
                }
                None if prop.created_date || prop.last_modified_date => {
                    let value = prop.sql_type.timestamp_value(now)?;
                    instance.assign(prop.name, value.clone())?;
                    InsertValue::Bind(value)
                }
                None => InsertValue::Bind(current),
            };
            columns.push(prop.column);
            values.push(value);
        }

        let row = PreparedRow {
            request,
            instance,
            values,
        };
        match shapes
            .iter_mut()
            .find(|s| s.columns == columns && s.read_back == read_back)
        {
            Some(shape) => shape.rows.push(row),
            None => shapes.push(InsertShape {
                columns,
                read_back,
                rows: vec![row],
            }),
        }
    }

    let mut statements = Vec::new();
    for shape in shapes {
        let returning = !shape.read_back.is_empty() && dialect.supports_returning();
        let multi_row = ctx.config.multi_row_insert
            && dialect.supports_multiple_insert()
            && !shape.columns.is_empty()
            && (shape.read_back.is_empty() || returning);
        let chunk = if multi_row { ctx.config.chunk_size() } else { 1 };
        let mut rows = shape.rows.into_iter().peekable();
        while rows.peek().is_some() {
            let chunk_rows: Vec<PreparedRow> = rows.by_ref().take(chunk).collect();
            statements.push(render_insert(
                dialect,
                ty,
                &shape.columns,
                &shape.read_back,
                returning,
                chunk_rows,
            ));
        }
    }
    Ok(statements)
}

fn render_insert(
    dialect: Dialect,
    ty: &Arc<EntityType>,
    columns: &[&'static str],
    read_back: &[&'static str],
    returning: bool,
    rows: Vec<PreparedRow>,
) -> Statement {
    let mut w = SqlWriter::new(dialect);
    w.push("INSERT INTO ").ident(ty.table);
    let mut requests = Vec::with_capacity(rows.len());
    if columns.is_empty() {
        match dialect {
            Dialect::Mysql => w.push(" () VALUES ()"),
            Dialect::Postgres | Dialect::Sqlite => w.push(" DEFAULT VALUES"),
        };
        requests.extend(rows.into_iter().map(|r| (r.request, r.instance)));
    } else {
        w.push(" (");
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.ident(column);
        }
        w.push(") VALUES ");
        for (r, row) in rows.into_iter().enumerate() {
            if r > 0 {
                w.push(", ");
            }
            w.push("(");
            for (i, value) in row.values.into_iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                match value {
                    InsertValue::Bind(v) => w.bind(v),
                    InsertValue::Expr(e) => w.push(&e),
                };
            }
            w.push(")");
            requests.push((row.request, row.instance));
        }
    }
    if returning {
        w.push(" RETURNING ");
        for (i, name) in read_back.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            let column = ty.property_named(name).map_or(*name, |p| p.column);
            w.ident(column);
        }
    }
    let exec = if read_back.is_empty() {
        Exec::Execute
    } else if returning {
        Exec::Query
    } else {
        Exec::Insert
    };
    w.build(
        exec,
        Completion::Insert(InsertBatch {
            entity: Arc::clone(ty),
            rows: requests,
            read_back: read_back.to_vec(),
        }),
    )
}

/// Instances written by one INSERT, in row order.
#[derive(Debug)]
pub(crate) struct InsertBatch {
    entity: Arc<EntityType>,
    rows: Vec<(RequestId, EntityRef)>,
    /// Properties whose value the database generated
    read_back: Vec<&'static str>,
}

impl InsertBatch {
    pub(crate) fn complete(
        self,
        ctx: &mut OperationContext,
        sql: &str,
        output: StatementOutput,
    ) -> Result<()> {
        match output {
            StatementOutput::Rows(rows) => {
                if rows.len() != self.rows.len() {
                    return Err(Error::Query(QueryError {
                        kind: QueryErrorKind::Database,
                        sql: Some(sql.to_string()),
                        sqlstate: None,
                        message: format!(
                            "insert returned {} rows for {} instances",
                            rows.len(),
                            self.rows.len()
                        ),
                        source: None,
                    }));
                }
                for ((_, instance), row) in self.rows.iter().zip(&rows) {
                    for name in &self.read_back {
                        let prop = self.entity.require_property(name)?;
                        instance.assign(name, row.require(prop.column)?.clone())?;
                    }
                }
            }
            StatementOutput::LastId(id) => {
                if let (Some((_, instance)), Some(name)) = (self.rows.first(), self.read_back.first())
                {
                    let prop = self.entity.require_property(name)?;
                    instance.assign(name, prop.sql_type.integer_value(id)?)?;
                }
            }
            StatementOutput::Affected(_) => {}
        }

        for (request, instance) in &self.rows {
            instance.mark_saved();
            ctx.cache.register(instance);
            ctx.graph.mark_executed(*request);
        }
        ctx.result.inserted += self.rows.len();
        tracing::debug!(
            entity = self.entity.name,
            rows = self.rows.len(),
            "Rows inserted"
        );
        Ok(())
    }
}

#[derive(Debug)]
struct VersionGuard {
    property: &'static str,
    expected: i64,
    next: Value,
}

fn update_statement(
    ctx: &mut OperationContext,
    ty: &Arc<EntityType>,
    request: RequestId,
    instance: EntityRef,
    now: i64,
) -> Result<Option<Statement>> {
    let mut assignments: Vec<(&'static str, Value)> = Vec::new();
    for name in instance.modified_fields() {
        let Some(prop) = ty.property_named(name) else {
            continue;
        };
        if !prop.updatable || prop.version || prop.primary_key {
            instance.restore_persisted(name)?;
            tracing::debug!(
                entity = ty.name,
                property = name,
                "Change to non-updatable property rolled back"
            );
            continue;
        }
        assignments.push((prop.column, instance.get_value(name)?));
    }
    if assignments.is_empty() {
        instance.mark_saved();
        ctx.graph.mark_executed(request);
        tracing::trace!(instance = %describe(&instance), "No column to update");
        return Ok(None);
    }
    for prop in ty
        .properties
        .iter()
        .filter(|p| p.last_modified_date && !instance.is_modified(p.name))
    {
        let value = prop.sql_type.timestamp_value(now)?;
        instance.assign(prop.name, value.clone())?;
        assignments.push((prop.column, value));
    }

    let mut w = SqlWriter::new(ctx.dialect);
    w.push("UPDATE ").ident(ty.table).push(" SET ");
    for (i, (column, value)) in assignments.into_iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.ident(column).push(" = ").bind(value);
    }

    let mut guard = None;
    if let Some(vp) = ty.version_property() {
        w.push(", ");
        let current = instance
            .persisted_value(vp.name)
            .and_then(|v| v.column_value().as_i64());
        match current {
            Some(expected) => {
                let next = vp.sql_type.integer_value(expected + 1)?;
                w.ident(vp.column).push(" = ").bind(next.clone());
                guard = Some((
                    vp.column,
                    vp.sql_type.integer_value(expected)?,
                    VersionGuard {
                        property: vp.name,
                        expected,
                        next,
                    },
                ));
            }
            None => {
                w.ident(vp.column).push(" = ").ident(vp.column).push(" + 1");
            }
        }
    }

    w.push(" WHERE ");
    write_row_match(&mut w, ty, &instance)?;
    let version = guard.map(|(column, expected, version)| {
        w.push(" AND ").equals(column, expected);
        version
    });

    Ok(Some(w.build(
        Exec::Execute,
        Completion::Update(UpdateTarget {
            request,
            instance,
            version,
        }),
    )))
}

/// Criteria matching the stored row of `instance`: its id, or every stored
/// value for a type without id.
pub(crate) fn write_row_match(w: &mut SqlWriter, ty: &EntityType, instance: &EntityRef) -> Result<()> {
    if let Some(id_prop) = ty.id_property() {
        let id = instance
            .persisted_value(id_prop.name)
            .map(|v| v.column_value())
            .filter(|v| !v.is_null())
            .or_else(|| instance.id())
            .ok_or_else(|| missing_id(instance))?;
        w.equals(id_prop.column, id);
        return Ok(());
    }
    let mut first = true;
    for prop in &ty.properties {
        let Some(value) = instance.persisted_value(prop.name) else {
            continue;
        };
        if !first {
            w.push(" AND ");
        }
        first = false;
        w.equals(prop.column, value.column_value());
    }
    if first {
        return Err(missing_id(instance));
    }
    Ok(())
}

fn missing_id(instance: &EntityRef) -> Error {
    Error::model(
        ModelAccessErrorKind::MissingId,
        instance.type_name(),
        None,
        "persisted instance has no stored identity",
    )
}

/// A persisted instance written by one UPDATE.
#[derive(Debug)]
pub(crate) struct UpdateTarget {
    request: RequestId,
    instance: EntityRef,
    version: Option<VersionGuard>,
}

impl UpdateTarget {
    pub(crate) fn complete(
        self,
        ctx: &mut OperationContext,
        sql: &str,
        output: &StatementOutput,
    ) -> Result<()> {
        if output.affected(sql)? == 0 {
            if let Some(version) = &self.version {
                let ty = self.instance.entity_type();
                return Err(Error::OptimisticLock(OptimisticLockError {
                    entity: ty.name.to_string(),
                    table: ty.table.to_string(),
                    expected_version: version.expected,
                    rows: 1,
                }));
            }
            match ctx.config.zero_rows {
                ZeroRowsPolicy::Error => {
                    return Err(Error::Query(QueryError {
                        kind: QueryErrorKind::NotFound,
                        sql: Some(sql.to_string()),
                        sqlstate: None,
                        message: format!("update of {} matched no row", describe(&self.instance)),
                        source: None,
                    }));
                }
                ZeroRowsPolicy::Ignore => {
                    tracing::warn!(
                        instance = %describe(&self.instance),
                        "Update matched no row"
                    );
                }
            }
        }
        if let Some(version) = self.version {
            self.instance.assign(version.property, version.next)?;
        }
        self.instance.mark_saved();
        ctx.graph.mark_executed(self.request);
        ctx.result.updated += 1;
        Ok(())
    }
}

/// Wall clock in microseconds since the Unix epoch.
fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
}

/// Random version 4 UUID.
fn random_uuid() -> [u8; 16] {
    let mut bytes: [u8; 16] = rand::random();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_uuid_has_version_and_variant_bits() {
        for _ in 0..16 {
            let bytes = random_uuid();
            assert_eq!(bytes[6] >> 4, 4);
            assert_eq!(bytes[8] >> 6, 0b10);
        }
    }

    #[test]
    fn now_is_after_2020() {
        assert!(now_micros() > 1_577_836_800_000_000);
    }
}
