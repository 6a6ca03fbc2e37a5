//! Entity metadata: properties, foreign keys and inverse ("foreign table") fields.
//!
//! Metadata is described with const builders and collected into a
//! [`MetadataRegistry`] once at startup. The registry validates the cascade
//! configuration as a whole, so an ambiguous mapping fails when the
//! application starts and never in the middle of a write.

use crate::error::{Error, ModelAccessErrorKind, Result};
use crate::types::SqlType;
use std::collections::HashMap;
use std::sync::Arc;

/// How a property value is produced when a row is inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratedValue {
    /// The database assigns the value; it is read back after the insert.
    AutoIncrement,
    /// The value is the next value of the named sequence, inlined in the INSERT.
    Sequence(&'static str),
    /// A random (v4) UUID, generated by the database when it can, otherwise locally.
    RandomUuid,
}

/// What happens to referencing rows when the referenced row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnForeignDeleted {
    /// Referencing rows are deleted as well.
    #[default]
    Delete,
    /// The foreign key of referencing rows is set to NULL.
    SetNull,
}

/// Foreign key annotation of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKeyInfo {
    /// Name of the referenced entity type.
    pub target: &'static str,
    /// Whether the reference may be absent.
    pub optional: bool,
    /// Deleting the referencing row also deletes the referenced row.
    pub cascade_delete: bool,
    pub on_foreign_deleted: OnForeignDeleted,
}

impl ForeignKeyInfo {
    pub const fn new(target: &'static str) -> Self {
        Self {
            target,
            optional: false,
            cascade_delete: false,
            on_foreign_deleted: OnForeignDeleted::Delete,
        }
    }

    pub const fn optional(mut self, value: bool) -> Self {
        self.optional = value;
        self
    }

    pub const fn cascade_delete(mut self, value: bool) -> Self {
        self.cascade_delete = value;
        self
    }

    pub const fn on_foreign_deleted(mut self, action: OnForeignDeleted) -> Self {
        self.on_foreign_deleted = action;
        self
    }
}

/// Metadata about one persistent property (one column).
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyInfo {
    /// Property name
    pub name: &'static str,
    /// Database column name (may differ from property name)
    pub column: &'static str,
    pub sql_type: SqlType,
    pub nullable: bool,
    /// Identifier property
    pub primary_key: bool,
    /// Whether an UPDATE may change the column
    pub updatable: bool,
    pub generated: Option<GeneratedValue>,
    /// Optimistic-locking version counter
    pub version: bool,
    /// Stamped once on insert
    pub created_date: bool,
    /// Stamped on insert and on every effective update
    pub last_modified_date: bool,
    pub foreign_key: Option<ForeignKeyInfo>,
}

impl PropertyInfo {
    /// Create a new property whose column has the same name.
    pub const fn new(name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            column: name,
            sql_type,
            nullable: false,
            primary_key: false,
            updatable: true,
            generated: None,
            version: false,
            created_date: false,
            last_modified_date: false,
            foreign_key: None,
        }
    }

    /// Set the database column name.
    pub const fn column(mut self, name: &'static str) -> Self {
        self.column = name;
        self
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Mark as the identifier property. Identifiers are never updatable.
    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.updatable = false;
        self
    }

    pub const fn updatable(mut self, value: bool) -> Self {
        self.updatable = value;
        self
    }

    pub const fn generated(mut self, strategy: GeneratedValue) -> Self {
        self.generated = Some(strategy);
        self
    }

    /// Mark as the optimistic-locking version counter.
    pub const fn version(mut self) -> Self {
        self.version = true;
        self
    }

    pub const fn created_date(mut self) -> Self {
        self.created_date = true;
        self
    }

    pub const fn last_modified_date(mut self) -> Self {
        self.last_modified_date = true;
        self
    }

    /// Declare this property as a foreign key.
    ///
    /// An optional foreign key is also nullable.
    pub const fn foreign_key(mut self, fk: ForeignKeyInfo) -> Self {
        if fk.optional {
            self.nullable = true;
        }
        self.foreign_key = Some(fk);
        self
    }
}

/// Inverse side of a foreign key declared on another type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignTableInfo {
    /// Field name on the owning type
    pub field: &'static str,
    /// Type holding the foreign key
    pub target: &'static str,
    /// Name of the foreign key property on `target`
    pub join_key: &'static str,
    /// Whether the owner may exist without the linked row(s)
    pub optional: bool,
    /// Collection (one-to-many) or scalar (one-to-one)
    pub collection: bool,
}

impl ForeignTableInfo {
    /// One-to-many inverse field.
    pub const fn collection(
        field: &'static str,
        target: &'static str,
        join_key: &'static str,
    ) -> Self {
        Self {
            field,
            target,
            join_key,
            optional: true,
            collection: true,
        }
    }

    /// One-to-one inverse field.
    pub const fn scalar(field: &'static str, target: &'static str, join_key: &'static str) -> Self {
        Self {
            field,
            target,
            join_key,
            optional: true,
            collection: false,
        }
    }

    pub const fn optional(mut self, value: bool) -> Self {
        self.optional = value;
        self
    }
}

/// Metadata of one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityType {
    pub name: &'static str,
    pub table: &'static str,
    pub properties: Vec<PropertyInfo>,
    pub foreign_tables: Vec<ForeignTableInfo>,
}

impl EntityType {
    pub fn new(name: &'static str, table: &'static str) -> Self {
        Self {
            name,
            table,
            properties: Vec::new(),
            foreign_tables: Vec::new(),
        }
    }

    pub fn property(mut self, property: PropertyInfo) -> Self {
        self.properties.push(property);
        self
    }

    pub fn foreign_table(mut self, field: ForeignTableInfo) -> Self {
        self.foreign_tables.push(field);
        self
    }

    /// The identifier property, if the type has one.
    pub fn id_property(&self) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.primary_key)
    }

    pub fn version_property(&self) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.version)
    }

    pub fn property_named(&self, name: &str) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn foreign_table_named(&self, name: &str) -> Option<&ForeignTableInfo> {
        self.foreign_tables.iter().find(|f| f.field == name)
    }

    /// Properties annotated as foreign keys.
    pub fn foreign_keys(&self) -> impl Iterator<Item = &PropertyInfo> {
        self.properties.iter().filter(|p| p.foreign_key.is_some())
    }

    pub fn require_property(&self, name: &str) -> Result<&PropertyInfo> {
        self.property_named(name).ok_or_else(|| {
            Error::model(
                ModelAccessErrorKind::UnknownField,
                self.name,
                Some(name),
                "no such property",
            )
        })
    }
}

/// Registry of all entity types taking part in write operations.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    entities: HashMap<&'static str, Arc<EntityType>>,
    /// target type -> (referencing type, foreign key property)
    inbound: HashMap<&'static str, Vec<(&'static str, &'static str)>>,
}

impl MetadataRegistry {
    pub fn builder() -> MetadataRegistryBuilder {
        MetadataRegistryBuilder::default()
    }

    /// Look up an entity type by name.
    pub fn entity(&self, name: &str) -> Result<&Arc<EntityType>> {
        self.entities.get(name).ok_or_else(|| {
            Error::model(
                ModelAccessErrorKind::UnknownEntity,
                name,
                None,
                "entity type is not registered",
            )
        })
    }

    /// The inverse field matching a foreign key, found on the referenced type.
    ///
    /// `owner` is the type declaring the foreign key `fk`.
    pub fn foreign_table_for_key(
        &self,
        owner: &EntityType,
        fk: &PropertyInfo,
    ) -> Option<&ForeignTableInfo> {
        let target = fk.foreign_key.as_ref()?.target;
        self.entities
            .get(target)?
            .foreign_tables
            .iter()
            .find(|ft| ft.target == owner.name && ft.join_key == fk.name)
    }

    /// Foreign keys on any type that reference `target`.
    pub fn inbound_foreign_keys(&self, target: &str) -> Vec<(&Arc<EntityType>, &PropertyInfo)> {
        let Some(links) = self.inbound.get(target) else {
            return Vec::new();
        };
        links
            .iter()
            .filter_map(|(owner, prop)| {
                let ty = self.entities.get(owner)?;
                let p = ty.property_named(prop)?;
                Some((ty, p))
            })
            .collect()
    }

    /// Whether `ty` is linked to anything besides the foreign key `other_than`.
    ///
    /// Rows of such a type cannot be deleted by criteria alone because the
    /// cascade has to continue through the other links.
    pub fn has_other_links(&self, ty: &EntityType, other_than: &str) -> bool {
        !ty.foreign_tables.is_empty()
            || self.inbound.contains_key(ty.name)
            || ty.foreign_keys().any(|p| p.name != other_than)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.entities.values()
    }
}

/// Collects entity types and validates them together.
#[derive(Debug, Default)]
pub struct MetadataRegistryBuilder {
    entities: Vec<EntityType>,
}

impl MetadataRegistryBuilder {
    pub fn entity(mut self, entity: EntityType) -> Self {
        self.entities.push(entity);
        self
    }

    /// Validate the mapping and build the registry.
    pub fn build(self) -> Result<MetadataRegistry> {
        let mut entities: HashMap<&'static str, Arc<EntityType>> = HashMap::new();
        for entity in self.entities {
            if entities.contains_key(entity.name) {
                return Err(Error::mapping(entity.name, None, "entity registered twice"));
            }
            entities.insert(entity.name, Arc::new(entity));
        }

        let mut inbound: HashMap<&'static str, Vec<(&'static str, &'static str)>> = HashMap::new();
        for ty in entities.values() {
            validate_properties(ty)?;
            for prop in ty.foreign_keys() {
                let Some(fk) = prop.foreign_key.as_ref() else {
                    continue;
                };
                if !entities.contains_key(fk.target) {
                    return Err(Error::mapping(
                        ty.name,
                        Some(prop.name),
                        format!("foreign key targets unknown entity '{}'", fk.target),
                    ));
                }
                if fk.on_foreign_deleted == OnForeignDeleted::SetNull && !prop.nullable {
                    return Err(Error::mapping(
                        ty.name,
                        Some(prop.name),
                        "SetNull requires a nullable foreign key",
                    ));
                }
                inbound.entry(fk.target).or_default().push((ty.name, prop.name));
            }
        }

        let mut claimed: HashMap<(&'static str, &'static str), &'static str> = HashMap::new();
        for ty in entities.values() {
            for ft in &ty.foreign_tables {
                if ty.property_named(ft.field).is_some() {
                    return Err(Error::mapping(
                        ty.name,
                        Some(ft.field),
                        "inverse field shadows a property",
                    ));
                }
                let Some(target) = entities.get(ft.target) else {
                    return Err(Error::mapping(
                        ty.name,
                        Some(ft.field),
                        format!("inverse field targets unknown entity '{}'", ft.target),
                    ));
                };
                let points_back = target
                    .property_named(ft.join_key)
                    .and_then(|p| p.foreign_key.as_ref())
                    .is_some_and(|fk| fk.target == ty.name);
                if !points_back {
                    return Err(Error::mapping(
                        ty.name,
                        Some(ft.field),
                        format!(
                            "join key '{}.{}' is not a foreign key to '{}'",
                            ft.target, ft.join_key, ty.name
                        ),
                    ));
                }
                if let Some(other) = claimed.insert((ft.target, ft.join_key), ft.field) {
                    return Err(Error::mapping(
                        ty.name,
                        Some(ft.field),
                        format!(
                            "join key '{}.{}' is already claimed by inverse field '{}'",
                            ft.target, ft.join_key, other
                        ),
                    ));
                }
            }
        }

        tracing::debug!(entities = entities.len(), "Entity metadata registry built");
        Ok(MetadataRegistry { entities, inbound })
    }
}

fn validate_properties(ty: &EntityType) -> Result<()> {
    if ty.properties.iter().filter(|p| p.primary_key).count() > 1 {
        return Err(Error::mapping(ty.name, None, "more than one identifier property"));
    }
    let mut versions = ty.properties.iter().filter(|p| p.version);
    if let Some(version) = versions.next() {
        if versions.next().is_some() {
            return Err(Error::mapping(ty.name, None, "more than one version property"));
        }
        if !version.sql_type.is_integer() {
            return Err(Error::mapping(
                ty.name,
                Some(version.name),
                "version property must be an integer column",
            ));
        }
    }
    for prop in &ty.properties {
        if (prop.created_date || prop.last_modified_date)
            && !prop.sql_type.is_temporal()
            && prop.sql_type != SqlType::BigInt
        {
            return Err(Error::mapping(
                ty.name,
                Some(prop.name),
                "timestamp property must be a temporal column",
            ));
        }
    }
    Ok(())
}
