//! Model metadata: what callers declare per collection, and the resolved
//! table definitions the compiler and codec work from.

use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{AdapterError, Result};
use crate::spatial;
use crate::types::SemanticType;

/// An attribute as declared by the caller. Either a bare type name
/// (`"name": "string"`) or a full definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AttributeSpec {
    Type(String),
    Full(AttributeInput),
}

impl From<AttributeInput> for AttributeSpec {
    fn from(input: AttributeInput) -> Self {
        AttributeSpec::Full(input)
    }
}

impl AttributeSpec {
    pub fn into_input(self) -> AttributeInput {
        match self {
            AttributeSpec::Type(kind) => AttributeInput {
                kind: Some(kind),
                ..AttributeInput::default()
            },
            AttributeSpec::Full(input) => input,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttributeInput {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub column_name: Option<String>,
    /// Verbatim native type, e.g. `geometry(Point, 4326)`.
    pub db_type: Option<String>,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub unique: UniqueInput,
    pub index: IndexInput,
    pub not_null: bool,
    pub defaults_to: Option<Value>,
    #[serde(rename = "enum")]
    pub enum_values: Option<Vec<String>>,
    pub foreign_key: bool,
    /// Referenced model for a to-one association.
    pub model: Option<String>,
    pub references: Option<String>,
    pub on: Option<String>,
    /// To-many associations have no column of their own.
    pub collection: Option<String>,
    pub length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    /// `datetime` without time zone.
    pub standard: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
pub enum UniqueInput {
    #[default]
    None,
    Flag(bool),
    Composite {
        #[serde(default)]
        unique: bool,
        #[serde(default)]
        composite: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
pub enum IndexInput {
    #[default]
    None,
    Flag(bool),
    Named {
        #[serde(rename = "indexName", default)]
        name: Option<String>,
        #[serde(rename = "indexType", default)]
        method: Option<String>,
    },
}

/// One collection of the caller's model metadata.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CollectionInput {
    pub identity: Option<String>,
    pub table_name: Option<String>,
    pub attributes: IndexMap<String, AttributeSpec>,
    pub junction_table: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: Option<String>,
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: Option<String>,
}

/// An attribute after name and type resolution.
#[derive(Debug, Clone)]
pub struct ResolvedAttribute {
    /// Column name in the database.
    pub name: String,
    /// Key the caller declared it under.
    pub attribute: String,
    pub semantic: SemanticType,
    pub db_type: Option<String>,
    pub length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub standard: bool,
    pub enum_values: Vec<String>,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub unique: bool,
    pub composite_unique: Vec<String>,
    pub index: Option<IndexSpec>,
    pub not_null: bool,
    pub default: Option<Value>,
    pub references: Option<ForeignKeyRef>,
}

impl ResolvedAttribute {
    pub fn is_spatial(&self) -> bool {
        spatial::is_spatial(self.db_type.as_deref())
    }

    pub fn native_srid(&self) -> u32 {
        spatial::native_srid(self.db_type.as_deref())
    }

    pub fn is_array(&self) -> bool {
        self.semantic == SemanticType::Array
    }
}

/// Resolved definition of one table.
#[derive(Debug)]
pub struct TableDefinition {
    pub name: String,
    /// Keyed by column name, in declaration order.
    pub attributes: IndexMap<String, ResolvedAttribute>,
    pub junction_table: bool,
    primary_key: OnceLock<String>,
}

impl TableDefinition {
    pub fn new(
        name: impl Into<String>,
        attributes: impl IntoIterator<Item = ResolvedAttribute>,
    ) -> Self {
        Self {
            name: name.into(),
            attributes: attributes
                .into_iter()
                .map(|attr| (attr.name.clone(), attr))
                .collect(),
            junction_table: false,
            primary_key: OnceLock::new(),
        }
    }

    /// Column name of the first attribute flagged as primary key, or `id`.
    /// Computed on first use and cached.
    pub fn primary_key(&self) -> &str {
        self.primary_key.get_or_init(|| {
            self.attributes
                .values()
                .find(|attr| attr.primary_key)
                .map(|attr| attr.name.clone())
                .unwrap_or_else(|| "id".to_string())
        })
    }

    pub fn attribute(&self, column: &str) -> Option<&ResolvedAttribute> {
        self.attributes.get(column)
    }

    pub fn spatial_columns(&self) -> impl Iterator<Item = &ResolvedAttribute> {
        self.attributes.values().filter(|attr| attr.is_spatial())
    }

    pub fn has_spatial_columns(&self) -> bool {
        self.spatial_columns().next().is_some()
    }

    pub fn uuid_columns(&self) -> impl Iterator<Item = &ResolvedAttribute> {
        self.attributes
            .values()
            .filter(|attr| attr.semantic == SemanticType::Uuid)
    }
}

/// Every table known to one connection, keyed by table name.
#[derive(Debug, Default, Clone)]
pub struct Schema {
    tables: IndexMap<String, Arc<TableDefinition>>,
}

impl Schema {
    pub fn get(&self, table: &str) -> Option<&Arc<TableDefinition>> {
        self.tables.get(table)
    }

    pub fn table(&self, table: &str) -> Result<&Arc<TableDefinition>> {
        self.get(table)
            .ok_or_else(|| AdapterError::UnknownTable(table.to_string()))
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<TableDefinition>> {
        self.tables.values()
    }

    pub fn insert(&mut self, table: TableDefinition) {
        self.tables.insert(table.name.clone(), Arc::new(table));
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn has_spatial_columns(&self) -> bool {
        self.tables.values().any(|table| table.has_spatial_columns())
    }
}

/// Build the schema for a connection from the caller's collections.
///
/// Collections are keyed by model identity; each becomes a table named by
/// `tableName` (or the key). Foreign keys take their column type from the
/// referenced table's primary key.
pub fn build_schema(collections: &IndexMap<String, CollectionInput>) -> Schema {
    let raw: IndexMap<String, (String, IndexMap<String, AttributeInput>, bool)> = collections
        .iter()
        .map(|(key, collection)| {
            let table = collection
                .table_name
                .clone()
                .or_else(|| collection.identity.clone())
                .unwrap_or_else(|| key.clone());
            let attributes = collection
                .attributes
                .iter()
                .map(|(name, spec)| (name.clone(), spec.clone().into_input()))
                .collect();
            (key.clone(), (table, attributes, collection.junction_table))
        })
        .collect();

    let lookup = ReferenceLookup { raw: &raw };
    let mut schema = Schema::default();
    for (table, attributes, junction_table) in raw.values() {
        let resolved = resolve_attributes(table, attributes, &lookup);
        let mut definition = TableDefinition::new(table.clone(), resolved);
        definition.junction_table = *junction_table;
        schema.insert(definition);
    }
    schema
}

/// Resolve an ad hoc attribute map (used by `define`), consulting an
/// existing schema for foreign-key targets.
pub fn resolve_definition(
    table: &str,
    attributes: &IndexMap<String, AttributeSpec>,
    schema: &Schema,
) -> TableDefinition {
    let inputs: IndexMap<String, AttributeInput> = attributes
        .iter()
        .map(|(name, spec)| (name.clone(), spec.clone().into_input()))
        .collect();
    let lookup = SchemaLookup { schema };
    TableDefinition::new(table, resolve_attributes(table, &inputs, &lookup))
}

pub fn resolve_single(
    table: &str,
    name: &str,
    spec: &AttributeSpec,
    schema: &Schema,
) -> Option<ResolvedAttribute> {
    resolve_attribute(table, name, &spec.clone().into_input(), &SchemaLookup { schema })
}

/// Type of a referenced table's primary key.
trait PrimaryKeyLookup {
    fn primary_key_type(&self, model: &str) -> Option<(String, SemanticType)>;
}

struct ReferenceLookup<'a> {
    raw: &'a IndexMap<String, (String, IndexMap<String, AttributeInput>, bool)>,
}

impl PrimaryKeyLookup for ReferenceLookup<'_> {
    fn primary_key_type(&self, model: &str) -> Option<(String, SemanticType)> {
        let (table, attributes, _) = self
            .raw
            .get(model)
            .or_else(|| self.raw.values().find(|(table, _, _)| table == model))?;
        let (name, pk) = attributes
            .iter()
            .find(|(_, attr)| attr.primary_key)
            .or_else(|| attributes.iter().find(|(name, _)| name.as_str() == "id"))?;
        let column = pk.column_name.clone().unwrap_or_else(|| name.clone());
        let semantic = declared_type(table, name, pk).unwrap_or(SemanticType::Integer);
        Some((column, semantic.referencing_type()))
    }
}

struct SchemaLookup<'a> {
    schema: &'a Schema,
}

impl PrimaryKeyLookup for SchemaLookup<'_> {
    fn primary_key_type(&self, model: &str) -> Option<(String, SemanticType)> {
        let table = self.schema.get(model)?;
        let pk = table.attribute(table.primary_key())?;
        Some((pk.name.clone(), pk.semantic.referencing_type()))
    }
}

fn resolve_attributes(
    table: &str,
    attributes: &IndexMap<String, AttributeInput>,
    lookup: &dyn PrimaryKeyLookup,
) -> Vec<ResolvedAttribute> {
    attributes
        .iter()
        .filter_map(|(name, input)| resolve_attribute(table, name, input, lookup))
        .collect()
}

fn resolve_attribute(
    table: &str,
    name: &str,
    input: &AttributeInput,
    lookup: &dyn PrimaryKeyLookup,
) -> Option<ResolvedAttribute> {
    if input.collection.is_some() {
        return None;
    }

    let target = input
        .model
        .as_deref()
        .or_else(|| input.foreign_key.then_some(input.references.as_deref()).flatten());
    let reference = target.and_then(|model| {
        lookup
            .primary_key_type(model)
            .map(|(column, semantic)| (model.to_string(), column, semantic))
    });

    let mut semantic = match (declared_type(table, name, input), &reference) {
        (Some(semantic), _) => semantic,
        (None, Some((_, _, target))) => target.clone(),
        (None, None) => {
            if input.db_type.is_none() {
                warn!(table, attribute = name, "attribute has no type, storing as text");
            }
            SemanticType::Text
        }
    };
    if let Some((_, _, SemanticType::Uuid)) = &reference {
        if input.db_type.is_none() {
            semantic = SemanticType::Uuid;
        }
    }

    let column = input.column_name.clone().unwrap_or_else(|| name.to_string());
    let (unique, composite_unique) = match &input.unique {
        _ if input.primary_key => (false, Vec::new()),
        UniqueInput::None | UniqueInput::Flag(false) => (false, Vec::new()),
        UniqueInput::Flag(true) => (true, Vec::new()),
        UniqueInput::Composite { unique, composite } if composite.is_empty() => {
            (*unique, Vec::new())
        }
        // the attribute always leads its own composite key
        UniqueInput::Composite { unique, composite } => {
            let mut key = vec![column.clone()];
            for other in composite {
                if !key.contains(other) {
                    key.push(other.clone());
                }
            }
            (*unique, key)
        }
    };
    let index = match &input.index {
        IndexInput::None | IndexInput::Flag(false) => None,
        IndexInput::Flag(true) => Some(IndexSpec {
            name: None,
            method: None,
        }),
        IndexInput::Named { name, method } => Some(IndexSpec {
            name: name.clone(),
            method: method.clone(),
        }),
    };

    Some(ResolvedAttribute {
        name: column,
        attribute: name.to_string(),
        semantic,
        db_type: input.db_type.clone(),
        length: input.length,
        precision: input.precision,
        scale: input.scale,
        standard: input.standard,
        enum_values: input.enum_values.clone().unwrap_or_default(),
        primary_key: input.primary_key,
        auto_increment: input.auto_increment,
        unique,
        composite_unique,
        index,
        not_null: input.not_null,
        default: input.defaults_to.clone(),
        references: reference.map(|(table, column, _)| ForeignKeyRef {
            table,
            column: Some(column),
        }),
    })
}

/// The declared semantic type, with unknown names degraded to text.
fn declared_type(table: &str, name: &str, input: &AttributeInput) -> Option<SemanticType> {
    let kind = input.kind.as_deref()?;
    match SemanticType::from_str(kind) {
        Ok(semantic) => Some(semantic),
        Err(_) => {
            warn!(table, attribute = name, kind, "unknown attribute type, storing as text");
            Some(SemanticType::Text)
        }
    }
}
