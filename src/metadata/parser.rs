//! Parser for the OData $metadata (CSDL) document.
//!
//! The document is large (several MB, hundreds of entities) so it is
//! consumed as a single streaming pass with `quick_xml`. Accepts both
//! prefixed and default-namespace element forms; only local names are
//! matched.
//!
//! Foreign keys are merged from two sources, with `NavigationProperty/
//! ReferentialConstraint` taking precedence over the inferred column
//! patterns (`_<field>_value` lookups and `<name>id` junction columns).

use std::collections::{HashMap, HashSet};

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use tracing::warn;

use crate::error::SyncError;

use super::type_mapping::{map_edm_to_db_type, DbTarget};
use super::types::{ColumnSpec, ForeignKeySpec, TableSchema};

/// Parses $metadata XML into per-entity schemas.
pub struct MetadataParser {
    target: DbTarget,
    optionset_overrides: HashMap<String, HashSet<String>>,
}

/// In-flight state for the entity type currently being parsed.
struct EntityBuilder {
    name: String,
    primary_key: Option<String>,
    columns: Vec<ColumnSpec>,
    foreign_keys: Vec<ForeignKeySpec>,
}

impl MetadataParser {
    pub fn new(target: DbTarget) -> Self {
        Self {
            target,
            optionset_overrides: HashMap::new(),
        }
    }

    /// Declare which string-typed fields are actually option sets, per
    /// singular entity name. Matching columns are emitted with the
    /// integer storage type.
    pub fn with_optionset_overrides(
        mut self,
        overrides: &HashMap<String, Vec<String>>,
    ) -> Self {
        self.optionset_overrides = overrides
            .iter()
            .map(|(entity, fields)| (entity.clone(), fields.iter().cloned().collect()))
            .collect();
        self
    }

    /// Parse the full CSDL document into a map of singular entity name
    /// to schema. Abstract entity types are skipped.
    pub fn parse(&self, xml: &str) -> Result<HashMap<String, TableSchema>, SyncError> {
        let mut reader = Reader::from_str(xml);
        let mut buf = Vec::new();

        let mut schemas: HashMap<String, TableSchema> = HashMap::new();
        let mut current: Option<EntityBuilder> = None;
        let mut in_key = false;
        // Type attribute of the NavigationProperty currently open, if any.
        let mut nav_type: Option<String> = None;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    let local = local_name(e.name().as_ref());
                    match local.as_str() {
                        "EntityType" => current = self.open_entity(e),
                        "Key" => in_key = current.is_some(),
                        "NavigationProperty" if current.is_some() => {
                            nav_type = get_attr_opt(e, "Type");
                        }
                        _ => self.handle_leaf(&local, e, &mut current, in_key, &nav_type),
                    }
                }
                Ok(Event::Empty(ref e)) => {
                    let local = local_name(e.name().as_ref());
                    // A self-closing EntityType has no properties to record.
                    if local != "EntityType" {
                        self.handle_leaf(&local, e, &mut current, in_key, &nav_type);
                    }
                }
                Ok(Event::End(ref e)) => match local_name(e.name().as_ref()).as_str() {
                    "Key" => in_key = false,
                    "NavigationProperty" => nav_type = None,
                    "EntityType" => {
                        if let Some(builder) = current.take() {
                            let schema = builder.finish();
                            schemas.insert(schema.entity_name.clone(), schema);
                        }
                    }
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(SyncError::Metadata(format!(
                        "failed to parse $metadata XML at position {}: {e}",
                        reader.buffer_position()
                    )))
                }
            }
            buf.clear();
        }

        Ok(schemas)
    }

    /// Filter a full parse down to the requested singular entity names,
    /// warning about configured entities absent from the document.
    pub fn parse_for_entities(
        &self,
        xml: &str,
        entity_names: &[String],
    ) -> Result<HashMap<String, TableSchema>, SyncError> {
        let mut all = self.parse(xml)?;

        let mut requested = HashMap::new();
        let mut missing = Vec::new();
        for name in entity_names {
            match all.remove(name) {
                Some(schema) => {
                    requested.insert(name.clone(), schema);
                }
                None => missing.push(name.as_str()),
            }
        }

        if !missing.is_empty() {
            warn!(
                count = missing.len(),
                "entities configured but not found in $metadata: {}",
                missing
                    .iter()
                    .take(10)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        Ok(requested)
    }

    fn open_entity(&self, e: &BytesStart) -> Option<EntityBuilder> {
        if get_attr_opt(e, "Abstract").as_deref() == Some("true") {
            return None;
        }
        let name = get_attr_opt(e, "Name")?;
        Some(EntityBuilder {
            name,
            primary_key: None,
            columns: Vec::new(),
            foreign_keys: Vec::new(),
        })
    }

    fn handle_leaf(
        &self,
        local: &str,
        e: &BytesStart,
        current: &mut Option<EntityBuilder>,
        in_key: bool,
        nav_type: &Option<String>,
    ) {
        let Some(builder) = current.as_mut() else {
            return;
        };

        match local {
            "PropertyRef" if in_key => {
                if builder.primary_key.is_none() {
                    builder.primary_key = get_attr_opt(e, "Name");
                }
            }
            "Property" => {
                if let Some(column) = self.parse_property(e, &builder.name) {
                    builder.columns.push(column);
                }
            }
            "ReferentialConstraint" => {
                if let Some(type_attr) = nav_type {
                    if let Some(fk) = parse_referential_constraint(e, type_attr) {
                        builder.foreign_keys.push(fk);
                    }
                }
            }
            _ => {}
        }
    }

    fn parse_property(&self, e: &BytesStart, entity_name: &str) -> Option<ColumnSpec> {
        let name = get_attr_opt(e, "Name")?;
        let edm_type = get_attr_opt(e, "Type")?;

        // Nullable defaults to true in CSDL.
        let nullable = get_attr_opt(e, "Nullable")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);
        let max_length = get_attr_opt(e, "MaxLength").and_then(|v| v.parse::<u32>().ok());

        let is_option_set = self
            .optionset_overrides
            .get(entity_name)
            .is_some_and(|fields| fields.contains(&name));

        let db_type = map_edm_to_db_type(&edm_type, self.target, max_length, is_option_set);

        Some(ColumnSpec {
            name,
            db_type,
            edm_type: Some(edm_type),
            nullable,
            max_length,
        })
    }
}

impl EntityBuilder {
    /// Merge in the inferred foreign keys and produce the final schema.
    fn finish(mut self) -> TableSchema {
        let covered: HashSet<String> = self
            .foreign_keys
            .iter()
            .map(|fk| fk.column.clone())
            .collect();

        for col in &self.columns {
            if covered.contains(&col.name) {
                continue;
            }

            let lower = col.name.to_ascii_lowercase();

            // Dataverse lookup convention: _<field>_value references
            // <field>.<field>id.
            if lower.starts_with('_') && lower.ends_with("_value") && col.name.len() > 7 {
                let field = &col.name[1..col.name.len() - 6];
                self.foreign_keys.push(ForeignKeySpec {
                    column: col.name.clone(),
                    referenced_table: field.to_string(),
                    referenced_column: format!("{field}id"),
                });
                continue;
            }

            // Junction-style columns: <name>id references <name>.<name>id,
            // excluding the entity's own key and the rowversion column.
            if lower.ends_with("id") && col.name.len() > 2 {
                if self.primary_key.as_deref() == Some(col.name.as_str()) {
                    continue;
                }
                if col.name == "versionnumber" {
                    continue;
                }
                let referenced_table = col.name[..col.name.len() - 2].to_string();
                self.foreign_keys.push(ForeignKeySpec {
                    column: col.name.clone(),
                    referenced_table,
                    referenced_column: col.name.clone(),
                });
            }
        }

        TableSchema {
            entity_name: self.name,
            columns: self.columns,
            primary_key: self.primary_key,
            foreign_keys: self.foreign_keys,
            indexes: Vec::new(),
        }
    }
}

/// Parse one ReferentialConstraint into a foreign key, deriving the
/// referenced table from the NavigationProperty's Type attribute
/// (`mscrm.account` or `Collection(mscrm.account)`).
fn parse_referential_constraint(e: &BytesStart, type_attr: &str) -> Option<ForeignKeySpec> {
    let column = get_attr_opt(e, "Property")?;
    let referenced_column = get_attr_opt(e, "ReferencedProperty")?;

    let mut target = type_attr;
    if let Some(inner) = target
        .strip_prefix("Collection(")
        .and_then(|s| s.strip_suffix(')'))
    {
        target = inner;
    }
    let referenced_table = target.rsplit('.').next().unwrap_or(target);
    if referenced_table.is_empty() {
        return None;
    }

    Some(ForeignKeySpec {
        column,
        referenced_table: referenced_table.to_string(),
        referenced_column,
    })
}

fn local_name(name: &[u8]) -> String {
    let s = std::str::from_utf8(name).unwrap_or("");
    if let Some(pos) = s.rfind(':') {
        s[pos + 1..].to_string()
    } else {
        s.to_string()
    }
}

fn get_attr_opt(e: &BytesStart, name: &str) -> Option<String> {
    for attr in e.attributes().flatten() {
        let key = local_name(attr.key.as_ref());
        if key == name {
            return attr.unescape_value().ok().map(|v| v.to_string());
        }
    }
    None
}
