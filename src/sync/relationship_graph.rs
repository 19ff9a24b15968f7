//! Bidirectional entity-reference graph for filtered sync.
//!
//! Built once per run from the parsed schemas, restricted to configured
//! entities. The referenced column recorded here is the business key,
//! which is what OData foreign keys actually store, so joins succeed
//! against any historical SCD2 version.

use std::collections::HashMap;

use crate::config::EntityConfig;
use crate::metadata::TableSchema;

/// One edge of the graph: a table whose `fk_column` stores values of
/// another table's `referenced_column`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub table: String,
    pub fk_column: String,
    pub referenced_column: String,
}

#[derive(Debug, Default)]
struct EntityRelationships {
    references_to: Vec<Reference>,
    referenced_by: Vec<Reference>,
}

/// Bidirectional graph keyed by plural API name.
#[derive(Debug, Default)]
pub struct RelationshipGraph {
    relationships: HashMap<String, EntityRelationships>,
}

impl RelationshipGraph {
    /// Build the graph from parsed schemas (keyed by singular name) and
    /// the configured entities. Foreign keys whose referenced table is
    /// outside the configured set are ignored.
    pub fn build(schemas: &HashMap<String, TableSchema>, entities: &[EntityConfig]) -> Self {
        let mut graph = Self::default();

        let singular_to_api: HashMap<&str, &str> = entities
            .iter()
            .map(|e| (e.name.as_str(), e.api_name.as_str()))
            .collect();

        for entity in entities {
            graph
                .relationships
                .entry(entity.api_name.clone())
                .or_default();
        }

        for entity in entities {
            let Some(schema) = schemas.get(&entity.name) else {
                continue;
            };

            for fk in &schema.foreign_keys {
                let Some(referenced_api) = singular_to_api.get(fk.referenced_table.as_str())
                else {
                    continue;
                };

                graph
                    .relationships
                    .get_mut(&entity.api_name)
                    .expect("configured entity present")
                    .references_to
                    .push(Reference {
                        table: (*referenced_api).to_string(),
                        fk_column: fk.column.clone(),
                        referenced_column: fk.referenced_column.clone(),
                    });

                graph
                    .relationships
                    .get_mut(*referenced_api)
                    .expect("configured entity present")
                    .referenced_by
                    .push(Reference {
                        table: entity.api_name.clone(),
                        fk_column: fk.column.clone(),
                        referenced_column: fk.referenced_column.clone(),
                    });
            }
        }

        graph
    }

    /// Tables holding foreign keys into the given entity.
    pub fn entities_that_reference(&self, api_name: &str) -> &[Reference] {
        self.relationships
            .get(api_name)
            .map(|r| r.referenced_by.as_slice())
            .unwrap_or(&[])
    }

    /// Tables the given entity holds foreign keys into.
    pub fn entities_referenced_by(&self, api_name: &str) -> &[Reference] {
        self.relationships
            .get(api_name)
            .map(|r| r.references_to.as_slice())
            .unwrap_or(&[])
    }

    pub fn api_names(&self) -> impl Iterator<Item = &str> {
        self.relationships.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ColumnSpec, ForeignKeySpec};

    fn entity(name: &str, api_name: &str, filtered: bool) -> EntityConfig {
        EntityConfig {
            name: name.to_string(),
            api_name: api_name.to_string(),
            filtered,
            description: String::new(),
        }
    }

    fn schemas() -> HashMap<String, TableSchema> {
        let mut contact = TableSchema::new("contact");
        contact.columns.push(ColumnSpec {
            name: "contactid".into(),
            db_type: "TEXT".into(),
            edm_type: None,
            nullable: false,
            max_length: None,
        });
        contact.primary_key = Some("contactid".into());
        contact.foreign_keys.push(ForeignKeySpec {
            column: "_parentcustomerid_value".into(),
            referenced_table: "account".into(),
            referenced_column: "accountid".into(),
        });
        contact.foreign_keys.push(ForeignKeySpec {
            column: "_externalorg_value".into(),
            referenced_table: "organization".into(),
            referenced_column: "organizationid".into(),
        });

        let mut account = TableSchema::new("account");
        account.primary_key = Some("accountid".into());

        HashMap::from([
            ("contact".to_string(), contact),
            ("account".to_string(), account),
        ])
    }

    #[test]
    fn test_bidirectional_edges() {
        let entities = vec![
            entity("account", "accounts", true),
            entity("contact", "contacts", false),
        ];
        let graph = RelationshipGraph::build(&schemas(), &entities);

        let referencing = graph.entities_that_reference("accounts");
        assert_eq!(referencing.len(), 1);
        assert_eq!(referencing[0].table, "contacts");
        assert_eq!(referencing[0].fk_column, "_parentcustomerid_value");
        assert_eq!(referencing[0].referenced_column, "accountid");

        let referenced = graph.entities_referenced_by("contacts");
        assert_eq!(referenced.len(), 1);
        assert_eq!(referenced[0].table, "accounts");
    }

    #[test]
    fn test_unconfigured_references_are_dropped() {
        // organization is not configured, so the edge to it vanishes.
        let entities = vec![
            entity("account", "accounts", true),
            entity("contact", "contacts", false),
        ];
        let graph = RelationshipGraph::build(&schemas(), &entities);
        assert!(graph
            .entities_referenced_by("contacts")
            .iter()
            .all(|r| r.table != "organizations"));
    }

    #[test]
    fn test_unknown_entity_yields_empty_slices() {
        let graph = RelationshipGraph::build(&HashMap::new(), &[]);
        assert!(graph.entities_that_reference("ghosts").is_empty());
        assert!(graph.entities_referenced_by("ghosts").is_empty());
    }
}
