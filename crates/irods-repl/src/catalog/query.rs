//! Parameterized catalog queries.
//!
//! Every user-supplied value (resource names, collection prefix, age cutoff)
//! is bound as a `$n` parameter; nothing is interpolated into the SQL text.

use super::SelectionFilter;
use crate::operation::Operation;
use chrono::{DateTime, Utc};

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogQuery {
    pub sql: String,
    pub params: Vec<String>,
}

/// Accumulates bound parameters and hands out their placeholders.
#[derive(Debug, Default)]
pub struct QueryBuilder {
    params: Vec<String>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a value, returning its placeholder (`$1`, `$2`, ...).
    pub fn bind(&mut self, value: impl Into<String>) -> String {
        self.params.push(value.into());
        format!("${}", self.params.len())
    }

    /// Build the selection query for `filter`.
    pub fn selection(mut self, filter: &SelectionFilter) -> CatalogQuery {
        let mut ctes = Vec::new();
        let mut having = Vec::new();

        let dest_tree = filter.dest_resc.as_ref().map(|name| {
            ctes.push(resource_tree_cte("dest_tree", &self.bind(name.as_str())));
            "(SELECT resc_id FROM dest_tree)"
        });
        let src_tree = filter.src_resc.as_ref().map(|name| {
            ctes.push(resource_tree_cte("src_tree", &self.bind(name.as_str())));
            "(SELECT resc_id FROM src_tree)"
        });

        having.push(format!(
            "MIN(d.create_ts) < {}",
            self.bind(catalog_timestamp(filter.created_before))
        ));

        let mut conditions = Vec::new();
        if let Some(ref coll) = filter.collection {
            let exact = self.bind(coll.as_str());
            let below = self.bind(format!("{}/%", escape_like(coll)));
            conditions.push(format!("(c.coll_name = {} OR c.coll_name LIKE {})", exact, below));
        }

        match filter.operation {
            Operation::Replicate => {
                if let Some(dest) = dest_tree {
                    // data_is_dirty = '1' marks a good replica
                    having.push(format!(
                        "NOT BOOL_OR(d.resc_id IN {} AND d.data_is_dirty = '1')",
                        dest
                    ));
                }
                if let Some(src) = src_tree {
                    having.push(format!("BOOL_OR(d.resc_id IN {})", src));
                }
            }
            Operation::Checksum => {
                conditions.push("COALESCE(d.data_checksum, '') = ''".to_string());
                if let Some(src) = src_tree {
                    conditions.push(format!("d.resc_id IN {}", src));
                }
            }
            Operation::Move => {
                if let Some(src) = src_tree {
                    having.push(format!("BOOL_OR(d.resc_id IN {})", src));
                }
                if let Some(dest) = dest_tree {
                    having.push(format!("NOT BOOL_OR(d.resc_id IN {})", dest));
                }
            }
        }

        let mut sql = String::new();
        if !ctes.is_empty() {
            sql.push_str("WITH RECURSIVE ");
            sql.push_str(&ctes.join(",\n"));
            sql.push('\n');
        }
        sql.push_str(
            "SELECT MAX(d.data_size), c.coll_name || '/' || d.data_name\n\
             FROM r_data_main AS d\n\
             JOIN r_coll_main AS c ON c.coll_id = d.coll_id\n",
        );
        if !conditions.is_empty() {
            sql.push_str("WHERE ");
            sql.push_str(&conditions.join("\n  AND "));
            sql.push('\n');
        }
        sql.push_str("GROUP BY d.data_id, c.coll_name, d.data_name\n");
        sql.push_str("HAVING ");
        sql.push_str(&having.join("\n  AND "));

        CatalogQuery {
            sql,
            params: self.params,
        }
    }
}

/// Resources below (and including) the named root resource.
fn resource_tree_cte(name: &str, root_param: &str) -> String {
    format!(
        "{name}(resc_id) AS (\n\
         \x20 SELECT resc_id FROM r_resc_main WHERE resc_name = {root_param}\n\
         \x20 UNION\n\
         \x20 SELECT r.resc_id FROM r_resc_main AS r JOIN {name} AS t ON r.resc_parent = t.resc_id::TEXT\n\
         )"
    )
}

/// ICAT stores timestamps as zero-padded 11-digit epoch seconds.
pub(crate) fn catalog_timestamp(ts: DateTime<Utc>) -> String {
    format!("{:011}", ts.timestamp().max(0))
}

/// Escape LIKE wildcards so the collection name matches literally.
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
