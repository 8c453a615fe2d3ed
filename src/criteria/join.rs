//! Association loading in a single round trip.
//!
//! Each join becomes a `LEFT JOIN` on a filtered subquery of the child table,
//! and selected joins are folded into a JSON array column on the parent row.
//! Child pagination is applied after decoding, once the fan-out of sibling
//! joins has been collapsed by child primary key.

use serde_json::Value;

use super::compiler::{pagination, CompiledQuery, CriteriaCompiler, SqlWriter};
use super::{Criteria, JoinSpec};
use crate::codec::{cast_record, collapse_children, Record};
use crate::error::Result;

/// Key the aggregated children are returned under.
pub fn join_alias(join: &JoinSpec) -> &str {
    if join.alias != join.parent_key && join.remove_parent_key {
        &join.parent_key
    } else {
        &join.alias
    }
}

/// Relation the join condition refers to on the parent side. Junction joins
/// hang off the subquery of the join that reached the junction table.
pub fn parent_alias(join: &JoinSpec) -> String {
    if join.junction_table {
        format!("{}{}", join_alias(join), join.parent)
    } else {
        join.parent.clone()
    }
}

pub fn subquery_alias(join: &JoinSpec) -> String {
    format!("{}{}", join_alias(join), join.child)
}

/// Keep the `skip`/`limit` window of an already deduplicated child array.
/// A limit of zero leaves the window open-ended.
fn child_window(children: Value, criteria: &Criteria) -> Value {
    if !criteria.is_paginated() {
        return children;
    }
    let Value::Array(items) = children else {
        return children;
    };
    let skip = usize::try_from(criteria.effective_skip()).unwrap_or(usize::MAX);
    let take = criteria
        .limit
        .filter(|limit| *limit > 0)
        .map_or(usize::MAX, |limit| usize::try_from(limit).unwrap_or(usize::MAX));
    Value::Array(items.into_iter().skip(skip).take(take).collect())
}

impl CriteriaCompiler<'_> {
    /// Parent rows matching `criteria`, with every selected association
    /// attached as a JSON array column.
    pub fn join(&self, table: &str, criteria: &Criteria) -> Result<CompiledQuery> {
        let definition = self.schema.table(table)?;
        for join in &criteria.joins {
            self.schema.table(&join.child)?;
        }
        let mut writer = SqlWriter::new(self.dialect);

        let mut select = vec![self.projection(definition, table)];
        for join in criteria.joins.iter().filter(|join| join.select) {
            select.push(self.aggregate_column(join)?);
        }

        let mut parts = vec![
            format!("SELECT {}", select.join(", ")),
            format!("FROM {}", self.dialect.quote(table)),
        ];
        for join in &criteria.joins {
            parts.push(self.left_join(&mut writer, join)?);
        }
        if let Some(clause) = self.where_clause(&mut writer, table, criteria.filter.as_ref())? {
            parts.push(format!("WHERE {}", clause));
        }
        parts.push(format!(
            "GROUP BY {}",
            self.dialect.qualify(table, definition.primary_key())
        ));
        parts.push(format!("ORDER BY {}", self.order_by(table, &criteria.sort)));
        parts.push(pagination(criteria));

        Ok(writer.finish(parts.join(" ")))
    }

    fn aggregate_column(&self, join: &JoinSpec) -> Result<String> {
        let child = self.schema.table(&join.child)?;
        let alias = subquery_alias(join);
        let quoted = self.dialect.quote(&alias);

        let mut order = self.order_by(&alias, &join.criteria.sort);
        // the child key breaks ties so windows are stable
        order.push_str(&format!(", {}", self.dialect.qualify(&alias, child.primary_key())));

        let aggregate = format!(
            "array_agg({}.* ORDER BY {}) FILTER (WHERE {} IS NOT NULL)",
            quoted,
            order,
            self.dialect.qualify(&alias, &join.child_key)
        );
        Ok(format!(
            "COALESCE(array_to_json({}), '[]'::json) AS {}",
            aggregate,
            self.dialect.quote(join_alias(join))
        ))
    }

    fn left_join(&self, writer: &mut SqlWriter<'_>, join: &JoinSpec) -> Result<String> {
        let child = self.schema.table(&join.child)?;
        let alias = subquery_alias(join);

        let mut subquery = format!(
            "SELECT {} FROM {}",
            self.projection(child, &join.child),
            self.dialect.quote(&join.child)
        );
        if let Some(clause) =
            self.where_clause(writer, &join.child, join.criteria.filter.as_ref())?
        {
            subquery.push_str(&format!(" WHERE {}", clause));
        }

        Ok(format!(
            "LEFT JOIN ({}) AS {} ON {} = {}",
            subquery,
            self.dialect.quote(&alias),
            self.dialect.qualify(&alias, &join.child_key),
            self.dialect.qualify(&parent_alias(join), &join.parent_key)
        ))
    }

    /// Cast decoded join rows: the parent columns against the parent table,
    /// each association array deduplicated, cast against its child table and
    /// cut to the join's `skip`/`limit` window.
    pub fn nest_children(
        &self,
        table: &str,
        criteria: &Criteria,
        rows: Vec<Record>,
    ) -> Result<Vec<Record>> {
        let definition = self.schema.table(table)?;
        let mut children = Vec::new();
        for join in criteria.joins.iter().filter(|join| join.select) {
            children.push((
                join_alias(join),
                self.schema.table(&join.child)?,
                &join.criteria,
            ));
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let mut record = cast_record(row, definition);
                for (alias, child, join_criteria) in &children {
                    let value = record.remove(*alias).unwrap_or(Value::Null);
                    let value = child_window(collapse_children(value, child), join_criteria);
                    record.insert(alias.to_string(), value);
                }
                record
            })
            .collect())
    }
}
