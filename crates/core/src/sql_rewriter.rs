use crate::error::RewriteError;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    visit_relations, Expr, Ident, ObjectName, Query, SelectItem, SetExpr, Statement, TableFactor,
    Visit, VisitMut, Visitor, VisitorMut,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use std::collections::HashMap;
use std::ops::ControlFlow;

/// Physical names for one virtual table. Unmapped columns keep their names.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableMapping {
    pub new_table_name: Option<String>,
    pub columns: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SqlOperation {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Alter,
    Drop,
    Truncate,
    Unknown,
}

fn parse(sql: &str) -> Result<Vec<Statement>, RewriteError> {
    let statements = Parser::parse_sql(&MySqlDialect {}, sql)?;
    if statements.is_empty() {
        return Err(RewriteError::EmptyStatement);
    }
    Ok(statements)
}

fn table_key(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|ident| ident.value.clone())
        .unwrap_or_default()
}

fn validate_mapping(mapping: &HashMap<String, TableMapping>) -> Result<(), RewriteError> {
    for (table, entry) in mapping {
        if table.is_empty() {
            return Err(RewriteError::InvalidMapping("empty table name".to_string()));
        }
        if entry.new_table_name.as_deref() == Some("") {
            return Err(RewriteError::InvalidMapping(format!(
                "empty new table name for {table}"
            )));
        }
        for (from, to) in &entry.columns {
            if from.is_empty() != to.is_empty() {
                return Err(RewriteError::InvalidMapping(format!(
                    "column mapping of {table} must name both sides, got {from:?} -> {to:?}"
                )));
            }
        }
    }
    Ok(())
}

/// First pass: referenced tables in order of appearance and the aliases pointing at them.
struct AliasCollector<'a> {
    mapping: &'a HashMap<String, TableMapping>,
    aliases: HashMap<String, Option<String>>,
    tables: Vec<String>,
}

impl Visitor for AliasCollector<'_> {
    type Break = String;

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        let table = table_key(relation);
        if !self.tables.contains(&table) {
            self.tables.push(table);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        let (alias, table) = match table_factor {
            TableFactor::Table { name, alias, .. } => (alias, Some(table_key(name))),
            TableFactor::Derived { alias, .. } => (alias, None),
            _ => return ControlFlow::Continue(()),
        };
        if let Some(alias) = alias {
            let alias_name = alias.name.value.clone();
            if self.mapping.contains_key(&alias_name) {
                return ControlFlow::Break(alias_name);
            }
            self.aliases.insert(alias_name, table);
        }
        ControlFlow::Continue(())
    }
}

/// Second pass: substitutes table and column identifiers.
struct Renamer<'a> {
    mapping: &'a HashMap<String, TableMapping>,
    aliases: HashMap<String, Option<String>>,
    tables: Vec<String>,
}

impl Renamer<'_> {
    fn unqualified_column(&self, column: &str) -> Option<String> {
        self.tables
            .iter()
            .filter_map(|table| self.mapping.get(table))
            .find_map(|entry| entry.columns.get(column).cloned())
    }

    fn rename_wildcards(&self, body: &mut SetExpr) {
        match body {
            SetExpr::Select(select) => {
                for item in select.projection.iter_mut() {
                    if let SelectItem::QualifiedWildcard(name, _) = item {
                        let qualifier = table_key(name);
                        if self.aliases.contains_key(&qualifier) {
                            continue;
                        }
                        if let Some(new_name) = self
                            .mapping
                            .get(&qualifier)
                            .and_then(|entry| entry.new_table_name.as_ref())
                        {
                            *name = ObjectName(vec![Ident::new(new_name.clone())]);
                        }
                    }
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.rename_wildcards(left);
                self.rename_wildcards(right);
            }
            _ => {}
        }
    }
}

impl VisitorMut for Renamer<'_> {
    type Break = ();

    fn pre_visit_relation(&mut self, relation: &mut ObjectName) -> ControlFlow<Self::Break> {
        if let Some(new_name) = self
            .mapping
            .get(&table_key(relation))
            .and_then(|entry| entry.new_table_name.as_ref())
        {
            *relation = ObjectName(vec![Ident::new(new_name.clone())]);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_query(&mut self, query: &mut Query) -> ControlFlow<Self::Break> {
        self.rename_wildcards(&mut query.body);
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => {
                if let Some(column) = self.unqualified_column(&ident.value) {
                    ident.value = column;
                }
            }
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                let column_index = parts.len() - 1;
                let qualifier = parts[column_index - 1].value.clone();
                let column = parts[column_index].value.clone();

                if let Some(target) = self.aliases.get(&qualifier) {
                    let renamed = target
                        .as_ref()
                        .and_then(|table| self.mapping.get(table))
                        .and_then(|entry| entry.columns.get(&column));
                    if let Some(renamed) = renamed {
                        parts[column_index].value = renamed.clone();
                    }
                } else if let Some(entry) = self.mapping.get(&qualifier) {
                    if let Some(renamed) = entry.columns.get(&column) {
                        parts[column_index].value = renamed.clone();
                    }
                    if let Some(new_table) = &entry.new_table_name {
                        parts[column_index - 1].value = new_table.clone();
                    }
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

/// Renames tables and columns of `sql` according to `mapping`, keyed by virtual table name.
/// An empty mapping returns the input untouched. Aliases that shadow a mapped table name are
/// refused.
pub fn rewrite_sql(sql: &str, mapping: &HashMap<String, TableMapping>) -> Result<String, RewriteError> {
    if mapping.is_empty() {
        return Ok(sql.to_string());
    }
    validate_mapping(mapping)?;

    let mut statements = parse(sql)?;

    let mut collector = AliasCollector {
        mapping,
        aliases: HashMap::new(),
        tables: Vec::new(),
    };
    if let ControlFlow::Break(alias) = Visit::visit(&statements, &mut collector) {
        return Err(RewriteError::AliasConflict(alias));
    }

    let mut renamer = Renamer {
        mapping,
        aliases: collector.aliases,
        tables: collector.tables,
    };
    let _ = VisitMut::visit(&mut statements, &mut renamer);

    Ok(statements
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; "))
}

/// Classifies the first statement of `sql`; unparsable input is `Unknown`.
pub fn sql_operation(sql: &str) -> SqlOperation {
    let Ok(statements) = parse(sql) else {
        return SqlOperation::Unknown;
    };
    match statements.first() {
        Some(Statement::Query(_)) => SqlOperation::Select,
        Some(Statement::Insert(_)) => SqlOperation::Insert,
        Some(Statement::Update { .. }) => SqlOperation::Update,
        Some(Statement::Delete(_)) => SqlOperation::Delete,
        Some(Statement::CreateTable(_)) | Some(Statement::CreateIndex(_)) => SqlOperation::Create,
        Some(Statement::AlterTable { .. }) => SqlOperation::Alter,
        Some(Statement::Drop { .. }) => SqlOperation::Drop,
        Some(Statement::Truncate { .. }) => SqlOperation::Truncate,
        _ => SqlOperation::Unknown,
    }
}

/// Distinct table names referenced by `sql`, in order of appearance.
pub fn table_names(sql: &str) -> Result<Vec<String>, RewriteError> {
    let statements = parse(sql)?;
    let mut names: Vec<String> = Vec::new();
    let _ = visit_relations(&statements, |relation| {
        let name = table_key(relation);
        if !names.contains(&name) {
            names.push(name);
        }
        ControlFlow::<()>::Continue(())
    });
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_mapping() -> HashMap<String, TableMapping> {
        HashMap::from([(
            "users".to_string(),
            TableMapping {
                new_table_name: Some("table_9".to_string()),
                columns: HashMap::from([
                    ("name".to_string(), "col_1".to_string()),
                    ("age".to_string(), "col_2".to_string()),
                ]),
            },
        )])
    }

    #[test]
    fn empty_mapping_is_identity() -> Result<(), Box<dyn std::error::Error>> {
        let sql = "select  Name from   `users` where age>3";
        assert_eq!(rewrite_sql(sql, &HashMap::new())?, sql);
        Ok(())
    }

    #[test]
    fn unqualified_and_qualified_names_are_rewritten() -> Result<(), Box<dyn std::error::Error>> {
        let rewritten = rewrite_sql(
            "SELECT name, users.age FROM users WHERE age > 30 ORDER BY name",
            &users_mapping(),
        )?;
        assert_eq!(
            rewritten,
            "SELECT col_1, table_9.col_2 FROM table_9 WHERE col_2 > 30 ORDER BY col_1"
        );
        Ok(())
    }

    #[test]
    fn aliases_resolve_to_their_table() -> Result<(), Box<dyn std::error::Error>> {
        let rewritten = rewrite_sql("SELECT u.name, u.* FROM users AS u WHERE u.age < 5", &users_mapping())?;
        assert_eq!(rewritten, "SELECT u.col_1, u.* FROM table_9 AS u WHERE u.col_2 < 5");
        assert!(!rewritten.contains("users"));
        Ok(())
    }

    #[test]
    fn qualified_wildcard_on_real_table_is_renamed() -> Result<(), Box<dyn std::error::Error>> {
        let rewritten = rewrite_sql("SELECT users.* FROM users", &users_mapping())?;
        assert_eq!(rewritten, "SELECT table_9.* FROM table_9");
        Ok(())
    }

    #[test]
    fn alias_shadowing_a_mapped_table_is_refused() {
        let mut mapping = users_mapping();
        mapping.insert("orders".to_string(), TableMapping::default());
        let result = rewrite_sql("SELECT orders.name FROM users AS orders", &mapping);
        assert!(matches!(result, Err(RewriteError::AliasConflict(alias)) if alias == "orders"));
    }

    #[test]
    fn half_empty_column_mapping_is_invalid() {
        let mapping = HashMap::from([(
            "users".to_string(),
            TableMapping {
                new_table_name: None,
                columns: HashMap::from([("name".to_string(), String::new())]),
            },
        )]);
        assert!(matches!(
            rewrite_sql("SELECT name FROM users", &mapping),
            Err(RewriteError::InvalidMapping(_))
        ));
    }

    #[test]
    fn garbage_sql_is_a_parse_error() {
        assert!(matches!(
            rewrite_sql("SELEC name FROM", &users_mapping()),
            Err(RewriteError::Parse(_))
        ));
    }

    #[test]
    fn statements_are_classified() {
        assert_eq!(sql_operation("SELECT 1"), SqlOperation::Select);
        assert_eq!(sql_operation("WITH x AS (SELECT 1) SELECT * FROM x"), SqlOperation::Select);
        assert_eq!(sql_operation("INSERT INTO t (a) VALUES (1)"), SqlOperation::Insert);
        assert_eq!(sql_operation("UPDATE t SET a = 1"), SqlOperation::Update);
        assert_eq!(sql_operation("DELETE FROM t WHERE a = 1"), SqlOperation::Delete);
        assert_eq!(sql_operation("DROP TABLE t"), SqlOperation::Drop);
        assert_eq!(sql_operation("not sql at all"), SqlOperation::Unknown);
    }

    #[test]
    fn referenced_tables_are_listed_once() -> Result<(), Box<dyn std::error::Error>> {
        let names = table_names("SELECT * FROM a JOIN b ON a.id = b.id WHERE a.x IN (SELECT x FROM a)")?;
        assert_eq!(names, vec!["a", "b"]);
        Ok(())
    }
}
