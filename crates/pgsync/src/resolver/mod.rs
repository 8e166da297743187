//! Turns identifiers, groups and defaults into an ordered list of tables to sync.
//!
//! Resolution is pure: the live catalog is captured up front in a
//! [`ResolverContext`], so every error surfaces before any table is touched.

use crate::config::{split_list, GroupEntry, ResolveOptions};
use crate::core::Table;
use crate::error::{Result, SyncError};
use crate::rules::wildcard_regex;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Catalog facts resolution depends on.
#[derive(Debug, Clone, Default)]
pub struct ResolverContext {
    /// Source tables, sorted.
    pub source_tables: Vec<Table>,
    /// Source search path, in priority order.
    pub search_path: Vec<String>,
    /// Destination tables. `None` for schema-only runs.
    pub destination_tables: Option<Vec<Table>>,
}

/// One table to sync and its SQL filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTask {
    pub table: Table,
    pub sql: Option<String>,
}

/// Resolver output.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub tasks: Vec<ResolvedTask>,
    /// Table-level drift found while expanding patterns and defaults.
    pub notes: Vec<String>,
}

/// A task before its table name is qualified.
struct Pending {
    table: String,
    sql: Option<String>,
}

pub struct TaskResolver<'a> {
    opts: &'a ResolveOptions,
    groups: &'a BTreeMap<String, Vec<GroupEntry>>,
    ctx: &'a ResolverContext,
    notes: Vec<String>,
}

impl<'a> TaskResolver<'a> {
    pub fn new(
        opts: &'a ResolveOptions,
        groups: &'a BTreeMap<String, Vec<GroupEntry>>,
        ctx: &'a ResolverContext,
    ) -> Self {
        Self {
            opts,
            groups,
            ctx,
            notes: Vec::new(),
        }
    }

    pub fn resolve(mut self) -> Result<Resolution> {
        if self.opts.args.len() > 2 {
            return Err(SyncError::Config("Usage:\n    pgsync [options]".into()));
        }

        let (groups, tables) = self.classify();
        let mut pending = Vec::new();

        for group in &groups {
            pending.extend(self.group_to_tasks(group)?);
        }
        for table in &tables {
            pending.extend(self.table_to_tasks(table)?);
        }
        if groups.is_empty() && tables.is_empty() {
            pending.extend(self.default_tasks()?);
        }

        let mut seen = HashSet::new();
        let mut tasks = Vec::new();
        for task in pending {
            let table = self.fully_resolve(&task.table)?;
            if seen.insert(table.clone()) {
                tasks.push(ResolvedTask { table, sql: task.sql });
            } else {
                debug!("Skipping duplicate table {}", table);
            }
        }

        Ok(Resolution {
            tasks,
            notes: self.notes,
        })
    }

    fn is_group(&self, value: &str) -> bool {
        let name = value.split_once(':').map_or(value, |(name, _)| name);
        self.groups.contains_key(name)
    }

    /// Split identifiers into groups and table patterns. Groups win by name.
    fn classify(&self) -> (Vec<String>, Vec<String>) {
        let mut groups = self.opts.groups.clone();
        let mut tables = self.opts.tables.clone();

        if let Some(first) = self.opts.args.first() {
            for value in split_list(first) {
                if self.is_group(&value) {
                    groups.push(value);
                } else {
                    tables.push(value);
                }
            }
        }

        (groups, tables)
    }

    fn sql_arg(&self) -> Option<&str> {
        self.opts.args.get(1).map(String::as_str)
    }

    fn group_to_tasks(&self, value: &str) -> Result<Vec<Pending>> {
        let (name, param) = match value.split_once(':') {
            Some((name, param)) => (name, Some(param)),
            None => (value, None),
        };
        let entries = self
            .groups
            .get(name)
            .ok_or_else(|| SyncError::Config(format!("Group not found: {}", name)))?;

        entries
            .iter()
            .map(|entry| {
                Ok(Pending {
                    table: entry.table().to_string(),
                    sql: self.expand_sql(entry.sql(), param)?,
                })
            })
            .collect()
    }

    fn table_to_tasks(&mut self, value: &str) -> Result<Vec<Pending>> {
        if value.contains(':') {
            return Err(SyncError::Config("Cannot use parameters with tables".into()));
        }

        let sql = self.expand_sql(None, None)?;
        if !value.contains('*') {
            return Ok(vec![Pending {
                table: value.to_string(),
                sql,
            }]);
        }

        let pattern = wildcard_regex(value)?;
        let matched: Vec<Table> = self
            .ctx
            .source_tables
            .iter()
            .filter(|table| matches_table(&pattern, table))
            .filter(|table| !self.is_excluded(table))
            .cloned()
            .collect();

        let destination: Option<Vec<Table>> = self.ctx.destination_tables.as_ref().map(|tables| {
            tables
                .iter()
                .filter(|table| matches_table(&pattern, table))
                .filter(|table| !self.is_excluded(table))
                .cloned()
                .collect()
        });

        Ok(self
            .intersect(matched, destination)
            .into_iter()
            .map(|table| Pending {
                table: table.full_name(),
                sql: sql.clone(),
            })
            .collect())
    }

    fn default_tasks(&mut self) -> Result<Vec<Pending>> {
        let schemas: Option<HashSet<&str>> = if self.opts.all_schemas {
            None
        } else {
            Some(match &self.opts.schemas {
                Some(schemas) => schemas.iter().map(String::as_str).collect(),
                None => self.ctx.search_path.iter().map(String::as_str).collect(),
            })
        };
        let in_scope = |table: &Table| {
            schemas
                .as_ref()
                .map_or(true, |schemas| schemas.contains(table.schema()))
        };

        let source: Vec<Table> = self
            .ctx
            .source_tables
            .iter()
            .filter(|table| in_scope(table) && !self.is_excluded(table))
            .cloned()
            .collect();
        let destination: Option<Vec<Table>> = self.ctx.destination_tables.as_ref().map(|tables| {
            tables
                .iter()
                .filter(|table| in_scope(table) && !self.is_excluded(table))
                .cloned()
                .collect()
        });

        Ok(self
            .intersect(source, destination)
            .into_iter()
            .map(|table| Pending {
                table: table.full_name(),
                sql: None,
            })
            .collect())
    }

    /// Keep tables present on both sides, noting the rest.
    fn intersect(&mut self, source: Vec<Table>, destination: Option<Vec<Table>>) -> Vec<Table> {
        let Some(destination) = destination else {
            return source;
        };
        let source_set: BTreeSet<&Table> = source.iter().collect();
        let destination_set: BTreeSet<&Table> = destination.iter().collect();

        let extra: Vec<String> = destination_set
            .difference(&source_set)
            .map(|t| t.full_name())
            .collect();
        if !extra.is_empty() {
            self.notes.push(format!("Extra tables: {}", extra.join(", ")));
        }
        let missing: Vec<String> = source_set
            .difference(&destination_set)
            .map(|t| t.full_name())
            .collect();
        if !missing.is_empty() {
            self.notes.push(format!("Missing tables: {}", missing.join(", ")));
        }

        source
            .into_iter()
            .filter(|table| destination_set.contains(table))
            .collect()
    }

    fn is_excluded(&self, table: &Table) -> bool {
        self.opts.exclude.iter().any(|pattern| {
            if pattern.contains('*') {
                wildcard_regex(pattern)
                    .map(|regex| matches_table(&regex, table))
                    .unwrap_or(false)
            } else if pattern.contains('.') {
                table.full_name() == *pattern
            } else {
                self.unqualified_index().get(pattern.as_str()) == Some(&table)
            }
        })
    }

    /// Bare name to the table the search path picks for it.
    fn unqualified_index(&self) -> HashMap<&str, &Table> {
        let rank: HashMap<&str, usize> = self
            .ctx
            .search_path
            .iter()
            .enumerate()
            .map(|(i, schema)| (schema.as_str(), i))
            .collect();

        let mut index: HashMap<&str, &Table> = HashMap::new();
        for table in &self.ctx.source_tables {
            let key = |t: &Table| (rank.get(t.schema()).copied().unwrap_or(usize::MAX), t.full_name());
            match index.get(table.name()) {
                Some(current) if key(current) <= key(table) => {}
                _ => {
                    index.insert(table.name(), table);
                }
            }
        }
        index
    }

    fn fully_resolve(&self, name: &str) -> Result<Table> {
        if let Some(table) = Table::parse_qualified(name) {
            return Ok(table);
        }
        self.unqualified_index()
            .get(name)
            .map(|table| (*table).clone())
            .ok_or_else(|| SyncError::Config(format!("Table not found in source: {}", name)))
    }

    /// Pick the SQL for a task and fill its `{name}` placeholders.
    ///
    /// A positional SQL argument overrides the group's template. A `:param`
    /// suffix on the group supplies `{id}` and `{1}`.
    fn expand_sql(&self, template: Option<&str>, param: Option<&str>) -> Result<Option<String>> {
        let Some(sql) = self.sql_arg().or(template) else {
            return Ok(None);
        };

        let mut vars: HashMap<&str, String> = self
            .opts
            .variables
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        if let Some(param) = param {
            let value = strip_quotes(param);
            vars.insert("id", value.clone());
            vars.insert("1", value);
        }

        substitute(sql, &vars).map(Some)
    }
}

fn matches_table(pattern: &Regex, table: &Table) -> bool {
    pattern.is_match(&table.full_name()) || pattern.is_match(table.name())
}

fn strip_quotes(value: &str) -> String {
    let value = value.strip_prefix('"').unwrap_or(value);
    value.strip_suffix('"').unwrap_or(value).to_string()
}

/// Replace `{name}` placeholders, failing on any without a value.
pub fn substitute(sql: &str, vars: &HashMap<&str, String>) -> Result<String> {
    let placeholder = Regex::new(r"\{(\w+)\}")
        .map_err(|e| SyncError::Config(format!("Invalid placeholder pattern: {}", e)))?;

    let mut missing: Vec<String> = Vec::new();
    for caps in placeholder.captures_iter(sql) {
        let name = &caps[1];
        if !vars.contains_key(name) && !missing.iter().any(|m| m == name) {
            missing.push(name.to_string());
        }
    }
    if !missing.is_empty() {
        return Err(SyncError::MissingVariable(missing));
    }

    Ok(placeholder
        .replace_all(sql, |caps: &regex::Captures| {
            vars.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned())
}

/// Table name as shown to users: the first search path schema is implied.
pub fn display_name(table: &Table, first_schema: Option<&str>) -> String {
    match first_schema {
        Some(schema) if table.schema() == schema => table.name().to_string(),
        _ => table.full_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(name: &str) -> Table {
        Table::parse_qualified(name).unwrap()
    }

    fn context() -> ResolverContext {
        ResolverContext {
            source_tables: vec![
                t("other.posts"),
                t("public.comments"),
                t("public.posts"),
                t("public.robots"),
                t("public.schema_migrations"),
            ],
            search_path: vec!["pg_catalog".into(), "public".into()],
            destination_tables: Some(vec![
                t("other.posts"),
                t("public.comments"),
                t("public.posts"),
                t("public.schema_migrations"),
                t("public.users"),
            ]),
        }
    }

    fn groups() -> BTreeMap<String, Vec<GroupEntry>> {
        let mut groups = BTreeMap::new();
        groups.insert(
            "blog".to_string(),
            vec![
                GroupEntry::Table("posts".into()),
                GroupEntry::WithSql("comments".into(), "WHERE post_id = {id}".into()),
            ],
        );
        groups.insert(
            "scoped".to_string(),
            vec![GroupEntry::WithSql(
                "posts".into(),
                "WHERE org = {org} AND id > {min}".into(),
            )],
        );
        groups
    }

    fn resolve(opts: ResolveOptions) -> Result<Resolution> {
        let groups = groups();
        let ctx = context();
        TaskResolver::new(&opts, &groups, &ctx).resolve()
    }

    fn args(values: &[&str]) -> ResolveOptions {
        ResolveOptions {
            args: values.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn names(resolution: &Resolution) -> Vec<String> {
        resolution.tasks.iter().map(|t| t.table.full_name()).collect()
    }

    #[test]
    fn test_default_uses_search_path_and_destination() {
        let resolution = resolve(ResolveOptions::default()).unwrap();
        assert_eq!(
            names(&resolution),
            ["public.comments", "public.posts", "public.schema_migrations"]
        );
        assert_eq!(
            resolution.notes,
            ["Extra tables: public.users", "Missing tables: public.robots"]
        );
    }

    #[test]
    fn test_default_exclude_and_all_schemas() {
        let opts = ResolveOptions {
            exclude: vec!["schema_migrations".into()],
            all_schemas: true,
            ..Default::default()
        };
        let resolution = resolve(opts).unwrap();
        assert_eq!(
            names(&resolution),
            ["other.posts", "public.comments", "public.posts"]
        );
    }

    #[test]
    fn test_default_explicit_schemas() {
        let opts = ResolveOptions {
            schemas: Some(vec!["other".into()]),
            ..Default::default()
        };
        assert_eq!(names(&resolve(opts).unwrap()), ["other.posts"]);
    }

    #[test]
    fn test_unknown_destination_keeps_all_tables() {
        let groups = groups();
        let mut ctx = context();
        ctx.destination_tables = None;
        let opts = ResolveOptions::default();
        let resolution = TaskResolver::new(&opts, &groups, &ctx).resolve().unwrap();
        assert!(names(&resolution).contains(&"public.robots".to_string()));
        assert!(resolution.notes.is_empty());
    }

    #[test]
    fn test_unqualified_uses_earliest_search_path_schema() {
        let resolution = resolve(args(&["posts"])).unwrap();
        assert_eq!(names(&resolution), ["public.posts"]);

        let groups = groups();
        let mut ctx = context();
        ctx.search_path = vec!["other".into(), "public".into()];
        let opts = args(&["posts"]);
        let resolution = TaskResolver::new(&opts, &groups, &ctx).resolve().unwrap();
        assert_eq!(names(&resolution), ["other.posts"]);
    }

    #[test]
    fn test_unknown_table_is_error() {
        let err = resolve(args(&["nope"])).unwrap_err();
        assert_eq!(err.to_string(), "Table not found in source: nope");
    }

    #[test]
    fn test_wildcard_matches_full_or_bare_name() {
        let resolution = resolve(args(&["public.*"])).unwrap();
        assert_eq!(
            names(&resolution),
            ["public.comments", "public.posts", "public.schema_migrations"]
        );

        let resolution = resolve(args(&["p*"])).unwrap();
        assert_eq!(names(&resolution), ["other.posts", "public.posts"]);
    }

    #[test]
    fn test_group_with_param() {
        let resolution = resolve(args(&["blog:123"])).unwrap();
        assert_eq!(names(&resolution), ["public.posts", "public.comments"]);
        assert_eq!(resolution.tasks[0].sql, None);
        assert_eq!(
            resolution.tasks[1].sql.as_deref(),
            Some("WHERE post_id = 123")
        );
    }

    #[test]
    fn test_group_missing_variable() {
        let err = resolve(args(&["blog"])).unwrap_err();
        assert!(matches!(err, SyncError::MissingVariable(ref v) if v == &["id"]));
    }

    #[test]
    fn test_group_with_variables() {
        let mut opts = args(&["scoped"]);
        opts.variables.insert("org".into(), "7".into());
        let err = resolve(opts.clone()).unwrap_err();
        assert_eq!(err.to_string(), "Missing variables: min");

        opts.variables.insert("min".into(), "100".into());
        let resolution = resolve(opts).unwrap();
        assert_eq!(
            resolution.tasks[0].sql.as_deref(),
            Some("WHERE org = 7 AND id > 100")
        );
    }

    #[test]
    fn test_sql_argument_overrides_group_template() {
        let resolution = resolve(args(&["blog", "WHERE id < 10"])).unwrap();
        assert!(resolution
            .tasks
            .iter()
            .all(|task| task.sql.as_deref() == Some("WHERE id < 10")));
    }

    #[test]
    fn test_table_with_param_rejected() {
        let err = resolve(args(&["posts:1"])).unwrap_err();
        assert_eq!(err.to_string(), "Cannot use parameters with tables");
    }

    #[test]
    fn test_unknown_group_flag() {
        let opts = ResolveOptions {
            groups: vec!["missing".into()],
            ..Default::default()
        };
        assert_eq!(resolve(opts).unwrap_err().to_string(), "Group not found: missing");
    }

    #[test]
    fn test_mixed_list_deduplicates() {
        let resolution = resolve(args(&["blog:1,posts,comments"])).unwrap();
        assert_eq!(names(&resolution), ["public.posts", "public.comments"]);
    }

    #[test]
    fn test_too_many_arguments() {
        assert!(resolve(args(&["a", "b", "c"])).is_err());
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name(&t("public.posts"), Some("public")), "posts");
        assert_eq!(display_name(&t("other.posts"), Some("public")), "other.posts");
        assert_eq!(display_name(&t("other.posts"), None), "other.posts");
    }
}
