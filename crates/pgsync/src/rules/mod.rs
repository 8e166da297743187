//! Anonymization rules.
//!
//! A rule maps a column pattern (`column`, `table.column` or
//! `schema.table.column`, where `*` matches within one segment) to a
//! replacement expression rendered into the copy select list:
//!
//! ```yaml
//! data_rules:
//!   email: unique_email
//!   users.last_name:
//!     value: Smith
//!   "*.token":
//!     statement: "md5(random()::text)"
//! ```
//!
//! Rules keep their file order; the first matching pattern wins.

use crate::core::identifier::{quote_column, quote_literal};
use crate::core::Table;
use crate::error::{Result, SyncError};
use regex::Regex;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::fmt;
use std::str::FromStr;

/// Named strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Untouched,
    UniqueEmail,
    UniquePhone,
    UniqueSecret,
    RandomInt,
    RandomDate,
    RandomTime,
    RandomIp,
    RandomLetter,
    RandomString,
    Null,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Untouched => "untouched",
            Strategy::UniqueEmail => "unique_email",
            Strategy::UniquePhone => "unique_phone",
            Strategy::UniqueSecret => "unique_secret",
            Strategy::RandomInt => "random_int",
            Strategy::RandomDate => "random_date",
            Strategy::RandomTime => "random_time",
            Strategy::RandomIp => "random_ip",
            Strategy::RandomLetter => "random_letter",
            Strategy::RandomString => "random_string",
            Strategy::Null => "null",
        }
    }

    /// Whether the expression is a function of the destination primary key.
    pub fn needs_primary_key(&self) -> bool {
        matches!(
            self,
            Strategy::UniqueEmail | Strategy::UniquePhone | Strategy::UniqueSecret
        )
    }
}

impl FromStr for Strategy {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "untouched" => Ok(Strategy::Untouched),
            "unique_email" => Ok(Strategy::UniqueEmail),
            "unique_phone" => Ok(Strategy::UniquePhone),
            "unique_secret" => Ok(Strategy::UniqueSecret),
            "random_int" | "random_number" => Ok(Strategy::RandomInt),
            "random_date" => Ok(Strategy::RandomDate),
            "random_time" => Ok(Strategy::RandomTime),
            "random_ip" => Ok(Strategy::RandomIp),
            "random_letter" => Ok(Strategy::RandomLetter),
            "random_string" => Ok(Strategy::RandomString),
            "null" => Ok(Strategy::Null),
            _ => Err(()),
        }
    }
}

/// A recognized rule.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    /// Literal value, inlined as a SQL literal.
    Value(Value),
    /// SQL expression taken verbatim from configuration.
    Statement(String),
    Strategy(Strategy),
}

impl Rule {
    /// Interpret a configured rule. `None` when it is not recognized.
    pub fn from_value(value: &Value) -> Option<Rule> {
        match value {
            Value::Null => Some(Rule::Strategy(Strategy::Null)),
            Value::String(name) => name.parse().ok().map(Rule::Strategy),
            Value::Mapping(map) => {
                if let Some(value) = map.get("value") {
                    Some(Rule::Value(value.clone()))
                } else {
                    map.get("statement")
                        .and_then(Value::as_str)
                        .map(|s| Rule::Statement(s.to_string()))
                }
            }
            _ => None,
        }
    }

    /// Render the replacement expression for `column` of `table`.
    pub fn render(&self, table: &Table, column: &str, primary_key: &[String]) -> Result<String> {
        let expr = match self {
            Rule::Value(value) => literal(value, column)?,
            Rule::Statement(sql) => sql.clone(),
            Rule::Strategy(strategy) => {
                let pk = if strategy.needs_primary_key() {
                    match primary_key {
                        [single] => quote_column(table, single),
                        _ => {
                            return Err(SyncError::Precondition(format!(
                                "Single column primary key required for this data rule: {}",
                                strategy.name()
                            )))
                        }
                    }
                } else {
                    String::new()
                };

                match strategy {
                    Strategy::Untouched => quote_column(table, column),
                    Strategy::UniqueEmail => format!("'email' || {}::text || '@example.org'", pk),
                    Strategy::UniquePhone => format!("({}::bigint + 1000000000)::text", pk),
                    Strategy::UniqueSecret => format!("'secret' || {}::text", pk),
                    Strategy::RandomInt => "(RANDOM() * 100)::int".to_string(),
                    Strategy::RandomDate => "date '1970-01-01' + (RANDOM() * 10000)::int".to_string(),
                    Strategy::RandomTime => {
                        "NOW() - (RANDOM() * 100000000)::int * INTERVAL '1 second'".to_string()
                    }
                    Strategy::RandomIp => "(1 + RANDOM() * 254)::int::text || '.0.0.1'".to_string(),
                    Strategy::RandomLetter => "chr(65 + (RANDOM() * 26)::int)".to_string(),
                    Strategy::RandomString => "RIGHT(MD5(RANDOM()::text), 10)".to_string(),
                    Strategy::Null => "NULL".to_string(),
                }
            }
        };
        Ok(expr)
    }
}

fn literal(value: &Value, column: &str) -> Result<String> {
    match value {
        Value::Null => Ok("NULL".to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(quote_literal(s)),
        other => Err(unknown_rule(other, column)),
    }
}

fn unknown_rule(value: &Value, column: &str) -> SyncError {
    SyncError::Config(format!("Unknown rule {} for column {}", describe(value), column))
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| format!("{:?}", other)),
    }
}

/// One configured pattern and its rule as written.
#[derive(Debug, Clone)]
pub struct DataRule {
    pattern: String,
    matcher: Regex,
    value: Value,
}

impl DataRule {
    pub fn new(pattern: impl Into<String>, value: Value) -> Result<Self> {
        let pattern = pattern.into();
        let matcher = wildcard_regex(&pattern)?;
        Ok(Self {
            pattern,
            matcher,
            value,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether the pattern names this column.
    pub fn matches(&self, table: &Table, column: &str) -> bool {
        self.matcher.is_match(column)
            || self
                .matcher
                .is_match(&format!("{}.{}", table.name(), column))
            || self
                .matcher
                .is_match(&format!("{}.{}.{}", table.schema(), table.name(), column))
    }

    /// Render this rule for a column, failing on unrecognized rules.
    pub fn render(&self, table: &Table, column: &str, primary_key: &[String]) -> Result<String> {
        let rule = Rule::from_value(&self.value).ok_or_else(|| unknown_rule(&self.value, column))?;
        rule.render(table, column, primary_key)
    }
}

/// Compile a pattern where `*` matches anything but a dot.
pub fn wildcard_regex(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern).replace(r"\*", "[^.]*");
    Regex::new(&format!("^{}$", escaped))
        .map_err(|e| SyncError::Config(format!("Invalid pattern {}: {}", pattern, e)))
}

/// Ordered rule table.
#[derive(Debug, Clone, Default)]
pub struct DataRules(Vec<DataRule>);

impl DataRules {
    pub fn new(rules: Vec<DataRule>) -> Self {
        Self(rules)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(DataRule::pattern)
    }

    /// First rule matching the column, in file order.
    pub fn find(&self, table: &Table, column: &str) -> Option<&DataRule> {
        self.0.iter().find(|rule| rule.matches(table, column))
    }

    /// Patterns whose rule is not recognized.
    pub fn unknown(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|rule| Rule::from_value(&rule.value).is_none())
            .map(|rule| format!("{} ({})", rule.pattern, describe(&rule.value)))
            .collect()
    }
}

impl<'de> Deserialize<'de> for DataRules {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RulesVisitor;

        impl<'de> Visitor<'de> for RulesVisitor {
            type Value = DataRules;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of column patterns to rules")
            }

            fn visit_unit<E: de::Error>(self) -> std::result::Result<DataRules, E> {
                Ok(DataRules::default())
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<DataRules, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut rules = Vec::new();
                while let Some((pattern, value)) = map.next_entry::<String, Value>()? {
                    rules.push(DataRule::new(pattern, value).map_err(de::Error::custom)?);
                }
                Ok(DataRules(rules))
            }
        }

        deserializer.deserialize_map(RulesVisitor)
    }
}

impl Serialize for DataRules {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for rule in &self.0 {
            map.serialize_entry(&rule.pattern, &rule.value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(yaml: &str) -> DataRules {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn users() -> Table {
        Table::new("public", "users")
    }

    #[test]
    fn test_match_levels() {
        let table = users();
        let rule = DataRule::new("email", Value::Null).unwrap();
        assert!(rule.matches(&table, "email"));
        assert!(!rule.matches(&table, "email2"));

        let rule = DataRule::new("users.email", Value::Null).unwrap();
        assert!(rule.matches(&table, "email"));
        assert!(!rule.matches(&Table::new("public", "admins"), "email"));

        let rule = DataRule::new("public.users.email", Value::Null).unwrap();
        assert!(rule.matches(&table, "email"));
        assert!(!rule.matches(&Table::new("other", "users"), "email"));
    }

    #[test]
    fn test_wildcard_stays_in_segment() {
        let table = users();
        let rule = DataRule::new("*.email", Value::Null).unwrap();
        assert!(rule.matches(&table, "email"));

        let rule = DataRule::new("e*", Value::Null).unwrap();
        assert!(rule.matches(&table, "email"));
        // `*` never crosses a dot, so the bare pattern only sees the column
        assert!(!rule.matches(&table, "name"));

        let rule = DataRule::new("users.*", Value::Null).unwrap();
        assert!(rule.matches(&table, "anything"));
    }

    #[test]
    fn test_first_match_wins_in_file_order() {
        let rules = rules("users.email: untouched\nemail: unique_email\n");
        let rule = rules.find(&users(), "email").unwrap();
        assert_eq!(rule.pattern(), "users.email");
    }

    #[test]
    fn test_unique_email_uses_primary_key() {
        let rules = rules("email: unique_email");
        let rule = rules.find(&users(), "email").unwrap();
        let expr = rule.render(&users(), "email", &["id".to_string()]).unwrap();
        assert_eq!(
            expr,
            "'email' || \"public\".\"users\".\"id\"::text || '@example.org'"
        );
    }

    #[test]
    fn test_primary_key_strategies_need_single_column() {
        let table = users();
        let rule = Rule::Strategy(Strategy::UniquePhone);
        let err = rule.render(&table, "phone", &[]).unwrap_err();
        assert!(matches!(err, SyncError::Precondition(_)));

        let pk = vec!["a".to_string(), "b".to_string()];
        assert!(rule.render(&table, "phone", &pk).is_err());

        // other strategies do not care
        assert_eq!(
            Rule::Strategy(Strategy::RandomLetter).render(&table, "x", &[]).unwrap(),
            "chr(65 + (RANDOM() * 26)::int)"
        );
    }

    #[test]
    fn test_value_and_statement() {
        let rules = rules(
            "last_name:\n  value: O'Brien\nage:\n  value: 42\ntoken:\n  statement: md5(random()::text)\n",
        );
        let table = users();
        let render = |col: &str| rules.find(&table, col).unwrap().render(&table, col, &[]).unwrap();
        assert_eq!(render("last_name"), "'O''Brien'");
        assert_eq!(render("age"), "42");
        assert_eq!(render("token"), "md5(random()::text)");
    }

    #[test]
    fn test_null_forms() {
        let rules = rules("a: null\nb: \"null\"\n");
        let table = users();
        for col in ["a", "b"] {
            let expr = rules.find(&table, col).unwrap().render(&table, col, &[]).unwrap();
            assert_eq!(expr, "NULL");
        }
    }

    #[test]
    fn test_random_number_alias() {
        assert_eq!("random_number".parse::<Strategy>(), Ok(Strategy::RandomInt));
    }

    #[test]
    fn test_unknown_rule_errors() {
        let rules = rules("email: scramble\nphone:\n  other: 1\n");
        let table = users();
        let err = rules.find(&table, "email").unwrap().render(&table, "email", &[]).unwrap_err();
        assert_eq!(err.to_string(), "Unknown rule scramble for column email");
        assert!(rules.find(&table, "phone").unwrap().render(&table, "phone", &[]).is_err());
        assert_eq!(rules.unknown().len(), 2);
    }

    #[test]
    fn test_order_preserved_through_serialize() {
        let rules = rules("z: null\na: untouched\n");
        let yaml = serde_yaml::to_string(&rules).unwrap();
        assert!(yaml.find("z:").unwrap() < yaml.find("a:").unwrap());
    }
}
