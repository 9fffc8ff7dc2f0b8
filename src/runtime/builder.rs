//! Query builder: the value exported by an execution

use serde::Serialize;
use serde_json::Value;

/// A parameterized query assembled by executing a template
///
/// Text is appended verbatim to `statement`. Bound values never appear in
/// the statement; they are replaced by numbered placeholders (`$1`, `$2`,
/// ...) and collected in `parameters`.
///
/// The builder remembers where each placeholder it wrote sits, so appending
/// one builder to another renumbers only real placeholders and leaves any
/// `$1` that came in as raw text alone.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct QueryBuilder {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub statement: String,
    pub parameters: Vec<Value>,
    /// Byte offset of the `$` of placeholder `i + 1`
    #[serde(skip)]
    placeholders: Vec<usize>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn push_sql(&mut self, sql: &str) {
        self.statement.push_str(sql);
    }

    /// Bind `value` as the next parameter and append its placeholder
    pub fn bind(&mut self, value: Value) {
        self.parameters.push(value);
        self.push_placeholder(self.parameters.len());
    }

    fn push_placeholder(&mut self, n: usize) {
        self.placeholders.push(self.statement.len());
        self.statement.push('$');
        self.statement.push_str(&n.to_string());
    }

    /// Append another builder, renumbering its placeholders after ours
    pub fn append(&mut self, other: QueryBuilder) {
        let offset = self.parameters.len();
        let mut copied = 0;
        for (i, &at) in other.placeholders.iter().enumerate() {
            let end = at + 1 + (i + 1).to_string().len();
            self.statement.push_str(&other.statement[copied..at]);
            self.push_placeholder(offset + i + 1);
            copied = end;
        }
        self.statement.push_str(&other.statement[copied..]);
        self.parameters.extend(other.parameters);
    }

    /// Trim surrounding whitespace from the statement
    pub fn trim(&mut self) {
        let leading = self.statement.len() - self.statement.trim_start().len();
        self.statement = self.statement.trim().to_string();
        for at in &mut self.placeholders {
            *at -= leading;
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
