//! Query filters
//!
//! A tagged-union filter AST replacing the loosely-shaped filter objects
//! the vendor API accepts: leaves are `{op, field, value}` nodes, groups
//! compose with `and`/`or`. Validation is exhaustive and happens at the
//! boundary, before a query body is built.

use meridian_error::{ApiError, Result};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use serde_json::{json, Value};

/// Comparison operators the vendor accepts on leaf conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)] // Names mirror the wire format
pub enum FilterOp {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    BeginsWith,
    EndsWith,
    Exist,
    NotExist,
    In,
    NotIn,
}

impl FilterOp {
    /// Wire name of the operator.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::NotEq => "noteq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Contains => "contains",
            Self::BeginsWith => "beginsWith",
            Self::EndsWith => "endsWith",
            Self::Exist => "exist",
            Self::NotExist => "notExist",
            Self::In => "in",
            Self::NotIn => "notIn",
        }
    }

    fn takes_value(self) -> bool {
        !matches!(self, Self::Exist | Self::NotExist)
    }

    fn takes_array(self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }
}

/// A filter expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Leaf condition on one field.
    Condition {
        /// Comparison operator.
        op: FilterOp,
        /// Entity field name.
        field: String,
        /// Comparison value; `None` only for `exist`/`notExist`.
        value: Option<Value>,
    },
    /// Every child must match.
    And(Vec<Filter>),
    /// At least one child must match.
    Or(Vec<Filter>),
}

impl Filter {
    fn condition(op: FilterOp, field: impl Into<String>, value: Value) -> Self {
        Self::Condition {
            op,
            field: field.into(),
            value: Some(value),
        }
    }

    /// `field == value`
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(FilterOp::Eq, field, value.into())
    }

    /// `field != value`
    pub fn not_eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(FilterOp::NotEq, field, value.into())
    }

    /// `field > value`
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(FilterOp::Gt, field, value.into())
    }

    /// `field >= value`
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(FilterOp::Gte, field, value.into())
    }

    /// `field < value`
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(FilterOp::Lt, field, value.into())
    }

    /// `field <= value`
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(FilterOp::Lte, field, value.into())
    }

    /// Substring match.
    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(FilterOp::Contains, field, value.into())
    }

    /// Prefix match.
    pub fn begins_with(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(FilterOp::BeginsWith, field, value.into())
    }

    /// Suffix match.
    pub fn ends_with(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(FilterOp::EndsWith, field, value.into())
    }

    /// Field is present and non-null.
    pub fn exist(field: impl Into<String>) -> Self {
        Self::Condition {
            op: FilterOp::Exist,
            field: field.into(),
            value: None,
        }
    }

    /// Field is absent or null.
    pub fn not_exist(field: impl Into<String>) -> Self {
        Self::Condition {
            op: FilterOp::NotExist,
            field: field.into(),
            value: None,
        }
    }

    /// Field is one of `values`.
    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::condition(FilterOp::In, field, Value::Array(values))
    }

    /// Field is none of `values`.
    pub fn not_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::condition(FilterOp::NotIn, field, Value::Array(values))
    }

    /// All of `items` must match.
    #[must_use]
    pub fn and(items: Vec<Filter>) -> Self {
        Self::And(items)
    }

    /// Any of `items` must match.
    #[must_use]
    pub fn or(items: Vec<Filter>) -> Self {
        Self::Or(items)
    }

    /// Validate the whole tree against the operator rules.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Condition { op, field, value } => {
                if field.is_empty() {
                    return Err(ApiError::validation_failed(400, "filter field must not be empty"));
                }
                match value {
                    None if op.takes_value() => Err(ApiError::validation_failed(
                        400,
                        format!("operator '{}' requires a value", op.as_str()),
                    )),
                    Some(_) if !op.takes_value() => Err(ApiError::validation_failed(
                        400,
                        format!("operator '{}' takes no value", op.as_str()),
                    )),
                    Some(v) if op.takes_array() && !v.is_array() => {
                        Err(ApiError::validation_failed(
                            400,
                            format!("operator '{}' requires an array value", op.as_str()),
                        ))
                    }
                    _ => Ok(()),
                }
            }
            Self::And(items) | Self::Or(items) => {
                if items.is_empty() {
                    return Err(ApiError::validation_failed(400, "filter group must not be empty"));
                }
                items.iter().try_for_each(Filter::validate)
            }
        }
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Condition { op, field, value } => {
                let len = if value.is_some() { 3 } else { 2 };
                let mut map = serializer.serialize_map(Some(len))?;
                map.serialize_entry("op", op.as_str())?;
                map.serialize_entry("field", field)?;
                if let Some(value) = value {
                    map.serialize_entry("value", value)?;
                }
                map.end()
            }
            Self::And(items) => serialize_group(serializer, "and", items),
            Self::Or(items) => serialize_group(serializer, "or", items),
        }
    }
}

fn serialize_group<S: Serializer>(
    serializer: S,
    op: &str,
    items: &[Filter],
) -> std::result::Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(2))?;
    map.serialize_entry("op", op)?;
    map.serialize_entry("items", &Items(items))?;
    map.end()
}

struct Items<'a>(&'a [Filter]);

impl Serialize for Items<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for item in self.0 {
            seq.serialize_element(item)?;
        }
        seq.end()
    }
}

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// A full query: filter plus optional sort and paging.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    filter: Filter,
    sort: Option<(String, SortDirection)>,
    page: Option<u32>,
    page_size: Option<u32>,
}

impl Query {
    /// Create a query from a filter.
    #[must_use]
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            sort: None,
            page: None,
            page_size: None,
        }
    }

    /// Sort results by a field.
    #[must_use]
    pub fn with_sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some((field.into(), direction));
        self
    }

    /// Request a specific result page (1-based).
    #[must_use]
    pub fn with_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    /// Request a page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Validate and build the POST body for `/{Entity}/query`.
    pub fn to_body(&self) -> Result<Value> {
        self.filter.validate()?;
        let mut body = json!({ "filter": [&self.filter] });
        if let Some((field, direction)) = &self.sort {
            body["sort"] = json!([{ "field": field, "direction": direction }]);
        }
        if let Some(page) = self.page {
            body["page"] = json!(page);
        }
        if let Some(page_size) = self.page_size {
            body["pageSize"] = json!(page_size);
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn leaf_serializes_to_wire_shape() {
        let filter = Filter::eq("status", 1);
        assert_eq!(
            serde_json::to_value(&filter).unwrap(),
            json!({ "op": "eq", "field": "status", "value": 1 })
        );
    }

    #[test]
    fn groups_nest() {
        let filter = Filter::and(vec![
            Filter::gte("id", 0),
            Filter::or(vec![
                Filter::begins_with("title", "Outage"),
                Filter::exist("completedDate"),
            ]),
        ]);
        assert_eq!(
            serde_json::to_value(&filter).unwrap(),
            json!({
                "op": "and",
                "items": [
                    { "op": "gte", "field": "id", "value": 0 },
                    { "op": "or", "items": [
                        { "op": "beginsWith", "field": "title", "value": "Outage" },
                        { "op": "exist", "field": "completedDate" },
                    ]},
                ],
            })
        );
    }

    #[test]
    fn exist_rejects_value() {
        let filter = Filter::Condition {
            op: FilterOp::Exist,
            field: "id".into(),
            value: Some(json!(1)),
        };
        assert!(filter.validate().is_err());
    }

    #[test]
    fn in_requires_array() {
        let filter = Filter::Condition {
            op: FilterOp::In,
            field: "status".into(),
            value: Some(json!(1)),
        };
        assert!(filter.validate().is_err());
        assert!(Filter::is_in("status", vec![json!(1), json!(5)]).validate().is_ok());
    }

    #[test]
    fn empty_group_rejected() {
        assert!(Filter::and(vec![]).validate().is_err());
    }

    #[test]
    fn query_body_includes_paging_and_sort() {
        let body = Query::new(Filter::eq("isActive", true))
            .with_sort("id", SortDirection::Desc)
            .with_page(2)
            .with_page_size(100)
            .to_body()
            .unwrap();
        assert_eq!(
            body,
            json!({
                "filter": [{ "op": "eq", "field": "isActive", "value": true }],
                "sort": [{ "field": "id", "direction": "desc" }],
                "page": 2,
                "pageSize": 100,
            })
        );
    }
}
