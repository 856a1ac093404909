// Query filters over recorded status-log entries

use eyre::{Result, eyre};
use std::fmt;
use std::str::FromStr;

/// Indexed column of the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    JobId,
    TestName,
    Hostname,
    Status,
    Subdir,
    Timestamp,
}

impl Field {
    pub(crate) fn column(self) -> &'static str {
        match self {
            Field::JobId => "job_id",
            Field::TestName => "test_name",
            Field::Hostname => "hostname",
            Field::Status => "status_code",
            Field::Subdir => "subdir",
            Field::Timestamp => "timestamp",
        }
    }

    fn is_numeric(self) -> bool {
        matches!(self, Field::JobId | Field::Timestamp)
    }
}

impl FromStr for Field {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "job" | "job_id" => Ok(Field::JobId),
            "test" | "test_name" => Ok(Field::TestName),
            "host" | "hostname" => Ok(Field::Hostname),
            "status" => Ok(Field::Status),
            "subdir" => Ok(Field::Subdir),
            "timestamp" => Ok(Field::Timestamp),
            other => Err(eyre!("Unknown filter field: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    Text(String),
    Int(i64),
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        FilterValue::Text(s.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(s: String) -> Self {
        FilterValue::Text(s)
    }
}

impl From<i64> for FilterValue {
    fn from(i: i64) -> Self {
        FilterValue::Int(i)
    }
}

/// Filter for querying entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub field: Field,
    pub op: FilterOp,
    pub value: FilterValue,
}

impl Filter {
    pub fn new(field: Field, op: FilterOp, value: impl Into<FilterValue>) -> Self {
        Self {
            field,
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: Field, value: impl Into<FilterValue>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }
}

/// `field<op>value`, e.g. `status=FAIL` or `timestamp>=1393668000`
impl FromStr for Filter {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        // At the same position the longer operator wins.
        const OPS: &[(&str, FilterOp)] = &[
            (">=", FilterOp::Gte),
            ("<=", FilterOp::Lte),
            ("!=", FilterOp::Ne),
            ("~", FilterOp::Contains),
            ("=", FilterOp::Eq),
            (">", FilterOp::Gt),
            ("<", FilterOp::Lt),
        ];
        let (idx, token, op) = OPS
            .iter()
            .filter_map(|(token, op)| s.find(token).map(|idx| (idx, *token, *op)))
            .min_by_key(|(idx, token, _)| (*idx, std::cmp::Reverse(token.len())))
            .ok_or_else(|| eyre!("Filter {} has no operator", s))?;

        let field: Field = s[..idx].parse()?;
        let raw = s[idx + token.len()..].trim();
        let value = if field.is_numeric() && op != FilterOp::Contains {
            FilterValue::Int(raw.parse().map_err(|_| eyre!("Filter {} needs an integer value", s))?)
        } else {
            FilterValue::Text(raw.to_string())
        };
        Ok(Filter { field, op, value })
    }
}

/// Comparison operators for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,       // ==
    Ne,       // !=
    Gt,       // >
    Lt,       // <
    Gte,      // >=
    Lte,      // <=
    Contains, // LIKE %value%
}

impl FilterOp {
    pub(crate) fn to_sql(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Gt => ">",
            FilterOp::Lt => "<",
            FilterOp::Gte => ">=",
            FilterOp::Lte => "<=",
            FilterOp::Contains => "LIKE",
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_sql())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_op_to_sql() {
        assert_eq!(FilterOp::Eq.to_sql(), "=");
        assert_eq!(FilterOp::Ne.to_sql(), "!=");
        assert_eq!(FilterOp::Gte.to_sql(), ">=");
        assert_eq!(FilterOp::Contains.to_sql(), "LIKE");
        assert_eq!(FilterOp::Lte.to_string(), "<=");
    }

    #[test]
    fn test_parse_filters() {
        assert_eq!(
            "status=FAIL".parse::<Filter>().unwrap(),
            Filter::eq(Field::Status, "FAIL")
        );
        assert_eq!(
            "timestamp>=1393668000".parse::<Filter>().unwrap(),
            Filter::new(Field::Timestamp, FilterOp::Gte, 1393668000_i64)
        );
        assert_eq!(
            "test~dummy".parse::<Filter>().unwrap(),
            Filter::new(Field::TestName, FilterOp::Contains, "dummy")
        );
        assert_eq!("job!=3".parse::<Filter>().unwrap(), Filter::new(Field::JobId, FilterOp::Ne, 3_i64));
    }

    #[test]
    fn test_parse_rejects_bad_filters() {
        assert!("status".parse::<Filter>().is_err());
        assert!("colour=red".parse::<Filter>().is_err());
        assert!("job=abc".parse::<Filter>().is_err());
    }

    #[test]
    fn test_field_columns() {
        assert_eq!(Field::Status.column(), "status_code");
        assert_eq!("host".parse::<Field>().unwrap(), Field::Hostname);
    }
}
