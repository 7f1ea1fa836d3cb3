use crate::Record;
use crate::error::{Error, ErrorKind, Result};
use crate::value::{compare, loose_eq, strict_eq, to_number, to_string, truthy};
use exn::ResultExt;
use serde_json::Value;
use std::cmp::Ordering;
use std::str::FromStr;

/// Parsed query: a conjunction of clauses.
///
/// Built from a JSON object whose keys are either `"field"` (loose equality)
/// or `"field$operator"`; anything after a second `$` is ignored. An empty
/// field name (`"$gt"`) applies the operator to the record itself. An empty
/// criteria matches every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    field: Option<String>,
    predicate: Predicate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare(Comparison),
    And(Vec<Criteria>),
    Or(Vec<Criteria>),
    Not(Box<Criteria>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    LooseEq(Value),
    StrictEq(Value),
    Neq(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    Includes(Value),
    In(Vec<Value>),
    /// Unary test whose outcome must equal the given boolean.
    Is(Flag, bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    True,
    False,
    Truthy,
    Falsy,
    Null,
    Odd,
    Even,
}

impl Criteria {
    /// Parse criteria from a JSON object.
    ///
    /// Nested criteria under `$and`, `$or` and `$not` are parsed eagerly, so an
    /// unknown operator anywhere in the tree fails here rather than when the
    /// criteria is first evaluated.
    pub fn parse(criteria: &Value) -> Result<Self> {
        let Some(map) = criteria.as_object() else {
            exn::bail!(ErrorKind::InvalidCriteria("criteria must be an object".to_string()));
        };
        let clauses = map.iter().map(|(key, value)| Clause::parse(key, value)).collect::<Result<Vec<_>>>()?;
        Ok(Self { clauses })
    }

    /// Criteria matching records whose `field` loosely equals `value`.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::default().and_eq(field, value)
    }

    pub fn and_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause {
            field: Some(field.into()),
            predicate: Predicate::Compare(Comparison::LooseEq(value.into())),
        });
        self
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Every clause must hold; evaluation stops at the first failing clause.
    pub fn matches<R: Record + ?Sized>(&self, record: &R) -> bool {
        self.evaluate(Some(record))
    }

    /// `None` stands for a missing field reached through a nested clause.
    fn evaluate<R: Record + ?Sized>(&self, record: Option<&R>) -> bool {
        self.clauses.iter().all(|clause| clause.matches(record))
    }
}

impl FromStr for Criteria {
    type Err = Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let value: Value = serde_json::from_str(s).or_raise(|| ErrorKind::Syntax)?;
        Self::parse(&value)
    }
}

impl TryFrom<&Value> for Criteria {
    type Error = Error;
    fn try_from(value: &Value) -> std::result::Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl Clause {
    fn parse(key: &str, value: &Value) -> Result<Self> {
        let mut parts = key.split('$');
        let field = parts.next().unwrap_or_default();
        let operator = parts.next().unwrap_or_default();
        Ok(Self {
            field: (!field.is_empty()).then(|| field.to_string()),
            predicate: Predicate::parse(operator, value)?,
        })
    }

    pub fn field(&self) -> Option<&str> {
        self.field.as_deref()
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    fn matches<R: Record + ?Sized>(&self, record: Option<&R>) -> bool {
        match &self.field {
            Some(name) => {
                let value = record.and_then(|record| record.field(name));
                self.predicate.test(value.as_deref())
            },
            None => self.predicate.test(record),
        }
    }
}

impl Predicate {
    fn parse(operator: &str, value: &Value) -> Result<Self> {
        let comparison = match operator {
            "" | "eqeq" => Comparison::LooseEq(value.clone()),
            "eq" | "eqeqeq" => Comparison::StrictEq(value.clone()),
            "neq" => Comparison::Neq(value.clone()),
            "gt" => Comparison::Gt(value.clone()),
            "gte" => Comparison::Gte(value.clone()),
            "lt" => Comparison::Lt(value.clone()),
            "lte" => Comparison::Lte(value.clone()),
            "includes" => Comparison::Includes(value.clone()),
            "in" => match value {
                Value::Array(values) => Comparison::In(values.clone()),
                _ => exn::bail!(ErrorKind::InvalidCriteria("$in expects an array".to_string())),
            },
            "true" => Comparison::Is(Flag::True, expect_bool(operator, value)?),
            "false" => Comparison::Is(Flag::False, expect_bool(operator, value)?),
            "truthy" => Comparison::Is(Flag::Truthy, expect_bool(operator, value)?),
            "falsy" => Comparison::Is(Flag::Falsy, expect_bool(operator, value)?),
            "null" => Comparison::Is(Flag::Null, expect_bool(operator, value)?),
            "odd" => Comparison::Is(Flag::Odd, expect_bool(operator, value)?),
            "even" => Comparison::Is(Flag::Even, expect_bool(operator, value)?),
            "and" => return Ok(Self::And(parse_list(operator, value)?)),
            "or" => return Ok(Self::Or(parse_list(operator, value)?)),
            "not" => return Ok(Self::Not(Box::new(Criteria::parse(value)?))),
            unknown => exn::bail!(ErrorKind::UnknownOperator(unknown.to_string())),
        };
        Ok(Self::Compare(comparison))
    }

    fn test<R: Record + ?Sized>(&self, target: Option<&R>) -> bool {
        match self {
            Self::Compare(comparison) => comparison.test(target.map(|target| target.as_value()).as_deref()),
            Self::And(list) => list.iter().all(|criteria| criteria.evaluate(target)),
            Self::Or(list) => list.iter().any(|criteria| criteria.evaluate(target)),
            Self::Not(criteria) => !criteria.evaluate(target),
        }
    }
}

impl Comparison {
    fn test(&self, a: Option<&Value>) -> bool {
        let Some(a) = a else {
            return self.holds_for_missing();
        };
        match self {
            Self::LooseEq(b) => loose_eq(a, b),
            Self::StrictEq(b) => strict_eq(a, b),
            Self::Neq(b) => !strict_eq(a, b),
            Self::Gt(b) => compare(a, b) == Some(Ordering::Greater),
            Self::Gte(b) => matches!(compare(a, b), Some(Ordering::Greater | Ordering::Equal)),
            Self::Lt(b) => compare(a, b) == Some(Ordering::Less),
            Self::Lte(b) => matches!(compare(a, b), Some(Ordering::Less | Ordering::Equal)),
            Self::Includes(b) => to_string(a).contains(&to_string(b)),
            Self::In(values) => values.iter().any(|b| strict_eq(a, b)),
            Self::Is(flag, expected) => flag.test(a) == *expected,
        }
    }

    /// A missing field is undefined: only `null` loosely equals it and only
    /// `$falsy` holds for it.
    fn holds_for_missing(&self) -> bool {
        match self {
            Self::LooseEq(b) => b.is_null(),
            Self::Neq(_) => true,
            Self::Includes(b) => "undefined".contains(&to_string(b)),
            Self::Is(flag, expected) => (*flag == Flag::Falsy) == *expected,
            Self::StrictEq(_) | Self::Gt(_) | Self::Gte(_) | Self::Lt(_) | Self::Lte(_) | Self::In(_) => false,
        }
    }
}

impl Flag {
    fn test(self, a: &Value) -> bool {
        match self {
            Self::True => a == &Value::Bool(true),
            Self::False => a == &Value::Bool(false),
            Self::Truthy => truthy(a),
            Self::Falsy => !truthy(a),
            Self::Null => a.is_null(),
            Self::Odd => to_number(a) % 2.0 == 1.0,
            Self::Even => to_number(a) % 2.0 == 0.0,
        }
    }
}

fn expect_bool(operator: &str, value: &Value) -> Result<bool> {
    match value {
        Value::Bool(flag) => Ok(*flag),
        _ => exn::bail!(ErrorKind::InvalidCriteria(format!("${operator} expects a boolean"))),
    }
}

fn parse_list(operator: &str, value: &Value) -> Result<Vec<Criteria>> {
    match value {
        Value::Array(items) => items.iter().map(Criteria::parse).collect(),
        _ => exn::bail!(ErrorKind::InvalidCriteria(format!("${operator} expects an array of criteria"))),
    }
}
