//! Query language used to look up catalog records.
//!
//! ```
//! use freeway_criteria::{Criteria, filter};
//! use serde_json::json;
//!
//! let pieces = vec![json!({"name": "a.png", "size": 3}), json!({"name": "b.obj", "size": 9})];
//! let criteria = Criteria::parse(&json!({"size$gt": 5})).unwrap();
//! assert_eq!(filter(&pieces, &criteria), vec![&pieces[1]]);
//! ```

mod criteria;
pub mod error;
mod value;

pub use crate::criteria::{Clause, Comparison, Criteria, Flag, Predicate};
use serde_json::Value;
use std::borrow::Cow;

/// Anything criteria can be evaluated against.
pub trait Record {
    /// Value of a named field, or `None` when the record has no such field.
    ///
    /// A missing field is distinct from one holding `null`: it loosely equals
    /// `null` but fails `$null`, `$eq` and every ordering.
    fn field(&self, name: &str) -> Option<Cow<'_, Value>>;

    /// The record as a whole, for clauses without a field name.
    fn as_value(&self) -> Cow<'_, Value>;
}

impl Record for Value {
    fn field(&self, name: &str) -> Option<Cow<'_, Value>> {
        self.get(name).map(Cow::Borrowed)
    }

    fn as_value(&self) -> Cow<'_, Value> {
        Cow::Borrowed(self)
    }
}

/// All records matching `criteria`, in their original order.
pub fn filter<'a, R: Record>(records: &'a [R], criteria: &Criteria) -> Vec<&'a R> {
    records.iter().filter(|record| criteria.matches(*record)).collect()
}

/// First record matching `criteria`.
pub fn find<'a, R: Record>(records: &'a [R], criteria: &Criteria) -> Option<&'a R> {
    records.iter().find(|record| criteria.matches(*record))
}
