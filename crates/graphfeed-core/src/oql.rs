//! Query expression (oql) bindings.
//!
//! An [`Expression`] is either an operator node `{"op": name, "args": [...]}`
//! or a literal JSON value. [`QueryEvaluator`] walks the tree and dispatches
//! each node to the [`Operator`] registered under its name. Operators build
//! native [`Query`], [`Predicate`] and [`Term`] fragments.
//!
//! | operator                              | yields                                    |
//! |---------------------------------------|-------------------------------------------|
//! | `recordsOfType(type)`                 | every document of `type`'s table          |
//! | `filter(records, predicate)`          | `records` narrowed by `predicate`         |
//! | `equal(a, b)`                         | row equality predicate                    |
//! | `and(...)` / `or(...)`                | variadic combinators, identity if empty   |
//! | `get(path)`                           | field of the row for an oql path          |
//! | `record(type, id)`                    | point lookup                              |
//! | `relatedRecord(type, id, rel)`        | the record `rel` points at                |
//! | `relatedRecords(type, id, rel)`       | the records `rel` contains                |

use std::collections::HashMap;
use std::sync::Arc;

use graphfeed_state::{Predicate, Query, Term};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::schema::RelationshipKind;
use crate::serializer::Serializer;

/// A query expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expression {
    Op {
        op: String,
        #[serde(default)]
        args: Vec<Expression>,
    },
    Value(Value),
}

impl Expression {
    pub fn op(name: impl Into<String>, args: Vec<Expression>) -> Self {
        Expression::Op {
            op: name.into(),
            args,
        }
    }
}

impl From<&str> for Expression {
    fn from(s: &str) -> Self {
        Expression::Value(Value::String(s.to_string()))
    }
}

impl From<Value> for Expression {
    fn from(value: Value) -> Self {
        Expression::Value(value)
    }
}

/// Build an operator node: `oqe!("equal", oqe!("get", "attributes/body"), "Hello")`.
#[macro_export]
macro_rules! oqe {
    ($op:expr $(, $arg:expr)* $(,)?) => {
        $crate::oql::Expression::op($op, vec![$($crate::oql::Expression::from($arg)),*])
    };
}

/// A compiled query plus what the expression says about its result.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub query: Query,
    /// Model of the result records, when the expression determines it
    pub model: Option<String>,
    /// Whether the result is a single record rather than a collection
    pub singular: bool,
}

impl CompiledQuery {
    pub fn native(query: Query) -> Self {
        let singular = query.is_point_lookup();
        Self {
            query,
            model: None,
            singular,
        }
    }
}

/// Result of evaluating one expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Query(CompiledQuery),
    Predicate(Predicate),
    Term(Term),
}

impl Fragment {
    fn describe(&self) -> &'static str {
        match self {
            Fragment::Query(_) => "query",
            Fragment::Predicate(_) => "predicate",
            Fragment::Term(_) => "term",
        }
    }
}

/// Evaluation context handed to operators.
pub struct EvalContext<'a> {
    evaluator: &'a QueryEvaluator,
}

impl<'a> EvalContext<'a> {
    pub fn serializer(&self) -> &Serializer {
        &self.evaluator.serializer
    }

    pub fn evaluate(&self, expression: &Expression) -> Result<Fragment> {
        self.evaluator.evaluate(expression)
    }

    pub fn query(&self, expression: &Expression) -> Result<CompiledQuery> {
        match self.evaluate(expression)? {
            Fragment::Query(query) => Ok(query),
            other => Err(SyncError::InvalidQuery(format!(
                "expected a query, got a {}",
                other.describe()
            ))),
        }
    }

    pub fn predicate(&self, expression: &Expression) -> Result<Predicate> {
        match self.evaluate(expression)? {
            Fragment::Predicate(predicate) => Ok(predicate),
            Fragment::Term(Term::Literal(Value::Bool(b))) => Ok(Predicate::Const(b)),
            other => Err(SyncError::InvalidQuery(format!(
                "expected a predicate, got a {}",
                other.describe()
            ))),
        }
    }

    pub fn term(&self, expression: &Expression) -> Result<Term> {
        match self.evaluate(expression)? {
            Fragment::Term(term) => Ok(term),
            other => Err(SyncError::InvalidQuery(format!(
                "expected a value, got a {}",
                other.describe()
            ))),
        }
    }
}

/// One oql operator.
pub trait Operator: Send + Sync {
    fn evaluate(&self, context: &EvalContext<'_>, args: &[Expression]) -> Result<Fragment>;
}

/// Walks expressions, dispatching to registered operators.
pub struct QueryEvaluator {
    serializer: Arc<Serializer>,
    operators: HashMap<String, Box<dyn Operator>>,
}

impl QueryEvaluator {
    /// Evaluator with every built-in operator registered.
    pub fn new(serializer: Arc<Serializer>) -> Self {
        let mut evaluator = Self {
            serializer,
            operators: HashMap::new(),
        };
        evaluator.register("recordsOfType", RecordsOfType);
        evaluator.register("filter", Filter);
        evaluator.register("equal", Equal);
        evaluator.register("and", And);
        evaluator.register("or", Or);
        evaluator.register("get", Get);
        evaluator.register("record", RecordById);
        evaluator.register("relatedRecord", Related { singular: true });
        evaluator.register("relatedRecords", Related { singular: false });
        evaluator
    }

    pub fn register(&mut self, name: impl Into<String>, operator: impl Operator + 'static) {
        self.operators.insert(name.into(), Box::new(operator));
    }

    pub fn evaluate(&self, expression: &Expression) -> Result<Fragment> {
        match expression {
            Expression::Value(value) => Ok(Fragment::Term(Term::Literal(value.clone()))),
            Expression::Op { op, args } => {
                let operator = self
                    .operators
                    .get(op)
                    .ok_or_else(|| SyncError::UnsupportedQueryOperator(op.clone()))?;
                operator.evaluate(&EvalContext { evaluator: self }, args)
            }
        }
    }

    /// Compile a top-level expression, which must denote a query.
    pub fn compile(&self, expression: &Expression) -> Result<CompiledQuery> {
        EvalContext { evaluator: self }.query(expression)
    }
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn arity(name: &str, args: &[Expression], expected: usize) -> Result<()> {
    if args.len() != expected {
        return Err(SyncError::InvalidQuery(format!(
            "`{name}` takes {expected} arguments, got {}",
            args.len()
        )));
    }
    Ok(())
}

/// A literal string (or numeric id) argument.
fn string_arg(name: &str, args: &[Expression], index: usize) -> Result<String> {
    match args.get(index) {
        Some(Expression::Value(Value::String(s))) => Ok(s.clone()),
        Some(Expression::Value(Value::Number(n))) => Ok(n.to_string()),
        _ => Err(SyncError::InvalidQuery(format!(
            "`{name}` argument {index} must be a string"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

struct RecordsOfType;

impl Operator for RecordsOfType {
    fn evaluate(&self, context: &EvalContext<'_>, args: &[Expression]) -> Result<Fragment> {
        arity("recordsOfType", args, 1)?;
        let model = string_arg("recordsOfType", args, 0)?;
        context.serializer().schema().model_definition(&model)?;
        Ok(Fragment::Query(CompiledQuery {
            query: Query::table(context.serializer().table_name(&model)),
            model: Some(model),
            singular: false,
        }))
    }
}

struct Filter;

impl Operator for Filter {
    fn evaluate(&self, context: &EvalContext<'_>, args: &[Expression]) -> Result<Fragment> {
        arity("filter", args, 2)?;
        let records = context.query(&args[0])?;
        let predicate = context.predicate(&args[1])?;
        Ok(Fragment::Query(CompiledQuery {
            query: records.query.filter(predicate),
            model: records.model,
            singular: false,
        }))
    }
}

struct Equal;

impl Operator for Equal {
    fn evaluate(&self, context: &EvalContext<'_>, args: &[Expression]) -> Result<Fragment> {
        arity("equal", args, 2)?;
        Ok(Fragment::Predicate(Predicate::Eq(
            context.term(&args[0])?,
            context.term(&args[1])?,
        )))
    }
}

struct And;

impl Operator for And {
    fn evaluate(&self, context: &EvalContext<'_>, args: &[Expression]) -> Result<Fragment> {
        let mut chain = Predicate::Const(true);
        for arg in args {
            chain = chain.and(context.predicate(arg)?);
        }
        Ok(Fragment::Predicate(chain))
    }
}

/// Seeded with `false`, the identity of `or`: `or()` matches nothing.
struct Or;

impl Operator for Or {
    fn evaluate(&self, context: &EvalContext<'_>, args: &[Expression]) -> Result<Fragment> {
        let mut chain = Predicate::Const(false);
        for arg in args {
            chain = chain.or(context.predicate(arg)?);
        }
        Ok(Fragment::Predicate(chain))
    }
}

struct Get;

impl Operator for Get {
    fn evaluate(&self, context: &EvalContext<'_>, args: &[Expression]) -> Result<Fragment> {
        arity("get", args, 1)?;
        let path = string_arg("get", args, 0)?;
        Ok(Fragment::Term(Term::Field(
            context.serializer().field_name(&path)?,
        )))
    }
}

struct RecordById;

impl Operator for RecordById {
    fn evaluate(&self, context: &EvalContext<'_>, args: &[Expression]) -> Result<Fragment> {
        arity("record", args, 2)?;
        let model = string_arg("record", args, 0)?;
        let id = string_arg("record", args, 1)?;
        context.serializer().schema().model_definition(&model)?;
        Ok(Fragment::Query(CompiledQuery {
            query: Query::get(context.serializer().table_name(&model), id),
            model: Some(model),
            singular: true,
        }))
    }
}

/// `relatedRecord` / `relatedRecords`: scan the related model's table for
/// records whose inverse field references `id`.
struct Related {
    singular: bool,
}

impl Operator for Related {
    fn evaluate(&self, context: &EvalContext<'_>, args: &[Expression]) -> Result<Fragment> {
        let name = if self.singular {
            "relatedRecord"
        } else {
            "relatedRecords"
        };
        arity(name, args, 3)?;
        let model = string_arg(name, args, 0)?;
        let id = string_arg(name, args, 1)?;
        let relationship = string_arg(name, args, 2)?;

        let serializer = context.serializer();
        let schema = serializer.schema();
        let definition = schema.relationship_definition(&model, &relationship)?;
        let inverse = definition.inverse.as_deref().ok_or_else(|| {
            SyncError::InvalidQuery(format!(
                "relationship `{relationship}` on `{model}` has no inverse"
            ))
        })?;
        let inverse_definition = schema.relationship_definition(&definition.model, inverse)?;
        let field = serializer.relationship_field(&definition.model, inverse)?;

        let predicate = match inverse_definition.kind {
            RelationshipKind::HasOne => Predicate::Eq(Term::Field(field), Term::Literal(Value::String(id))),
            RelationshipKind::HasMany => Predicate::Contains { field, key: id },
            RelationshipKind::Other(ref kind) => {
                return Err(SyncError::InvalidQuery(format!(
                    "cannot follow inverse `{inverse}` of unsupported type `{kind}`"
                )))
            }
        };

        Ok(Fragment::Query(CompiledQuery {
            query: Query::table(serializer.table_name(&definition.model)).filter(predicate),
            model: Some(definition.model.clone()),
            singular: self.singular,
        }))
    }
}
