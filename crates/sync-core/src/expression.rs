//! Expression language used inside query terms.
//!
//! An expression is a flat JSON array of tokens applied to one attribute
//! value, the *subject*:
//!
//! ```text
//! [ ">=", 18, "<", 65 ]              18 <= subject < 65
//! [ "<", 0, "||", ">", 100 ]         subject < 0 OR subject > 100
//! [ "==", "admin", "failed" ]        NOT (subject = 'admin')
//! [ "lower", "==", "ann" ]           LOWER(subject) = 'ann'
//! [ "distance", [ "point", 2, 3 ], "<", 10 ]
//! ```
//!
//! Tokens are parsed once into an [`Expression`] tree which is then either
//! compiled to SQL or evaluated in-process. Parsing never fails: whatever
//! cannot be understood becomes [`Expression::Unsupported`], which SQL
//! compilation omits and in-process evaluation treats as unknown.

use serde_json::Value;
use std::cmp::Ordering;

// ============================================================================
// Operators
// ============================================================================

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl ComparisonOp {
    /// Parse an operator token.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "==" => Some(ComparisonOp::Eq),
            "!=" => Some(ComparisonOp::Ne),
            ">" => Some(ComparisonOp::Gt),
            ">=" => Some(ComparisonOp::Ge),
            "<" => Some(ComparisonOp::Lt),
            "<=" => Some(ComparisonOp::Le),
            _ => None,
        }
    }

    /// SQL spelling.
    pub fn sql(&self) -> &'static str {
        match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::Ne => "!=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Ge => ">=",
            ComparisonOp::Lt => "<",
            ComparisonOp::Le => "<=",
        }
    }

    /// Whether `lhs op rhs` holds given `lhs.cmp(rhs)`.
    pub fn holds(&self, ordering: Ordering) -> bool {
        match self {
            ComparisonOp::Eq => ordering == Ordering::Equal,
            ComparisonOp::Ne => ordering != Ordering::Equal,
            ComparisonOp::Gt => ordering == Ordering::Greater,
            ComparisonOp::Ge => ordering != Ordering::Less,
            ComparisonOp::Lt => ordering == Ordering::Less,
            ComparisonOp::Le => ordering != Ordering::Greater,
        }
    }
}

/// Boolean combinators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

impl BoolOp {
    pub fn sql(&self) -> &'static str {
        match self {
            BoolOp::And => "AND",
            BoolOp::Or => "OR",
        }
    }
}

// ============================================================================
// Functions
// ============================================================================

/// How a function appears in a token stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// In operator position; replaces the left-hand side of following comparisons.
    Transform,
    /// In operand position; builds a value.
    Constructor,
}

/// Named functions with fixed arity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Lower,
    Upper,
    Length,
    Abs,
    Round,
    Distance,
    Point,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "lower" => Some(Function::Lower),
            "upper" => Some(Function::Upper),
            "length" => Some(Function::Length),
            "abs" => Some(Function::Abs),
            "round" => Some(Function::Round),
            "distance" => Some(Function::Distance),
            "point" => Some(Function::Point),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Function::Lower => "lower",
            Function::Upper => "upper",
            Function::Length => "length",
            Function::Abs => "abs",
            Function::Round => "round",
            Function::Distance => "distance",
            Function::Point => "point",
        }
    }

    pub fn kind(&self) -> FunctionKind {
        match self {
            Function::Point => FunctionKind::Constructor,
            _ => FunctionKind::Transform,
        }
    }

    /// Number of parameters taken from the token stream.
    ///
    /// For transforms the left-hand side is an implicit extra first argument.
    pub fn parameters(&self) -> usize {
        match self {
            Function::Lower | Function::Upper | Function::Length | Function::Abs => 0,
            Function::Round | Function::Distance => 1,
            Function::Point => 2,
        }
    }

    /// Default for a missing trailing parameter.
    pub fn default_for(&self, position: usize) -> Option<Value> {
        match (self, position) {
            (Function::Round, 0) => Some(Value::from(0)),
            _ => None,
        }
    }

    /// SQL function name.
    pub fn sql(&self) -> &'static str {
        match self {
            Function::Lower => "LOWER",
            Function::Upper => "UPPER",
            Function::Length => "CHAR_LENGTH",
            Function::Abs => "ABS",
            Function::Round => "ROUND",
            Function::Distance => "ST_Distance",
            Function::Point => "POINT",
        }
    }
}

// ============================================================================
// Tree
// ============================================================================

/// Function applied to operands.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub function: Function,
    pub args: Vec<Operand>,
}

/// Value position in a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// The attribute value the expression applies to
    Subject,
    /// Literal value
    Scalar(Value),
    /// Function result
    Call(FunctionCall),
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Comparison {
        op: ComparisonOp,
        lhs: Operand,
        rhs: Operand,
    },
    Combinator {
        op: BoolOp,
        operands: Vec<Expression>,
    },
    Not(Box<Expression>),
    /// Tokens that could not be understood, with the reason
    Unsupported(String),
}

impl Expression {
    /// Parse a token stream applied to the subject.
    pub fn parse(tokens: &[Value]) -> Expression {
        Parser::new(tokens).chain(Operand::Subject)
    }

    /// Whether any part of the tree is unsupported.
    pub fn is_supported(&self) -> bool {
        match self {
            Expression::Comparison { .. } => true,
            Expression::Combinator { operands, .. } => operands.iter().all(|e| e.is_supported()),
            Expression::Not(inner) => inner.is_supported(),
            Expression::Unsupported(_) => false,
        }
    }
}

fn is_operator(token: &Value) -> bool {
    match token {
        Value::String(s) => {
            s == "||"
                || s == "failed"
                || ComparisonOp::from_token(s).is_some()
                || Function::from_name(s).is_some_and(|f| f.kind() == FunctionKind::Transform)
        }
        _ => false,
    }
}

fn conjunction(mut terms: Vec<Expression>) -> Option<Expression> {
    match terms.len() {
        0 => None,
        1 => terms.pop(),
        _ => Some(Expression::Combinator {
            op: BoolOp::And,
            operands: terms,
        }),
    }
}

fn disjunction(left: Expression, right: Expression) -> Expression {
    let mut operands = vec![left];
    match right {
        Expression::Combinator {
            op: BoolOp::Or,
            operands: rest,
        } => operands.extend(rest),
        other => operands.push(other),
    }
    Expression::Combinator {
        op: BoolOp::Or,
        operands,
    }
}

struct Parser<'a> {
    tokens: &'a [Value],
    position: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Value]) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    fn next(&mut self) -> Option<&'a Value> {
        let token = self.tokens.get(self.position)?;
        self.position += 1;
        Some(token)
    }

    fn peek(&self) -> Option<&'a Value> {
        self.tokens.get(self.position)
    }

    fn chain(&mut self, subject: Operand) -> Expression {
        let mut lhs = subject.clone();
        let mut terms = Vec::new();

        while let Some(token) = self.next() {
            match token {
                Value::String(token) if token == "||" => {
                    let Some(left) = conjunction(terms) else {
                        return Expression::Unsupported("'||' without left operand".to_string());
                    };
                    return disjunction(left, self.chain(subject));
                }
                Value::String(token) if token == "failed" => {
                    let Some(negated) = conjunction(std::mem::take(&mut terms)) else {
                        return Expression::Unsupported("'failed' without operand".to_string());
                    };
                    terms.push(Expression::Not(Box::new(negated)));
                }
                Value::String(token) => {
                    if let Some(op) = ComparisonOp::from_token(token) {
                        match self.operand() {
                            Ok(rhs) => terms.push(Expression::Comparison {
                                op,
                                lhs: lhs.clone(),
                                rhs,
                            }),
                            Err(reason) => return Expression::Unsupported(reason),
                        }
                        continue;
                    }
                    match Function::from_name(token) {
                        Some(function) if function.kind() == FunctionKind::Transform => {
                            match self.arguments(function) {
                                Ok(mut args) => {
                                    args.insert(0, lhs);
                                    lhs = Operand::Call(FunctionCall { function, args });
                                }
                                Err(reason) => return Expression::Unsupported(reason),
                            }
                        }
                        _ => {
                            return Expression::Unsupported(format!(
                                "unsupported operator '{token}'"
                            ))
                        }
                    }
                }
                Value::Array(nested) => terms.push(Parser::new(nested).chain(lhs.clone())),
                Value::Object(_) => {
                    return Expression::Unsupported("object in operator position".to_string())
                }
                scalar => terms.push(Expression::Comparison {
                    op: ComparisonOp::Eq,
                    lhs: lhs.clone(),
                    rhs: Operand::Scalar(scalar.clone()),
                }),
            }
        }

        conjunction(terms).unwrap_or_else(|| Expression::Unsupported("empty expression".to_string()))
    }

    fn operand(&mut self) -> Result<Operand, String> {
        match self.next() {
            None => Err("missing operand".to_string()),
            Some(Value::String(name)) => match Function::from_name(name) {
                Some(function) if function.kind() == FunctionKind::Constructor => {
                    let args = self.arguments(function)?;
                    Ok(Operand::Call(FunctionCall { function, args }))
                }
                _ => Ok(Operand::Scalar(Value::String(name.clone()))),
            },
            Some(Value::Array(tokens)) => nested_call(tokens),
            Some(Value::Object(_)) => Err("object operand".to_string()),
            Some(scalar) => Ok(Operand::Scalar(scalar.clone())),
        }
    }

    fn arguments(&mut self, function: Function) -> Result<Vec<Operand>, String> {
        let mut args = Vec::with_capacity(function.parameters());
        for position in 0..function.parameters() {
            match self.peek() {
                Some(token) if !is_operator(token) => args.push(self.operand()?),
                _ => match function.default_for(position) {
                    Some(default) => args.push(Operand::Scalar(default)),
                    None => {
                        return Err(format!(
                            "missing argument {} of '{}'",
                            position + 1,
                            function.name()
                        ))
                    }
                },
            }
        }
        Ok(args)
    }
}

fn nested_call(tokens: &[Value]) -> Result<Operand, String> {
    let Some(Value::String(name)) = tokens.first() else {
        return Err("nested operand must start with a function name".to_string());
    };
    let function = Function::from_name(name)
        .filter(|f| f.kind() == FunctionKind::Constructor)
        .ok_or_else(|| format!("'{name}' is not a value constructor"))?;

    let mut parser = Parser::new(&tokens[1..]);
    let args = parser.arguments(function)?;
    if parser.peek().is_some() {
        return Err(format!("too many arguments for '{name}'"));
    }
    Ok(Operand::Call(FunctionCall { function, args }))
}
