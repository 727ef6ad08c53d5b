use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{alpha1, alphanumeric1, char, multispace0, multispace1, none_of};
use nom::combinator::{eof, map, peek, recognize};
use nom::multi::{fold_many0, many0};
use nom::number::complete::double;
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use nom::IResult;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    Mul,
    Div,
    Add,
    Sub,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,
    And,
    Or,
}

fn truth(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

impl BinaryOp {
    fn apply(&self, left: f64, right: f64) -> f64 {
        match self {
            BinaryOp::Mul => left * right,
            BinaryOp::Div => left / right,
            BinaryOp::Add => left + right,
            BinaryOp::Sub => left - right,
            BinaryOp::Less => truth(left < right),
            BinaryOp::LessEqual => truth(left <= right),
            BinaryOp::Greater => truth(left > right),
            BinaryOp::GreaterEqual => truth(left >= right),
            BinaryOp::Equal => truth(left == right),
            BinaryOp::NotEqual => truth(left != right),
            BinaryOp::And => truth(left != 0.0 && right != 0.0),
            BinaryOp::Or => truth(left != 0.0 || right != 0.0),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Less => "<",
            BinaryOp::LessEqual => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEqual => ">=",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

/// Numeric expression over named inputs. Logic and comparison
/// operators yield 1 or 0, any non-zero value counts as true.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Number(f64),
    Input(String),
    Not(Box<Expression>),
    Negate(Box<Expression>),
    Binary(BinaryOp, Box<Expression>, Box<Expression>),
}

impl Expression {
    /// None until every input has a value
    pub fn evaluate(&self, values: &HashMap<String, f64>) -> Option<f64> {
        match self {
            Expression::Number(v) => Some(*v),
            Expression::Input(name) => values.get(name).copied(),
            Expression::Not(arg) => Some(truth(arg.evaluate(values)? == 0.0)),
            Expression::Negate(arg) => Some(-arg.evaluate(values)?),
            Expression::Binary(op, left, right) => {
                let left = left.evaluate(values)?;
                let right = right.evaluate(values)?;
                Some(op.apply(left, right))
            }
        }
    }

    fn collect_inputs(&self, inputs: &mut Vec<String>) {
        match self {
            Expression::Number(_) => {}
            Expression::Input(name) => {
                if !inputs.contains(name) {
                    inputs.push(name.clone());
                }
            }
            Expression::Not(arg) | Expression::Negate(arg) => arg.collect_inputs(inputs),
            Expression::Binary(_, left, right) => {
                left.collect_inputs(inputs);
                right.collect_inputs(inputs);
            }
        }
    }

    /// Names of all inputs, in order of first appearance
    pub fn inputs(&self) -> Vec<String> {
        let mut inputs = Vec::new();
        self.collect_inputs(&mut inputs);
        inputs
    }
}

impl Display for Expression {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Expression::Number(v) => write!(f, "{}", v),
            Expression::Input(name) => write!(f, "'{}'", name.replace('\'', "''")),
            Expression::Not(arg) => write!(f, "!({})", arg),
            Expression::Negate(arg) => write!(f, "-({})", arg),
            Expression::Binary(op, left, right) => {
                write!(f, "({} {} {})", left, op.as_str(), right)
            }
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum ExpressionErrorKind {
    MissingParenthesis,
    Nom(nom::error::ErrorKind),
}

impl Display for ExpressionErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            ExpressionErrorKind::MissingParenthesis => write!(f, "Missing ')'"),
            ExpressionErrorKind::Nom(err) => write!(f, "{}", err.description()),
        }
    }
}

#[derive(Debug)]
struct ParseError<'a> {
    input: &'a str,
    kind: ExpressionErrorKind,
}

impl<'a> nom::error::ParseError<&'a str> for ParseError<'a> {
    fn from_error_kind(input: &'a str, kind: nom::error::ErrorKind) -> Self {
        ParseError {
            input,
            kind: ExpressionErrorKind::Nom(kind),
        }
    }
    fn append(_input: &'a str, _kind: nom::error::ErrorKind, other: Self) -> Self {
        other
    }
}

/// Failure to parse a filter expression
#[derive(Debug, PartialEq)]
pub struct ExpressionError {
    /// Unparsed remainder of the expression
    pub remaining: String,
    pub kind: ExpressionErrorKind,
}

impl std::error::Error for ExpressionError {}

impl Display for ExpressionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{} at '{}'", self.kind, self.remaining)
    }
}

macro_rules! build_failure {
    ($input:expr, $kind: expr) => {{
        use ExpressionErrorKind::*;
        Err(nom::Err::Failure(ParseError {
            input: $input,
            kind: $kind,
        }))
    }};
}

type ParseResult<'a, O> = IResult<&'a str, O, ParseError<'a>>;

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> ParseResult<'a, O>
where
    F: FnMut(&'a str) -> ParseResult<'a, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn quoted(quote: char) -> impl FnMut(&str) -> ParseResult<String> {
    move |input| {
        let doubled: &str = if quote == '\'' { "''" } else { "\"\"" };
        let others: &str = if quote == '\'' { "'" } else { "\"" };
        delimited(
            char(quote),
            fold_many0(
                alt((none_of(others), map(tag(doubled), |_| quote))),
                String::new,
                |mut string, ch| {
                    string.push(ch);
                    string
                },
            ),
            char(quote),
        )(input)
    }
}

fn identifier(input: &str) -> ParseResult<String> {
    map(
        recognize(pair(
            alt((alpha1, tag("_"))),
            many0(alt((alphanumeric1, tag("_"), tag(":"), tag(".")))),
        )),
        |s: &str| s.to_string(),
    )(input)
}

fn parse_input(input: &str) -> ParseResult<Expression> {
    map(
        alt((quoted('\''), quoted('"'), identifier)),
        Expression::Input,
    )(input)
}

fn parse_parenthesis(input: &str) -> ParseResult<Expression> {
    let (input, expr) = preceded(char('('), parse_or)(input)?;
    match char::<&str, ParseError>(')')(input) {
        Ok((input, _)) => Ok((input, expr)),
        Err(_) => build_failure!(input, MissingParenthesis),
    }
}

/*
or := and ("||" and)*
and := compare ("&&" compare)*
compare := sum (cmp_op sum)?
sum := product (("+" | "-") product)*
product := unary (("*" | "/") unary)*
unary := ("!" | "NOT" | "-") unary | primary
primary := "(" or ")" | input | number
 */
fn parse_primary(input: &str) -> ParseResult<Expression> {
    ws(alt((
        parse_parenthesis,
        parse_input,
        map(double, Expression::Number),
    )))(input)
}

fn not_keyword(input: &str) -> ParseResult<&str> {
    terminated(tag("NOT"), alt((multispace1, peek(tag("(")))))(input)
}

fn parse_unary(input: &str) -> ParseResult<Expression> {
    alt((
        map(
            preceded(ws(alt((tag("!"), not_keyword))), parse_unary),
            |arg| Expression::Not(Box::new(arg)),
        ),
        map(preceded(ws(char('-')), parse_unary), |arg| {
            Expression::Negate(Box::new(arg))
        }),
        parse_primary,
    ))(input)
}

fn binary(op: BinaryOp, left: Expression, right: Expression) -> Expression {
    Expression::Binary(op, Box::new(left), Box::new(right))
}

fn parse_product(input: &str) -> ParseResult<Expression> {
    let (input, first) = parse_unary(input)?;
    fold_many0(
        pair(
            ws(alt((
                map(char('*'), |_| BinaryOp::Mul),
                map(char('/'), |_| BinaryOp::Div),
            ))),
            parse_unary,
        ),
        move || first.clone(),
        |acc, (op, right)| binary(op, acc, right),
    )(input)
}

fn parse_sum(input: &str) -> ParseResult<Expression> {
    let (input, first) = parse_product(input)?;
    fold_many0(
        pair(
            ws(alt((
                map(char('+'), |_| BinaryOp::Add),
                map(char('-'), |_| BinaryOp::Sub),
            ))),
            parse_product,
        ),
        move || first.clone(),
        |acc, (op, right)| binary(op, acc, right),
    )(input)
}

fn compare_op(input: &str) -> ParseResult<BinaryOp> {
    ws(alt((
        map(tag("<="), |_| BinaryOp::LessEqual),
        map(tag(">="), |_| BinaryOp::GreaterEqual),
        map(tag("=="), |_| BinaryOp::Equal),
        map(tag("!="), |_| BinaryOp::NotEqual),
        map(tag("<"), |_| BinaryOp::Less),
        map(tag(">"), |_| BinaryOp::Greater),
        map(tag("="), |_| BinaryOp::Equal),
    )))(input)
}

fn parse_compare(input: &str) -> ParseResult<Expression> {
    let (input, left) = parse_sum(input)?;
    match tuple((compare_op, parse_sum))(input) {
        Ok((rest, (op, right))) => Ok((rest, binary(op, left, right))),
        Err(nom::Err::Error(_)) => Ok((input, left)),
        Err(e) => Err(e),
    }
}

fn parse_and(input: &str) -> ParseResult<Expression> {
    let (input, first) = parse_compare(input)?;
    fold_many0(
        preceded(ws(alt((tag("&&"), tag("AND")))), parse_compare),
        move || first.clone(),
        |acc, right| binary(BinaryOp::And, acc, right),
    )(input)
}

fn parse_or(input: &str) -> ParseResult<Expression> {
    let (input, first) = parse_and(input)?;
    fold_many0(
        preceded(ws(alt((tag("||"), tag("OR")))), parse_and),
        move || first.clone(),
        |acc, right| binary(BinaryOp::Or, acc, right),
    )(input)
}

pub fn parse_expression(input: &str) -> Result<Expression, ExpressionError> {
    match terminated(parse_or, eof)(input) {
        Ok((_, expr)) => Ok(expr),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(ExpressionError {
            remaining: e.input.to_string(),
            kind: e.kind,
        }),
        Err(nom::Err::Incomplete(_)) => Err(ExpressionError {
            remaining: String::new(),
            kind: ExpressionErrorKind::Nom(nom::error::ErrorKind::Complete),
        }),
    }
}

#[cfg(test)]
use test_log::test;

#[cfg(test)]
fn values(list: &[(&str, f64)]) -> HashMap<String, f64> {
    list.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

#[test]
fn test_expression_parser() {
    assert_eq!(
        parse_expression("'sim://ramp' > 5 && en == 1").unwrap().to_string(),
        "(('sim://ramp' > 5) && ('en' == 1))"
    );
    assert_eq!(
        parse_expression("1 + 2 * 3 - 4").unwrap().to_string(),
        "((1 + (2 * 3)) - 4)"
    );
    assert_eq!(
        parse_expression("a OR b AND NOT c").unwrap().to_string(),
        "('a' || ('b' && !('c')))"
    );
    assert_eq!(
        parse_expression("!(\"x:y\" <= -2)").unwrap().to_string(),
        "!(('x:y' <= -(2)))"
    );
}

#[test]
fn test_expression_inputs() {
    let expr = parse_expression("a + 'b' * a > c").unwrap();
    assert_eq!(expr.inputs(), vec!["a", "b", "c"]);
}

#[test]
fn test_expression_evaluate() {
    let expr = parse_expression("'pv1' > 5 && pv2 == 1").unwrap();
    assert_eq!(expr.evaluate(&values(&[("pv1", 6.0), ("pv2", 1.0)])), Some(1.0));
    assert_eq!(expr.evaluate(&values(&[("pv1", 4.0), ("pv2", 1.0)])), Some(0.0));
    assert_eq!(expr.evaluate(&values(&[("pv1", 6.0)])), None);

    let expr = parse_expression("(a + b) / 2").unwrap();
    assert_eq!(expr.evaluate(&values(&[("a", 3.0), ("b", 5.0)])), Some(4.0));
    let expr = parse_expression("!a").unwrap();
    assert_eq!(expr.evaluate(&values(&[("a", 0.0)])), Some(1.0));
}

#[test]
fn test_expression_failure() {
    let err = parse_expression("a > ").unwrap_err();
    assert_eq!(err.remaining, "> ");
    let err = parse_expression("(a > 1").unwrap_err();
    assert_eq!(err.kind, ExpressionErrorKind::MissingParenthesis);
    assert!(parse_expression("").is_err());
}
