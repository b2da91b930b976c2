//! Arithmetic subset of Painless used by `bucket_script`
//!
//! Scripts such as `params.sales / params.count * 100` are parsed once at
//! compile time. Supported: `params.x` and `params['x']` variables, numeric
//! literals, `+ - * / %`, unary minus and parentheses. A leading `return`
//! and a trailing `;` are accepted.

use crate::error::CompileError;
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, multispace0, none_of, one_of, satisfy},
    combinator::{map, recognize},
    multi::{many0, many1},
    number::complete::double,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptExpr {
    Number(f64),
    Var(String),
    Neg(Box<ScriptExpr>),
    Binary(Box<ScriptExpr>, BinaryOp, Box<ScriptExpr>),
}

impl ScriptExpr {
    /// `None` when a variable is missing or the result is not a finite number
    pub fn eval(&self, vars: &HashMap<String, f64>) -> Option<f64> {
        let value = match self {
            ScriptExpr::Number(n) => *n,
            ScriptExpr::Var(name) => *vars.get(name)?,
            ScriptExpr::Neg(inner) => -inner.eval(vars)?,
            ScriptExpr::Binary(lhs, op, rhs) => {
                let (a, b) = (lhs.eval(vars)?, rhs.eval(vars)?);
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return None,
                    BinaryOp::Div => a / b,
                    BinaryOp::Rem => a % b,
                }
            }
        };
        value.is_finite().then_some(value)
    }

    fn collect_vars<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            ScriptExpr::Number(_) => {}
            ScriptExpr::Var(name) => out.push(name),
            ScriptExpr::Neg(inner) => inner.collect_vars(out),
            ScriptExpr::Binary(lhs, _, rhs) => {
                lhs.collect_vars(out);
                rhs.collect_vars(out);
            }
        }
    }
}

/// A parsed bucket_script
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub source: String,
    pub expr: ScriptExpr,
}

impl Script {
    pub fn parse(source: &str) -> Result<Self, CompileError> {
        let body = source.trim();
        let body = body.strip_prefix("return ").unwrap_or(body).trim();
        let body = body.strip_suffix(';').unwrap_or(body);

        let (rest, expr) =
            expression(body).map_err(|e| CompileError::Script(format!("{source}: {e}")))?;
        if !rest.trim().is_empty() {
            return Err(CompileError::Script(format!(
                "{source}: unexpected input '{}'",
                rest.trim()
            )));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Variables the script reads, in order of appearance
    pub fn variables(&self) -> Vec<&str> {
        let mut all = Vec::new();
        self.expr.collect_vars(&mut all);
        let mut vars: Vec<&str> = Vec::with_capacity(all.len());
        for var in all {
            if !vars.contains(&var) {
                vars.push(var);
            }
        }
        vars
    }

    pub fn eval(&self, vars: &HashMap<String, f64>) -> Option<f64> {
        self.expr.eval(vars)
    }
}

fn ws<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    delimited(multispace0, inner, multispace0)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        many0(satisfy(|c| c.is_ascii_alphanumeric() || c == '_')),
    ))(input)
}

fn quoted_name(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('\''), recognize(many1(none_of("'"))), char('\'')),
        delimited(char('"'), recognize(many1(none_of("\""))), char('"')),
    ))(input)
}

fn variable(input: &str) -> IResult<&str, ScriptExpr> {
    let dotted = preceded(char('.'), identifier);
    let indexed = delimited(pair(char('['), multispace0), quoted_name, pair(multispace0, char(']')));
    map(preceded(tag("params"), alt((dotted, indexed))), |name: &str| {
        ScriptExpr::Var(name.to_string())
    })(input)
}

fn factor(input: &str) -> IResult<&str, ScriptExpr> {
    ws(alt((
        variable,
        map(preceded(char('-'), factor), |e| ScriptExpr::Neg(Box::new(e))),
        delimited(char('('), expression, char(')')),
        map(double, ScriptExpr::Number),
    )))(input)
}

fn fold(first: ScriptExpr, rest: Vec<(char, ScriptExpr)>) -> ScriptExpr {
    rest.into_iter().fold(first, |lhs, (op, rhs)| {
        let op = match op {
            '+' => BinaryOp::Add,
            '-' => BinaryOp::Sub,
            '*' => BinaryOp::Mul,
            '/' => BinaryOp::Div,
            _ => BinaryOp::Rem,
        };
        ScriptExpr::Binary(Box::new(lhs), op, Box::new(rhs))
    })
}

fn term(input: &str) -> IResult<&str, ScriptExpr> {
    let (input, first) = factor(input)?;
    let (input, rest) = many0(tuple((one_of("*/%"), factor)))(input)?;
    Ok((input, fold(first, rest)))
}

fn expression(input: &str) -> IResult<&str, ScriptExpr> {
    let (input, first) = term(input)?;
    let (input, rest) = many0(tuple((one_of("+-"), term)))(input)?;
    Ok((input, fold(first, rest)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_precedence() {
        let script = Script::parse("params.a + params.b * 2").unwrap();
        assert_eq!(script.eval(&vars(&[("a", 1.0), ("b", 3.0)])), Some(7.0));
        let script = Script::parse("(params.a + params.b) * 2").unwrap();
        assert_eq!(script.eval(&vars(&[("a", 1.0), ("b", 3.0)])), Some(8.0));
        let script = Script::parse("10 - 4 - 3").unwrap();
        assert_eq!(script.eval(&HashMap::new()), Some(3.0));
    }

    #[test]
    fn test_unary_and_modulo() {
        let script = Script::parse("-params.x % 4").unwrap();
        assert_eq!(script.eval(&vars(&[("x", 10.0)])), Some(-2.0));
        let script = Script::parse("2 - -1").unwrap();
        assert_eq!(script.eval(&HashMap::new()), Some(3.0));
    }

    #[test]
    fn test_indexed_params_and_return() {
        let script = Script::parse("return params['total sales'] / params.count;").unwrap();
        assert_eq!(script.variables(), vec!["total sales", "count"]);
        assert_eq!(
            script.eval(&vars(&[("total sales", 10.0), ("count", 4.0)])),
            Some(2.5)
        );
    }

    #[test]
    fn test_missing_and_division_by_zero() {
        let script = Script::parse("params.a / params.b").unwrap();
        assert_eq!(script.eval(&vars(&[("a", 1.0)])), None);
        assert_eq!(script.eval(&vars(&[("a", 1.0), ("b", 0.0)])), None);
    }

    #[test]
    fn test_rejects_unsupported() {
        assert!(Script::parse("Math.log(params.a)").is_err());
        assert!(Script::parse("params.a +").is_err());
        assert!(Script::parse("params.a params.b").is_err());
    }
}
