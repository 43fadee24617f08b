//! A minimal filter grammar and parser.
//!
//! The query parser that turns a filter string into a filter tree is an
//! external collaborator per §1 of the spec; the scan-controller factory
//! (§4.3) cannot be exercised or tested without *something* upstream of
//! it, though, so this is a deliberately small recursive-descent parser:
//! `column op literal`, `&&`, `||`, parentheses, and the `true`/`false`
//! literals the range lowering needs for its short-circuit cases. It is
//! not a general SQL-filter grammar and does not try to be one.

use std::fmt;

use submerge_base::{kind_err, ErrorKind, Result};

use crate::codec::{FilterOp, Value};
use crate::row::Row;
use crate::schema::RowInfo;

#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    True,
    False,
    Cmp { column: String, op: FilterOp, arg: Value },
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
}

impl FilterExpr {
    /// Evaluates the filter against a fully decoded row. Columns that are
    /// unset or SQL-null never satisfy a comparison (three-valued-logic
    /// simplification: this grammar has no `IS NULL` operator).
    pub fn evaluate(&self, row: &Row, _info: &RowInfo) -> bool {
        match self {
            FilterExpr::True => true,
            FilterExpr::False => false,
            FilterExpr::Cmp { column, op, arg } => match row.get(column).as_value() {
                Some(v) => op.compare(v, arg),
                None => false,
            },
            FilterExpr::And(parts) => parts.iter().all(|p| p.evaluate(row, _info)),
            FilterExpr::Or(parts) => parts.iter().any(|p| p.evaluate(row, _info)),
        }
    }

    /// Disjunctive normal form: a list of conjunctions of comparison
    /// atoms. `True` lowers to one empty conjunction (matches
    /// everything); `False` lowers to zero conjunctions (matches
    /// nothing) -- the §9 open question's "empty scan plan" resolution.
    pub fn to_dnf(&self) -> Vec<Vec<(String, FilterOp, Value)>> {
        match self {
            FilterExpr::True => vec![Vec::new()],
            FilterExpr::False => Vec::new(),
            FilterExpr::Cmp { column, op, arg } => vec![vec![(column.clone(), *op, arg.clone())]],
            FilterExpr::And(parts) => {
                let mut acc = vec![Vec::new()];
                for part in parts {
                    let part_dnf = part.to_dnf();
                    let mut next = Vec::with_capacity(acc.len() * part_dnf.len());
                    for conj in &acc {
                        for pconj in &part_dnf {
                            let mut merged = conj.clone();
                            merged.extend(pconj.iter().cloned());
                            next.push(merged);
                        }
                    }
                    acc = next;
                }
                acc
            }
            FilterExpr::Or(parts) => parts.iter().flat_map(|p| p.to_dnf()).collect(),
        }
    }
}

impl fmt::Display for FilterExpr {
    /// A canonical-ish rendering used as the filter-factory cache key
    /// (§4.3: "the parsed filter's toString(), which collapses
    /// equivalent expressions"). This implementation collapses
    /// associativity/parenthesization differences but does not attempt
    /// full boolean-algebra normalization.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterExpr::True => write!(f, "true"),
            FilterExpr::False => write!(f, "false"),
            FilterExpr::Cmp { column, op, arg } => write!(f, "{column}{}{arg:?}", op_str(*op)),
            FilterExpr::And(parts) => {
                let rendered: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "({})", rendered.join("&&"))
            }
            FilterExpr::Or(parts) => {
                let rendered: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "({})", rendered.join("||"))
            }
        }
    }
}

fn op_str(op: FilterOp) -> &'static str {
    match op {
        FilterOp::Eq => "==",
        FilterOp::Ne => "!=",
        FilterOp::Lt => "<",
        FilterOp::Le => "<=",
        FilterOp::Gt => ">",
        FilterOp::Ge => ">=",
    }
}

pub fn parse(input: &str) -> Result<FilterExpr> {
    let tokens = tokenize(input)?;
    let mut p = Parser { tokens, pos: 0 };
    let expr = p.parse_or()?;
    if p.pos != p.tokens.len() {
        return Err(kind_err(ErrorKind::FilterParse, format!("trailing input in filter {input:?}")));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Int(i64),
    Str(String),
    Op(FilterOp),
    And,
    Or,
    LParen,
    RParen,
    True,
    False,
}

fn tokenize(input: &str) -> Result<Vec<Tok>> {
    let mut out = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                out.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                out.push(Tok::RParen);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                out.push(Tok::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                out.push(Tok::Or);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                out.push(Tok::Op(FilterOp::Eq));
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                out.push(Tok::Op(FilterOp::Ne));
                i += 2;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                out.push(Tok::Op(FilterOp::Ge));
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                out.push(Tok::Op(FilterOp::Le));
                i += 2;
            }
            '>' => {
                out.push(Tok::Op(FilterOp::Gt));
                i += 1;
            }
            '<' => {
                out.push(Tok::Op(FilterOp::Lt));
                i += 1;
            }
            '"' => {
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(kind_err(ErrorKind::FilterParse, "unterminated string literal"));
                }
                i += 1;
                out.push(Tok::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let s: String = chars[start..i].iter().collect();
                let n: i64 = s
                    .parse()
                    .map_err(|_| kind_err(ErrorKind::FilterParse, format!("bad integer literal {s:?}")))?;
                out.push(Tok::Int(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let s: String = chars[start..i].iter().collect();
                match s.as_str() {
                    "true" => out.push(Tok::True),
                    "false" => out.push(Tok::False),
                    _ => out.push(Tok::Ident(s)),
                }
            }
            other => return Err(kind_err(ErrorKind::FilterParse, format!("unexpected character {other:?}"))),
        }
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> Result<FilterExpr> {
        let mut parts = vec![self.parse_and()?];
        while matches!(self.peek(), Some(Tok::Or)) {
            self.pos += 1;
            parts.push(self.parse_and()?);
        }
        Ok(if parts.len() == 1 { parts.pop().unwrap() } else { FilterExpr::Or(parts) })
    }

    fn parse_and(&mut self) -> Result<FilterExpr> {
        let mut parts = vec![self.parse_atom()?];
        while matches!(self.peek(), Some(Tok::And)) {
            self.pos += 1;
            parts.push(self.parse_atom()?);
        }
        Ok(if parts.len() == 1 { parts.pop().unwrap() } else { FilterExpr::And(parts) })
    }

    fn parse_atom(&mut self) -> Result<FilterExpr> {
        match self.peek().cloned() {
            Some(Tok::True) => {
                self.pos += 1;
                Ok(FilterExpr::True)
            }
            Some(Tok::False) => {
                self.pos += 1;
                Ok(FilterExpr::False)
            }
            Some(Tok::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                if !matches!(self.peek(), Some(Tok::RParen)) {
                    return Err(kind_err(ErrorKind::FilterParse, "expected closing paren"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(Tok::Ident(column)) => {
                self.pos += 1;
                let op = match self.peek() {
                    Some(Tok::Op(op)) => *op,
                    _ => return Err(kind_err(ErrorKind::FilterParse, format!("expected comparison operator after {column}"))),
                };
                self.pos += 1;
                let arg = match self.peek().cloned() {
                    Some(Tok::Int(n)) => Value::I64(n),
                    Some(Tok::Str(s)) => Value::Str(s),
                    Some(Tok::True) => Value::Bool(true),
                    Some(Tok::False) => Value::Bool(false),
                    _ => return Err(kind_err(ErrorKind::FilterParse, "expected literal argument")),
                };
                self.pos += 1;
                Ok(FilterExpr::Cmp { column, op, arg })
            }
            other => Err(kind_err(ErrorKind::FilterParse, format!("unexpected token {other:?}"))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_simple_range() {
        // S2: filter id >= 10 && id < 20.
        let expr = parse("id >= 10 && id < 20").unwrap();
        assert_eq!(
            expr,
            FilterExpr::And(vec![
                FilterExpr::Cmp { column: "id".into(), op: FilterOp::Ge, arg: Value::I64(10) },
                FilterExpr::Cmp { column: "id".into(), op: FilterOp::Lt, arg: Value::I64(20) },
            ])
        );
    }

    #[test]
    fn test_parse_multi_range() {
        // S3: filter id == 5 || id == 7.
        let expr = parse("id == 5 || id == 7").unwrap();
        let dnf = expr.to_dnf();
        assert_eq!(dnf.len(), 2);
    }

    #[test]
    fn test_dnf_distribution() {
        let expr = parse("(a == 1 || a == 2) && b == 3").unwrap();
        let dnf = expr.to_dnf();
        assert_eq!(dnf.len(), 2);
        for conj in &dnf {
            assert_eq!(conj.len(), 2);
        }
    }

    #[test]
    fn test_false_lowers_to_empty_dnf() {
        assert!(FilterExpr::False.to_dnf().is_empty());
    }

    #[test]
    fn test_true_lowers_to_single_empty_conjunction() {
        let dnf = FilterExpr::True.to_dnf();
        assert_eq!(dnf, vec![Vec::new()]);
    }

    #[test]
    fn test_canonical_string_collapses_parens() {
        let a = parse("a == 1 && b == 2").unwrap();
        let b = parse("(a == 1 && b == 2)").unwrap();
        assert_eq!(a.to_string(), b.to_string());
    }
}
