//! Boolean predicates over support-set attributes, e.g.
//! `oob_rate > 0.3 or (n_samples < 20 and importance_elev >= 0.5)`.
//!
//! Grammar:
//!
//! ```text
//! expr       := and_expr (("or" | "|") and_expr)*
//! and_expr   := unary (("and" | "&") unary)*
//! unary      := ("not" | "~") unary | "(" expr ")" | comparison
//! comparison := IDENT OP NUMBER
//! OP         := "<" | "<=" | ">" | ">=" | "==" | "!="
//! ```

use crate::EnsembleError;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `==`
    Eq,
    /// `!=`
    Ne,
}

impl CompareOp {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CompareOp::Lt => lhs < rhs,
            CompareOp::Le => lhs <= rhs,
            CompareOp::Gt => lhs > rhs,
            CompareOp::Ge => lhs >= rhs,
            CompareOp::Eq => lhs == rhs,
            CompareOp::Ne => lhs != rhs,
        }
    }
}

/// Parsed drop expression.
#[derive(Debug, Clone, PartialEq)]
pub enum DropExpr {
    /// `column op value`.
    Compare {
        /// Attribute name.
        column: String,
        /// Operator.
        op: CompareOp,
        /// Literal right-hand side.
        value: f64,
    },
    /// Logical negation.
    Not(Box<DropExpr>),
    /// Logical conjunction.
    And(Box<DropExpr>, Box<DropExpr>),
    /// Logical disjunction.
    Or(Box<DropExpr>, Box<DropExpr>),
}

impl DropExpr {
    /// Parse an expression.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::DropExpressionSyntax`] with the byte offset
    /// of the first unexpected token.
    pub fn parse(text: &str) -> Result<Self, EnsembleError> {
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            text,
            tokens: &tokens,
            pos: 0,
        };
        let expr = parser.or_expr()?;
        if let Some((offset, token)) = parser.tokens.get(parser.pos) {
            return Err(syntax(text, *offset, format!("unexpected {token:?}")));
        }
        Ok(expr)
    }

    /// Every column name referenced, in first-appearance order.
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            DropExpr::Compare { column, .. } => {
                if !out.contains(&column.as_str()) {
                    out.push(column);
                }
            }
            DropExpr::Not(inner) => inner.collect_columns(out),
            DropExpr::And(a, b) | DropExpr::Or(a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
        }
    }

    /// Evaluate against a column lookup.
    ///
    /// # Errors
    ///
    /// Returns the name of the first column `lookup` cannot resolve.
    pub fn evaluate(&self, lookup: &impl Fn(&str) -> Option<f64>) -> Result<bool, String> {
        Ok(match self {
            DropExpr::Compare { column, op, value } => {
                let lhs = lookup(column).ok_or_else(|| column.clone())?;
                op.apply(lhs, *value)
            }
            DropExpr::Not(inner) => !inner.evaluate(lookup)?,
            // No short-circuit: unknown columns always surface.
            DropExpr::And(a, b) => {
                let (a, b) = (a.evaluate(lookup)?, b.evaluate(lookup)?);
                a && b
            }
            DropExpr::Or(a, b) => {
                let (a, b) = (a.evaluate(lookup)?, b.evaluate(lookup)?);
                a || b
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn syntax(text: &str, position: usize, message: String) -> EnsembleError {
    EnsembleError::DropExpressionSyntax {
        expr: text.to_string(),
        position,
        message,
    }
}

fn tokenize(text: &str) -> Result<Vec<(usize, Token)>, EnsembleError> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        let token = match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'(' => {
                i += 1;
                Token::LParen
            }
            b')' => {
                i += 1;
                Token::RParen
            }
            b'&' => {
                i += if bytes.get(i + 1) == Some(&b'&') { 2 } else { 1 };
                Token::And
            }
            b'|' => {
                i += if bytes.get(i + 1) == Some(&b'|') { 2 } else { 1 };
                Token::Or
            }
            b'~' => {
                i += 1;
                Token::Not
            }
            b'<' | b'>' | b'=' | b'!' => {
                let eq_next = bytes.get(i + 1) == Some(&b'=');
                let op = match (c, eq_next) {
                    (b'<', false) => CompareOp::Lt,
                    (b'<', true) => CompareOp::Le,
                    (b'>', false) => CompareOp::Gt,
                    (b'>', true) => CompareOp::Ge,
                    (b'=', true) => CompareOp::Eq,
                    (b'!', true) => CompareOp::Ne,
                    _ => return Err(syntax(text, start, format!("incomplete operator '{}'", c as char))),
                };
                i += if eq_next { 2 } else { 1 };
                Token::Op(op)
            }
            b'0'..=b'9' | b'.' | b'-' | b'+' => {
                i += 1;
                while i < bytes.len() {
                    let d = bytes[i];
                    let exponent_sign = (d == b'-' || d == b'+') && matches!(bytes[i - 1], b'e' | b'E');
                    if d.is_ascii_digit() || d == b'.' || d == b'e' || d == b'E' || exponent_sign {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let literal = &text[start..i];
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| syntax(text, start, format!("invalid number '{literal}'")))?;
                Token::Number(value)
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                match &text[start..i] {
                    "and" | "AND" => Token::And,
                    "or" | "OR" => Token::Or,
                    "not" | "NOT" => Token::Not,
                    ident => Token::Ident(ident.to_string()),
                }
            }
            _ => {
                let ch = text[start..].chars().next().unwrap_or('?');
                return Err(syntax(text, start, format!("unexpected character '{ch}'")));
            }
        };
        tokens.push((start, token));
    }
    Ok(tokens)
}

struct Parser<'a> {
    text: &'a str,
    tokens: &'a [(usize, Token)],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.text.len(), |(o, _)| *o)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn or_expr(&mut self) -> Result<DropExpr, EnsembleError> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and_expr()?;
            lhs = DropExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<DropExpr, EnsembleError> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = DropExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<DropExpr, EnsembleError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::Not) => Ok(DropExpr::Not(Box::new(self.unary()?))),
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                let close = self.offset();
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(syntax(self.text, close, "expected ')'".to_string())),
                }
            }
            Some(Token::Ident(column)) => {
                let op_offset = self.offset();
                let Some(Token::Op(op)) = self.advance() else {
                    return Err(syntax(self.text, op_offset, "expected comparison operator".to_string()));
                };
                let value_offset = self.offset();
                let Some(Token::Number(value)) = self.advance() else {
                    return Err(syntax(self.text, value_offset, "expected number".to_string()));
                };
                Ok(DropExpr::Compare { column, op, value })
            }
            Some(other) => Err(syntax(self.text, offset, format!("unexpected {other:?}"))),
            None => Err(syntax(self.text, offset, "unexpected end of expression".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn eval(text: &str, attrs: &[(&str, f64)]) -> Result<bool, String> {
        let map: HashMap<&str, f64> = attrs.iter().copied().collect();
        DropExpr::parse(text).unwrap().evaluate(&|c: &str| map.get(c).copied())
    }

    #[test]
    fn single_comparison() {
        assert!(eval("oob_rate > 0.4", &[("oob_rate", 0.5)]).unwrap());
        assert!(!eval("oob_rate > 0.4", &[("oob_rate", 0.4)]).unwrap());
        assert!(eval("oob_count != 3", &[("oob_count", 2.0)]).unwrap());
    }

    #[test]
    fn precedence_and_binds_tighter_than_or() {
        let attrs = [("a", 1.0), ("b", 0.0), ("c", 1.0)];
        assert!(eval("a == 1 or b == 1 and c == 0", &attrs).unwrap());
        assert!(!eval("(a == 1 or b == 1) and c == 0", &attrs).unwrap());
    }

    #[test]
    fn not_and_symbol_forms() {
        let attrs = [("n_samples", 12.0), ("importance_elev", 0.7)];
        assert!(eval("not n_samples >= 20 & importance_elev >= 0.5", &attrs).unwrap());
        assert!(eval("~(n_samples > 100) | n_samples < 0", &attrs).unwrap());
    }

    #[test]
    fn negative_and_exponent_numbers() {
        assert!(eval("ul_x < -1.5e3", &[("ul_x", -2000.0)]).unwrap());
        assert!(eval("lr_y >= 2E+2", &[("lr_y", 200.0)]).unwrap());
    }

    #[test]
    fn unknown_column_reported() {
        assert_eq!(eval("oob_rate > 0.1 or bogus < 2", &[("oob_rate", 0.9)]), Err("bogus".to_string()));
    }

    #[test]
    fn syntax_errors_carry_offset() {
        let cases = [
            ("oob_rate >", 10),
            ("oob_rate 0.3", 9),
            ("(oob_rate > 1", 13),
            ("oob_rate = 1", 9),
            ("oob_rate > 1 )", 13),
            ("oob_rate > 1 $", 13),
        ];
        for (text, expected) in cases {
            match DropExpr::parse(text) {
                Err(EnsembleError::DropExpressionSyntax { position, .. }) => {
                    assert_eq!(position, expected, "{text}");
                }
                other => panic!("{text}: expected syntax error, got {other:?}"),
            }
        }
    }

    #[test]
    fn columns_listed_once() {
        let expr = DropExpr::parse("a > 1 and (b < 2 or a < 0)").unwrap();
        assert_eq!(expr.columns(), vec!["a", "b"]);
    }
}
