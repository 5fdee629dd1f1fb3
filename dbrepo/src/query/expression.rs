//! Predicate expressions: a small text syntax for filters.
//!
//! ```text
//! Id == 5
//! Name LIKE 'A%' && (Age >= 18 || Guardian != null)
//! Status IN ('open', 'held') AND NOT Archived == true
//! Total BETWEEN 10 AND 20.5
//! ```
//!
//! Comparisons take a column on the left and a literal on the right. `&&`/`AND`, `||`/`OR` and
//! `!`/`NOT` combine them with the usual precedence (NOT binds tightest, then AND, then OR).
//! Runs of the same conjunction flatten into one [`QueryGroup`], so `a && b && c` is a single
//! three-field group, identical to the group built from the three [`QueryField`]s directly.

use crate::errors::{Error, Result};
use crate::query::field::{Operation, QueryField};
use crate::query::group::{Conjunction, MAX_NESTING, QueryGroup};
use crate::types::Value;

/// Parse a predicate expression into a query group.
pub fn parse(input: &str) -> Result<QueryGroup> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
        depth: 0,
    };
    let node = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        return Err(Error::normalization(token.offset, format!("unexpected {}", token.kind.describe())));
    }
    Ok(node.into_group())
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Compare(Operation),
    And,
    Or,
    Not,
    LParen,
    RParen,
    Comma,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Ident(name) => format!("identifier `{name}`"),
            TokenKind::Int(v) => format!("number {v}"),
            TokenKind::Float(v) => format!("number {v}"),
            TokenKind::Str(v) => format!("string '{v}'"),
            TokenKind::Compare(op) => format!("operator {op:?}"),
            TokenKind::And => "AND".to_string(),
            TokenKind::Or => "OR".to_string(),
            TokenKind::Not => "NOT".to_string(),
            TokenKind::LParen => "`(`".to_string(),
            TokenKind::RParen => "`)`".to_string(),
            TokenKind::Comma => "`,`".to_string(),
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, TokenKind::Ident(name) if name.eq_ignore_ascii_case(keyword))
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let two = bytes.get(i..i + 2);
        let kind = match (c, two) {
            (_, Some(b"&&")) => {
                i += 2;
                TokenKind::And
            }
            (_, Some(b"||")) => {
                i += 2;
                TokenKind::Or
            }
            (_, Some(b"==")) => {
                i += 2;
                TokenKind::Compare(Operation::Equal)
            }
            (_, Some(b"!=")) | (_, Some(b"<>")) => {
                i += 2;
                TokenKind::Compare(Operation::NotEqual)
            }
            (_, Some(b"<=")) => {
                i += 2;
                TokenKind::Compare(Operation::LessThanOrEqual)
            }
            (_, Some(b">=")) => {
                i += 2;
                TokenKind::Compare(Operation::GreaterThanOrEqual)
            }
            (b'=', _) => {
                i += 1;
                TokenKind::Compare(Operation::Equal)
            }
            (b'<', _) => {
                i += 1;
                TokenKind::Compare(Operation::LessThan)
            }
            (b'>', _) => {
                i += 1;
                TokenKind::Compare(Operation::GreaterThan)
            }
            (b'!', _) => {
                i += 1;
                TokenKind::Not
            }
            (b'(', _) => {
                i += 1;
                TokenKind::LParen
            }
            (b')', _) => {
                i += 1;
                TokenKind::RParen
            }
            (b',', _) => {
                i += 1;
                TokenKind::Comma
            }
            (b'\'' | b'"', _) => {
                let (text, next) = read_string(input, i)?;
                i = next;
                TokenKind::Str(text)
            }
            (b'-' | b'0'..=b'9', _) => {
                let (kind, next) = read_number(input, i)?;
                i = next;
                kind
            }
            (c, _) if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                let word = &input[start..i];
                if word.eq_ignore_ascii_case("and") {
                    TokenKind::And
                } else if word.eq_ignore_ascii_case("or") {
                    TokenKind::Or
                } else if word.eq_ignore_ascii_case("not") {
                    TokenKind::Not
                } else {
                    TokenKind::Ident(word.to_string())
                }
            }
            _ => {
                let ch = input[start..].chars().next().unwrap_or('?');
                return Err(Error::normalization(start, format!("unsupported character `{ch}`")));
            }
        };

        tokens.push(Token { kind, offset: start });
    }

    Ok(tokens)
}

fn read_string(input: &str, start: usize) -> Result<(String, usize)> {
    let bytes = input.as_bytes();
    let quote = bytes[start];
    let mut text = String::new();
    let mut i = start + 1;
    let mut chunk_start = i;

    while i < bytes.len() {
        if bytes[i] == quote {
            text.push_str(&input[chunk_start..i]);
            // doubled quote is an escaped quote
            if bytes.get(i + 1) == Some(&quote) {
                text.push(quote as char);
                i += 2;
                chunk_start = i;
                continue;
            }
            return Ok((text, i + 1));
        }
        i += 1;
    }

    Err(Error::normalization(start, "unterminated string literal"))
}

fn read_number(input: &str, start: usize) -> Result<(TokenKind, usize)> {
    let bytes = input.as_bytes();
    let mut i = start;
    if bytes[i] == b'-' {
        i += 1;
    }
    let digits_start = i;
    let mut is_float = false;
    while i < bytes.len() && (bytes[i].is_ascii_digit() || (bytes[i] == b'.' && !is_float)) {
        if bytes[i] == b'.' {
            is_float = true;
        }
        i += 1;
    }
    if i == digits_start {
        return Err(Error::normalization(start, "expected a number after `-`"));
    }

    let text = &input[start..i];
    let kind = if is_float {
        TokenKind::Float(
            text.parse()
                .map_err(|_| Error::normalization(start, format!("invalid number `{text}`")))?,
        )
    } else {
        TokenKind::Int(
            text.parse()
                .map_err(|_| Error::normalization(start, format!("invalid number `{text}`")))?,
        )
    };
    Ok((kind, i))
}

#[derive(Debug)]
enum Node {
    Compare(QueryField),
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
}

impl Node {
    fn into_group(self) -> QueryGroup {
        match self {
            Node::Compare(field) => QueryGroup::and(vec![field]),
            Node::And(children) => Self::collect(Conjunction::And, children),
            Node::Or(children) => Self::collect(Conjunction::Or, children),
            Node::Not(inner) => inner.into_group().negate(),
        }
    }

    fn collect(conjunction: Conjunction, children: Vec<Node>) -> QueryGroup {
        let mut group = QueryGroup::new(conjunction);
        for child in children {
            match child {
                Node::Compare(field) => group.fields.push(field),
                other => group.groups.push(other.into_group()),
            }
        }
        group
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
    /// Open parentheses and negations around the current position
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn offset(&self) -> usize {
        self.peek().map(|t| t.offset).unwrap_or(self.end)
    }

    fn expect_next(&mut self, what: &str) -> Result<Token> {
        let offset = self.offset();
        self.next()
            .ok_or_else(|| Error::normalization(offset, format!("expected {what}, found end of expression")))
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().map(|t| &t.kind) == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Node> {
        let mut children = vec![self.parse_and()?];
        while self.eat(&TokenKind::Or) {
            children.push(self.parse_and()?);
        }
        Ok(flatten(children, |node| match node {
            Node::Or(inner) => Ok(inner),
            other => Err(other),
        }, Node::Or))
    }

    fn parse_and(&mut self) -> Result<Node> {
        let mut children = vec![self.parse_unary()?];
        while self.eat(&TokenKind::And) {
            children.push(self.parse_unary()?);
        }
        Ok(flatten(children, |node| match node {
            Node::And(inner) => Ok(inner),
            other => Err(other),
        }, Node::And))
    }

    /// Run `parse` one nesting level deeper, refusing to go past [`MAX_NESTING`].
    fn nested<T>(&mut self, offset: usize, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING {
            return Err(Error::normalization(
                offset,
                format!("expression nested too deeply (more than {MAX_NESTING} levels)"),
            ));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn parse_unary(&mut self) -> Result<Node> {
        let offset = self.offset();
        if self.eat(&TokenKind::Not) {
            let inner = self.nested(offset, Self::parse_unary)?;
            return Ok(Node::Not(Box::new(inner)));
        }
        if self.eat(&TokenKind::LParen) {
            let inner = self.nested(offset, Self::parse_or)?;
            let offset = self.offset();
            if !self.eat(&TokenKind::RParen) {
                return Err(Error::normalization(offset, "expected `)`"));
            }
            return Ok(inner);
        }
        self.parse_comparison().map(Node::Compare)
    }

    fn parse_comparison(&mut self) -> Result<QueryField> {
        let token = self.expect_next("a column name")?;
        let field = match token.kind {
            TokenKind::Ident(name) => name,
            other => {
                return Err(Error::normalization(
                    token.offset,
                    format!("expected a column name, found {}", other.describe()),
                ));
            }
        };

        let negated = self.eat(&TokenKind::Not);
        let token = self.expect_next("an operator")?;

        match token.kind {
            TokenKind::Compare(operation) if !negated => {
                let value_offset = self.offset();
                let value = self.parse_literal()?;
                if value.is_null() && !matches!(operation, Operation::Equal | Operation::NotEqual) {
                    return Err(Error::normalization(value_offset, "null can only be compared with == or !="));
                }
                Ok(QueryField::new(field, operation, value))
            }
            ref kind if kind.is_keyword("like") => {
                let value_offset = self.offset();
                let pattern = self.parse_literal()?;
                if !matches!(pattern, Value::Text(_)) {
                    return Err(Error::normalization(value_offset, "LIKE needs a string pattern"));
                }
                let operation = if negated { Operation::NotLike } else { Operation::Like };
                Ok(QueryField::new(field, operation, pattern))
            }
            ref kind if kind.is_keyword("in") => {
                let offset = self.offset();
                if !self.eat(&TokenKind::LParen) {
                    return Err(Error::normalization(offset, "expected `(` after IN"));
                }
                let mut items = Vec::new();
                if !self.eat(&TokenKind::RParen) {
                    loop {
                        items.push(self.parse_literal()?);
                        if self.eat(&TokenKind::Comma) {
                            continue;
                        }
                        let offset = self.offset();
                        if self.eat(&TokenKind::RParen) {
                            break;
                        }
                        return Err(Error::normalization(offset, "expected `,` or `)` in IN list"));
                    }
                }
                let operation = if negated { Operation::NotIn } else { Operation::In };
                Ok(QueryField::new(field, operation, Value::Array(items)))
            }
            ref kind if kind.is_keyword("between") => {
                let low = self.parse_literal()?;
                let offset = self.offset();
                if !self.eat(&TokenKind::And) {
                    return Err(Error::normalization(offset, "expected AND in BETWEEN"));
                }
                let high = self.parse_literal()?;
                let operation = if negated { Operation::NotBetween } else { Operation::Between };
                Ok(QueryField::new(field, operation, Value::Array(vec![low, high])))
            }
            other => Err(Error::normalization(
                token.offset,
                format!("unsupported comparison {} after `{field}`", other.describe()),
            )),
        }
    }

    fn parse_literal(&mut self) -> Result<Value> {
        let token = self.expect_next("a value")?;
        match token.kind {
            TokenKind::Int(v) => Ok(Value::Int(v)),
            TokenKind::Float(v) => Ok(Value::Float(v)),
            TokenKind::Str(v) => Ok(Value::Text(v)),
            ref kind if kind.is_keyword("true") => Ok(Value::Bool(true)),
            ref kind if kind.is_keyword("false") => Ok(Value::Bool(false)),
            ref kind if kind.is_keyword("null") => Ok(Value::Null),
            other => Err(Error::normalization(
                token.offset,
                format!("expected a literal value, found {}", other.describe()),
            )),
        }
    }
}

/// Collapse a single-child chain, and splice same-conjunction children into their parent.
fn flatten(mut children: Vec<Node>, unwrap: impl Fn(Node) -> std::result::Result<Vec<Node>, Node>, wrap: fn(Vec<Node>) -> Node) -> Node {
    if children.len() == 1
        && let Some(only) = children.pop()
    {
        return only;
    }
    let mut flat = Vec::with_capacity(children.len());
    for child in children {
        match unwrap(child) {
            Ok(inner) => flat.extend(inner),
            Err(other) => flat.push(other),
        }
    }
    wrap(flat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn single_comparison_is_a_one_field_conjunction() {
        let group = parse("Id == 5").unwrap();
        assert_eq!(group, QueryGroup::and(vec![QueryField::equal("Id", 5_i64)]));
    }

    #[test]
    fn and_chains_flatten_into_one_group() {
        let parsed = parse("a == 1 && b == 2 AND (c == 3 && d == 4)").unwrap();
        let built = QueryGroup::and(vec![
            QueryField::equal("a", 1_i64),
            QueryField::equal("b", 2_i64),
            QueryField::equal("c", 3_i64),
            QueryField::equal("d", 4_i64),
        ]);
        assert_eq!(parsed, built);
    }

    #[test]
    fn or_binds_looser_than_and() {
        let group = parse("a == 1 && b == 2 || c == 3").unwrap();

        assert_eq!(group.conjunction, Conjunction::Or);
        assert_eq!(group.fields, vec![QueryField::equal("c", 3_i64)]);
        assert_eq!(group.groups.len(), 1);
        assert_eq!(group.groups[0].conjunction, Conjunction::And);
        assert_eq!(group.groups[0].fields.len(), 2);
    }

    #[test]
    fn not_negates_a_group() {
        let group = parse("!(a == 1 || b == 2)").unwrap();
        assert!(group.is_not);
        assert_eq!(group.conjunction, Conjunction::Or);
    }

    #[rstest]
    #[case("name LIKE 'A%'", Operation::Like, Value::Text("A%".into()))]
    #[case("name NOT LIKE \"x\"", Operation::NotLike, Value::Text("x".into()))]
    #[case("id IN (1, 2, 3)", Operation::In, Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]))]
    #[case("id not in ()", Operation::NotIn, Value::Array(vec![]))]
    #[case("total BETWEEN 10 AND 20.5", Operation::Between, Value::Array(vec![Value::Int(10), Value::Float(20.5)]))]
    #[case("deleted_at == null", Operation::Equal, Value::Null)]
    #[case("active <> false", Operation::NotEqual, Value::Bool(false))]
    #[case("balance <= -3", Operation::LessThanOrEqual, Value::Int(-3))]
    #[case("title = 'it''s'", Operation::Equal, Value::Text("it's".into()))]
    fn comparison_forms(#[case] input: &str, #[case] operation: Operation, #[case] value: Value) {
        let group = parse(input).unwrap();
        assert_eq!(group.fields.len(), 1);
        assert_eq!(group.fields[0].operation, operation);
        assert_eq!(group.fields[0].value, value);
    }

    #[rstest]
    #[case("")]
    #[case("Id ==")]
    #[case("Id ~ 5")]
    #[case("5 == Id")]
    #[case("Id == 5 &&")]
    #[case("(Id == 5")]
    #[case("name LIKE 5")]
    #[case("age > null")]
    #[case("name == 'open")]
    #[case("Id == 5 6")]
    fn malformed_expressions_fail(#[case] input: &str) {
        assert!(matches!(parse(input), Err(Error::Normalization { .. })));
    }

    #[test]
    fn deep_nesting_is_rejected_instead_of_overflowing() {
        let input = format!("{}id == 1{}", "(".repeat(5_000), ")".repeat(5_000));
        match parse(&input) {
            Err(Error::Normalization { position, message }) => {
                assert_eq!(position, MAX_NESTING);
                assert!(message.contains("nested too deeply"), "{message}");
            }
            other => panic!("expected normalization error, got {other:?}"),
        }

        let negations = format!("{}id == 1", "!".repeat(5_000));
        assert!(matches!(parse(&negations), Err(Error::Normalization { .. })));
    }

    #[test]
    fn nesting_up_to_the_limit_parses() {
        let depth = MAX_NESTING - 1;
        let input = format!("{}id == 1{}", "(".repeat(depth), ")".repeat(depth));
        assert_eq!(parse(&input).unwrap(), QueryGroup::and(vec![QueryField::equal("id", 1_i64)]));
    }

    #[test]
    fn error_reports_offending_position() {
        match parse("Id == 5 && Name ~ 'x'") {
            Err(Error::Normalization { position, .. }) => assert_eq!(position, 16),
            other => panic!("expected normalization error, got {other:?}"),
        }
    }
}
