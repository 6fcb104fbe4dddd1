//! Recursive-descent parser for predicate expressions

use serde_json::Value;

use super::{CompareOp, FieldPath, Predicate, PredicateError};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(Value),
    Str(String),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier '{}'", name),
            Token::Number(n) => format!("number {}", n),
            Token::Str(s) => format!("string \"{}\"", s),
            Token::Op(op) => format!("operator '{}'", op.as_str()),
            Token::And => "'&&'".to_string(),
            Token::Or => "'||'".to_string(),
            Token::Not => "'!'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, PredicateError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, ch) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        match ch {
            c if c.is_whitespace() => {
                i += 1;
            }
            '(' => {
                tokens.push((Token::LParen, offset));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, offset));
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push((Token::And, offset));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push((Token::Or, offset));
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push((Token::Op(CompareOp::Eq), offset));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push((Token::Op(CompareOp::Ne), offset));
                i += 2;
            }
            '!' => {
                tokens.push((Token::Not, offset));
                i += 1;
            }
            '>' | '<' => {
                let (op, width) = match (ch, next) {
                    ('>', Some('=')) => (CompareOp::Ge, 2),
                    ('>', _) => (CompareOp::Gt, 1),
                    ('<', Some('=')) => (CompareOp::Le, 2),
                    _ => (CompareOp::Lt, 1),
                };
                tokens.push((Token::Op(op), offset));
                i += width;
            }
            '"' | '\'' => {
                let quote = ch;
                let mut text = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    let c = chars[j].1;
                    if c == '\\' && j + 1 < chars.len() {
                        text.push(chars[j + 1].1);
                        j += 2;
                        continue;
                    }
                    if c == quote {
                        closed = true;
                        break;
                    }
                    text.push(c);
                    j += 1;
                }
                if !closed {
                    return Err(PredicateError::UnterminatedString(offset));
                }
                tokens.push((Token::Str(text), offset));
                i = j + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let mut j = i + 1;
                while j < chars.len()
                    && (chars[j].1.is_ascii_digit()
                        || matches!(chars[j].1, '.' | 'e' | 'E')
                        || (matches!(chars[j].1, '+' | '-')
                            && matches!(chars[j - 1].1, 'e' | 'E')))
                {
                    j += 1;
                }
                let end = chars.get(j).map(|(o, _)| *o).unwrap_or(input.len());
                let raw = &input[offset..end];
                tokens.push((Token::Number(parse_number(raw, offset)?), offset));
                i = j;
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut j = i + 1;
                while j < chars.len()
                    && (chars[j].1.is_alphanumeric() || matches!(chars[j].1, '_' | '.'))
                {
                    j += 1;
                }
                let end = chars.get(j).map(|(o, _)| *o).unwrap_or(input.len());
                let word = &input[offset..end];
                let token = match word {
                    "contains" => Token::Op(CompareOp::Contains),
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push((token, offset));
                i = j;
            }
            other => {
                return Err(PredicateError::UnexpectedChar { ch: other, offset });
            }
        }
    }

    Ok(tokens)
}

fn parse_number(raw: &str, offset: usize) -> Result<Value, PredicateError> {
    let invalid = || PredicateError::Expected {
        expected: "number".to_string(),
        found: format!("'{}'", raw),
        offset,
    };
    if !raw.contains(['.', 'e', 'E']) {
        if let Ok(n) = raw.parse::<i64>() {
            return Ok(Value::from(n));
        }
        if let Ok(n) = raw.parse::<u64>() {
            return Ok(Value::from(n));
        }
    }
    let float = raw.parse::<f64>().map_err(|_| invalid())?;
    serde_json::Number::from_f64(float)
        .map(Value::Number)
        .ok_or_else(invalid)
}

/// Combined depth of parentheses and negations
const MAX_NESTING_DEPTH: usize = 64;

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, o)| *o).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expected(&self, expected: &str) -> PredicateError {
        PredicateError::Expected {
            expected: expected.to_string(),
            found: self
                .peek()
                .map(Token::describe)
                .unwrap_or_else(|| "end of input".to_string()),
            offset: self.offset(),
        }
    }

    fn descend(&mut self) -> Result<(), PredicateError> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(self.expected(&format!(
                "at most {} levels of nesting",
                MAX_NESTING_DEPTH
            )));
        }
        self.depth += 1;
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Predicate, PredicateError> {
        let mut items = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.next();
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Predicate::Or(items)
        })
    }

    fn parse_and(&mut self) -> Result<Predicate, PredicateError> {
        let mut items = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.next();
            items.push(self.parse_unary()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Predicate::And(items)
        })
    }

    fn parse_unary(&mut self) -> Result<Predicate, PredicateError> {
        if self.peek() == Some(&Token::Not) {
            self.descend()?;
            self.next();
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Predicate::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Predicate, PredicateError> {
        match self.peek() {
            Some(Token::LParen) => {
                self.descend()?;
                self.next();
                let inner = self.parse_or()?;
                if self.next() != Some(Token::RParen) {
                    self.pos = self.pos.saturating_sub(1);
                    return Err(self.expected("')'"));
                }
                self.depth -= 1;
                Ok(inner)
            }
            Some(Token::Ident(word)) if word == "true" || word == "false" => {
                let value = word == "true";
                self.next();
                Ok(Predicate::Literal(value))
            }
            Some(Token::Ident(word)) if word == "exists" => {
                self.next();
                match self.next() {
                    Some(Token::Ident(path)) => Ok(Predicate::Exists(FieldPath::new(&path))),
                    _ => {
                        self.pos = self.pos.saturating_sub(1);
                        Err(self.expected("field after 'exists'"))
                    }
                }
            }
            Some(Token::Ident(_)) => self.parse_comparison(),
            _ => Err(self.expected("field, literal or '('")),
        }
    }

    fn parse_comparison(&mut self) -> Result<Predicate, PredicateError> {
        let field = match self.next() {
            Some(Token::Ident(path)) => FieldPath::new(&path),
            _ => return Err(self.expected("field")),
        };
        let op = match self.peek() {
            Some(Token::Op(op)) => *op,
            _ => return Ok(Predicate::Truthy(field)),
        };
        self.next();
        let value = self.parse_literal()?;
        Ok(Predicate::Compare { field, op, value })
    }

    fn parse_literal(&mut self) -> Result<Value, PredicateError> {
        match self.peek().cloned() {
            Some(Token::Number(n)) => {
                self.next();
                Ok(n)
            }
            Some(Token::Str(s)) => {
                self.next();
                Ok(Value::String(s))
            }
            Some(Token::Ident(word)) if matches!(word.as_str(), "true" | "false" | "null") => {
                self.next();
                Ok(match word.as_str() {
                    "true" => Value::Bool(true),
                    "false" => Value::Bool(false),
                    _ => Value::Null,
                })
            }
            _ => Err(self.expected("literal")),
        }
    }
}

pub(super) fn parse(input: &str) -> Result<Predicate, PredicateError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(PredicateError::Empty);
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
        depth: 0,
    };
    let predicate = parser.parse_or()?;
    if parser.peek().is_some() {
        return Err(parser.expected("end of input"));
    }
    Ok(predicate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_comparison() {
        let p = parse("output.entity_count > 10").expect("parse");
        assert_eq!(
            p,
            Predicate::Compare {
                field: FieldPath::new("output.entity_count"),
                op: CompareOp::Gt,
                value: json!(10),
            }
        );
    }

    #[test]
    fn test_parse_precedence_and_grouping() {
        let p = parse("a == 1 || b == 2 && !c").expect("parse");
        match p {
            Predicate::Or(items) => {
                assert_eq!(items.len(), 2);
                assert!(matches!(items[1], Predicate::And(_)));
            }
            other => panic!("expected or, got {:?}", other),
        }

        let grouped = parse("(a == 1 || b == 2) && c").expect("parse");
        assert!(matches!(grouped, Predicate::And(_)));
    }

    #[test]
    fn test_parse_literals() {
        assert_eq!(parse("true").expect("parse"), Predicate::Literal(true));
        let p = parse("kind == 'memo' && score >= -1.5 && flag != null").expect("parse");
        match p {
            Predicate::And(items) => {
                assert_eq!(items.len(), 3);
                assert!(matches!(
                    &items[1],
                    Predicate::Compare { value, .. } if *value == json!(-1.5)
                ));
            }
            other => panic!("expected and, got {:?}", other),
        }
        assert!(matches!(
            parse("exists output.tables").expect("parse"),
            Predicate::Exists(_)
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse("   "), Err(PredicateError::Empty));
        assert!(matches!(
            parse("a > "),
            Err(PredicateError::Expected { .. })
        ));
        assert!(matches!(
            parse("a # 1"),
            Err(PredicateError::UnexpectedChar { ch: '#', .. })
        ));
        assert!(matches!(
            parse("a == \"open"),
            Err(PredicateError::UnterminatedString(_))
        ));
        assert!(matches!(
            parse("(a == 1"),
            Err(PredicateError::Expected { .. })
        ));
        assert!(matches!(parse("a == 1 b"), Err(PredicateError::Expected { .. })));
    }

    #[test]
    fn test_nesting_depth_is_bounded() {
        let nested = |depth: usize| format!("{}a > 1{}", "(".repeat(depth), ")".repeat(depth));
        assert!(parse(&nested(MAX_NESTING_DEPTH)).is_ok());

        let deep = "(".repeat(100_000);
        match parse(&deep) {
            Err(PredicateError::Expected { expected, offset, .. }) => {
                assert!(expected.contains("nesting"));
                assert_eq!(offset, MAX_NESTING_DEPTH);
            }
            other => panic!("expected nesting error, got {:?}", other),
        }

        let negations = format!("{}ready", "!".repeat(100_000));
        assert!(matches!(
            parse(&negations),
            Err(PredicateError::Expected { .. })
        ));
        let half = MAX_NESTING_DEPTH / 2;
        let mixed = format!("{}ready{}", "!(".repeat(half), ")".repeat(half));
        assert!(parse(&mixed).is_ok());
    }
}
