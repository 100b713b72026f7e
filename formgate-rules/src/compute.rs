use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// A field definition as the authoring layer sees it: a code plus an
/// optional compute expression. Only the expression matters here; the rest
/// of the definition lives with the form-builder collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldDefinition {
    pub code: String,
    #[serde(default)]
    pub expression: Option<String>,
}

/// Configuration-time validation of computed fields: rejects an expression
/// that references its own field code, directly or through a chain of other
/// computed fields. Runs before any rule using these fields can be
/// evaluated, so a cycle can never reach the executor.
pub fn validate_field_definitions(definitions: &[FieldDefinition]) -> Result<(), EngineError> {
    let graph: BTreeMap<&str, Vec<String>> = definitions
        .iter()
        .filter_map(|def| {
            def.expression
                .as_deref()
                .map(|expr| (def.code.as_str(), references(expr)))
        })
        .collect();

    for &start in graph.keys() {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        if let Some(chain) = find_cycle(&graph, start, &mut path, &mut visited) {
            return Err(EngineError::FieldCircularReference {
                field_code: start.to_string(),
                chain,
            });
        }
    }
    Ok(())
}

fn find_cycle(
    graph: &BTreeMap<&str, Vec<String>>,
    node: &str,
    path: &mut Vec<String>,
    visited: &mut HashSet<String>,
) -> Option<String> {
    if path.iter().any(|seen| seen == node) {
        let mut chain = path.clone();
        chain.push(node.to_string());
        return Some(chain.join(" -> "));
    }
    if !visited.insert(node.to_string()) {
        return None;
    }

    path.push(node.to_string());
    if let Some(refs) = graph.get(node) {
        for next in refs {
            // References to non-computed fields terminate the chain.
            if graph.contains_key(next.as_str()) {
                if let Some(chain) = find_cycle(graph, next, path, visited) {
                    return Some(chain);
                }
            }
        }
    }
    path.pop();
    None
}

/// Field codes referenced by an expression, in first-occurrence order.
pub fn references(expression: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut refs = Vec::new();
    for token in tokenize(expression).unwrap_or_default() {
        if let Token::Field(code) = token {
            if seen.insert(code.clone()) {
                refs.push(code);
            }
        }
    }
    refs
}

/// Evaluates an arithmetic expression over field references.
///
/// Supported: numbers, `+ - * /`, parentheses, unary minus, and field
/// references written either as bare identifiers (`AMOUNT`) or in braces
/// (`{UNIT_PRICE}`). A reference to a field without a numeric value is an
/// evaluation error.
pub fn evaluate(
    expression: &str,
    lookup: &dyn Fn(&str) -> Option<f64>,
) -> Result<f64, String> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        tokens: &tokens,
        position: 0,
        lookup,
    };
    let result = parser.expression()?;
    if parser.position != tokens.len() {
        return Err(format!("unexpected trailing input in `{expression}`"));
    }
    if !result.is_finite() {
        return Err(format!("expression `{expression}` did not produce a finite number"));
    }
    Ok(result)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Field(String),
    Plus,
    Minus,
    Star,
    Slash,
    Open,
    Close,
}

fn tokenize(expression: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = expression.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            ' ' | '\t' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '{' => {
                chars.next();
                let mut code = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(inner) => code.push(inner),
                        None => return Err("unterminated `{` field reference".to_string()),
                    }
                }
                let code = code.trim().to_string();
                if code.is_empty() {
                    return Err("empty `{}` field reference".to_string());
                }
                tokens.push(Token::Field(code));
            }
            '0'..='9' | '.' => {
                let mut literal = String::new();
                while let Some(&digit) = chars.peek() {
                    if digit.is_ascii_digit() || digit == '.' {
                        literal.push(digit);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number `{literal}`"))?;
                tokens.push(Token::Number(number));
            }
            letter if letter.is_ascii_alphabetic() || letter == '_' => {
                let mut code = String::new();
                while let Some(&part) = chars.peek() {
                    if part.is_ascii_alphanumeric() || part == '_' {
                        code.push(part);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Field(code));
            }
            other => return Err(format!("unexpected character `{other}` in expression")),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    position: usize,
    lookup: &'a dyn Fn(&str) -> Option<f64>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.position);
        self.position += 1;
        token
    }

    fn expression(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Plus => {
                    self.advance();
                    value += self.term()?;
                }
                Token::Minus => {
                    self.advance();
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.factor()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Star => {
                    self.advance();
                    value *= self.factor()?;
                }
                Token::Slash => {
                    self.advance();
                    let divisor = self.factor()?;
                    value /= divisor;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn factor(&mut self) -> Result<f64, String> {
        match self.advance() {
            Some(Token::Number(value)) => Ok(*value),
            Some(Token::Field(code)) => (self.lookup)(code)
                .ok_or_else(|| format!("field `{code}` has no numeric value")),
            Some(Token::Minus) => Ok(-self.factor()?),
            Some(Token::Open) => {
                let value = self.expression()?;
                match self.advance() {
                    Some(Token::Close) => Ok(value),
                    _ => Err("missing closing parenthesis".to_string()),
                }
            }
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(values: &'a [(&'a str, f64)]) -> impl Fn(&str) -> Option<f64> + 'a {
        move |code| {
            values
                .iter()
                .find(|(name, _)| *name == code)
                .map(|(_, value)| *value)
        }
    }

    #[test]
    fn evaluates_arithmetic_with_field_references() {
        let values = [("UNIT_PRICE", 12.5), ("QUANTITY", 4.0)];
        let result = evaluate("{UNIT_PRICE} * QUANTITY + 10", &lookup(&values)).unwrap();
        assert_eq!(result, 60.0);
    }

    #[test]
    fn respects_parentheses_and_unary_minus() {
        let values = [("A", 2.0), ("B", 3.0)];
        assert_eq!(evaluate("-(A + B) * 2", &lookup(&values)).unwrap(), -10.0);
    }

    #[test]
    fn missing_field_value_is_an_error() {
        let err = evaluate("AMOUNT * 2", &lookup(&[])).unwrap_err();
        assert!(err.contains("AMOUNT"), "error: {err}");
    }

    #[test]
    fn division_by_zero_is_not_a_finite_result() {
        let err = evaluate("1 / 0", &lookup(&[])).unwrap_err();
        assert!(err.contains("finite"), "error: {err}");
    }

    #[test]
    fn extracts_references_in_order_without_duplicates() {
        assert_eq!(
            references("{NET} * VAT_RATE + NET"),
            vec!["NET".to_string(), "VAT_RATE".to_string()]
        );
    }

    #[test]
    fn rejects_direct_self_reference() {
        let defs = vec![FieldDefinition {
            code: "TOTAL".into(),
            expression: Some("TOTAL + 1".into()),
        }];
        match validate_field_definitions(&defs) {
            Err(EngineError::FieldCircularReference { field_code, chain }) => {
                assert_eq!(field_code, "TOTAL");
                assert_eq!(chain, "TOTAL -> TOTAL");
            }
            other => panic!("expected circular reference error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_transitive_cycle() {
        let defs = vec![
            FieldDefinition {
                code: "A".into(),
                expression: Some("B + 1".into()),
            },
            FieldDefinition {
                code: "B".into(),
                expression: Some("C * 2".into()),
            },
            FieldDefinition {
                code: "C".into(),
                expression: Some("A - 1".into()),
            },
        ];
        assert!(matches!(
            validate_field_definitions(&defs),
            Err(EngineError::FieldCircularReference { .. })
        ));
    }

    #[test]
    fn accepts_acyclic_chains_through_plain_fields() {
        let defs = vec![
            FieldDefinition {
                code: "GROSS".into(),
                expression: Some("NET * 1.21".into()),
            },
            FieldDefinition {
                code: "NET".into(),
                expression: Some("UNIT_PRICE * QUANTITY".into()),
            },
            FieldDefinition {
                code: "UNIT_PRICE".into(),
                expression: None,
            },
        ];
        assert!(validate_field_definitions(&defs).is_ok());
    }
}
