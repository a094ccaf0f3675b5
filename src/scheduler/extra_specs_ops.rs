//! Extra Spec Operators
//!
//! Matches a share type extra spec requirement against a pool capability.
//! A requirement is either a literal (exact string equality) or an
//! operator followed by operands:
//!
//! | operator | meaning |
//! |----------|---------|
//! | `=` `>=` | numeric greater-or-equal |
//! | `==` `!=` `<=` | numeric comparison |
//! | `s==` `s!=` `s<` `s<=` `s>` `s>=` | string comparison |
//! | `<in>` | capability contains the operand |
//! | `<is>` | boolean equality |
//! | `<or>` | capability equals any operand: `<or> a <or> b` |
//!
//! Anything else, including `>` and `<`, is compared literally against the
//! whole requirement string.

use crate::domain::share_type::parse_bool_spec;

/// Whether `capability` satisfies `requirement`
pub fn matches(capability: Option<&str>, requirement: &str) -> bool {
    let mut words = requirement.split_whitespace();
    let op = match words.next() {
        Some(op) if is_operator(op) => op,
        _ => return capability == Some(requirement),
    };
    let value = match capability {
        Some(value) => value,
        None => return false,
    };

    if op == "<or>" {
        return or_operands(requirement).any(|operand| operand == value);
    }

    let operand = match words.next() {
        Some(operand) => operand,
        None => return false,
    };

    match op {
        "<in>" => value.contains(operand),
        "<is>" => {
            parse_bool_spec(value).unwrap_or(false) == parse_bool_spec(operand).unwrap_or(false)
        }
        "s==" => value == operand,
        "s!=" => value != operand,
        "s<" => value < operand,
        "s<=" => value <= operand,
        "s>" => value > operand,
        "s>=" => value >= operand,
        _ => numeric(op, value, operand).unwrap_or(false),
    }
}

fn is_operator(word: &str) -> bool {
    matches!(
        word,
        "=" | "==" | "!=" | ">=" | "<=" | "<in>" | "<is>" | "<or>" | "s==" | "s!=" | "s<"
            | "s<=" | "s>" | "s>="
    )
}

/// Operands of `<or> a <or> b ...`
fn or_operands(requirement: &str) -> impl Iterator<Item = &str> {
    requirement
        .split_whitespace()
        .skip(1)
        .step_by(2)
}

fn numeric(op: &str, value: &str, operand: &str) -> Option<bool> {
    let value: f64 = value.trim().parse().ok()?;
    let operand: f64 = operand.trim().parse().ok()?;
    Some(match op {
        "=" | ">=" => value >= operand,
        "==" => value == operand,
        "!=" => value != operand,
        "<=" => value <= operand,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_match() {
        assert!(matches(Some("True"), "True"));
        assert!(!matches(Some("true"), "True"));
        assert!(!matches(None, "True"));
    }

    #[test]
    fn test_numeric_operators() {
        assert!(matches(Some("10"), "= 5"));
        assert!(matches(Some("5"), "= 5"));
        assert!(!matches(Some("4"), ">= 5"));
        assert!(matches(Some("5.0"), "== 5"));
        assert!(matches(Some("4"), "!= 5"));
        assert!(matches(Some("4"), "<= 5"));
        assert!(!matches(Some("abc"), "== 5"));
    }

    #[test]
    fn test_unknown_operator_is_literal() {
        assert!(!matches(Some("3"), "> 2"));
        assert!(matches(Some("> 2"), "> 2"));
    }

    #[test]
    fn test_string_operators() {
        assert!(matches(Some("abc"), "s== abc"));
        assert!(matches(Some("abd"), "s!= abc"));
        assert!(matches(Some("abc"), "s< abd"));
        assert!(matches(Some("abd"), "s>= abc"));
        assert!(!matches(Some("abc"), "s> abc"));
    }

    #[test]
    fn test_in_is_or() {
        assert!(matches(Some("NFS_CIFS"), "<in> CIFS"));
        assert!(!matches(Some("NFS"), "<in> CIFS"));
        assert!(matches(Some("True"), "<is> true"));
        assert!(matches(Some("False"), "<is> False"));
        assert!(!matches(Some("False"), "<is> True"));
        assert!(matches(Some("gold"), "<or> silver <or> gold"));
        assert!(!matches(Some("bronze"), "<or> silver <or> gold"));
    }

    #[test]
    fn test_operator_without_operand_fails() {
        assert!(!matches(Some("1"), "=="));
        assert!(!matches(None, "<in> x"));
    }
}
