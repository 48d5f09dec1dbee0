//! `@Name` placeholder rewriting.
//!
//! Callers write `@Name` tokens regardless of backend. Each adapter renames
//! them to its driver's markers (`$1` for Postgres, `@P1` for SQL Server) in
//! first-appearance order; repeated names reuse the same marker, so a value
//! is bound once. Single-quoted literals and `@@` system variables are left
//! untouched.

use crate::error::{DbError, Result};
use crate::value::{Params, SqlValue};

/// SQL text with positional markers plus the values to bind, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    pub sql: String,
    pub values: Vec<SqlValue>,
}

/// Rewrite `@Name` tokens using `marker(n)` for the n-th distinct name (1-based).
pub fn rewrite_named<F>(sql: &str, params: &Params, marker: F) -> Result<Bound>
where
    F: Fn(usize) -> String,
{
    let mut out = String::with_capacity(sql.len());
    let mut order: Vec<&str> = Vec::new();
    let mut values = Vec::new();
    let mut chars = sql.char_indices().peekable();
    let mut in_literal = false;

    while let Some((i, c)) = chars.next() {
        if in_literal {
            out.push(c);
            if c == '\'' {
                in_literal = false;
            }
            continue;
        }
        match c {
            '\'' => {
                in_literal = true;
                out.push(c);
            }
            '@' => {
                // `@@ROWCOUNT` and friends pass through.
                if let Some((_, '@')) = chars.peek() {
                    out.push_str("@@");
                    chars.next();
                    while let Some(&(_, n)) = chars.peek() {
                        if !is_ident(n) {
                            break;
                        }
                        out.push(n);
                        chars.next();
                    }
                    continue;
                }
                let start = i + 1;
                let mut end = start;
                while let Some(&(j, n)) = chars.peek() {
                    let ok = if j == start {
                        n.is_ascii_alphabetic() || n == '_'
                    } else {
                        is_ident(n)
                    };
                    if !ok {
                        break;
                    }
                    end = j + n.len_utf8();
                    chars.next();
                }
                if end == start {
                    out.push('@');
                    continue;
                }
                let name = &sql[start..end];
                let position = match order.iter().position(|n| *n == name) {
                    Some(p) => p + 1,
                    None => {
                        let value = params.get(name).ok_or_else(|| DbError::Binding {
                            name: name.to_string(),
                        })?;
                        order.push(name);
                        values.push(value.clone());
                        order.len()
                    }
                };
                out.push_str(&marker(position));
            }
            _ => out.push(c),
        }
    }

    Ok(Bound { sql: out, values })
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Postgres positional markers: `$1`, `$2`, ...
pub fn to_postgres(sql: &str, params: &Params) -> Result<Bound> {
    rewrite_named(sql, params, |n| format!("${}", n))
}

/// SQL Server driver parameter names: `@P1`, `@P2`, ...
pub fn to_legacy(sql: &str, params: &Params) -> Result<Bound> {
    rewrite_named(sql, params, |n| format!("@P{}", n))
}
