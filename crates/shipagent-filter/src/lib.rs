//! Filter Compiler (§4.5): validates a candidate WHERE fragment against a
//! source schema and signs it. The natural-language-to-SQL step itself is
//! someone else's problem (an external interpreter); this crate only ever
//! sees the SQL the interpreter proposed, a schema, and a source signature.
//!
//! Rejecting DDL, joins, subqueries on foreign tables, and non-allow-listed
//! functions closes a prompt-injection path: a compromised natural-language
//! layer cannot widen a query past what this validator will sign.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use shipagent_types::FilterSpec;
use sqlparser::ast::{BinaryOperator, Expr, Function, FunctionArguments, SetExpr, Statement, Value};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Number,
    Bool,
    Date,
}

#[derive(Debug, Clone)]
pub struct SchemaColumn {
    pub name: String,
    pub column_type: ColumnType,
}

/// Functions a compiled WHERE fragment is allowed to call. Anything else —
/// including anything that could reach the filesystem, network, or another
/// table — is rejected.
const ALLOWED_FUNCTIONS: &[&str] = &["upper", "lower", "trim", "cast", "coalesce"];

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("could not parse proposed filter as a single SQL expression: {0}")]
    Parse(String),
    #[error("filter must be a single boolean expression, not a statement of kind {0}")]
    NotAnExpression(String),
    #[error("column `{0}` is not present in the source schema")]
    UnknownColumn(String),
    #[error("comparison against column `{column}` (type {expected:?}) uses an incompatible literal type; cast explicitly")]
    IncompatibleType { column: String, expected: ColumnType },
    #[error("function `{0}` is not on the filter allow-list")]
    DisallowedFunction(String),
    #[error("subqueries are not permitted in a filter")]
    Subquery,
    #[error("HMAC signature does not verify")]
    BadSignature,
}

/// Parses and validates `where_sql` against `schema`. On success returns the
/// canonicalized, but *unsigned*, WHERE text — callers pass that to
/// [`sign`] to produce a [`FilterSpec`].
pub fn validate(where_sql: &str, schema: &[SchemaColumn]) -> Result<String, FilterError> {
    // Wrap the fragment in a full SELECT so sqlparser gives us a real AST to
    // walk instead of inventing our own WHERE-only grammar.
    let wrapped = format!("SELECT * FROM source WHERE {where_sql}");
    let dialect = GenericDialect {};
    let statements = Parser::parse_sql(&dialect, &wrapped)
        .map_err(|e| FilterError::Parse(e.to_string()))?;

    let statement = statements
        .into_iter()
        .next()
        .ok_or_else(|| FilterError::Parse("empty statement".into()))?;

    let Statement::Query(query) = &statement else {
        return Err(FilterError::NotAnExpression(format!("{statement:?}")));
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(FilterError::NotAnExpression("non-SELECT body".into()));
    };
    // A single-table FROM with no joins — anything else is a widening of
    // scope the filter is not allowed to request.
    if select.from.len() != 1 || !select.from[0].joins.is_empty() {
        return Err(FilterError::Subquery);
    }

    let Some(selection) = &select.selection else {
        return Err(FilterError::Parse("no WHERE clause produced".into()));
    };

    check_expr(selection, schema)?;

    Ok(canonicalize(&selection.to_string()))
}

fn check_expr(expr: &Expr, schema: &[SchemaColumn]) -> Result<(), FilterError> {
    match expr {
        Expr::BinaryOp { left, right, op } => {
            check_expr(left, schema)?;
            check_expr(right, schema)?;
            if is_comparison(op) {
                check_comparison_types(left, right, schema)?;
            }
            Ok(())
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => check_expr(expr, schema),
        Expr::InList { expr, list, .. } => {
            check_expr(expr, schema)?;
            for item in list {
                check_expr(item, schema)?;
            }
            Ok(())
        }
        Expr::InSubquery { .. } | Expr::Subquery(_) | Expr::Exists { .. } => {
            Err(FilterError::Subquery)
        }
        Expr::Identifier(ident) => {
            let name = ident.value.to_ascii_lowercase();
            if schema.iter().any(|c| c.name.eq_ignore_ascii_case(&name)) {
                Ok(())
            } else {
                Err(FilterError::UnknownColumn(name))
            }
        }
        Expr::Function(Function { name, args, .. }) => {
            let fname = name.to_string().to_ascii_lowercase();
            if !ALLOWED_FUNCTIONS.contains(&fname.as_str()) {
                return Err(FilterError::DisallowedFunction(fname));
            }
            if let FunctionArguments::List(list) = args {
                for arg in &list.args {
                    if let sqlparser::ast::FunctionArg::Unnamed(
                        sqlparser::ast::FunctionArgExpr::Expr(inner),
                    ) = arg
                    {
                        check_expr(inner, schema)?;
                    }
                }
            }
            Ok(())
        }
        Expr::Cast { expr, .. } => check_expr(expr, schema),
        // Literals, placeholders, etc. carry no column/function reference to
        // validate further.
        _ => Ok(()),
    }
}

fn is_comparison(op: &BinaryOperator) -> bool {
    matches!(
        op,
        BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq
    )
}

/// Column type a bare column reference resolves to, if `expr` is one.
fn column_type_of<'a>(expr: &Expr, schema: &'a [SchemaColumn]) -> Option<&'a ColumnType> {
    let Expr::Identifier(ident) = expr else {
        return None;
    };
    schema
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(&ident.value))
        .map(|c| &c.column_type)
}

/// Type of a bare literal, if `expr` is one. `None` for anything else
/// (columns, functions, casts) — those are not literals to type-check here.
fn literal_type_of(expr: &Expr) -> Option<ColumnType> {
    match expr {
        Expr::Value(value) => match &value.value {
            Value::SingleQuotedString(_) | Value::DoubleQuotedString(_) => {
                Some(ColumnType::String)
            }
            Value::Number(_, _) => Some(ColumnType::Number),
            Value::Boolean(_) => Some(ColumnType::Bool),
            _ => None,
        },
        Expr::UnaryOp { expr, .. } => literal_type_of(expr),
        _ => None,
    }
}

/// A column compared directly against an incompatible literal must fail —
/// widening that requires an explicit `CAST` is not allowed to happen
/// implicitly. `Expr::Cast` is never a literal per [`literal_type_of`], so an
/// explicit cast on either side always passes this check.
fn check_comparison_types(left: &Expr, right: &Expr, schema: &[SchemaColumn]) -> Result<(), FilterError> {
    for (column_side, literal_side) in [(left, right), (right, left)] {
        if let Some(column_type) = column_type_of(column_side, schema) {
            if let Some(literal_type) = literal_type_of(literal_side) {
                if literal_type != *column_type {
                    let Expr::Identifier(ident) = column_side else {
                        unreachable!("column_type_of only returns Some for Expr::Identifier");
                    };
                    return Err(FilterError::IncompatibleType {
                        column: ident.value.clone(),
                        expected: *column_type,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Whitespace-canonicalized form: sqlparser's `Display` already normalizes
/// spacing deterministically, so this is mostly a hook for future
/// clause-sorting; kept as a separate function so callers and tests have a
/// stable name for "the thing we sign".
fn canonicalize(rendered: &str) -> String {
    rendered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Produces the canonical bytes a signature is computed over: source
/// signature, WHERE text, and summary, in a fixed order and separated by a
/// byte that cannot appear in any of the three fields un-escaped.
fn signing_payload(source_signature: &str, where_sql: &str, summary: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(source_signature.as_bytes());
    buf.push(0);
    buf.extend_from_slice(where_sql.as_bytes());
    buf.push(0);
    buf.extend_from_slice(summary.as_bytes());
    buf
}

/// Signs a validated filter with the process secret, producing the
/// [`FilterSpec`] the Data Gateway will require on every query.
pub fn sign(
    source_signature: &str,
    where_sql: &str,
    summary: &str,
    secret: &[u8],
) -> FilterSpec {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(&signing_payload(source_signature, where_sql, summary));
    let signature = hex::encode(mac.finalize().into_bytes());
    FilterSpec {
        source_signature: source_signature.to_string(),
        where_sql: where_sql.to_string(),
        summary: summary.to_string(),
        signature,
    }
}

/// Verifies a [`FilterSpec`]'s signature against the process secret.
/// `Err` means reject — the caller MUST NOT use the filter.
pub fn verify(spec: &FilterSpec, secret: &[u8]) -> Result<(), FilterError> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(&signing_payload(
        &spec.source_signature,
        &spec.where_sql,
        &spec.summary,
    ));
    let expected = hex::decode(&spec.signature).map_err(|_| FilterError::BadSignature)?;
    mac.verify_slice(&expected).map_err(|_| FilterError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Vec<SchemaColumn> {
        vec![
            SchemaColumn { name: "state".into(), column_type: ColumnType::String },
            SchemaColumn { name: "weight_lbs".into(), column_type: ColumnType::Number },
        ]
    }

    #[test]
    fn accepts_simple_comparison() {
        let result = validate("state = 'CA'", &schema());
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_unknown_column() {
        let err = validate("ssn = '123'", &schema()).unwrap_err();
        assert!(matches!(err, FilterError::UnknownColumn(_)));
    }

    #[test]
    fn rejects_subquery() {
        let err = validate(
            "state IN (SELECT state FROM other_table)",
            &schema(),
        )
        .unwrap_err();
        assert!(matches!(err, FilterError::Subquery));
    }

    #[test]
    fn rejects_disallowed_function() {
        let err = validate("load_extension('x') = 1", &schema()).unwrap_err();
        assert!(matches!(err, FilterError::DisallowedFunction(_)));
    }

    #[test]
    fn allows_allow_listed_function() {
        let result = validate("upper(state) = 'CA'", &schema());
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_string_literal_against_numeric_column() {
        let err = validate("weight_lbs = 'heavy'", &schema()).unwrap_err();
        match err {
            FilterError::IncompatibleType { column, expected } => {
                assert_eq!(column, "weight_lbs");
                assert_eq!(expected, ColumnType::Number);
            }
            other => panic!("expected IncompatibleType, got {other:?}"),
        }
    }

    #[test]
    fn rejects_numeric_literal_against_string_column() {
        let err = validate("state = 5", &schema()).unwrap_err();
        assert!(matches!(err, FilterError::IncompatibleType { .. }));
    }

    #[test]
    fn explicit_cast_bypasses_the_type_check() {
        let result = validate("weight_lbs = CAST('5' AS numeric)", &schema());
        assert!(result.is_ok());
    }

    #[test]
    fn matching_literal_type_is_accepted() {
        let result = validate("weight_lbs > 10", &schema());
        assert!(result.is_ok());
    }

    #[test]
    fn canonical_where_text_snapshot() {
        let canonical = validate("state = 'CA' AND weight_lbs < 50", &schema()).unwrap();
        insta::assert_snapshot!(canonical, @"state = 'CA' AND weight_lbs < 50");
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let secret = b"01234567890123456789012345678901";
        let spec = sign("sig-abc", "state = 'CA'", "CA orders", secret);
        assert!(verify(&spec, secret).is_ok());
    }

    #[test]
    fn tampered_filter_fails_verification() {
        let secret = b"01234567890123456789012345678901";
        let mut spec = sign("sig-abc", "state = 'CA'", "CA orders", secret);
        spec.where_sql = "state = 'NY'".to_string();
        assert!(verify(&spec, secret).is_err());
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let spec = sign(
            "sig-abc",
            "state = 'CA'",
            "CA orders",
            b"01234567890123456789012345678901",
        );
        assert!(verify(&spec, b"10987654321098765432109876543210").is_err());
    }
}
