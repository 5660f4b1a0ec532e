//! Declared-type translation between dialects.
//!
//! Matching is by substring over the upper-cased declared type, first rule
//! wins. Every output of a rule set maps to itself under the same rule set,
//! so translating an already translated type is stable.

use std::sync::LazyLock;

use regex::Regex;

use super::Dialect;

static LENGTH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\s*(\d+)").expect("length pattern is valid"));

static ARGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\([^)]*\)").expect("argument pattern is valid"));

/// Output of a matched rule.
#[derive(Clone, Copy)]
enum Target {
    Fixed(&'static str),
    /// `VARCHAR(n)`, keeping the source length when one is declared.
    Varchar,
}

type Rule = (&'static [&'static str], Target);

const SQLITE_RULES: &[Rule] = &[
    (&["BOOL"], Target::Fixed("INTEGER")),
    (&["POINT"], Target::Fixed("TEXT")),
    (&["DATE", "TIME", "INTERVAL"], Target::Fixed("TEXT")),
    (&["JSON", "UUID"], Target::Fixed("TEXT")),
    (&["INT", "SERIAL"], Target::Fixed("INTEGER")),
    (&["CHAR", "TEXT", "CLOB", "STRING"], Target::Fixed("TEXT")),
    (&["BLOB", "BYTEA", "BINARY"], Target::Fixed("BLOB")),
    (&["REAL", "FLOA", "DOUB"], Target::Fixed("REAL")),
    (&["NUMERIC", "DECIMAL", "MONEY"], Target::Fixed("NUMERIC")),
];

const POSTGRES_RULES: &[Rule] = &[
    (&["BIGINT", "INT8", "BIGSERIAL"], Target::Fixed("BIGINT")),
    (
        &["SMALLINT", "INT2", "TINYINT", "SMALLSERIAL"],
        Target::Fixed("SMALLINT"),
    ),
    (&["BOOL"], Target::Fixed("BOOLEAN")),
    (&["INTERVAL"], Target::Fixed("INTERVAL")),
    (&["POINT"], Target::Fixed("POINT")),
    (
        &["TIMESTAMPTZ", "TIMESTAMP WITH TIME ZONE"],
        Target::Fixed("TIMESTAMPTZ"),
    ),
    (&["TIMESTAMP", "DATETIME"], Target::Fixed("TIMESTAMP")),
    (&["DATE"], Target::Fixed("DATE")),
    (&["TIME"], Target::Fixed("TIME")),
    (&["JSON"], Target::Fixed("JSONB")),
    (&["UUID"], Target::Fixed("UUID")),
    (&["INT", "SERIAL"], Target::Fixed("INTEGER")),
    (&["CHAR"], Target::Varchar),
    (&["TEXT", "CLOB", "STRING"], Target::Fixed("TEXT")),
    (&["BLOB", "BYTEA", "BINARY"], Target::Fixed("BYTEA")),
    (&["REAL", "FLOAT4"], Target::Fixed("REAL")),
    (&["DOUBLE", "FLOAT"], Target::Fixed("DOUBLE PRECISION")),
    (&["NUMERIC", "DECIMAL", "MONEY"], Target::Fixed("NUMERIC")),
];

/// Translates a declared type into the nearest equivalent of `target`.
///
/// Total and deterministic: empty input and unmatched types become the
/// dialect's generic text type. Postgres arrays keep their `[]` suffix
/// around the translated element type; SQLite stores them as text.
#[must_use]
pub fn map_type(source_type: &str, target: Dialect) -> String {
    let normalized = source_type.trim().to_uppercase();
    if normalized.is_empty() {
        return target.generic_text_type().to_string();
    }

    if let Some(element) = normalized.strip_suffix("[]") {
        return match target {
            Dialect::Sqlite => target.generic_text_type().to_string(),
            Dialect::Postgres => format!("{}[]", map_type(element, target)),
        };
    }

    let rules = match target {
        Dialect::Sqlite => SQLITE_RULES,
        Dialect::Postgres => POSTGRES_RULES,
    };

    // Rules see the type without arguments so `timestamp(3) with time zone`
    // matches like `timestamp with time zone`.
    let bare = ARGS.replace_all(&normalized, " ");
    let bare = bare.split_whitespace().collect::<Vec<_>>().join(" ");
    let matched = rules
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| bare.contains(n)))
        .map(|(_, target)| *target);

    match matched {
        Some(Target::Fixed(name)) => name.to_string(),
        Some(Target::Varchar) => {
            let length = LENGTH
                .captures(&normalized)
                .and_then(|c| c.get(1))
                .map_or("255", |m| m.as_str());
            format!("VARCHAR({length})")
        }
        None => target.generic_text_type().to_string(),
    }
}

/// Canonical spelling of a declared type, for comparison only.
///
/// Drops length/precision arguments and folds common aliases. The alias
/// list is heuristic.
#[must_use]
pub fn normalize_type(declared: &str) -> String {
    let upper = declared.trim().to_uppercase();
    let stripped = ARGS.replace_all(&upper, "");
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    let canonical = match collapsed.as_str() {
        "" => "TEXT",
        "INT" | "INT4" => "INTEGER",
        "INT8" => "BIGINT",
        "INT2" => "SMALLINT",
        "BOOL" => "BOOLEAN",
        "FLOAT8" | "DOUBLE" | "FLOAT" => "DOUBLE PRECISION",
        "FLOAT4" => "REAL",
        "CHARACTER VARYING" => "VARCHAR",
        "DECIMAL" => "NUMERIC",
        "TIMESTAMP WITHOUT TIME ZONE" => "TIMESTAMP",
        "TIMESTAMP WITH TIME ZONE" => "TIMESTAMPTZ",
        "TIME WITHOUT TIME ZONE" => "TIME",
        other => other,
    };
    canonical.to_string()
}

/// Whether a source and a target column type agree once both are expressed
/// in the target's vocabulary.
#[must_use]
pub fn types_match(source_type: &str, target_type: &str, dialect: Dialect) -> bool {
    normalize_type(&map_type(source_type, dialect))
        == normalize_type(&map_type(target_type, dialect))
}
