//! Deterministic test identity generation
//!
//! A test's fingerprint is the lowercase hex SHA-256 of its fully qualified
//! name, followed by `(<canonical parameters>)` when the test is
//! parameterized. Canonical parameter text never depends on locale, platform
//! or process, so the same test produces the same fingerprint on every run.
//!
//! The parentheses are part of the hashed text. They keep `Suite.Case` called
//! with `1` apart from an unparameterized `Suite.Case1`, so a parameterized
//! fingerprint is not the hash of name and parameters simply concatenated.
//!
//! ## Canonical parameter rendering
//!
//! | Value | Rendering |
//! |-------|-----------|
//! | integers | base-10 |
//! | floats | shortest round-trip, `NaN` / `Infinity` / `-Infinity` |
//! | booleans | `true` / `false` |
//! | date/time | `2024-05-01T12:00:00.000000Z` (UTC, six fractional digits) |
//! | UUID | dashed lowercase |
//! | sequences | `[a,b,c]`, recursively |
//! | null | `null` |
//! | text | verbatim |

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{content_hash, SourceLocation, TestIdentity};

/// One invocation argument of a parameterized test
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    DateTime(DateTime<Utc>),
    Uuid(Uuid),
    Seq(Vec<ParamValue>),
}

impl ParamValue {
    /// Render this value in canonical form
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        self.write_canonical(&mut out);
        out
    }

    fn write_canonical(&self, out: &mut String) {
        match self {
            ParamValue::Null => out.push_str("null"),
            ParamValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            ParamValue::Int(i) => out.push_str(&i.to_string()),
            ParamValue::UInt(u) => out.push_str(&u.to_string()),
            ParamValue::Float(f) => out.push_str(&canonical_float(*f)),
            ParamValue::Text(s) => out.push_str(s),
            ParamValue::DateTime(dt) => {
                out.push_str(&dt.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            ParamValue::Uuid(u) => out.push_str(&u.hyphenated().to_string()),
            ParamValue::Seq(items) => {
                out.push('[');
                write_joined(items, out);
                out.push(']');
            }
        }
    }
}

fn write_joined(items: &[ParamValue], out: &mut String) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        item.write_canonical(out);
    }
}

/// Rust's float `Display` is already the shortest round-trip text and never
/// locale-dependent; only non-finite values need fixed spellings.
fn canonical_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f == f64::INFINITY {
        "Infinity".to_string()
    } else if f == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        f.to_string()
    }
}

/// Canonical parameter string; `None` when the test is not parameterized
pub fn canonical_parameters(parameters: &[ParamValue]) -> Option<String> {
    if parameters.is_empty() {
        return None;
    }
    let mut out = String::new();
    write_joined(parameters, &mut out);
    Some(out)
}

/// Generate the identity of a test.
///
/// `qualified_name` must be `namespace.Class.Method` (namespace optional).
/// Fails with `InvalidArgument` when either name is empty, when the qualified
/// name has fewer than two segments, or when a segment is empty.
pub fn generate(
    qualified_name: &str,
    module_name: &str,
    parameters: &[ParamValue],
    display_name: Option<&str>,
    source: Option<SourceLocation>,
) -> Result<TestIdentity> {
    let qualified_name = qualified_name.trim();
    let module_name = module_name.trim();

    if qualified_name.is_empty() {
        return Err(Error::InvalidArgument(
            "qualified name must not be empty".to_string(),
        ));
    }
    if module_name.is_empty() {
        return Err(Error::InvalidArgument(
            "module name must not be empty".to_string(),
        ));
    }

    let (namespace, class_name, method_name) = split_qualified_name(qualified_name)?;

    let params = canonical_parameters(parameters);
    let fingerprint_input = match &params {
        Some(p) => format!("{}({})", qualified_name, p),
        None => qualified_name.to_string(),
    };

    let display_name = match (display_name, &params) {
        (Some(name), _) if !name.trim().is_empty() => name.to_string(),
        (_, Some(p)) => format!("{}({})", method_name, p),
        (_, None) => method_name.to_string(),
    };

    Ok(TestIdentity {
        test_id: content_hash(&fingerprint_input),
        fully_qualified_name: qualified_name.to_string(),
        namespace: namespace.to_string(),
        class_name: class_name.to_string(),
        method_name: method_name.to_string(),
        module_name: module_name.to_string(),
        parameter_hash: params.as_deref().map(content_hash),
        display_name,
        source,
    })
}

/// Split `a.b.Class.Method` into (`a.b`, `Class`, `Method`)
fn split_qualified_name(qualified_name: &str) -> Result<(&str, &str, &str)> {
    let segments: Vec<&str> = qualified_name.split('.').collect();
    if segments.len() < 2 {
        return Err(Error::InvalidArgument(format!(
            "qualified name '{}' needs at least Class.Method",
            qualified_name
        )));
    }
    if segments.iter().any(|s| s.trim().is_empty()) {
        return Err(Error::InvalidArgument(format!(
            "qualified name '{}' contains an empty segment",
            qualified_name
        )));
    }

    let method_name = segments[segments.len() - 1];
    let class_name = segments[segments.len() - 2];
    let namespace_len = qualified_name.len() - method_name.len() - class_name.len() - 1;
    let namespace = qualified_name[..namespace_len].trim_end_matches('.');

    Ok((namespace, class_name, method_name))
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v.into())
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::UInt(v.into())
    }
}

impl From<u64> for ParamValue {
    fn from(v: u64) -> Self {
        ParamValue::UInt(v)
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Float(v.into())
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

impl From<DateTime<Utc>> for ParamValue {
    fn from(v: DateTime<Utc>) -> Self {
        ParamValue::DateTime(v)
    }
}

impl From<Uuid> for ParamValue {
    fn from(v: Uuid) -> Self {
        ParamValue::Uuid(v)
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ParamValue::Null)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(v: Vec<T>) -> Self {
        ParamValue::Seq(v.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn id(name: &str, params: &[ParamValue]) -> String {
        generate(name, "Acme.Tests", params, None, None)
            .unwrap()
            .test_id()
            .to_string()
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let params = vec![ParamValue::Int(1), ParamValue::from("a")];
        assert_eq!(
            id("Acme.Tests.MathTests.Add", &params),
            id("Acme.Tests.MathTests.Add", &params)
        );
    }

    #[test]
    fn test_fingerprint_shape() {
        let fingerprint = id("Acme.Tests.MathTests.Add", &[]);
        assert_eq!(fingerprint.len(), 64);
        assert!(fingerprint
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_unparameterized_fingerprint_is_hash_of_name() {
        let fingerprint = id("Acme.Tests.MathTests.Add", &[]);
        assert_eq!(fingerprint, content_hash("Acme.Tests.MathTests.Add"));
    }

    #[test]
    fn test_parameters_are_delimited_in_fingerprint() {
        let parameterized = id("Acme.Tests.MathTests.Add", &[ParamValue::Int(1)]);
        assert_eq!(parameterized, content_hash("Acme.Tests.MathTests.Add(1)"));
        assert_ne!(parameterized, id("Acme.Tests.MathTests.Add1", &[]));
    }

    #[test]
    fn test_parameter_changes_fingerprint() {
        let base = id("Acme.Tests.MathTests.Add", &[ParamValue::Int(1), ParamValue::Int(2)]);
        let changed = id("Acme.Tests.MathTests.Add", &[ParamValue::Int(1), ParamValue::Int(3)]);
        let reordered = id("Acme.Tests.MathTests.Add", &[ParamValue::Int(2), ParamValue::Int(1)]);
        let bare = id("Acme.Tests.MathTests.Add", &[]);
        assert_ne!(base, changed);
        assert_ne!(base, reordered);
        assert_ne!(base, bare);
    }

    #[test]
    fn test_canonical_rendering() {
        let when = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let uuid = Uuid::parse_str("6F9619FF-8B86-D011-B42D-00CF4FC964FF").unwrap();
        let params = vec![
            ParamValue::Int(-42),
            ParamValue::Float(0.1),
            ParamValue::Float(2.0),
            ParamValue::Bool(true),
            ParamValue::DateTime(when),
            ParamValue::Uuid(uuid),
            ParamValue::Null,
            ParamValue::Seq(vec![ParamValue::Int(1), ParamValue::Seq(vec![])]),
            ParamValue::from("x y"),
        ];
        assert_eq!(
            canonical_parameters(&params).unwrap(),
            "-42,0.1,2,true,2024-05-01T12:30:00.000000Z,\
             6f9619ff-8b86-d011-b42d-00cf4fc964ff,null,[1,[]],x y"
        );
    }

    #[test]
    fn test_non_finite_floats() {
        assert_eq!(ParamValue::Float(f64::NAN).canonical(), "NaN");
        assert_eq!(ParamValue::Float(f64::INFINITY).canonical(), "Infinity");
        assert_eq!(ParamValue::Float(f64::NEG_INFINITY).canonical(), "-Infinity");
    }

    #[test]
    fn test_empty_parameters_have_no_hash() {
        let identity = generate("Acme.MathTests.Add", "Acme", &[], None, None).unwrap();
        assert!(identity.parameter_hash().is_none());
        assert_eq!(identity.display_name(), "Add");
    }

    #[test]
    fn test_name_split() {
        let identity = generate(
            "Acme.Tests.Unit.MathTests.Add",
            "Acme.Tests",
            &[ParamValue::Int(1), ParamValue::Int(2)],
            None,
            Some(SourceLocation {
                file: "MathTests.cs".to_string(),
                line: Some(12),
            }),
        )
        .unwrap();
        assert_eq!(identity.namespace(), "Acme.Tests.Unit");
        assert_eq!(identity.class_name(), "MathTests");
        assert_eq!(identity.method_name(), "Add");
        assert_eq!(identity.display_name(), "Add(1,2)");
        assert_eq!(identity.parameter_hash().map(str::len), Some(64));
        assert_eq!(identity.source().and_then(|s| s.line), Some(12));

        let two_segments = generate("MathTests.Add", "Acme", &[], None, None).unwrap();
        assert_eq!(two_segments.namespace(), "");
        assert_eq!(two_segments.class_name(), "MathTests");
    }

    #[test]
    fn test_explicit_display_name_wins() {
        let identity = generate(
            "Acme.MathTests.Add",
            "Acme",
            &[ParamValue::Int(1)],
            Some("adds one"),
            None,
        )
        .unwrap();
        assert_eq!(identity.display_name(), "adds one");
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "Add", "Acme..Add", ".Add", "Acme.MathTests."] {
            let result = generate(name, "Acme", &[], None, None);
            assert!(
                matches!(result, Err(Error::InvalidArgument(_))),
                "expected InvalidArgument for {:?}",
                name
            );
        }
        assert!(matches!(
            generate("Acme.MathTests.Add", " ", &[], None, None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_conversions() {
        assert_eq!(ParamValue::from(Some(3)), ParamValue::Int(3));
        assert_eq!(ParamValue::from(None::<i32>), ParamValue::Null);
        assert_eq!(ParamValue::from(vec![1, 2]).canonical(), "[1,2]");
        assert_eq!(ParamValue::from(1.5f32).canonical(), "1.5");
    }
}
