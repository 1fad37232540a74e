//! User-defined columns and their display rules.
//!
//! A custom column arrives typed by a `datatype` string plus a `display`
//! object of datatype-specific hints. The hints are interpreted lazily at
//! format time: a column with an unparseable display object still yields
//! its plain value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CalibreTime;

/// Data type of a custom column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnDatatype {
    /// Whole number.
    Int,
    /// Floating point number.
    Float,
    /// Yes/no flag.
    Bool,
    /// Short text, possibly multiple values.
    Text,
    /// Long-form text.
    Comments,
    /// Series name with an index in `#extra#`.
    Series,
    /// Star rating from 0 to 10.
    Rating,
    /// Value from a fixed set.
    Enumeration,
    /// Point in time, transmitted as RFC3339.
    Datetime,
    /// Value computed from a template.
    Composite,
    /// Anything this library does not know; formats as the empty string.
    #[default]
    #[serde(other)]
    Unknown,
}

/// One custom column attached to a book.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomColumn {
    /// The column value, typed by `datatype`.
    #[serde(rename = "#value#")]
    pub value: Value,

    /// Companion value; the series index for `series` columns.
    #[serde(rename = "#extra#")]
    pub extra: Value,

    /// Data type of the column.
    pub datatype: ColumnDatatype,

    /// Lookup label, e.g. `#read`.
    pub label: String,

    /// Display name of the column.
    pub name: String,

    /// Column number within the library database.
    pub colnum: Option<i64>,

    /// Record index of the column.
    pub rec_index: Option<i64>,

    /// Category sort key.
    pub category_sort: Option<String>,

    /// Whether the column is a colon-separated-pairs column.
    pub is_csp: bool,

    /// Kind of field (`field`, `category`, ...).
    pub kind: Option<String>,

    /// Whether the column is user defined.
    pub is_custom: bool,

    /// Whether the column may be edited.
    pub is_editable: bool,

    /// Backing column name.
    pub column: Option<String>,

    /// Separator for multi-valued text columns; `None` for single values.
    pub is_multiple: Option<String>,

    /// Separator table for multi-valued text columns.
    pub is_multiple2: IsMultiple2,

    /// Search terms that resolve to this column.
    pub search_terms: Vec<String>,

    /// Whether the column forms a browsing category.
    pub is_category: bool,

    /// Backing table name.
    pub table: Option<String>,

    /// Datatype-specific display hints, kept raw until format time.
    pub display: Value,

    /// Linked column name, if any.
    pub link_column: Option<String>,
}

/// Separators used when a text column holds several values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IsMultiple2 {
    /// Separator between the UI and the value list.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ui_to_list: String,

    /// Separator between the cache and the value list.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cache_to_list: String,

    /// Separator between the value list and the UI.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub list_to_ui: String,
}

/// Display hints for `int` and `float` columns.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NumberDisplay {
    /// Column description.
    pub description: String,
    /// Python-style format string for the value.
    pub number_format: Option<String>,
}

/// Display hints for `datetime` columns.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DateDisplay {
    /// Column description.
    pub description: String,
    /// Qt-style date pattern, or `iso` for RFC3339.
    pub date_format: Option<String>,
}

/// Display hints for `rating` columns.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RatingDisplay {
    /// Column description.
    pub description: String,
    /// Whether odd ratings render a half star.
    pub allow_half_stars: bool,
}

/// Display hints for `text` columns.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TextDisplay {
    /// Column description.
    pub description: String,
    /// Value used when the column is empty.
    pub default_value: String,
    /// Decoration flags.
    pub use_decorations: i64,
    /// Whether values are people's names.
    pub is_names: bool,
}

/// Display hints for `comments` columns.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CommentsDisplay {
    /// Value used when the column is empty.
    pub default_value: String,
    /// `html`, `markdown` or plain interpretation.
    pub interpret_as: String,
    /// Column description.
    pub description: String,
    /// Where the heading renders.
    pub heading_position: String,
}

/// Display hints for `enumeration` columns.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EnumDisplay {
    /// Permitted values.
    pub enum_values: Vec<String>,
    /// Colors matching `enum_values`.
    pub enum_colors: Vec<String>,
    /// Column description.
    pub description: String,
    /// Decoration flags.
    pub use_decorations: i64,
}

/// Display hints for `composite` columns.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CompositeDisplay {
    /// Whether the computed value contains HTML.
    pub contains_html: bool,
    /// Whether the column forms a browsing category.
    pub make_category: bool,
    /// The template producing the value.
    pub composite_template: String,
    /// Sort key template.
    pub composite_sort: String,
    /// Column description.
    pub description: String,
}

impl CustomColumn {
    fn display_as<T: Default + for<'de> Deserialize<'de>>(&self) -> T {
        serde_json::from_value(self.display.clone()).unwrap_or_default()
    }

    fn joined_text(&self, separator: &str) -> String {
        match &self.value {
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(separator),
            Value::String(single) => single.clone(),
            _ => String::new(),
        }
    }

    /// Unformatted string form of the value.
    pub fn raw_string(&self) -> String {
        if self.value.is_null() {
            return String::new();
        }
        match self.datatype {
            ColumnDatatype::Text => {
                if self.is_multiple.is_some() {
                    self.joined_text(",")
                } else {
                    self.value.as_str().unwrap_or_default().to_owned()
                }
            }
            ColumnDatatype::Comments
            | ColumnDatatype::Series
            | ColumnDatatype::Enumeration
            | ColumnDatatype::Datetime
            | ColumnDatatype::Composite => self.value.as_str().unwrap_or_default().to_owned(),
            ColumnDatatype::Float => match self.value.as_f64() {
                Some(number) => number.to_string(),
                None => String::new(),
            },
            ColumnDatatype::Int | ColumnDatatype::Rating => match self.value.as_f64() {
                Some(number) => (number as i64).to_string(),
                None => String::new(),
            },
            ColumnDatatype::Bool => match self.value.as_bool() {
                Some(flag) => flag.to_string(),
                None => String::new(),
            },
            ColumnDatatype::Unknown => String::new(),
        }
    }

    /// Display-aware string form, honoring the column's display hints.
    pub fn contextual_string(&self) -> String {
        if self.value.is_null() {
            return String::new();
        }
        match self.datatype {
            ColumnDatatype::Bool
            | ColumnDatatype::Comments
            | ColumnDatatype::Enumeration
            | ColumnDatatype::Composite => self.raw_string(),
            ColumnDatatype::Text => {
                if self.is_multiple.is_some() {
                    self.joined_text(", ")
                } else {
                    self.raw_string()
                }
            }
            ColumnDatatype::Series => {
                let name = self.raw_string();
                match self.extra.as_f64() {
                    Some(index) => format!("{name} [{index}]"),
                    None => name,
                }
            }
            ColumnDatatype::Int => {
                let display: NumberDisplay = self.display_as();
                match self.value.as_f64() {
                    Some(number) => format_int(display.number_format.as_deref(), number as i64),
                    None => String::new(),
                }
            }
            ColumnDatatype::Float => {
                let display: NumberDisplay = self.display_as();
                match self.value.as_f64() {
                    Some(number) => format_float(display.number_format.as_deref(), number),
                    None => String::new(),
                }
            }
            ColumnDatatype::Rating => {
                let display: RatingDisplay = self.display_as();
                match self.value.as_f64() {
                    Some(rating) => format_rating(rating as i64, display.allow_half_stars),
                    None => String::new(),
                }
            }
            ColumnDatatype::Datetime => {
                let raw = self.value.as_str().unwrap_or_default();
                let Some(datetime) = CalibreTime::parse(raw).and_then(|t| t.as_datetime()) else {
                    return raw.to_owned();
                };
                let display: DateDisplay = self.display_as();
                let utc = datetime.with_timezone(&Utc);
                match display.date_format.as_deref() {
                    Some(pattern) => format_datetime(&utc, pattern),
                    None => format_datetime(&utc, "iso"),
                }
            }
            ColumnDatatype::Unknown => String::new(),
        }
    }
}

/// Render a 0–10 rating as stars. Odd values add a half star when
/// allowed; anything above 10 clamps to five stars.
pub fn format_rating(rating: i64, allow_half: bool) -> String {
    if rating > 10 {
        return "★".repeat(5);
    }
    let rating = rating.max(0);
    let mut stars = "★".repeat((rating / 2) as usize);
    if rating % 2 > 0 && allow_half {
        // The '1/2' codepoint; half-star glyphs only arrived in Unicode 11.
        stars.push('½');
    }
    stars
}

/// Format a datetime with a Qt-style pattern. The literal `iso` means
/// RFC3339.
pub fn format_datetime(datetime: &DateTime<Utc>, pattern: &str) -> String {
    if pattern == "iso" {
        return datetime.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    }
    datetime.format(&qt_to_strftime(pattern)).to_string()
}

/// Translate a Qt date pattern into a chrono strftime string.
///
/// `hh`/`h` switch to 12-hour form when the pattern contains `ap`/`AP`.
/// Characters outside the pattern alphabet pass through as literals.
fn qt_to_strftime(pattern: &str) -> String {
    let twelve_hour = pattern.contains("ap") || pattern.contains("AP");
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut index = 0;
    while index < pattern.len() {
        let rest = &pattern[index..];
        let (token, consumed) = if rest.starts_with("dddd") {
            ("%A", 4)
        } else if rest.starts_with("ddd") {
            ("%a", 3)
        } else if rest.starts_with("dd") {
            ("%d", 2)
        } else if rest.starts_with('d') {
            ("%-d", 1)
        } else if rest.starts_with("MMMM") {
            ("%B", 4)
        } else if rest.starts_with("MMM") {
            ("%b", 3)
        } else if rest.starts_with("MM") {
            ("%m", 2)
        } else if rest.starts_with('M') {
            ("%-m", 1)
        } else if rest.starts_with("yyyy") {
            ("%Y", 4)
        } else if rest.starts_with("yy") {
            ("%y", 2)
        } else if rest.starts_with("hh") {
            (if twelve_hour { "%I" } else { "%H" }, 2)
        } else if rest.starts_with('h') {
            (if twelve_hour { "%-I" } else { "%-H" }, 1)
        } else if rest.starts_with("mm") {
            ("%M", 2)
        } else if rest.starts_with('m') {
            ("%-M", 1)
        } else if rest.starts_with("ss") {
            ("%S", 2)
        } else if rest.starts_with('s') {
            ("%-S", 1)
        } else if rest.starts_with("ap") {
            ("%P", 2)
        } else if rest.starts_with("AP") {
            ("%p", 2)
        } else {
            match rest.chars().next() {
                Some('%') => {
                    out.push_str("%%");
                    index += 1;
                }
                Some(literal) => {
                    out.push(literal);
                    index += literal.len_utf8();
                }
                None => break,
            }
            continue;
        };
        out.push_str(token);
        index += consumed;
    }
    out
}

/// Format an integer through an optional Python-style format string.
pub(crate) fn format_int(format: Option<&str>, value: i64) -> String {
    format
        .and_then(|f| python_format(f, Number::Int(value)))
        .unwrap_or_else(|| value.to_string())
}

/// Format a float through an optional Python-style format string.
pub(crate) fn format_float(format: Option<&str>, value: f64) -> String {
    format
        .and_then(|f| python_format(f, Number::Float(value)))
        .unwrap_or_else(|| value.to_string())
}

enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn as_f64(&self) -> f64 {
        match *self {
            Number::Int(v) => v as f64,
            Number::Float(v) => v,
        }
    }
}

/// Minimal Python format-string support: one `{...}` replacement field
/// with an optional `d`, `f` or `.Nf` spec, surrounded by literal text.
/// Anything richer returns `None` and the caller falls back to plain
/// formatting.
fn python_format(format: &str, value: Number) -> Option<String> {
    let open = format.find('{')?;
    let close = open + format[open..].find('}')?;
    let field = &format[open + 1..close];
    let spec = match field.split_once(':') {
        Some((_, spec)) => spec,
        None => "",
    };
    let rendered = render_spec(spec, &value)?;
    Some(format!(
        "{}{}{}",
        &format[..open],
        rendered,
        &format[close + 1..]
    ))
}

fn render_spec(spec: &str, value: &Number) -> Option<String> {
    if spec.is_empty() {
        return Some(match *value {
            Number::Int(v) => v.to_string(),
            Number::Float(v) => v.to_string(),
        });
    }
    if spec == "d" {
        return match *value {
            Number::Int(v) => Some(v.to_string()),
            Number::Float(_) => None,
        };
    }
    if let Some(precision) = spec.strip_suffix('f') {
        let precision = match precision.strip_prefix('.') {
            Some(digits) => digits.parse().ok()?,
            None if precision.is_empty() => 6,
            None => return None,
        };
        return Some(format!("{:.*}", precision, value.as_f64()));
    }
    None
}
