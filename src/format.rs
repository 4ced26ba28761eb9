//! Value coercion and display formatting.
//!
//! Numbers arrive from the backend as JSON numbers, plain strings or
//! locale-formatted strings. Everything shown in the dashboard is formatted
//! with the German convention (`.` thousands, `,` decimals).

use serde_json::Value;

pub const MISSING_VALUE_GLYPH: &str = "—";
pub const MISSING_VALUE_LABEL: &str = "Wert nicht verfügbar";
pub const FX_UNAVAILABLE_REASON: &str = "Wechselkurs nicht verfügbar";

/// How a numeric cell is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Plain integer, e.g. a position count.
    Count,
    /// Share quantity with up to six decimals.
    Holdings,
    /// EUR amount.
    Currency,
    /// EUR amount colored by sign.
    SignedCurrency,
    /// Percentage colored by sign.
    Percent,
}

impl ValueKind {
    pub fn decimals(self) -> usize {
        match self {
            ValueKind::Count => 0,
            ValueKind::Holdings => 6,
            ValueKind::Currency | ValueKind::SignedCurrency | ValueKind::Percent => 2,
        }
    }

    fn is_signed(self) -> bool {
        matches!(self, ValueKind::SignedCurrency | ValueKind::Percent)
    }
}

/// Parses a number that may use either German or US separators.
///
/// Already numeric input passes through. Returns `None` for anything that is
/// not a finite number, including a lone sign.
pub fn parse_locale_number(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => parse_locale_str(s),
        _ => None,
    }
}

pub fn parse_locale_str(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '€' && *c != '%' && *c != '\u{202f}')
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let (sign, body) = match cleaned.chars().next() {
        Some('-') => ("-", &cleaned[1..]),
        Some('+') => ("", &cleaned[1..]),
        _ => ("", cleaned.as_str()),
    };
    if body.is_empty() || !body.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    if !body
        .chars()
        .all(|c| c.is_ascii_digit() || c == '.' || c == ',')
    {
        return None;
    }

    let last_dot = body.rfind('.');
    let last_comma = body.rfind(',');
    let canonical = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) => {
            // the rightmost separator is the decimal mark
            if comma > dot {
                body.replace('.', "").replace(',', ".")
            } else {
                body.replace(',', "")
            }
        }
        (None, Some(_)) => {
            let groups: Vec<&str> = body.split(',').collect();
            if groups.len() > 2 || is_thousands_grouping(&groups) {
                groups.concat()
            } else {
                body.replace(',', ".")
            }
        }
        (Some(_), None) => {
            let groups: Vec<&str> = body.split('.').collect();
            if groups.len() > 2 {
                groups.concat()
            } else {
                body.to_string()
            }
        }
        (None, None) => body.to_string(),
    };

    let value: f64 = format!("{sign}{canonical}").parse().ok()?;
    value.is_finite().then_some(value)
}

// "1,234" reads as one thousand two hundred thirty four, "0,123" does not.
fn is_thousands_grouping(groups: &[&str]) -> bool {
    match groups {
        [lead, tail] => {
            tail.len() == 3
                && !lead.is_empty()
                && lead.len() <= 3
                && lead.trim_start_matches('0') != ""
        }
        _ => false,
    }
}

/// Rounds to `decimals` places. Never returns negative zero.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let factor = 10f64.powi(decimals as i32);
    let rounded = (value * factor).round() / factor;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Formats with German separators, e.g. `1234.5` with two decimals becomes
/// `1.234,50`.
pub fn format_number(value: f64, decimals: usize) -> String {
    let rounded = round_to(value, decimals as u32);
    let formatted = format!("{:.*}", decimals, rounded.abs());
    let (integer_part, decimal_part) = match formatted.split_once('.') {
        Some((int, dec)) => (int, Some(dec)),
        None => (formatted.as_str(), None),
    };

    let grouped = integer_part
        .as_bytes()
        .rchunks(3)
        .rev()
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join(".");

    let sign = if rounded < 0.0 { "-" } else { "" };
    match decimal_part {
        Some(dec) => format!("{sign}{grouped},{dec}"),
        None => format!("{sign}{grouped}"),
    }
}

pub fn format_currency(value: f64) -> String {
    format!("{} €", format_number(value, 2))
}

pub fn format_percent(value: f64) -> String {
    format!("{} %", format_number(value, 2))
}

/// Trims trailing zeros from holdings so `12,500000` shows as `12,5`.
pub fn format_holdings(value: f64) -> String {
    let formatted = format_number(value, ValueKind::Holdings.decimals());
    match formatted.split_once(',') {
        Some((int, dec)) => {
            let dec = dec.trim_end_matches('0');
            if dec.is_empty() {
                int.to_string()
            } else {
                format!("{int},{dec}")
            }
        }
        None => formatted,
    }
}

pub fn format_plain(kind: ValueKind, value: f64) -> String {
    match kind {
        ValueKind::Count => format_number(value, 0),
        ValueKind::Holdings => format_holdings(value),
        ValueKind::Currency | ValueKind::SignedCurrency => format_currency(value),
        ValueKind::Percent => format_percent(value),
    }
}

/// Placeholder shown whenever a value is unknown.
pub fn missing_value_markup(reason: Option<&str>) -> String {
    let label = match reason {
        Some(reason) if !reason.is_empty() => format!("{MISSING_VALUE_LABEL}: {reason}"),
        _ => MISSING_VALUE_LABEL.to_string(),
    };
    let label = escape_html(&label);
    format!(
        r#"<span class="missing-value" role="note" aria-label="{label}" title="{label}">{MISSING_VALUE_GLYPH}</span>"#
    )
}

/// Display markup for a cell value; signed kinds get a `positive`/`negative`
/// class.
pub fn format_value_markup(kind: ValueKind, value: Option<f64>, reason: Option<&str>) -> String {
    let value = match value {
        Some(v) if v.is_finite() => v,
        _ => return missing_value_markup(reason),
    };
    let text = format_plain(kind, value);
    if !kind.is_signed() {
        return text;
    }
    let rounded = round_to(value, kind.decimals() as u32);
    let class = if rounded > 0.0 {
        "positive"
    } else if rounded < 0.0 {
        "negative"
    } else {
        "neutral"
    };
    format!(r#"<span class="{class}">{text}</span>"#)
}

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Strips tags from rendered markup, used when legacy rows have to be read
/// back.
pub fn strip_tags(markup: &str) -> String {
    let mut out = String::with_capacity(markup.len());
    let mut in_tag = false;
    for c in markup.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&amp;", "&").replace("&nbsp;", " ")
}
