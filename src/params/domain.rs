//! Value domains for runtime parameters.
//!
//! A domain knows how to parse an operator-supplied string, how to render a
//! value back, and which bounds a value must respect.

use std::fmt;

use super::error::ParamError;

/// A parsed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Plain unsigned integer.
    Uint(u64),
    /// Size in bytes.
    Bytes(u64),
    /// Duration in seconds.
    Seconds(f64),
    /// Boolean switch.
    Bool(bool),
    /// One member of an enumerated set.
    Choice(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Uint(v) => write!(f, "{v}"),
            ParamValue::Bytes(v) => f.write_str(&format_bytes(*v)),
            ParamValue::Seconds(v) => write!(f, "{v:.3}"),
            ParamValue::Bool(v) => f.write_str(if *v { "on" } else { "off" }),
            ParamValue::Choice(v) => f.write_str(v),
        }
    }
}

/// The set of values a parameter accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamDomain {
    /// Unsigned integer within `[min, max]`.
    Uint {
        /// Smallest accepted value.
        min: u64,
        /// Largest accepted value.
        max: u64,
    },
    /// Byte size with optional unit suffix (`b`, `k`, `m`, `g`, `t`).
    Bytes {
        /// Smallest accepted size.
        min: u64,
        /// Largest accepted size.
        max: u64,
    },
    /// Seconds, fractional values allowed.
    Seconds {
        /// Smallest accepted duration.
        min: f64,
        /// Largest accepted duration.
        max: f64,
    },
    /// `on`/`off` style switch.
    Bool,
    /// One of a fixed list of words.
    Choice(&'static [&'static str]),
}

impl ParamDomain {
    /// Parse `raw` into a value of this domain, enforcing the bounds.
    pub fn parse(&self, name: &str, raw: &str) -> Result<ParamValue, ParamError> {
        let raw = raw.trim();
        match self {
            ParamDomain::Uint { min, max } => {
                let v: u64 = raw.parse().map_err(|_| ParamError::Syntax {
                    name: name.to_string(),
                    message: format!("\"{raw}\" is not an unsigned integer"),
                })?;
                check_range(name, v, *min, *max, |x| x.to_string())?;
                Ok(ParamValue::Uint(v))
            }
            ParamDomain::Bytes { min, max } => {
                let v = parse_bytes(raw).ok_or_else(|| ParamError::Syntax {
                    name: name.to_string(),
                    message: format!("\"{raw}\" is not a byte size (e.g. 48k, 80m)"),
                })?;
                check_range(name, v, *min, *max, format_bytes)?;
                Ok(ParamValue::Bytes(v))
            }
            ParamDomain::Seconds { min, max } => {
                let v: f64 = raw.parse().map_err(|_| ParamError::Syntax {
                    name: name.to_string(),
                    message: format!("\"{raw}\" is not a number of seconds"),
                })?;
                if !v.is_finite() {
                    return Err(ParamError::Syntax {
                        name: name.to_string(),
                        message: format!("\"{raw}\" is not a finite number"),
                    });
                }
                if v < *min || v > *max {
                    return Err(ParamError::OutOfDomain {
                        name: name.to_string(),
                        message: format!("must be between {min:.3} and {max:.3}"),
                    });
                }
                Ok(ParamValue::Seconds(v))
            }
            ParamDomain::Bool => match raw.to_ascii_lowercase().as_str() {
                "on" | "true" | "yes" | "enable" => Ok(ParamValue::Bool(true)),
                "off" | "false" | "no" | "disable" => Ok(ParamValue::Bool(false)),
                _ => Err(ParamError::Syntax {
                    name: name.to_string(),
                    message: format!("\"{raw}\" is not a boolean (use on/off)"),
                }),
            },
            ParamDomain::Choice(choices) => {
                if choices.contains(&raw) {
                    Ok(ParamValue::Choice(raw.to_string()))
                } else {
                    Err(ParamError::OutOfDomain {
                        name: name.to_string(),
                        message: format!("must be one of: {}", choices.join(", ")),
                    })
                }
            }
        }
    }

    /// Raise the lower bound. Only meaningful for bounded numeric domains.
    pub(crate) fn with_minimum(&self, name: &str, raw: &str) -> Result<ParamDomain, ParamError> {
        let unbounded = match self {
            ParamDomain::Uint { max, .. } => ParamDomain::Uint { min: 0, max: *max },
            ParamDomain::Bytes { max, .. } => ParamDomain::Bytes { min: 0, max: *max },
            ParamDomain::Seconds { max, .. } => ParamDomain::Seconds { min: 0.0, max: *max },
            ParamDomain::Bool | ParamDomain::Choice(_) => {
                return Err(ParamError::Syntax {
                    name: name.to_string(),
                    message: "parameter has no minimum".to_string(),
                });
            }
        };
        let floor = unbounded.parse(name, raw)?;
        Ok(match (unbounded, floor) {
            (ParamDomain::Uint { max, .. }, ParamValue::Uint(min)) => ParamDomain::Uint { min, max },
            (ParamDomain::Bytes { max, .. }, ParamValue::Bytes(min)) => {
                ParamDomain::Bytes { min, max }
            }
            (ParamDomain::Seconds { max, .. }, ParamValue::Seconds(min)) => {
                ParamDomain::Seconds { min, max }
            }
            (domain, _) => domain,
        })
    }

    /// Human-readable description of the accepted values.
    pub fn describe(&self) -> String {
        match self {
            ParamDomain::Uint { min, max } => format!("{min}..{}", bound(*max, |v| v.to_string())),
            ParamDomain::Bytes { min, max } => {
                format!("{}..{} bytes", format_bytes(*min), bound(*max, format_bytes))
            }
            ParamDomain::Seconds { min, max } => {
                if *max == f64::MAX {
                    format!("{min:.3}.. seconds")
                } else {
                    format!("{min:.3}..{max:.3} seconds")
                }
            }
            ParamDomain::Bool => "on|off".to_string(),
            ParamDomain::Choice(choices) => choices.join("|"),
        }
    }
}

fn bound(max: u64, render: impl Fn(u64) -> String) -> String {
    if max == u64::MAX { String::new() } else { render(max) }
}

fn check_range(
    name: &str,
    v: u64,
    min: u64,
    max: u64,
    render: impl Fn(u64) -> String,
) -> Result<(), ParamError> {
    if v < min {
        return Err(ParamError::OutOfDomain {
            name: name.to_string(),
            message: format!("must be at least {}", render(min)),
        });
    }
    if v > max {
        return Err(ParamError::OutOfDomain {
            name: name.to_string(),
            message: format!("must be no more than {}", render(max)),
        });
    }
    Ok(())
}

/// Parse a byte size such as `48k`, `80m`, `1g` or `4096`.
///
/// Suffixes are powers of 1024 and case-insensitive; an optional trailing `b`
/// is accepted (`64kb`).
pub fn parse_bytes(raw: &str) -> Option<u64> {
    let raw = raw.trim().to_ascii_lowercase();
    let digits_end = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(digits_end);
    if number.is_empty() {
        return None;
    }
    let shift = match suffix.trim().trim_end_matches('b') {
        "" => 0,
        "k" => 10,
        "m" => 20,
        "g" => 30,
        "t" => 40,
        "p" => 50,
        _ => return None,
    };
    let value: f64 = number.parse().ok()?;
    let scaled = value * (1u64 << shift) as f64;
    if !scaled.is_finite() || scaled < 0.0 || scaled > u64::MAX as f64 {
        return None;
    }
    Some(scaled.round() as u64)
}

/// Render a byte count with the largest exact unit.
pub fn format_bytes(v: u64) -> String {
    const UNITS: [(u32, &str); 5] = [(50, "p"), (40, "t"), (30, "g"), (20, "m"), (10, "k")];
    for (shift, unit) in UNITS {
        let scale = 1u64 << shift;
        if v >= scale && v % scale == 0 {
            return format!("{}{unit}", v / scale);
        }
    }
    format!("{v}b")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bytes_units() {
        assert_eq!(parse_bytes("4096"), Some(4096));
        assert_eq!(parse_bytes("48k"), Some(48 * 1024));
        assert_eq!(parse_bytes("80M"), Some(80 * 1024 * 1024));
        assert_eq!(parse_bytes("1g"), Some(1 << 30));
        assert_eq!(parse_bytes("64kb"), Some(64 * 1024));
        assert_eq!(parse_bytes("1.5k"), Some(1536));
        assert_eq!(parse_bytes("k"), None);
        assert_eq!(parse_bytes("12x"), None);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(48 * 1024), "48k");
        assert_eq!(format_bytes(80 << 20), "80m");
        assert_eq!(format_bytes(1536), "1536b");
        assert_eq!(format_bytes(0), "0b");
    }

    #[test]
    fn test_uint_bounds() {
        let domain = ParamDomain::Uint { min: 1, max: 10 };
        assert_eq!(domain.parse("x", "5").unwrap(), ParamValue::Uint(5));
        assert!(matches!(domain.parse("x", "0"), Err(ParamError::OutOfDomain { .. })));
        assert!(matches!(domain.parse("x", "11"), Err(ParamError::OutOfDomain { .. })));
        assert!(matches!(domain.parse("x", "five"), Err(ParamError::Syntax { .. })));
    }

    #[test]
    fn test_bool_and_choice() {
        assert_eq!(ParamDomain::Bool.parse("b", "ON").unwrap(), ParamValue::Bool(true));
        assert_eq!(ParamDomain::Bool.parse("b", "no").unwrap(), ParamValue::Bool(false));
        assert!(ParamDomain::Bool.parse("b", "maybe").is_err());

        let domain = ParamDomain::Choice(&["fast", "slow"]);
        assert_eq!(
            domain.parse("c", "slow").unwrap(),
            ParamValue::Choice("slow".to_string())
        );
        assert!(matches!(domain.parse("c", "medium"), Err(ParamError::OutOfDomain { .. })));
    }

    #[test]
    fn test_with_minimum_raises_floor() {
        let domain = ParamDomain::Bytes { min: 0, max: u64::MAX };
        let raised = domain.with_minimum("stack", "16k").unwrap();
        assert!(matches!(raised.parse("stack", "8k"), Err(ParamError::OutOfDomain { .. })));
        assert!(raised.parse("stack", "16k").is_ok());
        assert!(ParamDomain::Bool.with_minimum("b", "1").is_err());
    }
}
