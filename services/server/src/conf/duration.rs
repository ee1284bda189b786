//! Human-readable durations in the configuration file.
//!
//! Accepted forms: `"200ms"`, `"10s"`, `"1m30s"`, `"2h"`, or a bare number
//! of seconds. Serialized back to the most compact unit form.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// A `std::time::Duration` with config-file serde.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Dur(pub Duration);

impl Dur {
    pub const fn from_secs(secs: u64) -> Self {
        Dur(Duration::from_secs(secs))
    }

    pub const fn from_millis(ms: u64) -> Self {
        Dur(Duration::from_millis(ms))
    }

    pub fn get(&self) -> Duration {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<Dur> for Duration {
    fn from(d: Dur) -> Duration {
        d.0
    }
}

pub fn parse(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_owned());
    }
    // bare number of seconds
    if let Ok(secs) = s.parse::<f64>() {
        if secs < 0.0 {
            return Err(format!("negative duration: {s}"));
        }
        return Ok(Duration::from_secs_f64(secs));
    }

    let mut total = Duration::ZERO;
    let mut num = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
            continue;
        }
        let unit = if c == 'm' && chars.peek() == Some(&'s') {
            chars.next();
            "ms"
        } else {
            match c {
                's' => "s",
                'm' => "m",
                'h' => "h",
                _ => return Err(format!("invalid duration unit in: {s}")),
            }
        };
        let value: f64 = num
            .parse()
            .map_err(|_| format!("invalid duration value in: {s}"))?;
        num.clear();
        total += match unit {
            "ms" => Duration::from_secs_f64(value / 1000.0),
            "s" => Duration::from_secs_f64(value),
            "m" => Duration::from_secs_f64(value * 60.0),
            "h" => Duration::from_secs_f64(value * 3600.0),
            _ => unreachable!(),
        };
    }
    if !num.is_empty() {
        return Err(format!("trailing number without unit in: {s}"));
    }
    Ok(total)
}

pub fn format(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        return "0s".to_owned();
    }
    if ms % 1000 != 0 {
        return format!("{ms}ms");
    }
    let secs = d.as_secs();
    if secs % 3600 == 0 {
        return format!("{}h", secs / 3600);
    }
    if secs % 60 == 0 {
        return format!("{}m", secs / 60);
    }
    format!("{secs}s")
}

impl Serialize for Dur {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(self.0))
    }
}

impl<'de> Deserialize<'de> for Dur {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(f64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Str(s) => parse(&s).map(Dur).map_err(D::Error::custom),
            Raw::Num(n) => {
                if n < 0.0 {
                    return Err(D::Error::custom("negative duration"));
                }
                Ok(Dur(Duration::from_secs_f64(n)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_forms() {
        assert_eq!(parse("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse("200ms").unwrap(), Duration::from_millis(200));
        assert_eq!(parse("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse("5").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("").is_err());
        assert!(parse("10x").is_err());
        assert!(parse("-3s").is_err());
        assert!(parse("12").is_ok());
        assert!(parse("3s4").is_err());
    }

    #[test]
    fn formats_compactly() {
        assert_eq!(format(Duration::from_secs(90)), "90s");
        assert_eq!(format(Duration::from_secs(120)), "2m");
        assert_eq!(format(Duration::from_millis(200)), "200ms");
        assert_eq!(format(Duration::ZERO), "0s");
    }

    #[test]
    fn serde_roundtrip_through_yaml() {
        let d: Dur = serde_yaml::from_str("1m30s").unwrap();
        assert_eq!(d.get(), Duration::from_secs(90));
        let s = serde_yaml::to_string(&d).unwrap();
        assert_eq!(s.trim(), "90s");
    }
}
