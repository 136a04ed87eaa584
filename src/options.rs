//! Shared option-string vocabulary parsing (§4, §6.2, §A.3).
//!
//! Every driver allocator takes a vector of `key` or `key=value` strings.
//! Unrecognized keys are an *invalid* error, decided by the driver (this
//! module only tokenizes and converts values); this file holds the bits that
//! are identical across drivers so `tcp::client`, `tcp::accepter`, and `pty`
//! don't each reimplement boolean/octal parsing.

use crate::error::{Error, Result};

/// One parsed `key` or `key=value` option.
#[derive(Debug, Clone)]
pub struct Opt<'a> {
  pub key: &'a str,
  pub value: Option<&'a str>,
}

/// Splits a raw option string on its first `=`.
pub fn parse_opt(raw: &str) -> Opt<'_> {
  match raw.split_once('=') {
    Some((k, v)) => Opt { key: k, value: Some(v) },
    None => Opt { key: raw, value: None },
  }
}

/// Parses the usual textual boolean forms recognized by an option helper:
/// presence alone (no `=value`) means `true`; `true`/`1`/`yes`/`on` and
/// `false`/`0`/`no`/`off` (case-insensitive) are the explicit forms.
pub fn parse_bool(value: Option<&str>) -> Result<bool> {
  match value {
    None => Ok(true),
    Some(v) => match v.to_ascii_lowercase().as_str() {
      "true" | "1" | "yes" | "on" => Ok(true),
      "false" | "0" | "no" | "off" => Ok(false),
      _ => Err(Error::Invalid),
    },
  }
}

/// Parses an unsigned integer option value (`readbuf=<n>`).
pub fn parse_usize(value: Option<&str>) -> Result<usize> {
  value.and_then(|v| v.parse().ok()).ok_or(Error::Invalid)
}

/// Parses a single octal digit (`umode=<digit>`), 0-7.
pub fn parse_octal_digit(value: Option<&str>) -> Result<u32> {
  let v = value.ok_or(Error::Invalid)?;
  let digit = u32::from_str_radix(v, 8).map_err(|_| Error::Invalid)?;
  if digit > 7 {
    return Err(Error::Invalid);
  }
  Ok(digit)
}

/// Parses a `perm=<0..0777>` value into its u/g/o octal digits.
pub fn parse_perm(value: Option<&str>) -> Result<(u32, u32, u32)> {
  let v = value.ok_or(Error::Invalid)?;
  let mode = u32::from_str_radix(v.trim_start_matches('0'), 8)
    .map_err(|_| Error::Invalid)?;
  if mode > 0o777 {
    return Err(Error::Invalid);
  }
  Ok(((mode >> 6) & 0o7, (mode >> 3) & 0o7, mode & 0o7))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bool_forms() {
    assert!(parse_bool(None).unwrap());
    assert!(parse_bool(Some("true")).unwrap());
    assert!(parse_bool(Some("1")).unwrap());
    assert!(!parse_bool(Some("false")).unwrap());
    assert!(!parse_bool(Some("off")).unwrap());
    assert!(parse_bool(Some("maybe")).is_err());
  }

  #[test]
  fn perm_splits_octal() {
    assert_eq!(parse_perm(Some("0600")).unwrap(), (6, 0, 0));
    assert_eq!(parse_perm(Some("777")).unwrap(), (7, 7, 7));
    assert!(parse_perm(Some("0800")).is_err());
  }

  #[test]
  fn key_value_split() {
    let o = parse_opt("readbuf=4096");
    assert_eq!(o.key, "readbuf");
    assert_eq!(o.value, Some("4096"));
    let o = parse_opt("nodelay");
    assert_eq!(o.key, "nodelay");
    assert_eq!(o.value, None);
  }
}
