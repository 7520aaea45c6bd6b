//! Domain name canonicalization.
//!
//! Stored names are always absolute (trailing dot) and lower-case. All names
//! coming in from the wire, from providers, or from the admin API pass
//! through [`clean_abs_name`] before they touch the store.

use crate::error::{Error, Result};

/// Canonicalizes an absolute domain name.
///
/// Rejects names that are not absolute, are 255 octets or longer, contain an
/// empty interior label, or a label longer than 63 octets. Returns the
/// lower-cased form. Idempotent: `clean_abs_name(clean_abs_name(n)?)` yields
/// the same name.
pub fn clean_abs_name(s: &str) -> Result<String> {
    if !s.ends_with('.') {
        return Err(Error::user(format!(
            "invalid name {s:?}: name must be absolute"
        )));
    }
    if s.len() >= 255 {
        return Err(Error::user(format!("invalid name {s:?}: name too long")));
    }
    let s = s.to_ascii_lowercase();
    let labels: Vec<&str> = s.split('.').collect();
    for label in &labels[..labels.len() - 1] {
        if label.is_empty() {
            return Err(Error::user(format!(
                "invalid name {s:?}: empty label"
            )));
        }
        if label.len() > 63 {
            return Err(Error::user(format!(
                "invalid name {s:?}: label {label:?} too long"
            )));
        }
    }
    Ok(s)
}

/// Makes a possibly-relative name absolute within a zone.
///
/// `""` and `"@"` refer to the zone apex. Names already carrying a trailing
/// dot are returned as-is; the caller is responsible for checking they are
/// inside the zone.
pub fn absolute_name(rel: &str, zone: &str) -> String {
    if rel.is_empty() || rel == "@" {
        zone.to_string()
    } else if rel.ends_with('.') {
        rel.to_string()
    } else {
        format!("{rel}.{zone}")
    }
}

/// Returns the name relative to the zone, or `"@"` for the apex.
pub fn relative_name(abs: &str, zone: &str) -> String {
    if abs.eq_ignore_ascii_case(zone) {
        "@".to_string()
    } else if let Some(prefix) =
        abs.strip_suffix(&format!(".{zone}")).or_else(|| {
            // Zone names are stored with the trailing dot; tolerate both.
            abs.strip_suffix(zone).map(|p| p.trim_end_matches('.'))
        })
    {
        prefix.to_string()
    } else {
        abs.to_string()
    }
}

/// Whether `name` equals the zone apex or lies below it.
pub fn in_zone(name: &str, zone: &str) -> bool {
    name == zone || name.ends_with(&format!(".{zone}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_accepts_and_lowercases() {
        assert_eq!(clean_abs_name("Example.COM.").unwrap(), "example.com.");
        let cleaned = clean_abs_name("a.b.c.example.").unwrap();
        assert_eq!(clean_abs_name(&cleaned).unwrap(), cleaned);
    }

    #[test]
    fn clean_rejects_relative() {
        assert!(clean_abs_name("example.com").is_err());
    }

    #[test]
    fn clean_rejects_long_name() {
        let label = "a".repeat(63);
        let name = format!("{label}.{label}.{label}.{label}.");
        assert!(name.len() >= 255);
        assert!(clean_abs_name(&name).is_err());
    }

    #[test]
    fn clean_rejects_long_label() {
        let name = format!("{}.example.", "a".repeat(64));
        assert!(clean_abs_name(&name).is_err());
    }

    #[test]
    fn clean_rejects_empty_interior_label() {
        assert!(clean_abs_name("a..example.").is_err());
        // The bare root falls under the same rule: its only label is
        // empty. Zone apexes are always at least one label deep here.
        assert!(clean_abs_name(".").is_err());
    }

    #[test]
    fn absolute_and_relative_round_trip() {
        assert_eq!(absolute_name("www", "z0.example."), "www.z0.example.");
        assert_eq!(absolute_name("@", "z0.example."), "z0.example.");
        assert_eq!(absolute_name("", "z0.example."), "z0.example.");
        assert_eq!(absolute_name("other.test.", "z0.example."), "other.test.");
        assert_eq!(relative_name("www.z0.example.", "z0.example."), "www");
        assert_eq!(relative_name("z0.example.", "z0.example."), "@");
    }

    #[test]
    fn in_zone_checks() {
        assert!(in_zone("z0.example.", "z0.example."));
        assert!(in_zone("a.b.z0.example.", "z0.example."));
        assert!(!in_zone("z1.example.", "z0.example."));
        assert!(!in_zone("az0.example.", "z0.example."));
    }
}
