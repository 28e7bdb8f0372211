//! Subdomain validation (`spec.md` §3, §6, §8).

use uuid::Uuid;

/// Labels excluded from allocation because they name a system surface.
pub const RESERVED_SUBDOMAINS: &[&str] =
    &["www", "tunnel", "api", "app", "admin", "dashboard", "docs"];

/// Validates a subdomain label: a DNS label of at most 63 characters,
/// `[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?`, not in the reserved set.
pub fn validate_subdomain(label: &str) -> Result<(), String> {
    if label.is_empty() {
        return Err("subdomain must not be empty".into());
    }
    if label.len() > 63 {
        return Err("subdomain must be at most 63 characters".into());
    }
    let bytes = label.as_bytes();
    let is_alnum = |b: u8| b.is_ascii_alphanumeric();
    if !is_alnum(bytes[0]) {
        return Err("subdomain must start with a letter or digit".into());
    }
    if !is_alnum(bytes[bytes.len() - 1]) {
        return Err("subdomain must end with a letter or digit".into());
    }
    if !bytes.iter().all(|&b| is_alnum(b) || b == b'-') {
        return Err("subdomain may only contain letters, digits, and hyphens".into());
    }
    if RESERVED_SUBDOMAINS.contains(&label.to_ascii_lowercase().as_str()) {
        return Err(format!("subdomain '{label}' is reserved"));
    }
    Ok(())
}

/// Generates a random 12-hex-character subdomain label for the "New"
/// identity-resolution outcome (`spec.md` §4.4 case 4).
pub fn random_subdomain() -> String {
    let a = Uuid::new_v4().simple().to_string();
    let b = Uuid::new_v4().simple().to_string();
    format!("{}{}", &a[..6], &b[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_labels() {
        for ok in ["a", "a-b", "abc123", "a1-b2-c3"] {
            assert!(validate_subdomain(ok).is_ok(), "{ok} should be valid");
        }
    }

    #[test]
    fn rejects_leading_or_trailing_hyphen() {
        assert!(validate_subdomain("-a").is_err());
        assert!(validate_subdomain("a-").is_err());
    }

    #[test]
    fn rejects_empty_and_overlong() {
        assert!(validate_subdomain("").is_err());
        let too_long = "a".repeat(64);
        assert!(validate_subdomain(&too_long).is_err());
        let max_len = "a".repeat(63);
        assert!(validate_subdomain(&max_len).is_ok());
    }

    #[test]
    fn rejects_reserved_labels() {
        for reserved in RESERVED_SUBDOMAINS {
            assert!(validate_subdomain(reserved).is_err());
            assert!(validate_subdomain(&reserved.to_uppercase()).is_err());
        }
    }

    #[test]
    fn random_subdomain_is_valid_and_unique() {
        let a = random_subdomain();
        let b = random_subdomain();
        assert_ne!(a, b);
        assert!(validate_subdomain(&a).is_ok());
        assert_eq!(a.len(), 12);
    }
}
