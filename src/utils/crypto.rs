use base64::Engine;
use sha2::{Digest, Sha256, Sha384, Sha512};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "sha256" => Some(HashAlgorithm::Sha256),
            "sha384" => Some(HashAlgorithm::Sha384),
            "sha512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntegrityDigest {
    pub algorithm: HashAlgorithm,
    pub digest: String,
}

/// Parses the first token of an `algorithm-base64digest` integrity string.
/// Returns `None` for unverifiable values such as `void`.
pub fn parse_integrity(value: &str) -> Option<IntegrityDigest> {
    let token = value.split_whitespace().next()?;
    let (label, digest) = token.split_once('-')?;
    let algorithm = HashAlgorithm::parse(label)?;
    if digest.is_empty() {
        return None;
    }
    Some(IntegrityDigest {
        algorithm,
        digest: digest.to_string(),
    })
}

pub fn compute_integrity(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let raw = match algorithm {
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
        HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
    };
    format!(
        "{}-{}",
        algorithm.label(),
        base64::engine::general_purpose::STANDARD.encode(raw)
    )
}

/// `None` when the expected value carries no verifiable digest.
pub fn integrity_matches(expected: &str, data: &[u8]) -> Option<bool> {
    let parsed = parse_integrity(expected)?;
    let actual = compute_integrity(parsed.algorithm, data);
    Some(actual == format!("{}-{}", parsed.algorithm.label(), parsed.digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        // sha256("abc")
        assert_eq!(
            compute_integrity(HashAlgorithm::Sha256, b"abc"),
            "sha256-ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0="
        );
    }

    #[test]
    fn only_first_token_is_used() {
        let expected = format!(
            "{} sha512-ignored",
            compute_integrity(HashAlgorithm::Sha256, b"payload")
        );
        assert_eq!(integrity_matches(&expected, b"payload"), Some(true));
        assert_eq!(integrity_matches(&expected, b"other"), Some(false));
    }

    #[test]
    fn unverifiable_values_are_skipped() {
        assert_eq!(integrity_matches("void", b"x"), None);
        assert_eq!(integrity_matches("md5-abc", b"x"), None);
        assert_eq!(integrity_matches("", b"x"), None);
    }
}
