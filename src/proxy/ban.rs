//! Ban page detection
//!
//! A source that throttles an address often still answers 200 with a
//! block page. Bodies are matched against configurable signatures after
//! gzip bodies have been inflated.

use std::borrow::Cow;
use std::io::Read;

use flate2::read::GzDecoder;
use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::error::{FetchError, Result};

/// Signature of the Avito "access from your IP is temporarily limited" page
pub const DEFAULT_BAN_PATTERN: &str = ">Доступ с Вашего IP временно ограничен";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone)]
pub struct BanDetector {
    patterns: Vec<Regex>,
}

impl BanDetector {
    /// Compile case-insensitive patterns
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| p.as_ref().trim())
            .filter(|p| !p.is_empty())
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| FetchError::InvalidConfig(format!("ban pattern {:?}: {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Detector that never reports a ban
    pub fn disabled() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    pub fn is_banned(&self, body: &[u8]) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let inflated = inflate(body);
        let text = String::from_utf8_lossy(&inflated);
        let banned = self.patterns.iter().any(|p| p.is_match(&text));
        if banned {
            debug!(bytes = body.len(), "Body matches a ban signature");
        }
        banned
    }
}

impl Default for BanDetector {
    fn default() -> Self {
        Self::new(&[DEFAULT_BAN_PATTERN]).unwrap_or_else(|_| Self::disabled())
    }
}

/// Gunzip a body that carries the gzip magic; anything else, including a
/// corrupt stream, is returned unchanged
fn inflate(body: &[u8]) -> Cow<'_, [u8]> {
    if !body.starts_with(&GZIP_MAGIC) {
        return Cow::Borrowed(body);
    }
    let mut decoded = Vec::new();
    match GzDecoder::new(body).read_to_end(&mut decoded) {
        Ok(_) => Cow::Owned(decoded),
        Err(e) => {
            debug!("Body looked gzipped but did not inflate: {}", e);
            Cow::Borrowed(body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const BAN_PAGE: &str =
        "<html><body><h1>Доступ с Вашего IP временно ограничен</h1></body></html>";

    fn gzip(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_detects_plain_ban_page() {
        let detector = BanDetector::default();
        assert!(detector.is_banned(BAN_PAGE.as_bytes()));
        assert!(!detector.is_banned("<html>Квартиры</html>".as_bytes()));
    }

    #[test]
    fn test_detects_gzipped_ban_page() {
        let detector = BanDetector::default();
        assert!(detector.is_banned(&gzip(BAN_PAGE)));
        assert!(!detector.is_banned(&gzip("<html>ok</html>")));
    }

    #[test]
    fn test_match_is_case_insensitive() {
        let detector = BanDetector::default();
        assert!(detector.is_banned("<h1>ДОСТУП С ВАШЕГО IP ВРЕМЕННО ОГРАНИЧЕН".as_bytes()));
    }

    #[test]
    fn test_corrupt_gzip_is_matched_raw() {
        let detector = BanDetector::new(&["captcha"]).unwrap();
        let mut body = GZIP_MAGIC.to_vec();
        body.extend_from_slice(b"...captcha...");
        assert!(detector.is_banned(&body));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        assert!(matches!(
            BanDetector::new(&["(unclosed"]),
            Err(FetchError::InvalidConfig(_))
        ));
        assert!(!BanDetector::disabled().is_banned(BAN_PAGE.as_bytes()));
    }
}
