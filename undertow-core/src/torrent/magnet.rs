//! Magnet link parsing utilities

use super::InfoHash;

/// Parsed magnet link fields needed before the engine takes over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

/// Reason a magnet URI was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid magnet link: {reason}")]
pub struct InvalidMagnet {
    pub reason: String,
}

/// Magnet link parsing utilities.
pub struct MagnetParser;

impl MagnetParser {
    /// Returns true when the URI uses the magnet scheme.
    pub fn is_magnet(uri: &str) -> bool {
        uri.get(..7)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("magnet:"))
    }

    /// Parses magnet link to extract torrent information.
    ///
    /// # Errors
    /// - `InvalidMagnet` - Malformed magnet URI or missing `xt=urn:btih:` topic
    pub fn parse_magnet_link(magnet_uri: &str) -> Result<MagnetLink, InvalidMagnet> {
        let normalized = match magnet_uri.get(7..) {
            Some(rest) if Self::is_magnet(magnet_uri) => format!("magnet:{rest}"),
            _ => magnet_uri.to_string(),
        };
        let magnet = magnet_url::Magnet::new(&normalized).map_err(|e| InvalidMagnet {
            reason: e.to_string(),
        })?;

        let info_hash = match (magnet.hash_type(), magnet.hash()) {
            (Some(kind), Some(hash)) if kind.eq_ignore_ascii_case("btih") => {
                hash.parse::<InfoHash>().map_err(|e| InvalidMagnet {
                    reason: e.to_string(),
                })?
            }
            _ => {
                return Err(InvalidMagnet {
                    reason: format!("missing info hash in {magnet_uri}"),
                });
            }
        };

        Ok(MagnetLink {
            info_hash,
            display_name: magnet.display_name().map(decode_component),
            trackers: magnet
                .trackers()
                .iter()
                .map(String::as_str)
                .map(decode_component)
                .collect(),
        })
    }
}

/// Percent-decodes one magnet parameter value.
fn decode_component(value: &str) -> String {
    let pair = format!("v={value}");
    url::form_urlencoded::parse(pair.as_bytes())
        .next()
        .map(|(_, decoded)| decoded.into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_magnet_link() {
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Test%20Torrent&tr=http://tracker.example.com/announce";
        let link = MagnetParser::parse_magnet_link(uri).unwrap();

        assert_eq!(
            link.info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
        assert_eq!(link.display_name.as_deref(), Some("Test Torrent"));
        assert_eq!(link.trackers, vec!["http://tracker.example.com/announce"]);
    }

    #[test]
    fn test_encoded_tracker_and_uppercase_scheme() {
        let uri = "MAGNET:?xt=urn:btih:0123456789ABCDEF0123456789ABCDEF01234567&dn=A+B&tr=udp%3A%2F%2Ftracker.example.org%3A1337%2Fannounce";
        let link = MagnetParser::parse_magnet_link(uri).unwrap();

        assert_eq!(
            link.info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
        assert_eq!(link.display_name.as_deref(), Some("A B"));
        assert_eq!(link.trackers, vec!["udp://tracker.example.org:1337/announce"]);
    }

    #[test]
    fn test_non_bittorrent_topic_rejected() {
        let uri = "magnet:?xt=urn:sha1:0123456789abcdef0123456789abcdef01234567";
        assert!(MagnetParser::parse_magnet_link(uri).is_err());
    }

    #[test]
    fn test_magnet_without_hash_rejected() {
        let uri = "magnet:?dn=Test%20Torrent&tr=http://tracker.example.com/announce";
        assert!(MagnetParser::parse_magnet_link(uri).is_err());
    }

    #[test]
    fn test_is_magnet() {
        assert!(MagnetParser::is_magnet("magnet:?xt=urn:btih:abc"));
        assert!(MagnetParser::is_magnet("MAGNET:?xt=urn:btih:abc"));
        assert!(!MagnetParser::is_magnet("https://example.com/a.torrent"));
        assert!(!MagnetParser::is_magnet("mag"));
    }
}
