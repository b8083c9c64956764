// LoanLiberator - Library Loan Archiver
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Content keys for segmented (DASH) audiobooks
//!
//! The license exchange itself (challenge, signed response, key unwrapping)
//! happens outside this crate. What lives here:
//! - reading the Widevine PSSH out of the DASH manifest
//! - the [`ContentKeyProvider`] seam that hands back a `KID:KEY` pair
//! - two providers: a key given up front, or an external program
//!
//! # MPEG-DASH Manifest (MPD)
//! ```xml
//! <AdaptationSet mimeType="audio/mp4">
//!   <ContentProtection schemeIdUri="urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed">
//!     <cenc:pssh>AAAA...</cenc:pssh>
//!   </ContentProtection>
//! </AdaptationSet>
//! ```

use crate::error::{LiberatorError, Result};
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Widevine system id as it appears in `schemeIdUri`
pub const WIDEVINE_SCHEME_ID: &str = "urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed";

/// License proxy used for segmented audiobooks
pub const LICENSE_URL: &str = "https://lic.drmtoday.com/license-proxy-widevine/cenc/?specConform=true";

/// Environment variable carrying the playback token to key commands
pub const AUTH_TOKEN_ENV: &str = "LIBERATOR_DRM_AUTH_TOKEN";

/// Key id and key, both 32 hex characters
#[derive(Clone, PartialEq, Eq)]
pub struct ContentKey {
    pub kid: String,
    pub key: String,
}

impl ContentKey {
    /// Parse a `KID:KEY` pair, or a bare 32-hex key
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let (kid, key) = match value.split_once(':') {
            Some((kid, key)) => (kid.trim(), key.trim()),
            None => ("", value),
        };

        if !is_hex_128(key) || (!kid.is_empty() && !is_hex_128(kid)) {
            return Err(LiberatorError::InvalidContentKey(
                "expected KID:KEY with 32 hex characters each".to_string(),
            ));
        }

        Ok(Self {
            kid: kid.to_ascii_lowercase(),
            key: key.to_ascii_lowercase(),
        })
    }

    /// Value for the segment decryptor's `--key` argument
    pub fn to_decryptor_arg(&self) -> String {
        if self.kid.is_empty() {
            // mp4decrypt accepts a track index in place of the key id
            format!("1:{}", self.key)
        } else {
            format!("{}:{}", self.kid, self.key)
        }
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey(kid={}, key=<redacted>)", self.kid)
    }
}

fn is_hex_128(value: &str) -> bool {
    hex::decode(value).map(|bytes| bytes.len() == 16).unwrap_or(false)
}

/// Inputs handed to a key provider
#[derive(Clone)]
pub struct KeyRequest {
    pub pssh: String,
    pub license_url: String,
    /// Upfront DRM auth token for this loan
    pub auth_token: String,
}

impl fmt::Debug for KeyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRequest")
            .field("pssh", &self.pssh)
            .field("license_url", &self.license_url)
            .finish_non_exhaustive()
    }
}

/// Turns a license request into a content key
#[async_trait]
pub trait ContentKeyProvider: Send + Sync {
    async fn content_key(&self, request: &KeyRequest) -> Result<ContentKey>;
}

/// Key supplied by the user
#[derive(Debug, Clone)]
pub struct StaticKeyProvider {
    key: ContentKey,
}

impl StaticKeyProvider {
    pub fn new(key: ContentKey) -> Self {
        Self { key }
    }
}

#[async_trait]
impl ContentKeyProvider for StaticKeyProvider {
    async fn content_key(&self, _request: &KeyRequest) -> Result<ContentKey> {
        Ok(self.key.clone())
    }
}

/// External program performing the license exchange
///
/// Invoked as `<program> [args...] <pssh> <license_url>` with the auth token
/// in [`AUTH_TOKEN_ENV`]. The first `KID:KEY` pair on stdout is used.
#[derive(Debug, Clone)]
pub struct CommandKeyProvider {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandKeyProvider {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    fn tool_name(&self) -> String {
        self.program.display().to_string()
    }
}

#[async_trait]
impl ContentKeyProvider for CommandKeyProvider {
    async fn content_key(&self, request: &KeyRequest) -> Result<ContentKey> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&request.pssh)
            .arg(&request.license_url)
            .env(AUTH_TOKEN_ENV, &request.auth_token)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    LiberatorError::ExternalToolNotFound(self.tool_name())
                } else {
                    LiberatorError::FileIoError(format!("Failed to run {}: {}", self.tool_name(), e))
                }
            })?;

        if !output.status.success() {
            return Err(LiberatorError::ExternalToolFailure {
                tool: self.tool_name(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        first_key_in_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Find the first `KID:KEY` pair in tool output
pub fn first_key_in_output(stdout: &str) -> Result<ContentKey> {
    let pattern = Regex::new(r"\b([0-9a-fA-F]{32}):([0-9a-fA-F]{32})\b")
        .map_err(|e| LiberatorError::internal(format!("key pattern: {}", e)))?;

    pattern
        .captures(stdout)
        .map(|caps| ContentKey {
            kid: caps[1].to_ascii_lowercase(),
            key: caps[2].to_ascii_lowercase(),
        })
        .ok_or_else(|| LiberatorError::InvalidContentKey("no KID:KEY pair in key command output".to_string()))
}

/// Extract the Widevine PSSH from the first audio adaptation set
pub fn extract_pssh(mpd: &str) -> Result<String> {
    let mut reader = Reader::from_str(mpd);
    reader.config_mut().trim_text(true);

    let mut in_audio_set = false;
    let mut in_widevine = false;
    let mut in_pssh = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"AdaptationSet" => {
                    in_audio_set = attribute(&e, b"mimeType").as_deref() == Some("audio/mp4");
                }
                b"ContentProtection" if in_audio_set => {
                    in_widevine = attribute(&e, b"schemeIdUri")
                        .map(|s| s.to_ascii_lowercase() == WIDEVINE_SCHEME_ID)
                        .unwrap_or(false);
                }
                b"pssh" if in_widevine => in_pssh = true,
                _ => {}
            },
            Ok(Event::Text(t)) if in_pssh => {
                let value = t
                    .unescape()
                    .map_err(|e| LiberatorError::manifest_corrupt("Manifest.mpd", e.to_string()))?;
                if !value.trim().is_empty() {
                    return Ok(value.trim().to_string());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"AdaptationSet" => in_audio_set = false,
                b"ContentProtection" => in_widevine = false,
                b"pssh" => in_pssh = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(LiberatorError::manifest_corrupt("Manifest.mpd", e.to_string())),
            _ => {}
        }
    }

    Err(LiberatorError::PsshNotFound)
}

fn attribute(element: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Option<String> {
    element
        .attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MPD: &str = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" xmlns:cenc="urn:mpeg:cenc:2013">
  <Period>
    <AdaptationSet mimeType="video/mp4">
      <ContentProtection schemeIdUri="urn:uuid:EDEF8BA9-79D6-4ACE-A3C8-27DCD51D21ED">
        <cenc:pssh>VIDEO</cenc:pssh>
      </ContentProtection>
    </AdaptationSet>
    <AdaptationSet mimeType="audio/mp4">
      <ContentProtection schemeIdUri="urn:mpeg:dash:mp4protection:2011" value="cenc"/>
      <ContentProtection schemeIdUri="urn:uuid:9a04f079-9840-4286-ab92-e65be0885f95">
        <cenc:pssh>PLAYREADY</cenc:pssh>
      </ContentProtection>
      <ContentProtection schemeIdUri="urn:uuid:EDEF8BA9-79D6-4ACE-A3C8-27DCD51D21ED">
        <cenc:pssh>AAAAQ3Bzc2g=</cenc:pssh>
      </ContentProtection>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn test_extract_pssh_picks_widevine_audio() {
        assert_eq!(extract_pssh(MPD).unwrap(), "AAAAQ3Bzc2g=");
    }

    #[test]
    fn test_extract_pssh_missing() {
        let mpd = r#"<MPD><Period><AdaptationSet mimeType="audio/mp4"/></Period></MPD>"#;
        assert!(matches!(extract_pssh(mpd), Err(LiberatorError::PsshNotFound)));
    }

    #[test]
    fn test_content_key_parse() {
        let key = ContentKey::parse("0123456789ABCDEF0123456789abcdef:fedcba9876543210fedcba9876543210").unwrap();
        assert_eq!(key.kid, "0123456789abcdef0123456789abcdef");
        assert_eq!(
            key.to_decryptor_arg(),
            "0123456789abcdef0123456789abcdef:fedcba9876543210fedcba9876543210"
        );

        let bare = ContentKey::parse("fedcba9876543210fedcba9876543210").unwrap();
        assert_eq!(bare.to_decryptor_arg(), "1:fedcba9876543210fedcba9876543210");

        assert!(ContentKey::parse("nothex:alsonothex").is_err());
    }

    #[test]
    fn test_first_key_in_output() {
        let out = "license ok\n--key 0123456789abcdef0123456789abcdef:fedcba9876543210fedcba9876543210\n";
        let key = first_key_in_output(out).unwrap();
        assert_eq!(key.key, "fedcba9876543210fedcba9876543210");
        assert!(first_key_in_output("nothing here").is_err());
    }

    #[test]
    fn test_content_key_debug_hides_key() {
        let key = ContentKey::parse("fedcba9876543210fedcba9876543210").unwrap();
        assert!(!format!("{:?}", key).contains("fedcba"));
    }

    #[tokio::test]
    async fn test_static_provider_returns_key() {
        let key = ContentKey::parse("fedcba9876543210fedcba9876543210").unwrap();
        let provider = StaticKeyProvider::new(key.clone());
        let request = KeyRequest {
            pssh: "p".into(),
            license_url: LICENSE_URL.into(),
            auth_token: "t".into(),
        };
        assert_eq!(provider.content_key(&request).await.unwrap(), key);
    }
}
