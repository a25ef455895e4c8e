//! Audio encoding labels and format negotiation.

use std::fmt;

/// A MIME-style encoding label such as `audio/wav` or `audio/webm;codecs=opus`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AudioFormat(String);

impl AudioFormat {
    pub fn new(mime: impl Into<String>) -> Self {
        Self(mime.into().trim().to_ascii_lowercase())
    }

    pub fn mime(&self) -> &str {
        &self.0
    }

    /// The container part without codec parameters (`audio/webm;codecs=opus` → `audio/webm`).
    pub fn container(&self) -> &str {
        self.0.split(';').next().unwrap_or_default().trim()
    }

    pub fn is_wav(&self) -> bool {
        matches!(self.container(), "audio/wav" | "audio/x-wav" | "audio/wave")
    }

    pub fn is_raw_pcm(&self) -> bool {
        matches!(self.container(), "audio/pcm" | "audio/l16")
    }

    pub fn from_list(list: &[String]) -> Vec<AudioFormat> {
        list.iter().map(AudioFormat::new).collect()
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pick the best-supported format from an ordered preference list.
///
/// An exact label match is preferred; otherwise a preference whose container the
/// device supports is accepted with the device's own label (the device knows which
/// codec it will actually produce).
pub fn select_format(preferences: &[AudioFormat], supported: &[AudioFormat]) -> Option<AudioFormat> {
    for preferred in preferences {
        if supported.contains(preferred) {
            return Some(preferred.clone());
        }
        if let Some(same_container) = supported
            .iter()
            .find(|candidate| candidate.container() == preferred.container())
        {
            return Some(same_container.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_and_normalization() {
        let format = AudioFormat::new(" Audio/WebM;codecs=opus ");
        assert_eq!(format.mime(), "audio/webm;codecs=opus");
        assert_eq!(format.container(), "audio/webm");
        assert!(AudioFormat::new("audio/x-wav").is_wav());
        assert!(AudioFormat::new("audio/pcm").is_raw_pcm());
    }

    #[test]
    fn test_select_first_supported_preference() {
        let preferences = AudioFormat::from_list(&[
            "audio/webm;codecs=opus".to_string(),
            "audio/wav".to_string(),
            "audio/pcm".to_string(),
        ]);
        let supported = vec![AudioFormat::new("audio/pcm"), AudioFormat::new("audio/wav")];
        assert_eq!(select_format(&preferences, &supported), Some(AudioFormat::new("audio/wav")));
    }

    #[test]
    fn test_select_matches_container() {
        let preferences = vec![AudioFormat::new("audio/webm;codecs=opus")];
        let supported = vec![AudioFormat::new("audio/webm")];
        assert_eq!(select_format(&preferences, &supported), Some(AudioFormat::new("audio/webm")));
        assert_eq!(select_format(&preferences, &[AudioFormat::new("audio/wav")]), None);
    }
}
