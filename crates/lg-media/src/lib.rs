// lg-media: media description and unit types shared by the server,
// the static-source client, and the integration suites.
//
// Wire codecs live with their protocol front-ends; this crate only carries
// the in-memory model they all exchange: a Description (ordered medias, each
// with ordered formats) and the opaque Unit that flows through the fan-out.

pub mod sdp;

use bytes::Bytes;

/// The kind of a media within a description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Application,
}

impl MediaKind {
    /// SDP media token (`m=<token> ...`).
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Application => "application",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "video" => Some(MediaKind::Video),
            "audio" => Some(MediaKind::Audio),
            "application" => Some(MediaKind::Application),
            _ => None,
        }
    }
}

/// A codec entry inside a media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Codec name as it appears in `a=rtpmap` (e.g. "H264", "MPEG4-GENERIC").
    pub name: String,
    pub clock_rate: u32,
    pub payload_type: u8,
}

/// One media (track) of a description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    pub kind: MediaKind,
    pub formats: Vec<Format>,
}

/// Ordered list of medias published on a path.
///
/// Media and format order is significant: the fan-out addresses every
/// delivery by (media index, format index).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Description {
    pub medias: Vec<Media>,
}

impl Description {
    /// A single-video-track description, the smallest publishable one.
    pub fn single_video() -> Self {
        Description {
            medias: vec![Media {
                kind: MediaKind::Video,
                formats: vec![Format {
                    name: "H264".to_owned(),
                    clock_rate: 90000,
                    payload_type: 96,
                }],
            }],
        }
    }

    /// The fixed two-track description used by front-ends whose wire format
    /// does not carry one (e.g. RTMP publishers).
    pub fn video_and_audio() -> Self {
        Description {
            medias: vec![
                Media {
                    kind: MediaKind::Video,
                    formats: vec![Format {
                        name: "H264".to_owned(),
                        clock_rate: 90000,
                        payload_type: 96,
                    }],
                },
                Media {
                    kind: MediaKind::Audio,
                    formats: vec![Format {
                        name: "MPEG4-GENERIC".to_owned(),
                        clock_rate: 48000,
                        payload_type: 97,
                    }],
                },
            ],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.medias.is_empty()
    }
}

/// An opaque media unit as it flows through a stream.
///
/// The payload is whatever the ingress protocol produced; the fan-out never
/// inspects it.
#[derive(Debug, Clone)]
pub struct Unit {
    pub payload: Bytes,
}

impl Unit {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Unit {
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kind_roundtrip() {
        for kind in [MediaKind::Video, MediaKind::Audio, MediaKind::Application] {
            assert_eq!(MediaKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MediaKind::parse("text"), None);
    }

    #[test]
    fn canned_descriptions_have_expected_shape() {
        let d = Description::video_and_audio();
        assert_eq!(d.medias.len(), 2);
        assert_eq!(d.medias[0].kind, MediaKind::Video);
        assert_eq!(d.medias[1].kind, MediaKind::Audio);
        assert!(!d.is_empty());
        assert!(Description::default().is_empty());
    }
}
