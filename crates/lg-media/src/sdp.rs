//! Minimal SDP marshalling for DESCRIBE/ANNOUNCE bodies.
//!
//! Only the subset the server itself emits is accepted back: session-level
//! `v=`/`o=`/`s=` lines, one `m=` line per media, and one `a=rtpmap` per
//! format. `a=control:trackID=N` carries the media index used by SETUP.

use crate::{Description, Format, Media, MediaKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdpError {
    #[error("invalid media line: {0}")]
    InvalidMediaLine(String),
    #[error("invalid rtpmap: {0}")]
    InvalidRtpmap(String),
    #[error("description contains no media")]
    NoMedias,
}

/// Serialize a description into an SDP body.
pub fn marshal(desc: &Description) -> String {
    let mut out = String::new();
    out.push_str("v=0\r\n");
    out.push_str("o=- 0 0 IN IP4 127.0.0.1\r\n");
    out.push_str("s=Stream\r\n");
    out.push_str("t=0 0\r\n");
    for (i, media) in desc.medias.iter().enumerate() {
        let pts: Vec<String> = media
            .formats
            .iter()
            .map(|f| f.payload_type.to_string())
            .collect();
        out.push_str(&format!(
            "m={} 0 RTP/AVP {}\r\n",
            media.kind.as_str(),
            pts.join(" ")
        ));
        for f in &media.formats {
            out.push_str(&format!(
                "a=rtpmap:{} {}/{}\r\n",
                f.payload_type, f.name, f.clock_rate
            ));
        }
        out.push_str(&format!("a=control:trackID={i}\r\n"));
    }
    out
}

/// Parse an SDP body back into a description.
pub fn unmarshal(body: &str) -> Result<Description, SdpError> {
    let mut medias: Vec<Media> = Vec::new();

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("m=") {
            let mut parts = rest.split_whitespace();
            let kind_str = parts
                .next()
                .ok_or_else(|| SdpError::InvalidMediaLine(line.to_owned()))?;
            let kind = MediaKind::parse(kind_str)
                .ok_or_else(|| SdpError::InvalidMediaLine(line.to_owned()))?;
            // port and proto are ignored; payload types are resolved by rtpmap
            medias.push(Media {
                kind,
                formats: Vec::new(),
            });
        } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            let media = medias
                .last_mut()
                .ok_or_else(|| SdpError::InvalidRtpmap(line.to_owned()))?;
            let mut parts = rest.split_whitespace();
            let pt: u8 = parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| SdpError::InvalidRtpmap(line.to_owned()))?;
            let codec = parts
                .next()
                .ok_or_else(|| SdpError::InvalidRtpmap(line.to_owned()))?;
            let mut codec_parts = codec.split('/');
            let name = codec_parts
                .next()
                .ok_or_else(|| SdpError::InvalidRtpmap(line.to_owned()))?;
            let clock_rate: u32 = codec_parts
                .next()
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| SdpError::InvalidRtpmap(line.to_owned()))?;
            media.formats.push(Format {
                name: name.to_owned(),
                clock_rate,
                payload_type: pt,
            });
        }
    }

    if medias.is_empty() {
        return Err(SdpError::NoMedias);
    }
    Ok(Description { medias })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marshal_unmarshal_roundtrip() {
        let desc = Description::video_and_audio();
        let body = marshal(&desc);
        let parsed = unmarshal(&body).unwrap();
        assert_eq!(parsed, desc);
    }

    #[test]
    fn marshal_carries_track_controls() {
        let body = marshal(&Description::video_and_audio());
        assert!(body.contains("a=control:trackID=0"));
        assert!(body.contains("a=control:trackID=1"));
    }

    #[test]
    fn unmarshal_rejects_empty_body() {
        assert!(matches!(unmarshal("v=0\r\n"), Err(SdpError::NoMedias)));
    }

    #[test]
    fn unmarshal_rejects_garbage_rtpmap() {
        let body = "v=0\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:notanumber H264/90000\r\n";
        assert!(matches!(unmarshal(body), Err(SdpError::InvalidRtpmap(_))));
    }
}
