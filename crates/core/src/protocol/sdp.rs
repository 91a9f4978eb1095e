//! SDP (Session Description Protocol) generation and parsing (RFC 4566 / RFC 8866).
//!
//! Produces the SDP body returned by DESCRIBE responses and reads the body
//! of ANNOUNCE requests. A file-backed stream renders as:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                              ← session name
//! c=IN IP4 <addr>                               ← connection address
//! t=0 0                                         ← timing (live stream)
//! a=tool:vidcast                                ← server software (§6)
//! a=sendonly                                    ← direction (§6)
//! m=video 0 RTP/AVP 96                          ← media description
//! a=rtpmap:96 H264/90000                        ← codec/clock rate
//! a=fmtp:96 packetization-mode=1;profile-level-id=42C01F;sprop-parameter-sets=Z0LAH...,aM4...
//! a=control:trackID=0                           ← track control URL
//! ```
//!
//! All session/origin fields come from [`ServerConfig`](crate::ServerConfig)
//! so nothing is hardcoded.

use base64::prelude::{BASE64_STANDARD, Engine as _};

use crate::error::{ParseErrorKind, Result, RtspError};
use crate::stream::{Format, H264Format, Media, MediaType, StreamDescription};

/// Session-level fields of a generated description.
#[derive(Debug, Clone)]
pub struct SdpOrigin<'a> {
    pub ip: &'a str,
    pub username: &'a str,
    pub session_id: &'a str,
    pub session_version: &'a str,
    pub session_name: &'a str,
}

/// Control attribute of the media at `index`, relative to the stream URL.
pub fn track_control(index: usize) -> String {
    format!("trackID={index}")
}

/// Generate an SDP session description for a stream.
pub fn generate_sdp(description: &StreamDescription, origin: &SdpOrigin<'_>) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o={} {} {} IN IP4 {}",
        origin.username, origin.session_id, origin.session_version, origin.ip
    ));
    sdp.push(format!("s={}", origin.session_name));
    sdp.push(format!("c=IN IP4 {}", origin.ip));
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:vidcast".to_string());
    sdp.push("a=sendonly".to_string());

    for (index, media) in description.medias.iter().enumerate() {
        let payload_types: Vec<String> = media
            .formats
            .iter()
            .map(|f| f.payload_type().to_string())
            .collect();
        sdp.push(format!(
            "m={} 0 RTP/AVP {}",
            media.media_type.as_str(),
            payload_types.join(" ")
        ));
        for format in &media.formats {
            match format {
                Format::H264(h264) => {
                    sdp.push(format!("a=rtpmap:{} H264/90000", h264.payload_type));
                    sdp.push(format!("a=fmtp:{} {}", h264.payload_type, h264_fmtp(h264)));
                }
                Format::Other {
                    payload_type,
                    rtpmap,
                    fmtp,
                } => {
                    if let Some(rtpmap) = rtpmap {
                        sdp.push(format!("a=rtpmap:{payload_type} {rtpmap}"));
                    }
                    if let Some(fmtp) = fmtp {
                        sdp.push(format!("a=fmtp:{payload_type} {fmtp}"));
                    }
                }
            }
        }
        sdp.push(format!("a=control:{}", track_control(index)));
    }

    tracing::debug!("SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}

fn h264_fmtp(format: &H264Format) -> String {
    let mut fmtp = format!("packetization-mode={}", format.packetization_mode);
    if let Some(params) = format.parameters() {
        if let Some(profile) = params.profile_level_id() {
            fmtp.push_str(&format!(";profile-level-id={profile}"));
        }
        fmtp.push_str(&format!(";sprop-parameter-sets={}", params.sprop_parameter_sets()));
    }
    fmtp
}

/// Parse an SDP body into a stream description.
///
/// Unknown lines and attributes are ignored. Media types other than
/// video, audio and application are skipped along with their attributes.
pub fn parse_sdp(body: &str) -> Result<StreamDescription> {
    let mut medias: Vec<Media> = Vec::new();
    // None while in the session section or inside a skipped media section.
    let mut current: Option<Media> = None;
    let mut in_media = false;

    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (kind, value) = line
            .split_once('=')
            .ok_or_else(|| RtspError::parse(ParseErrorKind::InvalidSdp(line.to_string())))?;
        match kind {
            "m" => {
                medias.extend(current.take());
                in_media = true;
                current = parse_media_line(value)?;
            }
            "a" if in_media => {
                if let Some(media) = current.as_mut() {
                    apply_attribute(media, value)?;
                }
            }
            _ => {}
        }
    }
    medias.extend(current);

    Ok(StreamDescription { medias })
}

fn parse_media_line(value: &str) -> Result<Option<Media>> {
    let invalid = || RtspError::parse(ParseErrorKind::InvalidSdp(format!("m={value}")));
    let mut fields = value.split_whitespace();
    let media_type = fields.next().ok_or_else(invalid)?;
    let _port = fields.next().ok_or_else(invalid)?;
    let _proto = fields.next().ok_or_else(invalid)?;
    let Some(media_type) = MediaType::parse(media_type) else {
        tracing::debug!(media_type, "skipping unsupported media");
        return Ok(None);
    };
    let formats = fields
        .map(|pt| {
            pt.parse::<u8>().map(|payload_type| Format::Other {
                payload_type,
                rtpmap: None,
                fmtp: None,
            })
        })
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| invalid())?;
    Ok(Some(Media {
        media_type,
        control: None,
        formats,
    }))
}

fn apply_attribute(media: &mut Media, attribute: &str) -> Result<()> {
    let (name, value) = attribute.split_once(':').unwrap_or((attribute, ""));
    match name {
        "control" => media.control = Some(value.trim().to_string()),
        "rtpmap" | "fmtp" => {
            let (pt, rest) = value.split_once(' ').unwrap_or((value, ""));
            let Ok(pt) = pt.trim().parse::<u8>() else {
                return Err(RtspError::parse(ParseErrorKind::InvalidSdp(format!("a={attribute}"))));
            };
            let Some(format) = media.formats.iter_mut().find(|f| f.payload_type() == pt) else {
                return Ok(());
            };
            let rest = rest.trim();
            if name == "rtpmap" {
                set_rtpmap(format, rest);
            } else {
                set_fmtp(format, rest);
            }
        }
        _ => {}
    }
    Ok(())
}

fn set_rtpmap(format: &mut Format, rtpmap: &str) {
    let encoding = rtpmap.split('/').next().unwrap_or_default();
    match format {
        Format::Other {
            payload_type, fmtp, ..
        } if encoding.eq_ignore_ascii_case("H264") => {
            let mut h264 = H264Format {
                payload_type: *payload_type,
                packetization_mode: 0,
                sps: None,
                pps: None,
            };
            if let Some(fmtp) = fmtp.take() {
                apply_h264_fmtp(&mut h264, &fmtp);
            }
            *format = Format::H264(h264);
        }
        Format::Other { rtpmap: slot, .. } => *slot = Some(rtpmap.to_string()),
        Format::H264(_) => {}
    }
}

fn set_fmtp(format: &mut Format, fmtp: &str) {
    match format {
        Format::H264(h264) => apply_h264_fmtp(h264, fmtp),
        Format::Other { fmtp: slot, .. } => *slot = Some(fmtp.to_string()),
    }
}

fn apply_h264_fmtp(format: &mut H264Format, fmtp: &str) {
    for param in fmtp.split(';').map(str::trim) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "packetization-mode" => {
                format.packetization_mode = value.trim().parse().unwrap_or(0);
            }
            "sprop-parameter-sets" => {
                let mut sets = value.trim().split(',').filter_map(|s| BASE64_STANDARD.decode(s).ok());
                format.sps = sets.next().filter(|s| !s.is_empty());
                format.pps = sets.next().filter(|s| !s.is_empty());
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::params::H264Parameters;

    fn origin() -> SdpOrigin<'static> {
        SdpOrigin {
            ip: "192.168.1.100",
            username: "server",
            session_id: "1234567890",
            session_version: "1",
            session_name: "Test Session",
        }
    }

    #[test]
    fn generates_h264_sdp() {
        let sdp = generate_sdp(&StreamDescription::h264(None), &origin());
        assert!(sdp.contains("v=0\r\n"));
        assert!(sdp.contains("o=server 1234567890 1 IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("s=Test Session\r\n"));
        assert!(
            sdp.contains("c=IN IP4 192.168.1.100\r\n"),
            "c= must use configured IP, not 0.0.0.0"
        );
        assert!(
            sdp.contains("a=tool:vidcast\r\n"),
            "SDP must include tool attribute"
        );
        assert!(
            sdp.contains("a=sendonly\r\n"),
            "SDP must include sendonly direction"
        );
        assert!(
            sdp.contains("a=rtpmap:96 H264/90000\r\n"),
            "SDP must include valid rtpmap"
        );
        assert!(sdp.contains("a=fmtp:96 packetization-mode=1\r\n"));
        assert!(sdp.contains("a=control:trackID=0\r\n"));

        // Verify ordering: rtpmap must come before fmtp (RFC 6184 §8.2.1)
        let rtpmap_idx = sdp.find("a=rtpmap").expect("SDP must include rtpmap");
        let fmtp_idx = sdp.find("a=fmtp").expect("SDP must include fmtp");
        assert!(
            rtpmap_idx < fmtp_idx,
            "a=rtpmap must precede a=fmtp per RFC 6184"
        );

        // Session-level attrs must come before media section
        let sendonly_idx = sdp.find("a=sendonly").expect("SDP must include sendonly");
        let m_idx = sdp.find("m=video").expect("SDP must include media section");
        assert!(
            sendonly_idx < m_idx,
            "session-level attrs must precede m= line"
        );

        assert!(fmtp_idx > m_idx, "media attributes must follow m=video");
        assert!(sdp.ends_with("\r\n"), "SDP must end with CRLF");
    }

    #[test]
    fn includes_parameter_sets_when_known() {
        let params = H264Parameters {
            sps: vec![0x67, 0x42, 0xc0, 0x1f, 0xda],
            pps: vec![0x68, 0xce, 0x3c, 0x80],
        };
        let sdp = generate_sdp(&StreamDescription::h264(Some(&params)), &origin());
        assert!(sdp.contains(&format!(
            "a=fmtp:96 packetization-mode=1;profile-level-id=42C01F;sprop-parameter-sets={}\r\n",
            params.sprop_parameter_sets()
        )));
    }

    #[test]
    fn parses_generated_description() {
        let params = H264Parameters {
            sps: vec![0x67, 0x64, 0x00, 0x28],
            pps: vec![0x68, 0xee],
        };
        let desc = StreamDescription::h264(Some(&params));
        let parsed = parse_sdp(&generate_sdp(&desc, &origin())).unwrap();
        let format = parsed.find_h264().unwrap();
        assert_eq!(format.packetization_mode, 1);
        assert_eq!(format.parameters(), Some(params));
        assert_eq!(parsed.medias[0].control.as_deref(), Some("trackID=0"));
    }

    #[test]
    fn parses_announce_with_audio_and_video() {
        let body = "v=0\r\n\
                    o=- 0 0 IN IP4 127.0.0.1\r\n\
                    s=Stream\r\n\
                    a=control:*\r\n\
                    m=audio 0 RTP/AVP 97\r\n\
                    a=rtpmap:97 MPEG4-GENERIC/48000/2\r\n\
                    a=fmtp:97 streamtype=5\r\n\
                    a=control:streamid=0\r\n\
                    m=video 0 RTP/AVP 98\r\n\
                    a=fmtp:98 packetization-mode=1\r\n\
                    a=rtpmap:98 H264/90000\r\n\
                    a=control:streamid=1\r\n";
        let desc = parse_sdp(body).unwrap();
        assert_eq!(desc.medias.len(), 2);
        assert_eq!(
            desc.medias[0].formats[0],
            Format::Other {
                payload_type: 97,
                rtpmap: Some("MPEG4-GENERIC/48000/2".into()),
                fmtp: Some("streamtype=5".into()),
            }
        );
        let (index, media) = desc.find_h264_media().unwrap();
        assert_eq!(index, 1);
        assert_eq!(media.control.as_deref(), Some("streamid=1"));
        // fmtp seen before rtpmap still applies.
        assert_eq!(media.h264().unwrap().packetization_mode, 1);
        assert_eq!(media.h264().unwrap().payload_type, 98);
    }

    #[test]
    fn no_h264_in_mjpeg_announce() {
        let body = "v=0\r\ns=x\r\nm=video 0 RTP/AVP 26\r\na=rtpmap:26 JPEG/90000\r\n";
        let desc = parse_sdp(body).unwrap();
        assert_eq!(desc.medias.len(), 1);
        assert!(desc.find_h264().is_none());
    }

    #[test]
    fn rejects_lines_without_equals() {
        assert!(matches!(
            parse_sdp("v=0\r\ngarbage\r\n"),
            Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidSdp(_)
            })
        ));
    }

    #[test]
    fn rejects_bad_payload_type() {
        assert!(parse_sdp("v=0\r\nm=video 0 RTP/AVP abc\r\n").is_err());
    }
}
