//! Правка SDP перед отправкой: лимиты полосы и порядок кодеков.

use crate::peer::types::MediaKind;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthLimits {
    pub video_kbps: u32,
    pub audio_kbps: u32,
}

impl Default for BandwidthLimits {
    fn default() -> Self {
        Self {
            video_kbps: 2000,
            audio_kbps: 128,
        }
    }
}

/// Всё, что негоциатор вшивает в описание сессии
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpPreferences {
    pub bandwidth: BandwidthLimits,
    pub video_codec: String,
    pub audio_codec: String,
}

impl Default for SdpPreferences {
    fn default() -> Self {
        Self {
            bandwidth: BandwidthLimits::default(),
            video_codec: "VP8".into(),
            audio_codec: "opus".into(),
        }
    }
}

impl SdpPreferences {
    pub fn apply(&self, sdp: &str) -> String {
        let sdp = prefer_codec(sdp, MediaKind::Video, &self.video_codec);
        let sdp = prefer_codec(&sdp, MediaKind::Audio, &self.audio_codec);
        apply_bandwidth_limits(&sdp, self.bandwidth)
    }
}

fn section_kind(m_line: &str) -> Option<MediaKind> {
    if m_line.starts_with("m=audio") {
        Some(MediaKind::Audio)
    } else if m_line.starts_with("m=video") {
        Some(MediaKind::Video)
    } else {
        None
    }
}

/// Проставляет `b=AS` в каждую audio/video секцию, убирая прежние `b=AS`/`b=TIAS`.
/// Строка `b=` встаёт после `c=`, а если её нет, то перед первым `a=`.
pub fn apply_bandwidth_limits(sdp: &str, limits: BandwidthLimits) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut pending: Option<u32> = None;
    let mut in_media = false;

    for line in sdp.lines().filter(|l| !l.is_empty()) {
        if line.starts_with("m=") {
            if let Some(kbps) = pending.take() {
                out.push(format!("b=AS:{kbps}"));
            }
            let kind = section_kind(line);
            in_media = kind.is_some();
            pending = kind.map(|k| match k {
                MediaKind::Audio => limits.audio_kbps,
                MediaKind::Video => limits.video_kbps,
            });
            out.push(line.to_owned());
            continue;
        }

        if in_media && (line.starts_with("b=AS:") || line.starts_with("b=TIAS:")) {
            continue;
        }

        if line.starts_with("a=") {
            if let Some(kbps) = pending.take() {
                out.push(format!("b=AS:{kbps}"));
            }
        }
        out.push(line.to_owned());
        if line.starts_with("c=") {
            if let Some(kbps) = pending.take() {
                out.push(format!("b=AS:{kbps}"));
            }
        }
    }
    if let Some(kbps) = pending {
        out.push(format!("b=AS:{kbps}"));
    }

    let mut result = out.join("\r\n");
    result.push_str("\r\n");
    result
}

/// Переставляет payload type'ы предпочитаемого кодека в начало `m=` строки
pub fn prefer_codec(sdp: &str, kind: MediaKind, codec: &str) -> String {
    let lines: Vec<&str> = sdp.lines().filter(|l| !l.is_empty()).collect();

    // payload type'ы кодека внутри нужной секции
    let mut preferred: Vec<&str> = Vec::new();
    let mut current: Option<MediaKind> = None;
    for line in &lines {
        if line.starts_with("m=") {
            current = section_kind(line);
            continue;
        }
        if current != Some(kind) {
            continue;
        }
        if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            let mut parts = rest.splitn(2, ' ');
            let (Some(pt), Some(encoding)) = (parts.next(), parts.next()) else {
                continue;
            };
            let name = encoding.split('/').next().unwrap_or_default();
            if name.eq_ignore_ascii_case(codec) {
                preferred.push(pt);
            }
        }
    }

    if preferred.is_empty() {
        return sdp.to_owned();
    }

    let rewritten: Vec<String> = lines
        .iter()
        .map(|line| {
            if section_kind(line) != Some(kind) {
                return (*line).to_owned();
            }
            let fields: Vec<&str> = line.split(' ').collect();
            if fields.len() <= 3 {
                return (*line).to_owned();
            }
            let (head, formats) = fields.split_at(3);
            let mut ordered: Vec<&str> = head.to_vec();
            ordered.extend(formats.iter().filter(|pt| preferred.contains(pt)));
            ordered.extend(formats.iter().filter(|pt| !preferred.contains(pt)));
            ordered.join(" ")
        })
        .collect();

    let mut result = rewritten.join("\r\n");
    result.push_str("\r\n");
    result
}
