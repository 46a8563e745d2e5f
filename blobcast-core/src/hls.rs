//! Playlist rendering. Pure functions over catalog rows and a URI scope;
//! two calls with the same inputs produce byte-identical playlists.

use crate::catalog::{SegmentRecord, SubtitleTrackRecord, VideoRecord};

pub const VIDEO_TRACK: &str = "video";

/// How segment and playlist URIs are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaylistScope {
    /// Paths only; the player resolves them against the playlist URL.
    Relative,
    /// Fully qualified URLs rooted at `base` (scheme://host[:port]).
    Absolute { base: String },
}

impl PlaylistScope {
    fn media_playlist_uri(&self, video_id: &str) -> String {
        match self {
            PlaylistScope::Relative => format!("{VIDEO_TRACK}/playlist.m3u8"),
            PlaylistScope::Absolute { base } => {
                format!("{base}/hls/{video_id}/{VIDEO_TRACK}/playlist.m3u8")
            }
        }
    }

    fn segment_uri(&self, video_id: &str, filename: &str) -> String {
        match self {
            PlaylistScope::Relative => filename.to_string(),
            PlaylistScope::Absolute { base } => {
                format!("{base}/hls/{video_id}/{VIDEO_TRACK}/{filename}")
            }
        }
    }

    fn subtitle_uri(&self, video_id: &str, language: &str) -> String {
        match self {
            PlaylistScope::Relative => format!("subtitles/{language}"),
            PlaylistScope::Absolute { base } => {
                format!("{base}/hls/{video_id}/subtitles/{language}")
            }
        }
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "YES"
    } else {
        "NO"
    }
}

/// Master playlist: one video variant plus one SUBTITLES rendition per
/// subtitle track.
pub fn master_playlist(
    video: &VideoRecord,
    subtitles: &[SubtitleTrackRecord],
    scope: &PlaylistScope,
) -> String {
    let mut lines = vec!["#EXTM3U".to_string(), "#EXT-X-VERSION:3".to_string()];

    for track in subtitles {
        let name = track
            .title
            .clone()
            .unwrap_or_else(|| track.language.clone());
        lines.push(format!(
            "#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",NAME=\"{name}\",LANGUAGE=\"{language}\",DEFAULT={default},FORCED={forced},URI=\"{uri}\"",
            language = track.language,
            default = yes_no(track.is_default),
            forced = yes_no(track.is_forced),
            uri = scope.subtitle_uri(&video.id, &track.language),
        ));
    }

    let bandwidth = if video.duration > 0.0 {
        ((video.byte_size as f64 * 8.0) / video.duration) as u64
    } else {
        2_000_000
    };
    let mut stream_inf = format!("#EXT-X-STREAM-INF:BANDWIDTH={bandwidth}");
    if !subtitles.is_empty() {
        stream_inf.push_str(",SUBTITLES=\"subs\"");
    }
    lines.push(stream_inf);
    lines.push(scope.media_playlist_uri(&video.id));
    lines.push(String::new());
    lines.join("\n")
}

/// Media playlist over the ordered segment rows.
pub fn media_playlist(video_id: &str, segments: &[SegmentRecord], scope: &PlaylistScope) -> String {
    let target_duration = segments
        .iter()
        .map(|segment| segment.duration)
        .fold(0.0_f64, f64::max)
        .ceil() as u64;

    let mut lines = vec![
        "#EXTM3U".to_string(),
        "#EXT-X-VERSION:3".to_string(),
        format!("#EXT-X-TARGETDURATION:{target_duration}"),
        "#EXT-X-MEDIA-SEQUENCE:0".to_string(),
    ];
    for segment in segments {
        lines.push(format!("#EXTINF:{:.6},", segment.duration));
        lines.push(scope.segment_uri(video_id, &segment.filename));
    }
    lines.push("#EXT-X-ENDLIST".to_string());
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{segment_filename, VideoStatus};

    fn segment(ordinal: i64, duration: f64) -> SegmentRecord {
        SegmentRecord {
            video_id: "movie".to_string(),
            ordinal,
            filename: segment_filename(ordinal as u32),
            duration,
            byte_size: 1_000_000,
            handle: format!("10{ordinal}/f{ordinal}"),
            account_id: "primary".to_string(),
            created_at: None,
        }
    }

    fn video() -> VideoRecord {
        let mut video = VideoRecord::new("movie", "movie.mp4");
        video.duration = 17.5;
        video.byte_size = 3_000_000;
        video.total_segments = 3;
        video.status = VideoStatus::Active;
        video
    }

    #[test]
    fn media_playlist_shape() {
        let segments = vec![segment(0, 6.0), segment(1, 6.006), segment(2, 5.5)];
        let playlist = media_playlist("movie", &segments, &PlaylistScope::Relative);
        let lines: Vec<&str> = playlist.lines().collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXT-X-VERSION:3");
        assert_eq!(lines[2], "#EXT-X-TARGETDURATION:7");
        assert_eq!(lines[3], "#EXT-X-MEDIA-SEQUENCE:0");
        assert_eq!(lines[4], "#EXTINF:6.000000,");
        assert_eq!(lines[5], "segment_00000.ts");
        assert_eq!(*lines.last().unwrap(), "#EXT-X-ENDLIST");
    }

    #[test]
    fn playlists_are_byte_stable() {
        let segments = vec![segment(0, 6.0), segment(1, 5.9)];
        let scope = PlaylistScope::Absolute {
            base: "http://192.168.1.10:8080".to_string(),
        };
        assert_eq!(
            media_playlist("movie", &segments, &scope),
            media_playlist("movie", &segments, &scope)
        );
        assert_eq!(
            master_playlist(&video(), &[], &scope),
            master_playlist(&video(), &[], &scope)
        );
    }

    #[test]
    fn absolute_scope_fully_qualifies_uris() {
        let segments = vec![segment(0, 6.0)];
        let scope = PlaylistScope::Absolute {
            base: "https://stream.example.org".to_string(),
        };
        let playlist = media_playlist("movie", &segments, &scope);
        assert!(playlist.contains("https://stream.example.org/hls/movie/video/segment_00000.ts"));
    }

    #[test]
    fn master_lists_subtitle_renditions() {
        let subtitles = vec![SubtitleTrackRecord {
            video_id: "movie".to_string(),
            track_index: 0,
            language: "ger".to_string(),
            title: Some("German".to_string()),
            codec: Some("webvtt".to_string()),
            is_default: true,
            is_forced: false,
            is_hearing_impaired: false,
            handle: "200/sub".to_string(),
            account_id: "primary".to_string(),
        }];
        let playlist = master_playlist(&video(), &subtitles, &PlaylistScope::Relative);
        assert!(playlist.contains("TYPE=SUBTITLES"));
        assert!(playlist.contains("NAME=\"German\""));
        assert!(playlist.contains("LANGUAGE=\"ger\""));
        assert!(playlist.contains("DEFAULT=YES"));
        assert!(playlist.contains("SUBTITLES=\"subs\""));
        assert!(playlist.contains("URI=\"subtitles/ger\""));
        // exactly one variant line
        assert_eq!(playlist.matches("#EXT-X-STREAM-INF").count(), 1);
    }
}
