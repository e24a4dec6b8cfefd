//! HLS media playlists for derived streams.

use std::fmt::Write as _;
use vtn_types::StreamId;

/// Nominal segment duration in seconds.
pub const SEGMENT_DURATION_SECS: f64 = 2.0;

/// Manifest update for one derived stream.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistUpdate {
    /// Derived stream the manifest describes.
    pub stream: StreamId,
    /// Rendered `.m3u8` text.
    pub manifest: String,
}

/// Media playlist of one derived stream.
#[derive(Debug, Clone)]
pub struct MediaPlaylist {
    stream: StreamId,
    segments: Vec<u64>,
    ended: bool,
}

impl MediaPlaylist {
    /// Empty playlist for `stream`.
    pub fn new(stream: StreamId) -> Self {
        Self {
            stream,
            segments: Vec::new(),
            ended: false,
        }
    }

    /// Append segment `seq`. Ignored once ended.
    pub fn push(&mut self, seq: u64) {
        if !self.ended {
            self.segments.push(seq);
        }
    }

    /// Mark the playlist complete.
    pub fn end(&mut self) {
        self.ended = true;
    }

    /// Whether `#EXT-X-ENDLIST` has been written.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Segments listed so far.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether no segment has been listed.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// URI of segment `seq`.
    pub fn segment_uri(&self, seq: u64) -> String {
        format!("{}_{}.ts", self.stream.suffix(), seq)
    }

    /// Render the manifest as `.m3u8` text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("#EXTM3U\n#EXT-X-VERSION:3\n");
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", SEGMENT_DURATION_SECS.ceil() as u64);
        let _ = writeln!(
            out,
            "#EXT-X-MEDIA-SEQUENCE:{}",
            self.segments.first().copied().unwrap_or(0)
        );
        for &seq in &self.segments {
            let _ = writeln!(out, "#EXTINF:{SEGMENT_DURATION_SECS:.3},");
            let _ = writeln!(out, "{}", self.segment_uri(seq));
        }
        if self.ended {
            out.push_str("#EXT-X-ENDLIST\n");
        }
        out
    }

    /// Snapshot as an update message.
    pub fn update(&self) -> PlaylistUpdate {
        PlaylistUpdate {
            stream: self.stream.clone(),
            manifest: self.render(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_live_then_ended() {
        let stream = StreamId::new("node", "abc").unwrap();
        let mut playlist = MediaPlaylist::new(stream);
        playlist.push(4);
        playlist.push(5);

        let live = playlist.render();
        assert!(live.starts_with("#EXTM3U\n"));
        assert!(live.contains("#EXT-X-MEDIA-SEQUENCE:4\n"));
        assert!(live.contains("abc_5.ts\n"));
        assert!(!live.contains("#EXT-X-ENDLIST"));

        playlist.end();
        playlist.push(6);
        let done = playlist.render();
        assert!(done.ends_with("#EXT-X-ENDLIST\n"));
        assert_eq!(playlist.len(), 2);
    }
}
