// Track model consumed by the scheduler: what a segment is, where it can be fetched
// from, and what parsing a chunk of it produces.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

use crate::cdn::CdnMetadata;

/// Kind of media buffer a track feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferType {
    Audio,
    Video,
    Text,
}

impl BufferType {
    /// Initialization segments are only cached for audio and video tracks.
    pub fn caches_init_segments(&self) -> bool {
        matches!(self, Self::Audio | Self::Video)
    }
}

impl fmt::Display for BufferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Text => "text",
        };
        f.write_str(name)
    }
}

/// One quality of a track, and the CDNs able to serve its segments.
#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    pub id: Arc<str>,
    pub bitrate: u64,
    /// Every source able to serve this representation, in manifest order.
    /// `None` when the transport has no CDN concept (single implicit source).
    pub cdn_metadata: Option<Vec<CdnMetadata>>,
}

impl Representation {
    pub fn new(id: impl Into<Arc<str>>, bitrate: u64) -> Self {
        Self {
            id: id.into(),
            bitrate,
            cdn_metadata: None,
        }
    }

    pub fn with_cdns(mut self, cdns: Vec<CdnMetadata>) -> Self {
        self.cdn_metadata = Some(cdns);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentDescriptor {
    /// Identity of the segment within its representation.
    pub id: Arc<str>,
    pub is_init: bool,
    /// Start time, in seconds.
    pub time: f64,
    /// Duration, in seconds. Zero for initialization segments.
    pub duration: f64,
    /// Path relative to the CDN base URL, or an absolute URL.
    pub url: Option<String>,
    /// Inclusive byte range, end omitted for "until the end".
    pub byte_range: Option<(u64, Option<u64>)>,
}

impl SegmentDescriptor {
    pub fn init(id: impl Into<Arc<str>>) -> Self {
        Self {
            id: id.into(),
            is_init: true,
            time: 0.0,
            duration: 0.0,
            url: None,
            byte_range: None,
        }
    }

    pub fn media(id: impl Into<Arc<str>>, time: f64, duration: f64) -> Self {
        Self {
            id: id.into(),
            is_init: false,
            time,
            duration,
            url: None,
            byte_range: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_byte_range(mut self, start: u64, end: Option<u64>) -> Self {
        self.byte_range = Some((start, end));
        self
    }

    pub fn end(&self) -> f64 {
        self.time + self.duration
    }
}

/// Everything a loader and a parser need to know about one segment request.
#[derive(Debug, Clone)]
pub struct SegmentContext {
    pub buffer_type: BufferType,
    pub representation: Arc<Representation>,
    pub segment: Arc<SegmentDescriptor>,
}

impl SegmentContext {
    pub fn new(
        buffer_type: BufferType,
        representation: Arc<Representation>,
        segment: Arc<SegmentDescriptor>,
    ) -> Self {
        Self {
            buffer_type,
            representation,
            segment,
        }
    }

    /// Human readable identifier used in logs and errors.
    pub fn label(&self) -> String {
        format!(
            "{}/{}/{}",
            self.buffer_type, self.representation.id, self.segment.id
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedInitChunk {
    pub data: Option<Bytes>,
    /// Timescale announced by the initialization segment, needed to parse media.
    pub init_timescale: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMediaChunk {
    pub data: Bytes,
    /// Start time of the chunk, in seconds, when known.
    pub start: Option<f64>,
    /// Duration of media contained in the chunk, in seconds, when known.
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedChunk {
    Init(ParsedInitChunk),
    Media(ParsedMediaChunk),
}

impl ParsedChunk {
    /// Media duration carried by this chunk, used for network metrics.
    pub fn duration(&self) -> Option<f64> {
        match self {
            Self::Init(_) => None,
            Self::Media(media) => media.duration,
        }
    }
}
