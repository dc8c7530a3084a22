//! Transcript fetch operations against YouTube.
//!
//! Every response is classified here, where the condition is visible:
//! pages that block or challenge the path are transient, videos that are
//! gone or have captions disabled are permanent.

use crate::error::{FetchFailure, InvalidVideoId, PermanentCause, TransientCause};
use crate::retry::FetchOperation;
use crate::session::AttemptContext;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::LazyLock;
use url::Url;

static VIDEO_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:youtube\.com/watch\?(?:.*&)?v=|youtu\.be/|youtube\.com/embed/|youtube\.com/v/|youtube\.com/shorts/)([A-Za-z0-9_-]{11})")
        .expect("valid video url regex")
});
static VIDEO_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("valid video id regex"));
static TEXT_NODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<text start="([0-9.]+)"(?: dur="([0-9.]+)")?[^>]*>(.*?)</text>"#)
        .expect("valid timed text regex")
});
static SRV3_NODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<p t="([0-9]+)"(?: d="([0-9]+)")?[^>]*>(.*?)</p>"#).expect("valid srv3 regex")
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));

const BLOCK_MARKERS: &[&str] = &[
    "g-recaptcha",
    "unusual traffic from your computer network",
    "Sign in to confirm you",
    "/sorry/index",
];

/// Extract the 11-character video id from a YouTube URL or a bare id.
pub fn extract_video_id(url_or_id: &str) -> Result<String, InvalidVideoId> {
    let input = url_or_id.trim();
    if let Some(caps) = VIDEO_URL.captures(input) {
        return Ok(caps[1].to_string());
    }
    if VIDEO_ID.is_match(input) {
        return Ok(input.to_string());
    }
    Err(InvalidVideoId(url_or_id.to_string()))
}

/// A caption track advertised by the watch page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CaptionTrack {
    #[serde(rename = "baseUrl")]
    pub base_url: String,
    #[serde(rename = "languageCode")]
    pub language_code: String,
    /// `Some("asr")` for auto-generated tracks.
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(rename = "isTranslatable", default)]
    pub is_translatable: bool,
}

impl CaptionTrack {
    pub fn is_generated(&self) -> bool {
        self.kind.as_deref() == Some("asr")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptSegment {
    pub text: String,
    pub start: f64,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcript {
    pub video_id: String,
    pub language: String,
    pub segments: Vec<TranscriptSegment>,
}

impl Transcript {
    /// All segment texts joined by single spaces.
    pub fn plain_text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// SubRip rendering, one numbered cue per segment.
    pub fn to_srt(&self) -> String {
        let mut out = String::new();
        for (i, s) in self.segments.iter().enumerate() {
            let _ = writeln!(
                out,
                "{}\n{} --> {}\n{}\n",
                i + 1,
                timestamp(s.start, ','),
                timestamp(s.start + s.duration, ','),
                s.text
            );
        }
        out
    }

    /// WebVTT rendering.
    pub fn to_vtt(&self) -> String {
        let mut out = String::from("WEBVTT\n\n");
        for s in &self.segments {
            let _ = writeln!(
                out,
                "{} --> {}\n{}\n",
                timestamp(s.start, '.'),
                timestamp(s.start + s.duration, '.'),
                s.text
            );
        }
        out
    }
}

/// `HH:MM:SS` followed by `sep` and milliseconds.
fn timestamp(seconds: f64, sep: char) -> String {
    let ms = (seconds.max(0.0) * 1000.0).round() as u64;
    format!(
        "{:02}:{:02}:{:02}{}{:03}",
        ms / 3_600_000,
        ms / 60_000 % 60,
        ms / 1000 % 60,
        sep,
        ms % 1000
    )
}

fn classify_status(status: StatusCode) -> Result<(), FetchFailure> {
    match status.as_u16() {
        200..=299 => Ok(()),
        404 | 410 => Err(PermanentCause::NotFound.into()),
        403 | 407 | 429 => Err(TransientCause::Blocked(format!("status {}", status.as_u16())).into()),
        code => Err(TransientCause::Status(code).into()),
    }
}

/// The player's verdict on whether the video plays for this path.
#[derive(Debug, Deserialize)]
struct Playability {
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Unplayable only from where the path exits.
const REGION_MARKERS: &[&str] = &["in your country", "in your region", "in your location"];

/// Unplayable from anywhere.
const GONE_MARKERS: &[&str] = &[
    "removed",
    "no longer available",
    "private",
    "deleted",
    "terminated",
    "does not exist",
];

fn classify_playability(playability: &Playability, block: &str) -> Result<(), FetchFailure> {
    let reason = playability.reason.as_deref().unwrap_or_default();
    let block = block.to_lowercase();
    let reason_lower = reason.to_lowercase();

    match playability.status.as_str() {
        "OK" => Ok(()),
        "UNPLAYABLE" if REGION_MARKERS.iter().any(|m| block.contains(m)) => {
            Err(TransientCause::Blocked("region restricted".into()).into())
        }
        "UNPLAYABLE" if !GONE_MARKERS.iter().any(|m| reason_lower.contains(m)) => {
            Err(TransientCause::Blocked(format!("unplayable: {}", reason)).into())
        }
        status @ ("ERROR" | "UNPLAYABLE" | "LOGIN_REQUIRED") => Err(PermanentCause::Unavailable(
            playability
                .reason
                .clone()
                .unwrap_or_else(|| status.to_lowercase()),
        )
        .into()),
        other => Err(TransientCause::Malformed(format!("playability {}", other)).into()),
    }
}

/// Slice out the JSON array or object following `"key":`, honouring strings and nesting.
fn json_block_after<'a>(page: &'a str, key: &str) -> Option<&'a str> {
    let marker = format!("\"{}\":", key);
    let start = page.find(&marker)? + marker.len();
    let body = &page[start..];
    if !body.starts_with(&['[', '{'][..]) {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&body[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Classify a watch page and return its caption tracks.
pub(crate) fn parse_watch_page(page: &str) -> Result<Vec<CaptionTrack>, FetchFailure> {
    if BLOCK_MARKERS.iter().any(|m| page.contains(m)) {
        return Err(TransientCause::Blocked("bot check".into()).into());
    }

    let Some(block) = json_block_after(page, "playabilityStatus") else {
        return Err(TransientCause::Malformed("no player response".into()).into());
    };
    let playability: Playability = serde_json::from_str(block)
        .map_err(|e| TransientCause::Malformed(format!("playability: {}", e)))?;
    classify_playability(&playability, block)?;

    let Some(raw) = json_block_after(page, "captionTracks") else {
        return Err(PermanentCause::Disabled.into());
    };
    let tracks: Vec<CaptionTrack> = serde_json::from_str(raw)
        .map_err(|e| TransientCause::Malformed(format!("caption tracks: {}", e)))?;
    if tracks.is_empty() {
        return Err(PermanentCause::Disabled.into());
    }
    Ok(tracks)
}

/// Decode the HTML entities YouTube uses in timed text (often escaped twice).
fn decode_entities(text: &str) -> String {
    let mut out = text.to_string();
    for _ in 0..2 {
        if !out.contains('&') {
            break;
        }
        out = decode_once(&out);
    }
    out
}

fn decode_once(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(at) = rest.find('&') {
        out.push_str(&rest[..at]);
        rest = &rest[at..];
        let decoded = rest.find(';').filter(|end| *end <= 10).and_then(|end| {
            let entity = &rest[1..end];
            let c = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity
                    .strip_prefix("#x")
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            };
            c.map(|c| (c, end))
        });
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Segments matched by `node`, with its start and duration groups divided by `per_second`.
fn segments_from(node: &Regex, xml: &str, per_second: f64) -> Vec<TranscriptSegment> {
    node.captures_iter(xml)
        .filter_map(|caps| {
            let start = caps[1].parse::<f64>().ok()? / per_second;
            let duration = caps
                .get(2)
                .and_then(|d| d.as_str().parse::<f64>().ok())
                .map_or(0.0, |d| d / per_second);
            let text = decode_entities(&TAG.replace_all(&caps[3], ""))
                .replace('\n', " ")
                .trim()
                .to_string();
            (!text.is_empty()).then_some(TranscriptSegment { text, start, duration })
        })
        .collect()
}

/// Parse timed-text XML into transcript segments.
///
/// Accepts the classic `<transcript><text start dur>` layout (seconds) and
/// the `srv3` `<timedtext><body><p t d>` layout (milliseconds).
pub(crate) fn parse_timed_text(xml: &str) -> Result<Vec<TranscriptSegment>, FetchFailure> {
    if xml.trim().is_empty() {
        return Err(TransientCause::Blocked("empty timed text".into()).into());
    }
    if xml.contains("<transcript") {
        return Ok(segments_from(&TEXT_NODE, xml, 1.0));
    }
    if xml.contains("<timedtext") {
        return Ok(segments_from(&SRV3_NODE, xml, 1000.0));
    }
    Err(TransientCause::Malformed("unrecognised timed text".into()).into())
}

/// Timed-text URL for a track: the default XML layout, optionally machine-translated.
fn timed_text_url(base_url: &str, translate_to: Option<&str>) -> String {
    let Ok(mut url) = Url::parse(base_url) else {
        return base_url.to_string();
    };
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !matches!(k.as_ref(), "fmt" | "tlang"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut query = url.query_pairs_mut();
        query.clear().extend_pairs(pairs);
        if let Some(lang) = translate_to {
            query.append_pair("tlang", lang);
        }
    }
    url.into()
}

/// A caption track picked for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackChoice<'a> {
    pub track: &'a CaptionTrack,
    /// Set when the track is translated on the fly into the requested language.
    pub translate_to: Option<&'a str>,
}

impl TrackChoice<'_> {
    /// Language of the transcript this choice yields.
    pub fn language(&self) -> &str {
        self.translate_to.unwrap_or(&self.track.language_code)
    }

    pub fn timed_text_url(&self) -> String {
        timed_text_url(&self.track.base_url, self.translate_to)
    }
}

/// Pick the requested language, else a translatable track translated into it,
/// else English, else the first listed track.
pub fn select_track<'a>(tracks: &'a [CaptionTrack], language: Option<&'a str>) -> Option<TrackChoice<'a>> {
    let by_lang = |lang: &str| {
        tracks
            .iter()
            .filter(|t| t.language_code == lang)
            .min_by_key(|t| t.is_generated())
    };
    let as_is = |track: &'a CaptionTrack| TrackChoice { track, translate_to: None };

    if let Some(lang) = language {
        if let Some(track) = by_lang(lang) {
            return Some(as_is(track));
        }
        if let Some(track) = tracks.iter().find(|t| t.is_translatable) {
            return Some(TrackChoice {
                track,
                translate_to: Some(lang),
            });
        }
    }
    by_lang("en").or_else(|| tracks.first()).map(as_is)
}

async fn fetch_caption_tracks(ctx: &AttemptContext, video_id: &str) -> Result<Vec<CaptionTrack>, FetchFailure> {
    let url = format!("https://www.youtube.com/watch?v={}&hl=en", video_id);
    let response = ctx.client().get(&url).send().await?;
    classify_status(response.status())?;
    let page = response.text().await?;
    parse_watch_page(&page)
}

/// Lists the caption tracks of a video.
#[derive(Debug, Clone)]
pub struct CaptionTrackProbe {
    video_id: String,
}

impl CaptionTrackProbe {
    pub fn new(video_id: impl Into<String>) -> Self {
        Self { video_id: video_id.into() }
    }
}

#[async_trait]
impl FetchOperation for CaptionTrackProbe {
    type Output = Vec<CaptionTrack>;

    async fn execute(&self, ctx: &AttemptContext) -> Result<Vec<CaptionTrack>, FetchFailure> {
        fetch_caption_tracks(ctx, &self.video_id).await
    }
}

/// Fetches the transcript of a video in the preferred language.
/// Also used, on a known-good video, as the proxy validation target.
#[derive(Debug, Clone)]
pub struct TranscriptFetch {
    video_id: String,
    language: Option<String>,
}

impl TranscriptFetch {
    /// `url_or_id` may be any YouTube video URL or a bare video id.
    pub fn new(url_or_id: &str, language: Option<String>) -> Result<Self, InvalidVideoId> {
        Ok(Self {
            video_id: extract_video_id(url_or_id)?,
            language,
        })
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }
}

#[async_trait]
impl FetchOperation for TranscriptFetch {
    type Output = Transcript;

    async fn execute(&self, ctx: &AttemptContext) -> Result<Transcript, FetchFailure> {
        let tracks = fetch_caption_tracks(ctx, &self.video_id).await?;
        let choice = select_track(&tracks, self.language.as_deref()).ok_or(PermanentCause::NoResult)?;

        let response = ctx.client().get(choice.timed_text_url()).send().await?;
        classify_status(response.status())?;
        let xml = response.text().await?;
        let segments = parse_timed_text(&xml)?;
        if segments.is_empty() {
            return Err(PermanentCause::NoResult.into());
        }

        Ok(Transcript {
            video_id: self.video_id.clone(),
            language: choice.language().to_string(),
            segments,
        })
    }
}
