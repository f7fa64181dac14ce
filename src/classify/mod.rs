//! Maps a candidate URL plus optional content-type evidence to a media
//! kind and a file extension.
//!
//! Collaborators may annotate a URL with a `#content-type=<mime>` fragment
//! to carry a hint the page itself could not express; the fragment is
//! honored here and stripped before the URL is fetched.

use url::Url;

use crate::model::AssetKind;

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "webm", "mkv", "avi", "mov", "flv", "m4v", "mpg", "mpeg", "ts",
];
const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "svg", "bmp", "tiff", "ico",
];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "flac", "aac", "m4a", "wma"];
const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "txt", "rtf", "csv",
];

/// Result of classifying a candidate URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: AssetKind,
    /// Extension including the leading dot.
    pub extension: String,
}

/// Read a `#content-type=<mime>` annotation from a URL fragment.
pub fn content_type_hint(url: &Url) -> Option<String> {
    url.fragment()
        .and_then(|f| f.strip_prefix("content-type="))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Strip the hint fragment so it never reaches the network.
pub fn strip_hint(url: &Url) -> Url {
    let mut clean = url.clone();
    if content_type_hint(url).is_some() {
        clean.set_fragment(None);
    }
    clean
}

/// Classify a URL. `content_type` is the served `Content-Type` when the
/// response has already been observed; when absent, a fragment annotation
/// stands in for it.
pub fn classify(url: &Url, content_type: Option<&str>) -> Classification {
    let hint = content_type_hint(url);
    let effective_type = content_type
        .map(str::to_string)
        .or(hint)
        .map(|t| t.to_ascii_lowercase());

    if let Some(ct) = effective_type.as_deref() {
        if let Some(kind) = kind_from_content_type(ct) {
            return Classification {
                extension: extension_for(url, kind),
                kind,
            };
        }
    }

    if let Some(ext) = path_extension(url) {
        if let Some(kind) = kind_from_extension(&ext) {
            return Classification {
                extension: format!(".{ext}"),
                kind,
            };
        }
    }

    let kind = kind_from_url_heuristics(url);
    Classification {
        extension: extension_for(url, kind),
        kind,
    }
}

/// Pick an extension: the URL path's own extension when it has one, else
/// the default for the kind.
pub fn extension_for(url: &Url, kind: AssetKind) -> String {
    if let Some(ext) = path_extension(url) {
        return format!(".{ext}");
    }
    default_extension(kind).to_string()
}

pub fn default_extension(kind: AssetKind) -> &'static str {
    match kind {
        AssetKind::Video => ".mp4",
        AssetKind::Image => ".jpg",
        AssetKind::Audio => ".mp3",
        AssetKind::Document => ".txt",
        AssetKind::Unknown => ".bin",
    }
}

/// Classify a served content type on its own (used when re-inspecting a
/// finished download). Parameters like `; charset=utf-8` are ignored.
pub fn kind_from_content_type(content_type: &str) -> Option<AssetKind> {
    let media: mime::Mime = content_type.trim().parse().ok()?;

    if media.type_() == mime::VIDEO {
        Some(AssetKind::Video)
    } else if media.type_() == mime::AUDIO {
        Some(AssetKind::Audio)
    } else if media.type_() == mime::IMAGE {
        Some(AssetKind::Image)
    } else if media.type_() == mime::TEXT {
        Some(AssetKind::Document)
    } else if media.type_() == mime::APPLICATION
        && (media.subtype() == mime::PDF || media.subtype() == mime::JSON)
    {
        Some(AssetKind::Document)
    } else {
        None
    }
}

fn kind_from_extension(ext: &str) -> Option<AssetKind> {
    if VIDEO_EXTENSIONS.contains(&ext) {
        Some(AssetKind::Video)
    } else if IMAGE_EXTENSIONS.contains(&ext) {
        Some(AssetKind::Image)
    } else if AUDIO_EXTENSIONS.contains(&ext) {
        Some(AssetKind::Audio)
    } else if DOCUMENT_EXTENSIONS.contains(&ext) {
        Some(AssetKind::Document)
    } else {
        None
    }
}

fn kind_from_url_heuristics(url: &Url) -> AssetKind {
    let text = url.as_str().to_ascii_lowercase();
    let contains_any =
        |needles: &[&str]| needles.iter().any(|needle| text.contains(needle));

    if contains_any(&["video", "movie", "watch", "stream", "/mp4"]) {
        AssetKind::Video
    } else if contains_any(&["image", "photo", "pic"]) {
        AssetKind::Image
    } else if contains_any(&["audio", "music", "sound"]) {
        AssetKind::Audio
    } else if contains_any(&["doc", "pdf", "file", "/api/"]) {
        AssetKind::Document
    } else {
        AssetKind::Unknown
    }
}

fn path_extension(url: &Url) -> Option<String> {
    let path = url.path();
    let name = path.rsplit('/').next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 5 {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
