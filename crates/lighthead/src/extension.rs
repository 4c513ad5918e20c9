//! File extension resolution for binary payloads

use url::Url;

/// Fallback extension when nothing else matches
pub const DEFAULT_EXTENSION: &str = ".bin";

/// Known content types and their extensions
const CONTENT_TYPE_EXTENSIONS: &[(&str, &str)] = &[
    ("image/jpeg", ".jpg"),
    ("image/png", ".png"),
    ("image/gif", ".gif"),
    ("image/webp", ".webp"),
    ("application/pdf", ".pdf"),
    ("application/zip", ".zip"),
    ("text/plain", ".txt"),
    ("application/json", ".json"),
];

/// Pick a file extension (with leading dot) for a payload
///
/// The URL path's extension wins over the content type, even when the two
/// disagree.
pub fn resolve_extension(url: &str, content_type: &str) -> String {
    if let Some(ext) = Url::parse(url).ok().and_then(|u| path_extension(&u)) {
        return ext;
    }

    extension_for_content_type(content_type)
        .unwrap_or(DEFAULT_EXTENSION)
        .to_string()
}

/// Look up the extension for a content type, ignoring parameters
pub fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    CONTENT_TYPE_EXTENSIONS
        .iter()
        .find(|(known, _)| *known == mime)
        .map(|(_, ext)| *ext)
}

/// Reverse lookup used when a download only tells us its filename
pub fn content_type_for_filename(filename: &str) -> Option<&'static str> {
    let ext = filename_extension(filename)?;
    CONTENT_TYPE_EXTENSIONS
        .iter()
        .find(|(_, known)| *known == ext)
        .map(|(mime, _)| *mime)
        .or(match ext.as_str() {
            ".jpeg" => Some("image/jpeg"),
            _ => None,
        })
}

fn path_extension(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    filename_extension(segment)
}

fn filename_extension(name: &str) -> Option<String> {
    let dot = name.rfind('.')?;
    if dot == 0 || dot + 1 >= name.len() {
        return None;
    }
    Some(name[dot..].to_lowercase())
}
