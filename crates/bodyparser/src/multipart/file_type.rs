//! File type detection for uploaded parts.
//!
//! Content sniffing against a table of magic numbers wins over the client file
//! name, unless the file name carries an extension no signature can confirm (a
//! `.json` or `.csv` upload for example). In that case the extension comes from
//! the file name and the type from the part's `Content-Type` header.

use http::HeaderMap;
use http::header::CONTENT_TYPE;
use mime::Mime;

/// Number of leading bytes content sniffing may look at.
pub const SNIFF_BYTES: usize = 4100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileType {
    pub ext: String,
    pub type_: String,
    pub subtype: String,
}

struct Signature {
    ext: &'static str,
    mime: &'static str,
    /// every `(offset, bytes)` pair must match
    magic: &'static [(usize, &'static [u8])],
}

const SIGNATURES: &[Signature] = &[
    Signature { ext: "png", mime: "image/png", magic: &[(0, b"\x89PNG\r\n\x1a\n")] },
    Signature { ext: "jpg", mime: "image/jpeg", magic: &[(0, b"\xff\xd8\xff")] },
    Signature { ext: "gif", mime: "image/gif", magic: &[(0, b"GIF8")] },
    Signature { ext: "webp", mime: "image/webp", magic: &[(0, b"RIFF"), (8, b"WEBP")] },
    Signature { ext: "wav", mime: "audio/vnd.wave", magic: &[(0, b"RIFF"), (8, b"WAVE")] },
    Signature { ext: "avi", mime: "video/vnd.avi", magic: &[(0, b"RIFF"), (8, b"AVI ")] },
    Signature { ext: "bmp", mime: "image/bmp", magic: &[(0, b"BM")] },
    Signature { ext: "tif", mime: "image/tiff", magic: &[(0, b"II*\x00")] },
    Signature { ext: "tif", mime: "image/tiff", magic: &[(0, b"MM\x00*")] },
    Signature { ext: "ico", mime: "image/x-icon", magic: &[(0, b"\x00\x00\x01\x00")] },
    Signature { ext: "psd", mime: "image/vnd.adobe.photoshop", magic: &[(0, b"8BPS")] },
    Signature { ext: "pdf", mime: "application/pdf", magic: &[(0, b"%PDF")] },
    Signature { ext: "zip", mime: "application/zip", magic: &[(0, b"PK\x03\x04")] },
    Signature { ext: "gz", mime: "application/gzip", magic: &[(0, b"\x1f\x8b\x08")] },
    Signature { ext: "bz2", mime: "application/x-bzip2", magic: &[(0, b"BZh")] },
    Signature { ext: "7z", mime: "application/x-7z-compressed", magic: &[(0, b"7z\xbc\xaf\x27\x1c")] },
    Signature { ext: "rar", mime: "application/x-rar-compressed", magic: &[(0, b"Rar!\x1a\x07")] },
    Signature { ext: "tar", mime: "application/x-tar", magic: &[(257, b"ustar")] },
    Signature { ext: "xz", mime: "application/x-xz", magic: &[(0, b"\xfd7zXZ\x00")] },
    Signature { ext: "wasm", mime: "application/wasm", magic: &[(0, b"\x00asm")] },
    Signature { ext: "mp3", mime: "audio/mpeg", magic: &[(0, b"ID3")] },
    Signature { ext: "flac", mime: "audio/x-flac", magic: &[(0, b"fLaC")] },
    Signature { ext: "ogg", mime: "audio/ogg", magic: &[(0, b"OggS")] },
    Signature { ext: "mp4", mime: "video/mp4", magic: &[(4, b"ftyp")] },
    Signature { ext: "webm", mime: "video/webm", magic: &[(0, b"\x1a\x45\xdf\xa3")] },
    Signature { ext: "woff", mime: "font/woff", magic: &[(0, b"wOFF")] },
    Signature { ext: "woff2", mime: "font/woff2", magic: &[(0, b"wOF2")] },
    Signature { ext: "ttf", mime: "font/ttf", magic: &[(0, b"\x00\x01\x00\x00\x00")] },
    Signature { ext: "otf", mime: "font/otf", magic: &[(0, b"OTTO")] },
    Signature { ext: "exe", mime: "application/x-msdownload", magic: &[(0, b"MZ")] },
    Signature { ext: "sqlite", mime: "application/x-sqlite3", magic: &[(0, b"SQLite format 3\x00")] },
];

impl Signature {
    fn matches(&self, buffer: &[u8]) -> bool {
        self.magic.iter().all(|(offset, bytes)| buffer.get(*offset..*offset + bytes.len()) == Some(*bytes))
    }
}

/// Extensions that content sniffing is able to confirm.
fn is_sniffable(ext: &str) -> bool {
    SIGNATURES.iter().any(|signature| signature.ext == ext)
}

/// Detects the type of a file from its first bytes and the client file name.
///
/// Returns `None` when the caller should retry with more bytes, or, in `force`
/// mode, when no extension can be determined at all.
pub fn detect(buffer: &[u8], client_name: &str, headers: &HeaderMap, force: bool) -> Option<FileType> {
    let name_ext = extname(client_name);

    if !name_ext.is_empty() && !is_sniffable(&name_ext) {
        return from_name(name_ext, headers);
    }

    if let Some(signature) = SIGNATURES.iter().find(|signature| signature.matches(buffer)) {
        let (type_, subtype) = signature.mime.split_once('/').unwrap_or((signature.mime, ""));
        return Some(FileType {
            ext: signature.ext.to_string(),
            type_: type_.to_string(),
            subtype: subtype.to_string(),
        });
    }

    if force || buffer.len() >= SNIFF_BYTES {
        return from_name(name_ext, headers);
    }

    None
}

fn from_name(ext: String, headers: &HeaderMap) -> Option<FileType> {
    if ext.is_empty() {
        return None;
    }

    let mime = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<Mime>().ok())
        .unwrap_or(mime::APPLICATION_OCTET_STREAM);

    Some(FileType { ext, type_: mime.type_().to_string(), subtype: mime.subtype().to_string() })
}

/// Lowercased extension of `name` without the leading dot, empty when there is none.
pub(crate) fn extname(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains(['/', '\\']) => ext.to_ascii_lowercase(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    #[test]
    fn test_detect_signature() {
        let png = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR";
        let file_type = detect(png, "avatar.png", &HeaderMap::new(), false).unwrap();
        assert_eq!(file_type, FileType { ext: "png".into(), type_: "image".into(), subtype: "png".into() });
    }

    #[test]
    fn test_content_wins_over_name() {
        let pdf = b"%PDF-1.7\n";
        let file_type = detect(pdf, "report.jpg", &HeaderMap::new(), false).unwrap();
        assert_eq!(file_type.ext, "pdf");
    }

    #[test]
    fn test_unsniffable_extension_uses_name() {
        let file_type = detect(b"{\"name\"", "package.JSON", &json_headers(), false).unwrap();
        assert_eq!(file_type, FileType { ext: "json".into(), type_: "application".into(), subtype: "json".into() });
    }

    #[test]
    fn test_retry_until_enough_bytes() {
        assert_eq!(detect(b"plain text", "notes", &HeaderMap::new(), false), None);
        assert_eq!(detect(b"plain text", "notes.png", &HeaderMap::new(), false), None);

        let forced = detect(b"plain text", "notes.png", &HeaderMap::new(), true).unwrap();
        assert_eq!(forced.ext, "png");
        assert_eq!(forced.type_, "application");
        assert_eq!(forced.subtype, "octet-stream");

        let full = vec![b'a'; SNIFF_BYTES];
        assert_eq!(detect(&full, "notes.png", &HeaderMap::new(), false).unwrap().ext, "png");
    }

    #[test]
    fn test_no_extension_at_all() {
        assert_eq!(detect(b"plain text", "notes", &HeaderMap::new(), true), None);
        assert_eq!(detect(b"", "", &HeaderMap::new(), true), None);
    }

    #[test]
    fn test_extname() {
        assert_eq!(extname("archive.tar.GZ"), "gz");
        assert_eq!(extname(".gitignore"), "");
        assert_eq!(extname("README"), "");
    }
}
