use base64::Engine;
use serde::Serialize;

/// Default upper bound on decoded image size (10 MiB).
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

const DATA_URI_PREFIX: &str = "data:";
const BASE64_MARKER: &str = ";base64,";

const JPEG_SIGNATURE: &[u8] = &[0xFF, 0xD8, 0xFF];
const PNG_SIGNATURE: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const RIFF_SIGNATURE: &[u8] = b"RIFF";
const WEBP_FOURCC: &[u8] = b"WEBP";

/// Image types accepted for inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageMime {
    Jpeg,
    Png,
    Webp,
}

impl ImageMime {
    /// Resolve an allow-listed MIME type. `image/jpg` is accepted as an alias.
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/webp" => Some(Self::Webp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
        }
    }

    fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Jpeg => &["jpg", "jpeg"],
            Self::Png => &["png"],
            Self::Webp => &["webp"],
        }
    }

    /// Check the leading magic bytes for this type.
    pub fn signature_matches(&self, bytes: &[u8]) -> bool {
        match self {
            Self::Jpeg => bytes.starts_with(JPEG_SIGNATURE),
            Self::Png => bytes.starts_with(PNG_SIGNATURE),
            Self::Webp => {
                bytes.len() >= 12 && bytes.starts_with(RIFF_SIGNATURE) && &bytes[8..12] == WEBP_FOURCC
            }
        }
    }
}

/// Decoded image that passed every integrity check.
#[derive(Debug, Clone)]
pub struct ValidatedImage {
    pub mime: ImageMime,
    pub bytes: Vec<u8>,
}

impl ValidatedImage {
    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Image must be a base64 data URI (data:<mime>;base64,<payload>)")]
    InvalidDataFormat,

    #[error("Could not determine the image MIME type")]
    UnknownMimeType,

    #[error("Unsupported image type '{0}'; allowed types are JPEG, PNG and WEBP")]
    InvalidMimeType(String),

    #[error("File extension '.{extension}' does not match declared type {mime}")]
    ExtensionMismatch { extension: String, mime: String },

    #[error("Image is {size} bytes; the maximum is {max} bytes")]
    FileTooLarge { size: usize, max: usize },

    #[error("File contents do not match the {0} signature")]
    InvalidFileSignature(String),
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidDataFormat => "INVALID_DATA_FORMAT",
            Self::UnknownMimeType => "UNKNOWN_MIME_TYPE",
            Self::InvalidMimeType(_) => "INVALID_MIME_TYPE",
            Self::ExtensionMismatch { .. } => "EXTENSION_MISMATCH",
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::InvalidFileSignature(_) => "INVALID_FILE_SIGNATURE",
        }
    }
}

/// Integrity checks run before an image is spent on a paid inference call.
#[derive(Debug, Clone, Copy)]
pub struct ImageValidator {
    max_bytes: usize,
}

impl Default for ImageValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IMAGE_BYTES)
    }
}

impl ImageValidator {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Validate a data-URI image blob.
    ///
    /// Checks, in order, stopping at the first failure:
    /// - data URI wrapper with a base64 payload
    /// - MIME type present and allow-listed
    /// - filename extension consistent with the MIME type (when supplied)
    /// - decoded size within the configured maximum
    /// - leading bytes match the MIME type's file signature
    pub fn validate(
        &self,
        blob: &str,
        filename: Option<&str>,
    ) -> Result<ValidatedImage, ValidationError> {
        // ── Wrapper ──────────────────────────────────────────────────────
        let rest = blob
            .trim_start()
            .strip_prefix(DATA_URI_PREFIX)
            .ok_or(ValidationError::InvalidDataFormat)?;
        let (header, payload) = rest
            .split_once(BASE64_MARKER)
            .ok_or(ValidationError::InvalidDataFormat)?;

        // ── MIME type ────────────────────────────────────────────────────
        let declared = header
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match declared.split_once('/') {
            Some((kind, subtype)) if !kind.is_empty() && !subtype.is_empty() => {}
            _ => return Err(ValidationError::UnknownMimeType),
        }
        let mime = ImageMime::from_mime(&declared)
            .ok_or_else(|| ValidationError::InvalidMimeType(declared.clone()))?;

        // ── Extension consistency ────────────────────────────────────────
        if let Some(extension) = filename.and_then(file_extension) {
            if !mime.extensions().contains(&extension.as_str()) {
                return Err(ValidationError::ExtensionMismatch {
                    extension,
                    mime: mime.as_str().to_string(),
                });
            }
        }

        // ── Size ─────────────────────────────────────────────────────────
        // Reject on the base64 estimate first so oversized payloads are
        // never decoded.
        let payload: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        let estimated = estimated_decoded_len(&payload);
        if estimated > self.max_bytes {
            return Err(ValidationError::FileTooLarge {
                size: estimated,
                max: self.max_bytes,
            });
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload.as_bytes())
            .map_err(|_| ValidationError::InvalidDataFormat)?;
        if bytes.len() > self.max_bytes {
            return Err(ValidationError::FileTooLarge {
                size: bytes.len(),
                max: self.max_bytes,
            });
        }

        // ── File signature ───────────────────────────────────────────────
        if !mime.signature_matches(&bytes) {
            return Err(ValidationError::InvalidFileSignature(
                mime.as_str().to_string(),
            ));
        }

        Ok(ValidatedImage { mime, bytes })
    }
}

/// Lowercased extension of a filename, if it has one.
fn file_extension(filename: &str) -> Option<String> {
    let (stem, extension) = filename.trim().rsplit_once('.')?;
    if stem.is_empty() || extension.is_empty() {
        return None;
    }
    Some(extension.to_ascii_lowercase())
}

fn estimated_decoded_len(payload: &str) -> usize {
    let padding = payload.bytes().rev().take_while(|b| *b == b'=').count();
    (payload.len() / 4 * 3).saturating_sub(padding)
}

/// Decode a data URI held for a retry, such as a food record's pending photo.
///
/// Runs every check except the size cap and the filename, which were applied
/// when the photo was first accepted.
pub fn decode_data_uri(blob: &str) -> Result<ValidatedImage, ValidationError> {
    ImageValidator::new(usize::MAX).validate(blob, None)
}

/// Encode bytes as a data URI. Compressed photos are kept in this form until
/// their analysis succeeds.
pub fn to_data_uri(mime: ImageMime, bytes: &[u8]) -> String {
    format!(
        "{DATA_URI_PREFIX}{}{BASE64_MARKER}{}",
        mime.as_str(),
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg_bytes(len: usize) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];
        bytes.resize(len.max(bytes.len()), 0);
        bytes
    }

    fn png_bytes() -> Vec<u8> {
        let mut bytes = PNG_SIGNATURE.to_vec();
        bytes.extend_from_slice(&[0, 0, 0, 13, b'I', b'H', b'D', b'R']);
        bytes
    }

    fn webp_bytes() -> Vec<u8> {
        let mut bytes = b"RIFF".to_vec();
        bytes.extend_from_slice(&[0x24, 0, 0, 0]);
        bytes.extend_from_slice(b"WEBPVP8 ");
        bytes
    }

    #[test]
    fn test_valid_jpeg() {
        let validator = ImageValidator::default();
        let image = validator
            .validate(&to_data_uri(ImageMime::Jpeg, &jpeg_bytes(64)), Some("lunch.JPG"))
            .unwrap();
        assert_eq!(image.mime, ImageMime::Jpeg);
        assert_eq!(image.size_bytes(), 64);
    }

    #[test]
    fn test_valid_png_and_webp() {
        let validator = ImageValidator::default();
        assert!(validator
            .validate(&to_data_uri(ImageMime::Png, &png_bytes()), Some("plate.png"))
            .is_ok());
        assert!(validator
            .validate(&to_data_uri(ImageMime::Webp, &webp_bytes()), None)
            .is_ok());
    }

    #[test]
    fn test_jpg_alias_accepted() {
        let blob = format!(
            "data:image/jpg;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(jpeg_bytes(16))
        );
        let image = ImageValidator::default().validate(&blob, Some("a.jpeg")).unwrap();
        assert_eq!(image.mime, ImageMime::Jpeg);
    }

    #[test]
    fn test_decode_data_uri_ignores_size_cap() {
        let blob = to_data_uri(ImageMime::Jpeg, &jpeg_bytes(DEFAULT_MAX_IMAGE_BYTES + 16));
        let image = decode_data_uri(&blob).unwrap();
        assert_eq!(image.mime, ImageMime::Jpeg);
        assert_eq!(image.size_bytes(), DEFAULT_MAX_IMAGE_BYTES + 16);

        let err = decode_data_uri(&to_data_uri(ImageMime::Png, &jpeg_bytes(16))).unwrap_err();
        assert_eq!(err.code(), "INVALID_FILE_SIGNATURE");
    }

    #[test]
    fn test_missing_data_uri_prefix() {
        let err = ImageValidator::default()
            .validate("/9j/4AAQSkZJRgABAQ==", None)
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidDataFormat);
        assert_eq!(err.code(), "INVALID_DATA_FORMAT");
    }

    #[test]
    fn test_missing_base64_marker() {
        let err = ImageValidator::default()
            .validate("data:image/png,rawbytes", None)
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidDataFormat);
    }

    #[test]
    fn test_unknown_mime_type() {
        let err = ImageValidator::default()
            .validate("data:;base64,AAAA", None)
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_MIME_TYPE");

        let err = ImageValidator::default()
            .validate("data:image;base64,AAAA", None)
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_MIME_TYPE");
    }

    #[test]
    fn test_disallowed_mime_type() {
        let err = ImageValidator::default()
            .validate("data:image/gif;base64,R0lGODlh", None)
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidMimeType("image/gif".to_string()));
        assert_eq!(err.code(), "INVALID_MIME_TYPE");
    }

    #[test]
    fn test_extension_mismatch() {
        let err = ImageValidator::default()
            .validate(&to_data_uri(ImageMime::Jpeg, &jpeg_bytes(16)), Some("dinner.png"))
            .unwrap_err();
        assert_eq!(err.code(), "EXTENSION_MISMATCH");
    }

    #[test]
    fn test_filename_without_extension_is_not_checked() {
        assert!(ImageValidator::default()
            .validate(&to_data_uri(ImageMime::Jpeg, &jpeg_bytes(16)), Some("IMG_0042"))
            .is_ok());
    }

    #[test]
    fn test_file_too_large() {
        let validator = ImageValidator::new(1024);
        let err = validator
            .validate(&to_data_uri(ImageMime::Jpeg, &jpeg_bytes(2048)), None)
            .unwrap_err();
        assert!(matches!(err, ValidationError::FileTooLarge { max: 1024, .. }));
        assert_eq!(err.code(), "FILE_TOO_LARGE");
    }

    #[test]
    fn test_exactly_at_limit_passes() {
        let validator = ImageValidator::new(1024);
        assert!(validator
            .validate(&to_data_uri(ImageMime::Jpeg, &jpeg_bytes(1024)), None)
            .is_ok());
    }

    #[test]
    fn test_invalid_base64_payload() {
        let err = ImageValidator::default()
            .validate("data:image/jpeg;base64,@@@@", None)
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidDataFormat);
    }

    #[test]
    fn test_signature_mismatch_for_every_type() {
        let validator = ImageValidator::default();
        let cases = [
            (ImageMime::Jpeg, png_bytes()),
            (ImageMime::Png, jpeg_bytes(16)),
            (ImageMime::Webp, jpeg_bytes(16)),
            (ImageMime::Jpeg, b"GIF89a\x01\x00".to_vec()),
            (ImageMime::Png, vec![0x89, 0x50]),
        ];
        for (mime, bytes) in cases {
            let err = validator
                .validate(&to_data_uri(mime, &bytes), None)
                .unwrap_err();
            assert_eq!(err.code(), "INVALID_FILE_SIGNATURE", "{mime:?}");
        }
    }

    #[test]
    fn test_riff_without_webp_fourcc_rejected() {
        let mut bytes = b"RIFF".to_vec();
        bytes.extend_from_slice(&[0x24, 0, 0, 0]);
        bytes.extend_from_slice(b"WAVEfmt ");
        let err = ImageValidator::default()
            .validate(&to_data_uri(ImageMime::Webp, &bytes), None)
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_FILE_SIGNATURE");
    }

    #[test]
    fn test_checks_short_circuit_in_order() {
        // Bad extension and bad signature: extension is reported first.
        let err = ImageValidator::default()
            .validate(&to_data_uri(ImageMime::Png, &jpeg_bytes(16)), Some("x.jpg"))
            .unwrap_err();
        assert_eq!(err.code(), "EXTENSION_MISMATCH");
    }
}
