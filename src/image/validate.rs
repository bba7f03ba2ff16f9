//! Defensive checks on untrusted upload bytes.
//!
//! Three independent checks run before any full decode:
//! 1. size, enforced incrementally while the upload is read in bounded chunks
//! 2. type, sniffed from the leading magic bytes and matched against the allow-list
//! 3. dimensions, read from the image header only

use std::io::{Cursor, ErrorKind, Read};

use image::ImageReader;

use crate::error::{Error, Result};

use super::MediaType;

/// Default maximum upload size (10 MiB).
pub const DEFAULT_MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

/// Default maximum accepted width or height in pixels.
pub const DEFAULT_MAX_DIMENSION: u32 = 4096;

/// Default chunk size for incremental upload reads.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Limits applied by [`validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationLimits {
    /// Maximum upload size in bytes.
    pub max_file_size: usize,
    /// Maximum width and height in pixels.
    pub max_dimension: u32,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }
}

/// What the validator learned about an accepted upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedImage {
    pub media_type: MediaType,
    pub width: u32,
    pub height: u32,
}

/// Running byte count for an upload arriving in chunks.
#[derive(Debug, Clone)]
pub struct SizeGuard {
    limit: usize,
    received: usize,
}

impl SizeGuard {
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self { limit, received: 0 }
    }

    /// Account for `len` more bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PayloadTooLarge`] as soon as the running total
    /// passes the limit.
    pub fn push(&mut self, len: usize) -> Result<()> {
        self.received = self.received.saturating_add(len);
        if self.received > self.limit {
            return Err(Error::PayloadTooLarge {
                received: self.received,
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// Bytes accepted so far.
    #[must_use]
    pub const fn received(&self) -> usize {
        self.received
    }
}

/// Read an upload in chunks of `chunk_size`, aborting once it exceeds `limit`.
///
/// At most one chunk past the limit is ever read from `reader`, and the read
/// buffer never exceeds `limit + 1` bytes whatever `chunk_size` is.
///
/// # Errors
///
/// Returns [`Error::PayloadTooLarge`] on the first chunk that crosses the
/// limit, or [`Error::UploadRead`] if the reader fails.
pub fn read_limited<R: Read>(mut reader: R, limit: usize, chunk_size: usize) -> Result<Vec<u8>> {
    let mut guard = SizeGuard::new(limit);
    let mut buffer = vec![0u8; chunk_size.clamp(1, limit.saturating_add(1))];
    let mut contents = Vec::new();

    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(source) => return Err(Error::UploadRead { source }),
        };
        guard.push(bytes_read)?;
        contents.extend_from_slice(&buffer[..bytes_read]);
    }

    Ok(contents)
}

/// Reject a fully buffered payload larger than `limit`.
///
/// # Errors
///
/// Returns [`Error::PayloadTooLarge`] if `bytes` is over the limit.
pub fn check_size(bytes: &[u8], limit: usize) -> Result<()> {
    SizeGuard::new(limit).push(bytes.len())
}

/// Determine the real type of `bytes` from its magic numbers.
///
/// # Errors
///
/// Returns [`Error::UnsupportedMediaType`] unless the signature is JPEG or PNG.
pub fn sniff_media_type(bytes: &[u8]) -> Result<MediaType> {
    match image::guess_format(bytes) {
        Ok(format) => MediaType::from_format(format).ok_or_else(|| Error::UnsupportedMediaType {
            detected: format.to_mime_type().to_string(),
        }),
        Err(_) => Err(Error::UnsupportedMediaType {
            detected: "unknown".to_string(),
        }),
    }
}

/// Check a client-declared content type against the allow-list.
///
/// # Errors
///
/// Returns [`Error::UnsupportedMediaType`] if the declared type is not allowed.
pub fn check_declared_type(declared: &str) -> Result<MediaType> {
    MediaType::from_mime(declared).ok_or_else(|| Error::UnsupportedMediaType {
        detected: declared.to_string(),
    })
}

/// Read width and height from the image header without decoding pixels.
///
/// # Errors
///
/// Returns [`Error::InvalidImage`] if the header cannot be parsed.
pub fn read_dimensions(bytes: &[u8], media_type: MediaType) -> Result<(u32, u32)> {
    ImageReader::with_format(Cursor::new(bytes), media_type.format())
        .into_dimensions()
        .map_err(|source| Error::InvalidImage {
            reason: format!("cannot read {} header", media_type.name()),
            source: Some(source),
        })
}

/// Reject images wider or taller than `max` pixels.
///
/// # Errors
///
/// Returns [`Error::DimensionTooLarge`] if either side is over the limit.
pub fn check_dimensions(width: u32, height: u32, max: u32) -> Result<()> {
    if width > max || height > max {
        return Err(Error::DimensionTooLarge { width, height, max });
    }
    Ok(())
}

/// Run the size, type, and dimension checks in order.
///
/// # Errors
///
/// Returns the first failing check's error; nothing is decoded past the header.
pub fn validate(bytes: &[u8], limits: &ValidationLimits) -> Result<ValidatedImage> {
    check_size(bytes, limits.max_file_size)?;
    let media_type = sniff_media_type(bytes)?;
    let (width, height) = read_dimensions(bytes, media_type)?;
    check_dimensions(width, height, limits.max_dimension)?;

    Ok(ValidatedImage {
        media_type,
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use image::ImageFormat;

    use super::*;
    use crate::image::test_support::{encoded_gray_png, encoded_rgb};

    /// Reader that counts how many bytes were handed out.
    struct CountingReader {
        remaining: usize,
        served: usize,
    }

    impl Read for CountingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.remaining);
            buf[..n].fill(0xAB);
            self.remaining -= n;
            self.served += n;
            Ok(n)
        }
    }

    #[test]
    fn test_size_guard_accepts_exact_limit() {
        let mut guard = SizeGuard::new(10);
        guard.push(4).unwrap();
        guard.push(6).unwrap();
        assert_eq!(guard.received(), 10);
        assert!(matches!(
            guard.push(1),
            Err(Error::PayloadTooLarge { received: 11, limit: 10 })
        ));
    }

    #[test]
    fn test_read_limited_stops_early() {
        let limit = 64 * 1024;
        let mut reader = CountingReader {
            remaining: 50 * 1024 * 1024,
            served: 0,
        };

        let result = read_limited(&mut reader, limit, DEFAULT_CHUNK_SIZE);

        assert!(matches!(result, Err(Error::PayloadTooLarge { .. })));
        assert!(reader.served <= limit + DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_read_limited_reads_small_payload() {
        let payload = vec![7u8; 20_000];
        let contents = read_limited(payload.as_slice(), 20_000, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(contents, payload);
    }

    #[test]
    fn test_read_limited_caps_buffer_to_limit() {
        let payload = vec![3u8; 512];

        // A chunk size this large would abort on allocation if used as-is.
        let contents = read_limited(payload.as_slice(), 1024, usize::MAX).unwrap();
        assert_eq!(contents, payload);

        let oversized = vec![3u8; 2048];
        assert!(matches!(
            read_limited(oversized.as_slice(), 1024, usize::MAX),
            Err(Error::PayloadTooLarge { limit: 1024, .. })
        ));
    }

    #[test]
    fn test_check_size_rejects_oversized_payload() {
        let payload = vec![0u8; 101];
        assert!(matches!(
            check_size(&payload, 100),
            Err(Error::PayloadTooLarge { .. })
        ));
        assert!(check_size(&payload[..100], 100).is_ok());
    }

    #[test]
    fn test_sniff_ignores_claimed_type() {
        let text = b"not an image, whatever the header says";
        assert!(matches!(
            sniff_media_type(text),
            Err(Error::UnsupportedMediaType { .. })
        ));

        // GIF signature is recognised but not allowed.
        let gif = b"GIF89a\x01\x00\x01\x00\x00\x00\x00";
        match sniff_media_type(gif) {
            Err(Error::UnsupportedMediaType { detected }) => assert_eq!(detected, "image/gif"),
            other => panic!("expected UnsupportedMediaType, got {other:?}"),
        }
    }

    #[test]
    fn test_sniff_detects_png_and_jpeg() {
        let png = encoded_rgb(8, 8, [10, 20, 30], ImageFormat::Png);
        let jpeg = encoded_rgb(8, 8, [10, 20, 30], ImageFormat::Jpeg);
        assert_eq!(sniff_media_type(&png).unwrap(), MediaType::Png);
        assert_eq!(sniff_media_type(&jpeg).unwrap(), MediaType::Jpeg);
    }

    #[test]
    fn test_check_declared_type() {
        assert_eq!(check_declared_type("image/jpeg").unwrap(), MediaType::Jpeg);
        assert!(matches!(
            check_declared_type("text/plain"),
            Err(Error::UnsupportedMediaType { .. })
        ));
    }

    #[test]
    fn test_validate_reports_dimensions() {
        let png = encoded_rgb(40, 30, [0, 0, 0], ImageFormat::Png);
        let validated = validate(&png, &ValidationLimits::default()).unwrap();
        assert_eq!(
            validated,
            ValidatedImage {
                media_type: MediaType::Png,
                width: 40,
                height: 30,
            }
        );
    }

    #[test]
    fn test_validate_dimension_boundary() {
        let limits = ValidationLimits::default();

        let at_limit = encoded_gray_png(4096, 4096);
        let validated = validate(&at_limit, &limits).unwrap();
        assert_eq!((validated.width, validated.height), (4096, 4096));

        let too_wide = encoded_gray_png(4097, 1);
        assert!(matches!(
            validate(&too_wide, &limits),
            Err(Error::DimensionTooLarge { width: 4097, height: 1, max: 4096 })
        ));

        let too_tall = encoded_gray_png(1, 4097);
        assert!(matches!(
            validate(&too_tall, &limits),
            Err(Error::DimensionTooLarge { .. })
        ));
    }

    #[test]
    fn test_validate_truncated_image() {
        let png = encoded_rgb(16, 16, [1, 2, 3], ImageFormat::Png);
        let truncated = &png[..12];
        assert!(matches!(
            validate(truncated, &ValidationLimits::default()),
            Err(Error::InvalidImage { .. })
        ));
    }

    #[test]
    fn test_validate_checks_size_before_type() {
        let limits = ValidationLimits {
            max_file_size: 4,
            ..ValidationLimits::default()
        };
        assert!(matches!(
            validate(b"definitely not an image", &limits),
            Err(Error::PayloadTooLarge { .. })
        ));
    }
}
