//! Reference byte-level heuristics for the local-compute layers.
//!
//! These are deliberately simple scans over the container structure. They
//! exist so the engine runs end to end out of the box; deployments are
//! expected to plug in their own [`ImageHeuristic`] implementations.

use serde_json::json;

use super::local::ImageHeuristic;
use super::{LayerError, LayerFindings, LayerResult};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const EXIF_HEADER: &[u8] = b"Exif\0\0";
const JPEG_DQT: [u8; 2] = [0xFF, 0xDB];

/// Editing tools whose signature in the metadata counts against a document.
const EDITING_SIGNATURES: &[&str] = &["photoshop", "gimp", "pixlr", "paint.net", "canva"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageFormat {
    Jpeg,
    Png,
}

fn sniff(image: &[u8]) -> Option<ImageFormat> {
    if image.starts_with(&JPEG_SOI) {
        Some(ImageFormat::Jpeg)
    } else if image.starts_with(&PNG_MAGIC) {
        Some(ImageFormat::Png)
    } else {
        None
    }
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    if needle.is_empty() || haystack.len() < needle.len() {
        return 0;
    }
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

/// Scans image metadata for a missing EXIF segment and editing-software
/// signatures. Starts from 20 and subtracts penalties.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExifMarkerHeuristic;

impl ExifMarkerHeuristic {
    pub const BASE_SCORE: f64 = 20.0;
    pub const MISSING_EXIF_PENALTY: f64 = 8.0;
    pub const EDITOR_PENALTY: f64 = 10.0;
}

impl ImageHeuristic for ExifMarkerHeuristic {
    fn name(&self) -> &'static str {
        "exif_markers"
    }

    fn evaluate(&self, image: &[u8]) -> LayerResult<LayerFindings> {
        let format = sniff(image).ok_or_else(|| {
            LayerError::UnsupportedInput("unrecognized image container".to_string())
        })?;

        let mut score = Self::BASE_SCORE;
        let mut findings = LayerFindings::default();

        let has_exif = match format {
            ImageFormat::Jpeg => count_occurrences(image, EXIF_HEADER) > 0,
            ImageFormat::Png => count_occurrences(image, b"eXIf") > 0,
        };
        if !has_exif {
            score -= Self::MISSING_EXIF_PENALTY;
            findings = findings.with_flag("exif_missing");
        }

        let lowered = image.to_ascii_lowercase();
        let editors: Vec<&str> = EDITING_SIGNATURES
            .iter()
            .copied()
            .filter(|sig| count_occurrences(&lowered, sig.as_bytes()) > 0)
            .collect();
        for editor in &editors {
            score -= Self::EDITOR_PENALTY;
            findings = findings.with_flag(format!("edited_with:{editor}"));
        }

        findings.score = score;
        Ok(findings.with_details(json!({
            "format": format!("{format:?}").to_lowercase(),
            "has_exif": has_exif,
            "editing_software": editors,
        })))
    }
}

/// Looks for JPEG re-compression traces: repeated quantization tables and
/// embedded start-of-image markers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecompressionHeuristic;

impl RecompressionHeuristic {
    pub const BASE_SCORE: f64 = 20.0;
    /// Score for containers the scan does not understand.
    pub const NOT_APPLICABLE_SCORE: f64 = 10.0;
    pub const EXTRA_TABLES_PENALTY: f64 = 6.0;
    pub const EMBEDDED_IMAGE_PENALTY: f64 = 8.0;
    /// A single-pass encoder writes at most luma and chroma tables.
    pub const EXPECTED_TABLES: usize = 2;
}

impl ImageHeuristic for RecompressionHeuristic {
    fn name(&self) -> &'static str {
        "recompression"
    }

    fn evaluate(&self, image: &[u8]) -> LayerResult<LayerFindings> {
        if image.is_empty() {
            return Err(LayerError::UnsupportedInput("empty image".to_string()));
        }
        if sniff(image) != Some(ImageFormat::Jpeg) {
            return Ok(LayerFindings::new(Self::NOT_APPLICABLE_SCORE)
                .with_flag("ela_not_applicable"));
        }

        let mut findings = LayerFindings::new(Self::BASE_SCORE);
        let tables = count_occurrences(image, &JPEG_DQT);
        if tables > Self::EXPECTED_TABLES {
            findings.score -= Self::EXTRA_TABLES_PENALTY;
            findings = findings.with_flag("multiple_quantization_tables");
        }

        // The leading SOI is expected; any other hints at a pasted image.
        let embedded = count_occurrences(&image[JPEG_SOI.len()..], &[0xFF, 0xD8, 0xFF]);
        if embedded > 0 {
            findings.score -= Self::EMBEDDED_IMAGE_PENALTY;
            findings = findings.with_flag("embedded_image");
        }

        Ok(findings.with_details(json!({
            "quantization_tables": tables,
            "embedded_images": embedded,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE1];
        bytes.extend_from_slice(body);
        bytes.extend_from_slice(&[0xFF, 0xD9]);
        bytes
    }

    #[test]
    fn test_clean_jpeg_keeps_full_exif_score() {
        let image = jpeg(b"Exif\0\0camera-model");
        let findings = ExifMarkerHeuristic.evaluate(&image).unwrap();
        assert_eq!(findings.score, 20.0);
        assert!(findings.flags.is_empty());
    }

    #[test]
    fn test_missing_exif_and_editor_signature_penalized() {
        let image = jpeg(b"Adobe Photoshop CS6");
        let findings = ExifMarkerHeuristic.evaluate(&image).unwrap();
        assert_eq!(findings.score, 20.0 - 8.0 - 10.0);
        assert!(findings.flags.contains(&"exif_missing".to_string()));
        assert!(findings.flags.contains(&"edited_with:photoshop".to_string()));
    }

    #[test]
    fn test_multiple_editors_can_drive_score_negative() {
        let image = jpeg(b"gimp pixlr canva");
        let findings = ExifMarkerHeuristic.evaluate(&image).unwrap();
        assert!(findings.score < 0.0);
    }

    #[test]
    fn test_unknown_container_is_an_error() {
        assert!(ExifMarkerHeuristic.evaluate(b"GIF89a").is_err());
    }

    #[test]
    fn test_recompression_detects_extra_tables() {
        let mut body = Vec::new();
        for _ in 0..4 {
            body.extend_from_slice(&JPEG_DQT);
            body.extend_from_slice(&[0x00, 0x43]);
        }
        let findings = RecompressionHeuristic.evaluate(&jpeg(&body)).unwrap();
        assert_eq!(findings.score, 14.0);
        assert_eq!(findings.flags, vec!["multiple_quantization_tables"]);
    }

    #[test]
    fn test_recompression_not_applicable_for_png() {
        let mut png = PNG_MAGIC.to_vec();
        png.extend_from_slice(b"IHDR");
        let findings = RecompressionHeuristic.evaluate(&png).unwrap();
        assert_eq!(findings.score, RecompressionHeuristic::NOT_APPLICABLE_SCORE);
    }
}
