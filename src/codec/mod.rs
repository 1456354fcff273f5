//! Content codecs and encoding negotiation.
//!
//! # Responsibilities
//! - Name the closed set of supported codecs
//! - Parse q-weighted `Accept-Encoding` lists and pick the best
//!   mutually supported codec
//! - Wrap entity streams in compressing/decompressing transform
//!   adapters
//!
//! # Design Decisions
//! - `Codec` is a closed enum, so negotiation logic is exhaustively
//!   checked at compile time; adding a codec means adding a variant

mod compressor;

pub use compressor::{Compressor, Decompressor};

use crate::error::Error;
use crate::stream::bridge::transform_stream;
use crate::stream::EntityStream;

/// One of the supported content codings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    Deflate,
    Bzip2,
    Snappy,
    /// No transformation; the passthrough coding.
    Identity,
}

impl Codec {
    /// Wire name used in `Accept-Encoding` / `Content-Encoding`.
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Gzip => "gzip",
            Codec::Deflate => "deflate",
            Codec::Bzip2 => "bzip2",
            Codec::Snappy => "x-snappy-framed",
            Codec::Identity => "identity",
        }
    }

    pub fn from_name(name: &str) -> Option<Codec> {
        match name.to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Codec::Gzip),
            "deflate" => Some(Codec::Deflate),
            "bzip2" => Some(Codec::Bzip2),
            "x-snappy-framed" | "snappy" => Some(Codec::Snappy),
            "identity" => Some(Codec::Identity),
            _ => None,
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One parsed `Accept-Encoding` entry.
#[derive(Debug, Clone, PartialEq)]
struct AcceptEntry {
    name: String,
    quality: f32,
}

fn parse_accept_encoding(header: &str) -> Result<Vec<AcceptEntry>, Error> {
    let mut entries = Vec::new();
    for part in header.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut pieces = part.split(';');
        let name = pieces
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let mut quality = 1.0f32;
        for param in pieces {
            let param = param.trim();
            if let Some(value) = param.strip_prefix("q=").or_else(|| param.strip_prefix("Q=")) {
                quality = value.trim().parse::<f32>().map_err(|_| {
                    Error::NotAcceptable(format!("malformed quality value in '{part}'"))
                })?;
                if !(0.0..=1.0).contains(&quality) {
                    return Err(Error::NotAcceptable(format!(
                        "quality out of range in '{part}'"
                    )));
                }
            }
        }
        entries.push(AcceptEntry { name, quality });
    }
    Ok(entries)
}

/// Select the best quality-weighted coding among `supported`.
///
/// An absent or empty header means identity. If no listed coding is
/// supported and identity is explicitly excluded (`identity;q=0` or a
/// `*;q=0` wildcard), the negotiation fails with
/// [`Error::NotAcceptable`] before any stream is touched.
pub fn negotiate(accept_encoding: Option<&str>, supported: &[Codec]) -> Result<Codec, Error> {
    let header = match accept_encoding {
        Some(h) if !h.trim().is_empty() => h,
        _ => return Ok(Codec::Identity),
    };
    let mut entries = parse_accept_encoding(header)?;
    // Stable sort: ties keep the sender's listed order.
    entries.sort_by(|a, b| {
        b.quality
            .partial_cmp(&a.quality)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    // A coding listed with q=0 is excluded even when a wildcard would
    // otherwise cover it.
    let excluded = |codec: Codec| {
        entries
            .iter()
            .any(|e| e.quality == 0.0 && Codec::from_name(&e.name) == Some(codec))
    };

    for entry in entries.iter().filter(|e| e.quality > 0.0) {
        if entry.name == "*" {
            // Wildcard: best non-excluded codec we support, identity as
            // last resort.
            if let Some(codec) = supported.iter().copied().find(|c| !excluded(*c)) {
                return Ok(codec);
            }
            if !excluded(Codec::Identity) {
                return Ok(Codec::Identity);
            }
            continue;
        }
        if let Some(codec) = Codec::from_name(&entry.name) {
            if codec == Codec::Identity || supported.contains(&codec) {
                return Ok(codec);
            }
        }
    }

    let identity_allowed = !entries.iter().any(|e| {
        e.quality == 0.0 && (e.name == "identity" || e.name == "*")
    });
    if identity_allowed {
        Ok(Codec::Identity)
    } else {
        Err(Error::NotAcceptable(format!(
            "no supported coding in '{header}' and identity is excluded"
        )))
    }
}

/// Compress `input` with `codec`, yielding the compressed stream.
pub fn deflate(input: &EntityStream, codec: Codec) -> Result<EntityStream, Error> {
    transform_stream(input, Compressor::new(codec))
}

/// Decompress `input` with `codec`, yielding the plaintext stream.
///
/// Malformed compressed data surfaces as [`Error::Codec`] on the output
/// stream.
pub fn inflate(input: &EntityStream, codec: Codec) -> Result<EntityStream, Error> {
    transform_stream(input, Decompressor::new(codec))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUPPORTED: &[Codec] = &[Codec::Gzip, Codec::Deflate, Codec::Snappy];

    #[test]
    fn absent_header_is_identity() {
        assert_eq!(negotiate(None, SUPPORTED).unwrap(), Codec::Identity);
        assert_eq!(negotiate(Some(""), SUPPORTED).unwrap(), Codec::Identity);
    }

    #[test]
    fn picks_highest_quality_supported() {
        let codec = negotiate(Some("deflate;q=0.5, gzip;q=0.8"), SUPPORTED).unwrap();
        assert_eq!(codec, Codec::Gzip);
    }

    #[test]
    fn skips_unsupported_names() {
        let codec = negotiate(Some("br, deflate;q=0.1"), SUPPORTED).unwrap();
        assert_eq!(codec, Codec::Deflate);
    }

    #[test]
    fn wildcard_takes_best_supported() {
        let codec = negotiate(Some("*"), SUPPORTED).unwrap();
        assert_eq!(codec, Codec::Gzip);
    }

    #[test]
    fn unacceptable_when_identity_excluded() {
        let err = negotiate(Some("foobar, identity;q=0"), SUPPORTED).unwrap_err();
        assert!(matches!(err, Error::NotAcceptable(_)));
    }

    #[test]
    fn unsupported_with_identity_allowed_falls_back() {
        let codec = negotiate(Some("foobar"), SUPPORTED).unwrap();
        assert_eq!(codec, Codec::Identity);
    }

    #[test]
    fn wildcard_skips_explicitly_excluded_codings() {
        let codec = negotiate(Some("*, gzip;q=0"), SUPPORTED).unwrap();
        assert_eq!(codec, Codec::Deflate);

        let codec = negotiate(Some("*, gzip;q=0"), &[Codec::Gzip]).unwrap();
        assert_eq!(codec, Codec::Identity);

        let err = negotiate(Some("*, gzip;q=0, identity;q=0"), &[Codec::Gzip]).unwrap_err();
        assert!(matches!(err, Error::NotAcceptable(_)));
    }

    #[test]
    fn malformed_quality_is_rejected() {
        assert!(negotiate(Some("gzip;q=abc"), SUPPORTED).is_err());
    }
}
