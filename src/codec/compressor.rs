//! Stateful streaming compression and decompression.
//!
//! # Responsibilities
//! - Run chunks through a codec incrementally, buffering partial codec
//!   state between calls
//! - Flush remaining state at end of input
//!
//! # Design Decisions
//! - All codecs are driven through their `io::Write` wrappers over a
//!   shared output buffer, so the chunk-level interface is uniform
//! - Snappy framed input cannot be decoded push-style with the `snap`
//!   crate; decoding buffers the frames and decodes at end of stream

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::Codec;
use crate::error::Error;
use crate::stream::bridge::ChunkTransform;

/// Output sink shared with the codec's `io::Write` wrapper, drained
/// after every feed.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn drain(&self) -> Vec<Bytes> {
        let mut guard = self.0.lock().expect("codec buffer poisoned");
        if guard.is_empty() {
            Vec::new()
        } else {
            vec![Bytes::from(std::mem::take(&mut *guard))]
        }
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .expect("codec buffer poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn codec_err(codec: Codec, err: impl std::fmt::Display) -> Error {
    Error::Codec(format!("{codec}: {err}"))
}

enum Enc {
    Gzip(flate2::write::GzEncoder<SharedBuf>),
    Deflate(flate2::write::ZlibEncoder<SharedBuf>),
    Bzip2(bzip2::write::BzEncoder<SharedBuf>),
    Snappy(snap::write::FrameEncoder<SharedBuf>),
    Identity,
}

/// Compressing [`ChunkTransform`] for one codec.
pub struct Compressor {
    codec: Codec,
    enc: Option<Enc>,
    buf: SharedBuf,
}

impl Compressor {
    pub fn new(codec: Codec) -> Self {
        let buf = SharedBuf::default();
        let enc = match codec {
            Codec::Gzip => Enc::Gzip(flate2::write::GzEncoder::new(
                buf.clone(),
                flate2::Compression::default(),
            )),
            Codec::Deflate => Enc::Deflate(flate2::write::ZlibEncoder::new(
                buf.clone(),
                flate2::Compression::default(),
            )),
            Codec::Bzip2 => Enc::Bzip2(bzip2::write::BzEncoder::new(
                buf.clone(),
                bzip2::Compression::default(),
            )),
            Codec::Snappy => Enc::Snappy(snap::write::FrameEncoder::new(buf.clone())),
            Codec::Identity => Enc::Identity,
        };
        Compressor {
            codec,
            enc: Some(enc),
            buf,
        }
    }

    fn feed(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        match self.enc.as_mut() {
            Some(Enc::Gzip(e)) => {
                e.write_all(chunk)?;
                e.flush()
            }
            Some(Enc::Deflate(e)) => {
                e.write_all(chunk)?;
                e.flush()
            }
            Some(Enc::Bzip2(e)) => {
                e.write_all(chunk)?;
                e.flush()
            }
            Some(Enc::Snappy(e)) => {
                e.write_all(chunk)?;
                e.flush()
            }
            Some(Enc::Identity) | None => Ok(()),
        }
    }
}

impl ChunkTransform for Compressor {
    fn transform(&mut self, chunk: Bytes) -> Result<Vec<Bytes>, Error> {
        if matches!(self.enc, Some(Enc::Identity)) {
            return Ok(vec![chunk]);
        }
        self.feed(&chunk).map_err(|e| codec_err(self.codec, e))?;
        Ok(self.buf.drain())
    }

    fn finish(&mut self) -> Result<Vec<Bytes>, Error> {
        match self.enc.take() {
            Some(Enc::Gzip(e)) => {
                e.finish().map_err(|e| codec_err(self.codec, e))?;
            }
            Some(Enc::Deflate(e)) => {
                e.finish().map_err(|e| codec_err(self.codec, e))?;
            }
            Some(Enc::Bzip2(e)) => {
                e.finish().map_err(|e| codec_err(self.codec, e))?;
            }
            Some(Enc::Snappy(e)) => {
                e.into_inner().map_err(|e| codec_err(self.codec, e))?;
            }
            Some(Enc::Identity) | None => {}
        }
        Ok(self.buf.drain())
    }
}

enum Dec {
    Gzip(flate2::write::GzDecoder<SharedBuf>),
    Deflate(flate2::write::ZlibDecoder<SharedBuf>),
    Bzip2(bzip2::write::BzDecoder<SharedBuf>),
    /// Framed input accumulated until end of stream.
    Snappy(Vec<u8>),
    Identity,
}

/// Decompressing [`ChunkTransform`] for one codec.
pub struct Decompressor {
    codec: Codec,
    dec: Option<Dec>,
    buf: SharedBuf,
}

impl Decompressor {
    pub fn new(codec: Codec) -> Self {
        let buf = SharedBuf::default();
        let dec = match codec {
            Codec::Gzip => Dec::Gzip(flate2::write::GzDecoder::new(buf.clone())),
            Codec::Deflate => Dec::Deflate(flate2::write::ZlibDecoder::new(buf.clone())),
            Codec::Bzip2 => Dec::Bzip2(bzip2::write::BzDecoder::new(buf.clone())),
            Codec::Snappy => Dec::Snappy(Vec::new()),
            Codec::Identity => Dec::Identity,
        };
        Decompressor {
            codec,
            dec: Some(dec),
            buf,
        }
    }
}

impl ChunkTransform for Decompressor {
    fn transform(&mut self, chunk: Bytes) -> Result<Vec<Bytes>, Error> {
        match self.dec.as_mut() {
            Some(Dec::Gzip(d)) => {
                d.write_all(&chunk).map_err(|e| codec_err(self.codec, e))?;
            }
            Some(Dec::Deflate(d)) => {
                d.write_all(&chunk).map_err(|e| codec_err(self.codec, e))?;
            }
            Some(Dec::Bzip2(d)) => {
                d.write_all(&chunk).map_err(|e| codec_err(self.codec, e))?;
            }
            Some(Dec::Snappy(frames)) => {
                frames.extend_from_slice(&chunk);
                return Ok(Vec::new());
            }
            Some(Dec::Identity) | None => return Ok(vec![chunk]),
        }
        Ok(self.buf.drain())
    }

    fn finish(&mut self) -> Result<Vec<Bytes>, Error> {
        match self.dec.take() {
            Some(Dec::Gzip(d)) => {
                d.finish().map_err(|e| codec_err(self.codec, e))?;
            }
            Some(Dec::Deflate(d)) => {
                d.finish().map_err(|e| codec_err(self.codec, e))?;
            }
            Some(Dec::Bzip2(mut d)) => {
                d.finish().map_err(|e| codec_err(self.codec, e))?;
            }
            Some(Dec::Snappy(frames)) => {
                let mut plain = Vec::new();
                snap::read::FrameDecoder::new(frames.as_slice())
                    .read_to_end(&mut plain)
                    .map_err(|e| codec_err(self.codec, e))?;
                return Ok(if plain.is_empty() {
                    Vec::new()
                } else {
                    vec![Bytes::from(plain)]
                });
            }
            Some(Dec::Identity) | None => {}
        }
        Ok(self.buf.drain())
    }
}
