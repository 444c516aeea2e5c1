//! Gzip/brotli payload compression with adaptive thresholding (spec §3
//! "wire protocol codec"), replacing the `lz4` FFI binding used in
//! `examples/Protryon-klickhouse/klickhouse/src/compression.rs` with safe
//! Rust codecs since this protocol negotiates compression per-message over
//! a duplex transport rather than per-block inside one database session.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::{Result, TransportError};

/// Ratio below which compression is considered to be paying for itself
/// (spec §4.2: "lowers the threshold when observed compression ratio < 0.7
/// with latency < 1 ms").
const RATIO_LOWER_THRESHOLD: f64 = 0.7;
/// Ratio above which compression is considered to not be worth its cost
/// (spec §4.2: "raises it when ratio > 0.9 or latency > 10 ms").
const RATIO_RAISE_THRESHOLD: f64 = 0.9;
const LATENCY_LOWER_THRESHOLD_NANOS: u64 = 1_000_000; // 1 ms
const LATENCY_RAISE_THRESHOLD_NANOS: u64 = 10_000_000; // 10 ms

/// Wire tag identifying how a message payload was compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    None = 0,
    Gzip = 1,
    Brotli = 2,
}

impl CompressionMethod {
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(CompressionMethod::None),
            1 => Ok(CompressionMethod::Gzip),
            2 => Ok(CompressionMethod::Brotli),
            other => Err(TransportError::ProtocolViolation(format!("unknown compression tag {other}")).into()),
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

pub fn compress(method: CompressionMethod, data: &[u8]) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
            encoder
                .write_all(data)
                .map_err(|e| TransportError::ProtocolViolation(format!("gzip compress: {e}")))?;
            encoder
                .finish()
                .map_err(|e| TransportError::ProtocolViolation(format!("gzip compress: {e}")).into())
        }
        CompressionMethod::Brotli => {
            let mut out = Vec::new();
            let mut reader = data;
            brotli::BrotliCompress(&mut reader, &mut out, &brotli::enc::BrotliEncoderParams {
                quality: 5,
                ..Default::default()
            })
            .map_err(|e| TransportError::ProtocolViolation(format!("brotli compress: {e}")))?;
            Ok(out)
        }
    }
}

pub fn decompress(method: CompressionMethod, data: &[u8], max_len: usize) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .by_ref()
                .take(max_len as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|e| TransportError::ProtocolViolation(format!("gzip decompress: {e}")))?;
            if out.len() > max_len {
                return Err(TransportError::ProtocolViolation("decompressed payload exceeds maximum".into()).into());
            }
            Ok(out)
        }
        CompressionMethod::Brotli => {
            let mut reader = data;
            let mut out = Vec::new();
            brotli::BrotliDecompress(&mut reader, &mut out)
                .map_err(|e| TransportError::ProtocolViolation(format!("brotli decompress: {e}")))?;
            if out.len() > max_len {
                return Err(TransportError::ProtocolViolation("decompressed payload exceeds maximum".into()).into());
            }
            Ok(out)
        }
    }
}

/// Default byte threshold below which compression is skipped outright: the
/// framing/dictionary overhead of either codec outweighs the savings on
/// tiny payloads. Adjusted at runtime by [`AdaptiveCompressor`].
pub const DEFAULT_THRESHOLD_BYTES: usize = 1024;

/// Default byte ceiling above which compression is skipped even though the
/// payload clears the threshold: spec §4.2's "below a maximum (default 10
/// MiB)".
pub const DEFAULT_MAX_COMPRESS_BYTES: usize = 10 * 1024 * 1024;

/// Tracks whether compression is actually paying for itself and adjusts the
/// threshold at which it is attempted, per spec §3's "adaptive
/// thresholding". A payload under the threshold is sent uncompressed
/// without ever invoking the codec.
#[derive(Debug)]
pub struct AdaptiveCompressor {
    method: CompressionMethod,
    threshold: AtomicU64,
    max_compress_bytes: usize,
    // Running totals across every compressed sample, so the ratio reflects
    // the true weighted average instead of assuming every call was the same
    // size as the most recent one.
    total_raw_bytes: AtomicU64,
    total_compressed_bytes: AtomicU64,
    total_latency_nanos: AtomicU64,
    samples: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    errors: AtomicU64,
}

impl AdaptiveCompressor {
    pub fn new(method: CompressionMethod) -> Self {
        Self {
            method,
            threshold: AtomicU64::new(DEFAULT_THRESHOLD_BYTES as u64),
            max_compress_bytes: DEFAULT_MAX_COMPRESS_BYTES,
            total_raw_bytes: AtomicU64::new(0),
            total_compressed_bytes: AtomicU64::new(0),
            total_latency_nanos: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn method(&self) -> CompressionMethod {
        self.method
    }

    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::Relaxed) as usize
    }

    /// Compresses `data` if it clears the current threshold and stays under
    /// the maximum, returning the method actually used (which may be `None`
    /// if compression made no difference or the payload fell outside the
    /// compressible range).
    pub fn maybe_compress(&self, data: &[u8]) -> Result<(CompressionMethod, Vec<u8>)> {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
        if self.method == CompressionMethod::None
            || data.len() < self.threshold()
            || data.len() > self.max_compress_bytes
        {
            self.bytes_out.fetch_add(data.len() as u64, Ordering::Relaxed);
            return Ok((CompressionMethod::None, data.to_vec()));
        }
        let started = Instant::now();
        let compressed = match compress(self.method, data) {
            Ok(c) => c,
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        let latency = started.elapsed();
        self.record_sample(data.len(), compressed.len(), latency);
        if compressed.len() < data.len() {
            self.bytes_out.fetch_add(compressed.len() as u64, Ordering::Relaxed);
            Ok((self.method, compressed))
        } else {
            self.bytes_out.fetch_add(data.len() as u64, Ordering::Relaxed);
            Ok((CompressionMethod::None, data.to_vec()))
        }
    }

    /// Records a received frame for the in/out byte and frame counters.
    pub fn record_received(&self, raw_len: usize) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(raw_len as u64, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> CompressionMetrics {
        CompressionMetrics {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn record_sample(&self, raw_len: usize, compressed_len: usize, latency: std::time::Duration) {
        self.total_raw_bytes.fetch_add(raw_len as u64, Ordering::Relaxed);
        self.total_compressed_bytes.fetch_add(compressed_len as u64, Ordering::Relaxed);
        self.total_latency_nanos.fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
        let samples = self.samples.fetch_add(1, Ordering::Relaxed) + 1;

        // Every 32 samples, re-derive the threshold from the observed ratio
        // and latency (spec §4.2): a consistently poor ratio or high latency
        // raises the bar, a strong and fast one lowers it (bounded so it
        // never drops below a safety floor).
        if samples % 32 == 0 {
            let total_raw = self.total_raw_bytes.load(Ordering::Relaxed).max(1) as f64;
            let total_compressed = self.total_compressed_bytes.load(Ordering::Relaxed) as f64;
            let avg_ratio = total_compressed / total_raw;
            let avg_latency_nanos = self.total_latency_nanos.load(Ordering::Relaxed) / samples;

            let current = self.threshold.load(Ordering::Relaxed) as f64;
            let adjusted = if avg_ratio < RATIO_LOWER_THRESHOLD && avg_latency_nanos < LATENCY_LOWER_THRESHOLD_NANOS {
                (current * 0.8).max(64.0)
            } else if avg_ratio > RATIO_RAISE_THRESHOLD || avg_latency_nanos > LATENCY_RAISE_THRESHOLD_NANOS {
                (current * 1.25).min(65536.0)
            } else {
                current
            };
            self.threshold.store(adjusted as u64, Ordering::Relaxed);
        }
    }
}

/// Snapshot of the frame/byte counters spec §4.2 asks for ("frames/bytes in
/// and out, wall time, per-algorithm counters, error counters"). Wall time
/// and per-algorithm splits are tracked by the caller alongside this
/// snapshot (the compressor itself only ever runs one algorithm).
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressionMetrics {
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub errors: u64,
}

/// Prepends the one-byte compression discriminator to an already-encoded
/// message, producing the on-wire frame body spec §6 describes ("one
/// leading discriminator byte selects compression ... remaining bytes are
/// the codec-encoded message").
pub fn wrap_frame(method: CompressionMethod, encoded_message: Vec<u8>) -> Vec<u8> {
    let mut framed = Vec::with_capacity(encoded_message.len() + 1);
    framed.push(method.tag());
    framed.extend(encoded_message);
    framed
}

/// Splits a received frame into its compression method and the (still
/// possibly-compressed) message bytes.
pub fn unwrap_frame(frame: &[u8]) -> Result<(CompressionMethod, &[u8])> {
    let (tag, rest) = frame
        .split_first()
        .ok_or_else(|| TransportError::ProtocolViolation("empty frame".into()))?;
    Ok((CompressionMethod::from_tag(*tag)?, rest))
}
