//! Per-message compression.
//!
//! Compressors are looked up by the name carried in the `grpc-encoding`
//! header. `identity` is always registered and never sets the compressed
//! flag; `lz4` uses `lz4_flex` with the uncompressed size prepended.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Result, RpcError};

/// Name of the no-op encoding.
pub const IDENTITY: &str = "identity";
/// Name of the LZ4 encoding.
pub const LZ4: &str = "lz4";

/// A named message compressor.
pub trait Compressor: Send + Sync + 'static {
    /// Encoding name advertised on the wire.
    fn name(&self) -> &'static str;

    /// Compresses a whole message.
    fn compress(&self, input: &[u8]) -> Result<Bytes>;

    /// Decompresses a whole message, refusing output larger than `max_size`.
    fn decompress(&self, input: &[u8], max_size: usize) -> Result<Bytes>;
}

/// Pass-through encoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCompressor;

impl Compressor for IdentityCompressor {
    fn name(&self) -> &'static str {
        IDENTITY
    }

    fn compress(&self, input: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(input))
    }

    fn decompress(&self, input: &[u8], max_size: usize) -> Result<Bytes> {
        if input.len() > max_size {
            return Err(RpcError::MessageTooLarge {
                size: input.len(),
                max: max_size,
            });
        }
        Ok(Bytes::copy_from_slice(input))
    }
}

/// LZ4 block compression with a 4-byte size prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn name(&self) -> &'static str {
        LZ4
    }

    fn compress(&self, input: &[u8]) -> Result<Bytes> {
        Ok(Bytes::from(lz4_flex::compress_prepend_size(input)))
    }

    fn decompress(&self, input: &[u8], max_size: usize) -> Result<Bytes> {
        if input.len() < 4 {
            return Err(RpcError::Compression {
                reason: "lz4 payload shorter than its size prefix".to_string(),
            });
        }
        let declared = u32::from_le_bytes([input[0], input[1], input[2], input[3]]) as usize;
        if declared > max_size {
            return Err(RpcError::MessageTooLarge {
                size: declared,
                max: max_size,
            });
        }
        lz4_flex::decompress_size_prepended(input)
            .map(Bytes::from)
            .map_err(|e| RpcError::Compression {
                reason: e.to_string(),
            })
    }
}

/// Compressors known to a channel or server, keyed by encoding name.
#[derive(Clone)]
pub struct CompressorRegistry {
    compressors: HashMap<&'static str, Arc<dyn Compressor>>,
}

impl Default for CompressorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            compressors: HashMap::new(),
        };
        registry.register(Arc::new(IdentityCompressor));
        registry.register(Arc::new(Lz4Compressor));
        registry
    }
}

impl std::fmt::Debug for CompressorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressorRegistry")
            .field("encodings", &self.names())
            .finish()
    }
}

impl CompressorRegistry {
    /// Registry with `identity` and `lz4`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a compressor.
    pub fn register(&mut self, compressor: Arc<dyn Compressor>) {
        self.compressors.insert(compressor.name(), compressor);
    }

    /// Looks up a compressor by encoding name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Compressor>> {
        self.compressors.get(name).cloned()
    }

    /// Resolves the compressor used for sending. `identity` resolves to `None`
    /// so that frames go out with the compressed flag cleared.
    pub fn for_send(&self, name: Option<&str>) -> Option<Arc<dyn Compressor>> {
        match name {
            None | Some(IDENTITY) => None,
            Some(name) => self.get(name),
        }
    }

    /// Registered encoding names, sorted, for `grpc-accept-encoding`.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.compressors.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Comma-separated accept list.
    pub fn accept_encoding(&self) -> String {
        self.names().join(",")
    }
}
