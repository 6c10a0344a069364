use std::fmt;
use std::mem;

use serde::{Deserialize, Serialize};

use crate::buffer::RawBuffer;
use crate::codegen::{ApplicationSignature, AssembledModule, Binding, ABI_VERSION};
use crate::contributor::LinkRequirements;
use crate::error::{JitError, JitResult};

const KEY_DOMAIN: &[u8] = b"fusejit:module-key:v1";
const KEY_SCHEMA: u32 = 1;

/// Content address of a compiled module.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    pub fn from_hex(hex: &str) -> JitResult<Self> {
        if hex.len() != 64 || !hex.is_ascii() {
            return Err(JitError::serialization(format!(
                "cache key must be 64 hex digits, got '{hex}'"
            )));
        }
        let mut bytes = [0u8; 32];
        for (index, byte) in bytes.iter_mut().enumerate() {
            let pair = &hex[index * 2..index * 2 + 2];
            *byte = u8::from_str_radix(pair, 16).map_err(|_| {
                JitError::serialization(format!("cache key '{hex}' is not hexadecimal"))
            })?;
        }
        Ok(Self(bytes))
    }

    /// First two hex digits, used to fan out the on-disk layout.
    pub fn shard(&self) -> String {
        format!("{:02x}", self.0[0])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}

/// What the compiled bytes depend on besides the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolchainIdentity {
    pub compiler: String,
    /// First line of the compiler's version banner.
    pub version: String,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiInfo {
    pub abi_version: u32,
    pub pointer_width: u32,
    pub buffer_header_size: u32,
    pub arch: String,
    pub os: String,
}

impl AbiInfo {
    pub fn current() -> Self {
        Self {
            abi_version: ABI_VERSION,
            pointer_width: (mem::size_of::<usize>() * 8) as u32,
            buffer_header_size: mem::size_of::<RawBuffer>() as u32,
            arch: std::env::consts::ARCH.to_string(),
            os: std::env::consts::OS.to_string(),
        }
    }
}

#[derive(Serialize)]
struct KeyManifest<'a> {
    schema: u32,
    abi: AbiInfo,
    toolchain: &'a ToolchainIdentity,
    inputs: &'a [Binding],
    outputs: &'a [Binding],
    applications: &'a [ApplicationSignature],
    link: &'a LinkRequirements,
    reentrant: bool,
}

/// Derives the key of an assembled module.
///
/// Only structure and versions are hashed, so two graphs with the same shape share a key. When
/// some kind is unversioned the full source text is hashed as well.
pub fn derive_key(module: &AssembledModule, toolchain: &ToolchainIdentity) -> JitResult<CacheKey> {
    let manifest = KeyManifest {
        schema: KEY_SCHEMA,
        abi: AbiInfo::current(),
        toolchain,
        inputs: &module.inputs,
        outputs: &module.outputs,
        applications: &module.applications,
        link: &module.link,
        reentrant: module.reentrant,
    };
    let bytes = bincode::serialize(&manifest)?;

    let mut hasher = blake3::Hasher::new();
    hasher.update(KEY_DOMAIN);
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(&bytes);
    if module.is_versioned() {
        hasher.update(&[0]);
    } else {
        hasher.update(&[1]);
        hasher.update(module.source.as_bytes());
    }
    Ok(CacheKey(*hasher.finalize().as_bytes()))
}
