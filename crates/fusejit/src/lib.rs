//! Fragment-assembling C JIT.
//!
//! Op kinds ([`OpKind`]) contribute C fragments for each use in a [`Graph`]. The
//! [`ModuleAssembler`] fuses them into one translation unit, [`derive_key`] addresses it by
//! structure and version, and [`JitRuntime`] compiles it once per key, persists the shared
//! library in an [`ArtifactStore`] and invokes it on [`Buffer`]s.

pub mod bridge;
pub mod buffer;
pub mod cache;
pub mod codegen;
pub mod config;
pub mod contributor;
pub mod dtype;
pub mod error;
pub mod graph;
pub mod key;
pub mod naming;
pub mod runtime;
pub mod store;
pub mod toolchain;

pub use bridge::CompiledModule;
pub use buffer::{Buffer, Layout, RawBuffer, FLAG_COL_MAJOR, FLAG_ROW_MAJOR};
pub use cache::{CacheStats, CancelToken, ModuleCache};
pub use codegen::{
    ApplicationSignature, AssembledModule, Binding, ModuleAssembler, ABI_VERSION, ENTRY_SYMBOL,
};
pub use config::JitConfig;
pub use contributor::{AppContext, LinkRequirements, OpKind, SupportBlock};
pub use dtype::{DType, Element};
pub use error::{ContributorError, ContributorResult, JitError, JitResult};
pub use graph::{Application, Graph, GraphBuilder, VarDesc, VarId};
pub use key::{derive_key, AbiInfo, CacheKey, ToolchainIdentity};
pub use naming::{sanitize_symbol, scoped_symbol, SymbolNamer};
pub use runtime::{JitRuntime, RuntimeStats};
pub use store::{ArtifactRecord, ArtifactStore, DiskStore, MemoryStore, ARTIFACT_FORMAT_VERSION};
pub use toolchain::{lib_ext, CcToolchain, CompileJob, Toolchain};
