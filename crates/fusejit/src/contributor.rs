//! The fragment contributor protocol.
//!
//! An [`OpKind`] never executes anything itself: it returns C fragments that the assembler
//! splices into one translation unit. Kinds are unaware of each other, so everything they put at
//! global scope goes through [`SupportBlock`]s (deduplicated by id, checked for symbol clashes)
//! and everything per-application is scoped with [`AppContext::symbol`].

use serde::{Deserialize, Serialize};

use crate::codegen::utils::escape_c_string;
use crate::error::{ContributorError, ContributorResult};
use crate::graph::VarDesc;
use crate::naming::scoped_symbol;

pub trait OpKind: Send + Sync {
    /// Type identity of the kind, e.g. `"scale"`.
    fn name(&self) -> &str;

    /// Every configuration value that changes emitted code. Part of the kind identity.
    fn params(&self) -> String {
        String::new()
    }

    /// Version of the emitted code. `None` (or an empty tuple) marks the kind uncacheable by
    /// structure, in which case the module key falls back to the full source text. Bump it
    /// whenever any fragment changes.
    fn version_fingerprint(&self) -> Option<Vec<u32>>;

    /// Rejects unsupported arity, element types or ranks before any code is generated.
    fn check(&self, _ctx: &AppContext<'_>) -> ContributorResult<()> {
        Ok(())
    }

    /// Global-scope code shared by every application of this kind (and possibly other kinds
    /// using the same block ids).
    fn kind_support_code(&self) -> Vec<SupportBlock> {
        Vec::new()
    }

    /// Global-scope code specific to one application; identifiers must come from
    /// [`AppContext::symbol`].
    fn app_support_code(&self, _ctx: &AppContext<'_>) -> ContributorResult<Vec<SupportBlock>> {
        Ok(Vec::new())
    }

    /// C expressions for the extents of output `index`, one per axis of its declared rank.
    /// They may reference the input handles (`ctx.input(i)`).
    fn output_extents(&self, ctx: &AppContext<'_>, index: usize) -> ContributorResult<Vec<String>>;

    /// Statements computing the outputs. Runs after every output buffer was validated or
    /// (re)allocated, so `ctx.output(i)` is a dense row-major buffer of the right shape.
    fn computation_body(&self, ctx: &AppContext<'_>) -> ContributorResult<String>;

    fn link_requirements(&self) -> LinkRequirements {
        LinkRequirements::default()
    }

    /// `false` when support code keeps mutable static state; such modules are invoked one call
    /// at a time.
    fn reentrant(&self) -> bool {
        true
    }
}

/// Everything a kind may know about one application while emitting code.
#[derive(Debug, Clone, Copy)]
pub struct AppContext<'a> {
    name: &'a str,
    inputs: &'a [VarDesc],
    outputs: &'a [VarDesc],
}

impl<'a> AppContext<'a> {
    pub fn new(name: &'a str, inputs: &'a [VarDesc], outputs: &'a [VarDesc]) -> Self {
        Self {
            name,
            inputs,
            outputs,
        }
    }

    /// Unique application name, a valid C identifier.
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn inputs(&self) -> &[VarDesc] {
        self.inputs
    }

    pub fn outputs(&self) -> &[VarDesc] {
        self.outputs
    }

    /// C name of input `index` (`const fusejit_buffer*`).
    pub fn input(&self, index: usize) -> String {
        format!("in{index}")
    }

    /// C name of output `index` (`fusejit_buffer*`), valid inside the computation body.
    pub fn output(&self, index: usize) -> String {
        format!("out{index}")
    }

    /// Statement that reports `message` through the failure channel and abandons the call.
    pub fn fail(&self, message: &str) -> String {
        let message = escape_c_string(&format!("{}: {message}", self.name));
        format!("FUSEJIT_FAIL(\"{message}\");")
    }

    /// Global identifier private to this application.
    pub fn symbol(&self, local: &str) -> String {
        scoped_symbol(self.name, local)
    }

    pub fn expect_arity(&self, inputs: usize, outputs: usize) -> ContributorResult<()> {
        if self.inputs.len() != inputs || self.outputs.len() != outputs {
            return Err(ContributorError::new(format!(
                "expected {inputs} input(s) and {outputs} output(s), got {} and {}",
                self.inputs.len(),
                self.outputs.len()
            )));
        }
        Ok(())
    }
}

/// A global-scope fragment with explicit identity and ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportBlock {
    /// Deduplication identity; the same id must always carry the same code.
    pub id: String,
    pub code: String,
    /// Global symbols this block defines; no two blocks may define the same symbol.
    pub symbols: Vec<String>,
    /// Ids of blocks that must be emitted before this one.
    pub depends_on: Vec<String>,
}

impl SupportBlock {
    pub fn new(id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
            symbols: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn defines(mut self, symbol: impl Into<String>) -> Self {
        self.symbols.push(symbol.into());
        self
    }

    pub fn after(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }
}

/// Headers, libraries, search paths, flags and one-time init code a kind needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkRequirements {
    pub headers: Vec<String>,
    pub libraries: Vec<String>,
    pub lib_dirs: Vec<String>,
    pub include_dirs: Vec<String>,
    pub compile_flags: Vec<String>,
    pub link_flags: Vec<String>,
    /// Statements run once by `fusejit_init` after the module is loaded.
    pub init_code: Vec<String>,
}

impl LinkRequirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, header: impl Into<String>) -> Self {
        push_unique(&mut self.headers, header.into());
        self
    }

    pub fn library(mut self, library: impl Into<String>) -> Self {
        push_unique(&mut self.libraries, library.into());
        self
    }

    pub fn lib_dir(mut self, dir: impl Into<String>) -> Self {
        push_unique(&mut self.lib_dirs, dir.into());
        self
    }

    pub fn include_dir(mut self, dir: impl Into<String>) -> Self {
        push_unique(&mut self.include_dirs, dir.into());
        self
    }

    pub fn compile_flag(mut self, flag: impl Into<String>) -> Self {
        push_unique(&mut self.compile_flags, flag.into());
        self
    }

    pub fn link_flag(mut self, flag: impl Into<String>) -> Self {
        push_unique(&mut self.link_flags, flag.into());
        self
    }

    pub fn init(mut self, code: impl Into<String>) -> Self {
        push_unique(&mut self.init_code, code.into());
        self
    }

    /// Appends `other`, keeping first-seen order and dropping duplicates.
    pub fn merge(&mut self, other: &LinkRequirements) {
        for (dst, src) in [
            (&mut self.headers, &other.headers),
            (&mut self.libraries, &other.libraries),
            (&mut self.lib_dirs, &other.lib_dirs),
            (&mut self.include_dirs, &other.include_dirs),
            (&mut self.compile_flags, &other.compile_flags),
            (&mut self.link_flags, &other.link_flags),
            (&mut self.init_code, &other.init_code),
        ] {
            for item in src {
                push_unique(dst, item.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
            && self.libraries.is_empty()
            && self.lib_dirs.is_empty()
            && self.include_dirs.is_empty()
            && self.compile_flags.is_empty()
            && self.link_flags.is_empty()
            && self.init_code.is_empty()
    }
}

fn push_unique(list: &mut Vec<String>, item: String) {
    if !list.contains(&item) {
        list.push(item);
    }
}
