//! Loading compiled modules and calling into them.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr;
use std::slice;
use std::sync::{Mutex, PoisonError};

use libloading::Library;
use tempfile::TempPath;

use crate::buffer::{Buffer, RawBuffer};
use crate::codegen::{ABI_SYMBOL, ABI_VERSION, INIT_SYMBOL};
use crate::dtype::DType;
use crate::error::{JitError, JitResult};
use crate::graph::VarDesc;
use crate::key::CacheKey;
use crate::store::ArtifactRecord;

/// Mirror of `fusejit_runtime` in the generated prelude.
#[repr(C)]
struct RuntimeVTable {
    ctx: *mut c_void,
    alloc: extern "C" fn(*mut c_void, u32, u32, *const i64) -> *mut RawBuffer,
    release: extern "C" fn(*mut c_void, *mut RawBuffer),
    fail: extern "C" fn(*mut c_void, *const c_char),
}

type EntryFn = unsafe extern "C" fn(
    *const RuntimeVTable,
    *const *const RawBuffer,
    usize,
    *mut *mut RawBuffer,
    usize,
) -> c_int;
type InitFn = unsafe extern "C" fn(*const RuntimeVTable) -> c_int;
type AbiFn = unsafe extern "C" fn() -> u32;

/// Per-call state reachable from the vtable callbacks.
#[derive(Default)]
struct CallState {
    failure: Option<String>,
    inputs: Vec<*const RawBuffer>,
}

impl CallState {
    fn record_failure(&mut self, message: String) {
        if self.failure.is_none() {
            self.failure = Some(message);
        }
    }

    fn vtable(&mut self) -> RuntimeVTable {
        RuntimeVTable {
            ctx: (self as *mut CallState).cast::<c_void>(),
            alloc: runtime_alloc,
            release: runtime_release,
            fail: runtime_fail,
        }
    }
}

extern "C" fn runtime_alloc(
    ctx: *mut c_void,
    dtype: u32,
    rank: u32,
    dims: *const i64,
) -> *mut RawBuffer {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: ctx is the CallState of the invocation currently on the stack.
        let state = unsafe { &mut *ctx.cast::<CallState>() };
        let Some(dtype) = DType::from_tag(dtype) else {
            state.record_failure(format!("allocation with unknown dtype tag {dtype}"));
            return ptr::null_mut();
        };
        let raw_dims: &[i64] = if rank == 0 || dims.is_null() {
            &[]
        } else {
            // SAFETY: generated code passes `rank` extents.
            unsafe { slice::from_raw_parts(dims, rank as usize) }
        };
        if raw_dims.len() != rank as usize {
            state.record_failure(format!("allocation of rank {rank} without extents"));
            return ptr::null_mut();
        }
        let mut extents = Vec::with_capacity(raw_dims.len());
        for dim in raw_dims {
            match usize::try_from(*dim) {
                Ok(dim) => extents.push(dim),
                Err(_) => {
                    state.record_failure(format!("allocation with negative extent {dim}"));
                    return ptr::null_mut();
                }
            }
        }
        match Buffer::zeros(dtype, &extents) {
            Ok(buffer) => buffer.into_raw(),
            Err(err) => {
                state.record_failure(err.to_string());
                ptr::null_mut()
            }
        }
    }));
    result.unwrap_or(ptr::null_mut())
}

extern "C" fn runtime_release(ctx: *mut c_void, buffer: *mut RawBuffer) {
    let _ = panic::catch_unwind(AssertUnwindSafe(|| {
        if buffer.is_null() {
            return;
        }
        // SAFETY: ctx is the CallState of the invocation currently on the stack.
        let state = unsafe { &mut *ctx.cast::<CallState>() };
        if state.inputs.contains(&(buffer as *const RawBuffer)) {
            state.record_failure("native code tried to release an input buffer".to_string());
            return;
        }
        // SAFETY: every non-input buffer seen by native code came from Buffer::into_raw, either
        // as an output slot or from runtime_alloc, and generated code releases each at most once.
        drop(unsafe { Buffer::from_raw(buffer) });
    }));
}

extern "C" fn runtime_fail(ctx: *mut c_void, message: *const c_char) {
    let _ = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: ctx is the CallState of the invocation currently on the stack.
        let state = unsafe { &mut *ctx.cast::<CallState>() };
        let message = if message.is_null() {
            "unspecified failure".to_string()
        } else {
            // SAFETY: generated code passes NUL-terminated string literals.
            unsafe { CStr::from_ptr(message) }
                .to_string_lossy()
                .into_owned()
        };
        state.record_failure(message);
    }));
}

/// A loaded module. Immutable; shareable across threads.
pub struct CompiledModule {
    key: CacheKey,
    entry: EntryFn,
    inputs: Vec<VarDesc>,
    outputs: Vec<VarDesc>,
    serial: Option<Mutex<()>>,
    // Dropped in declaration order: the library is unloaded before its file is deleted.
    _library: Library,
    _path: TempPath,
}

// Entry points of reentrant modules are safe to call concurrently; the rest go through `serial`.
unsafe impl Send for CompiledModule {}
unsafe impl Sync for CompiledModule {}

impl CompiledModule {
    /// Loads the library carried by `record` from a private temporary copy and runs its
    /// one-time initialization.
    pub fn load(
        record: &ArtifactRecord,
        key: CacheKey,
        inputs: Vec<VarDesc>,
        outputs: Vec<VarDesc>,
        extension: &str,
    ) -> JitResult<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("fusejit-")
            .suffix(&format!(".{extension}"))
            .tempfile()
            .map_err(|err| JitError::io("create temporary library file", err))?;
        file.write_all(&record.library)
            .and_then(|_| file.flush())
            .map_err(|err| JitError::io("write temporary library file", err))?;
        let path = file.into_temp_path();

        let library = open_library(&path)?;
        check_abi(&library)?;
        let entry = unsafe {
            library
                .get::<EntryFn>(record.entry.as_bytes())
                .map(|symbol| *symbol)
        }
        .map_err(|err| JitError::load(format!("missing entry '{}': {err}", record.entry)))?;

        if record.has_init {
            let init = unsafe { library.get::<InitFn>(INIT_SYMBOL.as_bytes()).map(|s| *s) }
                .map_err(|err| JitError::load(format!("missing '{INIT_SYMBOL}': {err}")))?;
            let mut state = CallState::default();
            let vtable = state.vtable();
            let status = unsafe { init(&vtable) };
            if status != 0 || state.failure.is_some() {
                let message = state
                    .failure
                    .unwrap_or_else(|| format!("status {status}"));
                return Err(JitError::load(format!("module initialization failed: {message}")));
            }
        }

        Ok(Self {
            key,
            entry,
            inputs,
            outputs,
            serial: (!record.reentrant).then(|| Mutex::new(())),
            _library: library,
            _path: path,
        })
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn input_descs(&self) -> &[VarDesc] {
        &self.inputs
    }

    pub fn output_descs(&self) -> &[VarDesc] {
        &self.outputs
    }

    pub fn is_reentrant(&self) -> bool {
        self.serial.is_none()
    }

    /// Runs the module. Present outputs whose dtype and extents already match are written in
    /// place; anything else is replaced. After an error the outputs are unspecified but every
    /// buffer is still owned exactly once.
    pub fn invoke(&self, inputs: &[&Buffer], outputs: &mut [Option<Buffer>]) -> JitResult<()> {
        self.check_arguments(inputs, outputs)?;
        let _guard = self
            .serial
            .as_ref()
            .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner));

        let raw_inputs: Vec<*const RawBuffer> = inputs.iter().map(|input| input.as_raw()).collect();
        let mut raw_outputs: Vec<*mut RawBuffer> = outputs
            .iter_mut()
            .map(|slot| slot.take().map_or(ptr::null_mut(), Buffer::into_raw))
            .collect();

        let mut state = CallState {
            failure: None,
            inputs: raw_inputs.clone(),
        };
        let vtable = state.vtable();
        let status = unsafe {
            (self.entry)(
                &vtable,
                raw_inputs.as_ptr(),
                raw_inputs.len(),
                raw_outputs.as_mut_ptr(),
                raw_outputs.len(),
            )
        };

        for (slot, raw) in outputs.iter_mut().zip(raw_outputs.drain(..)) {
            // SAFETY: slots only ever hold pointers produced by Buffer::into_raw.
            *slot = (!raw.is_null()).then(|| unsafe { Buffer::from_raw(raw) });
        }

        match (status, state.failure) {
            (0, None) => Ok(()),
            (_, Some(message)) => Err(JitError::runtime(message)),
            (status, None) => Err(JitError::runtime(format!(
                "module {} returned status {status}",
                self.key
            ))),
        }
    }

    /// Runs the module with fresh outputs and returns them.
    pub fn call(&self, inputs: &[&Buffer]) -> JitResult<Vec<Buffer>> {
        let mut outputs: Vec<Option<Buffer>> = (0..self.outputs.len()).map(|_| None).collect();
        self.invoke(inputs, &mut outputs)?;
        outputs
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| JitError::runtime(format!("output {index} was not produced")))
            })
            .collect()
    }

    fn check_arguments(&self, inputs: &[&Buffer], outputs: &[Option<Buffer>]) -> JitResult<()> {
        if inputs.len() != self.inputs.len() {
            return Err(JitError::invocation(format!(
                "expected {} input(s), got {}",
                self.inputs.len(),
                inputs.len()
            )));
        }
        if outputs.len() != self.outputs.len() {
            return Err(JitError::invocation(format!(
                "expected {} output slot(s), got {}",
                self.outputs.len(),
                outputs.len()
            )));
        }
        for (index, (buffer, desc)) in inputs.iter().zip(&self.inputs).enumerate() {
            if buffer.dtype() != desc.dtype || buffer.rank() != desc.rank {
                return Err(JitError::invocation(format!(
                    "input {index} must be {desc}, got {}/r{}",
                    buffer.dtype(),
                    buffer.rank()
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("key", &self.key)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("reentrant", &self.is_reentrant())
            .finish()
    }
}

fn open_library(path: &Path) -> JitResult<Library> {
    unsafe { Library::new(path) }
        .map_err(|err| JitError::load(format!("cannot load {}: {err}", path.display())))
}

fn check_abi(library: &Library) -> JitResult<()> {
    let abi = unsafe { library.get::<AbiFn>(ABI_SYMBOL.as_bytes()).map(|s| *s) }
        .map_err(|err| JitError::load(format!("missing '{ABI_SYMBOL}': {err}")))?;
    let version = unsafe { abi() };
    if version != ABI_VERSION {
        return Err(JitError::load(format!(
            "module ABI version {version} does not match {ABI_VERSION}"
        )));
    }
    Ok(())
}
