use crate::dtype::DType;

use super::utils::push_block;

pub(crate) const PRELUDE_BLOCK_ID: &str = "fusejit.prelude";

/// Global symbols the prelude and the entry function reserve.
pub(crate) const RESERVED_SYMBOLS: &[&str] = &[
    "fusejit_buffer",
    "fusejit_runtime",
    "fusejit_numel",
    "fusejit_same_dims",
    "fusejit_ensure_output",
    "fusejit_entry",
    "fusejit_init",
    "fusejit_abi_version",
    "FUSEJIT_FAIL",
    "FUSEJIT_EXPORT",
];

const STANDARD_HEADERS: &[&str] = &["stddef.h", "stdint.h", "string.h"];

pub(crate) fn emit_includes(module: &mut String, extra_headers: &[String]) {
    for header in STANDARD_HEADERS {
        module.push_str(&format!("#include <{header}>\n"));
    }
    for header in extra_headers {
        if STANDARD_HEADERS.contains(&header.as_str()) {
            continue;
        }
        if header.starts_with('<') || header.starts_with('"') {
            module.push_str(&format!("#include {header}\n"));
        } else {
            module.push_str(&format!("#include <{header}>\n"));
        }
    }
    module.push('\n');
}

/// Buffer/runtime ABI shared with `bridge.rs` plus the output validation helper.
pub(crate) fn emit_prelude(module: &mut String) {
    let mut tags = String::new();
    for dtype in DType::ALL {
        tags.push_str(&format!("#define {} {}u\n", dtype.c_tag(), dtype.tag()));
    }
    push_block(module, 0, &tags);

    let block = r#"
        #define FUSEJIT_FLAG_ROW_MAJOR 1u
        #define FUSEJIT_FLAG_COL_MAJOR 2u

        #if defined(_WIN32)
        #define FUSEJIT_EXPORT __declspec(dllexport)
        #else
        #define FUSEJIT_EXPORT __attribute__((visibility("default")))
        #endif

        typedef struct fusejit_buffer {
          uint32_t dtype;
          uint32_t rank;
          const int64_t* dims;
          const int64_t* strides;
          void* data;
          uint32_t flags;
        } fusejit_buffer;

        typedef struct fusejit_runtime {
          void* ctx;
          fusejit_buffer* (*alloc)(void* ctx, uint32_t dtype, uint32_t rank, const int64_t* dims);
          void (*release)(void* ctx, fusejit_buffer* buffer);
          void (*fail)(void* ctx, const char* message);
        } fusejit_runtime;

        #define FUSEJIT_FAIL(message) \
          do { \
            rt->fail(rt->ctx, (message)); \
            fusejit_status = 1; \
            goto fusejit_cleanup; \
          } while (0)

        static int64_t fusejit_numel(const fusejit_buffer* buffer) {
          int64_t count = 1;
          for (uint32_t axis = 0; axis < buffer->rank; ++axis) {
            count *= buffer->dims[axis];
          }
          return count;
        }

        static int fusejit_same_dims(const fusejit_buffer* a, const fusejit_buffer* b) {
          if (a->rank != b->rank) {
            return 0;
          }
          for (uint32_t axis = 0; axis < a->rank; ++axis) {
            if (a->dims[axis] != b->dims[axis]) {
              return 0;
            }
          }
          return 1;
        }

        static int fusejit_ensure_output(
            const fusejit_runtime* rt,
            fusejit_buffer** slot,
            uint32_t dtype,
            uint32_t rank,
            const int64_t* dims) {
          fusejit_buffer* current = *slot;
          if (current != NULL && current->dtype == dtype && current->rank == rank &&
              (current->flags & FUSEJIT_FLAG_ROW_MAJOR) != 0) {
            uint32_t axis = 0;
            while (axis < rank && current->dims[axis] == dims[axis]) {
              ++axis;
            }
            if (axis == rank) {
              return 0;
            }
          }
          if (current != NULL) {
            *slot = NULL;
            rt->release(rt->ctx, current);
          }
          *slot = rt->alloc(rt->ctx, dtype, rank, dims);
          return *slot == NULL ? 1 : 0;
        }
    "#;
    push_block(module, 0, block);
    module.push('\n');
}
