use fusejit::{AppContext, ContributorError, ContributorResult, DType, SupportBlock};

/// Id of the kind-wide block every kind in this crate depends on.
pub const STRIDED_OFFSET_BLOCK: &str = "fusejit_kinds.strided_offset";
pub const STRIDED_OFFSET_FN: &str = "fusejit_kinds_strided_offset";

/// Byte offset of the element at row-major linear index `linear` in a strided buffer.
pub fn strided_offset_block() -> SupportBlock {
    let code = format!(
        r#"
        static int64_t {STRIDED_OFFSET_FN}(const fusejit_buffer* buffer, int64_t linear) {{
          int64_t offset = 0;
          for (uint32_t axis = buffer->rank; axis > 0; --axis) {{
            const int64_t extent = buffer->dims[axis - 1];
            if (extent > 0) {{
              offset += (linear % extent) * buffer->strides[axis - 1];
              linear /= extent;
            }}
          }}
          return offset;
        }}
        "#
    );
    SupportBlock::new(STRIDED_OFFSET_BLOCK, code).defines(STRIDED_OFFSET_FN)
}

/// Expression reading element `index` of `buffer` regardless of its layout.
pub(crate) fn load(dtype: DType, buffer: &str, index: &str) -> String {
    let ty = dtype.c_type();
    format!(
        "(*(const {ty}*)((const char*){buffer}->data + {STRIDED_OFFSET_FN}({buffer}, {index})))"
    )
}

pub(crate) fn ensure_dtype(ctx: &AppContext<'_>, dtype: DType) -> ContributorResult<()> {
    let all = ctx.inputs().iter().chain(ctx.outputs());
    for desc in all {
        if desc.dtype != dtype {
            return Err(ContributorError::new(format!(
                "expected {dtype} operands, got {}",
                desc.dtype
            )));
        }
    }
    Ok(())
}

/// Extents of output 0 copied from input `input`.
pub(crate) fn extents_like(ctx: &AppContext<'_>, input: usize) -> Vec<String> {
    let name = ctx.input(input);
    (0..ctx.inputs()[input].rank)
        .map(|axis| format!("{name}->dims[{axis}]"))
        .collect()
}

pub(crate) fn dtype_param(dtype: DType) -> String {
    format!("dtype={dtype}")
}
