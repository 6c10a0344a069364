use fusejit::{AppContext, ContributorError, ContributorResult, DType, OpKind, SupportBlock};

use crate::support::{dtype_param, ensure_dtype, extents_like, load, strided_offset_block};

/// `out = tensor * scalar`, any rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scale {
    pub dtype: DType,
}

impl Scale {
    pub fn new(dtype: DType) -> Self {
        Self { dtype }
    }
}

impl OpKind for Scale {
    fn name(&self) -> &str {
        "scale"
    }

    fn params(&self) -> String {
        dtype_param(self.dtype)
    }

    fn version_fingerprint(&self) -> Option<Vec<u32>> {
        Some(vec![1, 0])
    }

    fn check(&self, ctx: &AppContext<'_>) -> ContributorResult<()> {
        ctx.expect_arity(2, 1)?;
        ensure_dtype(ctx, self.dtype)?;
        if ctx.inputs()[1].rank != 0 {
            return Err(ContributorError::new(format!(
                "factor must be a scalar, got rank {}",
                ctx.inputs()[1].rank
            )));
        }
        if ctx.outputs()[0].rank != ctx.inputs()[0].rank {
            return Err(ContributorError::new(format!(
                "output rank {} differs from input rank {}",
                ctx.outputs()[0].rank,
                ctx.inputs()[0].rank
            )));
        }
        Ok(())
    }

    fn kind_support_code(&self) -> Vec<SupportBlock> {
        vec![strided_offset_block()]
    }

    fn output_extents(&self, ctx: &AppContext<'_>, _index: usize) -> ContributorResult<Vec<String>> {
        Ok(extents_like(ctx, 0))
    }

    fn computation_body(&self, ctx: &AppContext<'_>) -> ContributorResult<String> {
        let ty = self.dtype.c_type();
        let (src, factor, out) = (ctx.input(0), ctx.input(1), ctx.output(0));
        let value = load(self.dtype, &src, "i");
        Ok(format!(
            r#"
            const int64_t count = fusejit_numel({src});
            const {ty} factor = *(const {ty}*){factor}->data;
            {ty}* dst = ({ty}*){out}->data;
            for (int64_t i = 0; i < count; ++i) {{
              dst[i] = ({ty})({value} * factor);
            }}
            "#
        ))
    }
}
