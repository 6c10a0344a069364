use fusejit::{AppContext, ContributorError, ContributorResult, DType, OpKind, SupportBlock};

use crate::support::{dtype_param, ensure_dtype, load, strided_offset_block};

/// Sum of every element, producing a scalar. Floats accumulate in `double`, integers in
/// `int64_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceSum {
    pub dtype: DType,
}

impl ReduceSum {
    pub fn new(dtype: DType) -> Self {
        Self { dtype }
    }
}

impl OpKind for ReduceSum {
    fn name(&self) -> &str {
        "reduce_sum"
    }

    fn params(&self) -> String {
        dtype_param(self.dtype)
    }

    fn version_fingerprint(&self) -> Option<Vec<u32>> {
        Some(vec![1, 0])
    }

    fn check(&self, ctx: &AppContext<'_>) -> ContributorResult<()> {
        ctx.expect_arity(1, 1)?;
        ensure_dtype(ctx, self.dtype)?;
        if ctx.outputs()[0].rank != 0 {
            return Err(ContributorError::new(format!(
                "sum produces a scalar, output declared rank {}",
                ctx.outputs()[0].rank
            )));
        }
        Ok(())
    }

    fn kind_support_code(&self) -> Vec<SupportBlock> {
        vec![strided_offset_block()]
    }

    fn output_extents(&self, _ctx: &AppContext<'_>, _index: usize) -> ContributorResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn computation_body(&self, ctx: &AppContext<'_>) -> ContributorResult<String> {
        let ty = self.dtype.c_type();
        let acc = if self.dtype.is_float() { "double" } else { "int64_t" };
        let (src, out) = (ctx.input(0), ctx.output(0));
        let value = load(self.dtype, &src, "i");
        Ok(format!(
            r#"
            const int64_t count = fusejit_numel({src});
            {acc} total = 0;
            for (int64_t i = 0; i < count; ++i) {{
              total += ({acc}){value};
            }}
            *({ty}*){out}->data = ({ty})total;
            "#
        ))
    }
}
