use std::fmt;

use fusejit::{
    AppContext, ContributorError, ContributorResult, DType, LinkRequirements, OpKind, SupportBlock,
};

use crate::support::{ensure_dtype, extents_like, load, strided_offset_block};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

impl BinaryOp {
    pub fn expr(self, lhs: &str, rhs: &str) -> String {
        match self {
            BinaryOp::Add => format!("({lhs}) + ({rhs})"),
            BinaryOp::Sub => format!("({lhs}) - ({rhs})"),
            BinaryOp::Mul => format!("({lhs}) * ({rhs})"),
            BinaryOp::Div => format!("({lhs}) / ({rhs})"),
            BinaryOp::Max => format!("({lhs}) > ({rhs}) ? ({lhs}) : ({rhs})"),
            BinaryOp::Min => format!("({lhs}) < ({rhs}) ? ({lhs}) : ({rhs})"),
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Max => "max",
            BinaryOp::Min => "min",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Tanh,
    Sqrt,
}

impl UnaryOp {
    /// Float-only: `f32` uses the `*f` variants of `math.h`.
    pub fn expr(self, dtype: DType, arg: &str) -> String {
        let suffix = if dtype == DType::F32 { "f" } else { "" };
        match self {
            UnaryOp::Neg => format!("-({arg})"),
            UnaryOp::Abs => format!("fabs{suffix}({arg})"),
            UnaryOp::Exp => format!("exp{suffix}({arg})"),
            UnaryOp::Log => format!("log{suffix}({arg})"),
            UnaryOp::Tanh => format!("tanh{suffix}({arg})"),
            UnaryOp::Sqrt => format!("sqrt{suffix}({arg})"),
        }
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Abs => "abs",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Sqrt => "sqrt",
        };
        f.write_str(name)
    }
}

/// `out[i] = lhs[i] <op> rhs[i]` over operands of identical extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementwiseBinary {
    pub op: BinaryOp,
    pub dtype: DType,
}

impl ElementwiseBinary {
    pub fn new(op: BinaryOp, dtype: DType) -> Self {
        Self { op, dtype }
    }
}

impl OpKind for ElementwiseBinary {
    fn name(&self) -> &str {
        "elementwise_binary"
    }

    fn params(&self) -> String {
        format!("op={},dtype={}", self.op, self.dtype)
    }

    fn version_fingerprint(&self) -> Option<Vec<u32>> {
        Some(vec![1, 1])
    }

    fn check(&self, ctx: &AppContext<'_>) -> ContributorResult<()> {
        ctx.expect_arity(2, 1)?;
        ensure_dtype(ctx, self.dtype)?;
        let rank = ctx.inputs()[0].rank;
        if ctx.inputs()[1].rank != rank || ctx.outputs()[0].rank != rank {
            return Err(ContributorError::new(format!(
                "operands must share rank {rank}, got {} and output {}",
                ctx.inputs()[1].rank,
                ctx.outputs()[0].rank
            )));
        }
        Ok(())
    }

    fn kind_support_code(&self) -> Vec<SupportBlock> {
        vec![strided_offset_block()]
    }

    fn app_support_code(&self, ctx: &AppContext<'_>) -> ContributorResult<Vec<SupportBlock>> {
        let ty = self.dtype.c_type();
        let combine = ctx.symbol("combine");
        let expr = self.op.expr("lhs", "rhs");
        let code = format!(
            r#"
            static inline {ty} {combine}({ty} lhs, {ty} rhs) {{
              return ({ty})({expr});
            }}
            "#
        );
        Ok(vec![SupportBlock::new(combine.clone(), code)
            .defines(combine)])
    }

    fn output_extents(&self, ctx: &AppContext<'_>, _index: usize) -> ContributorResult<Vec<String>> {
        Ok(extents_like(ctx, 0))
    }

    fn computation_body(&self, ctx: &AppContext<'_>) -> ContributorResult<String> {
        let ty = self.dtype.c_type();
        let (lhs, rhs, out) = (ctx.input(0), ctx.input(1), ctx.output(0));
        let combine = ctx.symbol("combine");
        let fail = ctx.fail("operand extents differ");
        let lhs_value = load(self.dtype, &lhs, "i");
        let rhs_value = load(self.dtype, &rhs, "i");
        let guard = self.division_guard(ctx);
        Ok(format!(
            r#"
            if (!fusejit_same_dims({lhs}, {rhs})) {{
              {fail}
            }}
            const int64_t count = fusejit_numel({lhs});
            {ty}* dst = ({ty}*){out}->data;
            for (int64_t i = 0; i < count; ++i) {{
              const {ty} lhs_value = {lhs_value};
              const {ty} rhs_value = {rhs_value};{guard}
              dst[i] = {combine}(lhs_value, rhs_value);
            }}
            "#
        ))
    }
}

impl ElementwiseBinary {
    /// Integer division traps on a zero divisor and on `MIN / -1`; report both as failures.
    fn division_guard(&self, ctx: &AppContext<'_>) -> String {
        if self.op != BinaryOp::Div || self.dtype.is_float() {
            return String::new();
        }
        let zero = ctx.fail("division by zero");
        let mut guard = format!(
            r#"
              if (rhs_value == 0) {{
                {zero}
              }}"#
        );
        let min = match self.dtype {
            DType::I32 => Some("INT32_MIN"),
            DType::I64 => Some("INT64_MIN"),
            _ => None,
        };
        if let Some(min) = min {
            let overflow = ctx.fail("division overflow");
            guard.push_str(&format!(
                r#"
              if (rhs_value == -1 && lhs_value == {min}) {{
                {overflow}
              }}"#
            ));
        }
        guard
    }
}

/// `out[i] = f(src[i])` for floating point element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementwiseUnary {
    pub op: UnaryOp,
    pub dtype: DType,
}

impl ElementwiseUnary {
    pub fn new(op: UnaryOp, dtype: DType) -> Self {
        Self { op, dtype }
    }
}

impl OpKind for ElementwiseUnary {
    fn name(&self) -> &str {
        "elementwise_unary"
    }

    fn params(&self) -> String {
        format!("op={},dtype={}", self.op, self.dtype)
    }

    fn version_fingerprint(&self) -> Option<Vec<u32>> {
        Some(vec![1, 0])
    }

    fn check(&self, ctx: &AppContext<'_>) -> ContributorResult<()> {
        ctx.expect_arity(1, 1)?;
        if !self.dtype.is_float() {
            return Err(ContributorError::new(format!(
                "{} needs a floating point type, got {}",
                self.op, self.dtype
            )));
        }
        ensure_dtype(ctx, self.dtype)?;
        if ctx.outputs()[0].rank != ctx.inputs()[0].rank {
            return Err(ContributorError::new("output rank differs from input rank"));
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
        let (src, out) = (ctx.input(0), ctx.output(0));
        let value = self.op.expr(self.dtype, &load(self.dtype, &src, "i"));
        Ok(format!(
            r#"
            const int64_t count = fusejit_numel({src});
            {ty}* dst = ({ty}*){out}->data;
            for (int64_t i = 0; i < count; ++i) {{
              dst[i] = {value};
            }}
            "#
        ))
    }

    fn link_requirements(&self) -> LinkRequirements {
        let link = LinkRequirements::new().header("math.h");
        if cfg!(target_os = "windows") {
            link
        } else {
            link.library("m")
        }
    }
}
