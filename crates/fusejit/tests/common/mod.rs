#![allow(dead_code)]

use std::sync::Arc;

use fusejit::{
    AppContext, ContributorError, ContributorResult, DType, Graph, GraphBuilder, LinkRequirements,
    OpKind, SupportBlock, VarDesc,
};

/// Configurable op kind: copies input 0 into output 0 and contributes whatever support code
/// the test asks for.
#[derive(Clone)]
pub struct Probe {
    pub name: String,
    pub params: String,
    pub version: Option<Vec<u32>>,
    pub kind_blocks: Vec<SupportBlock>,
    pub app_block: bool,
    pub reject: Option<String>,
    pub link: LinkRequirements,
    pub reentrant: bool,
    pub extents: Option<Vec<String>>,
}

impl Probe {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: String::new(),
            version: Some(vec![1, 0]),
            kind_blocks: Vec::new(),
            app_block: false,
            reject: None,
            link: LinkRequirements::default(),
            reentrant: true,
            extents: None,
        }
    }

    pub fn version(mut self, version: Option<Vec<u32>>) -> Self {
        self.version = version;
        self
    }

    pub fn params(mut self, params: &str) -> Self {
        self.params = params.to_string();
        self
    }

    pub fn block(mut self, block: SupportBlock) -> Self {
        self.kind_blocks.push(block);
        self
    }

    pub fn with_app_block(mut self) -> Self {
        self.app_block = true;
        self
    }

    pub fn rejecting(mut self, message: &str) -> Self {
        self.reject = Some(message.to_string());
        self
    }

    pub fn link(mut self, link: LinkRequirements) -> Self {
        self.link = link;
        self
    }

    pub fn non_reentrant(mut self) -> Self {
        self.reentrant = false;
        self
    }

    pub fn extents(mut self, extents: Vec<String>) -> Self {
        self.extents = Some(extents);
        self
    }

    pub fn arc(self) -> Arc<dyn OpKind> {
        Arc::new(self)
    }
}

impl OpKind for Probe {
    fn name(&self) -> &str {
        &self.name
    }

    fn params(&self) -> String {
        self.params.clone()
    }

    fn version_fingerprint(&self) -> Option<Vec<u32>> {
        self.version.clone()
    }

    fn check(&self, _ctx: &AppContext<'_>) -> ContributorResult<()> {
        match &self.reject {
            Some(message) => Err(ContributorError::new(message.clone())),
            None => Ok(()),
        }
    }

    fn kind_support_code(&self) -> Vec<SupportBlock> {
        self.kind_blocks.clone()
    }

    fn app_support_code(&self, ctx: &AppContext<'_>) -> ContributorResult<Vec<SupportBlock>> {
        if !self.app_block {
            return Ok(Vec::new());
        }
        let symbol = ctx.symbol("helper");
        Ok(vec![SupportBlock::new(
            symbol.clone(),
            format!("static int {symbol}(void) {{ return 7; }}"),
        )
        .defines(symbol)])
    }

    fn output_extents(&self, ctx: &AppContext<'_>, _index: usize) -> ContributorResult<Vec<String>> {
        if let Some(extents) = &self.extents {
            return Ok(extents.clone());
        }
        Ok((0..ctx.outputs()[0].rank)
            .map(|axis| format!("{}->dims[{axis}]", ctx.input(0)))
            .collect())
    }

    fn computation_body(&self, ctx: &AppContext<'_>) -> ContributorResult<String> {
        Ok(format!(
            "memcpy({out}->data, {src}->data, (size_t)fusejit_numel({src}) * sizeof(float));",
            out = ctx.output(0),
            src = ctx.input(0)
        ))
    }

    fn link_requirements(&self) -> LinkRequirements {
        self.link.clone()
    }

    fn reentrant(&self) -> bool {
        self.reentrant
    }
}

pub fn f32_vec() -> VarDesc {
    VarDesc::new(DType::F32, 1)
}

/// `input -> kinds[0] -> kinds[1] -> ... -> output`.
pub fn chain(name: &str, kinds: &[Arc<dyn OpKind>]) -> Graph {
    let mut builder = GraphBuilder::new(name);
    let mut current = builder.add_input(f32_vec());
    for kind in kinds {
        current = builder
            .apply_single(Arc::clone(kind), &[current], f32_vec())
            .expect("apply");
    }
    builder.finish(vec![current]).expect("finish graph")
}
