//! Module assembly: walks a graph's applications in order, asks every op kind for its fragments
//! and splices them into one C translation unit with a single entry point.

mod prelude;
pub(crate) mod utils;

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::contributor::{AppContext, LinkRequirements, OpKind, SupportBlock};
use crate::error::{ContributorError, JitError, JitResult};
use crate::graph::{Graph, VarDesc, VarId};
use crate::naming::SymbolNamer;

use prelude::{emit_includes, emit_prelude, PRELUDE_BLOCK_ID, RESERVED_SYMBOLS};
use utils::{comment_safe, escape_c_string, push_block, push_line};

pub const ENTRY_SYMBOL: &str = "fusejit_entry";
pub const INIT_SYMBOL: &str = "fusejit_init";
pub const ABI_SYMBOL: &str = "fusejit_abi_version";
/// Bumped whenever the buffer/runtime structs or the entry signature change.
pub const ABI_VERSION: u32 = 1;

/// A variable as seen by one application or by the entry point: its structural index in the
/// graph plus its static description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binding {
    pub var: usize,
    pub desc: VarDesc,
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}:{}", self.var, self.desc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApplicationSignature {
    pub name: String,
    pub kind: String,
    pub params: String,
    pub version: Option<Vec<u32>>,
    pub inputs: Vec<Binding>,
    pub outputs: Vec<Binding>,
}

impl ApplicationSignature {
    pub fn is_versioned(&self) -> bool {
        matches!(&self.version, Some(version) if !version.is_empty())
    }
}

impl fmt::Display for ApplicationSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version = match &self.version {
            Some(version) if !version.is_empty() => version
                .iter()
                .map(|part| part.to_string())
                .collect::<Vec<_>>()
                .join("."),
            _ => "unversioned".to_string(),
        };
        write!(
            f,
            "{}: {}({}) v{} [{}] -> [{}]",
            self.name,
            self.kind,
            self.params,
            version,
            join_display(&self.inputs),
            join_display(&self.outputs)
        )
    }
}

/// Output of the assembler: the translation unit and everything needed to key, build and call
/// it.
#[derive(Debug, Clone)]
pub struct AssembledModule {
    pub source: String,
    pub link: LinkRequirements,
    pub inputs: Vec<Binding>,
    pub outputs: Vec<Binding>,
    pub applications: Vec<ApplicationSignature>,
    pub reentrant: bool,
    pub has_init: bool,
}

impl AssembledModule {
    pub fn input_descs(&self) -> Vec<VarDesc> {
        self.inputs.iter().map(|binding| binding.desc).collect()
    }

    pub fn output_descs(&self) -> Vec<VarDesc> {
        self.outputs.iter().map(|binding| binding.desc).collect()
    }

    /// Kinds that did not provide a version fingerprint.
    pub fn unversioned_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self
            .applications
            .iter()
            .filter(|app| !app.is_versioned())
            .map(|app| app.kind.as_str())
            .collect();
        kinds.sort_unstable();
        kinds.dedup();
        kinds
    }

    pub fn is_versioned(&self) -> bool {
        self.applications.iter().all(ApplicationSignature::is_versioned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Input(usize),
    Output(usize),
    Temp(usize),
}

impl Slot {
    fn read_expr(self) -> String {
        match self {
            Slot::Input(index) => format!("inputs[{index}]"),
            Slot::Output(index) => format!("outputs[{index}]"),
            Slot::Temp(index) => format!("fusejit_temps[{index}]"),
        }
    }
}

struct AppPlan {
    name: String,
    inputs: Vec<Slot>,
    outputs: Vec<(Slot, VarDesc, Vec<String>)>,
    body: String,
}

/// Ordered, deduplicated support blocks sharing one global symbol table.
#[derive(Default)]
struct SupportSet {
    blocks: Vec<SupportBlock>,
    index: HashMap<String, usize>,
}

impl SupportSet {
    fn insert(
        &mut self,
        block: SupportBlock,
        owner: &str,
        symbols: &mut HashMap<String, String>,
    ) -> JitResult<()> {
        if let Some(existing) = self.index.get(&block.id) {
            if self.blocks[*existing] != block {
                return Err(JitError::assembly(format!(
                    "support block '{}' from {owner} differs from an earlier contribution with the same id",
                    block.id
                )));
            }
            return Ok(());
        }
        for symbol in &block.symbols {
            if let Some(other) = symbols.get(symbol) {
                if other != &block.id {
                    return Err(JitError::assembly(format!(
                        "duplicate symbol '{symbol}': defined by '{other}' and by '{}' from {owner}",
                        block.id
                    )));
                }
            }
            symbols.insert(symbol.clone(), block.id.clone());
        }
        self.index.insert(block.id.clone(), self.blocks.len());
        self.blocks.push(block);
        Ok(())
    }

    /// Blocks in first-contribution order, moved after their dependencies.
    fn ordered(&self, emitted: &HashSet<String>) -> JitResult<Vec<&SupportBlock>> {
        let mut order = Vec::with_capacity(self.blocks.len());
        let mut done: HashSet<&str> = HashSet::new();
        let mut visiting: HashSet<&str> = HashSet::new();
        for block in &self.blocks {
            self.visit(block, emitted, &mut done, &mut visiting, &mut order)?;
        }
        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        block: &'a SupportBlock,
        emitted: &HashSet<String>,
        done: &mut HashSet<&'a str>,
        visiting: &mut HashSet<&'a str>,
        order: &mut Vec<&'a SupportBlock>,
    ) -> JitResult<()> {
        if done.contains(block.id.as_str()) {
            return Ok(());
        }
        if !visiting.insert(block.id.as_str()) {
            return Err(JitError::assembly(format!(
                "support block '{}' is part of a dependency cycle",
                block.id
            )));
        }
        for dep in &block.depends_on {
            if emitted.contains(dep) {
                continue;
            }
            let Some(position) = self.index.get(dep) else {
                return Err(JitError::assembly(format!(
                    "support block '{}' depends on unknown block '{dep}'",
                    block.id
                )));
            };
            self.visit(&self.blocks[*position], emitted, done, visiting, order)?;
        }
        visiting.remove(block.id.as_str());
        done.insert(block.id.as_str());
        order.push(block);
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ModuleAssembler;

impl ModuleAssembler {
    pub fn new() -> Self {
        Self
    }

    pub fn assemble(&self, graph: &Graph) -> JitResult<AssembledModule> {
        let slots = assign_slots(graph);
        let temp_count = slots
            .values()
            .filter(|slot| matches!(slot, Slot::Temp(_)))
            .count();

        let mut namer = SymbolNamer::new();
        let mut symbols: HashMap<String, String> = RESERVED_SYMBOLS
            .iter()
            .map(|symbol| (symbol.to_string(), PRELUDE_BLOCK_ID.to_string()))
            .collect();
        let mut kind_blocks = SupportSet::default();
        let mut app_blocks = SupportSet::default();
        let mut link = LinkRequirements::default();
        let mut reentrant = true;
        let mut signatures = Vec::with_capacity(graph.applications().len());
        let mut plans = Vec::with_capacity(graph.applications().len());

        for app in graph.applications() {
            let kind = app.kind();
            let name = namer.application_name(kind.name());
            let input_bindings = bindings(graph, app.inputs());
            let output_bindings = bindings(graph, app.outputs());
            let input_descs: Vec<VarDesc> = input_bindings.iter().map(|b| b.desc).collect();
            let output_descs: Vec<VarDesc> = output_bindings.iter().map(|b| b.desc).collect();
            let ctx = AppContext::new(&name, &input_descs, &output_descs);
            let wrap = |err: ContributorError| contributor_error(kind, &name, err);

            kind.check(&ctx).map_err(wrap)?;

            let owner = format!("op '{}' ({name})", kind.name());
            for block in kind.kind_support_code() {
                kind_blocks.insert(block, &owner, &mut symbols)?;
            }
            for block in kind.app_support_code(&ctx).map_err(wrap)? {
                app_blocks.insert(block, &owner, &mut symbols)?;
            }

            let mut outputs = Vec::with_capacity(output_descs.len());
            for (index, (var, desc)) in app.outputs().iter().zip(&output_descs).enumerate() {
                let extents = kind.output_extents(&ctx, index).map_err(wrap)?;
                if extents.len() != desc.rank {
                    return Err(wrap(ContributorError::new(format!(
                        "output {index} declares rank {} but {} extent(s) were provided",
                        desc.rank,
                        extents.len()
                    ))));
                }
                outputs.push((slots[var], *desc, extents));
            }
            let body = kind.computation_body(&ctx).map_err(wrap)?;

            link.merge(&kind.link_requirements());
            reentrant &= kind.reentrant();
            signatures.push(ApplicationSignature {
                name: name.clone(),
                kind: kind.name().to_string(),
                params: kind.params(),
                version: kind.version_fingerprint(),
                inputs: input_bindings,
                outputs: output_bindings,
            });
            plans.push(AppPlan {
                name,
                inputs: app.inputs().iter().map(|var| slots[var]).collect(),
                outputs,
                body,
            });
        }

        let inputs = bindings(graph, graph.inputs());
        let outputs = bindings(graph, graph.outputs());

        let mut module = String::new();
        emit_header(&mut module, &inputs, &outputs, &signatures, &link);
        emit_includes(&mut module, &link.headers);
        emit_prelude(&mut module);

        let mut emitted: HashSet<String> = HashSet::new();
        emitted.insert(PRELUDE_BLOCK_ID.to_string());
        for block in kind_blocks.ordered(&emitted)? {
            emit_support_block(&mut module, block);
        }
        emitted.extend(kind_blocks.blocks.iter().map(|block| block.id.clone()));
        for block in app_blocks.ordered(&emitted)? {
            emit_support_block(&mut module, block);
        }

        emit_entry(&mut module, &plans, inputs.len(), outputs.len(), temp_count);
        let has_init = !link.init_code.is_empty();
        if has_init {
            emit_init(&mut module, &link.init_code);
        }
        push_block(
            &mut module,
            0,
            &format!("FUSEJIT_EXPORT uint32_t {ABI_SYMBOL}(void) {{ return {ABI_VERSION}u; }}"),
        );

        Ok(AssembledModule {
            source: module,
            link,
            inputs,
            outputs,
            applications: signatures,
            reentrant,
            has_init,
        })
    }
}

fn contributor_error(kind: &dyn OpKind, application: &str, err: ContributorError) -> JitError {
    JitError::Contributor {
        kind: kind.name().to_string(),
        application: application.to_string(),
        message: err.message().to_string(),
    }
}

fn bindings(graph: &Graph, vars: &[VarId]) -> Vec<Binding> {
    vars.iter()
        .map(|var| Binding {
            var: var.0,
            desc: graph.variables()[var.0],
        })
        .collect()
}

fn assign_slots(graph: &Graph) -> HashMap<VarId, Slot> {
    let mut slots = HashMap::new();
    for (index, var) in graph.inputs().iter().enumerate() {
        slots.insert(*var, Slot::Input(index));
    }
    for (index, var) in graph.outputs().iter().enumerate() {
        slots.insert(*var, Slot::Output(index));
    }
    let mut temps = 0usize;
    for app in graph.applications() {
        for var in app.outputs() {
            slots.entry(*var).or_insert_with(|| {
                let slot = Slot::Temp(temps);
                temps += 1;
                slot
            });
        }
    }
    slots
}

fn join_display<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Everything the cache key is derived from is echoed here, so identical source text implies
/// an identical key.
fn emit_header(
    module: &mut String,
    inputs: &[Binding],
    outputs: &[Binding],
    signatures: &[ApplicationSignature],
    link: &LinkRequirements,
) {
    module.push_str("/* fusejit generated module\n");
    module.push_str(&format!(" * abi: {ABI_VERSION}\n"));
    module.push_str(&format!(" * inputs: [{}]\n", join_display(inputs)));
    module.push_str(&format!(" * outputs: [{}]\n", join_display(outputs)));
    for signature in signatures {
        module.push_str(&format!(" * {}\n", comment_safe(&signature.to_string())));
    }
    let lists = [
        ("headers", &link.headers),
        ("libraries", &link.libraries),
        ("lib_dirs", &link.lib_dirs),
        ("include_dirs", &link.include_dirs),
        ("compile_flags", &link.compile_flags),
        ("link_flags", &link.link_flags),
    ];
    for (label, values) in lists {
        if !values.is_empty() {
            module.push_str(&format!(
                " * {label}: {}\n",
                comment_safe(&values.join(" "))
            ));
        }
    }
    module.push_str(" */\n\n");
}

fn emit_support_block(module: &mut String, block: &SupportBlock) {
    push_line(module, 0, &format!("/* {} */", comment_safe(&block.id)));
    push_block(module, 0, &block.code);
    module.push('\n');
}

fn emit_entry(
    module: &mut String,
    plans: &[AppPlan],
    input_count: usize,
    output_count: usize,
    temp_count: usize,
) {
    push_block(
        module,
        0,
        &format!(
            r#"
            FUSEJIT_EXPORT int {ENTRY_SYMBOL}(
                const fusejit_runtime* rt,
                const fusejit_buffer* const* inputs,
                size_t n_inputs,
                fusejit_buffer** outputs,
                size_t n_outputs) {{
            "#
        ),
    );
    push_line(module, 1, "int fusejit_status = 0;");
    if temp_count > 0 {
        push_line(
            module,
            1,
            &format!("fusejit_buffer* fusejit_temps[{temp_count}] = {{0}};"),
        );
    }
    push_block(
        module,
        1,
        &format!(
            r#"
            if (n_inputs != {input_count}u || n_outputs != {output_count}u) {{
              rt->fail(rt->ctx, "expected {input_count} input(s) and {output_count} output(s)");
              return 1;
            }}
            (void)inputs;
            (void)outputs;
            "#
        ),
    );

    for plan in plans {
        emit_application(module, plan);
    }

    push_line(module, 0, "fusejit_cleanup:");
    if temp_count > 0 {
        push_block(
            module,
            1,
            &format!(
                r#"
                for (size_t index = 0; index < {temp_count}u; ++index) {{
                  if (fusejit_temps[index] != NULL) {{
                    rt->release(rt->ctx, fusejit_temps[index]);
                  }}
                }}
                "#
            ),
        );
    }
    push_line(module, 1, "return fusejit_status;");
    push_line(module, 0, "}");
    module.push('\n');
}

fn emit_application(module: &mut String, plan: &AppPlan) {
    let name = &plan.name;
    push_line(module, 1, &format!("/* {name} */"));
    push_line(module, 1, "{");
    for (index, slot) in plan.inputs.iter().enumerate() {
        push_line(
            module,
            2,
            &format!("const fusejit_buffer* in{index} = {};", slot.read_expr()),
        );
    }
    for (index, _) in plan.outputs.iter().enumerate() {
        push_line(module, 2, &format!("fusejit_buffer* out{index};"));
    }
    for (index, (slot, desc, extents)) in plan.outputs.iter().enumerate() {
        let dims = if extents.is_empty() {
            format!("const int64_t* out{index}_dims = NULL;")
        } else {
            format!(
                "const int64_t out{index}_dims[{}] = {{{}}};",
                extents.len(),
                extents.join(", ")
            )
        };
        let message = escape_c_string(&format!("{name}: cannot allocate output {index}"));
        let slot_expr = slot.read_expr();
        push_block(
            module,
            2,
            &format!(
                r#"
                {{
                  {dims}
                  if (fusejit_ensure_output(rt, &{slot_expr}, {tag}, {rank}u, out{index}_dims) != 0) {{
                    FUSEJIT_FAIL("{message}");
                  }}
                }}
                out{index} = {slot_expr};
                "#,
                tag = desc.dtype.c_tag(),
                rank = desc.rank,
            ),
        );
    }
    push_line(module, 2, "{");
    push_block(module, 3, &plan.body);
    push_line(module, 2, "}");
    push_line(module, 1, "}");
}

fn emit_init(module: &mut String, init_code: &[String]) {
    push_line(
        module,
        0,
        &format!("FUSEJIT_EXPORT int {INIT_SYMBOL}(const fusejit_runtime* rt) {{"),
    );
    push_line(module, 1, "(void)rt;");
    for code in init_code {
        push_line(module, 1, "{");
        push_block(module, 2, code);
        push_line(module, 1, "}");
    }
    push_line(module, 1, "return 0;");
    push_line(module, 0, "}");
    module.push('\n');
}
