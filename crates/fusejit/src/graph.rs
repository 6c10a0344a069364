use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::contributor::OpKind;
use crate::dtype::DType;
use crate::error::{JitError, JitResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarId(pub usize);

/// Static description of a variable: element type and rank. Extents are only known per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarDesc {
    pub dtype: DType,
    pub rank: usize,
}

impl VarDesc {
    pub fn new(dtype: DType, rank: usize) -> Self {
        Self { dtype, rank }
    }

    pub fn scalar(dtype: DType) -> Self {
        Self::new(dtype, 0)
    }
}

impl fmt::Display for VarDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/r{}", self.dtype, self.rank)
    }
}

/// One use of an op kind on concrete variables.
#[derive(Clone)]
pub struct Application {
    kind: Arc<dyn OpKind>,
    inputs: Vec<VarId>,
    outputs: Vec<VarId>,
}

impl Application {
    pub fn kind(&self) -> &dyn OpKind {
        self.kind.as_ref()
    }

    pub fn inputs(&self) -> &[VarId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[VarId] {
        &self.outputs
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("kind", &self.kind.name())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

/// Immutable dataflow graph. Applications are stored in a valid execution order.
#[derive(Debug, Clone)]
pub struct Graph {
    name: String,
    variables: Vec<VarDesc>,
    applications: Vec<Application>,
    inputs: Vec<VarId>,
    outputs: Vec<VarId>,
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variables(&self) -> &[VarDesc] {
        &self.variables
    }

    pub fn variable(&self, id: VarId) -> Option<VarDesc> {
        self.variables.get(id.0).copied()
    }

    pub fn applications(&self) -> &[Application] {
        &self.applications
    }

    pub fn inputs(&self) -> &[VarId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[VarId] {
        &self.outputs
    }

    pub fn input_descs(&self) -> Vec<VarDesc> {
        self.inputs.iter().map(|id| self.variables[id.0]).collect()
    }

    pub fn output_descs(&self) -> Vec<VarDesc> {
        self.outputs.iter().map(|id| self.variables[id.0]).collect()
    }
}

pub struct GraphBuilder {
    name: String,
    variables: Vec<VarDesc>,
    produced: Vec<bool>,
    applications: Vec<Application>,
    inputs: Vec<VarId>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variables: Vec::new(),
            produced: Vec::new(),
            applications: Vec::new(),
            inputs: Vec::new(),
        }
    }

    pub fn add_input(&mut self, desc: VarDesc) -> VarId {
        let id = self.push_variable(desc);
        self.produced[id.0] = true;
        self.inputs.push(id);
        id
    }

    /// Appends an application; returns the fresh output variables in declaration order.
    pub fn apply(
        &mut self,
        kind: Arc<dyn OpKind>,
        inputs: &[VarId],
        outputs: &[VarDesc],
    ) -> JitResult<Vec<VarId>> {
        for input in inputs {
            if input.0 >= self.variables.len() {
                return Err(JitError::graph(format!(
                    "op '{}' consumes unknown variable {}",
                    kind.name(),
                    input.0
                )));
            }
        }
        let outputs: Vec<VarId> = outputs
            .iter()
            .map(|desc| {
                let id = self.push_variable(*desc);
                self.produced[id.0] = true;
                id
            })
            .collect();
        self.applications.push(Application {
            kind,
            inputs: inputs.to_vec(),
            outputs: outputs.clone(),
        });
        Ok(outputs)
    }

    pub fn apply_single(
        &mut self,
        kind: Arc<dyn OpKind>,
        inputs: &[VarId],
        output: VarDesc,
    ) -> JitResult<VarId> {
        let outputs = self.apply(kind, inputs, &[output])?;
        Ok(outputs[0])
    }

    pub fn finish(self, outputs: Vec<VarId>) -> JitResult<Graph> {
        let graph_inputs: HashSet<VarId> = self.inputs.iter().copied().collect();
        let mut seen = HashSet::new();
        for output in &outputs {
            if output.0 >= self.variables.len() || !self.produced[output.0] {
                return Err(JitError::graph(format!(
                    "graph output {} is not defined",
                    output.0
                )));
            }
            if graph_inputs.contains(output) {
                return Err(JitError::graph(format!(
                    "graph output {} must be produced by an application, not forwarded from an input",
                    output.0
                )));
            }
            if !seen.insert(*output) {
                return Err(JitError::graph(format!(
                    "graph output {} is listed twice",
                    output.0
                )));
            }
        }
        Ok(Graph {
            name: self.name,
            variables: self.variables,
            applications: self.applications,
            inputs: self.inputs,
            outputs,
        })
    }

    fn push_variable(&mut self, desc: VarDesc) -> VarId {
        let id = VarId(self.variables.len());
        self.variables.push(desc);
        self.produced.push(false);
        id
    }
}
