// Copyright Exograph, Inc. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file at the root of this repository.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Immutable build-graph construction.
//!
//! States share structure through `Arc`, so composing a large graph is cheap;
//! `marshal` flattens the reachable DAG into a [`Definition`], deduplicating
//! structurally identical ops along the way.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::def::{Definition, DefinitionError, ExecOp, MountOp, Op, OutputRef, SshSocketOp};
use crate::platform::Platform;

#[derive(Debug, Clone)]
pub struct State {
    node: Arc<Node>,
}

#[derive(Debug)]
enum Node {
    Scratch,
    Image { reference: String },
    Local { name: String },
    Mkfile { parent: State, path: String, mode: u32, data: Vec<u8> },
    ExecOutput { exec: Arc<ExecNode>, mount: Option<String> },
    Definition { def: Definition },
}

#[derive(Debug)]
struct ExecNode {
    root: State,
    args: Vec<String>,
    mounts: Vec<MountSpec>,
    ssh_sockets: Vec<SshSocketOp>,
    readonly_rootfs: bool,
    custom_name: Option<String>,
}

#[derive(Debug)]
struct MountSpec {
    dest: String,
    source: Option<State>,
    readonly: bool,
    tmpfs: bool,
    output: bool,
}

impl State {
    fn new(node: Node) -> Self {
        Self { node: Arc::new(node) }
    }

    pub fn scratch() -> Self {
        Self::new(Node::Scratch)
    }

    pub fn image(reference: impl Into<String>) -> Self {
        Self::new(Node::Image { reference: reference.into() })
    }

    /// A directory streamed from the client, identified out-of-band by `name`.
    pub fn local(name: impl Into<String>) -> Self {
        Self::new(Node::Local { name: name.into() })
    }

    /// Re-enter a previously marshalled definition so it can be composed
    /// with further ops.
    pub fn from_definition(def: Definition) -> Self {
        Self::new(Node::Definition { def })
    }

    /// Write a single file on top of this state.
    pub fn file(&self, path: impl Into<String>, mode: u32, data: impl Into<Vec<u8>>) -> Self {
        Self::new(Node::Mkfile {
            parent: self.clone(),
            path: path.into(),
            mode,
            data: data.into(),
        })
    }

    /// Start an exec rooted at this state. The returned builder collects
    /// mounts and options before being finalized with [`Exec::root`] or
    /// [`Exec::output_mount`].
    pub fn run(&self, args: Vec<String>) -> Exec {
        Exec {
            root: self.clone(),
            args,
            mounts: Vec::new(),
            ssh_sockets: Vec::new(),
            readonly_rootfs: false,
            custom_name: None,
        }
    }

    /// Flatten the DAG reachable from this state into a definition. Image
    /// pulls that carry no explicit platform are stamped with `platform`.
    pub fn marshal(&self, platform: Option<&Platform>) -> Result<Definition, DefinitionError> {
        let mut marshaller = Marshaller {
            platform,
            ops: Vec::new(),
            dedup: HashMap::new(),
            visited_execs: HashMap::new(),
        };
        let result = marshaller
            .visit(self)?
            .ok_or(DefinitionError::EmptyState)?;
        Ok(Definition { ops: marshaller.ops, result })
    }
}

pub struct Exec {
    root: State,
    args: Vec<String>,
    mounts: Vec<MountSpec>,
    ssh_sockets: Vec<SshSocketOp>,
    readonly_rootfs: bool,
    custom_name: Option<String>,
}

impl Exec {
    /// Mount `source` read-write at `dest`; the mount's final contents become
    /// addressable through [`Exec::output_mount`]-style selection only when
    /// added with that method, so plain mounts do not produce outputs.
    pub fn mount(mut self, dest: impl Into<String>, source: State) -> Self {
        self.mounts.push(MountSpec {
            dest: dest.into(),
            source: Some(source),
            readonly: false,
            tmpfs: false,
            output: false,
        });
        self
    }

    pub fn readonly_mount(mut self, dest: impl Into<String>, source: State) -> Self {
        self.mounts.push(MountSpec {
            dest: dest.into(),
            source: Some(source),
            readonly: true,
            tmpfs: false,
            output: false,
        });
        self
    }

    pub fn tmpfs(mut self, dest: impl Into<String>) -> Self {
        self.mounts.push(MountSpec {
            dest: dest.into(),
            source: None,
            readonly: false,
            tmpfs: true,
            output: false,
        });
        self
    }

    pub fn ssh_socket(mut self, id: impl Into<String>, target: impl Into<String>) -> Self {
        self.ssh_sockets.push(SshSocketOp { id: id.into(), target: target.into() });
        self
    }

    pub fn readonly_rootfs(mut self) -> Self {
        self.readonly_rootfs = true;
        self
    }

    pub fn custom_name(mut self, name: impl Into<String>) -> Self {
        self.custom_name = Some(name.into());
        self
    }

    /// Finalize, selecting the exec's root filesystem.
    pub fn root(self) -> State {
        State::new(Node::ExecOutput { exec: Arc::new(self.into_node()), mount: None })
    }

    /// Add one more mount at `dest`, finalize, and select that mount's final
    /// contents as the output.
    pub fn output_mount(mut self, dest: impl Into<String>, source: State) -> State {
        let dest = dest.into();
        self.mounts.push(MountSpec {
            dest: dest.clone(),
            source: Some(source),
            readonly: false,
            tmpfs: false,
            output: true,
        });
        State::new(Node::ExecOutput { exec: Arc::new(self.into_node()), mount: Some(dest) })
    }

    fn into_node(self) -> ExecNode {
        ExecNode {
            root: self.root,
            args: self.args,
            mounts: self.mounts,
            ssh_sockets: self.ssh_sockets,
            readonly_rootfs: self.readonly_rootfs,
            custom_name: self.custom_name,
        }
    }
}

struct Marshaller<'a> {
    platform: Option<&'a Platform>,
    ops: Vec<Op>,
    dedup: HashMap<String, usize>,
    visited_execs: HashMap<*const ExecNode, usize>,
}

impl Marshaller<'_> {
    fn push(&mut self, op: Op) -> Result<usize, DefinitionError> {
        let encoded = serde_json::to_string(&op)?;
        if let Some(&index) = self.dedup.get(&encoded) {
            return Ok(index);
        }
        let index = self.ops.len();
        self.ops.push(op);
        self.dedup.insert(encoded, index);
        Ok(index)
    }

    /// Returns `None` for scratch, which has no op at all.
    fn visit(&mut self, state: &State) -> Result<Option<OutputRef>, DefinitionError> {
        match &*state.node {
            Node::Scratch => Ok(None),
            Node::Image { reference } => {
                let op = self.push(Op::Image {
                    reference: reference.clone(),
                    platform: self.platform.cloned(),
                })?;
                Ok(Some(OutputRef::root(op)))
            }
            Node::Local { name } => {
                let op = self.push(Op::Local { name: name.clone() })?;
                Ok(Some(OutputRef::root(op)))
            }
            Node::Mkfile { parent, path, mode, data } => {
                let input = self.visit(parent)?;
                let op = self.push(Op::Mkfile {
                    input,
                    path: path.clone(),
                    mode: *mode,
                    data: BASE64.encode(data),
                })?;
                Ok(Some(OutputRef::root(op)))
            }
            Node::ExecOutput { exec, mount } => {
                let op = self.visit_exec(exec)?;
                Ok(Some(OutputRef { op, mount: mount.clone() }))
            }
            Node::Definition { def } => self.splice(def).map(Some),
        }
    }

    fn visit_exec(&mut self, exec: &Arc<ExecNode>) -> Result<usize, DefinitionError> {
        // Two outputs of one exec must resolve to the same op, so execs are
        // tracked by identity rather than by structure.
        if let Some(&index) = self.visited_execs.get(&Arc::as_ptr(exec)) {
            return Ok(index);
        }

        let input = self.visit(&exec.root)?;
        let mut mounts = Vec::with_capacity(exec.mounts.len());
        for mount in &exec.mounts {
            let input = match &mount.source {
                Some(source) => self.visit(source)?,
                None => None,
            };
            mounts.push(MountOp {
                dest: mount.dest.clone(),
                input,
                readonly: mount.readonly,
                tmpfs: mount.tmpfs,
                output: mount.output,
            });
        }

        let index = self.push(Op::Exec(ExecOp {
            input,
            args: exec.args.clone(),
            mounts,
            ssh_sockets: exec.ssh_sockets.clone(),
            readonly_rootfs: exec.readonly_rootfs,
            custom_name: exec.custom_name.clone(),
        }))?;
        self.visited_execs.insert(Arc::as_ptr(exec), index);
        Ok(index)
    }

    /// Inline a previously marshalled definition, remapping its op indices
    /// into this table.
    fn splice(&mut self, def: &Definition) -> Result<OutputRef, DefinitionError> {
        let mut remap = Vec::with_capacity(def.ops.len());
        for op in &def.ops {
            let mut op = op.clone();
            remap_op_inputs(&mut op, &remap)?;
            remap.push(self.push(op)?);
        }
        remap_ref(&def.result, &remap)
    }
}

fn remap_ref(output: &OutputRef, remap: &[usize]) -> Result<OutputRef, DefinitionError> {
    match remap.get(output.op) {
        Some(&op) => Ok(OutputRef { op, mount: output.mount.clone() }),
        None => Err(DefinitionError::Malformed(format!(
            "op {} referenced before it is defined",
            output.op
        ))),
    }
}

fn remap_op_inputs(op: &mut Op, remap: &[usize]) -> Result<(), DefinitionError> {
    let remap_opt = |input: &mut Option<OutputRef>| -> Result<(), DefinitionError> {
        if let Some(output) = input {
            *output = remap_ref(output, remap)?;
        }
        Ok(())
    };

    match op {
        Op::Image { .. } | Op::Local { .. } | Op::Pinned { .. } => Ok(()),
        Op::Mkfile { input, .. } => remap_opt(input),
        Op::Exec(exec) => {
            remap_opt(&mut exec.input)?;
            for mount in &mut exec.mounts {
                remap_opt(&mut mount.input)?;
            }
            Ok(())
        }
    }
}
