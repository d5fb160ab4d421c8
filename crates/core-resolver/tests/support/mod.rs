#![allow(dead_code)]

//! A scripted gateway for end-to-end tests: interprets marshalled
//! definitions over an in-memory filesystem model instead of a container
//! runtime.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;

use kiln_buildgraph::gateway::{
    DOCKERFILE_FRONTEND, FRONTEND_INPUT_DOCKERFILE, FRONTEND_OPT_FILENAME,
};
use kiln_buildgraph::{
    Definition, ExecOp, Gateway, GatewayError, Op, OutputRef, Reference, SolveRequest, SolveResult,
};

pub type Memfs = BTreeMap<String, Vec<u8>>;
pub type EntrypointHandler = Arc<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>;

#[derive(Default)]
pub struct MockGateway {
    images: Mutex<HashMap<String, Memfs>>,
    client_dirs: Mutex<HashMap<String, Memfs>>,
    /// dockerfile text -> resulting filesystem
    dockerfile_builds: Mutex<HashMap<String, Memfs>>,
    /// `/entrypoint` file contents -> handler
    entrypoints: Mutex<HashMap<String, EntrypointHandler>>,
    /// joined args -> files overlaid on the exec root
    exec_results: Mutex<HashMap<String, Memfs>>,
    /// digest -> previously solved filesystem
    pinned: Mutex<HashMap<String, Memfs>>,
    next_digest: AtomicUsize,
    solves: AtomicUsize,
}

pub fn memfs(files: &[(&str, &str)]) -> Memfs {
    files
        .iter()
        .map(|(path, contents)| (path.to_string(), contents.as_bytes().to_vec()))
        .collect()
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_image(&self, reference: &str, files: &[(&str, &str)]) {
        self.images.lock().insert(reference.to_string(), memfs(files));
    }

    pub fn add_client_dir(&self, id: &str, files: &[(&str, &str)]) {
        self.client_dirs.lock().insert(id.to_string(), memfs(files));
    }

    pub fn add_dockerfile_build(&self, dockerfile: &str, files: &[(&str, &str)]) {
        self.dockerfile_builds
            .lock()
            .insert(dockerfile.to_string(), memfs(files));
    }

    pub fn add_entrypoint(
        &self,
        marker: &str,
        handler: impl Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    ) {
        self.entrypoints
            .lock()
            .insert(marker.to_string(), Arc::new(handler));
    }

    pub fn add_exec_result(&self, args: &[&str], files: &[(&str, &str)]) {
        self.exec_results.lock().insert(args.join("\u{1f}"), memfs(files));
    }

    pub fn solve_count(&self) -> usize {
        self.solves.load(Ordering::SeqCst)
    }

    fn eval(&self, def: &Definition, output: &OutputRef) -> Result<Memfs, GatewayError> {
        let op = def
            .ops
            .get(output.op)
            .ok_or_else(|| GatewayError::Solve(format!("op {} out of range", output.op)))?;
        match op {
            Op::Image { reference, .. } => self
                .images
                .lock()
                .get(reference)
                .cloned()
                .ok_or_else(|| GatewayError::Solve(format!("unknown image `{reference}`"))),
            Op::Local { name } => self
                .client_dirs
                .lock()
                .get(name)
                .cloned()
                .ok_or_else(|| GatewayError::Solve(format!("unknown client dir `{name}`"))),
            Op::Pinned { digest } => self
                .pinned
                .lock()
                .get(digest)
                .cloned()
                .ok_or_else(|| GatewayError::Solve(format!("unknown digest `{digest}`"))),
            Op::Mkfile { input, path, data, .. } => {
                let mut fs = self.eval_input(def, input)?;
                let contents = BASE64
                    .decode(data)
                    .map_err(|e| GatewayError::Solve(e.to_string()))?;
                fs.insert(path.clone(), contents);
                Ok(fs)
            }
            Op::Exec(exec) => self.eval_exec(def, exec, output.mount.as_deref()),
        }
    }

    fn eval_input(
        &self,
        def: &Definition,
        input: &Option<OutputRef>,
    ) -> Result<Memfs, GatewayError> {
        match input {
            Some(output) => self.eval(def, output),
            None => Ok(Memfs::new()),
        }
    }

    fn eval_exec(
        &self,
        def: &Definition,
        exec: &ExecOp,
        want_mount: Option<&str>,
    ) -> Result<Memfs, GatewayError> {
        let root = self.eval_input(def, &exec.input)?;

        let mut mount_contents: HashMap<String, Memfs> = HashMap::new();
        for mount in &exec.mounts {
            mount_contents.insert(mount.dest.clone(), self.eval_input(def, &mount.input)?);
        }

        if exec.args == ["/entrypoint"] {
            let marker = root
                .get("/entrypoint")
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .ok_or_else(|| GatewayError::Solve("package has no /entrypoint".to_string()))?;
            let handler = self
                .entrypoints
                .lock()
                .get(&marker)
                .cloned()
                .ok_or_else(|| {
                    GatewayError::Solve(format!("no entrypoint handler `{marker}`"))
                })?;

            let input_bytes = mount_contents
                .get("/inputs")
                .and_then(|fs| fs.get("/dagger.json"))
                .cloned()
                .ok_or_else(|| GatewayError::Solve("missing /inputs/dagger.json".to_string()))?;
            let request: serde_json::Value = serde_json::from_slice(&input_bytes)
                .map_err(|e| GatewayError::Solve(e.to_string()))?;

            let response = handler(request);
            let mut outputs = Memfs::new();
            outputs.insert(
                "/dagger.json".to_string(),
                serde_json::to_vec(&response).map_err(|e| GatewayError::Solve(e.to_string()))?,
            );

            return match want_mount {
                Some("/outputs") => Ok(outputs),
                Some(other) => mount_contents
                    .get(other)
                    .cloned()
                    .ok_or_else(|| GatewayError::Solve(format!("no mount at `{other}`"))),
                None => Ok(root),
            };
        }

        let overlay = self
            .exec_results
            .lock()
            .get(&exec.args.join("\u{1f}"))
            .cloned()
            .ok_or_else(|| GatewayError::Solve(format!("no scripted exec for {:?}", exec.args)))?;

        match want_mount {
            None => {
                let mut fs = root;
                fs.extend(overlay);
                Ok(fs)
            }
            Some(dest) => mount_contents
                .get(dest)
                .cloned()
                .ok_or_else(|| GatewayError::Solve(format!("no mount at `{dest}`"))),
        }
    }

    fn make_result(&self, fs: Memfs) -> SolveResult {
        let digest = format!("mock:{}", self.next_digest.fetch_add(1, Ordering::SeqCst));
        self.pinned.lock().insert(digest.clone(), fs.clone());
        SolveResult::new(vec![Arc::new(MockReference { digest, fs })])
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn solve(&self, request: SolveRequest) -> Result<SolveResult, GatewayError> {
        self.solves.fetch_add(1, Ordering::SeqCst);

        if let Some(frontend) = &request.frontend {
            if frontend != DOCKERFILE_FRONTEND {
                return Err(GatewayError::Solve(format!("unknown frontend `{frontend}`")));
            }
            let input = request
                .frontend_inputs
                .get(FRONTEND_INPUT_DOCKERFILE)
                .ok_or_else(|| GatewayError::Solve("missing dockerfile input".to_string()))?;
            let context = self.eval(input, &input.result)?;

            let filename = request
                .frontend_opts
                .get(FRONTEND_OPT_FILENAME)
                .map(String::as_str)
                .unwrap_or("Dockerfile");
            let path = if filename.starts_with('/') {
                filename.to_string()
            } else {
                format!("/{filename}")
            };
            let dockerfile = context
                .get(&path)
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .ok_or_else(|| GatewayError::Solve(format!("no dockerfile at `{path}`")))?;

            let built = self
                .dockerfile_builds
                .lock()
                .get(&dockerfile)
                .cloned()
                .ok_or_else(|| {
                    GatewayError::Solve("no scripted build for this dockerfile".to_string())
                })?;
            return Ok(self.make_result(built));
        }

        let def = request
            .definition
            .as_ref()
            .ok_or_else(|| GatewayError::Solve("missing definition".to_string()))?;
        let fs = self.eval(def, &def.result)?;
        Ok(self.make_result(fs))
    }
}

struct MockReference {
    digest: String,
    fs: Memfs,
}

#[async_trait]
impl Reference for MockReference {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, GatewayError> {
        self.fs.get(path).cloned().ok_or_else(|| GatewayError::ReadFile {
            path: path.to_string(),
            reason: "not found".to_string(),
        })
    }

    fn definition(&self) -> Definition {
        Definition {
            ops: vec![Op::Pinned {
                digest: self.digest.clone(),
            }],
            result: OutputRef::root(0),
        }
    }
}
