#![allow(dead_code)]

//! In-memory stand-ins for the cloud, agents, global cache, event log and
//! director task.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use pkgcompile::agent::{AgentClient, AgentConnector, CompilePackageRequest};
use pkgcompile::cloud::{Cloud, CloudError, NetworkSettings, VmMetadata};
use pkgcompile::engine::{DirectorTask, EventLog, GlobalCache};
use pkgcompile::errors::{CompileError, Result};
use pkgcompile::store::VmRecord;
use pkgcompile::types::{CompiledArtifact, CompiledPackage, Package};

/// Arguments of one `create_vm` call.
#[derive(Debug, Clone)]
pub struct CreateVmCall {
    pub agent_id: String,
    pub stemcell_cid: String,
    pub cloud_properties: Value,
    pub networks: NetworkSettings,
    pub disk_cids: Vec<String>,
    pub env: Value,
}

#[derive(Default)]
struct CloudState {
    next_cid: u64,
    create_calls: Vec<CreateVmCall>,
    create_failures: VecDeque<CloudError>,
    created: Vec<String>,
    deleted: Vec<String>,
    live: BTreeSet<String>,
    max_live: usize,
    metadata: Vec<(String, VmMetadata)>,
    fail_metadata: bool,
}

/// A cloud that hands out `vm-<n>` cids and records every call.
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `create_vm` call fail with `err`. Queued in order.
    pub fn fail_next_create(&self, err: CloudError) {
        self.state.lock().unwrap().create_failures.push_back(err);
    }

    pub fn fail_metadata(&self) {
        self.state.lock().unwrap().fail_metadata = true;
    }

    pub fn create_calls(&self) -> Vec<CreateVmCall> {
        self.state.lock().unwrap().create_calls.clone()
    }

    pub fn created_vms(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn deleted_vms(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn live_vms(&self) -> Vec<String> {
        self.state.lock().unwrap().live.iter().cloned().collect()
    }

    /// Highest number of VMs alive at the same time.
    pub fn max_live_vms(&self) -> usize {
        self.state.lock().unwrap().max_live
    }

    /// Every metadata update sent for `cid`, in order.
    pub fn metadata_for(&self, cid: &str) -> Vec<VmMetadata> {
        self.state
            .lock()
            .unwrap()
            .metadata
            .iter()
            .filter(|(c, _)| c == cid)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[async_trait]
impl Cloud for FakeCloud {
    async fn create_vm(
        &self,
        agent_id: &str,
        stemcell_cid: &str,
        cloud_properties: &Value,
        networks: &NetworkSettings,
        disk_cids: &[String],
        env: &Value,
    ) -> std::result::Result<String, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.create_calls.push(CreateVmCall {
            agent_id: agent_id.to_string(),
            stemcell_cid: stemcell_cid.to_string(),
            cloud_properties: cloud_properties.clone(),
            networks: networks.clone(),
            disk_cids: disk_cids.to_vec(),
            env: env.clone(),
        });
        if let Some(err) = state.create_failures.pop_front() {
            return Err(err);
        }

        state.next_cid += 1;
        let cid = format!("vm-{}", state.next_cid);
        state.created.push(cid.clone());
        state.live.insert(cid.clone());
        state.max_live = state.max_live.max(state.live.len());
        Ok(cid)
    }

    async fn delete_vm(&self, vm_cid: &str) -> std::result::Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        state.deleted.push(vm_cid.to_string());
        state.live.remove(vm_cid);
        Ok(())
    }

    async fn set_vm_metadata(&self, vm_cid: &str, metadata: &VmMetadata) -> std::result::Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_metadata {
            return Err(CloudError::Other("metadata not supported".to_string()));
        }
        state.metadata.push((vm_cid.to_string(), metadata.clone()));
        Ok(())
    }
}

/// One `compile_package` call as seen by an agent.
#[derive(Debug, Clone)]
pub struct CompileCall {
    pub agent_id: String,
    pub request: CompilePackageRequest,
}

#[derive(Default)]
struct AgentState {
    compile_calls: Vec<CompileCall>,
    failing_packages: BTreeSet<String>,
    unreachable: bool,
    applied: Vec<(String, Value)>,
    settings: Vec<(String, String)>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Connects every VM to a [`FakeAgent`] sharing one recorded state.
#[derive(Clone, Default)]
pub struct FakeAgentConnector {
    state: Arc<Mutex<AgentState>>,
    compile_delay: Duration,
}

impl FakeAgentConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make each compile take `delay`, so concurrency is observable.
    pub fn with_compile_delay(mut self, delay: Duration) -> Self {
        self.compile_delay = delay;
        self
    }

    /// Compiling `package` fails with an agent error.
    pub fn fail_package(&self, package: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_packages
            .insert(package.to_string());
    }

    /// Agents never come up; `wait_until_ready` times out.
    pub fn unreachable(&self) {
        self.state.lock().unwrap().unreachable = true;
    }

    pub fn compile_calls(&self) -> Vec<CompileCall> {
        self.state.lock().unwrap().compile_calls.clone()
    }

    /// Names of compiled packages, in RPC order.
    pub fn compiled_names(&self) -> Vec<String> {
        self.compile_calls()
            .into_iter()
            .map(|c| c.request.name)
            .collect()
    }

    pub fn compile_request(&self, package: &str) -> Option<CompilePackageRequest> {
        self.compile_calls()
            .into_iter()
            .find(|c| c.request.name == package)
            .map(|c| c.request)
    }

    pub fn applied_specs(&self) -> Vec<(String, Value)> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn settings_updates(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().settings.clone()
    }

    pub fn max_concurrent_compiles(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }
}

impl AgentConnector for FakeAgentConnector {
    fn connect(&self, vm: &VmRecord) -> Arc<dyn AgentClient> {
        Arc::new(FakeAgent {
            agent_id: vm.agent_id.clone(),
            state: Arc::clone(&self.state),
            compile_delay: self.compile_delay,
        })
    }
}

pub struct FakeAgent {
    agent_id: String,
    state: Arc<Mutex<AgentState>>,
    compile_delay: Duration,
}

#[async_trait]
impl AgentClient for FakeAgent {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn wait_until_ready(&self) -> Result<()> {
        if self.state.lock().unwrap().unreachable {
            return Err(CompileError::RpcTimeout {
                method: "get_state".to_string(),
                agent_id: self.agent_id.clone(),
            });
        }
        Ok(())
    }

    async fn update_settings(&self, trusted_certs: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .settings
            .push((self.agent_id.clone(), trusted_certs.to_string()));
        Ok(())
    }

    async fn apply(&self, spec: &Value) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .applied
            .push((self.agent_id.clone(), spec.clone()));
        Ok(())
    }

    async fn compile_package(&self, request: &CompilePackageRequest) -> Result<CompiledArtifact> {
        let fail = {
            let mut state = self.state.lock().unwrap();
            state.compile_calls.push(CompileCall {
                agent_id: self.agent_id.clone(),
                request: request.clone(),
            });
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.failing_packages.contains(&request.name)
        };

        if !self.compile_delay.is_zero() {
            tokio::time::sleep(self.compile_delay).await;
        }

        self.state.lock().unwrap().in_flight -= 1;

        if fail {
            return Err(CompileError::Agent {
                method: "compile_package".to_string(),
                message: format!("compilation of {} failed", request.name),
            });
        }
        Ok(CompiledArtifact {
            sha1: format!("compiled-sha1-{}-{}", request.name, request.version),
            blobstore_id: format!("compiled-blob-{}-{}", request.name, request.version),
        })
    }
}

/// Global cache backed by a map, recording saves.
#[derive(Default)]
pub struct FakeGlobalCache {
    entries: Mutex<HashMap<String, CompiledArtifact>>,
    saves: Mutex<Vec<(String, CompiledPackage)>>,
    broken: Mutex<bool>,
}

impl FakeGlobalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, cache_key: &str, artifact: CompiledArtifact) {
        self.entries
            .lock()
            .unwrap()
            .insert(cache_key.to_string(), artifact);
    }

    /// Every operation fails from now on.
    pub fn break_cache(&self) {
        *self.broken.lock().unwrap() = true;
    }

    pub fn saves(&self) -> Vec<(String, CompiledPackage)> {
        self.saves.lock().unwrap().clone()
    }

    fn check(&self) -> Result<()> {
        if *self.broken.lock().unwrap() {
            return Err(CompileError::Other(anyhow::anyhow!("blobstore unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl GlobalCache for FakeGlobalCache {
    async fn exists_in_global_cache(&self, _package: &Package, cache_key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.entries.lock().unwrap().contains_key(cache_key))
    }

    async fn fetch_from_global_cache(
        &self,
        _package: &Package,
        cache_key: &str,
    ) -> Result<Option<CompiledArtifact>> {
        self.check()?;
        Ok(self.entries.lock().unwrap().get(cache_key).cloned())
    }

    async fn save_to_global_cache(&self, compiled_package: &CompiledPackage, cache_key: &str) -> Result<()> {
        self.check()?;
        self.saves
            .lock()
            .unwrap()
            .push((cache_key.to_string(), compiled_package.clone()));
        self.insert(
            cache_key,
            CompiledArtifact {
                sha1: compiled_package.sha1.clone(),
                blobstore_id: compiled_package.blobstore_id.clone(),
            },
        );
        Ok(())
    }
}

/// Records stage/track events as plain strings.
#[derive(Default)]
pub struct RecordingEventLog {
    events: Mutex<Vec<String>>,
}

impl RecordingEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl EventLog for RecordingEventLog {
    fn begin_stage(&self, stage: &str, total: usize) {
        self.events
            .lock()
            .unwrap()
            .push(format!("stage {stage} ({total})"));
    }

    fn track_started(&self, _stage: &str, task: &str) {
        self.events.lock().unwrap().push(format!("started {task}"));
    }

    fn track_finished(&self, _stage: &str, task: &str, error: Option<&str>) {
        let line = match error {
            None => format!("finished {task}"),
            Some(_) => format!("failed {task}"),
        };
        self.events.lock().unwrap().push(line);
    }
}

/// Director task that reports cancellation once `cancel_after` checkpoints
/// have happened.
pub struct FakeDirectorTask {
    checkpoints: AtomicUsize,
    cancel_after: Option<usize>,
}

impl FakeDirectorTask {
    pub fn never_cancelled() -> Self {
        Self {
            checkpoints: AtomicUsize::new(0),
            cancel_after: None,
        }
    }

    pub fn cancel_after(checkpoints: usize) -> Self {
        Self {
            checkpoints: AtomicUsize::new(0),
            cancel_after: Some(checkpoints),
        }
    }

    pub fn checkpoints(&self) -> usize {
        self.checkpoints.load(Ordering::SeqCst)
    }
}

impl DirectorTask for FakeDirectorTask {
    fn task_cancelled(&self) -> bool {
        self.cancel_after
            .is_some_and(|limit| self.checkpoints.load(Ordering::SeqCst) >= limit)
    }

    fn task_checkpoint(&self) -> Result<()> {
        self.checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sorted package names of every row in a compiled package map.
pub fn package_names(compiled: &BTreeMap<String, CompiledPackage>) -> Vec<String> {
    compiled.keys().cloned().collect()
}
