//! Recording fakes of the get step's collaborators
//!
//! Each fake keeps its calls and canned results behind a `parking_lot` mutex
//! so tests can script behavior up front and assert on interactions after.

use crate::cache::{Volume, VolumeMount, VolumeProperties, VolumeSpec, VolumeStore};
use crate::clock::Clock;
use crate::error::{GantryError, GantryResult};
use crate::exec::{
    read_all, ArtifactDestination, ByteStream, ExitStatus, GetDelegate, MemoryStream, Ready,
    Signal, Signals, Sink, StepMetadata, VersionInfo,
};
use crate::resource::{
    IoConfig, MetadataField, Params, Resource, ResourceType, Session, Source, Tracker,
    TrackerFactory, Version, VersionedSource,
};
use crate::worker::{Worker, WorkerClient, WorkerSpec};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};

/// Volume recording heartbeats and releases
pub struct FakeVolume {
    handle: String,
    heartbeats: Mutex<Vec<(Duration, Arc<dyn Clock>)>>,
    releases: AtomicUsize,
}

impl FakeVolume {
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            heartbeats: Mutex::new(vec![]),
            releases: AtomicUsize::new(0),
        }
    }

    /// Intervals passed to `heartbeat`
    pub fn heartbeats(&self) -> Vec<Duration> {
        self.heartbeats.lock().iter().map(|(d, _)| *d).collect()
    }

    /// Whether every heartbeat was driven by `clock`
    pub fn heartbeated_with(&self, clock: &Arc<dyn Clock>) -> bool {
        let heartbeats = self.heartbeats.lock();
        !heartbeats.is_empty()
            && heartbeats
                .iter()
                .all(|(_, c)| std::ptr::addr_eq(Arc::as_ptr(c), Arc::as_ptr(clock)))
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl Volume for FakeVolume {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn heartbeat(&self, interval: Duration, clock: Arc<dyn Clock>) {
        self.heartbeats.lock().push((interval, clock));
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeVolumeStoreState {
    found: Vec<Arc<FakeVolume>>,
    created: Option<Arc<FakeVolume>>,
    created_specs: Vec<VolumeSpec>,
    find_calls: Vec<VolumeProperties>,
    set_property_calls: Vec<(String, String, String)>,
    find_error: Option<GantryError>,
    create_error: Option<GantryError>,
}

/// Volume store with scripted lookup and creation results
#[derive(Default)]
pub struct FakeVolumeStore {
    state: Mutex<FakeVolumeStoreState>,
}

impl FakeVolumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Volumes returned by every lookup
    pub fn set_found(&self, volumes: Vec<Arc<FakeVolume>>) {
        self.state.lock().found = volumes;
    }

    /// Volume returned by creation
    pub fn set_created(&self, volume: Arc<FakeVolume>) {
        self.state.lock().created = Some(volume);
    }

    pub fn fail_find(&self, err: GantryError) {
        self.state.lock().find_error = Some(err);
    }

    pub fn fail_create(&self, err: GantryError) {
        self.state.lock().create_error = Some(err);
    }

    /// Specs passed to `create_empty_volume`
    pub fn created(&self) -> Vec<VolumeSpec> {
        self.state.lock().created_specs.clone()
    }

    pub fn find_calls(&self) -> Vec<VolumeProperties> {
        self.state.lock().find_calls.clone()
    }

    pub fn set_property_calls(&self) -> Vec<(String, String, String)> {
        self.state.lock().set_property_calls.clone()
    }
}

#[async_trait]
impl VolumeStore for FakeVolumeStore {
    async fn find_volumes(
        &self,
        properties: &VolumeProperties,
    ) -> GantryResult<Vec<Arc<dyn Volume>>> {
        let mut state = self.state.lock();
        state.find_calls.push(properties.clone());
        if let Some(err) = state.find_error.clone() {
            return Err(err);
        }
        Ok(state
            .found
            .iter()
            .map(|v| Arc::clone(v) as Arc<dyn Volume>)
            .collect())
    }

    async fn create_empty_volume(&self, spec: VolumeSpec) -> GantryResult<Arc<dyn Volume>> {
        let mut state = self.state.lock();
        state.created_specs.push(spec);
        if let Some(err) = state.create_error.clone() {
            return Err(err);
        }
        let volume = state
            .created
            .get_or_insert_with(|| Arc::new(FakeVolume::new("created-volume")))
            .clone();
        Ok(volume as Arc<dyn Volume>)
    }

    async fn set_property(&self, handle: &str, name: &str, value: &str) -> GantryResult<()> {
        self.state.lock().set_property_calls.push((
            handle.to_string(),
            name.to_string(),
            value.to_string(),
        ));
        Ok(())
    }
}

/// Worker with an optional volume store
pub struct FakeWorker {
    name: String,
    store: Option<Arc<FakeVolumeStore>>,
}

impl FakeWorker {
    pub fn new(name: impl Into<String>, store: Option<Arc<FakeVolumeStore>>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }
}

impl Worker for FakeWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn volume_manager(&self) -> Option<Arc<dyn VolumeStore>> {
        self.store
            .as_ref()
            .map(|s| Arc::clone(s) as Arc<dyn VolumeStore>)
    }
}

/// Worker client returning one scripted worker or error
pub struct FakeWorkerClient {
    result: Mutex<GantryResult<Arc<FakeWorker>>>,
    calls: Mutex<Vec<WorkerSpec>>,
}

impl FakeWorkerClient {
    pub fn with_worker(worker: Arc<FakeWorker>) -> Self {
        Self {
            result: Mutex::new(Ok(worker)),
            calls: Mutex::new(vec![]),
        }
    }

    pub fn failing(err: GantryError) -> Self {
        Self {
            result: Mutex::new(Err(err)),
            calls: Mutex::new(vec![]),
        }
    }

    pub fn calls(&self) -> Vec<WorkerSpec> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl WorkerClient for FakeWorkerClient {
    async fn satisfying(&self, spec: &WorkerSpec) -> GantryResult<Arc<dyn Worker>> {
        self.calls.lock().push(spec.clone());
        self.result
            .lock()
            .clone()
            .map(|w| w as Arc<dyn Worker>)
    }
}

/// Tracker factory handing out one tracker for every worker
pub struct FakeTrackerFactory {
    tracker: Arc<FakeTracker>,
    workers: Mutex<Vec<String>>,
}

impl FakeTrackerFactory {
    pub fn new(tracker: Arc<FakeTracker>) -> Self {
        Self {
            tracker,
            workers: Mutex::new(vec![]),
        }
    }

    /// Names of the workers trackers were requested for
    pub fn workers(&self) -> Vec<String> {
        self.workers.lock().clone()
    }
}

impl TrackerFactory for FakeTrackerFactory {
    fn tracker_for(&self, worker: Arc<dyn Worker>) -> Arc<dyn Tracker> {
        self.workers.lock().push(worker.name().to_string());
        Arc::clone(&self.tracker) as Arc<dyn Tracker>
    }
}

/// Recorded `Tracker::init` call
#[derive(Debug, Clone)]
pub struct InitCall {
    pub metadata: StepMetadata,
    pub session: Session,
    pub resource_type: ResourceType,
    pub tags: Vec<String>,
    pub mount: Option<VolumeMount>,
}

/// Tracker returning one scripted resource or error
pub struct FakeTracker {
    result: Mutex<GantryResult<Arc<FakeResource>>>,
    calls: Mutex<Vec<InitCall>>,
}

impl FakeTracker {
    pub fn with_resource(resource: Arc<FakeResource>) -> Self {
        Self {
            result: Mutex::new(Ok(resource)),
            calls: Mutex::new(vec![]),
        }
    }

    pub fn failing(err: GantryError) -> Self {
        Self {
            result: Mutex::new(Err(err)),
            calls: Mutex::new(vec![]),
        }
    }

    pub fn calls(&self) -> Vec<InitCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Tracker for FakeTracker {
    async fn init(
        &self,
        metadata: &StepMetadata,
        session: Session,
        resource_type: &ResourceType,
        tags: &[String],
        mount: Option<VolumeMount>,
    ) -> GantryResult<Arc<dyn Resource>> {
        self.calls.lock().push(InitCall {
            metadata: metadata.clone(),
            session,
            resource_type: resource_type.clone(),
            tags: tags.to_vec(),
            mount,
        });
        self.result
            .lock()
            .clone()
            .map(|r| r as Arc<dyn Resource>)
    }
}

/// Recorded `Resource::get` call
#[derive(Debug, Clone)]
pub struct GetCall {
    pub io: IoConfig,
    pub source: Source,
    pub params: Params,
    pub version: Option<Version>,
}

/// Resource handing out one versioned source
pub struct FakeResource {
    source: Arc<FakeVersionedSource>,
    get_calls: Mutex<Vec<GetCall>>,
    volume_handles: Mutex<GantryResult<Vec<String>>>,
    releases: AtomicUsize,
}

impl FakeResource {
    pub fn new(source: Arc<FakeVersionedSource>) -> Self {
        Self {
            source,
            get_calls: Mutex::new(vec![]),
            volume_handles: Mutex::new(Ok(vec![])),
            releases: AtomicUsize::new(0),
        }
    }

    /// Handles reported as touched by the fetch
    pub fn set_volume_handles(&self, handles: Vec<&str>) {
        *self.volume_handles.lock() = Ok(handles.into_iter().map(String::from).collect());
    }

    pub fn fail_volume_handles(&self, err: GantryError) {
        *self.volume_handles.lock() = Err(err);
    }

    pub fn get_calls(&self) -> Vec<GetCall> {
        self.get_calls.lock().clone()
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resource for FakeResource {
    fn get(
        &self,
        io: IoConfig,
        source: &Source,
        params: &Params,
        version: Option<&Version>,
    ) -> Arc<dyn VersionedSource> {
        self.get_calls.lock().push(GetCall {
            io,
            source: source.clone(),
            params: params.clone(),
            version: version.cloned(),
        });
        Arc::clone(&self.source) as Arc<dyn VersionedSource>
    }

    async fn volume_handles(&self) -> GantryResult<Vec<String>> {
        self.volume_handles.lock().clone()
    }

    async fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// How a fake fetch behaves when run
#[derive(Debug, Clone)]
pub enum FetchBehavior {
    /// Fire ready and return
    Succeed,
    /// Fire ready and fail
    Fail(GantryError),
    /// Fire ready, wait for one signal, then return
    AwaitSignal,
}

/// Versioned source with scripted fetch and stream results
pub struct FakeVersionedSource {
    version: Version,
    metadata: Vec<MetadataField>,
    behavior: Mutex<FetchBehavior>,
    runs: AtomicUsize,
    received: Mutex<Vec<Signal>>,
    streams: Mutex<VecDeque<GantryResult<TrackedStream>>>,
    stream_out_calls: Mutex<Vec<String>>,
}

impl FakeVersionedSource {
    pub fn new(version: Version, metadata: Vec<MetadataField>) -> Self {
        Self {
            version,
            metadata,
            behavior: Mutex::new(FetchBehavior::Succeed),
            runs: AtomicUsize::new(0),
            received: Mutex::new(vec![]),
            streams: Mutex::new(VecDeque::new()),
            stream_out_calls: Mutex::new(vec![]),
        }
    }

    pub fn set_behavior(&self, behavior: FetchBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Queue the result of the next `stream_out`
    pub fn push_stream(&self, stream: GantryResult<TrackedStream>) {
        self.streams.lock().push_back(stream);
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Signals the fetch received
    pub fn received(&self) -> Vec<Signal> {
        self.received.lock().clone()
    }

    pub fn stream_out_calls(&self) -> Vec<String> {
        self.stream_out_calls.lock().clone()
    }
}

#[async_trait]
impl VersionedSource for FakeVersionedSource {
    async fn run(&self, mut signals: Signals, mut ready: Ready) -> GantryResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().clone();
        ready.fire();
        match behavior {
            FetchBehavior::Succeed => Ok(()),
            FetchBehavior::Fail(err) => Err(err),
            FetchBehavior::AwaitSignal => {
                if let Some(signal) = signals.recv().await {
                    self.received.lock().push(signal);
                }
                Ok(())
            }
        }
    }

    fn version(&self) -> Version {
        self.version.clone()
    }

    fn metadata(&self) -> Vec<MetadataField> {
        self.metadata.clone()
    }

    async fn stream_out(&self, path: &str) -> GantryResult<Box<dyn ByteStream>> {
        self.stream_out_calls.lock().push(path.to_string());
        match self.streams.lock().pop_front() {
            Some(Ok(stream)) => Ok(Box::new(stream)),
            Some(Err(err)) => Err(err),
            None => Ok(Box::new(MemoryStream::new(vec![]))),
        }
    }
}

/// In-memory stream counting how often it is closed
pub struct TrackedStream {
    inner: MemoryStream,
    closes: Arc<AtomicUsize>,
}

impl TrackedStream {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            inner: MemoryStream::new(bytes),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter observing `close` calls after the stream has been handed off
    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl ByteStream for TrackedStream {
    fn close(&mut self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close()
    }
}

/// Cloneable in-memory writer
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).to_string()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Delegate recording every notification
pub struct FakeGetDelegate {
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    stdout_sink: Sink,
    stderr_sink: Sink,
    completed: Mutex<Vec<(ExitStatus, Option<VersionInfo>)>>,
    failed: Mutex<Vec<GantryError>>,
}

impl FakeGetDelegate {
    pub fn new() -> Self {
        let stdout = SharedBuffer::default();
        let stderr = SharedBuffer::default();
        Self {
            stdout_sink: Sink::new(stdout.clone()),
            stderr_sink: Sink::new(stderr.clone()),
            stdout,
            stderr,
            completed: Mutex::new(vec![]),
            failed: Mutex::new(vec![]),
        }
    }

    pub fn stdout_contents(&self) -> String {
        self.stdout.contents()
    }

    pub fn stderr_contents(&self) -> String {
        self.stderr.contents()
    }

    pub fn completed_calls(&self) -> Vec<(ExitStatus, Option<VersionInfo>)> {
        self.completed.lock().clone()
    }

    pub fn failed_calls(&self) -> Vec<GantryError> {
        self.failed.lock().clone()
    }
}

impl Default for FakeGetDelegate {
    fn default() -> Self {
        Self::new()
    }
}

impl GetDelegate for FakeGetDelegate {
    fn stdout(&self) -> Sink {
        self.stdout_sink.clone()
    }

    fn stderr(&self) -> Sink {
        self.stderr_sink.clone()
    }

    fn completed(&self, status: ExitStatus, info: Option<&VersionInfo>) {
        self.completed.lock().push((status, info.cloned()));
    }

    fn failed(&self, err: &GantryError) {
        self.failed.lock().push(err.clone());
    }
}

/// Destination reading each stream to the end
#[derive(Default)]
pub struct FakeDestination {
    received: Mutex<Vec<(String, Vec<u8>)>>,
    error: Mutex<Option<GantryError>>,
}

impl FakeDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(err: GantryError) -> Self {
        Self {
            received: Mutex::new(vec![]),
            error: Mutex::new(Some(err)),
        }
    }

    /// Paths and contents streamed in
    pub fn received(&self) -> Vec<(String, Vec<u8>)> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl ArtifactDestination for FakeDestination {
    async fn stream_in(&self, path: &str, source: Box<dyn ByteStream>) -> GantryResult<()> {
        let error = self.error.lock().clone();
        if let Some(err) = error {
            return Err(err);
        }
        let bytes = read_all(source).await?;
        self.received.lock().push((path.to_string(), bytes));
        Ok(())
    }
}
