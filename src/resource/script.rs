//! Resource scripts run as local processes
//!
//! A resource type maps to an executable. Fetching runs it as
//! `<script> <dir>` with a JSON request on stdin:
//!
//! ```json
//! {"source": {..}, "params": {..}, "version": {..} | null}
//! ```
//!
//! The script writes the fetched files into `<dir>`, logs to stderr, and
//! prints the fetched version on stdout:
//!
//! ```json
//! {"version": {..}, "metadata": [{"name": "..", "value": ".."}]}
//! ```

use crate::cache::{FetchRecord, LocalVolumeStore, Volume, VolumeMount};
use crate::error::{GantryError, GantryResult};
use crate::exec::{ByteStream, Ready, Signal, Signals, StepMetadata};
use crate::resource::{
    IoConfig, MetadataField, Params, Resource, ResourceType, Session, Source, Tracker,
    TrackerFactory, Version, VersionedSource,
};
use crate::worker::Worker;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadBuf,
};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a script's pipes may stay open after it exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffer between the archiving task and the stream reader
const ARCHIVE_PIPE_BYTES: usize = 64 * 1024;

/// JSON request written to a script's stdin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub source: Source,
    pub params: Params,
    pub version: Option<Version>,
}

/// JSON response a script prints on stdout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub version: Version,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

/// Hands out script trackers for local workers
pub struct ScriptTrackerFactory {
    scripts: Arc<BTreeMap<ResourceType, PathBuf>>,
    work_dir: PathBuf,
    store: Option<LocalVolumeStore>,
}

impl ScriptTrackerFactory {
    pub fn new(
        scripts: BTreeMap<ResourceType, PathBuf>,
        work_dir: PathBuf,
        store: Option<LocalVolumeStore>,
    ) -> Self {
        Self {
            scripts: Arc::new(scripts),
            work_dir,
            store,
        }
    }
}

impl TrackerFactory for ScriptTrackerFactory {
    fn tracker_for(&self, worker: Arc<dyn Worker>) -> Arc<dyn Tracker> {
        Arc::new(ScriptTracker {
            worker: worker.name().to_string(),
            scripts: Arc::clone(&self.scripts),
            work_dir: self.work_dir.clone(),
            store: self.store.clone(),
        })
    }
}

/// Tracker resolving resource types to scripts on one worker
pub struct ScriptTracker {
    worker: String,
    scripts: Arc<BTreeMap<ResourceType, PathBuf>>,
    work_dir: PathBuf,
    store: Option<LocalVolumeStore>,
}

#[async_trait]
impl Tracker for ScriptTracker {
    async fn init(
        &self,
        metadata: &StepMetadata,
        session: Session,
        resource_type: &ResourceType,
        _tags: &[String],
        mount: Option<VolumeMount>,
    ) -> GantryResult<Arc<dyn Resource>> {
        let script = self
            .scripts
            .get(resource_type)
            .cloned()
            .ok_or_else(|| GantryError::UnknownResourceType(resource_type.to_string()))?;

        let (dir, volume) = match mount {
            Some(mount) => {
                let store = self.store.as_ref().ok_or_else(|| {
                    GantryError::Volume(format!("worker {} has no volume store", self.worker))
                })?;
                (store.data_dir(mount.volume.handle()), Some(mount.volume))
            }
            None => (self.work_dir.join(Uuid::new_v4().to_string()), None),
        };

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| GantryError::io(format!("creating fetch directory {}", dir.display()), e))?;

        debug!(
            "Initialized {} resource for session {} on {} in {}",
            resource_type,
            session.id.name,
            self.worker,
            dir.display()
        );

        Ok(Arc::new(ScriptResource {
            shared: Arc::new(Shared {
                script,
                dir,
                env: metadata.env_pairs(),
                volume,
                store: self.store.clone(),
                touched: Mutex::new(vec![]),
            }),
        }))
    }
}

/// State shared between a resource and the fetches it hands out
struct Shared {
    script: PathBuf,
    dir: PathBuf,
    env: Vec<(String, String)>,
    volume: Option<Arc<dyn Volume>>,
    store: Option<LocalVolumeStore>,
    touched: Mutex<Vec<String>>,
}

impl Shared {
    fn volume_handle(&self) -> Option<&str> {
        self.volume.as_ref().map(|v| v.handle())
    }

    fn touch(&self) {
        if let Some(handle) = self.volume_handle() {
            let mut touched = self.touched.lock();
            if !touched.iter().any(|h| h == handle) {
                touched.push(handle.to_string());
            }
        }
    }

    fn recorded_fetch(&self) -> Option<FetchRecord> {
        let handle = self.volume_handle()?;
        self.store.as_ref()?.fetch_record(handle)
    }
}

/// A resource handle backed by a fetch directory
pub struct ScriptResource {
    shared: Arc<Shared>,
}

#[async_trait]
impl Resource for ScriptResource {
    fn get(
        &self,
        io: IoConfig,
        source: &Source,
        params: &Params,
        version: Option<&Version>,
    ) -> Arc<dyn VersionedSource> {
        Arc::new(ScriptSource {
            shared: Arc::clone(&self.shared),
            io,
            request: FetchRequest {
                source: source.clone(),
                params: params.clone(),
                version: version.cloned(),
            },
            response: Mutex::new(None),
        })
    }

    async fn volume_handles(&self) -> GantryResult<Vec<String>> {
        Ok(self.shared.touched.lock().clone())
    }

    async fn release(&self) {
        if self.shared.volume.is_some() {
            return;
        }
        let dir = &self.shared.dir;
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => debug!("Removed fetch directory {}", dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove fetch directory {}: {}", dir.display(), e),
        }
    }
}

/// One fetch through a resource script
pub struct ScriptSource {
    shared: Arc<Shared>,
    io: IoConfig,
    request: FetchRequest,
    response: Mutex<Option<FetchResponse>>,
}

impl ScriptSource {
    fn spawn(&self) -> GantryResult<Child> {
        let shared = &self.shared;
        let mut command = Command::new(&shared.script);
        command
            .arg(&shared.dir)
            .envs(shared.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so signals reach everything the script started
        #[cfg(unix)]
        command.process_group(0);

        command
            .spawn()
            .map_err(|e| GantryError::command_failed(shared.script.display().to_string(), e))
    }
}

#[async_trait]
impl VersionedSource for ScriptSource {
    async fn run(&self, mut signals: Signals, mut ready: Ready) -> GantryResult<()> {
        let request = serde_json::to_vec(&self.request)?;
        let mut child = self.spawn()?;
        self.shared.touch();
        ready.fire();

        let script = self.shared.script.display().to_string();
        debug!("Started {} (pid {:?})", script, child.id());

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| GantryError::Internal("script stdin not piped".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| GantryError::Internal("script stdout not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GantryError::Internal("script stderr not piped".to_string()))?;

        let mut writer = tokio::spawn(async move {
            // Scripts may exit without reading their request.
            let _ = stdin.write_all(&request).await;
        });

        let mut reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        });

        let sink = self.io.stderr.clone();
        let mut logger = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Err(e) = sink.write_line(&line) {
                    debug!("Dropping script stderr: {}", e);
                }
            }
        });

        let pid = child.id();
        let mut signals_open = true;
        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.map_err(|e| GantryError::io(format!("waiting for {}", script), e))?;
                }
                signal = signals.recv(), if signals_open => match signal {
                    Some(signal) => {
                        info!("Delivering {} to {}", signal, script);
                        if let Err(e) = deliver(&mut child, pid, signal) {
                            warn!("Failed to deliver {} to {}: {}", signal, script, e);
                        }
                    }
                    None => signals_open = false,
                },
            }
        };

        // The fetch is over once the script exits; anything it left running
        // would hold its pipes open.
        reap_group(pid);

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            let _ = (&mut writer).await;
            let _ = (&mut logger).await;
            (&mut reader).await
        })
        .await;

        let output = match drained {
            Ok(output) => output
                .map_err(|e| GantryError::Internal(format!("stdout reader failed: {}", e)))?
                .map_err(|e| GantryError::io(format!("reading output of {}", script), e)),
            Err(_) => {
                warn!(
                    "Output of {} still open {:?} after exit, giving up on it",
                    script, DRAIN_TIMEOUT
                );
                writer.abort();
                logger.abort();
                reader.abort();
                Err(GantryError::Resource(format!(
                    "output of {} was not closed after exit",
                    script
                )))
            }
        };

        if !status.success() {
            return Err(GantryError::ResourceScriptFailed {
                exit_status: exit_code(&status),
            });
        }
        let output = output?;

        let response: FetchResponse = serde_json::from_slice(&output)
            .map_err(|e| GantryError::ResourceOutput(e.to_string()))?;

        if let (Some(handle), Some(store)) = (self.shared.volume_handle(), &self.shared.store) {
            let record = FetchRecord {
                version: response.version.clone(),
                metadata: response.metadata.clone(),
            };
            if let Err(e) = store.record_fetch(handle, &record).await {
                warn!("Failed to record fetch result for volume {}: {}", handle, e);
            }
        }

        *self.response.lock() = Some(response);
        Ok(())
    }

    fn version(&self) -> Version {
        if let Some(response) = self.response.lock().as_ref() {
            return response.version.clone();
        }
        self.shared
            .recorded_fetch()
            .map(|r| r.version)
            .or_else(|| self.request.version.clone())
            .unwrap_or_default()
    }

    fn metadata(&self) -> Vec<MetadataField> {
        if let Some(response) = self.response.lock().as_ref() {
            return response.metadata.clone();
        }
        self.shared
            .recorded_fetch()
            .map(|r| r.metadata)
            .unwrap_or_default()
    }

    async fn stream_out(&self, path: &str) -> GantryResult<Box<dyn ByteStream>> {
        let target = archive_target(&self.shared.dir, path)?;
        let (writer, reader) = tokio::io::duplex(ARCHIVE_PIPE_BYTES);
        let writer = SyncIoBridge::new(writer);
        let task = tokio::task::spawn_blocking(move || archive_into(writer, &target));

        Ok(Box::new(ArchiveStream {
            reader: Some(reader),
            task: Some(task),
        }))
    }
}

/// Resolve `path` within `dir`, refusing anything outside it
fn archive_target(dir: &Path, path: &str) -> GantryResult<PathBuf> {
    let relative = Path::new(path);
    if relative
        .components()
        .any(|c| !matches!(c, Component::CurDir | Component::Normal(_)))
    {
        return Err(GantryError::User(format!(
            "path must be relative to the artifact root: {}",
            path
        )));
    }
    Ok(dir.join(relative))
}

/// Tar `target` into `out`: a directory's contents, a single file, or nothing
fn archive_into<W: Write>(out: W, target: &Path) -> io::Result<()> {
    let mut builder = tar::Builder::new(out);

    if target.is_dir() {
        builder.append_dir_all(".", target)?;
    } else if let (true, Some(name)) = (target.is_file(), target.file_name()) {
        builder.append_path_with_name(target, name)?;
    } else {
        debug!("Nothing at {}, streaming an empty archive", target.display());
    }

    builder.into_inner()?.flush()
}

/// Tar stream written by a blocking archiving task
///
/// The archive is produced while it is read, through a bounded pipe. Hitting
/// the end of the pipe reports the archiving task's failure, if any.
struct ArchiveStream {
    reader: Option<DuplexStream>,
    task: Option<JoinHandle<io::Result<()>>>,
}

impl AsyncRead for ArchiveStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let Some(reader) = this.reader.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "read from closed stream",
            )));
        };

        let wanted = buf.remaining() > 0;
        let before = buf.filled().len();
        ready!(Pin::new(reader).poll_read(cx, buf))?;

        if wanted && buf.filled().len() == before {
            if let Some(task) = this.task.as_mut() {
                let finished = ready!(Pin::new(task).poll(cx));
                this.task = None;
                match finished {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Poll::Ready(Err(e)),
                    Err(e) => return Poll::Ready(Err(io::Error::other(e))),
                }
            }
        }

        Poll::Ready(Ok(()))
    }
}

impl ByteStream for ArchiveStream {
    fn close(&mut self) -> io::Result<()> {
        // The archiving task stops at its next write into the dropped pipe
        self.reader = None;
        self.task = None;
        Ok(())
    }
}

#[cfg(unix)]
fn deliver(child: &mut Child, pid: Option<u32>, signal: Signal) -> io::Result<()> {
    use nix::sys::signal::{killpg, Signal as Signo};

    let signo = match signal {
        Signal::Interrupt => Signo::SIGINT,
        Signal::Terminate => Signo::SIGTERM,
        Signal::Kill => Signo::SIGKILL,
    };
    let Some(group) = pid.and_then(group_of) else {
        return child.start_kill();
    };
    killpg(group, signo).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn deliver(child: &mut Child, _pid: Option<u32>, _signal: Signal) -> io::Result<()> {
    child.start_kill()
}

/// Kill whatever is left in the script's process group
#[cfg(unix)]
fn reap_group(pid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal as Signo};

    let Some(group) = pid.and_then(group_of) else {
        return;
    };
    match killpg(group, Signo::SIGKILL) {
        Ok(()) => debug!("Killed leftover processes in group {}", group),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group {}: {}", group, e),
    }
}

#[cfg(not(unix))]
fn reap_group(_pid: Option<u32>) {}

#[cfg(unix)]
fn group_of(pid: u32) -> Option<nix::unistd::Pid> {
    i32::try_from(pid).ok().map(nix::unistd::Pid::from_raw)
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cache::{VolumeSpec, VolumeStore, VOLUME_TTL_SECS};
    use crate::clock::FakeClock;
    use crate::exec::fakes::{FakeWorker, SharedBuffer};
    use crate::exec::{first_entry, read_all, signal_channel, ArtifactDestination, DirectoryDestination, Sink};
    use crate::resource::SessionId;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    fn script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("in");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn factory(dir: &TempDir, script: PathBuf, store: Option<LocalVolumeStore>) -> ScriptTrackerFactory {
        let scripts = [(ResourceType::new("test"), script)].into_iter().collect();
        ScriptTrackerFactory::new(scripts, dir.path().join("work"), store)
    }

    fn session() -> Session {
        Session {
            id: SessionId::new("session"),
            ephemeral: false,
        }
    }

    fn io(stderr: &SharedBuffer) -> IoConfig {
        IoConfig {
            stdout: Sink::null(),
            stderr: Sink::new(stderr.clone()),
        }
    }

    async fn init(
        factory: &ScriptTrackerFactory,
        metadata: &StepMetadata,
        mount: Option<VolumeMount>,
    ) -> GantryResult<Arc<dyn Resource>> {
        factory
            .tracker_for(Arc::new(FakeWorker::new("local", None)))
            .init(metadata, session(), &ResourceType::new("test"), &[], mount)
            .await
    }

    async fn run(source: &Arc<dyn VersionedSource>) -> GantryResult<()> {
        let (_tx, signals) = signal_channel();
        let (ready, _rx) = Ready::channel();
        source.run(signals, ready).await
    }

    const FETCH: &str = r#"cat > "$1/request.json"
echo "fetching" >&2
echo "$BUILD_PIPELINE_NAME" > "$1/pipeline"
echo '{"version":{"ref":"abc"},"metadata":[{"name":"author","value":"me"}]}'"#;

    #[tokio::test]
    async fn fetch_runs_script_and_reads_version() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir, script(&dir, FETCH), None);
        let metadata = StepMetadata {
            pipeline_name: Some("main".to_string()),
            ..Default::default()
        };
        let resource = init(&factory, &metadata, None).await.unwrap();

        let stderr = SharedBuffer::default();
        let source: Source = [("uri".to_string(), serde_json::json!("https://example.com"))]
            .into_iter()
            .collect();
        let versioned = resource.get(io(&stderr), &source, &Params::new(), None);
        run(&versioned).await.unwrap();

        let expected: Version = [("ref".to_string(), "abc".to_string())].into_iter().collect();
        assert_eq!(versioned.version(), expected);
        assert_eq!(versioned.metadata(), vec![MetadataField::new("author", "me")]);
        assert_eq!(stderr.contents(), "fetching\n");

        let file = first_entry(versioned.stream_out("request.json").await.unwrap(), "request.json")
            .await
            .unwrap();
        let request: FetchRequest =
            serde_json::from_slice(&read_all(Box::new(file)).await.unwrap()).unwrap();
        assert_eq!(request.source, source);
        assert_eq!(request.version, None);

        let pipeline = first_entry(versioned.stream_out("pipeline").await.unwrap(), "pipeline")
            .await
            .unwrap();
        assert_eq!(read_all(Box::new(pipeline)).await.unwrap(), b"main\n");
    }

    #[tokio::test]
    async fn non_zero_exit_is_script_failure() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir, script(&dir, "exit 3"), None);
        let resource = init(&factory, &StepMetadata::default(), None).await.unwrap();

        let versioned = resource.get(io(&SharedBuffer::default()), &Source::new(), &Params::new(), None);
        let err = run(&versioned).await.unwrap_err();

        assert!(matches!(err, GantryError::ResourceScriptFailed { exit_status: 3 }));
    }

    #[tokio::test]
    async fn garbage_output_is_rejected() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir, script(&dir, "echo not-json"), None);
        let resource = init(&factory, &StepMetadata::default(), None).await.unwrap();

        let versioned = resource.get(io(&SharedBuffer::default()), &Source::new(), &Params::new(), None);
        let err = run(&versioned).await.unwrap_err();

        assert!(matches!(err, GantryError::ResourceOutput(_)));
    }

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir, script(&dir, "exit 0"), None);

        let err = factory
            .tracker_for(Arc::new(FakeWorker::new("local", None)))
            .init(&StepMetadata::default(), session(), &ResourceType::new("nope"), &[], None)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, GantryError::UnknownResourceType(ref t) if t == "nope"));
    }

    #[tokio::test]
    async fn interrupt_reaches_script() {
        let dir = TempDir::new().unwrap();
        let body = "trap 'exit 7' INT\necho started >&2\nwhile true; do sleep 0.1; done";
        let factory = factory(&dir, script(&dir, body), None);
        let resource = init(&factory, &StepMetadata::default(), None).await.unwrap();

        let stderr = SharedBuffer::default();
        let versioned = resource.get(io(&stderr), &Source::new(), &Params::new(), None);

        let (tx, signals) = signal_channel();
        let (ready, _rx) = Ready::channel();
        let fetch = tokio::spawn({
            let versioned = Arc::clone(&versioned);
            async move { versioned.run(signals, ready).await }
        });

        while !stderr.contents().contains("started") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(Signal::Interrupt).unwrap();

        let err = fetch.await.unwrap().unwrap_err();
        assert!(matches!(err, GantryError::ResourceScriptFailed { exit_status: 7 }));
    }

    #[tokio::test]
    async fn ephemeral_directory_is_removed_on_release() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir, script(&dir, FETCH), None);
        let resource = init(&factory, &StepMetadata::default(), None).await.unwrap();

        let versioned = resource.get(io(&SharedBuffer::default()), &Source::new(), &Params::new(), None);
        run(&versioned).await.unwrap();

        assert!(resource.volume_handles().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path().join("work")).unwrap().count(), 1);

        resource.release().await;
        assert_eq!(std::fs::read_dir(dir.path().join("work")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn mounted_volume_is_touched_and_remembers_version() {
        let dir = TempDir::new().unwrap();
        let store = LocalVolumeStore::new(dir.path().join("volumes"), Arc::new(FakeClock::new()));
        let volume = store
            .create_empty_volume(VolumeSpec {
                properties: Default::default(),
                ttl_secs: VOLUME_TTL_SECS,
            })
            .await
            .unwrap();
        let handle = volume.handle().to_string();

        let factory = factory(&dir, script(&dir, FETCH), Some(store.clone()));
        let resource = init(
            &factory,
            &StepMetadata::default(),
            Some(VolumeMount::for_get(Arc::clone(&volume))),
        )
        .await
        .unwrap();

        let versioned = resource.get(io(&SharedBuffer::default()), &Source::new(), &Params::new(), None);
        run(&versioned).await.unwrap();

        assert_eq!(resource.volume_handles().await.unwrap(), vec![handle.clone()]);
        assert!(store.data_dir(&handle).join("request.json").is_file());

        resource.release().await;
        assert!(store.data_dir(&handle).is_dir());

        // A later fetch adopting the volume reports the recorded version
        let adopted = init(
            &factory,
            &StepMetadata::default(),
            Some(VolumeMount::for_get(volume)),
        )
        .await
        .unwrap()
        .get(io(&SharedBuffer::default()), &Source::new(), &Params::new(), None);
        assert_eq!(adopted.version().get("ref").map(String::as_str), Some("abc"));
    }

    #[tokio::test]
    async fn stream_out_of_missing_path_is_empty() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir, script(&dir, "exit 0"), None);
        let resource = init(&factory, &StepMetadata::default(), None).await.unwrap();
        let versioned = resource.get(io(&SharedBuffer::default()), &Source::new(), &Params::new(), None);

        let stream = versioned.stream_out("missing").await.unwrap();
        let err = first_entry(stream, "missing").await.err().unwrap();
        assert!(matches!(err, GantryError::FileNotFound { .. }));

        let err = versioned.stream_out("../outside").await.err().unwrap();
        assert!(matches!(err, GantryError::User(_)));
    }

    #[tokio::test]
    async fn kill_stops_script_with_background_children() {
        let dir = TempDir::new().unwrap();
        let body = "sleep 30 &\necho started >&2\nwhile true; do :; done";
        let factory = factory(&dir, script(&dir, body), None);
        let resource = init(&factory, &StepMetadata::default(), None).await.unwrap();

        let stderr = SharedBuffer::default();
        let versioned = resource.get(io(&stderr), &Source::new(), &Params::new(), None);

        let (tx, signals) = signal_channel();
        let (ready, _rx) = Ready::channel();
        let fetch = tokio::spawn({
            let versioned = Arc::clone(&versioned);
            async move { versioned.run(signals, ready).await }
        });

        while !stderr.contents().contains("started") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(Signal::Kill).unwrap();

        let err = tokio::time::timeout(Duration::from_secs(3), fetch)
            .await
            .expect("fetch still running after kill")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, GantryError::ResourceScriptFailed { exit_status: 137 }));
    }

    #[tokio::test]
    async fn background_children_do_not_outlive_the_fetch() {
        let dir = TempDir::new().unwrap();
        let body = format!("{}\nsleep 30 &", FETCH);
        let factory = factory(&dir, script(&dir, &body), None);
        let resource = init(&factory, &StepMetadata::default(), None).await.unwrap();

        let versioned = resource.get(io(&SharedBuffer::default()), &Source::new(), &Params::new(), None);
        tokio::time::timeout(Duration::from_secs(3), run(&versioned))
            .await
            .expect("fetch waited on a background child")
            .unwrap();

        assert_eq!(versioned.version().get("ref").map(String::as_str), Some("abc"));
    }

    #[tokio::test]
    async fn stream_out_streams_directories_larger_than_the_pipe() {
        let dir = TempDir::new().unwrap();
        let body = "cat > /dev/null\nhead -c 1048576 /dev/zero > \"$1/big\"\necho '{\"version\":{}}'";
        let factory = factory(&dir, script(&dir, body), None);
        let resource = init(&factory, &StepMetadata::default(), None).await.unwrap();

        let versioned = resource.get(io(&SharedBuffer::default()), &Source::new(), &Params::new(), None);
        run(&versioned).await.unwrap();

        let out = TempDir::new().unwrap();
        DirectoryDestination::new(out.path())
            .stream_in(".", versioned.stream_out(".").await.unwrap())
            .await
            .unwrap();
        assert_eq!(std::fs::metadata(out.path().join("big")).unwrap().len(), 1048576);

        // Closing early leaves nothing blocked behind the pipe
        let mut partial = versioned.stream_out(".").await.unwrap();
        let mut head = [0u8; 512];
        partial.read_exact(&mut head).await.unwrap();
        partial.close().unwrap();
    }
}
