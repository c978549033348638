use super::{CapacityConfig, Engine, EngineHandle, NoticeSink, SinkSlot};
use crate::config::{EngineConfig, SupervisorConfig};
use crate::error::{Result, SupervisorError};
use async_trait::async_trait;
use common::json_file;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Runs the relay as a child process. Every instance gets a freshly rendered
/// config file and reports notices as JSON lines on stdout.
pub struct CommandEngine {
    settings: EngineConfig,
    data_dir: PathBuf,
    config_path: PathBuf,
    verbosity: u8,
    shutdown_grace: Duration,
    sink: SinkSlot,
}

impl CommandEngine {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            settings: config.engine.clone(),
            data_dir: config.data_dir(),
            config_path: config.engine_config_path(),
            verbosity: config.verbosity,
            shutdown_grace: Duration::from_secs(config.engine.shutdown_grace_secs),
            sink: SinkSlot::default(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Base network config, then pass-through overrides, then the keys the
    /// supervisor owns.
    pub async fn render_config(&self, capacity: &CapacityConfig) -> Result<Value> {
        let mut root: Map<String, Value> = match &self.settings.base_config_path {
            Some(path) => json_file::read_json(Path::new(path)).await?,
            None => Map::new(),
        };

        root.insert(
            "DataRootDirectory".into(),
            json!(self.data_dir.to_string_lossy()),
        );
        root.insert("ClientVersion".into(), json!("1"));

        for (key, value) in &self.settings.set_overrides {
            root.insert(key.clone(), value.clone());
        }

        root.insert("InproxyEnableProxy".into(), json!(true));
        root.insert(
            "InproxyMaxCommonClients".into(),
            json!(capacity.max_common_clients),
        );
        root.insert(
            "InproxyMaxPersonalClients".into(),
            json!(capacity.max_personal_clients),
        );
        if let Some(compartment_id) = &capacity.compartment_id {
            root.insert(
                "InproxyProxyPersonalCompartmentID".into(),
                json!(compartment_id),
            );
        }
        if capacity.bandwidth_bytes_per_second > 0 {
            root.insert(
                "InproxyLimitUpstreamBytesPerSecond".into(),
                json!(capacity.bandwidth_bytes_per_second),
            );
            root.insert(
                "InproxyLimitDownstreamBytesPerSecond".into(),
                json!(capacity.bandwidth_bytes_per_second),
            );
        } else {
            // Overrides must not smuggle a limit into an unlimited config.
            root.remove("InproxyLimitUpstreamBytesPerSecond");
            root.remove("InproxyLimitDownstreamBytesPerSecond");
        }
        root.insert(
            "InproxyProxySessionPrivateKey".into(),
            json!(capacity.proxy_key),
        );

        root.insert("DisableTunnels".into(), json!(true));
        root.insert("DisableLocalHTTPProxy".into(), json!(true));
        root.insert("DisableLocalSocksProxy".into(), json!(true));
        root.insert(
            "EmitInproxyProxyActivity".into(),
            json!(capacity.emit_activity),
        );
        root.insert("EmitDiagnosticNotices".into(), json!(self.verbosity >= 1));

        Ok(Value::Object(root))
    }
}

#[async_trait]
impl Engine for CommandEngine {
    fn register_notice_sink(&self, sink: Arc<dyn NoticeSink>) -> Result<()> {
        self.sink.register(sink)
    }

    #[instrument(skip(self, capacity), fields(mode = %capacity.mode))]
    async fn start(&self, capacity: &CapacityConfig) -> Result<Box<dyn EngineHandle>> {
        let sink = self.sink.get()?;

        let rendered = self.render_config(capacity).await?;
        json_file::write_atomic(&self.config_path, &json_file::to_pretty_vec(&rendered)?).await?;

        let mut child = Command::new(&self.settings.command)
            .args(&self.settings.args)
            .arg("--config")
            .arg(&self.config_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SupervisorError::Engine(format!(
                    "failed to spawn {}: {}",
                    self.settings.command, e
                ))
            })?;

        info!(
            "[OK] Started relay engine pid={:?} config={}: {}",
            child.id(),
            self.config_path().display(),
            capacity
        );
        sink.on_engine_start();

        let stdin = child.stdin.take();
        let stdout_task = child.stdout.take().map(|stdout| {
            tokio::spawn(forward_lines(stdout, move |line| {
                sink.on_notice(line.as_bytes())
            }))
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(forward_lines(stderr, |line| {
                debug!(target: "engine", "{}", line)
            }))
        });

        Ok(Box::new(CommandHandle {
            child,
            stdin,
            readers: stdout_task.into_iter().chain(stderr_task).collect(),
            shutdown_grace: self.shutdown_grace,
        }))
    }
}

struct CommandHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    readers: Vec<JoinHandle<()>>,
    shutdown_grace: Duration,
}

impl CommandHandle {
    async fn stop(&mut self) -> Result<ExitStatus> {
        // Closing stdin is the engine's signal to shut down cleanly.
        drop(self.stdin.take());

        match tokio::time::timeout(self.shutdown_grace, self.child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                warn!(
                    "Relay engine did not exit within {:?}, killing it",
                    self.shutdown_grace
                );
                self.child.kill().await?;
                Ok(self.child.wait().await?)
            }
        }
    }

    /// Output from a finished instance must not reach the sink after its
    /// replacement starts, so readers that outlive the child are aborted.
    async fn drain_readers(&mut self) {
        for mut reader in self.readers.drain(..) {
            if tokio::time::timeout(Duration::from_secs(1), &mut reader)
                .await
                .is_err()
            {
                debug!("Engine output reader still open after exit, aborting it");
                reader.abort();
                let _ = reader.await;
            }
        }
    }
}

#[async_trait]
impl EngineHandle for CommandHandle {
    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<()> {
        let mut this = *self;

        let exited = tokio::select! {
            status = this.child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        // Every path falls through to drain_readers.
        let result = match exited {
            Some(Ok(status)) if status.success() => {
                info!("Relay engine exited");
                Ok(())
            }
            Some(Ok(status)) => Err(SupervisorError::Engine(format!(
                "relay engine exited with {}",
                status
            ))),
            Some(Err(e)) => Err(e.into()),
            None => this.stop().await.map(|status| {
                info!("Relay engine stopped ({})", status);
            }),
        };

        this.drain_readers().await;
        result
    }
}

async fn forward_lines<R, F>(reader: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => on_line(line),
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading engine output: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CapacityMode;
    use parking_lot::Mutex;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[derive(Default)]
    struct CollectingSink {
        lines: Mutex<Vec<String>>,
        starts: Mutex<usize>,
    }

    impl NoticeSink for CollectingSink {
        fn on_notice(&self, raw: &[u8]) {
            self.lines
                .lock()
                .push(String::from_utf8_lossy(raw).into_owned());
        }

        fn on_engine_start(&self) {
            *self.starts.lock() += 1;
        }
    }

    fn capacity() -> CapacityConfig {
        CapacityConfig {
            mode: CapacityMode::Normal,
            max_common_clients: 40,
            max_personal_clients: 10,
            bandwidth_bytes_per_second: 5_000_000,
            proxy_key: "a2V5".to_string(),
            compartment_id: Some("compartment".to_string()),
            emit_activity: true,
        }
    }

    fn engine_in(dir: &TempDir, command: &str, args: &[&str]) -> CommandEngine {
        let mut config = SupervisorConfig::default();
        config.data_dir = dir.path().to_string_lossy().into_owned();
        config.engine.command = command.to_string();
        config.engine.args = args.iter().map(|s| s.to_string()).collect();
        config.engine.shutdown_grace_secs = 0;
        CommandEngine::new(&config)
    }

    #[tokio::test]
    async fn renders_capacity_keys_over_base_and_overrides() {
        let dir = TempDir::new().unwrap();
        let mut base = NamedTempFile::new().unwrap();
        write!(
            base,
            r#"{{"PropagationChannelId": "ABC", "InproxyMaxCommonClients": 999}}"#
        )
        .unwrap();

        let mut config = SupervisorConfig::default();
        config.data_dir = dir.path().to_string_lossy().into_owned();
        config.verbosity = 1;
        config.engine.base_config_path = Some(base.path().to_string_lossy().into_owned());
        config
            .engine
            .set_overrides
            .insert("InproxyReducedStartTime".into(), json!("23:00"));
        config
            .engine
            .set_overrides
            .insert("InproxyMaxPersonalClients".into(), json!(77));
        let engine = CommandEngine::new(&config);

        let rendered = engine.render_config(&capacity()).await.unwrap();
        assert_eq!(rendered["PropagationChannelId"], "ABC");
        assert_eq!(rendered["InproxyReducedStartTime"], "23:00");
        assert_eq!(rendered["InproxyMaxCommonClients"], 40);
        assert_eq!(rendered["InproxyMaxPersonalClients"], 10);
        assert_eq!(rendered["InproxyLimitUpstreamBytesPerSecond"], 5_000_000);
        assert_eq!(rendered["InproxyLimitDownstreamBytesPerSecond"], 5_000_000);
        assert_eq!(rendered["InproxyProxySessionPrivateKey"], "a2V5");
        assert_eq!(rendered["InproxyProxyPersonalCompartmentID"], "compartment");
        assert_eq!(rendered["EmitDiagnosticNotices"], true);
        assert_eq!(rendered["DisableTunnels"], true);
        assert_eq!(
            rendered["DataRootDirectory"],
            dir.path().to_string_lossy().into_owned()
        );
    }

    #[tokio::test]
    async fn unlimited_bandwidth_omits_limits() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir, "true", &[]);
        let mut capacity = capacity();
        capacity.bandwidth_bytes_per_second = 0;
        capacity.compartment_id = None;

        let rendered = engine.render_config(&capacity).await.unwrap();
        assert!(rendered.get("InproxyLimitUpstreamBytesPerSecond").is_none());
        assert!(rendered.get("InproxyLimitDownstreamBytesPerSecond").is_none());
        assert!(rendered.get("InproxyProxyPersonalCompartmentID").is_none());
        assert_eq!(rendered["EmitDiagnosticNotices"], false);
    }

    #[tokio::test]
    async fn start_requires_sink() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir, "true", &[]);
        assert!(engine.start(&capacity()).await.is_err());
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir, "/nonexistent/relay-engine", &[]);
        engine
            .register_notice_sink(Arc::new(CollectingSink::default()))
            .unwrap();
        assert!(matches!(
            engine.start(&capacity()).await,
            Err(SupervisorError::Engine(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forwards_stdout_and_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(
            &dir,
            "sh",
            &["-c", r#"echo '{"noticeType":"Info","data":{}}'; cat > /dev/null"#],
        );
        let sink = Arc::new(CollectingSink::default());
        engine.register_notice_sink(sink.clone()).unwrap();

        let handle = engine.start(&capacity()).await.unwrap();
        assert!(engine.config_path().exists());
        assert_eq!(*sink.starts.lock(), 1);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(handle.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        task.await.unwrap().unwrap();
        assert_eq!(
            sink.lines.lock().as_slice(),
            [r#"{"noticeType":"Info","data":{}}"#.to_string()]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_after_exit_is_not_forwarded() {
        let dir = TempDir::new().unwrap();
        // The background writer keeps stdout open after the engine itself exits.
        let engine = engine_in(
            &dir,
            "sh",
            &["-c", "echo first; (sleep 2; echo late) & exit 0"],
        );
        let sink = Arc::new(CollectingSink::default());
        engine.register_notice_sink(sink.clone()).unwrap();

        let handle = engine.start(&capacity()).await.unwrap();
        handle.run(CancellationToken::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(sink.lines.lock().as_slice(), ["first".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unexpected_exit_is_reported() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir, "sh", &["-c", "exit 3"]);
        engine
            .register_notice_sink(Arc::new(CollectingSink::default()))
            .unwrap();

        let handle = engine.start(&capacity()).await.unwrap();
        let result = handle.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(SupervisorError::Engine(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unresponsive_engine_is_killed_after_grace() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir, "sh", &["-c", "exec sleep 30"]);
        engine
            .register_notice_sink(Arc::new(CollectingSink::default()))
            .unwrap();

        let handle = engine.start(&capacity()).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = std::time::Instant::now();
        handle.run(cancel).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
