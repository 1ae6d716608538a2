//! Exec driver
//!
//! Picks the backend transport for a session and drives it to completion:
//!
//! - [`Transport::RawRelay`]: a second websocket to the API server's `exec`
//!   sub-resource, relayed frame for frame to the client
//! - [`Transport::Multiplexed`]: kube-rs' attached process, with the session
//!   adapter translating between the client protocol and the process'
//!   stdin/stdout/resize streams
//!
//! Either way the session's terminator has fired by the time `exec` returns.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use http::Uri;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, TerminalSize};
use kube::Client;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::frame::{CloseReason, Frame, FrameConnection};
use crate::relay::{relay, RelayOptions, DEFAULT_CLOSE_GRACE};
use crate::session::{Session, SessionReader, SessionWriter, SizeQueue};
use crate::terminate::Terminator;
use crate::upgrade::{BackendConnection, Upgrader};

/// Backend executor requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Raw websocket to the exec sub-resource
    Websocket,
    /// Multiplexed exec stream managed by kube-rs
    #[serde(alias = "spdy")]
    Multiplexed,
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Websocket => write!(f, "websocket"),
            Self::Multiplexed => write!(f, "multiplexed"),
        }
    }
}

impl FromStr for ExecutorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "websocket" => Ok(Self::Websocket),
            "multiplexed" | "spdy" => Ok(Self::Multiplexed),
            other => Err(Error::config(format!("unknown executor '{}'", other))),
        }
    }
}

/// Transport actually used for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Relay client frames verbatim over a backend websocket
    RawRelay,
    /// Adapt the client protocol onto kube-rs' attached process
    Multiplexed,
}

/// Which streams to attach and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOptions {
    /// Attach stdin
    pub stdin: bool,
    /// Attach stdout
    pub stdout: bool,
    /// Attach stderr
    pub stderr: bool,
    /// Allocate a TTY
    pub tty: bool,
    /// Requested executor, `None` to let the driver choose
    pub executor: Option<ExecutorKind>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            stdin: true,
            stdout: true,
            stderr: true,
            tty: true,
            executor: None,
        }
    }
}

impl ExecOptions {
    /// Select the transport: raw relay for TTY sessions unless the
    /// multiplexed executor was asked for
    pub fn transport(&self) -> Transport {
        match (self.tty, self.executor) {
            (true, None | Some(ExecutorKind::Websocket)) => Transport::RawRelay,
            _ => Transport::Multiplexed,
        }
    }

    /// kube-rs attach parameters
    ///
    /// kube-rs rejects stderr together with a TTY (the TTY merges it into
    /// stdout), so stderr is dropped when a TTY is requested.
    pub fn attach_params(&self, container: &str) -> AttachParams {
        AttachParams {
            stdin: self.stdin,
            stdout: self.stdout,
            stderr: self.stderr && !self.tty,
            tty: self.tty,
            container: Some(container.to_string()),
            max_stdin_buf_size: None,
            max_stdout_buf_size: None,
            max_stderr_buf_size: None,
        }
    }
}

/// The container and command to exec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecTarget {
    /// Namespace of the pod
    pub namespace: String,
    /// Name of the pod
    pub pod: String,
    /// Container to exec into
    pub container: String,
    /// Command and arguments
    pub command: Vec<String>,
}

impl ExecTarget {
    /// API path of the pod's exec sub-resource
    pub fn exec_path(&self) -> String {
        format!(
            "/api/v1/namespaces/{}/pods/{}/exec",
            self.namespace, self.pod
        )
    }

    /// Query string for the exec sub-resource
    pub fn exec_query(&self, opts: &ExecOptions) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("container", &self.container);
        for arg in &self.command {
            query.append_pair("command", arg);
        }
        query
            .append_pair("stdin", bool_param(opts.stdin))
            .append_pair("stdout", bool_param(opts.stdout))
            .append_pair("stderr", bool_param(opts.stderr))
            .append_pair("tty", bool_param(opts.tty));
        query.finish()
    }

    /// Full exec URL below `cluster_url`, keeping any path prefix it has
    pub fn exec_url(&self, cluster_url: &Uri, opts: &ExecOptions) -> Result<Uri> {
        let scheme = cluster_url.scheme_str().unwrap_or("https");
        let authority = cluster_url
            .authority()
            .ok_or_else(|| Error::config(format!("cluster URL has no host: {}", cluster_url)))?;
        let prefix = cluster_url.path().trim_end_matches('/');

        format!(
            "{}://{}{}{}?{}",
            scheme,
            authority,
            prefix,
            self.exec_path(),
            self.exec_query(opts)
        )
        .parse()
        .map_err(|e| Error::config(format!("invalid exec URL: {}", e)))
    }
}

fn bool_param(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Drives exec sessions against one cluster
#[derive(Clone)]
pub struct TerminalExec {
    client: Client,
    upgrader: Upgrader,
    cluster_url: Uri,
}

impl TerminalExec {
    /// Create a driver for the cluster `config` points at
    pub fn new(client: Client, config: &kube::Config) -> Result<Self> {
        Ok(Self {
            client,
            upgrader: Upgrader::from_config(config)?,
            cluster_url: config.cluster_url.clone(),
        })
    }

    /// Run `target` inside the session until either side ends
    pub async fn exec<C>(
        &self,
        session: Session<C>,
        target: &ExecTarget,
        opts: &ExecOptions,
    ) -> Result<()>
    where
        C: FrameConnection,
    {
        let transport = opts.transport();
        let terminator = session.terminator();
        info!(
            namespace = %target.namespace,
            pod = %target.pod,
            container = %target.container,
            transport = ?transport,
            "starting exec session"
        );

        let result = match transport {
            Transport::RawRelay => self.exec_raw_relay(session, target, opts).await,
            Transport::Multiplexed => self.exec_multiplexed(session, target, opts).await,
        };
        terminator.terminate();

        match &result {
            Ok(()) => info!(
                namespace = %target.namespace,
                pod = %target.pod,
                container = %target.container,
                "exec session closed"
            ),
            Err(e) => warn!(
                namespace = %target.namespace,
                pod = %target.pod,
                container = %target.container,
                error = %e,
                "exec session ended with error"
            ),
        }
        result
    }

    async fn exec_raw_relay<C>(
        &self,
        session: Session<C>,
        target: &ExecTarget,
        opts: &ExecOptions,
    ) -> Result<()>
    where
        C: FrameConnection,
    {
        let subprotocols: Vec<String> = session
            .subprotocol()
            .map(str::to_string)
            .into_iter()
            .collect();
        let (mut client, terminator) = session.into_parts();

        let backend = match self.connect_backend(target, opts, &subprotocols).await {
            Ok(backend) => backend,
            Err(e) => {
                error!(error = %e, "failed to open backend websocket");
                if let Err(close_err) = client.send(Frame::close(CloseReason::error(&e))).await {
                    debug!(error = %close_err, "failed to close client connection");
                }
                let _ = client.close().await;
                return Err(e);
            }
        };

        let options = RelayOptions {
            farewell: Some(backend.exit_frame()),
            terminator,
            ..Default::default()
        };
        relay(client, backend.socket, options).await
    }

    async fn connect_backend(
        &self,
        target: &ExecTarget,
        opts: &ExecOptions,
        subprotocols: &[String],
    ) -> Result<BackendConnection> {
        let url = target.exec_url(&self.cluster_url, opts)?;
        self.upgrader.connect(&url, subprotocols).await
    }

    async fn exec_multiplexed<C>(
        &self,
        session: Session<C>,
        target: &ExecTarget,
        opts: &ExecOptions,
    ) -> Result<()>
    where
        C: FrameConnection,
    {
        let terminator = session.terminator();
        let (reader, mut writer, sizes) = session.split();

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let params = opts.attach_params(&target.container);
        let mut attached = match pods.exec(&target.pod, target.command.clone(), &params).await {
            Ok(attached) => attached,
            Err(e) => {
                let e = Error::from(e);
                error!(error = %e, "failed to start exec");
                if let Err(close_err) = writer.close(CloseReason::error(&e)).await {
                    debug!(error = %close_err, "failed to close client connection");
                }
                return Err(e);
            }
        };
        debug!(pod = %target.pod, "attached to process");

        let mut output: Vec<BoxStream<'static, std::io::Result<bytes::Bytes>>> = Vec::new();
        if let Some(stdout) = attached.stdout() {
            output.push(ReaderStream::new(stdout).boxed());
        }
        if let Some(stderr) = attached.stderr() {
            output.push(ReaderStream::new(stderr).boxed());
        }

        let io = ProcessIo {
            stdin: attached.stdin(),
            output: stream::select_all(output),
            resize: attached.terminal_size(),
        };
        let result = run_pumps(reader, writer, sizes, io, terminator).await;

        if let Some(status) = attached.take_status() {
            match tokio::time::timeout(STATUS_WAIT, status).await {
                Ok(Some(status)) => info!(
                    status = ?status.status,
                    reason = ?status.reason,
                    message = ?status.message,
                    "process exited"
                ),
                Ok(None) => debug!("process exited without a status"),
                Err(_) => debug!("process status not reported"),
            }
        }

        result
    }
}

/// How long to wait for the process' final status once the session is over
const STATUS_WAIT: Duration = Duration::from_secs(1);

/// The attached process as the pumps see it
struct ProcessIo<I, O> {
    stdin: Option<I>,
    output: O,
    resize: Option<futures::channel::mpsc::Sender<TerminalSize>>,
}

/// Run the stdin, output and resize pumps until the first one finishes
///
/// The first pump to finish terminates the session and decides the close
/// frame the client gets: normal on success, the error text otherwise. The
/// remaining pumps get [`DEFAULT_CLOSE_GRACE`] to stop before they are
/// aborted.
async fn run_pumps<R, W, I, O>(
    reader: SessionReader<R>,
    writer: SessionWriter<W>,
    sizes: SizeQueue,
    io: ProcessIo<I, O>,
    terminator: Terminator,
) -> Result<()>
where
    R: Stream<Item = Result<Frame>> + Unpin + Send + 'static,
    W: Sink<Frame, Error = Error> + Unpin + Send + 'static,
    I: AsyncWrite + Unpin + Send + 'static,
    O: Stream<Item = std::io::Result<bytes::Bytes>> + Unpin + Send + 'static,
{
    let (close_tx, close_rx) = watch::channel(None);

    let mut pumps = JoinSet::new();
    pumps.spawn(pump_stdin(reader, io.stdin, terminator.clone()));
    pumps.spawn(pump_output(io.output, writer, terminator.clone(), close_rx));
    if let Some(resize_tx) = io.resize {
        pumps.spawn(pump_resize(sizes, resize_tx));
    }

    let first = pumps.join_next().await;
    let mut result = first.map(flatten_join).unwrap_or(Ok(()));
    let reason = match &result {
        Ok(()) => CloseReason::normal(""),
        Err(e) => CloseReason::error(e),
    };
    close_tx.send_replace(Some(reason));
    terminator.terminate();

    let drain = async {
        while let Some(joined) = pumps.join_next().await {
            if let Err(e) = flatten_join(joined) {
                if result.is_ok() {
                    result = Err(e);
                } else {
                    debug!(error = %e, "further exec pump error");
                }
            }
        }
    };
    if tokio::time::timeout(DEFAULT_CLOSE_GRACE, drain).await.is_err() {
        warn!("exec pumps did not stop in time, aborting");
        pumps.abort_all();
    }

    result
}

fn flatten_join(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| Error::transport("exec", format!("pump task failed: {}", e)))?
}

/// Client frames into process stdin
///
/// Runs even when stdin is not attached so that resizes are still published
/// and a client hangup still ends the session.
async fn pump_stdin<R, W>(
    mut reader: SessionReader<R>,
    mut stdin: Option<W>,
    terminator: Terminator,
) -> Result<()>
where
    R: Stream<Item = Result<Frame>> + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = terminator.terminated() => return Ok(()),
            read = reader.read(&mut buf) => read,
        };

        if let (Some(stdin), false) = (stdin.as_mut(), buf.is_empty()) {
            stdin
                .write_all(&buf)
                .await
                .map_err(|e| Error::transport("exec", format!("write stdin: {}", e)))?;
            stdin
                .flush()
                .await
                .map_err(|e| Error::transport("exec", format!("flush stdin: {}", e)))?;
        }

        match read {
            Ok(_) => {}
            Err(e) if e.is_graceful() => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Process stdout/stderr into the client
///
/// When the session is terminated from elsewhere the client is closed with
/// the reason published on `close_reason`.
async fn pump_output<S, W>(
    mut output: S,
    mut writer: SessionWriter<W>,
    terminator: Terminator,
    mut close_reason: watch::Receiver<Option<CloseReason>>,
) -> Result<()>
where
    S: Stream<Item = std::io::Result<bytes::Bytes>> + Unpin,
    W: Sink<Frame, Error = Error> + Unpin,
{
    loop {
        let chunk = tokio::select! {
            biased;
            _ = terminator.terminated() => {
                let reason = match close_reason.wait_for(Option::is_some).await {
                    Ok(reason) => (*reason).clone(),
                    Err(_) => None,
                };
                let reason = reason.unwrap_or_else(|| CloseReason::normal(""));
                if let Err(e) = writer.close(reason).await {
                    debug!(error = %e, "close after termination failed");
                }
                return Ok(());
            }
            chunk = output.next() => chunk,
        };

        match chunk {
            Some(Ok(data)) => {
                writer.write(&data).await?;
            }
            Some(Err(e)) => {
                let e = Error::transport("exec", format!("read output: {}", e));
                if let Err(close_err) = writer.close(CloseReason::error(&e)).await {
                    debug!(error = %close_err, "failed to close client connection");
                }
                return Err(e);
            }
            None => {
                debug!("process output ended");
                return writer.close(CloseReason::normal("process exited")).await;
            }
        }
    }
}

/// Latest terminal sizes into the process
async fn pump_resize(
    mut sizes: SizeQueue,
    mut resize_tx: futures::channel::mpsc::Sender<TerminalSize>,
) -> Result<()> {
    let mut open = true;
    while let Some(size) = sizes.next_size().await {
        if open && resize_tx.send(size).await.is_err() {
            debug!("process no longer accepts resizes");
            open = false;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncReadExt, DuplexStream};

    use super::*;
    use crate::frame::close_code;
    use crate::message::TerminalMessage;
    use crate::testing::{socket_pair, MemorySocket};

    fn stdin_frame(data: &str) -> Frame {
        let msg = TerminalMessage {
            op: "stdin".to_string(),
            data: data.to_string(),
            ..Default::default()
        };
        Frame::Text(serde_json::to_string(&msg).unwrap())
    }

    async fn next_frame(peer: &mut MemorySocket) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), peer.next())
            .await
            .expect("no frame within 5s")
            .expect("connection ended")
            .unwrap()
    }

    /// A process whose output is whatever it reads on stdin
    fn echo_process() -> ProcessIo<DuplexStream, ReaderStream<DuplexStream>> {
        let (stdin, echoed) = tokio::io::duplex(1024);
        ProcessIo {
            stdin: Some(stdin),
            output: ReaderStream::new(echoed),
            resize: None,
        }
    }

    /// Process stdin that takes writes but cannot be flushed
    struct BrokenStdin;

    impl AsyncWrite for BrokenStdin {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "process gone",
            )))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn target() -> ExecTarget {
        ExecTarget {
            namespace: "default".to_string(),
            pod: "web-0".to_string(),
            container: "app".to_string(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()],
        }
    }

    #[test]
    fn test_transport_selection() {
        let mut opts = ExecOptions::default();
        assert_eq!(opts.transport(), Transport::RawRelay);

        opts.executor = Some(ExecutorKind::Websocket);
        assert_eq!(opts.transport(), Transport::RawRelay);

        opts.executor = Some(ExecutorKind::Multiplexed);
        assert_eq!(opts.transport(), Transport::Multiplexed);

        opts.executor = None;
        opts.tty = false;
        assert_eq!(opts.transport(), Transport::Multiplexed);

        opts.executor = Some(ExecutorKind::Websocket);
        assert_eq!(opts.transport(), Transport::Multiplexed);
    }

    #[test]
    fn test_executor_kind_parsing() {
        assert_eq!(
            "websocket".parse::<ExecutorKind>().unwrap(),
            ExecutorKind::Websocket
        );
        assert_eq!(
            "SPDY".parse::<ExecutorKind>().unwrap(),
            ExecutorKind::Multiplexed
        );
        assert!("grpc".parse::<ExecutorKind>().is_err());

        let kind: ExecutorKind = serde_json::from_str("\"spdy\"").unwrap();
        assert_eq!(kind, ExecutorKind::Multiplexed);
        assert_eq!(
            serde_json::to_string(&ExecutorKind::Multiplexed).unwrap(),
            "\"multiplexed\""
        );
    }

    #[test]
    fn test_attach_params_drop_stderr_under_tty() {
        let params = ExecOptions::default().attach_params("app");
        assert!(params.tty);
        assert!(!params.stderr);
        assert_eq!(params.container.as_deref(), Some("app"));

        let params = ExecOptions {
            tty: false,
            ..Default::default()
        }
        .attach_params("app");
        assert!(params.stderr);
    }

    #[test]
    fn test_exec_query_repeats_command() {
        let query = target().exec_query(&ExecOptions::default());
        assert_eq!(
            query,
            "container=app&command=%2Fbin%2Fsh&command=-c&command=echo+hi\
             &stdin=true&stdout=true&stderr=true&tty=true"
        );
    }

    #[test]
    fn test_exec_url_keeps_cluster_prefix() {
        let opts = ExecOptions::default();

        let url = target()
            .exec_url(&"https://10.0.0.1:6443".parse().unwrap(), &opts)
            .unwrap();
        assert_eq!(url.path(), "/api/v1/namespaces/default/pods/web-0/exec");
        assert_eq!(url.host(), Some("10.0.0.1"));

        let url = target()
            .exec_url(
                &"https://rancher.example.com/k8s/clusters/c-abc/".parse().unwrap(),
                &opts,
            )
            .unwrap();
        assert_eq!(
            url.path(),
            "/k8s/clusters/c-abc/api/v1/namespaces/default/pods/web-0/exec"
        );
        assert!(url.query().unwrap().starts_with("container=app"));
    }

    #[tokio::test]
    async fn test_stdin_pump_delivers_bytes_and_eot() {
        let (client_peer, client_end) = socket_pair();
        let session = Session::new(client_end);
        let terminator = session.terminator();
        let (reader, _writer, _sizes) = session.split();
        let (stdin_tx, mut stdin_rx) = tokio::io::duplex(1024);

        for data in ["ls", " -la", "\r"] {
            let msg = TerminalMessage {
                op: "stdin".to_string(),
                data: data.to_string(),
                ..Default::default()
            };
            client_peer.push(Frame::Text(serde_json::to_string(&msg).unwrap()));
        }
        client_peer.push(Frame::close(CloseReason::normal("")));

        pump_stdin(reader, Some(stdin_tx), terminator).await.unwrap();

        let mut received = Vec::new();
        stdin_rx.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ls -la\r\x04");
    }

    #[tokio::test]
    async fn test_stdin_pump_protocol_error() {
        let (client_peer, client_end) = socket_pair();
        let session = Session::new(client_end);
        let terminator = session.terminator();
        let (reader, _writer, _sizes) = session.split();

        client_peer.push(Frame::Text(r#"{"op":"bind"}"#.to_string()));

        let err = pump_stdin(reader, None::<tokio::io::DuplexStream>, terminator.clone())
            .await
            .unwrap_err();
        assert!(err.is_protocol());
        assert!(terminator.is_terminated());
    }

    #[tokio::test]
    async fn test_output_pump_closes_client_when_process_exits() {
        let (mut client_peer, client_end) = socket_pair();
        let session = Session::new(client_end);
        let terminator = session.terminator();
        let (_reader, writer, _sizes) = session.split();

        let output = stream::iter(vec![
            Ok(bytes::Bytes::from_static(b"hello ")),
            Ok(bytes::Bytes::from_static(b"world")),
        ]);
        let (_close_tx, close_rx) = watch::channel(None);
        pump_output(output, writer, terminator, close_rx).await.unwrap();

        let mut data = String::new();
        while let Some(frame) = client_peer.try_recv() {
            match frame {
                Frame::Text(text) => {
                    let msg = TerminalMessage::parse(text.as_bytes()).unwrap();
                    data.push_str(&msg.data);
                }
                Frame::Close(reason) => {
                    assert_eq!(reason.unwrap().reason, "process exited");
                    break;
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(data, "hello world");
    }

    #[tokio::test]
    async fn test_resize_pump_forwards_latest_size() {
        let (client_peer, client_end) = socket_pair();
        let session = Session::new(client_end);
        let terminator = session.terminator();
        let (mut reader, _writer, sizes) = session.split();
        let (resize_tx, mut resize_rx) = futures::channel::mpsc::channel(4);

        let pump = tokio::spawn(pump_resize(sizes, resize_tx));

        client_peer.push(Frame::Text(r#"{"op":"resize","rows":50,"cols":200}"#.to_string()));
        let mut buf = Vec::new();
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);

        let size = resize_rx.next().await.unwrap();
        assert_eq!((size.width, size.height), (200, 50));

        terminator.terminate();
        pump.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stdin_pump_reports_flush_failure() {
        let (client_peer, client_end) = socket_pair();
        let session = Session::new(client_end);
        let terminator = session.terminator();
        let (reader, _writer, _sizes) = session.split();

        client_peer.push(stdin_frame("ls\r"));

        let err = pump_stdin(reader, Some(BrokenStdin), terminator)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert!(err.to_string().contains("flush stdin"), "{}", err);
    }

    #[tokio::test]
    async fn test_pumps_echo_stdin_frames_in_order() {
        let (mut client_peer, client_end) = socket_pair();
        let session = Session::new(client_end);
        let terminator = session.terminator();
        let (reader, writer, sizes) = session.split();
        let pumps = tokio::spawn(run_pumps(
            reader,
            writer,
            sizes,
            echo_process(),
            terminator.clone(),
        ));

        for i in 0..20 {
            let line = format!("line {}\r\n", i);
            client_peer.push(stdin_frame(&line));
            match next_frame(&mut client_peer).await {
                Frame::Text(text) => {
                    let msg = TerminalMessage::parse(text.as_bytes()).unwrap();
                    assert_eq!(msg.op, "stdout");
                    assert_eq!(msg.data, line);
                }
                other => panic!("expected stdout frame, got {:?}", other),
            }
        }

        client_peer.push(Frame::close(CloseReason::normal("")));
        pumps.await.unwrap().unwrap();
        assert!(terminator.is_terminated());
    }

    #[tokio::test]
    async fn test_pumps_close_carries_protocol_error() {
        let (mut client_peer, client_end) = socket_pair();
        let session = Session::new(client_end);
        let terminator = session.terminator();
        let (reader, writer, sizes) = session.split();
        let pumps = tokio::spawn(run_pumps(reader, writer, sizes, echo_process(), terminator));

        client_peer.push(Frame::Text(r#"{"op":"bind"}"#.to_string()));
        let err = pumps.await.unwrap().unwrap_err();
        assert!(err.is_protocol());

        let close = loop {
            match next_frame(&mut client_peer).await {
                Frame::Close(reason) => break reason.expect("close without a reason"),
                // the end-of-transmission byte echoed back
                Frame::Text(_) => continue,
                other => panic!("unexpected frame {:?}", other),
            }
        };
        assert_eq!(close.code, close_code::INTERNAL_ERROR);
        assert!(
            close.reason.contains("unknown message type 'bind'"),
            "{}",
            close.reason
        );
    }
}
