//! Session controller for the ProLeak engine connection
//!
//! Owns the connection lifecycle (connect/disconnect), the streaming
//! toggles, and the background receive loop that decodes frames and routes
//! them through the dispatcher. Exactly one receive loop exists per open
//! connection; `disconnect` signals it, closes the socket out from under a
//! pending read, and waits for the loop to exit before returning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dispatch::{CancelToken, Dispatcher, EventNames, Handler, Interceptor, RegistrationId};
use crate::error::{Error, Result};
use crate::frame::FrameDecoder;
use crate::protocol::{Command, ParamMap};

/// Socket read buffer size
const READ_BUFFER_SIZE: usize = 4096;

/// Poll interval of the `plug` idle loop
const PLUG_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Client for the ProLeak engine
///
/// Maintains at most one TCP connection to the engine at a time.
/// Registration calls are safe to interleave with a live connection; a
/// change takes effect no later than the next frame boundary.
pub struct Client {
    config: Config,
    shared: Arc<Shared>,
}

/// State shared between the application side and the receive loop
struct Shared {
    /// Session-running flag; cleared by `disconnect`, cancellation, and the
    /// receive loop's own teardown
    running: Arc<AtomicBool>,
    /// Whether the engine is currently streaming to this client
    streaming: AtomicBool,
    /// Write half of the open connection; all outbound commands serialize
    /// through this lock
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Join handle of the receive loop task
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Shutdown signal observed by the receive loop's select
    shutdown: broadcast::Sender<()>,
    dispatcher: Dispatcher,
}

impl Shared {
    /// Serialize one command onto the open connection
    async fn send_command(&self, command: Command) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;
        writer
            .write_all(command.encode().as_bytes())
            .await
            .map_err(Error::SendFailed)?;
        writer.flush().await.map_err(Error::SendFailed)?;
        Ok(())
    }

    /// Shut down and drop the write half, tolerating a socket that is
    /// already closed
    async fn close_writer(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Everything `disconnect` does except joining the receive loop; the
    /// loop runs this itself on exit
    async fn teardown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.streaming.store(false, Ordering::SeqCst);
        self.close_writer().await;
    }
}

impl Client {
    /// Create a client configured from the environment (falling back to the
    /// default `localhost:69420` endpoint)
    pub fn new() -> Self {
        Self::with_config(Config::from_env())
    }

    /// Create a client with an explicit configuration
    pub fn with_config(config: Config) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            shared: Arc::new(Shared {
                running: Arc::new(AtomicBool::new(false)),
                streaming: AtomicBool::new(false),
                writer: Mutex::new(None),
                reader: Mutex::new(None),
                shutdown,
                dispatcher: Dispatcher::default(),
            }),
        }
    }

    /// The configuration this client connects with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether a session is currently open
    pub fn is_connected(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Whether the engine is currently streaming events to this client
    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::SeqCst)
    }

    /// Open the connection and start the receive loop
    ///
    /// No-op when already connected. On failure (timeout, refusal,
    /// resolution) the session is left disconnected and the error is
    /// returned; reconnection is never automatic.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            debug!("connect called on an open session");
            return Ok(());
        }

        let addr = self.config.addr();
        info!(%addr, "connecting to the ProLeak engine");
        let stream = match timeout(self.config.connect_timeout(), TcpStream::connect(&addr)).await
        {
            Err(_) => {
                return Err(Error::ConnectTimeout {
                    addr,
                    timeout_secs: self.config.connect_timeout_secs,
                })
            }
            Ok(Err(source)) => return Err(Error::ConnectFailed { addr, source }),
            Ok(Ok(stream)) => stream,
        };

        let (read_half, write_half) = stream.into_split();
        *self.shared.writer.lock().await = Some(write_half);
        self.shared.running.store(true, Ordering::SeqCst);

        let shutdown_rx = self.shared.shutdown.subscribe();
        let handle = tokio::spawn(receive_loop(
            Arc::clone(&self.shared),
            read_half,
            shutdown_rx,
        ));
        *self.shared.reader.lock().await = Some(handle);

        info!("connected");
        Ok(())
    }

    /// Close the connection and wait for the receive loop to exit
    ///
    /// Idempotent; safe to call on a session that never connected or whose
    /// peer already hung up.
    pub async fn disconnect(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.shared.shutdown.send(());
        self.shared.close_writer().await;

        let handle = self.shared.reader.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("receive loop did not exit cleanly: {e}");
            }
        }
        self.shared.streaming.store(false, Ordering::SeqCst);
        debug!("disconnected");
    }

    /// Ask the engine to start streaming events
    ///
    /// No-op when already streaming; exactly one `START` is sent per
    /// transition.
    pub async fn start_leaking(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        if self.shared.streaming.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.send_command(Command::Start).await?;
        self.shared.streaming.store(true, Ordering::SeqCst);
        info!("streaming started");
        Ok(())
    }

    /// Ask the engine to stop streaming events
    pub async fn stop_leaking(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        if !self.shared.streaming.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.send_command(Command::Stop).await?;
        self.shared.streaming.store(false, Ordering::SeqCst);
        info!("streaming stopped");
        Ok(())
    }

    /// Register a handler for one or more event names
    pub fn register_handler(
        &self,
        events: impl Into<EventNames>,
        handler: Handler,
    ) -> RegistrationId {
        self.shared.dispatcher.register_handler(events.into(), handler)
    }

    /// Remove a handler registration from the given event names
    pub fn unregister_handler(&self, events: impl Into<EventNames>, id: RegistrationId) -> bool {
        self.shared.dispatcher.unregister_handler(events.into(), id)
    }

    /// Register a handler invoked for every event
    pub fn register_global_handler(&self, handler: Handler) -> RegistrationId {
        self.shared.dispatcher.register_global_handler(handler)
    }

    /// Remove a global handler registration
    pub fn unregister_global_handler(&self, id: RegistrationId) -> bool {
        self.shared.dispatcher.unregister_global_handler(id)
    }

    /// Register an interceptor for one or more event names
    pub fn register_interceptor(
        &self,
        events: impl Into<EventNames>,
        interceptor: Interceptor,
    ) -> RegistrationId {
        self.shared
            .dispatcher
            .register_interceptor(events.into(), interceptor)
    }

    /// Remove an interceptor registration from the given event names
    pub fn unregister_interceptor(
        &self,
        events: impl Into<EventNames>,
        id: RegistrationId,
    ) -> bool {
        self.shared
            .dispatcher
            .unregister_interceptor(events.into(), id)
    }

    /// Connect, start streaming, and idle until the callback cancels
    ///
    /// Installs `callback` as a global handler with a cancellation token,
    /// then polls until the session stops running - because the callback
    /// cancelled, the peer hung up, or the socket failed. Streaming is
    /// stopped and the session disconnected on every exit path; setup
    /// errors are returned after that cleanup.
    pub async fn plug<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&str, &ParamMap, &CancelToken) + Send + Sync + 'static,
    {
        let registration = self.register_global_handler(Handler::cancellable(callback));

        let setup = async {
            self.connect().await?;
            self.start_leaking().await
        };
        let result = match setup.await {
            Ok(()) => {
                while self.shared.running.load(Ordering::SeqCst) {
                    sleep(PLUG_POLL_INTERVAL).await;
                }
                Ok(())
            }
            Err(e) => {
                error!("plug setup failed: {e}");
                Err(e)
            }
        };

        let _ = self.stop_leaking().await;
        self.disconnect().await;
        self.unregister_global_handler(registration);
        result
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// Background receive loop: sole reader of the socket and sole invoker of
/// handlers and interceptors
async fn receive_loop(
    shared: Arc<Shared>,
    mut read_half: OwnedReadHalf,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    debug!("receive loop started");

    while shared.running.load(Ordering::SeqCst) {
        tokio::select! {
            result = read_half.read(&mut buf) => match result {
                Ok(0) => {
                    info!("the ProLeak engine closed the connection");
                    break;
                }
                Ok(n) => {
                    decoder.extend(&buf[..n]);
                    if !drain_frames(&shared, &mut decoder).await {
                        break;
                    }
                }
                Err(e) => {
                    error!("socket error in receive loop: {e}");
                    break;
                }
            },
            _ = shutdown_rx.recv() => {
                debug!("receive loop shutdown requested");
                break;
            }
        }
    }

    shared.teardown().await;
    debug!("receive loop exited");
}

/// Dispatch every complete frame currently buffered
///
/// Returns `false` when the loop should stop: the session was cancelled
/// mid-batch or an interception result could not be sent.
async fn drain_frames(shared: &Shared, decoder: &mut FrameDecoder) -> bool {
    loop {
        if !shared.running.load(Ordering::SeqCst) {
            return false;
        }
        match decoder.next_frame() {
            Ok(Some(frame)) => {
                let cancel = CancelToken::new(Arc::clone(&shared.running));
                if let Some(result) = shared.dispatcher.dispatch(frame, &cancel) {
                    if let Err(e) = shared
                        .send_command(Command::InterceptionResult(result))
                        .await
                    {
                        error!("failed to send interception result: {e}");
                        return false;
                    }
                }
            }
            Ok(None) => return true,
            Err(e) => warn!("skipping malformed frame: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{InterceptionResult, ParamMap};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn engine() -> (TcpListener, Config) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = Config::new()
            .with_host("127.0.0.1")
            .with_port(u32::from(port));
        (listener, config)
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let (listener, config) = engine().await;
        let client = Client::with_config(config);

        client.connect().await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();
        assert!(client.is_connected());

        client.disconnect().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (listener, config) = engine().await;
        let client = Client::with_config(config);

        client.connect().await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();
        client.connect().await.unwrap();

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, config) = engine().await;
        drop(listener);

        let client = Client::with_config(config);
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, Error::ConnectFailed { .. }));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (listener, config) = engine().await;
        let client = Client::with_config(config);

        client.disconnect().await;
        client.disconnect().await;

        client.connect().await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();
        client.disconnect().await;
        client.disconnect().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let (listener, config) = engine().await;
        let client = Client::with_config(config);

        client.connect().await.unwrap();
        let (_first, _) = listener.accept().await.unwrap();
        client.disconnect().await;

        client.connect().await.unwrap();
        let (_second, _) = listener.accept().await.unwrap();
        assert!(client.is_connected());
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_start_stop_require_connection() {
        let client = Client::with_config(Config::new());
        assert!(matches!(
            client.start_leaking().await.unwrap_err(),
            Error::NotConnected
        ));
        assert!(matches!(
            client.stop_leaking().await.unwrap_err(),
            Error::NotConnected
        ));
    }

    #[tokio::test]
    async fn test_start_stop_send_one_command_per_transition() {
        let (listener, config) = engine().await;
        let client = Client::with_config(config);

        client.connect().await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        client.start_leaking().await.unwrap();
        client.start_leaking().await.unwrap();
        assert!(client.is_streaming());
        client.stop_leaking().await.unwrap();
        client.stop_leaking().await.unwrap();
        assert!(!client.is_streaming());
        client.disconnect().await;

        let mut sent = Vec::new();
        timeout(Duration::from_secs(5), server.read_to_end(&mut sent))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent, b"STARTSTOP");
    }

    #[tokio::test]
    async fn test_frames_reach_handlers() {
        let (listener, config) = engine().await;
        let client = Client::with_config(config);

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.register_handler(
            "MethodCall",
            Handler::simple(move |event: &str, params: &ParamMap| {
                let _ = tx.send((event.to_string(), params.clone()));
            }),
        );

        client.connect().await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        server
            .write_all(b"MethodCall: x\n{\"Method\":\"Foo\",\"__is_prefix\":false}\n---\n")
            .await
            .unwrap();

        let (event, params) = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("handler was not invoked")
            .expect("channel closed");
        assert_eq!(event, "MethodCall");
        assert_eq!(params.get("Method"), Some(&json!("Foo")));
        assert!(!params.contains_key("__is_prefix"));

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_blocking_interceptor_answers_on_the_wire() {
        let (listener, config) = engine().await;
        let client = Client::with_config(config);
        client.register_interceptor("MethodCall", Interceptor::new(|_, _| None));

        client.connect().await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        server
            .write_all(b"MethodCall: x\n{\"Method\":\"Foo\",\"__is_prefix\":true}\n---\n")
            .await
            .unwrap();

        let expected =
            Command::InterceptionResult(InterceptionResult::new("MethodCall", &ParamMap::new()))
                .encode();
        let expected_len = expected.len();
        let received = timeout(Duration::from_secs(5), async move {
            let mut received = Vec::new();
            let mut chunk = [0u8; 256];
            loop {
                let n = server.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&chunk[..n]);
                if received.len() >= expected_len {
                    break;
                }
            }
            received
        })
        .await
        .expect("timed out waiting for the interception result");

        assert_eq!(String::from_utf8_lossy(&received), expected);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_peer_close_tears_the_session_down() {
        let (listener, config) = engine().await;
        let client = Client::with_config(config);

        client.connect().await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        drop(server);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while client.is_connected() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "client did not notice the peer closing"
            );
            sleep(Duration::from_millis(10)).await;
        }

        // a later disconnect is still safe
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_plug_runs_until_the_callback_unplugs() {
        let (listener, config) = engine().await;
        let client = Client::with_config(config);

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"EndOfGame: x\n{}\n---\n")
                .await
                .unwrap();
            let mut sent = Vec::new();
            let _ = stream.read_to_end(&mut sent).await;
            sent
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        timeout(
            Duration::from_secs(10),
            client.plug(move |event: &str, _: &ParamMap, cancel: &CancelToken| {
                let _ = tx.send(event.to_string());
                cancel.cancel();
            }),
        )
        .await
        .expect("plug did not return")
        .unwrap();

        assert_eq!(rx.recv().await, Some("EndOfGame".to_string()));
        assert!(!client.is_connected());

        let sent = server.await.unwrap();
        assert_eq!(sent, b"START");
    }

    #[tokio::test]
    async fn test_plug_surfaces_setup_errors_after_cleanup() {
        let (listener, config) = engine().await;
        drop(listener);

        let client = Client::with_config(config);
        let err = client
            .plug(|_: &str, _: &ParamMap, _: &CancelToken| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectFailed { .. }));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let (listener, config) = engine().await;
        let client = Client::with_config(config);

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.register_global_handler(Handler::simple(move |event: &str, _: &ParamMap| {
            let _ = tx.send(event.to_string());
        }));

        client.connect().await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        server
            .write_all(b"broken line without separator\n---\nMethodCall: x\n{\"Method\":\"Foo\"}\n---\n")
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("the frame behind the malformed one was not dispatched")
            .expect("channel closed");
        assert_eq!(event, "MethodCall");

        client.disconnect().await;
    }
}
