//! The session engine: one spawned process, one conversation.
//!
//! A session owns the supervisor, the IO tasks, the control-plane
//! correlator, and the turn demultiplexer. The reader task drives
//! classification and routing; control-request handlers run on spawned
//! workers so a slow callback can never stall the reader.

use std::{
    collections::BTreeMap,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::{stream, Stream};
use serde_json::{Map, Value};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStdout},
    sync::{mpsc, Mutex as TokioMutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::{
    control::Correlator,
    hooks::HookRegistry,
    mcp::ToolServerHandler,
    message::{AgentMessage, ResultMessage},
    options::{AgentOptions, PermissionMode},
    permission::{PermissionContext, PermissionSlot},
    process::{self, SpawnedAgent},
    protocol::{self, ControlRequest, ControlRequestPayload, InboundFrame},
    router::{TurnReceiver, TurnRouter},
    transport::{self, WriterCommand},
    AgentClientError,
};

const STATE_NEW: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Grace period for reaping a process that already closed its stdout.
const EXIT_REAP_GRACE: Duration = Duration::from_millis(500);

/// Type-erased stream of data-plane messages for one or more turns.
pub type MessageStream =
    Pin<Box<dyn Stream<Item = Result<AgentMessage, AgentClientError>> + Send>>;

/// Type-erased stream of assistant text fragments.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, AgentClientError>> + Send>>;

/// Type-erased stream of every parsed inbound frame, control plane included.
pub type RawFrameStream = Pin<Box<dyn Stream<Item = InboundFrame> + Send>>;

pub(crate) type MessageHandler = Arc<dyn Fn(&AgentMessage) + Send + Sync>;
pub(crate) type ResultHandler = Arc<dyn Fn(&ResultMessage) + Send + Sync>;

/// Cross-turn handlers, invoked inline on the dispatch path.
#[derive(Default)]
pub(crate) struct Handlers {
    on_message: Mutex<Vec<MessageHandler>>,
    on_result: Mutex<Vec<ResultHandler>>,
}

impl Handlers {
    pub(crate) fn push_message(&self, handler: MessageHandler) {
        self.on_message
            .lock()
            .expect("handler list poisoned")
            .push(handler);
    }

    pub(crate) fn push_result(&self, handler: ResultHandler) {
        self.on_result
            .lock()
            .expect("handler list poisoned")
            .push(handler);
    }

    fn dispatch(&self, message: &AgentMessage) {
        for handler in self.on_message.lock().expect("handler list poisoned").iter() {
            handler(message);
        }
        if let AgentMessage::Result(result) = message {
            for handler in self.on_result.lock().expect("handler list poisoned").iter() {
                handler(result);
            }
        }
    }
}

/// State shared between the session façade, the IO tasks, and the spawned
/// control-request workers.
pub(crate) struct SessionShared {
    state: Arc<AtomicU8>,
    pub(crate) correlator: Correlator,
    pub(crate) router: TurnRouter,
    hooks: Arc<HookRegistry>,
    permission: PermissionSlot,
    tool_servers: BTreeMap<String, Arc<dyn ToolServerHandler>>,
    writer: mpsc::UnboundedSender<WriterCommand>,
    child: TokioMutex<Option<Child>>,
    session_id: Mutex<Option<String>>,
    current_model: Mutex<Option<String>>,
    current_permission_mode: Mutex<Option<String>>,
    process_meta: Mutex<Option<Value>>,
    pub(crate) pending_turn: Mutex<Option<TurnReceiver>>,
    handlers: Arc<Handlers>,
    close_grace: Duration,
}

impl SessionShared {
    pub(crate) fn send_line(&self, frame: &Value) -> Result<(), AgentClientError> {
        let line = serde_json::to_string(frame)?;
        self.writer
            .send(WriterCommand::Line(line))
            .map_err(|_| AgentClientError::Closed)
    }

    pub(crate) fn send_user_message(&self, prompt: &str) -> Result<(), AgentClientError> {
        let session_id = self
            .session_id
            .lock()
            .expect("session id poisoned")
            .clone();
        let frame = protocol::user_message(prompt, session_id.as_deref());
        self.send_line(&frame)
    }

    async fn shutdown(&self) {
        // Close stdin first so the process can drain and exit on its own;
        // only then force termination.
        let _ = self.writer.send(WriterCommand::Shutdown);
        {
            let mut guard = self.child.lock().await;
            if let Some(mut child) = guard.take() {
                process::reap(&mut child, self.close_grace).await;
            }
        }
        self.correlator
            .fail_all(&AgentClientError::ClosedWhilePending)
            .await;
        self.router.complete_active();
        self.router.drop_raw();
        self.pending_turn
            .lock()
            .expect("pending turn poisoned")
            .take();
    }
}

struct TaskSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    fn new() -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
        }
    }

    fn extend(&self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        self.handles
            .lock()
            .expect("task set poisoned")
            .extend(handles);
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        if let Ok(handles) = self.handles.get_mut() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
    }
}

/// A multi-turn conversation with one spawned agent process.
///
/// Lifecycle: `NEW → CONNECTING → CONNECTED → CLOSED`; `CLOSED` is terminal
/// and [`AgentSession::close`] is idempotent. Clones share the same
/// underlying session.
#[derive(Clone)]
pub struct AgentSession {
    options: AgentOptions,
    state: Arc<AtomicU8>,
    inner: Arc<Mutex<Option<Arc<SessionShared>>>>,
    handlers: Arc<Handlers>,
    tasks: Arc<TaskSet>,
}

impl AgentSession {
    pub fn new(options: AgentOptions) -> Self {
        Self {
            options,
            state: Arc::new(AtomicU8::new(STATE_NEW)),
            inner: Arc::new(Mutex::new(None)),
            handlers: Arc::new(Handlers::default()),
            tasks: Arc::new(TaskSet::new()),
        }
    }

    /// Spawns the agent process and starts the IO tasks. When the hook
    /// registry is non-empty, the registrations are advertised through an
    /// `initialize` control request before the session becomes usable.
    pub async fn connect(&self) -> Result<(), AgentClientError> {
        self.connect_inner(None).await
    }

    /// [`AgentSession::connect`], then immediately send `prompt` as the
    /// first turn.
    pub async fn connect_with_prompt(&self, prompt: &str) -> Result<(), AgentClientError> {
        self.connect_inner(Some(prompt)).await
    }

    async fn connect_inner(&self, initial_prompt: Option<&str>) -> Result<(), AgentClientError> {
        match self.state.compare_exchange(
            STATE_NEW,
            STATE_CONNECTING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_CLOSED) => return Err(AgentClientError::Closed),
            Err(_) => return Err(AgentClientError::AlreadyConnected),
        }

        let spawned = match process::spawn_agent(&self.options).await {
            Ok(spawned) => spawned,
            Err(err) => {
                self.state.store(STATE_CLOSED, Ordering::SeqCst);
                return Err(err);
            }
        };
        let SpawnedAgent {
            child,
            stdin,
            stdout,
            stderr,
            ..
        } = spawned;

        let (writer, writer_handle) = transport::spawn_writer(stdin);
        let stderr_handle = transport::spawn_stderr(stderr, self.options.mirror_stderr);

        let permission = PermissionSlot::default();
        permission.set(self.options.can_use_tool.clone());

        let shared = Arc::new(SessionShared {
            state: self.state.clone(),
            correlator: Correlator::new(
                next_session_prefix(),
                writer.clone(),
                self.options.operation_timeout,
            ),
            router: TurnRouter::new(),
            hooks: self.options.hooks.clone(),
            permission,
            tool_servers: self.options.sdk_servers(),
            writer,
            child: TokioMutex::new(Some(child)),
            session_id: Mutex::new(None),
            current_model: Mutex::new(self.options.model.clone()),
            current_permission_mode: Mutex::new(
                self.options
                    .permission_mode
                    .map(|mode| mode.as_arg_value().to_string()),
            ),
            process_meta: Mutex::new(None),
            pending_turn: Mutex::new(None),
            handlers: self.handlers.clone(),
            close_grace: self.options.close_grace,
        });
        *self.inner.lock().expect("session inner poisoned") = Some(shared.clone());

        let reader_handle = tokio::spawn(reader_task(stdout, shared.clone()));
        self.tasks
            .extend([writer_handle, stderr_handle, reader_handle]);

        if let Some(config) = shared.hooks.build_configuration() {
            let mut body = Map::new();
            body.insert("hooks".to_string(), config);
            if let Err(err) = shared.correlator.send_request("initialize", body).await {
                warn!(error = %err, "hook advertisement failed; closing session");
                let _ = self.close().await;
                return Err(err);
            }
        }

        let _ = self.state.compare_exchange(
            STATE_CONNECTING,
            STATE_CONNECTED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );

        if let Some(prompt) = initial_prompt {
            self.query(prompt).await?;
        }
        Ok(())
    }

    pub(crate) fn connected_shared(&self) -> Result<Arc<SessionShared>, AgentClientError> {
        match self.state.load(Ordering::SeqCst) {
            STATE_CONNECTED => {}
            STATE_CLOSED => return Err(AgentClientError::Closed),
            _ => return Err(AgentClientError::NotConnected),
        }
        self.inner
            .lock()
            .expect("session inner poisoned")
            .clone()
            .ok_or(AgentClientError::NotConnected)
    }

    /// Sends one prompt. A fresh turn subscriber is installed before the
    /// message goes out, so the turn drawn by the next
    /// [`AgentSession::receive_response`] cannot miss an early reply.
    pub async fn query(&self, prompt: &str) -> Result<(), AgentClientError> {
        let shared = self.connected_shared()?;
        let receiver = shared.router.subscribe();
        *shared
            .pending_turn
            .lock()
            .expect("pending turn poisoned") = Some(receiver);
        shared.send_user_message(prompt)
    }

    /// Messages for the current turn, ending after its `result`.
    pub fn receive_response(&self) -> MessageStream {
        let shared = match self.connected_shared() {
            Ok(shared) => shared,
            Err(err) => return Box::pin(stream::iter(vec![Err(err)])),
        };
        let receiver = shared
            .pending_turn
            .lock()
            .expect("pending turn poisoned")
            .take()
            .unwrap_or_else(|| shared.router.subscribe());
        Box::pin(UnboundedReceiverStream::new(receiver))
    }

    /// Every data-plane message across turns, ending when the session
    /// closes. Turn boundaries are visible as `result` messages.
    pub fn receive_messages(&self) -> MessageStream {
        let shared = match self.connected_shared() {
            Ok(shared) => shared,
            Err(err) => return Box::pin(stream::iter(vec![Err(err)])),
        };
        let state = self.state.clone();

        Box::pin(stream::unfold(
            (shared, state, None::<TurnReceiver>),
            |(shared, state, mut receiver)| async move {
                loop {
                    if receiver.is_none() {
                        if state.load(Ordering::SeqCst) == STATE_CLOSED {
                            return None;
                        }
                        let next = shared
                            .pending_turn
                            .lock()
                            .expect("pending turn poisoned")
                            .take()
                            .unwrap_or_else(|| shared.router.subscribe());
                        receiver = Some(next);
                    }
                    match receiver
                        .as_mut()
                        .expect("receiver installed above")
                        .recv()
                        .await
                    {
                        Some(item) => return Some((item, (shared, state, receiver))),
                        None => {
                            receiver = None;
                            if state.load(Ordering::SeqCst) == STATE_CLOSED {
                                return None;
                            }
                        }
                    }
                }
            },
        ))
    }

    /// Every parsed inbound frame, control plane included.
    pub fn raw_frames(&self) -> RawFrameStream {
        let shared = match self.connected_shared() {
            Ok(shared) => shared,
            Err(_) => return Box::pin(stream::empty()),
        };
        Box::pin(UnboundedReceiverStream::new(shared.router.subscribe_raw()))
    }

    /// Asks the agent to abort the in-flight turn.
    pub async fn interrupt(&self) -> Result<(), AgentClientError> {
        let shared = self.connected_shared()?;
        shared
            .correlator
            .send_request("interrupt", Map::new())
            .await
            .map(|_| ())
    }

    pub async fn set_permission_mode(
        &self,
        mode: PermissionMode,
    ) -> Result<(), AgentClientError> {
        let shared = self.connected_shared()?;
        let mut body = Map::new();
        body.insert(
            "mode".to_string(),
            Value::String(mode.as_arg_value().to_string()),
        );
        shared
            .correlator
            .send_request("set_permission_mode", body)
            .await?;
        *shared
            .current_permission_mode
            .lock()
            .expect("permission mode poisoned") = Some(mode.as_arg_value().to_string());
        Ok(())
    }

    pub async fn set_model(&self, model: &str) -> Result<(), AgentClientError> {
        let shared = self.connected_shared()?;
        let mut body = Map::new();
        body.insert("model".to_string(), Value::String(model.to_string()));
        shared.correlator.send_request("set_model", body).await?;
        *shared.current_model.lock().expect("model poisoned") = Some(model.to_string());
        Ok(())
    }

    /// Tears the session down: stdin closes, the process gets a grace
    /// period, stragglers are killed and reaped, every pending control
    /// request fails with closed-while-pending, and subscribers complete.
    pub async fn close(&self) -> Result<(), AgentClientError> {
        let prev = self.state.swap(STATE_CLOSED, Ordering::SeqCst);
        if prev == STATE_CLOSED {
            return Ok(());
        }
        let shared = self.inner.lock().expect("session inner poisoned").clone();
        if let Some(shared) = shared {
            shared.shutdown().await;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CONNECTED
    }

    /// The identifier assigned by the process, once its first message
    /// carrying one has been observed.
    pub fn session_id(&self) -> Option<String> {
        let shared = self.inner.lock().expect("session inner poisoned").clone()?;
        let id = shared.session_id.lock().expect("session id poisoned").clone();
        id
    }

    /// The model currently in effect (options value until the process
    /// reports otherwise or [`AgentSession::set_model`] succeeds).
    pub fn current_model(&self) -> Option<String> {
        let shared = self.inner.lock().expect("session inner poisoned").clone();
        match shared {
            Some(shared) => shared
                .current_model
                .lock()
                .expect("model poisoned")
                .clone(),
            None => self.options.model.clone(),
        }
    }

    pub fn current_permission_mode(&self) -> Option<String> {
        let shared = self.inner.lock().expect("session inner poisoned").clone();
        match shared {
            Some(shared) => shared
                .current_permission_mode
                .lock()
                .expect("permission mode poisoned")
                .clone(),
            None => self
                .options
                .permission_mode
                .map(|mode| mode.as_arg_value().to_string()),
        }
    }

    /// Metadata the process reported through its `initialize` request.
    pub fn process_metadata(&self) -> Option<Value> {
        let shared = self.inner.lock().expect("session inner poisoned").clone()?;
        let meta = shared
            .process_meta
            .lock()
            .expect("process meta poisoned")
            .clone();
        meta
    }

    /// The hook registry backing this session. Registrations made after
    /// connect are honored by dispatch immediately but are only advertised
    /// on the next connect.
    pub fn hooks(&self) -> Arc<HookRegistry> {
        self.options.hooks.clone()
    }

    pub(crate) fn register_on_message(&self, handler: MessageHandler) {
        self.handlers.push_message(handler);
    }

    pub(crate) fn register_on_result(&self, handler: ResultHandler) {
        self.handlers.push_result(handler);
    }
}

fn next_session_prefix() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    format!("c{}", NEXT.fetch_add(1, Ordering::SeqCst))
}

async fn reader_task(stdout: ChildStdout, shared: Arc<SessionShared>) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Some(value) = transport::parse_line(&line) else {
            continue;
        };
        match protocol::classify(value) {
            Ok(frame) => handle_frame(&shared, frame).await,
            Err(err) => warn!(message = %err.message, "dropping unclassifiable frame"),
        }
    }
    on_reader_eof(&shared).await;
}

async fn handle_frame(shared: &Arc<SessionShared>, frame: InboundFrame) {
    shared.router.fan_out_raw(&frame);
    match frame {
        InboundFrame::Message(message) => {
            if let Some(id) = message.session_id() {
                let mut guard = shared.session_id.lock().expect("session id poisoned");
                if guard.as_deref() != Some(id) {
                    *guard = Some(id.to_string());
                }
            }
            if let AgentMessage::System(system) = &message {
                if system.subtype == "init" {
                    if let Some(model) = &system.model {
                        *shared.current_model.lock().expect("model poisoned") =
                            Some(model.clone());
                    }
                    if let Some(mode) = &system.permission_mode {
                        *shared
                            .current_permission_mode
                            .lock()
                            .expect("permission mode poisoned") = Some(mode.clone());
                    }
                }
            }
            shared.handlers.dispatch(&message);
            shared.router.deliver(&message);
        }
        InboundFrame::ControlRequest(request) => {
            // Handlers may be slow or call back into the session; they never
            // run on the reader.
            let worker = shared.clone();
            tokio::spawn(async move {
                dispatch_control(worker, request).await;
            });
        }
        InboundFrame::ControlResponse(response) => {
            shared.correlator.resolve(response).await;
        }
    }
}

async fn dispatch_control(shared: Arc<SessionShared>, request: ControlRequest) {
    let request_id = request.request_id;
    let reply = match request.request {
        ControlRequestPayload::Initialize { metadata } => {
            *shared
                .process_meta
                .lock()
                .expect("process meta poisoned") = Some(Value::Object(metadata));
            let mut payload = Map::new();
            payload.insert("status".to_string(), Value::String("ok".to_string()));
            protocol::control_success(&request_id, payload)
        }
        ControlRequestPayload::HookCallback {
            callback_id, input, ..
        } => match shared.hooks.execute(&callback_id, input).await {
            Ok(output) => protocol::control_success(&request_id, output.to_wire()),
            Err(err) => protocol::control_error(&request_id, &err.to_string()),
        },
        ControlRequestPayload::CanUseTool {
            tool_name,
            input,
            permission_suggestions,
            ..
        } => {
            let context = PermissionContext {
                suggestions: permission_suggestions,
                request_id: request_id.clone(),
            };
            let decision = shared.permission.evaluate(tool_name, input, context).await;
            protocol::control_success(&request_id, decision.to_wire())
        }
        ControlRequestPayload::McpMessage {
            server_name,
            message,
        } => match shared.tool_servers.get(&server_name) {
            None => protocol::control_error(
                &request_id,
                &format!("unknown tool server `{server_name}`"),
            ),
            Some(handler) => match handler.handle_message(message).await {
                Ok(reply) => {
                    let mut payload = Map::new();
                    payload.insert("mcp_response".to_string(), reply);
                    protocol::control_success(&request_id, payload)
                }
                Err(err) => protocol::control_error(&request_id, &err.to_string()),
            },
        },
    };

    if shared.send_line(&reply).is_err() {
        debug!(request_id = %request_id, "control reply dropped; session closing");
    }
}

async fn on_reader_eof(shared: &Arc<SessionShared>) {
    let prev = shared.state.swap(STATE_CLOSED, Ordering::SeqCst);
    if prev == STATE_CLOSED {
        // Deliberate close; cleanup runs on the closing path.
        return;
    }

    let status = {
        let mut guard = shared.child.lock().await;
        match guard.take() {
            Some(mut child) => process::reap(&mut child, EXIT_REAP_GRACE).await,
            None => None,
        }
    };
    warn!(status = ?status, "agent process exited unexpectedly");

    shared
        .correlator
        .fail_all(&AgentClientError::ClosedWhilePending)
        .await;
    shared
        .router
        .fail_active(AgentClientError::ProcessTerminated { status });
    shared.router.drop_raw();
}
