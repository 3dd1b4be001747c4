//! Scripted in-memory adapter for exercising sessions without a real debugger.

use crate::cancellation::CancellationScope;
use crate::config::DebugConfiguration;
use crate::events::AdapterEvent;
use crate::transport::{AdapterFactory, AdapterTransport};
use crate::{DebugError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};

type Handler = Box<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

pub struct FakeTransport {
    handlers: Mutex<HashMap<String, Handler>>,
    gates: Mutex<HashMap<String, watch::Sender<bool>>>,
    requests: Mutex<Vec<(String, Value)>>,
    cancelled: Mutex<Vec<String>>,
    request_seen: Notify,
    events_tx: mpsc::UnboundedSender<AdapterEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<AdapterEvent>>>,
    supports_cancel: AtomicBool,
    started: AtomicBool,
    disposed: AtomicBool,
    fail_start: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            handlers: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            request_seen: Notify::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            supports_cancel: AtomicBool::new(false),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
        })
    }

    pub fn on(&self, command: &str, handler: impl Fn(&Value) -> Result<Value> + Send + Sync + 'static) {
        self.handlers
            .lock()
            .insert(command.to_string(), Box::new(handler));
    }

    pub fn respond(&self, command: &str, body: Value) {
        self.on(command, move |_| Ok(body.clone()));
    }

    pub fn fail(&self, command: &str, message: &str) {
        let command_name = command.to_string();
        let message = message.to_string();
        self.on(command, move |_| Err(DebugError::adapter(command_name.clone(), message.clone())));
    }

    pub fn fail_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    /// Requests for `command` wait until [`release`](Self::release) is called.
    pub fn hold(&self, command: &str) {
        let (tx, _) = watch::channel(false);
        self.gates.lock().insert(command.to_string(), tx);
    }

    pub fn release(&self, command: &str) {
        if let Some(gate) = self.gates.lock().remove(command) {
            let _ = gate.send(true);
        }
    }

    pub fn emit(&self, event: AdapterEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().clone()
    }

    pub fn requests_for(&self, command: &str) -> Vec<Value> {
        self.requests
            .lock()
            .iter()
            .filter(|(c, _)| c == command)
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub fn count(&self, command: &str) -> usize {
        self.requests.lock().iter().filter(|(c, _)| c == command).count()
    }

    pub fn commands(&self) -> Vec<String> {
        self.requests.lock().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn cancelled_requests(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn supports_cancel(&self) -> bool {
        self.supports_cancel.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` requests for `command` have been sent.
    pub async fn wait_for_request(&self, command: &str, count: usize) {
        loop {
            let notified = self.request_seen.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count(command) >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl AdapterTransport for FakeTransport {
    async fn start(&self) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(DebugError::Transport("fake adapter refused to start".to_string()));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn request(
        &self,
        command: &str,
        arguments: Value,
        scope: Option<CancellationScope>,
    ) -> Result<Value> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(DebugError::Transport(format!("fake adapter disposed, can not send '{command}'")));
        }
        self.requests
            .lock()
            .push((command.to_string(), arguments.clone()));
        self.request_seen.notify_waiters();

        let gate = self.gates.lock().get(command).map(watch::Sender::subscribe);
        if let Some(mut gate) = gate {
            let opened = async move {
                let _ = gate.wait_for(|open| *open).await;
            };
            match &scope {
                Some(scope) => {
                    tokio::select! {
                        biased;
                        _ = scope.cancelled() => {
                            self.cancelled.lock().push(command.to_string());
                            return Err(DebugError::Cancelled);
                        }
                        _ = opened => {}
                    }
                }
                None => opened.await,
            }
        }
        if let Some(scope) = &scope {
            if scope.is_cancelled() {
                self.cancelled.lock().push(command.to_string());
                return Err(DebugError::Cancelled);
            }
        }

        match self.handlers.lock().get(command) {
            Some(handler) => handler(&arguments),
            None => Ok(Value::Null),
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AdapterEvent>> {
        self.events_rx.lock().take()
    }

    fn set_supports_cancel(&self, supported: bool) {
        self.supports_cancel.store(supported, Ordering::SeqCst);
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

/// Hands out prepared transports in order, one per `initialize`.
pub struct FakeAdapterFactory {
    transports: Mutex<VecDeque<Arc<FakeTransport>>>,
}

impl FakeAdapterFactory {
    pub fn new(transports: Vec<Arc<FakeTransport>>) -> Self {
        Self {
            transports: Mutex::new(transports.into()),
        }
    }

    pub fn single(transport: Arc<FakeTransport>) -> Self {
        Self::new(vec![transport])
    }
}

impl AdapterFactory for FakeAdapterFactory {
    fn create(
        &self,
        _session_id: &str,
        _configuration: &DebugConfiguration,
    ) -> Result<Arc<dyn AdapterTransport>> {
        let transport: Arc<dyn AdapterTransport> = self
            .transports
            .lock()
            .pop_front()
            .ok_or_else(|| DebugError::Transport("no fake adapter left".to_string()))?;
        Ok(transport)
    }
}
