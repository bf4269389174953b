//! Objects owned by a dedicated manager process and used from anywhere
//! through proxies.
//!
//! The manager listens on a Unix socket inside a private temporary
//! directory. Every proxy holds its own connection; requests from all
//! connections are funnelled into a single dispatch thread, so calls on
//! managed objects are linearized.

use std::collections::HashMap;
use std::fmt;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{debug, info, trace, warn};

use crate::config::ManagerConfig;
use crate::connection::{Connection, Listener};
use crate::errors::{HyperError, Result};
use crate::process::{spawn_child, Role};
use crate::protocol::{ManagerControl, ManagerReply, ManagerRequest};
use crate::reduction::{self, Registry, Value};

pub mod builtin;

const DROP_TIMEOUT: Duration = Duration::from_secs(1);
const DISPATCH_POLL: Duration = Duration::from_millis(100);

/// A type that can live inside the manager process.
///
/// `METHODS` is the wire table: a call names its method by index into it.
pub trait Managed: Send + 'static {
    const TYPE_NAME: &'static str;
    const METHODS: &'static [&'static str];

    fn create(args: Vec<Value>) -> anyhow::Result<Self>
    where
        Self: Sized;

    fn dispatch(&mut self, method: u16, args: Vec<Value>) -> anyhow::Result<Value>;
}

trait ManagedObject: Send {
    fn call(&mut self, method: u16, args: Vec<Value>) -> anyhow::Result<Value>;
}

impl<T: Managed> ManagedObject for T {
    fn call(&mut self, method: u16, args: Vec<Value>) -> anyhow::Result<Value> {
        if usize::from(method) >= T::METHODS.len() {
            anyhow::bail!("{} has no method #{}", T::TYPE_NAME, method);
        }
        self.dispatch(method, args)
    }
}

type Constructor = fn(Vec<Value>) -> anyhow::Result<Box<dyn ManagedObject>>;

fn construct<T: Managed>(args: Vec<Value>) -> anyhow::Result<Box<dyn ManagedObject>> {
    Ok(Box::new(T::create(args)?))
}

/// Registry record for one managed type.
pub struct ManagedEntry {
    type_name: &'static str,
    methods: &'static [&'static str],
    construct: Constructor,
}

impl ManagedEntry {
    pub(crate) fn of<T: Managed>() -> ManagedEntry {
        ManagedEntry {
            type_name: T::TYPE_NAME,
            methods: T::METHODS,
            construct: construct::<T>,
        }
    }
}

fn method_id(methods: &[&str], name: &str) -> Option<u16> {
    methods
        .iter()
        .position(|m| *m == name)
        .and_then(|i| u16::try_from(i).ok())
}

/// Serializable address of a managed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyRef {
    pub address: String,
    pub object_id: u64,
    pub type_name: String,
}

fn remote<T>(reply: Option<ManagerReply>, context: &str) -> Result<T>
where
    T: FromReply,
{
    match reply {
        Some(ManagerReply::Error(msg)) => Err(HyperError::Remote(msg)),
        Some(reply) => T::from_reply(reply)
            .ok_or_else(|| HyperError::Protocol(format!("unexpected reply to {}", context))),
        None => Err(HyperError::ConnectionClosed),
    }
}

trait FromReply: Sized {
    fn from_reply(reply: ManagerReply) -> Option<Self>;
}

impl FromReply for Value {
    fn from_reply(reply: ManagerReply) -> Option<Value> {
        match reply {
            ManagerReply::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl FromReply for u64 {
    fn from_reply(reply: ManagerReply) -> Option<u64> {
        match reply {
            ManagerReply::Created { object_id } => Some(object_id),
            _ => None,
        }
    }
}

impl FromReply for () {
    fn from_reply(reply: ManagerReply) -> Option<()> {
        match reply {
            ManagerReply::Ack => Some(()),
            _ => None,
        }
    }
}

fn request(conn: &mut Connection, req: &ManagerRequest) -> Result<Option<ManagerReply>> {
    let bytes = reduction::serialize(req).map_err(|e| HyperError::Unserializable(e.to_string()))?;
    conn.send(&bytes)?;
    conn.recv_message()
}

/// Handle on one object inside a manager. Dropping it gives up its
/// reference.
pub struct Proxy {
    conn: Mutex<Connection>,
    reference: ProxyRef,
    methods: &'static [&'static str],
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy").field("reference", &self.reference).finish()
    }
}

impl Proxy {
    /// Attach to an object from any process, taking a new reference on it.
    pub fn connect(reference: &ProxyRef, registry: &Registry) -> Result<Proxy> {
        let entry = registry
            .managed(&reference.type_name)
            .ok_or_else(|| HyperError::NotFound(reference.type_name.clone()))?;
        let mut conn = Connection::connect(&reference.address)?;
        let reply = request(
            &mut conn,
            &ManagerRequest::Incref {
                object_id: reference.object_id,
            },
        )?;
        match reply {
            Some(ManagerReply::Error(msg)) => Err(HyperError::NotFound(msg)),
            other => remote::<()>(other, "incref"),
        }?;
        Ok(Proxy {
            conn: Mutex::new(conn),
            reference: reference.clone(),
            methods: entry.methods,
        })
    }

    pub fn reference(&self) -> ProxyRef {
        self.reference.clone()
    }

    pub fn type_name(&self) -> &str {
        &self.reference.type_name
    }

    pub fn object_id(&self) -> u64 {
        self.reference.object_id
    }

    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let method_id = method_id(self.methods, method).ok_or_else(|| {
            HyperError::NotFound(format!("{}.{}", self.reference.type_name, method))
        })?;
        let req = ManagerRequest::Call {
            object_id: self.reference.object_id,
            method_id,
            args,
        };
        let reply = request(&mut self.conn.lock(), &req)?;
        remote(reply, method)
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        let conn = self.conn.get_mut();
        let req = ManagerRequest::Decref {
            object_id: self.reference.object_id,
        };
        if let Ok(bytes) = reduction::serialize(&req) {
            if conn.send(&bytes).is_ok() {
                let _ = conn.recv_timeout(Some(DROP_TIMEOUT));
            }
        }
        conn.close();
    }
}

/// Parent-side handle on a manager process.
pub struct Manager {
    child: Mutex<Option<Child>>,
    control: Mutex<Connection>,
    address: String,
    pid: u32,
    registry: Arc<Registry>,
    config: ManagerConfig,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("pid", &self.pid)
            .field("address", &self.address)
            .finish()
    }
}

impl Manager {
    pub fn start(config: ManagerConfig, registry: Arc<Registry>) -> Result<Manager> {
        let timeout = config.connection_timeout();
        let (mut child, mut control, pid) = spawn_child(Role::Manager, &config.launch, timeout)?;
        let address = match control.recv_message_timeout::<ManagerControl>(timeout) {
            Ok(Some(ManagerControl::Listening { address })) => address,
            other => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(HyperError::Spawn(format!(
                    "manager did not start listening: {:?}",
                    other
                )));
            }
        };
        info!(pid, %address, "manager started");
        Ok(Manager {
            child: Mutex::new(Some(child)),
            control: Mutex::new(control),
            address,
            pid,
            registry,
            config,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Create a new object of a registered managed type.
    pub fn create(&self, type_name: &str, args: Vec<Value>) -> Result<Proxy> {
        let entry = self
            .registry
            .managed(type_name)
            .ok_or_else(|| HyperError::NotFound(type_name.to_string()))?;
        self.registry.check_args(&args)?;
        let mut conn = Connection::connect(&self.address)?;
        let reply = request(
            &mut conn,
            &ManagerRequest::Create {
                type_name: type_name.to_string(),
                args,
            },
        )?;
        let object_id: u64 = remote(reply, "create")?;
        debug!(type_name, object_id, "managed object created");
        Ok(Proxy {
            conn: Mutex::new(conn),
            reference: ProxyRef {
                address: self.address.clone(),
                object_id,
                type_name: entry.type_name.to_string(),
            },
            methods: entry.methods,
        })
    }

    /// Stop the manager process. Proxies fail afterwards.
    pub fn shutdown(&self) -> Result<()> {
        let mut child = match self.child.lock().take() {
            Some(child) => child,
            None => return Ok(()),
        };
        let mut control = self.control.lock();
        let _ = control.send_message(&ManagerControl::Shutdown);
        let grace = self
            .config
            .connection_timeout()
            .unwrap_or(Duration::from_secs(10));
        let deadline = Instant::now() + grace;
        loop {
            match child.try_wait()? {
                Some(status) => {
                    info!(pid = self.pid, %status, "manager stopped");
                    break;
                }
                None if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                None => {
                    warn!(pid = self.pid, "manager ignored shutdown, killing it");
                    child.kill()?;
                    child.wait()?;
                    break;
                }
            }
        }
        control.close();
        Ok(())
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "manager shutdown failed");
        }
    }
}

enum Event {
    Request {
        request: ManagerRequest,
        reply: Sender<ManagerReply>,
    },
    Stop,
}

struct Slot {
    object: Box<dyn ManagedObject>,
    type_name: &'static str,
    refs: u32,
}

struct Objects<'r> {
    registry: &'r Registry,
    slots: HashMap<u64, Slot>,
    next_id: u64,
}

impl Objects<'_> {
    fn handle(&mut self, request: ManagerRequest) -> ManagerReply {
        match request {
            ManagerRequest::Create { type_name, args } => {
                let entry = match self.registry.managed(&type_name) {
                    Some(entry) => entry,
                    None => return ManagerReply::Error(format!("unknown type '{}'", type_name)),
                };
                match (entry.construct)(args) {
                    Ok(object) => {
                        self.next_id += 1;
                        let object_id = self.next_id;
                        self.slots.insert(
                            object_id,
                            Slot {
                                object,
                                type_name: entry.type_name,
                                refs: 1,
                            },
                        );
                        ManagerReply::Created { object_id }
                    }
                    Err(e) => ManagerReply::Error(format!("{:#}", e)),
                }
            }
            ManagerRequest::Call {
                object_id,
                method_id,
                args,
            } => {
                let slot = match self.slots.get_mut(&object_id) {
                    Some(slot) => slot,
                    None => return ManagerReply::Error(format!("no object {}", object_id)),
                };
                trace!(object_id, method_id, type_name = slot.type_name, "call");
                match slot.object.call(method_id, args) {
                    Ok(value) => match self.registry.check_transferable(&value) {
                        Ok(()) => ManagerReply::Value(value),
                        Err(e) => ManagerReply::Error(e.to_string()),
                    },
                    Err(e) => ManagerReply::Error(format!("{:#}", e)),
                }
            }
            ManagerRequest::Incref { object_id } => match self.slots.get_mut(&object_id) {
                Some(slot) => {
                    slot.refs += 1;
                    ManagerReply::Ack
                }
                None => ManagerReply::Error(format!("no object {}", object_id)),
            },
            ManagerRequest::Decref { object_id } => {
                let gone = match self.slots.get_mut(&object_id) {
                    Some(slot) => {
                        slot.refs -= 1;
                        slot.refs == 0
                    }
                    None => return ManagerReply::Error(format!("no object {}", object_id)),
                };
                if gone {
                    self.slots.remove(&object_id);
                    debug!(object_id, "managed object dropped");
                }
                ManagerReply::Ack
            }
        }
    }
}

/// Body of the manager process.
pub(crate) fn serve(registry: &Registry, mut control: Connection) -> Result<()> {
    let dir = tempfile::Builder::new().prefix("hyperpool-mgr").tempdir()?;
    let path = dir.path().join("manager.sock");
    let listener = Listener::bind(&path)?;
    let address = path.to_string_lossy().into_owned();

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, stop.clone())?;
    }

    let (events, inbox) = unbounded::<Event>();
    let watcher = control.try_clone()?;
    spawn_control_watcher(watcher, events.clone())?;
    spawn_acceptor(listener, events)?;
    control.send_message(&ManagerControl::Listening {
        address: address.clone(),
    })?;
    info!(%address, "manager listening");

    let mut objects = Objects {
        registry,
        slots: HashMap::new(),
        next_id: 0,
    };
    while !stop.load(Ordering::Relaxed) {
        match inbox.recv_timeout(DISPATCH_POLL) {
            Ok(Event::Request { request, reply }) => {
                let _ = reply.send(objects.handle(request));
            }
            Ok(Event::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
    info!(objects = objects.slots.len(), "manager exiting");
    drop(dir);
    Ok(())
}

fn spawn_control_watcher(mut control: Connection, events: Sender<Event>) -> Result<()> {
    thread::Builder::new()
        .name("hyperpool-mgr-control".into())
        .spawn(move || {
            loop {
                match control.recv_message::<ManagerControl>() {
                    Ok(Some(ManagerControl::Shutdown)) | Ok(None) => break,
                    Ok(Some(other)) => warn!(?other, "ignoring control message"),
                    Err(e) => {
                        warn!(error = %e, "control channel failed");
                        break;
                    }
                }
            }
            let _ = events.send(Event::Stop);
        })?;
    Ok(())
}

fn spawn_acceptor(listener: Listener, events: Sender<Event>) -> Result<()> {
    thread::Builder::new()
        .name("hyperpool-mgr-accept".into())
        .spawn(move || loop {
            match listener.accept() {
                Ok(conn) => {
                    let events = events.clone();
                    let spawned = thread::Builder::new()
                        .name("hyperpool-mgr-conn".into())
                        .spawn(move || serve_connection(conn, events));
                    if let Err(e) = spawned {
                        warn!(error = %e, "could not start connection thread");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        })?;
    Ok(())
}

fn serve_connection(mut conn: Connection, events: Sender<Event>) {
    let (reply_tx, reply_rx) = bounded(1);
    loop {
        let request = match conn.recv_message::<ManagerRequest>() {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "client connection dropped");
                return;
            }
        };
        let event = Event::Request {
            request,
            reply: reply_tx.clone(),
        };
        if events.send(event).is_err() {
            return;
        }
        let reply = match reply_rx.recv() {
            Ok(reply) => reply,
            Err(_) => return,
        };
        if conn.send_message(&reply).is_err() {
            return;
        }
    }
}
