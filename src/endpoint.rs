/*
 * Copyright (C) 2025 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::net::{self, HostSpec, Stream};
use crate::protocol::{self, pack, Packet, PacketType, Parser};
use crate::task::{Job, Task, TaskId};
use log::{debug, error, warn};
use mio::net::TcpStream;
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::str;
use std::time::{Duration, Instant};

pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

// how long a failed endpoint reports not-alive to its pool
pub const DEAD_INTERVAL: Duration = Duration::from_secs(10);

const READ_BUF_SIZE: usize = 8192;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Ready,
}

pub type ReadyFn = Box<dyn FnOnce()>;

pub type WorkerFn = Rc<dyn Fn(Job)>;

// notified when a connect attempt exceeds its deadline
pub trait ConnectObserver {
    fn connect_timed_out(&self);
}

pub struct Config {
    pub connect_timeout: Duration,
    pub dead_interval: Duration,
    pub options: Vec<String>,
    pub observer: Option<Rc<dyn ConnectObserver>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            dead_interval: DEAD_INTERVAL,
            options: Vec::new(),
            observer: None,
        }
    }
}

#[derive(Debug)]
pub enum Error {
    NotReady,
    Io(io::Error),
    Protocol(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => write!(f, "endpoint not ready"),
            Self::Io(e) => write!(f, "io: {}", e),
            Self::Protocol(s) => write!(f, "protocol: {}", s),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

fn text_arg<'a>(data: &'a [u8], what: &str) -> Result<&'a str, Error> {
    str::from_utf8(data).map_err(|_| Error::Protocol(format!("malformed {}", what)))
}

fn int_arg(data: &[u8], what: &str) -> Result<u64, Error> {
    text_arg(data, what)?
        .parse()
        .map_err(|_| Error::Protocol(format!("malformed {}", what)))
}

struct EndpointData {
    spec: HostSpec,
    connect_timeout: Duration,
    dead_interval: Duration,
    observer: Option<Rc<dyn ConnectObserver>>,

    state: Cell<State>,
    dead_until: Cell<Option<Instant>>,
    offline: Cell<bool>,
    connect_deadline: Cell<Option<Instant>>,
    stream: RefCell<Option<Stream>>,
    parser: RefCell<Parser>,
    outbuf: RefCell<VecDeque<u8>>,

    on_ready: RefCell<Vec<ReadyFn>>,
    on_error: RefCell<Vec<ReadyFn>>,

    options: RefCell<BTreeMap<String, bool>>,
    requests: RefCell<VecDeque<String>>,

    submissions: RefCell<Slab<Weak<dyn Task>>>,
    need_handle: RefCell<VecDeque<usize>>,
    waiting: RefCell<HashMap<String, VecDeque<Rc<dyn Task>>>>,
    task2handle: RefCell<HashMap<TaskId, String>>,

    worker_funcs: RefCell<BTreeMap<String, WorkerFn>>,
    is_worker: Cell<bool>,
}

// one logical client<->server link. owns the socket and correlates the
// framed response stream back to submitted tasks and worker handlers.
// cheaply clonable; all clones share the same connection state.
//
// the endpoint is driven from the outside: an i/o reactor delivers
// readiness via on_read_ready/on_write_ready and fires on_timer at
// next_timeout. every entry point runs to completion without blocking
#[derive(Clone)]
pub struct Endpoint {
    d: Rc<EndpointData>,
}

pub struct WeakEndpoint {
    d: Weak<EndpointData>,
}

impl WeakEndpoint {
    pub fn upgrade(&self) -> Option<Endpoint> {
        self.d.upgrade().map(|d| Endpoint { d })
    }
}

impl Endpoint {
    pub fn new(spec: HostSpec, config: Config) -> Self {
        let mut options = BTreeMap::new();

        for name in config.options {
            options.insert(name, true);
        }

        Self {
            d: Rc::new(EndpointData {
                spec,
                connect_timeout: config.connect_timeout,
                dead_interval: config.dead_interval,
                observer: config.observer,
                state: Cell::new(State::Disconnected),
                dead_until: Cell::new(None),
                offline: Cell::new(false),
                connect_deadline: Cell::new(None),
                stream: RefCell::new(None),
                parser: RefCell::new(Parser::new()),
                outbuf: RefCell::new(VecDeque::new()),
                on_ready: RefCell::new(Vec::new()),
                on_error: RefCell::new(Vec::new()),
                options: RefCell::new(options),
                requests: RefCell::new(VecDeque::new()),
                submissions: RefCell::new(Slab::new()),
                need_handle: RefCell::new(VecDeque::new()),
                waiting: RefCell::new(HashMap::new()),
                task2handle: RefCell::new(HashMap::new()),
                worker_funcs: RefCell::new(BTreeMap::new()),
                is_worker: Cell::new(false),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakEndpoint {
        WeakEndpoint {
            d: Rc::downgrade(&self.d),
        }
    }

    pub fn hostspec(&self) -> &HostSpec {
        &self.d.spec
    }

    pub fn state(&self) -> State {
        self.d.state.get()
    }

    pub fn alive(&self) -> bool {
        match self.d.dead_until.get() {
            Some(t) => Instant::now() >= t,
            None => true,
        }
    }

    pub fn is_worker(&self) -> bool {
        self.d.is_worker.get()
    }

    pub fn stuff_outstanding(&self) -> bool {
        !self.d.need_handle.borrow().is_empty() || !self.d.waiting.borrow().is_empty()
    }

    // test hook: suppress the actual connect while still arming the
    // connect deadline
    pub fn set_offline(&self, offline: bool) {
        self.d.offline.set(offline);
    }

    // deadline the reactor must call on_timer at, if any
    pub fn next_timeout(&self) -> Option<Instant> {
        self.d.connect_deadline.get()
    }

    // access to the underlying stream, for reactor registration
    pub fn with_stream<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut Stream) -> R,
    {
        match &mut *self.d.stream.borrow_mut() {
            Some(stream) => Some(f(stream)),
            None => None,
        }
    }

    pub fn connect(&self) {
        if self.d.state.get() != State::Disconnected {
            return;
        }

        debug!("{}: connecting", self.d.spec);

        self.d.state.set(State::Connecting);
        self.d
            .connect_deadline
            .set(Some(Instant::now() + self.d.connect_timeout));

        if self.d.offline.get() {
            return;
        }

        match self.start_connect() {
            Ok(stream) => {
                *self.d.stream.borrow_mut() = Some(stream);
            }
            Err(e) => {
                error!("{}: connect failed: {}", self.d.spec, e);
                self.connect_error();
            }
        }
    }

    fn start_connect(&self) -> Result<Stream, io::Error> {
        match &self.d.spec {
            HostSpec::Addr(host, port) => {
                let addrs = net::resolve(host)?;

                let addr = match addrs.first() {
                    Some(addr) => *addr,
                    None => return Err(io::Error::from(io::ErrorKind::NotFound)),
                };

                let mut stream = TcpStream::connect(SocketAddr::new(addr, *port))?;
                net::set_socket_opts(&mut stream);

                Ok(Stream::Tcp(stream))
            }
            HostSpec::Pipe(stream) => match stream.borrow_mut().take() {
                Some(stream) => Ok(Stream::Pipe(stream)),
                None => Err(io::Error::from(io::ErrorKind::NotConnected)),
            },
            HostSpec::Factory(f) => Ok(Stream::Pipe(f())),
        }
    }

    // tear down the connection and fail all in-flight work. reasons
    // other than an explicit user close arrive via the error paths,
    // which mark the endpoint dead before calling here
    pub fn close(&self, reason: &str) {
        if self.d.state.get() == State::Disconnected {
            return;
        }

        debug!("{}: closing: {}", self.d.spec, reason);

        self.d.state.set(State::Disconnected);
        self.d.connect_deadline.set(None);

        // snapshot before notifying. continuations may start a new
        // connect attempt, which must not see stale entries
        let on_error = mem::take(&mut *self.d.on_error.borrow_mut());
        self.d.on_ready.borrow_mut().clear();

        self.teardown();
        self.requeue_all();

        for cb in on_error {
            cb();
        }
    }

    pub fn get_in_ready_state(&self, on_ready: ReadyFn, on_error: ReadyFn) {
        if self.d.state.get() == State::Ready {
            on_ready();
            return;
        }

        self.d.on_ready.borrow_mut().push(on_ready);
        self.d.on_error.borrow_mut().push(on_error);

        if self.d.state.get() == State::Disconnected {
            self.connect();
        }
    }

    // precondition: ready. the submit packet is written as-is and the
    // task is retained weakly until the server assigns a handle. write
    // failures surface through task.fail(), not through this call
    pub fn add_task(&self, task: &Rc<dyn Task>) -> Result<(), Error> {
        if self.d.state.get() != State::Ready {
            return Err(Error::NotReady);
        }

        let key = self.d.submissions.borrow_mut().insert(Rc::downgrade(task));
        self.d.need_handle.borrow_mut().push_back(key);

        self.write_bytes(&task.submit_packet_bytes());

        Ok(())
    }

    // best effort: stop tracking the task. the server is not told, and
    // any later reply toward its handle is discarded
    pub fn give_up_on(&self, task: &Rc<dyn Task>) {
        let id = TaskId::of(task);

        let handle = match self.d.task2handle.borrow_mut().remove(&id) {
            Some(handle) => handle,
            None => return,
        };

        debug!("{}: giving up on [{}]", self.d.spec, handle);

        let waiting = &mut *self.d.waiting.borrow_mut();

        if let Some(tasks) = waiting.get_mut(&handle) {
            tasks.retain(|t| TaskId::of(t) != id);

            if tasks.is_empty() {
                waiting.remove(&handle);
            }
        }
    }

    pub fn register_function<F>(&self, name: &str, handler: F)
    where
        F: Fn(Job) + 'static,
    {
        debug!("{}: registering function [{}]", self.d.spec, name);

        self.d
            .worker_funcs
            .borrow_mut()
            .insert(name.to_string(), Rc::new(handler));

        let first = !self.d.is_worker.replace(true);

        if self.d.state.get() == State::Ready {
            self.write_packet(PacketType::CanDo, &[name.as_bytes()]);

            if first {
                self.write_packet(PacketType::GrabJob, &[]);
            }
        }
    }

    pub fn on_write_ready(&self) {
        match self.d.state.get() {
            State::Connecting => match self.with_stream(|s| s.take_error()) {
                Some(Ok(None)) => self.become_ready(),
                Some(Ok(Some(e))) => {
                    error!("{}: connect failed: {}", self.d.spec, e);
                    self.connect_error();
                }
                Some(Err(e)) => {
                    error!("{}: connect failed: {}", self.d.spec, e);
                    self.connect_error();
                }
                None => {}
            },
            State::Ready => self.flush_outbuf(),
            State::Disconnected => {}
        }
    }

    pub fn on_read_ready(&self) -> Result<(), Error> {
        let mut buf = [0; READ_BUF_SIZE];

        loop {
            if self.d.state.get() == State::Disconnected {
                return Ok(());
            }

            let ret = match self.with_stream(|s| s.read(&mut buf)) {
                Some(ret) => ret,
                None => return Ok(()),
            };

            match ret {
                Ok(0) => {
                    debug!("{}: eof", self.d.spec);

                    if self.d.state.get() == State::Connecting {
                        self.connect_error();
                    } else {
                        self.session_error("eof");
                    }

                    return Ok(());
                }
                Ok(size) => self.process_incoming(&buf[..size])?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    error!("{}: read failed: {}", self.d.spec, e);

                    if self.d.state.get() == State::Connecting {
                        self.connect_error();
                    } else {
                        self.session_error("read error");
                    }

                    return Ok(());
                }
            }
        }
    }

    pub fn on_timer(&self, now: Instant) {
        if self.d.state.get() != State::Connecting {
            return;
        }

        if let Some(deadline) = self.d.connect_deadline.get() {
            if now >= deadline {
                warn!("{}: connect timed out", self.d.spec);

                if let Some(observer) = &self.d.observer {
                    observer.connect_timed_out();
                }

                self.connect_error();
            }
        }
    }

    fn become_ready(&self) {
        debug!("{}: connected", self.d.spec);

        self.d.connect_deadline.set(None);
        self.d.state.set(State::Ready);

        let on_ready = mem::take(&mut *self.d.on_ready.borrow_mut());
        self.d.on_error.borrow_mut().clear();

        for cb in on_ready {
            cb();
        }

        self.send_option_requests();
        self.announce_worker_funcs();
    }

    fn send_option_requests(&self) {
        if self.d.state.get() != State::Ready {
            return;
        }

        let names: Vec<String> = self
            .d
            .options
            .borrow()
            .iter()
            .filter(|&(_, &enabled)| enabled)
            .map(|(name, _)| name.clone())
            .collect();

        for name in names {
            debug!("{}: requesting option [{}]", self.d.spec, name);

            self.write_packet(PacketType::OptionReq, &[name.as_bytes()]);
            self.d.requests.borrow_mut().push_back(name);
        }
    }

    fn announce_worker_funcs(&self) {
        if self.d.state.get() != State::Ready || !self.d.is_worker.get() {
            return;
        }

        let names: Vec<String> = self.d.worker_funcs.borrow().keys().cloned().collect();

        for name in &names {
            self.write_packet(PacketType::CanDo, &[name.as_bytes()]);
        }

        self.write_packet(PacketType::GrabJob, &[]);
    }

    fn mark_dead(&self) {
        self.d
            .dead_until
            .set(Some(Instant::now() + self.d.dead_interval));
    }

    fn teardown(&self) {
        *self.d.stream.borrow_mut() = None;
        self.d.outbuf.borrow_mut().clear();
        self.d.requests.borrow_mut().clear();
        self.d.parser.borrow_mut().reset();
    }

    // a connect attempt failed: deferred socket error, deadline expiry,
    // or refusal. the endpoint goes dead for a while so the pool can
    // prefer others
    fn connect_error(&self) {
        self.mark_dead();

        self.d.state.set(State::Disconnected);
        self.d.connect_deadline.set(None);

        let on_error = mem::take(&mut *self.d.on_error.borrow_mut());
        self.d.on_ready.borrow_mut().clear();

        self.teardown();

        for cb in on_error {
            cb();
        }
    }

    // the established session died under us
    fn session_error(&self, reason: &str) {
        if self.stuff_outstanding() {
            self.mark_dead();
        }

        self.close(reason);
    }

    // the server sent something we cannot safely continue from
    fn fatal(&self, reason: &str) {
        self.mark_dead();
        self.close(reason);
    }

    // fail everything in flight. snapshot-and-clear first: a task's
    // fail handler may call straight back into this endpoint
    fn requeue_all(&self) {
        let need_handle: Vec<usize> = self.d.need_handle.borrow_mut().drain(..).collect();
        let submissions = mem::take(&mut *self.d.submissions.borrow_mut());
        let waiting = mem::take(&mut *self.d.waiting.borrow_mut());
        self.d.task2handle.borrow_mut().clear();

        for key in need_handle {
            if let Some(task) = submissions.get(key).and_then(|weak| weak.upgrade()) {
                task.fail();
            }
        }

        for (_, tasks) in waiting {
            for task in tasks {
                task.fail();
            }
        }
    }

    fn process_incoming(&self, src: &[u8]) -> Result<(), Error> {
        let mut packets = Vec::new();

        let ret = self
            .d
            .parser
            .borrow_mut()
            .feed(src, &mut |packet| packets.push(packet));

        if let Err(e) = ret {
            error!("{}: {}", self.d.spec, e);
            self.fatal("framing error");

            return Err(Error::Protocol(e.to_string()));
        }

        for packet in packets {
            // a notification above may have closed us
            if self.d.state.get() == State::Disconnected {
                break;
            }

            if let Err(e) = self.route_packet(packet) {
                error!("{}: {}", self.d.spec, e);
                self.fatal("protocol error");

                return Err(e);
            }
        }

        Ok(())
    }

    fn route_packet(&self, packet: Packet) -> Result<(), Error> {
        let ptype = packet.ptype;
        let payload = packet.payload;

        debug!("{}: received {}", self.d.spec, ptype);

        match ptype {
            PacketType::JobCreated => self.handle_job_created(&payload),
            PacketType::WorkFail => self.handle_work_fail(&payload),
            PacketType::WorkComplete => self.handle_work_complete(&payload),
            PacketType::WorkStatus => self.handle_work_status(&payload),
            PacketType::WorkException => self.handle_work_exception(&payload),
            PacketType::Error => self.handle_error_packet(&payload),
            PacketType::OptionRes => {
                self.d.requests.borrow_mut().pop_front();

                Ok(())
            }
            PacketType::NoJob if self.d.is_worker.get() => {
                self.write_packet(PacketType::PreSleep, &[]);

                Ok(())
            }
            PacketType::JobAssign if self.d.is_worker.get() => self.handle_job_assign(&payload),
            PacketType::Noop if self.d.is_worker.get() => {
                self.write_packet(PacketType::GrabJob, &[]);

                Ok(())
            }
            ptype => Err(Error::Protocol(format!("unexpected packet {}", ptype))),
        }
    }

    fn handle_job_created(&self, payload: &[u8]) -> Result<(), Error> {
        let handle = text_arg(payload, "job_created")?;

        let key = match self.d.need_handle.borrow_mut().pop_front() {
            Some(key) => key,
            None => {
                return Err(Error::Protocol(
                    "job_created with no submission pending".into(),
                ))
            }
        };

        let task = self
            .d
            .submissions
            .borrow_mut()
            .try_remove(key)
            .and_then(|weak| weak.upgrade());

        let task = match task {
            Some(task) => task,
            None => {
                // the submitter dropped the task. the handle is leaked
                // server side
                debug!("{}: discarding handle [{}] for dropped task", self.d.spec, handle);

                return Ok(());
            }
        };

        debug!("{}: job created [{}]", self.d.spec, handle);

        self.d
            .task2handle
            .borrow_mut()
            .insert(TaskId::of(&task), handle.to_string());

        self.d
            .waiting
            .borrow_mut()
            .entry(handle.to_string())
            .or_default()
            .push_back(task);

        Ok(())
    }

    // pop the head task under a handle, dropping the handle entry when
    // it empties. the task2handle entry goes away with the task's last
    // appearance
    fn take_head(&self, handle: &str) -> Option<Rc<dyn Task>> {
        let (task, still_present) = {
            let waiting = &mut *self.d.waiting.borrow_mut();

            let tasks = waiting.get_mut(handle)?;
            let task = tasks.pop_front()?;

            let id = TaskId::of(&task);
            let still_present = tasks.iter().any(|t| TaskId::of(t) == id);

            if tasks.is_empty() {
                waiting.remove(handle);
            }

            (task, still_present)
        };

        if !still_present {
            self.d.task2handle.borrow_mut().remove(&TaskId::of(&task));
        }

        Some(task)
    }

    fn handle_work_complete(&self, payload: &[u8]) -> Result<(), Error> {
        let (handle, result) = match protocol::split_arg(payload) {
            Some(parts) => parts,
            None => return Err(Error::Protocol("malformed work_complete".into())),
        };

        let handle = text_arg(handle, "work_complete")?;

        match self.take_head(handle) {
            Some(task) => task.complete(result),
            None => debug!("{}: work_complete for unknown handle [{}]", self.d.spec, handle),
        }

        Ok(())
    }

    fn handle_work_fail(&self, payload: &[u8]) -> Result<(), Error> {
        let handle = text_arg(payload, "work_fail")?;

        match self.take_head(handle) {
            Some(task) => task.fail(),
            None => debug!("{}: work_fail for unknown handle [{}]", self.d.spec, handle),
        }

        Ok(())
    }

    // status is broadcast to every task under the handle
    fn handle_work_status(&self, payload: &[u8]) -> Result<(), Error> {
        let (handle, numerator, denominator) = match protocol::split_arg2(payload) {
            Some(parts) => parts,
            None => return Err(Error::Protocol("malformed work_status".into())),
        };

        let handle = text_arg(handle, "work_status")?;
        let numerator = int_arg(numerator, "work_status")?;
        let denominator = int_arg(denominator, "work_status")?;

        let tasks: Vec<Rc<dyn Task>> = match self.d.waiting.borrow().get(handle) {
            Some(tasks) => tasks.iter().cloned().collect(),
            None => {
                debug!("{}: work_status for unknown handle [{}]", self.d.spec, handle);

                return Ok(());
            }
        };

        for task in tasks {
            task.status(numerator, denominator);
        }

        Ok(())
    }

    // the exception goes to the head task only, and does not consume
    // it. a terminal work_complete or work_fail follows
    fn handle_work_exception(&self, payload: &[u8]) -> Result<(), Error> {
        let (handle, data) = match protocol::split_arg(payload) {
            Some(parts) => parts,
            None => return Err(Error::Protocol("malformed work_exception".into())),
        };

        let handle = text_arg(handle, "work_exception")?;

        let task = self
            .d
            .waiting
            .borrow()
            .get(handle)
            .and_then(|tasks| tasks.front().cloned());

        match task {
            Some(task) => task.exception(data),
            None => debug!("{}: work_exception for unknown handle [{}]", self.d.spec, handle),
        }

        Ok(())
    }

    // an error packet acks (refuses) the oldest pending option request,
    // if any. a server error outside option negotiation is fatal
    fn handle_error_packet(&self, payload: &[u8]) -> Result<(), Error> {
        let name = self.d.requests.borrow_mut().pop_front();

        match name {
            Some(name) => {
                warn!("{}: server refused option [{}]", self.d.spec, name);

                self.d.options.borrow_mut().remove(&name);

                Ok(())
            }
            None => Err(Error::Protocol(format!(
                "server error: {}",
                String::from_utf8_lossy(payload).replace('\0', " ")
            ))),
        }
    }

    fn handle_job_assign(&self, payload: &[u8]) -> Result<(), Error> {
        let (handle, function, job_payload) = match protocol::split_arg2(payload) {
            Some(parts) => parts,
            None => return Err(Error::Protocol("malformed job_assign".into())),
        };

        let handle = text_arg(handle, "job_assign")?;
        let function = text_arg(function, "job_assign")?;

        let handler = self.d.worker_funcs.borrow().get(function).cloned();

        match handler {
            Some(handler) => {
                debug!("{}: job [{}] assigned for [{}]", self.d.spec, handle, function);

                let job = Job::new(
                    function.to_string(),
                    job_payload.to_vec(),
                    handle.to_string(),
                    self.downgrade(),
                );

                handler(job);
            }
            None => {
                warn!(
                    "{}: job assigned for unregistered function [{}]",
                    self.d.spec, function
                );

                self.write_packet(PacketType::WorkFail, &[handle.as_bytes()]);
            }
        }

        // jobs run concurrently. ask for the next one right away
        self.write_packet(PacketType::GrabJob, &[]);

        Ok(())
    }

    pub(crate) fn send_work_status(&self, handle: &str, numerator: u64, denominator: u64) {
        let numerator = numerator.to_string();
        let denominator = denominator.to_string();

        self.write_packet(
            PacketType::WorkStatus,
            &[
                handle.as_bytes(),
                numerator.as_bytes(),
                denominator.as_bytes(),
            ],
        );
    }

    pub(crate) fn send_work_complete(&self, handle: &str, result: &[u8]) {
        self.write_packet(PacketType::WorkComplete, &[handle.as_bytes(), result]);
    }

    pub(crate) fn send_work_fail(&self, handle: &str) {
        self.write_packet(PacketType::WorkFail, &[handle.as_bytes()]);
    }

    fn write_packet(&self, ptype: PacketType, args: &[&[u8]]) {
        if self.d.state.get() != State::Ready {
            debug!("{}: not ready, dropping {}", self.d.spec, ptype);

            return;
        }

        self.write_bytes(&pack(ptype, args));
    }

    fn write_bytes(&self, data: &[u8]) {
        self.d.outbuf.borrow_mut().extend(data.iter().copied());
        self.flush_outbuf();
    }

    fn flush_outbuf(&self) {
        let mut failed = None;

        {
            let outbuf = &mut *self.d.outbuf.borrow_mut();

            while !outbuf.is_empty() {
                let ret = match self.with_stream(|s| s.write(outbuf.as_slices().0)) {
                    Some(ret) => ret,
                    None => break,
                };

                match ret {
                    Ok(0) => {
                        failed = Some(io::Error::from(io::ErrorKind::WriteZero));
                        break;
                    }
                    Ok(size) => {
                        outbuf.drain(..size);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }
        }

        if let Some(e) = failed {
            error!("{}: write failed: {}", self.d.spec, e);
            self.session_error("write error");
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let waiting: usize = self.d.waiting.borrow().values().map(|tasks| tasks.len()).sum();

        write!(
            f,
            "{}({}waiting, {}need_handle, {}requests)",
            self.d.spec,
            waiting,
            self.d.need_handle.borrow().len(),
            self.d.requests.borrow().len()
        )
    }
}
