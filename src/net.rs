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

use arrayvec::{ArrayString, ArrayVec};
use log::error;
use mio::net::TcpStream;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, ToSocketAddrs};
use std::rc::Rc;

pub const DEFAULT_PORT: u16 = 7003;

pub const ADDRS_MAX: usize = 16;

pub type Hostname = ArrayString<255>;
pub type Addrs = ArrayVec<IpAddr, ADDRS_MAX>;

pub fn resolve(host: &str) -> Result<Addrs, io::Error> {
    match (host, 0).to_socket_addrs() {
        Ok(addrs) => Ok(addrs.take(ADDRS_MAX).map(|addr| addr.ip()).collect()),
        Err(e) => Err(e),
    }
}

pub fn set_socket_opts(stream: &mut TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        error!("set nodelay failed: {:?}", e);
    }
}

#[derive(Debug, PartialEq)]
pub enum SpecError {
    InvalidHost,
    InvalidPort,
}

impl fmt::Display for SpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHost => write!(f, "invalid host"),
            Self::InvalidPort => write!(f, "invalid port"),
        }
    }
}

// where the endpoint's byte stream comes from: a resolvable address, an
// injected pre-connected channel (consumed by the first connect), or a
// factory yielding a fresh in-process channel per connect
pub enum HostSpec {
    Addr(Hostname, u16),
    Pipe(RefCell<Option<PipeStream>>),
    Factory(Box<dyn Fn() -> PipeStream>),
}

impl HostSpec {
    // parse "host" or "host:port", with the port defaulting to 7003
    pub fn parse(s: &str) -> Result<Self, SpecError> {
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port.parse().map_err(|_| SpecError::InvalidPort)?;

                (host, port)
            }
            None => (s, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(SpecError::InvalidHost);
        }

        let host = Hostname::from(host).map_err(|_| SpecError::InvalidHost)?;

        Ok(Self::Addr(host, port))
    }

    pub fn pipe(stream: PipeStream) -> Self {
        Self::Pipe(RefCell::new(Some(stream)))
    }

    pub fn factory<F>(f: F) -> Self
    where
        F: Fn() -> PipeStream + 'static,
    {
        Self::Factory(Box::new(f))
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Addr(host, port) => write!(f, "{}:{}", host, port),
            Self::Pipe(_) | Self::Factory(_) => write!(f, "local"),
        }
    }
}

struct PipeInner {
    buf: VecDeque<u8>,
    eof: bool,
}

// in-process duplex byte channel. reads are non-blocking: an empty buffer
// reports WouldBlock until the peer end is shut down or dropped
pub struct PipeStream {
    read: Rc<RefCell<PipeInner>>,
    write: Rc<RefCell<PipeInner>>,
}

pub fn pipe_pair() -> (PipeStream, PipeStream) {
    let a = Rc::new(RefCell::new(PipeInner {
        buf: VecDeque::new(),
        eof: false,
    }));

    let b = Rc::new(RefCell::new(PipeInner {
        buf: VecDeque::new(),
        eof: false,
    }));

    (
        PipeStream {
            read: Rc::clone(&a),
            write: Rc::clone(&b),
        },
        PipeStream { read: b, write: a },
    )
}

impl PipeStream {
    // signal EOF to the peer. buffered bytes remain readable
    pub fn shutdown(&self) {
        self.write.borrow_mut().eof = true;
    }
}

impl Drop for PipeStream {
    fn drop(&mut self) {
        self.write.borrow_mut().eof = true;
        self.read.borrow_mut().eof = true;
    }
}

impl Read for PipeStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        let inner = &mut *self.read.borrow_mut();

        if inner.buf.is_empty() {
            if inner.eof {
                return Ok(0);
            }

            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }

        let size = inner.buf.len().min(buf.len());

        for b in buf.iter_mut().take(size) {
            *b = inner.buf.pop_front().unwrap();
        }

        Ok(size)
    }
}

impl Write for PipeStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        let inner = &mut *self.write.borrow_mut();

        if inner.eof {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }

        inner.buf.extend(buf.iter().copied());

        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        Ok(())
    }
}

pub enum Stream {
    Tcp(TcpStream),
    Pipe(PipeStream),
}

impl Stream {
    // deferred connect error, if any (SO_ERROR for tcp)
    pub fn take_error(&self) -> Result<Option<io::Error>, io::Error> {
        match self {
            Self::Tcp(stream) => stream.take_error(),
            Self::Pipe(_) => Ok(None),
        }
    }

    pub fn tcp(&mut self) -> Option<&mut TcpStream> {
        match self {
            Self::Tcp(stream) => Some(stream),
            Self::Pipe(_) => None,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            Self::Pipe(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            Self::Pipe(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            Self::Pipe(stream) => stream.flush(),
        }
    }
}
