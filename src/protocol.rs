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

use arrayvec::ArrayVec;
use std::fmt;

pub const HEADER_SIZE: usize = 12;

pub const REQ_MAGIC: &[u8; 4] = b"\0REQ";
pub const RES_MAGIC: &[u8; 4] = b"\0RES";

// refuse to buffer responses larger than this
const PAYLOAD_SIZE_MAX: usize = 64 * 1024 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketType {
    CanDo,
    PreSleep,
    Noop,
    JobCreated,
    GrabJob,
    NoJob,
    JobAssign,
    WorkStatus,
    WorkComplete,
    WorkFail,
    Error,
    WorkException,
    OptionReq,
    OptionRes,
}

impl PacketType {
    pub fn code(self) -> u32 {
        match self {
            Self::CanDo => 1,
            Self::PreSleep => 4,
            Self::Noop => 6,
            Self::JobCreated => 8,
            Self::GrabJob => 9,
            Self::NoJob => 10,
            Self::JobAssign => 11,
            Self::WorkStatus => 12,
            Self::WorkComplete => 13,
            Self::WorkFail => 14,
            Self::Error => 19,
            Self::WorkException => 25,
            Self::OptionReq => 26,
            Self::OptionRes => 27,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let ptype = match code {
            1 => Self::CanDo,
            4 => Self::PreSleep,
            6 => Self::Noop,
            8 => Self::JobCreated,
            9 => Self::GrabJob,
            10 => Self::NoJob,
            11 => Self::JobAssign,
            12 => Self::WorkStatus,
            13 => Self::WorkComplete,
            14 => Self::WorkFail,
            19 => Self::Error,
            25 => Self::WorkException,
            26 => Self::OptionReq,
            27 => Self::OptionRes,
            _ => return None,
        };

        Some(ptype)
    }
}

impl From<PacketType> for &str {
    fn from(ptype: PacketType) -> &'static str {
        match ptype {
            PacketType::CanDo => "can_do",
            PacketType::PreSleep => "pre_sleep",
            PacketType::Noop => "noop",
            PacketType::JobCreated => "job_created",
            PacketType::GrabJob => "grab_job",
            PacketType::NoJob => "no_job",
            PacketType::JobAssign => "job_assign",
            PacketType::WorkStatus => "work_status",
            PacketType::WorkComplete => "work_complete",
            PacketType::WorkFail => "work_fail",
            PacketType::Error => "error",
            PacketType::WorkException => "work_exception",
            PacketType::OptionReq => "option_req",
            PacketType::OptionRes => "option_res",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s: &str = (*self).into();
        write!(f, "{}", s)
    }
}

#[derive(Debug, PartialEq)]
pub enum ParseError {
    BadMagic,
    UnknownType(u32),
    TooLarge(usize),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "bad frame magic"),
            Self::UnknownType(code) => write!(f, "unknown packet type {}", code),
            Self::TooLarge(size) => write!(f, "payload size {} too large", size),
        }
    }
}

#[derive(Debug)]
pub struct Packet {
    pub ptype: PacketType,
    pub payload: Vec<u8>,
}

// serialize an outbound command. multi-argument payloads are joined with
// NUL. the last argument may itself contain NUL bytes
pub fn pack(ptype: PacketType, args: &[&[u8]]) -> Vec<u8> {
    let mut size = 0;

    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            size += 1;
        }

        size += arg.len();
    }

    let mut out = Vec::with_capacity(HEADER_SIZE + size);

    out.extend_from_slice(REQ_MAGIC);
    out.extend_from_slice(&ptype.code().to_be_bytes());
    out.extend_from_slice(&(size as u32).to_be_bytes());

    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(0);
        }

        out.extend_from_slice(arg);
    }

    out
}

#[cfg(test)]
pub fn pack_res(ptype: PacketType, args: &[&[u8]]) -> Vec<u8> {
    let mut out = pack(ptype, args);
    out[..4].copy_from_slice(RES_MAGIC);

    out
}

// split a payload at the first NUL
pub fn split_arg(payload: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = payload.iter().position(|&b| b == 0)?;

    Some((&payload[..pos], &payload[(pos + 1)..]))
}

// split a payload at the first two NULs. the remainder may contain NULs
pub fn split_arg2(payload: &[u8]) -> Option<(&[u8], &[u8], &[u8])> {
    let (first, rest) = split_arg(payload)?;
    let (second, rest) = split_arg(rest)?;

    Some((first, second, rest))
}

// incremental response framer. consumes raw bytes in arbitrary chunks and
// emits each completed packet through the callback
pub struct Parser {
    header: ArrayVec<u8, HEADER_SIZE>,
    ptype: Option<PacketType>,
    need: usize,
    payload: Vec<u8>,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            header: ArrayVec::new(),
            ptype: None,
            need: 0,
            payload: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.header.clear();
        self.ptype = None;
        self.need = 0;
        self.payload = Vec::new();
    }

    pub fn feed<F>(&mut self, src: &[u8], f: &mut F) -> Result<(), ParseError>
    where
        F: FnMut(Packet),
    {
        let mut pos = 0;

        while pos < src.len() {
            match self.ptype {
                None => {
                    let take = (HEADER_SIZE - self.header.len()).min(src.len() - pos);
                    self.header
                        .try_extend_from_slice(&src[pos..(pos + take)])
                        .unwrap();
                    pos += take;

                    if self.header.len() < HEADER_SIZE {
                        break;
                    }

                    if &self.header[..4] != RES_MAGIC {
                        return Err(ParseError::BadMagic);
                    }

                    let mut field = [0; 4];

                    field.copy_from_slice(&self.header[4..8]);
                    let code = u32::from_be_bytes(field);

                    field.copy_from_slice(&self.header[8..12]);
                    let size = u32::from_be_bytes(field) as usize;

                    let ptype = match PacketType::from_code(code) {
                        Some(ptype) => ptype,
                        None => return Err(ParseError::UnknownType(code)),
                    };

                    if size > PAYLOAD_SIZE_MAX {
                        return Err(ParseError::TooLarge(size));
                    }

                    self.header.clear();

                    if size == 0 {
                        f(Packet {
                            ptype,
                            payload: Vec::new(),
                        });
                    } else {
                        self.ptype = Some(ptype);
                        self.need = size;
                        self.payload = Vec::with_capacity(size);
                    }
                }
                Some(ptype) => {
                    let take = (self.need - self.payload.len()).min(src.len() - pos);
                    self.payload.extend_from_slice(&src[pos..(pos + take)]);
                    pos += take;

                    if self.payload.len() < self.need {
                        break;
                    }

                    let payload = std::mem::take(&mut self.payload);

                    self.ptype = None;
                    self.need = 0;

                    f(Packet { ptype, payload });
                }
            }
        }

        Ok(())
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}
