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

use crate::endpoint::WeakEndpoint;
use std::rc::Rc;

// one unit of client work. the endpoint holds submitted tasks weakly until
// the server assigns a handle, then strongly until a terminal reply
pub trait Task {
    // the full submit command, already framed. written verbatim
    fn submit_packet_bytes(&self) -> Vec<u8>;

    fn complete(&self, payload: &[u8]);
    fn fail(&self);
    fn status(&self, numerator: u64, denominator: u64);
    fn exception(&self, payload: &[u8]);
}

// map-key identity of a task object
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(usize);

impl TaskId {
    pub fn of(task: &Rc<dyn Task>) -> Self {
        Self(Rc::as_ptr(task) as *const () as usize)
    }
}

// a job assigned to a worker handler: the function name, the opaque
// payload, and the server handle to report progress and results against.
// replies are dropped if the owning endpoint is gone or no longer ready
pub struct Job {
    function: String,
    payload: Vec<u8>,
    handle: String,
    endpoint: WeakEndpoint,
}

impl Job {
    pub(crate) fn new(
        function: String,
        payload: Vec<u8>,
        handle: String,
        endpoint: WeakEndpoint,
    ) -> Self {
        Self {
            function,
            payload,
            handle,
            endpoint,
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn status(&self, numerator: u64, denominator: u64) {
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.send_work_status(&self.handle, numerator, denominator);
        }
    }

    pub fn complete(&self, result: &[u8]) {
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.send_work_complete(&self.handle, result);
        }
    }

    pub fn fail(&self) {
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.send_work_fail(&self.handle);
        }
    }
}
