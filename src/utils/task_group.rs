// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::any::type_name;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

/// A set of spawned tasks that are always joined together.
///
/// `join_all` is the barrier: once it returns, no task of the group is
/// running any more. The completion counter is bumped when a task's future
/// finishes or unwinds, so a panicking task is still counted.
pub struct TaskGroup {
    name: String,
    next_id: usize,
    handles: Vec<(usize, JoinHandle<()>)>,
    completed: Arc<AtomicUsize>,
}

struct CompletionGuard(Arc<AtomicUsize>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

fn get_type_name<T>(_: &T) -> &'static str {
    type_name::<T>()
}

impl TaskGroup {
    pub fn new(name: impl Into<String>) -> Self {
        TaskGroup {
            name: name.into(),
            next_id: 0,
            handles: Vec::new(),
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn spawn<F>(&mut self, task: F) -> usize
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        let guard = CompletionGuard(self.completed.clone());
        let handle = tokio::spawn(async move {
            let _guard = guard;
            task.await;
        });
        self.handles.push((id, handle));
        id
    }

    /// Tasks spawned so far, finished or not.
    pub fn spawned(&self) -> usize {
        self.next_id
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    /// Drops the handles of tasks that already finished, for long lived
    /// groups such as one task per accepted connection.
    pub fn reap(&mut self) {
        self.handles.retain(|(_, handle)| !handle.is_finished());
    }

    /// Waits for every task of the group and returns the completion count.
    pub async fn join_all(mut self) -> usize {
        for (id, handle) in self.handles.drain(..) {
            match handle.await {
                Ok(()) => {
                    trace!("task {} of group {} joined", id, self.name);
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        let payload = join_error.into_panic();
                        if let Some(message) = payload.downcast_ref::<&'static str>() {
                            error!("task {} of group {} panicked with message: {}", id, self.name, message);
                        } else if let Some(message) = payload.downcast_ref::<String>() {
                            error!("task {} of group {} panicked with message: {}", id, self.name, message);
                        } else {
                            error!(
                                "task {} of group {} panicked with an unknown type: {}",
                                id,
                                self.name,
                                get_type_name(&payload)
                            );
                        }
                    } else {
                        warn!("task {} of group {} was aborted", id, self.name);
                    }
                }
            }
        }
        self.completed()
    }
}
