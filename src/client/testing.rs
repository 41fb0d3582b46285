//! Scripted transport for session and workspace tests.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::transport::{ChatError, ChatTransport, FragmentStream};
use crate::models::ChatRequest;

enum Script {
    Reply {
        items: Vec<Result<String, ChatError>>,
        hang: bool,
        dropped: Arc<AtomicBool>,
    },
    Fail(ChatError),
}

/// Tells whether the stream handed to the session has been dropped.
#[derive(Clone)]
pub struct DropProbe(Arc<AtomicBool>);

impl DropProbe {
    pub fn is_dropped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Answers each `open` with the next queued script, in order.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply<I, S>(&self, chunks: I) -> DropProbe
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push_reply(chunks.into_iter().map(|c| Ok(c.into())).collect(), false)
    }

    pub fn reply_then_fail<I, S>(&self, chunks: I, error: ChatError) -> DropProbe
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut items: Vec<_> = chunks.into_iter().map(|c| Ok(c.into())).collect();
        items.push(Err(error));
        self.push_reply(items, false)
    }

    /// A stream that never yields.
    pub fn hang(&self) -> DropProbe {
        self.push_reply(Vec::new(), true)
    }

    pub fn fail(&self, error: ChatError) {
        self.scripts.lock().unwrap().push_back(Script::Fail(error));
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn push_reply(&self, items: Vec<Result<String, ChatError>>, hang: bool) -> DropProbe {
        let dropped = Arc::new(AtomicBool::new(false));
        self.scripts.lock().unwrap().push_back(Script::Reply {
            items,
            hang,
            dropped: dropped.clone(),
        });
        DropProbe(dropped)
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn open(&self, request: &ChatRequest) -> Result<FragmentStream, ChatError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(Script::Reply { items, hang, dropped }) => {
                let guard = SetOnDrop(dropped);
                let items = stream::iter(items);
                let fragments = if hang {
                    items.chain(stream::pending()).boxed()
                } else {
                    items.boxed()
                };
                Ok(fragments
                    .map(move |item| {
                        let _guard = &guard;
                        item
                    })
                    .boxed())
            }
            Some(Script::Fail(error)) => Err(error),
            None => Err(ChatError::Server("no scripted reply left".into())),
        }
    }
}
