//! In-memory message network for protocol tests.
//!
//! Every registered node gets an address and a [`Router`]; a
//! [`MemorySender`] delivers by dispatching straight into the recipient's
//! router. Nodes can be taken down to simulate unreachable peers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::identity::Signatory;
use crate::messages::{Msg, MsgType};
use crate::protocols::MessageSender;
use crate::router::Router;

#[derive(Default)]
struct NetState {
    nodes: HashMap<Signatory, (String, Router)>,
    down: HashSet<Signatory>,
    sent: HashMap<MsgType, usize>,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, signatory: Signatory, addr: &str, router: Router) {
        self.lock().nodes.insert(signatory, (addr.to_string(), router));
    }

    pub fn set_down(&self, signatory: Signatory, down: bool) {
        let mut state = self.lock();
        if down {
            state.down.insert(signatory);
        } else {
            state.down.remove(&signatory);
        }
    }

    pub fn sender(&self, from: Signatory) -> Arc<MemorySender> {
        Arc::new(MemorySender {
            net: self.clone(),
            from,
        })
    }

    /// Messages of `msg_type` delivered so far.
    pub fn sent(&self, msg_type: MsgType) -> usize {
        self.lock().sent.get(&msg_type).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub struct MemorySender {
    net: MemoryNetwork,
    from: Signatory,
}

#[async_trait]
impl MessageSender for MemorySender {
    async fn send(&self, to: Signatory, addr: &str, msg: Msg) -> Result<()> {
        let router = {
            let mut state = self.net.lock();
            if state.down.contains(&to) {
                bail!("connection refused");
            }
            let Some((registered, router)) = state.nodes.get(&to) else {
                bail!("no route to {to:?}");
            };
            if !addr.is_empty() && addr != registered {
                bail!("nothing listening at {addr}");
            }
            let router = router.clone();
            *state.sent.entry(msg.msg_type).or_default() += 1;
            router
        };
        router.dispatch(self.from, &msg).await;
        Ok(())
    }
}
