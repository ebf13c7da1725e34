//! # Inbound Message Dispatch
//!
//! A [`Router`] is a dispatch table keyed by [`MsgType`] plus an ordered
//! middleware chain that sees every message first:
//!
//! ```text
//! msg ──► middleware[0] ──► middleware[1] ──► ... ──► routes[msg_type][0] ──► ...
//!              │ Stop             │ Stop                      │ Stop
//!              ▼                  ▼                           ▼
//!           dropped            dropped                     done
//! ```
//!
//! Any handler may return [`Flow::Stop`] to end dispatch for that message.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::dht::Dht;
use crate::identity::Signatory;
use crate::messages::{MSG_VERSION_1, Msg, MsgType};
use crate::protocols::{Flow, MessageHandler};

#[derive(Clone, Default)]
pub struct Router {
    middleware: Vec<Arc<dyn MessageHandler>>,
    routes: HashMap<MsgType, Vec<Arc<dyn MessageHandler>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler that runs for every message, before any route.
    pub fn middleware(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.middleware.push(handler);
        self
    }

    /// Append a handler for one message type.
    pub fn route(mut self, msg_type: MsgType, handler: Arc<dyn MessageHandler>) -> Self {
        self.routes.entry(msg_type).or_default().push(handler);
        self
    }

    pub async fn dispatch(&self, from: Signatory, msg: &Msg) -> Flow {
        for handler in &self.middleware {
            if handler.handle(from, msg).await == Flow::Stop {
                return Flow::Stop;
            }
        }
        let Some(handlers) = self.routes.get(&msg.msg_type) else {
            trace!(msg_type = ?msg.msg_type, "no route for message type");
            return Flow::Continue;
        };
        for handler in handlers {
            if handler.handle(from, msg).await == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }
}

/// Drops envelopes with an unknown version.
pub struct VersionFilter;

#[async_trait]
impl MessageHandler for VersionFilter {
    async fn handle(&self, from: Signatory, msg: &Msg) -> Flow {
        if msg.version != MSG_VERSION_1 {
            trace!(
                peer = %hex::encode(&from.as_bytes()[..8]),
                version = msg.version,
                "dropping message with unsupported version"
            );
            return Flow::Stop;
        }
        Flow::Continue
    }
}

/// Refreshes the sender's last-contact time in the peer table.
pub struct PeerTouch {
    dht: Dht,
}

impl PeerTouch {
    pub fn new(dht: Dht) -> Self {
        Self { dht }
    }
}

#[async_trait]
impl MessageHandler for PeerTouch {
    async fn handle(&self, from: Signatory, _msg: &Msg) -> Flow {
        self.dht.touch_peer(from).await;
        Flow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        flow: Flow,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, _from: Signatory, _msg: &Msg) -> Flow {
            self.log.lock().unwrap().push(self.name);
            self.flow
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>, flow: Flow) -> Arc<dyn MessageHandler> {
        Arc::new(Recorder {
            name,
            log: log.clone(),
            flow,
        })
    }

    fn from() -> Signatory {
        Signatory::from_bytes([1u8; 32])
    }

    #[tokio::test]
    async fn middleware_runs_before_routes_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new()
            .middleware(recorder("mw1", &log, Flow::Continue))
            .middleware(recorder("mw2", &log, Flow::Continue))
            .route(MsgType::Push, recorder("push", &log, Flow::Continue))
            .route(MsgType::Ping, recorder("ping", &log, Flow::Continue));

        router
            .dispatch(from(), &Msg::new(MsgType::Push, [0u8; 32], vec![]))
            .await;
        assert_eq!(*log.lock().unwrap(), vec!["mw1", "mw2", "push"]);
    }

    #[tokio::test]
    async fn stop_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new()
            .middleware(recorder("gate", &log, Flow::Stop))
            .route(MsgType::Push, recorder("push", &log, Flow::Continue));

        let flow = router
            .dispatch(from(), &Msg::new(MsgType::Push, [0u8; 32], vec![]))
            .await;
        assert_eq!(flow, Flow::Stop);
        assert_eq!(*log.lock().unwrap(), vec!["gate"]);
    }

    #[tokio::test]
    async fn route_chain_stops_at_first_stop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new()
            .route(MsgType::Pull, recorder("a", &log, Flow::Stop))
            .route(MsgType::Pull, recorder("b", &log, Flow::Continue));

        router
            .dispatch(from(), &Msg::new(MsgType::Pull, [0u8; 32], vec![]))
            .await;
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn version_filter_drops_unknown_versions() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new()
            .middleware(Arc::new(VersionFilter))
            .route(MsgType::Syn, recorder("syn", &log, Flow::Continue));

        let mut msg = Msg::new(MsgType::Syn, [0u8; 32], vec![]);
        msg.version = 99;
        assert_eq!(router.dispatch(from(), &msg).await, Flow::Stop);
        assert!(log.lock().unwrap().is_empty());
    }
}
