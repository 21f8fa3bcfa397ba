//! Bundled clients that publish command events onto the event bus instead of
//! talking to an execution fabric directly. Each call becomes one event with
//! a fresh job id in its tag and the reactor's identity in its payload, so
//! the reactor's self-event filter ignores the commands it fired itself.

use crate::clients::{
    CallerClient, ClientError, ClientFactory, LocalClient, RunnerClient, WheelClient,
};
use crate::event_bus::{Event, PublishEventRequest};
use crate::reactor::{Kwargs, REACTOR_EVENT_USER};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

pub struct BusClientFactory {
    publisher: UnboundedSender<PublishEventRequest>,
}

impl BusClientFactory {
    pub fn new(publisher: UnboundedSender<PublishEventRequest>) -> Self {
        BusClientFactory { publisher }
    }
}

impl ClientFactory for BusClientFactory {
    fn local(&self) -> Result<Arc<dyn LocalClient>, ClientError> {
        Ok(Arc::new(BusLocalClient {
            publisher: self.publisher.clone(),
        }))
    }

    fn runner(&self) -> Result<Arc<dyn RunnerClient>, ClientError> {
        Ok(Arc::new(BusLowClient {
            publisher: self.publisher.clone(),
            kind: "run",
        }))
    }

    fn wheel(&self) -> Result<Arc<dyn WheelClient>, ClientError> {
        Ok(Arc::new(BusLowClient {
            publisher: self.publisher.clone(),
            kind: "wheel",
        }))
    }

    fn caller(&self) -> Result<Arc<dyn CallerClient>, ClientError> {
        Ok(Arc::new(BusCallerClient {
            publisher: self.publisher.clone(),
        }))
    }
}

fn publish(
    publisher: &UnboundedSender<PublishEventRequest>,
    event: Event,
) -> Result<(), ClientError> {
    publisher
        .send(PublishEventRequest::Event { event })
        .map_err(|_| ClientError::CallFailed("event bus is closed".to_string()))
}

struct BusLocalClient {
    publisher: UnboundedSender<PublishEventRequest>,
}

#[async_trait]
impl LocalClient for BusLocalClient {
    async fn cmd_async(
        &self,
        target: &str,
        fun: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<(), ClientError> {
        let jid = Uuid::new_v4().simple().to_string();
        publish(
            &self.publisher,
            Event {
                tag: format!("reactord/job/{}/new", jid),
                data: json!({
                    "jid": jid,
                    "tgt": target,
                    "fun": fun,
                    "arg": args,
                    "kwarg": kwargs,
                    "user": REACTOR_EVENT_USER,
                }),
            },
        )
    }
}

/// Publishes runner and wheel low calls; the two differ only in the tag
/// namespace their job events land in.
struct BusLowClient {
    publisher: UnboundedSender<PublishEventRequest>,
    kind: &'static str,
}

impl BusLowClient {
    fn fire(&self, fun: &str, kwargs: Kwargs) -> Result<(), ClientError> {
        let jid = Uuid::new_v4().simple().to_string();
        publish(
            &self.publisher,
            Event {
                tag: format!("reactord/{}/{}/new", self.kind, jid),
                data: json!({
                    "jid": jid,
                    "fun": fun,
                    "kwarg": kwargs,
                    "user": REACTOR_EVENT_USER,
                }),
            },
        )
    }
}

#[async_trait]
impl RunnerClient for BusLowClient {
    async fn low(&self, fun: &str, kwargs: Kwargs) -> Result<(), ClientError> {
        self.fire(fun, kwargs)
    }
}

#[async_trait]
impl WheelClient for BusLowClient {
    async fn low(&self, fun: &str, kwargs: Kwargs) -> Result<(), ClientError> {
        self.fire(fun, kwargs)
    }
}

struct BusCallerClient {
    publisher: UnboundedSender<PublishEventRequest>,
}

impl CallerClient for BusCallerClient {
    fn call(&self, fun: &str, args: &[Value]) -> Result<(), ClientError> {
        let jid = Uuid::new_v4().simple().to_string();
        publish(
            &self.publisher,
            Event {
                tag: format!("reactord/call/{}/new", jid),
                data: json!({
                    "jid": jid,
                    "fun": fun,
                    "arg": args,
                    "user": REACTOR_EVENT_USER,
                }),
            },
        )
    }
}
