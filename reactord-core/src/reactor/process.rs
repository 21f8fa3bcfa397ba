//! The reactor's top-level loop. The actor subscribes to the event bus once
//! at startup and then, for every qualifying event, drives the pipeline:
//! resolve the tag against the reactor map, render and compile the matched
//! reaction files, and dispatch the resulting chunks in order. Events the
//! reactor caused itself are filtered out before matching so reactions
//! cannot trigger each other in a loop.

use crate::clients::ClientFactory;
use crate::event_bus::{Event, SubscriptionRequest};
use crate::reactor::compiler::compile_reactions;
use crate::reactor::dispatch::{DispatchOptions, DispatchOutcome, ReactionDispatcher};
use crate::reactor::map::{matching_reactions, ReactorMapSource};
use crate::reactor::renderer::ReactionSources;
use crate::reactor::REACTOR_EVENT_USER;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

pub struct ReactorOptions {
    pub map: ReactorMapSource,
    pub worker_threads: usize,
    pub worker_hwm: usize,
    pub client_refresh_interval: Duration,
}

/// Subscribes to the bus and spawns the reactor actor. The actor runs until
/// the bus closes; the daemon's lifetime is the process's, so there is no
/// stop request and no drain of queued worker-pool tasks on the way out.
pub fn start_reactor(
    options: ReactorOptions,
    event_bus_subscriber: UnboundedSender<SubscriptionRequest>,
    sources: ReactionSources,
    client_factory: Arc<dyn ClientFactory>,
) -> JoinHandle<()> {
    let (sender, receiver) = unbounded_channel();
    let _ = event_bus_subscriber.send(SubscriptionRequest::AllEvents { channel: sender });

    let actor = Actor::new(options, receiver, sources, client_factory);
    tokio::spawn(actor.run())
}

struct Actor {
    map: ReactorMapSource,
    sources: ReactionSources,
    dispatcher: ReactionDispatcher,
    events: UnboundedReceiver<Event>,
}

impl Actor {
    fn new(
        options: ReactorOptions,
        events: UnboundedReceiver<Event>,
        sources: ReactionSources,
        client_factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let dispatcher = ReactionDispatcher::new(
            client_factory,
            &DispatchOptions {
                worker_threads: options.worker_threads,
                worker_hwm: options.worker_hwm,
                client_refresh_interval: options.client_refresh_interval,
            },
        );

        Actor {
            map: options.map,
            sources,
            dispatcher,
            events,
        }
    }

    #[instrument(name = "Reactor Execution", skip(self))]
    async fn run(mut self) {
        info!("Starting reactor");

        while let Some(event) = self.events.recv().await {
            self.handle_event(event).await;
        }

        info!("Reactor closing");
    }

    async fn handle_event(&self, event: Event) {
        // Skip all events fired by ourselves.
        if event.data.get("user").and_then(Value::as_str) == Some(REACTOR_EVENT_USER) {
            return;
        }

        let reactions = matching_reactions(&self.map, &event.tag);
        if reactions.is_empty() {
            return;
        }

        let chunks = compile_reactions(&self.sources, &event.tag, &event.data, &reactions);
        if chunks.is_empty() {
            return;
        }

        let mut exit_suppressed = false;
        for chunk in &chunks {
            if self.dispatcher.run(chunk).await == DispatchOutcome::ExitSuppressed {
                exit_suppressed = true;
            }
        }

        if exit_suppressed {
            warn!(tag = %event.tag, "Exit ignored by reactor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{
        CallerClient, ClientError, LocalClient, RunnerClient, WheelClient,
    };
    use crate::event_bus::{start_event_bus, PublishEventRequest};
    use crate::reactor::map::ReactorMapEntry;
    use crate::reactor::renderer::{JinjaYamlRenderer, LocalFileCache};
    use crate::reactor::Kwargs;
    use crate::test_utils;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::mpsc::UnboundedSender;

    #[derive(Debug)]
    struct RecordedCall {
        backend: &'static str,
        fun: String,
        target: Option<String>,
    }

    struct RecordingClient {
        exit_on_call: bool,
        calls: UnboundedSender<RecordedCall>,
    }

    #[async_trait]
    impl LocalClient for RecordingClient {
        async fn cmd_async(
            &self,
            target: &str,
            fun: &str,
            _args: &[Value],
            _kwargs: &Kwargs,
        ) -> Result<(), ClientError> {
            let _ = self.calls.send(RecordedCall {
                backend: "local",
                fun: fun.to_string(),
                target: Some(target.to_string()),
            });

            if self.exit_on_call {
                return Err(ClientError::ExitRequested("stub exit".to_string()));
            }

            Ok(())
        }
    }

    #[async_trait]
    impl RunnerClient for RecordingClient {
        async fn low(&self, fun: &str, _kwargs: Kwargs) -> Result<(), ClientError> {
            let _ = self.calls.send(RecordedCall {
                backend: "runner",
                fun: fun.to_string(),
                target: None,
            });

            Ok(())
        }
    }

    #[async_trait]
    impl WheelClient for RecordingClient {
        async fn low(&self, fun: &str, _kwargs: Kwargs) -> Result<(), ClientError> {
            let _ = self.calls.send(RecordedCall {
                backend: "wheel",
                fun: fun.to_string(),
                target: None,
            });

            Ok(())
        }
    }

    impl CallerClient for RecordingClient {
        fn call(&self, fun: &str, _args: &[Value]) -> Result<(), ClientError> {
            let _ = self.calls.send(RecordedCall {
                backend: "caller",
                fun: fun.to_string(),
                target: None,
            });

            Ok(())
        }
    }

    struct RecordingFactory {
        exit_on_call: bool,
        calls: UnboundedSender<RecordedCall>,
    }

    impl RecordingFactory {
        fn client(&self) -> RecordingClient {
            RecordingClient {
                exit_on_call: self.exit_on_call,
                calls: self.calls.clone(),
            }
        }
    }

    impl crate::clients::ClientFactory for RecordingFactory {
        fn local(&self) -> Result<Arc<dyn LocalClient>, ClientError> {
            Ok(Arc::new(self.client()))
        }

        fn runner(&self) -> Result<Arc<dyn RunnerClient>, ClientError> {
            Ok(Arc::new(self.client()))
        }

        fn wheel(&self) -> Result<Arc<dyn WheelClient>, ClientError> {
            Ok(Arc::new(self.client()))
        }

        fn caller(&self) -> Result<Arc<dyn CallerClient>, ClientError> {
            Ok(Arc::new(self.client()))
        }
    }

    struct TestContext {
        _reaction_dir: tempfile::TempDir,
        publisher: UnboundedSender<PublishEventRequest>,
        calls: tokio::sync::mpsc::UnboundedReceiver<RecordedCall>,
    }

    fn start_test_reactor(reaction_yaml: &str, exit_on_call: bool) -> TestContext {
        let reaction_dir = tempfile::tempdir().unwrap();
        std::fs::write(reaction_dir.path().join("reaction.sls"), reaction_yaml).unwrap();

        let map = ReactorMapSource::Inline(vec![ReactorMapEntry {
            pattern: "salt/job/*/new".to_string(),
            reactions: vec!["salt://reaction.sls".to_string()],
        }]);

        let (publisher, subscriber) = start_event_bus();
        let (call_sender, call_receiver) = unbounded_channel();
        let factory = Arc::new(RecordingFactory {
            exit_on_call,
            calls: call_sender,
        });

        let sources = ReactionSources::new(
            Arc::new(LocalFileCache::new(reaction_dir.path().to_path_buf())),
            Arc::new(JinjaYamlRenderer),
        );

        let _ = start_reactor(
            ReactorOptions {
                map,
                worker_threads: 2,
                worker_hwm: 10,
                client_refresh_interval: Duration::from_secs(60),
            },
            subscriber,
            sources,
            factory,
        );

        TestContext {
            _reaction_dir: reaction_dir,
            publisher,
            calls: call_receiver,
        }
    }

    fn publish(context: &TestContext, tag: &str, data: Value) {
        context
            .publisher
            .send(PublishEventRequest::Event {
                event: Event {
                    tag: tag.to_string(),
                    data,
                },
            })
            .expect("Failed to publish event");
    }

    const PING_REACTION: &str = "
notify:
  state: local
  fun: test.ping
  tgt: '{{ data.id }}'
";

    #[tokio::test]
    async fn matching_event_dispatches_the_rendered_reaction() {
        let mut context = start_test_reactor(PING_REACTION, false);
        publish(&context, "salt/job/123/new", json!({"id": "123"}));

        let call = test_utils::expect_mpsc_response(&mut context.calls).await;
        assert_eq!(call.backend, "local", "Unexpected backend");
        assert_eq!(call.fun, "test.ping", "Unexpected function");
        assert_eq!(
            call.target.as_deref(),
            Some("123"),
            "Expected the event payload to flow into the rendered target",
        );
    }

    #[tokio::test]
    async fn non_matching_event_dispatches_nothing() {
        let mut context = start_test_reactor(PING_REACTION, false);
        publish(&context, "salt/auth", json!({}));
        test_utils::expect_mpsc_timeout(&mut context.calls).await;
    }

    #[tokio::test]
    async fn self_events_are_filtered_before_matching() {
        let mut context = start_test_reactor(PING_REACTION, false);
        publish(
            &context,
            "salt/job/123/new",
            json!({"id": "123", "user": REACTOR_EVENT_USER}),
        );

        test_utils::expect_mpsc_timeout(&mut context.calls).await;
    }

    #[tokio::test]
    async fn events_from_other_users_still_match() {
        let mut context = start_test_reactor(PING_REACTION, false);
        publish(
            &context,
            "salt/job/123/new",
            json!({"id": "123", "user": "admin"}),
        );

        let call = test_utils::expect_mpsc_response(&mut context.calls).await;
        assert_eq!(call.fun, "test.ping");
    }

    #[tokio::test]
    async fn chunks_dispatch_in_compiled_order() {
        // Both declarations target the local backend so the dispatch calls
        // happen inline, which makes the receipt order deterministic.
        let reaction = "
restart:
  state: local
  fun: service.restart
  require:
    - sync
sync:
  state: local
  fun: saltutil.sync_all
";
        let mut context = start_test_reactor(reaction, false);
        publish(&context, "salt/job/123/new", json!({}));

        let first = test_utils::expect_mpsc_response(&mut context.calls).await;
        assert_eq!(first.fun, "saltutil.sync_all", "Requisite must run first");

        let second = test_utils::expect_mpsc_response(&mut context.calls).await;
        assert_eq!(second.fun, "service.restart");
    }

    #[tokio::test]
    async fn invalid_reaction_produces_no_dispatches() {
        let reaction = "
broken:
  state: local
";
        let mut context = start_test_reactor(reaction, false);
        publish(&context, "salt/job/123/new", json!({}));
        test_utils::expect_mpsc_timeout(&mut context.calls).await;
    }

    #[tokio::test]
    async fn exit_request_does_not_stop_the_event_loop() {
        let mut context = start_test_reactor(PING_REACTION, true);

        publish(&context, "salt/job/123/new", json!({"id": "123"}));
        let _ = test_utils::expect_mpsc_response(&mut context.calls).await;

        // The client tried to exit; the loop must keep serving events.
        publish(&context, "salt/job/456/new", json!({"id": "456"}));
        let call = test_utils::expect_mpsc_response(&mut context.calls).await;
        assert_eq!(call.target.as_deref(), Some("456"));
    }
}
