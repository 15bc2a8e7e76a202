use std::collections::HashMap;
use std::future::Future;

use anyhow::{anyhow, Context};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

type RouteFn = Box<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

struct Route {
    topic: String,
    handler: RouteFn,
}

/// Outcome of a dispatched message: where the reply goes and what it is.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub topic: String,
    pub payload: Value,
}

/// Maps inbound destinations to the handler serving them and the topic its
/// replies are broadcast to. Filled in at startup, read-only afterwards.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `destination`; its output is published on `topic`.
    ///
    /// The message body is deserialized into `In` before the handler runs and
    /// the handler's `Out` is serialized back to JSON afterwards. Registering
    /// the same destination twice replaces the earlier route.
    pub fn register<In, Out, F, Fut>(
        &mut self,
        destination: impl Into<String>,
        topic: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Out>> + Send + 'static,
    {
        let route: RouteFn = Box::new(
            move |body: Value| -> BoxFuture<'static, anyhow::Result<Value>> {
                let call = serde_json::from_value::<In>(body).map(&handler);
                Box::pin(async move {
                    let output = call.context("invalid message payload")?.await?;
                    serde_json::to_value(output).context("failed to serialize reply")
                })
            },
        );

        self.routes.insert(
            destination.into(),
            Route {
                topic: topic.into(),
                handler: route,
            },
        );
        self
    }

    pub async fn dispatch(&self, destination: &str, body: Value) -> anyhow::Result<Dispatched> {
        let route = self
            .routes
            .get(destination)
            .ok_or_else(|| anyhow!("no handler registered for destination {}", destination))?;

        let payload = (route.handler)(body).await?;
        Ok(Dispatched {
            topic: route.topic.clone(),
            payload,
        })
    }

    pub fn destinations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.keys().cloned().collect();
        names.sort();
        names
    }
}
