//! In-process demonstration: expose a small object graph on one end of a
//! message channel and drive it from the other.

use farcall_types::config::ProtocolConfig;
use farcall_wire::{proxy, Class, Codec, Fault, Function, MessageChannel, Object, Value};
use std::sync::Arc;
use tracing::info;

fn counter_class() -> Class {
    Class::sync("Counter", |args| {
        let start = args.first().and_then(Value::as_i64).unwrap_or(0);
        let increment = Function::sync("increment", |this, _| {
            let Some(counter) = this.as_object() else {
                return Err(Fault::type_error("increment requires a Counter receiver"));
            };
            let next = counter.get("count").and_then(|v| v.as_i64()).unwrap_or(0) + 1;
            counter.set("count", next);
            Ok(next.into())
        });
        Ok(Object::new()
            .with("count", start)
            .with("increment", increment)
            .into())
    })
}

/// The graph served by the demo.
pub fn sample_graph() -> Object {
    let math = Object::new().with(
        "add",
        Function::sync("add", |_, args| {
            let sum: f64 = args.iter().filter_map(Value::as_f64).sum();
            Ok(sum.into())
        }),
    );
    let greet = Function::new("greet", |_, args| async move {
        let mut args = args.into_iter();
        let name = args.next().unwrap_or_default();
        let format = args.next().unwrap_or_default();
        format.invoke(Value::null(), vec![name]).await
    });

    Object::new()
        .with("name", "demo")
        .with("math", math)
        .with("greet", greet)
        .with("Counter", counter_class())
        .with_finalizer(|| info!("Demo root released"))
}

/// Run every protocol operation once against [`sample_graph`].
pub async fn run(config: ProtocolConfig) -> anyhow::Result<()> {
    let codec = Codec::new(config);
    let (client, server) = MessageChannel::new();
    codec.expose(sample_graph(), Arc::new(server));
    let api = codec.wrap(Arc::new(client));

    let name = api.get("name").await?;
    info!(result = ?name, "GET name");

    api.set("name", "renamed").await?;
    info!(result = ?api.get("name").await?, "SET name");

    let sum = api.get("math").get("add").call(vec![2.into(), 40.into()]).await?;
    info!(result = ?sum, "APPLY math.add");

    let shout = Function::sync("shout", |_, args| {
        let name = args.first().and_then(Value::as_str).unwrap_or("nobody");
        Ok(format!("HELLO, {}!", name.to_uppercase()).into())
    });
    let greeting = api
        .get("greet")
        .call(vec!["farcall".into(), proxy(shout)])
        .await?;
    info!(result = ?greeting, "APPLY greet with proxied callback");

    let counter = api.get("Counter").construct(vec![5.into()]).await?;
    for _ in 0..2 {
        let count = counter.get("increment").call(vec![]).await?;
        info!(result = ?count, "APPLY Counter#increment");
    }

    let port = api.create_endpoint().await?;
    let second = codec.wrap(Arc::new(port));
    info!(result = ?second.get("name").await?, "GET name over a second endpoint");

    match api.get("missing").call(vec![]).await {
        Ok(value) => info!(result = ?value, "Unexpected success"),
        Err(e) => info!(error = %e, "APPLY missing failed as expected"),
    }

    api.release().await?;
    info!("Released demo connection");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_runs() {
        run(ProtocolConfig::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_sample_graph_greet_uses_callback() {
        let codec = Codec::default();
        let (client, server) = MessageChannel::new();
        codec.expose(sample_graph(), Arc::new(server));
        let api = codec.wrap(Arc::new(client));

        let echo = Function::sync("echo", |_, args| Ok(args.into_iter().next().unwrap_or_default()));
        let value = api
            .get("greet")
            .call(vec!["x".into(), proxy(echo)])
            .await
            .unwrap();
        assert_eq!(value.as_str(), Some("x"));
    }
}
