//! Integration tests: a real guest context talking to a real host context.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;

use plugrun::ChannelConfig;
use plugrun::ChannelState;
use plugrun::Error;
use plugrun::FnObject;
use plugrun::GuestContext;
use plugrun::GuestOptions;
use plugrun::HostContext;
use plugrun::LocalTransport;
use plugrun::ObjectTable;
use plugrun::RemoteError;
use plugrun::RequestHandler;
use plugrun::StreamTransport;
use plugrun::Transport;

const HOST: &str = "https://host.example";
const GUEST: &str = "https://guest.example";

fn objects() -> Arc<ObjectTable> {
    let table = ObjectTable::new();
    table.insert(
        "auth",
        FnObject::new(|method, _| match method {
            "getAccessToken" => Ok(json!("tok-abc")),
            other => Err(RemoteError::unknown_method("auth", other)),
        }),
    );
    table.insert(
        "loan",
        FnObject::new(|method, args| match method {
            "getField" => Ok(json!({ "field": args.first().cloned().unwrap_or(Value::Null), "value": 5.25 })),
            other => Err(RemoteError::unknown_method("loan", other)),
        })
        .events(["change"]),
    );
    Arc::new(table)
}

async fn bridge_over<T: Transport>(
    guest_end: T,
    host_end: T,
    handler: Arc<dyn RequestHandler>,
) -> anyhow::Result<(GuestContext, HostContext)> {
    let host = tokio::spawn(HostContext::serve(
        host_end,
        ChannelConfig::new(HOST).accept_origins([GUEST]),
        handler,
    ));
    let options = GuestOptions::new(ChannelConfig::new(GUEST).accept_origins([HOST]))
        .script_uri("https://host.example/plugins/loan-widget.js")
        .container("plugin-root");
    let guest = GuestContext::create(guest_end, options).await?;
    let host = host.await??;
    Ok((guest, host))
}

async fn bridge(handler: Arc<dyn RequestHandler>) -> anyhow::Result<(GuestContext, HostContext)> {
    let (guest_end, host_end) = LocalTransport::pair();
    bridge_over(guest_end, host_end, handler).await
}

#[tokio::test]
async fn test_handshake_records_both_origins() -> anyhow::Result<()> {
    let (guest, host) = bridge(objects()).await?;
    guest.ready();

    assert_eq!(guest.host_origin(), HOST);
    assert_eq!(host.guest_origin(), GUEST);
    assert_eq!(guest.container(), Some("plugin-root"));
    assert_eq!(guest.channel().state(), ChannelState::Connected);
    assert_eq!(host.channel().state(), ChannelState::Connected);
    Ok(())
}

#[tokio::test]
async fn test_guest_calls_host_object() -> anyhow::Result<()> {
    let (guest, _host) = bridge(objects()).await?;

    let auth = guest.get_object("auth").await?;
    assert_eq!(auth.invoke("getAccessToken", vec![]).await?, json!("tok-abc"));

    let loan = guest.get_object("loan").await?;
    let field: Value = loan.call("getField", &"rate").await?;
    assert_eq!(field, json!({"field": "rate", "value": 5.25}));

    let err = auth.invoke("logout", vec![]).await.unwrap_err();
    match err {
        Error::RemoteInvocation { error, .. } => assert!(error.has_code(plugwire::code::UNKNOWN_METHOD)),
        other => panic!("expected RemoteInvocation, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_unknown_object_is_surfaced() -> anyhow::Result<()> {
    let (guest, _host) = bridge(objects()).await?;

    let ghost = guest.get_object("ghost").await?;
    let err = ghost.invoke("boo", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::UnknownObject { ref object_id, .. } if object_id == "ghost"));
    Ok(())
}

#[tokio::test]
async fn test_host_emits_only_started_events() -> anyhow::Result<()> {
    let (guest, host) = bridge(objects()).await?;
    assert!(!host.emit("loan", "change", json!({"fieldId": "rate"}))?);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let changes = guest.event_source("loan", "change");
    let token = changes
        .subscribe(move |payload: &Value| {
            let _ = tx.send(payload.clone());
        })
        .await?;
    assert!(host.is_emitting("loan", "change"));
    assert!(guest.channel().is_confirmed("loan", "change"));

    assert!(host.emit("loan", "change", json!({"fieldId": "rate"}))?);
    let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?;
    assert_eq!(delivered, Some(json!({"fieldId": "rate"})));

    assert!(changes.unsubscribe(token).await?);
    assert!(!host.is_emitting("loan", "change"));
    assert!(!host.emit("loan", "change", json!({"fieldId": "term"}))?);
    assert_eq!(changes.subscriber_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_host_refuses_unknown_event() -> anyhow::Result<()> {
    let (guest, host) = bridge(objects()).await?;

    let loan = guest.get_object("loan").await?;
    let err = loan.add_event_listener("deleted", |_: &Value| {}).await.unwrap_err();
    assert!(matches!(err, Error::Subscription { ref event, .. } if event == "deleted"));
    assert!(!host.is_emitting("loan", "deleted"));
    assert_eq!(loan.call::<_, Value>("getField", &"term").await?["field"], "term");

    // The refusal is scoped to that pair.
    loan.add_event_listener("change", |_: &Value| {}).await?;
    assert!(host.is_emitting("loan", "change"));
    Ok(())
}

struct LevelRecorder {
    levels: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl RequestHandler for LevelRecorder {
    async fn invoke(&self, object_id: &str, _method: &str, _args: Vec<Value>) -> Result<Value, RemoteError> {
        Err(RemoteError::unknown_object(object_id))
    }

    fn set_log_level(&self, level: &str) {
        let _ = self.levels.send(level.to_string());
    }
}

#[tokio::test]
async fn test_log_level_reaches_host_handler() -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (guest, _host) = bridge(Arc::new(LevelRecorder { levels: tx })).await?;

    guest.set_log_level("debug")?;
    let level = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?;
    assert_eq!(level.as_deref(), Some("debug"));
    Ok(())
}

#[tokio::test]
async fn test_host_cannot_call_into_guest_without_handler() -> anyhow::Result<()> {
    let (_guest, host) = bridge(objects()).await?;

    let err = host.channel().invoke("window", "resize", vec![json!(640)]).await.unwrap_err();
    assert!(matches!(err, Error::UnknownObject { .. }));
    Ok(())
}

#[tokio::test]
async fn test_guest_close_reaches_host() -> anyhow::Result<()> {
    let (guest, host) = bridge(objects()).await?;

    guest.close().await;
    tokio::time::timeout(Duration::from_secs(2), host.closed()).await?;

    assert_eq!(host.channel().state(), ChannelState::Closed);
    assert!(!host.emit("loan", "change", json!({}))?);
    let err = guest.get_object("auth").await.unwrap_err();
    assert!(err.is_connection());
    Ok(())
}

#[tokio::test]
async fn test_bridge_over_byte_stream() -> anyhow::Result<()> {
    plugrun::logging::init("plugrun=debug");

    let (a, b) = tokio::io::duplex(4096);
    let limits = ChannelConfig::default().max_frame_len(1 << 20);
    let (guest, host) = bridge_over(
        StreamTransport::from_config(a, &limits),
        StreamTransport::from_config(b, &limits),
        objects(),
    )
    .await?;

    let auth = guest.get_object("auth").await?;
    assert_eq!(auth.invoke("getAccessToken", vec![]).await?, json!("tok-abc"));

    guest.close().await;
    tokio::time::timeout(Duration::from_secs(2), host.closed()).await?;
    Ok(())
}
