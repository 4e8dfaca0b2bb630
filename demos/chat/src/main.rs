use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wshub::prelude::*;

struct Lobby;

#[async_trait]
impl EventHandler for Lobby {
    fn on_connect(&self, hub: &Hub, conn: &Connection) {
        println!("✅ {} joined ({} online)", conn.user_id(), hub.connection_count());

        let welcome = Envelope::new(
            "welcome",
            json!({
                "message": format!("Welcome, {}!", conn.user_id()),
                "rooms": hub.registry().rooms(),
            }),
        );
        if let Err(e) = conn.send_envelope(&welcome) {
            tracing::warn!("Could not greet {}: {}", conn.id(), e);
        }
        if let Err(e) = hub.join("lobby", conn.id()) {
            tracing::warn!("Could not add {} to the lobby: {}", conn.id(), e);
        }
    }

    fn on_disconnect(&self, hub: &Hub, conn: &Connection) {
        println!("❌ {} left ({} online)", conn.user_id(), hub.connection_count());
    }
}

async fn sum(params: Value) -> Result<Value> {
    let numbers = params
        .as_array()
        .ok_or_else(|| Error::rpc("params must be an array of numbers"))?;
    let total: f64 = numbers.iter().filter_map(Value::as_f64).sum();
    Ok(json!(total))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = HubConfig::default().with_presence(
        PresenceConfig::default().with_sweep(Duration::from_secs(30), Duration::from_secs(120)),
    );
    let hub = Hub::builder().config(config).handler(Lobby).build()?;
    hub.register_rpc("echo", |params| async move { Ok(params) });
    hub.register_rpc("sum", sum);
    let stats_hub = hub.clone();
    hub.register_rpc("stats", move |_| {
        let hub = stats_hub.clone();
        async move {
            Ok(json!({
                "connections": hub.connection_count(),
                "rooms": hub.room_count(),
                "online": hub.online_users(),
                "heartbeat": hub.heartbeat().stats(),
            }))
        }
    });

    let who_hub = hub.clone();
    hub.register_rpc("who", move |params: Value| {
        let hub = who_hub.clone();
        async move {
            let room = params["room"].as_str().unwrap_or("lobby");
            Ok(json!(hub.room_presence(room)))
        }
    });

    println!("💬 Chat hub running on ws://127.0.0.1:9000/?user_id=<name>");
    println!(r#"📨 Try: {{"type":"room_message","room":"lobby","data":{{"text":"hi"}}}}"#);
    println!(r#"🧮 Try: {{"type":"rpc","id":"1","data":{{"method":"sum","params":[1,2,3]}}}}"#);

    let server = Server::new(hub.clone());
    tokio::select! {
        result = server.listen("127.0.0.1:9000") => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
            hub.shutdown();
        }
    }

    Ok(())
}
