use bytes::Bytes;
use rtdb_client::subscription::SubscriptionStrategy;
use rtdb_client::{ClientConfig, Connection, Row};

#[derive(Row, Debug, Clone, Default)]
struct Message {
    #[rtdb(primary_key)]
    id: u64,
    sender: String,
    text: String,
}

#[tokio::main]
async fn main() -> rtdb_client::Result<()> {
    env_logger::Builder::new().parse_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ClientConfig::builder("ws://localhost:3000", "quickstart_chat").build()?;
    let conn = Connection::connect(config).await?;

    let table = conn.register_table("message", Message::table_schema());
    table.on_insert(|ctx, row| {
        log::info!("row inserted at {:?}: {row:?}", ctx.received_at);
    });

    conn.subscribe(vec!["SELECT * FROM message".into()], SubscriptionStrategy::Adaptive).await?;

    conn.call_reducer("send_message", Bytes::from_static(b"hello from rtdb_client")).await?;

    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    log::info!("message table now has {} rows", table.count());

    conn.close().await?;
    Ok(())
}
