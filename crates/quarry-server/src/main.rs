#[tokio::main]
async fn main() -> anyhow::Result<()> {
    quarry_server::serve().await
}
