#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fitmusic_api::run().await
}
