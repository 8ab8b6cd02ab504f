#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fitmusic_scorer::run().await
}
