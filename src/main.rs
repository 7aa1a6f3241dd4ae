#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chainlock_lib::run().await
}
