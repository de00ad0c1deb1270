#[tokio::main]
async fn main() -> eyre::Result<()> {
    ipnq::run().start().await
}
