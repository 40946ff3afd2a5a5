//! Generation orchestrator - entry point.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    orchestrator::run().await
}
