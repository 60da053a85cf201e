//! VeraNode prover server

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    veranode_prover::server::run().await
}
