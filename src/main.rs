use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    cdpctl::cli::run().await
}
