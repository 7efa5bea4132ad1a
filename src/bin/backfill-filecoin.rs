#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    web3_index::backfill_filecoin().await?;
    Ok(())
}
