#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    web3_index::import_pocket().await?;
    Ok(())
}
