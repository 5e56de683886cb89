//! `pypi-proxy` binary

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    pypi_proxy::cli::run().await
}
