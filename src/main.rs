use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use tensor_vault::catalog::tensor_catalog::TensorFilter;
use tensor_vault::config::{Backend, Cli, Command, Config};
use tensor_vault::{DType, ReadOptions, TensorId, TensorSpec, TensorVault};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "tensor_vault=debug"
    } else {
        "tensor_vault=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    // Load configuration. The CLI always works against durable storage.
    let mut config = Config::load(&cli.config)?;
    config.store.backend = Backend::Disk;

    info!(
        root = %config.store.root.display(),
        compress_at_rest = config.store.compress_at_rest,
        "tensor-vault v{}",
        env!("CARGO_PKG_VERSION")
    );

    let vault = TensorVault::open(config).await?;
    let code = run(&vault, cli.command).await?;
    vault.shutdown().await;
    Ok(code)
}

async fn run(vault: &TensorVault, command: Command) -> anyhow::Result<ExitCode> {
    let catalog = vault.catalog();
    match command {
        Command::Put {
            file,
            name,
            dtype,
            shape,
        } => {
            let dtype: DType = dtype.parse().map_err(anyhow::Error::msg)?;
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let id = vault
                .store_tensor(TensorSpec::new(name, dtype, shape), data)
                .await?;
            let descriptor = catalog.describe(id).await?;
            println!("{id}");
            if let Some(checksum) = descriptor.checksum {
                info!(tensor_id = %id, %checksum, bytes = descriptor.byte_size(), "Stored tensor");
            }
        }
        Command::Get { id, out, verify } => {
            let id: TensorId = id.parse()?;
            let data = catalog.read_with(id, ReadOptions { verify }).await?;
            tokio::fs::write(&out, data.to_bytes())
                .await
                .with_context(|| format!("writing {}", out.display()))?;
            info!(tensor_id = %id, out = %out.display(), chunks = data.chunks.len(), "Wrote tensor");
        }
        Command::Verify { id } => {
            let id: TensorId = id.parse()?;
            if catalog.verify(id).await? {
                println!("{id}: ok");
            } else {
                error!(tensor_id = %id, "Checksum mismatch");
                println!("{id}: CORRUPT");
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Delete { id } => {
            let id: TensorId = id.parse()?;
            catalog.delete(id).await?;
            println!("{id}: deleted");
        }
        Command::List => {
            for d in catalog.list(&TensorFilter::default()).await {
                let shape: Vec<String> = d.shape.iter().map(ToString::to_string).collect();
                println!(
                    "{}\t{}\t{}\t[{}]\t{}",
                    d.id,
                    d.name,
                    d.dtype,
                    shape.join(","),
                    d.checksum.map(|c| c.to_hex()).unwrap_or_default()
                );
            }
        }
        Command::Stats => {
            let stats = catalog.stats().await;
            let io = vault.store().stats();
            println!(
                "tensors: {} finalized ({} bytes), {} pending",
                stats.finalized, stats.finalized_bytes, stats.pending
            );
            println!(
                "store: {} chunks read, {} bytes read",
                io.chunks_read, io.bytes_read
            );
            print!("{}", vault.metrics().render()?);
        }
    }
    Ok(ExitCode::SUCCESS)
}
