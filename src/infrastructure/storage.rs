use anyhow::{Context, bail};
use aws_sdk_s3::config::Region;
use std::sync::Arc;
use tracing::info;

use crate::config::IntakeConfig;
use crate::services::storage::{BlobStore, LocalBlobStore, MemoryBlobStore, S3BlobStore};

/// Builds the blob store named by `STORAGE_BACKEND`.
pub async fn setup_blob_store(config: &IntakeConfig) -> anyhow::Result<Arc<dyn BlobStore>> {
    match config.storage_backend.as_str() {
        "memory" => {
            info!("🧠 In-memory blob store (contents are lost on restart)");
            Ok(Arc::new(MemoryBlobStore::new()))
        }
        "local" => {
            info!("💾 Local blob store at {}", config.local_storage_path);
            tokio::fs::create_dir_all(&config.local_storage_path)
                .await
                .with_context(|| format!("creating {}", config.local_storage_path))?;
            Ok(Arc::new(LocalBlobStore::new(&config.local_storage_path)))
        }
        "s3" => Ok(Arc::new(setup_s3(config).await?)),
        other => bail!("unknown STORAGE_BACKEND '{}' (expected memory, local or s3)", other),
    }
}

async fn setup_s3(config: &IntakeConfig) -> anyhow::Result<S3BlobStore> {
    let endpoint_url = config
        .minio_endpoint
        .clone()
        .context("MINIO_ENDPOINT must be set")?;
    let access_key = config
        .minio_access_key
        .clone()
        .context("MINIO_ACCESS_KEY must be set")?;
    let secret_key = config
        .minio_secret_key
        .clone()
        .context("MINIO_SECRET_KEY must be set")?;
    let bucket = config
        .minio_bucket
        .clone()
        .context("MINIO_BUCKET must be set")?;

    info!("☁️  S3 Storage: {} (Bucket: {})", endpoint_url, bucket);

    let aws_config = aws_config::from_env()
        .endpoint_url(&endpoint_url)
        .region(Region::new("us-east-1"))
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            access_key, secret_key, None, None, "static",
        ))
        .load()
        .await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(true)
        .build();
    let client = aws_sdk_s3::Client::from_conf(s3_config);

    if client.head_bucket().bucket(&bucket).send().await.is_err() {
        info!("🪣 Bucket '{}' not found, creating...", bucket);
        client
            .create_bucket()
            .bucket(&bucket)
            .send()
            .await
            .with_context(|| format!("creating bucket '{}'", bucket))?;
    }
    info!("✅ Bucket '{}' is ready", bucket);

    Ok(S3BlobStore::new(client, bucket))
}
