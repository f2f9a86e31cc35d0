use anyhow::Result;
use aws_config::meta::region::RegionProviderChain;
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Region},
    Client as S3Client,
};

use crate::config::AppConfig;
use crate::storage::S3Storage;

pub async fn build_client(config: &AppConfig) -> Result<S3Client> {
    build_client_for_endpoint(config, config.aws_endpoint_url.as_deref()).await
}

async fn build_client_for_endpoint(config: &AppConfig, endpoint: Option<&str>) -> Result<S3Client> {
    let region = Region::new(config.aws_region.clone());
    let region_provider = RegionProviderChain::first_try(Some(region))
        .or_default_provider()
        .or_else("us-east-1");

    #[allow(deprecated)]
    let mut loader = aws_config::from_env().region(region_provider);

    if let Some(endpoint) = endpoint {
        loader = loader.endpoint_url(endpoint);
    }

    if let (Some(access_key), Some(secret_key)) = (
        config.aws_access_key_id.clone(),
        config.aws_secret_access_key.clone(),
    ) {
        let credentials = Credentials::new(access_key, secret_key, None, None, "static");
        loader = loader.credentials_provider(credentials);
    }

    let base_config = loader.load().await;
    let s3_config = S3ConfigBuilder::from(&base_config)
        .force_path_style(true)
        .build();

    Ok(S3Client::from_conf(s3_config))
}

/// Storage adapter with a separate presigning client when
/// `AWS_PRESIGN_ENDPOINT_URL` is set.
pub async fn build_storage(config: &AppConfig) -> Result<S3Storage> {
    let client = build_client(config).await?;
    let storage = match config.aws_presign_endpoint_url.as_deref() {
        Some(endpoint) => {
            let presign_client = build_client_for_endpoint(config, Some(endpoint)).await?;
            S3Storage::with_presign_client(client, presign_client, config.s3_bucket.clone())
        }
        None => S3Storage::new(client, config.s3_bucket.clone()),
    };
    Ok(storage)
}
