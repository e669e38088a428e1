//! S3 storage backend.
//!
//! Objects live under `{prefix}{escaped module}/@v/{escaped version}.{ext}`.
//! `.info` is uploaded last and doubles as the completeness marker checked
//! by [`Backend::exists`].

use aws_sdk_s3::operation::get_object::GetObjectOutput;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::errors::{Error, Result};
use crate::module::{escape_path, unescape_path, ZipArchive};

use super::{validate_key, Backend};

/// High-level wrapper around the S3 bucket that holds module artifacts.
#[derive(Debug, Clone)]
pub struct S3Storage {
    pub client: Client,
    pub bucket: String,
    pub prefix: String,
}

impl S3Storage {
    pub fn new(client: Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix,
        }
    }

    fn version_prefix(&self, module: &str) -> String {
        format!("{}{}/@v/", self.prefix, escape_path(module))
    }

    fn object_key(&self, module: &str, version: &str, ext: &str) -> Result<String> {
        validate_key(module, version)?;
        Ok(format!(
            "{}{}.{ext}",
            self.version_prefix(module),
            escape_path(version)
        ))
    }

    async fn get_object(&self, module: &str, version: &str, key: &str) -> Result<GetObjectOutput> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => Ok(resp),
            Err(err) => {
                if err
                    .as_service_error()
                    .map_or(false, |e| e.is_no_such_key())
                {
                    return Err(Error::not_found(module, version));
                }
                Err(Error::Storage(format!("S3 GetObject {key}: {err}")))
            }
        }
    }

    async fn get(&self, module: &str, version: &str, ext: &str) -> Result<Bytes> {
        let key = self.object_key(module, version, ext)?;
        let resp = self.get_object(module, version, &key).await?;
        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| Error::Storage(format!("read S3 GetObject body {key}: {e}")))?
            .into_bytes();
        debug!(%key, bytes = bytes.len(), "object downloaded");
        Ok(bytes)
    }

    async fn put(&self, key: &str, body: ByteStream) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("S3 PutObject {key}: {e}")))?;
        Ok(())
    }

    /// List all object keys under a given prefix, following continuation
    /// tokens.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(ref token) = continuation_token {
                req = req.continuation_token(token);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| Error::Storage(format!("S3 ListObjectsV2 {prefix}: {e}")))?;

            for obj in resp.contents() {
                if let Some(k) = obj.key() {
                    keys.push(k.to_string());
                }
            }

            match resp.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }
}

/// Copy the archive to a temporary file so the upload streams from disk with
/// a known length.
async fn spool(zip: ZipArchive) -> Result<(tempfile::TempPath, u64)> {
    let storage_err = |e: std::io::Error| Error::Storage(format!("spool zip: {e}"));
    let tmp = tempfile::NamedTempFile::new()
        .map_err(storage_err)?
        .into_temp_path();
    let mut file = tokio::fs::File::create(&tmp).await.map_err(storage_err)?;
    let mut reader = zip.into_reader();
    let written = tokio::io::copy(&mut reader, &mut file)
        .await
        .map_err(storage_err)?;
    file.flush().await.map_err(storage_err)?;
    Ok((tmp, written))
}

#[async_trait::async_trait]
impl Backend for S3Storage {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list(&self, module: &str) -> Result<Vec<String>> {
        let prefix = self.version_prefix(module);
        let keys = self.list_keys(&prefix).await?;
        let mut versions: Vec<String> = keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|name| name.strip_suffix(".info"))
            .filter(|name| !name.contains('/'))
            .filter_map(unescape_path)
            .collect();
        versions.sort();
        Ok(versions)
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn exists(&self, module: &str, version: &str) -> Result<bool> {
        let key = self.object_key(module, version, "info")?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if err.as_service_error().map_or(false, |e| e.is_not_found()) {
                    Ok(false)
                } else {
                    Err(Error::Storage(format!("S3 HeadObject {key}: {err}")))
                }
            }
        }
    }

    async fn info(&self, module: &str, version: &str) -> Result<Bytes> {
        self.get(module, version, "info").await
    }

    async fn go_mod(&self, module: &str, version: &str) -> Result<Bytes> {
        self.get(module, version, "mod").await
    }

    async fn zip(&self, module: &str, version: &str) -> Result<ZipArchive> {
        let key = self.object_key(module, version, "zip")?;
        let resp = self.get_object(module, version, &key).await?;
        let size = resp.content_length().and_then(|n| u64::try_from(n).ok());
        let reader = Box::pin(resp.body.into_async_read());
        Ok(ZipArchive::new(Box::new(reader), size))
    }

    #[instrument(skip(self, go_mod, zip, info), fields(bucket = %self.bucket))]
    async fn save(
        &self,
        module: &str,
        version: &str,
        go_mod: Bytes,
        zip: ZipArchive,
        info: Bytes,
    ) -> Result<()> {
        let zip_key = self.object_key(module, version, "zip")?;
        let mod_key = self.object_key(module, version, "mod")?;
        let info_key = self.object_key(module, version, "info")?;

        let (spooled, zip_len) = spool(zip).await?;
        let body = ByteStream::from_path(&spooled)
            .await
            .map_err(|e| Error::Storage(format!("read spooled zip: {e}")))?;
        self.put(&zip_key, body).await?;
        self.put(&mod_key, ByteStream::from(go_mod)).await?;
        self.put(&info_key, ByteStream::from(info)).await?;

        debug!(zip_bytes = zip_len, "version uploaded to S3");
        Ok(())
    }
}
