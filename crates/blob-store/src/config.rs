//! Cloud connection configuration.
//!
//! The plugin host hands configuration over as a flat string map; this
//! module turns it into a validated [`CloudConfig`].

use std::collections::HashMap;

use crate::error::{BlobError, BlobResult};

/// Smallest multipart chunk the providers accept (5 MiB).
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Providers cap multipart uploads at 10,000 parts.
const MAX_PARTS: u64 = 10_000;

// Configuration map keys.
const PROVIDER: &str = "provider";
const BUCKET: &str = "bucket";
const REGION: &str = "region";
const PREFIX: &str = "prefix";
const BACKUP_PATH_PREFIX: &str = "backupPathPrefix";
const MULTI_PART_CHUNK_SIZE: &str = "multiPartChunkSize";
const S3_URL: &str = "s3Url";
const S3_FORCE_PATH_STYLE: &str = "s3ForcePathStyle";
const DISABLE_SSL: &str = "DisableSSL";
const INSECURE_SKIP_TLS_VERIFY: &str = "insecureSkipTLSVerify";
const S3_PROFILE: &str = "profile";
const CA_CERT: &str = "caCert";

/// Supported cloud providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Aws,
    Gcp,
}

impl Provider {
    fn parse(value: &str) -> BlobResult<Self> {
        match value {
            "aws" => Ok(Provider::Aws),
            "gcp" => Ok(Provider::Gcp),
            other => Err(BlobError::config(format!(
                "provider '{}' is not supported",
                other
            ))),
        }
    }
}

/// Validated cloud connection options.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub provider: Provider,
    pub bucket: String,
    /// Required for AWS, optional otherwise.
    pub region: Option<String>,
    /// File-name prefix used in remote object names.
    pub prefix: String,
    /// Directory prefix prepended to every remote path.
    pub backup_path_prefix: Option<String>,
    /// Configured multipart chunk size; 0 means "derive from total size".
    pub part_size: u64,
    /// Alternate S3 endpoint (MinIO and friends).
    pub s3_url: Option<String>,
    pub s3_force_path_style: bool,
    pub disable_ssl: bool,
    pub insecure_skip_tls_verify: bool,
    /// Credential profile, resolved through the ambient AWS environment.
    pub profile: Option<String>,
    /// Decoded CA bundle for a private endpoint.
    pub ca_cert: Option<Vec<u8>>,
}

impl CloudConfig {
    /// Parse and validate the host's configuration map.
    pub fn from_map(config: &HashMap<String, String>) -> BlobResult<Self> {
        let provider = config
            .get(PROVIDER)
            .ok_or_else(|| BlobError::config("failed to get provider name"))?;
        let provider = Provider::parse(provider)?;

        let bucket = config
            .get(BUCKET)
            .ok_or_else(|| BlobError::config("failed to get bucket name"))?
            .clone();

        let region = config.get(REGION).cloned();
        if provider == Provider::Aws && region.is_none() {
            return Err(BlobError::config("no region provided for AWS"));
        }

        let part_size = match config.get(MULTI_PART_CHUNK_SIZE) {
            None => 0,
            Some(raw) => {
                let size = parse_quantity(raw)?;
                if size < MIN_PART_SIZE {
                    return Err(BlobError::config(format!(
                        "multiPartChunkSize should be more than {}",
                        MIN_PART_SIZE
                    )));
                }
                size
            }
        };

        let ca_cert = match config.get(CA_CERT) {
            Some(raw) if !raw.is_empty() => {
                use base64::Engine as _;
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(raw)
                    .map_err(|_| BlobError::config("invalid caCert value"))?;
                Some(decoded)
            }
            _ => None,
        };

        Ok(CloudConfig {
            provider,
            bucket,
            region,
            prefix: config.get(PREFIX).cloned().unwrap_or_default(),
            backup_path_prefix: config
                .get(BACKUP_PATH_PREFIX)
                .filter(|p| !p.is_empty())
                .cloned(),
            part_size,
            s3_url: config.get(S3_URL).cloned(),
            s3_force_path_style: parse_bool(config, S3_FORCE_PATH_STYLE)?,
            disable_ssl: parse_bool(config, DISABLE_SSL)?,
            insecure_skip_tls_verify: parse_bool(config, INSECURE_SKIP_TLS_VERIFY)?,
            profile: config.get(S3_PROFILE).cloned(),
            ca_cert,
        })
    }
}

fn parse_bool(config: &HashMap<String, String>, key: &str) -> BlobResult<bool> {
    match config.get(key) {
        None => Ok(false),
        Some(raw) if raw.is_empty() => Ok(false),
        Some(raw) => raw.parse::<bool>().map_err(|_| {
            BlobError::config(format!("failed to parse {} (expected format bool)", key))
        }),
    }
}

/// Part size to use for one upload: the configured size when set, otherwise
/// derived from the total object size so the part count stays under the
/// provider limit. The division rounds up; flooring it would leave the last
/// part short by one byte per remainder.
pub fn effective_part_size(configured: u64, total_size: u64) -> u64 {
    if configured != 0 {
        return configured;
    }
    std::cmp::max(MIN_PART_SIZE, total_size.div_ceil(MAX_PARTS) + 100)
}

/// Parse a Kubernetes-style quantity (`5242880`, `5Mi`, `100M`, `1Gi`).
pub fn parse_quantity(raw: &str) -> BlobResult<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(BlobError::config("empty quantity"));
    }

    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, suffix) = raw.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| BlobError::config(format!("failed to parse '{}'", raw)))?;

    let multiplier: u64 = match suffix {
        "" => 1,
        "k" | "K" => 1000,
        "M" => 1000 * 1000,
        "G" => 1000 * 1000 * 1000,
        "Ki" => 1024,
        "Mi" => 1024 * 1024,
        "Gi" => 1024 * 1024 * 1024,
        _ => return Err(BlobError::config(format!("failed to parse '{}'", raw))),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| BlobError::config(format!("quantity '{}' overflows", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("provider".to_string(), "aws".to_string());
        m.insert("bucket".to_string(), "velero".to_string());
        m.insert("region".to_string(), "us-east-1".to_string());
        m
    }

    #[test]
    fn parses_minimal_aws_config() {
        let cfg = CloudConfig::from_map(&base_config()).unwrap();
        assert_eq!(cfg.provider, Provider::Aws);
        assert_eq!(cfg.bucket, "velero");
        assert_eq!(cfg.part_size, 0);
        assert!(cfg.backup_path_prefix.is_none());
    }

    #[test]
    fn unknown_provider_fails() {
        let mut m = base_config();
        m.insert("provider".to_string(), "azure".to_string());
        assert!(CloudConfig::from_map(&m).is_err());
    }

    #[test]
    fn aws_without_region_fails() {
        let mut m = base_config();
        m.remove("region");
        assert!(CloudConfig::from_map(&m).is_err());
    }

    #[test]
    fn gcp_without_region_is_fine() {
        let mut m = base_config();
        m.insert("provider".to_string(), "gcp".to_string());
        m.remove("region");
        let cfg = CloudConfig::from_map(&m).unwrap();
        assert_eq!(cfg.provider, Provider::Gcp);
    }

    #[test]
    fn chunk_size_below_minimum_fails() {
        let mut m = base_config();
        m.insert("multiPartChunkSize".to_string(), "1Mi".to_string());
        assert!(CloudConfig::from_map(&m).is_err());
    }

    #[test]
    fn chunk_size_accepts_quantities() {
        let mut m = base_config();
        m.insert("multiPartChunkSize".to_string(), "10Mi".to_string());
        let cfg = CloudConfig::from_map(&m).unwrap();
        assert_eq!(cfg.part_size, 10 * 1024 * 1024);
    }

    #[test]
    fn malformed_ca_cert_fails() {
        let mut m = base_config();
        m.insert("caCert".to_string(), "!!not-base64!!".to_string());
        assert!(CloudConfig::from_map(&m).is_err());
    }

    #[test]
    fn quantity_suffixes() {
        assert_eq!(parse_quantity("5242880").unwrap(), 5242880);
        assert_eq!(parse_quantity("5Mi").unwrap(), 5 * 1024 * 1024);
        assert_eq!(parse_quantity("100M").unwrap(), 100_000_000);
        assert_eq!(parse_quantity("1Gi").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_quantity("2k").unwrap(), 2000);
        assert!(parse_quantity("five").is_err());
        assert!(parse_quantity("5Ti").is_err());
        assert!(parse_quantity("").is_err());
    }

    #[test]
    fn part_size_derivation() {
        // Configured size wins.
        assert_eq!(effective_part_size(8 * 1024 * 1024, 0), 8 * 1024 * 1024);
        // Small objects fall back to the provider minimum.
        assert_eq!(effective_part_size(0, 1024), MIN_PART_SIZE);
        // Large objects scale so the part count stays under 10,000.
        // 100 GiB / 10,000 = 10,737,418.24, rounded up, plus the slack.
        assert_eq!(effective_part_size(0, 100 * 1024 * 1024 * 1024), 10_737_519);
        // An exact multiple gets no rounding.
        assert_eq!(effective_part_size(0, 100_000_000_000), 10_000_100);
    }
}
