use crate::config::validator::validate_quota;
use crate::errors::{LimiterError, Result};
use crate::quota::Quota;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Load quota definitions from a JSON file.
///
/// The file holds a JSON array of quota records. Every record is validated
/// and ids must be unique; a single bad record rejects the whole file.
pub async fn load_quota_file<P: AsRef<Path>>(path: P) -> Result<Vec<Quota>> {
    let path = path.as_ref();
    info!("Loading quota definitions from: {}", path.display());

    let contents = tokio::fs::read_to_string(path).await?;
    let quotas = parse_quotas(&contents)?;

    info!("Quota definitions loaded and validated successfully");
    log_quota_summary(&quotas);

    Ok(quotas)
}

/// Parse and validate the contents of a quota file.
pub fn parse_quotas(contents: &str) -> Result<Vec<Quota>> {
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }

    let quotas: Vec<Quota> = serde_json::from_str(contents)?;

    let mut seen = HashSet::new();
    for quota in &quotas {
        validate_quota(quota)?;
        if !seen.insert(quota.id.as_str()) {
            return Err(LimiterError::InvalidConfig(format!(
                "duplicate quota id '{}' in quota file",
                quota.id
            )));
        }
    }

    Ok(quotas)
}

/// Write quota definitions, replacing the file atomically.
pub async fn write_quota_file<P: AsRef<Path>>(path: P, quotas: &[Quota]) -> Result<()> {
    let path = path.as_ref();
    let body = serde_json::to_vec_pretty(quotas)?;

    let tmp = temp_sibling(path);
    tokio::fs::write(&tmp, &body).await?;
    tokio::fs::rename(&tmp, path).await?;

    debug!("Persisted {} quota definitions to {}", quotas.len(), path.display());
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "quotas.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

fn log_quota_summary(quotas: &[Quota]) {
    debug!("=== Quota Summary ===");
    debug!("Quotas: {}", quotas.len());

    for quota in quotas {
        debug!(
            "  - {} ({}): capacity {}, refill {:.2}/s, leak {:?}/s, burst {:?}, enabled {}",
            quota.id,
            quota.algo,
            quota.capacity,
            quota.refill_rate,
            quota.leak_rate,
            quota.burst,
            quota.enabled
        );
    }
    debug!("=====================");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_records() {
        let quotas = parse_quotas(
            r#"[
                {"id": "search", "capacity": 10, "refill_rate": 2.5},
                {"id": "ingest", "algo": "leaky_bucket", "capacity": 5, "leak_rate": 1.0}
            ]"#,
        )
        .unwrap();

        assert_eq!(quotas.len(), 2);
        assert_eq!(quotas[0].algo, "token_bucket");
        assert_eq!(quotas[1].leak_rate, Some(1.0));
    }

    #[test]
    fn test_parse_rejects_duplicates() {
        let err = parse_quotas(r#"[{"id": "a"}, {"id": "a"}]"#).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_parse_rejects_invalid_record() {
        assert!(parse_quotas(r#"[{"id": "a", "capacity": -1}]"#).is_err());
        assert!(matches!(
            parse_quotas("{not json"),
            Err(LimiterError::JsonError(_))
        ));
    }

    #[test]
    fn test_empty_file_is_no_quotas() {
        assert!(parse_quotas("  \n").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quotas.json");
        let quotas = parse_quotas(r#"[{"id": "search", "capacity": 3}]"#).unwrap();

        write_quota_file(&path, &quotas).await.unwrap();
        let loaded = load_quota_file(&path).await.unwrap();

        assert_eq!(loaded, quotas);
        assert!(!temp_sibling(&path).exists());
    }
}
