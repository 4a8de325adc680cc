use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::PatchvalConfig;
use crate::errors::PatchvalError;
use crate::models::{
    CandidatePatch, CheckSpec, ExploitPolarity, VulnerabilityRecord, EXPLOIT_CHECK, FUNCTIONAL_CHECK, RESET_CHECK,
};

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(alias = "cve_id", alias = "cve")]
    id: Option<String>,
    #[serde(alias = "image", alias = "image_name")]
    sandbox_image_ref: Option<String>,
    checks: Option<Vec<CheckSpec>>,
    reset: Option<String>,
    exploit_check: Option<String>,
    functional_check: Option<String>,
    exploit_polarity: Option<ExploitPolarity>,
    #[serde(alias = "work_dir")]
    workdir: Option<String>,
    patch_path: Option<String>,
    #[serde(alias = "programing_language", alias = "programming_language")]
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPatch {
    #[serde(alias = "cve", alias = "cve_id")]
    vulnerability_id: Option<String>,
    #[serde(alias = "fix_patch", alias = "patch")]
    patch_text: Option<String>,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

/// `registry/org/cve-2024-1234:latest` and `cve-2024-1234` both become
/// `CVE-2024-1234`. Anything that is not a CVE id is only trimmed.
pub fn normalize_id(raw: &str) -> String {
    let trimmed = raw.trim();
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    let bare = match last.split_once(':') {
        Some((name, _tag)) if !name.is_empty() => name,
        _ => last,
    };
    if bare.get(..4).is_some_and(|prefix| prefix.eq_ignore_ascii_case("cve-")) {
        bare.to_ascii_uppercase()
    } else if trimmed.contains('/') || trimmed.contains(':') {
        bare.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Load vulnerability records from a JSON array, JSONL or YAML list.
/// Malformed entries are skipped with a warning; duplicate ids keep the first.
pub async fn load_records(path: &Path, config: &PatchvalConfig) -> Result<Vec<VulnerabilityRecord>, PatchvalError> {
    let content = read_input(path).await?;
    let entries: Vec<RawRecord> = parse_entries(path, &content)?;

    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(entries.len());
    for (index, raw) in entries.into_iter().enumerate() {
        let Some(record) = build_record(raw, config, index) else {
            continue;
        };
        if !seen.insert(record.id.clone()) {
            warn!(vuln_id = %record.id, "Duplicate dataset record ignored");
            continue;
        }
        records.push(record);
    }

    info!(path = %path.display(), count = records.len(), "Loaded dataset");
    Ok(records)
}

fn build_record(raw: RawRecord, config: &PatchvalConfig, index: usize) -> Option<VulnerabilityRecord> {
    let Some(id) = raw.id.as_deref().map(normalize_id).filter(|id| !id.is_empty()) else {
        warn!(index, "Dataset record without an id skipped");
        return None;
    };

    let image = raw.sandbox_image_ref.filter(|s| !s.trim().is_empty()).or_else(|| {
        config
            .sandbox
            .image_template
            .as_ref()
            .map(|template| template.replace("{id}", &id.to_ascii_lowercase()))
    });
    let Some(sandbox_image_ref) = image else {
        warn!(vuln_id = %id, "Dataset record has no sandbox image and no image template is configured, skipped");
        return None;
    };

    let defaults = &config.checks;
    let mut default_exploit = false;
    let checks = match raw.checks {
        Some(checks) if !checks.is_empty() => checks,
        _ => {
            default_exploit = raw.exploit_check.is_none();
            let mut checks = vec![
                CheckSpec::new(RESET_CHECK, raw.reset.as_deref().unwrap_or(&defaults.reset)),
                CheckSpec::new(EXPLOIT_CHECK, raw.exploit_check.as_deref().unwrap_or(&defaults.exploit)),
            ];
            if let Some(functional) = raw.functional_check.as_deref().or(defaults.functional.as_deref()) {
                checks.push(CheckSpec::new(FUNCTIONAL_CHECK, functional));
            }
            checks
        }
    };
    if !checks.iter().any(|c| c.name == EXPLOIT_CHECK) {
        warn!(vuln_id = %id, "Dataset record defines no exploit check, skipped");
        return None;
    }

    let exploit_polarity = raw.exploit_polarity.unwrap_or(if default_exploit {
        defaults.exploit_command_polarity
    } else {
        defaults.exploit_polarity
    });

    Some(VulnerabilityRecord {
        id,
        sandbox_image_ref,
        checks,
        exploit_polarity,
        workdir: raw.workdir.unwrap_or_else(|| config.sandbox.workdir.clone()),
        patch_path: raw.patch_path.unwrap_or_else(|| config.sandbox.patch_path.clone()),
        language: raw.language,
    })
}

/// Load candidate patches from a JSON array or JSONL file. Records without
/// an id are skipped with a warning.
pub async fn load_patches(path: &Path) -> Result<Vec<CandidatePatch>, PatchvalError> {
    let content = read_input(path).await?;
    let entries: Vec<RawPatch> = parse_entries(path, &content)?;

    let mut patches = Vec::with_capacity(entries.len());
    for (index, raw) in entries.into_iter().enumerate() {
        let Some(id) = raw.vulnerability_id.as_deref().map(normalize_id).filter(|id| !id.is_empty()) else {
            warn!(index, "Patch record without a vulnerability id skipped");
            continue;
        };
        patches.push(CandidatePatch {
            vulnerability_id: id,
            patch_text: raw.patch_text,
            input_tokens: raw.input_tokens,
            output_tokens: raw.output_tokens,
        });
    }

    info!(path = %path.display(), count = patches.len(), "Loaded candidate patches");
    Ok(patches)
}

/// Every `<id>.patch` file in `dir`, in id order.
pub async fn load_patch_dir(dir: &Path) -> Result<Vec<CandidatePatch>, PatchvalError> {
    if !dir.is_dir() {
        return Err(PatchvalError::InvalidInput(format!("patch directory not found: {}", dir.display())));
    }
    let pattern = dir.join("*.patch");
    let paths = glob::glob(&pattern.to_string_lossy())
        .map_err(|e| PatchvalError::InvalidInput(format!("bad patch directory pattern: {}", e)))?;

    let mut patches = Vec::new();
    for entry in paths {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "Unreadable patch directory entry skipped");
                continue;
            }
        };
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let text = tokio::fs::read_to_string(&path).await?;
        debug!(path = %path.display(), "Loaded patch file");
        patches.push(CandidatePatch::new(&normalize_id(stem), Some(&text)));
    }
    patches.sort_by(|a, b| a.vulnerability_id.cmp(&b.vulnerability_id));

    info!(dir = %dir.display(), count = patches.len(), "Loaded patch directory");
    Ok(patches)
}

/// Patches from a file take precedence over same-id patches from a directory.
pub fn merge_patches(primary: Vec<CandidatePatch>, secondary: Vec<CandidatePatch>) -> Vec<CandidatePatch> {
    let known: HashSet<String> = primary.iter().map(|p| p.vulnerability_id.clone()).collect();
    let mut merged = primary;
    merged.extend(secondary.into_iter().filter(|p| !known.contains(&p.vulnerability_id)));
    merged
}

pub fn build_registry(records: Vec<VulnerabilityRecord>) -> HashMap<String, Arc<VulnerabilityRecord>> {
    records.into_iter().map(|r| (r.id.clone(), Arc::new(r))).collect()
}

/// Id to sandbox image reference, for reports.
pub fn image_names(registry: &HashMap<String, Arc<VulnerabilityRecord>>) -> HashMap<String, String> {
    registry
        .iter()
        .map(|(id, record)| (id.clone(), record.sandbox_image_ref.clone()))
        .collect()
}

async fn read_input(path: &Path) -> Result<String, PatchvalError> {
    if !path.exists() {
        return Err(PatchvalError::InvalidInput(format!("input file not found: {}", path.display())));
    }
    Ok(tokio::fs::read_to_string(path).await?)
}

/// Parse a list of entries, skipping the ones that do not deserialize.
fn parse_entries<T: DeserializeOwned>(path: &Path, content: &str) -> Result<Vec<T>, PatchvalError> {
    let values = parse_values(path, content)?;
    let mut entries = Vec::with_capacity(values.len());
    for (index, value) in values.into_iter().enumerate() {
        match serde_json::from_value::<T>(value) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(path = %path.display(), index, error = %e, "Malformed entry skipped"),
        }
    }
    Ok(entries)
}

fn parse_values(path: &Path, content: &str) -> Result<Vec<Value>, PatchvalError> {
    let invalid = |e: String| PatchvalError::InvalidInput(format!("{}: {}", path.display(), e));
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase();

    if extension == "yaml" || extension == "yml" {
        return serde_yaml::from_str::<Vec<Value>>(content).map_err(|e| invalid(e.to_string()));
    }

    let trimmed = content.trim_start();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str::<Vec<Value>>(content).map_err(|e| invalid(e.to_string()));
    }

    let mut values = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => values.push(value),
            Err(e) => warn!(path = %path.display(), line = line_no + 1, error = %e, "Malformed JSONL line skipped"),
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_id() {
        assert_eq!(normalize_id("ghcr.io/org/cve-2024-1234:latest"), "CVE-2024-1234");
        assert_eq!(normalize_id("cve-2023-0256"), "CVE-2023-0256");
        assert_eq!(normalize_id(" CVE-2023-0256 "), "CVE-2023-0256");
        assert_eq!(normalize_id("GHSA-xxxx-yyyy"), "GHSA-xxxx-yyyy");
        assert_eq!(normalize_id("registry/app-bug-7:v2"), "app-bug-7");
    }

    #[tokio::test]
    async fn test_load_records_with_aliases_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        std::fs::write(
            &path,
            r#"[
                {"cve_id": "CVE-2024-0001", "image_name": "ghcr.io/x/cve-2024-0001:latest", "programing_language": "Python"},
                {"cve": "CVE-2024-0002", "image": "img2", "work_dir": "/src", "exploit_polarity": "nonzero_blocks",
                 "checks": [{"name": "exploit_check", "command": "bash poc.sh"}]},
                {"image": "no-id"},
                {"id": "CVE-2024-0001", "image": "duplicate"},
                {"id": "CVE-2024-0003"}
            ]"#,
        )
        .unwrap();

        let config = PatchvalConfig::default();
        let records = load_records(&path, &config).await.unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.id, "CVE-2024-0001");
        assert_eq!(first.sandbox_image_ref, "ghcr.io/x/cve-2024-0001:latest");
        assert_eq!(first.language.as_deref(), Some("Python"));
        assert_eq!(first.check(RESET_CHECK).unwrap().command, "bash prepare.sh");
        assert_eq!(first.exploit_polarity, ExploitPolarity::ZeroBlocks);
        assert!(first.check(FUNCTIONAL_CHECK).unwrap().command.contains("unit_test.sh"));
        assert_eq!(first.workdir, "/workspace");

        let second = &records[1];
        assert_eq!(second.workdir, "/src");
        assert_eq!(second.exploit_polarity, ExploitPolarity::NonzeroBlocks);
        assert!(second.check(RESET_CHECK).is_none());
    }

    #[tokio::test]
    async fn test_own_exploit_check_defaults_to_nonzero_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        std::fs::write(
            &path,
            r#"[
                {"id": "V1", "image": "img", "checks": [{"name": "exploit_check", "command": "bash poc.sh"}]},
                {"id": "V2", "image": "img", "exploit_check": "bash poc.sh"},
                {"id": "V3", "image": "img"}
            ]"#,
        )
        .unwrap();

        let records = load_records(&path, &PatchvalConfig::default()).await.unwrap();
        assert_eq!(records[0].exploit_polarity, ExploitPolarity::NonzeroBlocks);
        assert!(records[0].exploit_polarity.is_blocked(1));
        assert!(!records[0].exploit_polarity.is_blocked(0));
        assert_eq!(records[1].exploit_polarity, ExploitPolarity::NonzeroBlocks);
        assert_eq!(records[2].exploit_polarity, ExploitPolarity::ZeroBlocks);
    }

    #[tokio::test]
    async fn test_configured_polarity_applies_to_own_checks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        std::fs::write(&path, r#"[{"id": "V1", "image": "img", "exploit_check": "bash check.sh"}]"#).unwrap();

        let mut config = PatchvalConfig::default();
        config.checks.exploit_polarity = ExploitPolarity::ZeroBlocks;
        let records = load_records(&path, &config).await.unwrap();
        assert_eq!(records[0].exploit_polarity, ExploitPolarity::ZeroBlocks);
    }

    #[tokio::test]
    async fn test_image_template_fills_missing_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.yaml");
        std::fs::write(&path, "- id: CVE-2024-0009\n  language: Go\n").unwrap();

        let mut config = PatchvalConfig::default();
        config.sandbox.image_template = Some("registry/bench/{id}:latest".into());
        let records = load_records(&path, &config).await.unwrap();
        assert_eq!(records[0].sandbox_image_ref, "registry/bench/cve-2024-0009:latest");
    }

    #[tokio::test]
    async fn test_load_patches_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patches.jsonl");
        std::fs::write(
            &path,
            concat!(
                "{\"cve\": \"ghcr.io/x/cve-2024-0001:latest\", \"fix_patch\": \"--- a/x\\n\", \"input_tokens\": 10}\n",
                "not json\n",
                "{\"patch\": \"orphan\"}\n",
                "{\"vulnerability_id\": \"CVE-2024-0002\"}\n",
            ),
        )
        .unwrap();

        let patches = load_patches(&path).await.unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].vulnerability_id, "CVE-2024-0001");
        assert_eq!(patches[0].input_tokens, Some(10));
        assert!(patches[1].is_empty());
    }

    #[tokio::test]
    async fn test_patch_dir_and_merge() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("CVE-2024-0002.patch"), "from dir").unwrap();
        std::fs::write(dir.path().join("CVE-2024-0001.patch"), "from dir").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let from_dir = load_patch_dir(dir.path()).await.unwrap();
        assert_eq!(from_dir.len(), 2);
        assert_eq!(from_dir[0].vulnerability_id, "CVE-2024-0001");

        let from_file = vec![CandidatePatch::new("CVE-2024-0002", Some("from file"))];
        let merged = merge_patches(from_file, from_dir);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].patch_text.as_deref(), Some("from file"));
        assert_eq!(merged[1].vulnerability_id, "CVE-2024-0001");
    }

    #[tokio::test]
    async fn test_missing_input_is_invalid() {
        let err = load_patches(Path::new("/nonexistent/patches.json")).await.unwrap_err();
        assert!(matches!(err, PatchvalError::InvalidInput(_)));
    }
}
