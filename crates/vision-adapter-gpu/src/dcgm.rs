//! DCGM (Data Center GPU Manager) backend
//!
//! Reads the Prometheus exposition served by `dcgm-exporter`, which publishes
//! DCGM field values per GPU with the field name as the metric name.

use crate::{GpuError, Result};

use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use vision_core::types::{epoch_seconds, TelemetrySample};

/// DCGM field names published by dcgm-exporter
pub mod fields {
    pub const GPU_UTIL: &str = "DCGM_FI_DEV_GPU_UTIL";
    pub const MEM_COPY_UTIL: &str = "DCGM_FI_DEV_MEM_COPY_UTIL";
    pub const FB_USED: &str = "DCGM_FI_DEV_FB_USED";
    pub const FB_FREE: &str = "DCGM_FI_DEV_FB_FREE";
    pub const FB_RESERVED: &str = "DCGM_FI_DEV_FB_RESERVED";
    pub const FB_TOTAL: &str = "DCGM_FI_DEV_FB_TOTAL";
    pub const POWER_USAGE: &str = "DCGM_FI_DEV_POWER_USAGE";
    pub const POWER_MGMT_LIMIT: &str = "DCGM_FI_DEV_POWER_MGMT_LIMIT";
    pub const ENFORCED_POWER_LIMIT: &str = "DCGM_FI_DEV_ENFORCED_POWER_LIMIT";
    pub const GPU_TEMP: &str = "DCGM_FI_DEV_GPU_TEMP";
}

/// Field values of one GPU from one scrape
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DcgmFieldSet {
    /// Field name to value
    pub values: HashMap<String, f64>,

    /// `modelName` label, when the exporter publishes it
    pub model_name: Option<String>,
}

impl DcgmFieldSet {
    fn get(&self, field: &str) -> Option<f64> {
        self.values.get(field).copied()
    }

    /// Map DCGM fields onto the normalized sample
    pub fn to_sample(&self, timestamp: f64) -> Result<TelemetrySample> {
        let gpu_util = self
            .get(fields::GPU_UTIL)
            .ok_or_else(|| GpuError::GpuNotFound(format!("{} missing from scrape", fields::GPU_UTIL)))?;

        let used = self.get(fields::FB_USED).unwrap_or(0.0);
        let total = match self.get(fields::FB_TOTAL) {
            Some(total) => total,
            None => {
                let free = self.get(fields::FB_FREE).unwrap_or(0.0);
                let reserved = self.get(fields::FB_RESERVED).unwrap_or(0.0);
                if free > 0.0 {
                    used + free + reserved
                } else {
                    0.0
                }
            }
        };

        let power_limit = self
            .get(fields::ENFORCED_POWER_LIMIT)
            .or_else(|| self.get(fields::POWER_MGMT_LIMIT))
            .unwrap_or(0.0);

        Ok(TelemetrySample {
            gpu_util_pct: gpu_util,
            mem_util_pct: self.get(fields::MEM_COPY_UTIL).unwrap_or(0.0),
            memory_used_mb: used,
            memory_total_mb: total,
            power_w: self.get(fields::POWER_USAGE).unwrap_or(0.0),
            power_limit_w: power_limit,
            temperature_c: self.get(fields::GPU_TEMP).unwrap_or(0.0),
            timestamp,
        }
        .normalized())
    }
}

/// Primary-tier source scraping a dcgm-exporter endpoint
#[derive(Debug, Clone)]
pub struct DcgmSource {
    client: reqwest::Client,
    endpoint: String,
    gpu_index: u32,
    device_name: String,
}

impl DcgmSource {
    /// Connect to the exporter and confirm it publishes fields for `gpu_index`
    pub async fn probe(endpoint: &str, gpu_index: u32, timeout: Duration) -> Result<Self> {
        debug!("Probing DCGM exporter at {}", endpoint);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GpuError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;

        let body = fetch(&client, endpoint)
            .await
            .map_err(|e| GpuError::Unavailable(format!("DCGM exporter at {} unreachable: {}", endpoint, e)))?;

        let field_set = parse_exposition(&body, gpu_index);
        if field_set.get(fields::GPU_UTIL).is_none() {
            return Err(GpuError::GpuNotFound(format!(
                "DCGM exporter at {} publishes no fields for GPU {}",
                endpoint, gpu_index
            )));
        }

        let device_name = field_set
            .model_name
            .clone()
            .unwrap_or_else(|| format!("GPU {}", gpu_index));

        info!("DCGM exporter bound at {} for {}", endpoint, device_name);

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            gpu_index,
            device_name,
        })
    }

    /// Take one reading
    pub async fn read(&self) -> Result<TelemetrySample> {
        let body = fetch(&self.client, &self.endpoint)
            .await
            .map_err(|e| GpuError::Read(format!("DCGM scrape failed: {}", e)))?;
        let timestamp = epoch_seconds();
        parse_exposition(&body, self.gpu_index).to_sample(timestamp)
    }

    /// Device identifier reported for this source
    pub fn device_id(&self) -> &str {
        &self.device_name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

async fn fetch(client: &reqwest::Client, endpoint: &str) -> Result<String> {
    let response = client.get(endpoint).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(GpuError::DcgmError(format!("exporter answered {}", status)));
    }
    Ok(response.text().await?)
}

/// Extract the field values of one GPU from Prometheus text exposition.
///
/// Samples without a `gpu` label, comments and unparsable lines are skipped.
pub fn parse_exposition(body: &str, gpu_index: u32) -> DcgmFieldSet {
    let wanted = gpu_index.to_string();
    let mut field_set = DcgmFieldSet::default();

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((name, labels, value)) = split_sample(line) else {
            continue;
        };
        if !name.starts_with("DCGM_FI_") {
            continue;
        }
        if labels.get("gpu").map(String::as_str) != Some(wanted.as_str()) {
            continue;
        }

        if field_set.model_name.is_none() {
            field_set.model_name = labels.get("modelName").cloned();
        }
        field_set.values.insert(name.to_string(), value);
    }

    field_set
}

fn split_sample(line: &str) -> Option<(&str, HashMap<String, String>, f64)> {
    let (name, rest) = match line.find('{') {
        Some(open) => {
            let close = line.rfind('}')?;
            if close < open {
                return None;
            }
            let labels = parse_labels(&line[open + 1..close]);
            (&line[..open], (labels, &line[close + 1..]))
        }
        None => {
            let split = line.find(char::is_whitespace)?;
            (&line[..split], (HashMap::new(), &line[split..]))
        }
    };

    let (labels, tail) = rest;
    // An optional timestamp may follow the value.
    let value = tail.split_whitespace().next()?.parse::<f64>().ok()?;
    Some((name.trim(), labels, value))
}

fn parse_labels(raw: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    let mut chars = raw.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }

        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }
        if chars.next() != Some('"') {
            break;
        }

        let mut value = String::new();
        let mut escaped = false;
        for c in chars.by_ref() {
            match (escaped, c) {
                (true, 'n') => {
                    value.push('\n');
                    escaped = false;
                }
                (true, other) => {
                    value.push(other);
                    escaped = false;
                }
                (false, '\\') => escaped = true,
                (false, '"') => break,
                (false, other) => value.push(other),
            }
        }

        labels.insert(key.trim().to_string(), value);
    }

    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPOSITION: &str = r#"# HELP DCGM_FI_DEV_GPU_UTIL GPU utilization (in %).
# TYPE DCGM_FI_DEV_GPU_UTIL gauge
DCGM_FI_DEV_GPU_UTIL{gpu="0",UUID="GPU-aaaa",device="nvidia0",modelName="NVIDIA A10G",Hostname="node-1"} 37
DCGM_FI_DEV_GPU_UTIL{gpu="1",UUID="GPU-bbbb",device="nvidia1",modelName="NVIDIA A10G",Hostname="node-1"} 91
DCGM_FI_DEV_MEM_COPY_UTIL{gpu="0",UUID="GPU-aaaa",device="nvidia0",modelName="NVIDIA A10G",Hostname="node-1"} 12
DCGM_FI_DEV_FB_USED{gpu="0",UUID="GPU-aaaa",device="nvidia0",modelName="NVIDIA A10G",Hostname="node-1"} 2048
DCGM_FI_DEV_FB_FREE{gpu="0",UUID="GPU-aaaa",device="nvidia0",modelName="NVIDIA A10G",Hostname="node-1"} 20480
DCGM_FI_DEV_FB_RESERVED{gpu="0",UUID="GPU-aaaa",device="nvidia0",modelName="NVIDIA A10G",Hostname="node-1"} 500
DCGM_FI_DEV_POWER_USAGE{gpu="0",UUID="GPU-aaaa",device="nvidia0",modelName="NVIDIA A10G",Hostname="node-1"} 85.5
DCGM_FI_DEV_GPU_TEMP{gpu="0",UUID="GPU-aaaa",device="nvidia0",modelName="NVIDIA A10G",Hostname="node-1"} 48
"#;

    #[test]
    fn test_parse_exposition_selects_gpu() {
        let gpu0 = parse_exposition(EXPOSITION, 0);
        assert_eq!(gpu0.values.get(fields::GPU_UTIL), Some(&37.0));
        assert_eq!(gpu0.model_name.as_deref(), Some("NVIDIA A10G"));

        let gpu1 = parse_exposition(EXPOSITION, 1);
        assert_eq!(gpu1.values.get(fields::GPU_UTIL), Some(&91.0));
        assert!(gpu1.values.get(fields::FB_USED).is_none());

        assert!(parse_exposition(EXPOSITION, 7).values.is_empty());
    }

    #[test]
    fn test_field_set_to_sample() {
        let sample = parse_exposition(EXPOSITION, 0).to_sample(1.0).unwrap();
        assert_eq!(sample.gpu_util_pct, 37.0);
        assert_eq!(sample.mem_util_pct, 12.0);
        assert_eq!(sample.memory_used_mb, 2048.0);
        assert_eq!(sample.memory_total_mb, 2048.0 + 20480.0 + 500.0);
        assert_eq!(sample.power_w, 85.5);
        // The exporter's default field set carries no power limit.
        assert_eq!(sample.power_limit_w, 0.0);
        assert!(sample.within_bounds());
    }

    #[test]
    fn test_missing_utilization_is_an_error() {
        let result = parse_exposition(EXPOSITION, 1).to_sample(0.0);
        assert!(result.is_ok());

        let empty = DcgmFieldSet::default().to_sample(0.0);
        assert!(matches!(empty, Err(GpuError::GpuNotFound(_))));
    }

    #[test]
    fn test_parse_labels_with_escapes() {
        let labels = parse_labels(r#"gpu="0",modelName="Tesla \"T4\"",Hostname="a,b""#);
        assert_eq!(labels.get("gpu").map(String::as_str), Some("0"));
        assert_eq!(labels.get("modelName").map(String::as_str), Some("Tesla \"T4\""));
        assert_eq!(labels.get("Hostname").map(String::as_str), Some("a,b"));
    }

    #[test]
    fn test_sample_with_timestamp_suffix() {
        let line = r#"DCGM_FI_DEV_GPU_TEMP{gpu="0"} 51 1700000000000"#;
        let (name, labels, value) = split_sample(line).unwrap();
        assert_eq!(name, "DCGM_FI_DEV_GPU_TEMP");
        assert_eq!(labels.len(), 1);
        assert_eq!(value, 51.0);
    }

    #[tokio::test]
    async fn test_probe_unreachable_endpoint() {
        let result = DcgmSource::probe("http://127.0.0.1:9/metrics", 0, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(GpuError::Unavailable(_))));
    }
}
